use serde::{Deserialize, Serialize};

/// Media kind of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    #[default]
    Voice,
    Video,
}

impl CallKind {
    pub fn has_video(&self) -> bool {
        matches!(self, CallKind::Video)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Voice => "voice",
            CallKind::Video => "video",
        }
    }
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the call we are
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    /// We placed the call
    Caller,
    /// We received the call
    Callee,
}

/// Call lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    /// No call
    #[default]
    Idle,
    /// We sent (or are preparing) a call request and wait for the answer
    OutgoingRinging,
    /// A call request arrived and waits for accept/decline
    IncomingRinging,
    /// Offer/answer exchanged, waiting for media connectivity
    Negotiating,
    /// Media is flowing
    Active,
    /// The attempt is over
    Ended,
}

impl CallState {
    pub fn display_name(&self) -> &str {
        match self {
            CallState::Idle => "Idle",
            CallState::OutgoingRinging => "Calling...",
            CallState::IncomingRinging => "Incoming call",
            CallState::Negotiating => "Connecting...",
            CallState::Active => "Connected",
            CallState::Ended => "Call Ended",
        }
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, CallState::OutgoingRinging | CallState::IncomingRinging)
    }

    /// Any state that holds a live session
    pub fn is_in_call(&self) -> bool {
        !matches!(self, CallState::Idle | CallState::Ended)
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// Every live state may fall to `Ended`; `Ended` only leaves through `Idle`.
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Idle, OutgoingRinging | IncomingRinging) => true,
            (OutgoingRinging | IncomingRinging, Negotiating) => true,
            (Negotiating, Active) => true,
            (OutgoingRinging | IncomingRinging | Negotiating | Active, Ended) => true,
            (Ended, Idle) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallState::Idle => write!(f, "Idle"),
            CallState::OutgoingRinging => write!(f, "OutgoingRinging"),
            CallState::IncomingRinging => write!(f, "IncomingRinging"),
            CallState::Negotiating => write!(f, "Negotiating"),
            CallState::Active => write!(f, "Active"),
            CallState::Ended => write!(f, "Ended"),
        }
    }
}

/// Identity of the remote party
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(rename = "peerId")]
    pub peer_id: String,
    #[serde(rename = "peerName")]
    pub peer_name: String,
}

impl PeerInfo {
    pub fn new(peer_id: impl Into<String>, peer_name: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            peer_name: peer_name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_kind_wire_names() {
        assert_eq!(serde_json::to_string(&CallKind::Voice).unwrap(), "\"voice\"");
        assert_eq!(serde_json::to_string(&CallKind::Video).unwrap(), "\"video\"");
        let kind: CallKind = serde_json::from_str("\"video\"").unwrap();
        assert!(kind.has_video());
    }

    #[test]
    fn test_ended_only_leaves_through_idle() {
        use CallState::*;
        for next in [OutgoingRinging, IncomingRinging, Negotiating, Active, Ended] {
            assert!(!Ended.can_transition_to(next), "Ended -> {next} must be rejected");
        }
        assert!(Ended.can_transition_to(Idle));
    }

    #[test]
    fn test_transition_table() {
        use CallState::*;
        assert!(Idle.can_transition_to(OutgoingRinging));
        assert!(Idle.can_transition_to(IncomingRinging));
        assert!(!Idle.can_transition_to(Active));
        assert!(!Idle.can_transition_to(Ended));
        assert!(OutgoingRinging.can_transition_to(Negotiating));
        assert!(IncomingRinging.can_transition_to(Negotiating));
        assert!(!OutgoingRinging.can_transition_to(Active));
        assert!(Negotiating.can_transition_to(Active));
        assert!(Active.can_transition_to(Ended));
        assert!(!Active.can_transition_to(Negotiating));
    }

    #[test]
    fn test_in_call_states() {
        assert!(!CallState::Idle.is_in_call());
        assert!(!CallState::Ended.is_in_call());
        assert!(CallState::Negotiating.is_in_call());
        assert!(CallState::IncomingRinging.is_ringing());
    }
}
