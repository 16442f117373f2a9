use uuid::Uuid;

use crate::call::CallErrorKind;
use crate::media::{LocalStream, RemoteStream};
use crate::models::{CallKind, CallRole, CallState, PeerInfo};

/// Observable call state, published on every change
#[derive(Debug, Clone, Default)]
pub struct CallSnapshot {
    pub call_id: Option<Uuid>,
    pub state: CallState,
    pub peer: Option<PeerInfo>,
    pub kind: Option<CallKind>,
    pub role: Option<CallRole>,
    pub duration_seconds: u64,
    pub muted: bool,
    pub video_off: bool,
    pub last_error: Option<CallErrorKind>,
    pub local_stream: Option<LocalStream>,
    pub remote_stream: Option<RemoteStream>,
    pub attempt_count: u32,
}

impl CallSnapshot {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn is_in_call(&self) -> bool {
        self.state.is_in_call()
    }

    pub fn peer_name(&self) -> Option<&str> {
        self.peer.as_ref().map(|p| p.peer_name.as_str())
    }

    /// Duration as MM:SS
    pub fn formatted_duration(&self) -> String {
        format!("{:02}:{:02}", self.duration_seconds / 60, self.duration_seconds % 60)
    }

    /// One-line status for a call bar
    pub fn status_text(&self) -> String {
        let name = self.peer_name().unwrap_or("unknown");
        match self.state {
            CallState::Idle => "Ready".to_string(),
            CallState::OutgoingRinging => format!("Calling {}...", name),
            CallState::IncomingRinging => format!("Incoming call from {}", name),
            CallState::Negotiating => format!("Connecting to {}...", name),
            CallState::Active => format!("{} - {}", name, self.formatted_duration()),
            CallState::Ended => match self.last_error {
                Some(error) => error.to_string(),
                None => self.state.display_name().to_string(),
            },
        }
    }
}

/// Notifications that something happened, beyond the state itself
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Call state changed
    StateChanged { from: CallState, to: CallState },
    /// A peer is ringing us
    IncomingCall {
        peer_id: String,
        peer_name: String,
        kind: CallKind,
    },
    /// Call duration update (in seconds)
    DurationTick(u64),
    /// The call attempt failed
    Error(CallErrorKind),
    /// A remote track arrived
    RemoteMedia { stream_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatted_duration() {
        let mut snapshot = CallSnapshot::idle();
        assert_eq!(snapshot.formatted_duration(), "00:00");
        snapshot.duration_seconds = 65;
        assert_eq!(snapshot.formatted_duration(), "01:05");
        snapshot.duration_seconds = 3600;
        assert_eq!(snapshot.formatted_duration(), "60:00");
    }

    #[test]
    fn test_status_text() {
        let mut snapshot = CallSnapshot {
            state: CallState::OutgoingRinging,
            peer: Some(PeerInfo::new("u2", "Bob")),
            ..CallSnapshot::default()
        };
        assert_eq!(snapshot.status_text(), "Calling Bob...");
        assert!(snapshot.is_in_call());

        snapshot.state = CallState::Active;
        snapshot.duration_seconds = 9;
        assert_eq!(snapshot.status_text(), "Bob - 00:09");

        snapshot.state = CallState::Ended;
        snapshot.last_error = Some(CallErrorKind::NegotiationTimeout);
        assert_eq!(snapshot.status_text(), "Connection timeout. Please try again.");
        assert!(!snapshot.is_in_call());

        snapshot.last_error = None;
        assert_eq!(snapshot.status_text(), "Call Ended");
    }
}
