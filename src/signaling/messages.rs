//! Signaling wire messages
//!
//! Field names match what browser peers and the coordination server put on the
//! wire, so these types serialize to the exact JSON the other side expects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::CallKind;

/// Event names carried in [`Envelope::event`]
pub mod events {
    pub const CALL_REQUEST: &str = "call-request";
    pub const CALL_ANSWERED: &str = "call-answered";
    pub const CALL_DECLINED: &str = "call-declined";
    pub const CALL_ENDED: &str = "call-ended";
    pub const ICE_CANDIDATE: &str = "ice-candidate";

    pub const ALL: [&str; 5] = [CALL_REQUEST, CALL_ANSWERED, CALL_DECLINED, CALL_ENDED, ICE_CANDIDATE];
}

/// A named event with a JSON payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// SDP type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description in `RTCSessionDescriptionInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate in `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Signals the call manager sends to its peer
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundSignal {
    CallRequest {
        to: String,
        offer: SessionDescription,
        from: String,
        from_name: String,
        kind: CallKind,
    },
    CallAnswered {
        to: String,
        answer: SessionDescription,
    },
    CallDeclined {
        to: String,
    },
    CallEnded {
        to: String,
    },
    IceCandidate {
        to: String,
        candidate: IceCandidate,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CallRequestOut<'a> {
    user_to_call: &'a str,
    signal_data: &'a SessionDescription,
    from: &'a str,
    name: &'a str,
    call_type: CallKind,
}

#[derive(Serialize)]
struct AnswerOut<'a> {
    to: &'a str,
    signal: &'a SessionDescription,
}

#[derive(Serialize)]
struct ToOut<'a> {
    to: &'a str,
}

#[derive(Serialize)]
struct CandidateOut<'a> {
    to: &'a str,
    candidate: &'a IceCandidate,
}

impl OutboundSignal {
    pub fn event(&self) -> &'static str {
        match self {
            OutboundSignal::CallRequest { .. } => events::CALL_REQUEST,
            OutboundSignal::CallAnswered { .. } => events::CALL_ANSWERED,
            OutboundSignal::CallDeclined { .. } => events::CALL_DECLINED,
            OutboundSignal::CallEnded { .. } => events::CALL_ENDED,
            OutboundSignal::IceCandidate { .. } => events::ICE_CANDIDATE,
        }
    }

    /// Recipient user id
    pub fn to(&self) -> &str {
        match self {
            OutboundSignal::CallRequest { to, .. }
            | OutboundSignal::CallAnswered { to, .. }
            | OutboundSignal::CallDeclined { to }
            | OutboundSignal::CallEnded { to }
            | OutboundSignal::IceCandidate { to, .. } => to,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        let data = match self {
            OutboundSignal::CallRequest {
                to,
                offer,
                from,
                from_name,
                kind,
            } => serde_json::to_value(CallRequestOut {
                user_to_call: to,
                signal_data: offer,
                from,
                name: from_name,
                call_type: *kind,
            })?,
            OutboundSignal::CallAnswered { to, answer } => {
                serde_json::to_value(AnswerOut { to, signal: answer })?
            }
            OutboundSignal::CallDeclined { to } | OutboundSignal::CallEnded { to } => {
                serde_json::to_value(ToOut { to })?
            }
            OutboundSignal::IceCandidate { to, candidate } => {
                serde_json::to_value(CandidateOut { to, candidate })?
            }
        };
        Ok(Envelope::new(self.event(), data))
    }
}

/// Signals addressed to us, decoded from the wire
#[derive(Debug, Clone, PartialEq)]
pub enum InboundSignal {
    CallRequest {
        from: String,
        name: String,
        offer: SessionDescription,
        kind: CallKind,
    },
    CallAnswered {
        answer: SessionDescription,
    },
    CallDeclined {
        from: Option<String>,
    },
    CallEnded {
        from: Option<String>,
    },
    IceCandidate {
        from: Option<String>,
        candidate: IceCandidate,
    },
}

impl InboundSignal {
    pub fn event(&self) -> &'static str {
        match self {
            InboundSignal::CallRequest { .. } => events::CALL_REQUEST,
            InboundSignal::CallAnswered { .. } => events::CALL_ANSWERED,
            InboundSignal::CallDeclined { .. } => events::CALL_DECLINED,
            InboundSignal::CallEnded { .. } => events::CALL_ENDED,
            InboundSignal::IceCandidate { .. } => events::ICE_CANDIDATE,
        }
    }

    /// Sender, when the payload names one
    pub fn from(&self) -> Option<&str> {
        match self {
            InboundSignal::CallRequest { from, .. } => Some(from),
            InboundSignal::CallAnswered { .. } => None,
            InboundSignal::CallDeclined { from }
            | InboundSignal::CallEnded { from }
            | InboundSignal::IceCandidate { from, .. } => from.as_deref(),
        }
    }
}

// Inbound payload shapes. Relays differ in how much routing data they keep,
// so the decoders accept both the wrapped and the bare forms.

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CallRequestIn {
    pub from: String,
    #[serde(default)]
    pub name: String,
    #[serde(alias = "signal")]
    pub signal_data: SessionDescription,
    #[serde(default)]
    pub call_type: CallKind,
}

#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum AnswerIn {
    Wrapped { signal: SessionDescription },
    Bare(SessionDescription),
}

impl AnswerIn {
    pub fn into_description(self) -> SessionDescription {
        match self {
            AnswerIn::Wrapped { signal } => signal,
            AnswerIn::Bare(description) => description,
        }
    }
}

#[derive(Deserialize, Default)]
pub(crate) struct PeerRefIn {
    #[serde(default)]
    pub from: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum CandidateIn {
    Wrapped {
        candidate: IceCandidate,
        #[serde(default)]
        from: Option<String>,
    },
    Bare(IceCandidate),
}

impl CandidateIn {
    pub fn into_parts(self) -> (Option<String>, IceCandidate) {
        match self {
            CandidateIn::Wrapped { candidate, from } => (from, candidate),
            CandidateIn::Bare(candidate) => (None, candidate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_request_payload_fields() {
        let signal = OutboundSignal::CallRequest {
            to: "u2".to_string(),
            offer: SessionDescription::offer("v=0"),
            from: "u1".to_string(),
            from_name: "Alice".to_string(),
            kind: CallKind::Voice,
        };

        let envelope = signal.to_envelope().unwrap();
        assert_eq!(envelope.event, "call-request");
        assert_eq!(
            envelope.data,
            json!({
                "userToCall": "u2",
                "signalData": { "type": "offer", "sdp": "v=0" },
                "from": "u1",
                "name": "Alice",
                "callType": "voice"
            })
        );
    }

    #[test]
    fn test_answer_and_candidate_payloads() {
        let answered = OutboundSignal::CallAnswered {
            to: "u1".to_string(),
            answer: SessionDescription::answer("v=0"),
        }
        .to_envelope()
        .unwrap();
        assert_eq!(answered.data, json!({ "to": "u1", "signal": { "type": "answer", "sdp": "v=0" } }));

        let mut candidate = IceCandidate::new("candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host");
        candidate.sdp_mid = Some("0".to_string());
        candidate.sdp_mline_index = Some(0);
        let ice = OutboundSignal::IceCandidate {
            to: "u1".to_string(),
            candidate,
        }
        .to_envelope()
        .unwrap();
        assert_eq!(ice.event, "ice-candidate");
        assert_eq!(ice.data["to"], "u1");
        assert_eq!(ice.data["candidate"]["sdpMid"], "0");
        assert_eq!(ice.data["candidate"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_declined_and_ended_payloads() {
        let declined = OutboundSignal::CallDeclined { to: "u9".to_string() };
        assert_eq!(declined.to_envelope().unwrap().data, json!({ "to": "u9" }));
        assert_eq!(declined.to(), "u9");

        let ended = OutboundSignal::CallEnded { to: "u9".to_string() };
        assert_eq!(ended.event(), "call-ended");
    }

    #[test]
    fn test_inbound_answer_accepts_both_shapes() {
        let bare: AnswerIn = serde_json::from_value(json!({ "type": "answer", "sdp": "x" })).unwrap();
        assert_eq!(bare.into_description(), SessionDescription::answer("x"));

        let wrapped: AnswerIn =
            serde_json::from_value(json!({ "to": "u1", "signal": { "type": "answer", "sdp": "y" } })).unwrap();
        assert_eq!(wrapped.into_description(), SessionDescription::answer("y"));
    }

    #[test]
    fn test_inbound_candidate_accepts_both_shapes() {
        let wrapped: CandidateIn = serde_json::from_value(json!({
            "from": "u1",
            "candidate": { "candidate": "candidate:a", "sdpMid": "0", "sdpMLineIndex": 0 }
        }))
        .unwrap();
        let (from, candidate) = wrapped.into_parts();
        assert_eq!(from.as_deref(), Some("u1"));
        assert_eq!(candidate.candidate, "candidate:a");

        let bare: CandidateIn = serde_json::from_value(json!({ "candidate": "candidate:b" })).unwrap();
        let (from, candidate) = bare.into_parts();
        assert!(from.is_none());
        assert_eq!(candidate.candidate, "candidate:b");
    }
}
