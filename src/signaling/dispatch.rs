//! Inbound dispatch table
//!
//! One table per manager maps an event name to the decoder for its payload.

use std::collections::HashMap;

use serde_json::Value;

use super::messages::{
    events, AnswerIn, CallRequestIn, CandidateIn, Envelope, InboundSignal, PeerRefIn,
};
use super::SignalingError;

type Decoder = fn(Value) -> Result<InboundSignal, serde_json::Error>;

/// Decodes inbound envelopes into typed signals
pub struct Dispatcher {
    table: HashMap<&'static str, Decoder>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let mut table: HashMap<&'static str, Decoder> = HashMap::new();
        table.insert(events::CALL_REQUEST, decode_call_request);
        table.insert(events::CALL_ANSWERED, decode_call_answered);
        table.insert(events::CALL_DECLINED, decode_call_declined);
        table.insert(events::CALL_ENDED, decode_call_ended);
        table.insert(events::ICE_CANDIDATE, decode_ice_candidate);
        Self { table }
    }

    pub fn handles(&self, event: &str) -> bool {
        self.table.contains_key(event)
    }

    pub fn decode(&self, envelope: Envelope) -> Result<InboundSignal, SignalingError> {
        let decoder = self
            .table
            .get(envelope.event.as_str())
            .ok_or_else(|| SignalingError::UnknownEvent(envelope.event.clone()))?;

        decoder(envelope.data).map_err(|e| SignalingError::Malformed {
            event: envelope.event,
            reason: e.to_string(),
        })
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_call_request(data: Value) -> Result<InboundSignal, serde_json::Error> {
    let payload: CallRequestIn = serde_json::from_value(data)?;
    Ok(InboundSignal::CallRequest {
        from: payload.from,
        name: payload.name,
        offer: payload.signal_data,
        kind: payload.call_type,
    })
}

fn decode_call_answered(data: Value) -> Result<InboundSignal, serde_json::Error> {
    let payload: AnswerIn = serde_json::from_value(data)?;
    Ok(InboundSignal::CallAnswered {
        answer: payload.into_description(),
    })
}

fn peer_ref(data: Value) -> Result<PeerRefIn, serde_json::Error> {
    if data.is_null() {
        return Ok(PeerRefIn::default());
    }
    serde_json::from_value(data)
}

fn decode_call_declined(data: Value) -> Result<InboundSignal, serde_json::Error> {
    Ok(InboundSignal::CallDeclined {
        from: peer_ref(data)?.from,
    })
}

fn decode_call_ended(data: Value) -> Result<InboundSignal, serde_json::Error> {
    Ok(InboundSignal::CallEnded {
        from: peer_ref(data)?.from,
    })
}

fn decode_ice_candidate(data: Value) -> Result<InboundSignal, serde_json::Error> {
    let (from, candidate) = serde_json::from_value::<CandidateIn>(data)?.into_parts();
    Ok(InboundSignal::IceCandidate { from, candidate })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CallKind;
    use crate::signaling::messages::SessionDescription;
    use serde_json::json;

    #[test]
    fn test_every_event_is_registered() {
        let dispatcher = Dispatcher::new();
        for event in events::ALL {
            assert!(dispatcher.handles(event), "{event} missing from table");
        }
        assert!(!dispatcher.handles("typing"));
    }

    #[test]
    fn test_decode_call_request_with_signal_alias() {
        let dispatcher = Dispatcher::new();
        let signal = dispatcher
            .decode(Envelope::new(
                "call-request",
                json!({
                    "from": "u1",
                    "name": "Alice",
                    "signal": { "type": "offer", "sdp": "v=0" },
                    "callType": "video"
                }),
            ))
            .unwrap();

        assert_eq!(
            signal,
            InboundSignal::CallRequest {
                from: "u1".to_string(),
                name: "Alice".to_string(),
                offer: SessionDescription::offer("v=0"),
                kind: CallKind::Video,
            }
        );
    }

    #[test]
    fn test_decode_call_request_with_signal_data() {
        let dispatcher = Dispatcher::new();
        let signal = dispatcher
            .decode(Envelope::new(
                "call-request",
                json!({
                    "userToCall": "u2",
                    "signalData": { "type": "offer", "sdp": "v=0" },
                    "from": "u1",
                    "name": "Alice",
                    "callType": "voice"
                }),
            ))
            .unwrap();
        assert_eq!(signal.from(), Some("u1"));
        assert_eq!(signal.event(), "call-request");
    }

    #[test]
    fn test_decode_ended_with_null_payload() {
        let dispatcher = Dispatcher::new();
        let signal = dispatcher.decode(Envelope::new("call-ended", Value::Null)).unwrap();
        assert_eq!(signal, InboundSignal::CallEnded { from: None });

        let signal = dispatcher
            .decode(Envelope::new("call-declined", json!({ "to": "u2", "from": "u1" })))
            .unwrap();
        assert_eq!(signal, InboundSignal::CallDeclined { from: Some("u1".to_string()) });
    }

    #[test]
    fn test_unknown_and_malformed_events() {
        let dispatcher = Dispatcher::new();
        let err = dispatcher.decode(Envelope::new("presence", json!({}))).unwrap_err();
        assert!(matches!(err, SignalingError::UnknownEvent(ref e) if e == "presence"));

        let err = dispatcher
            .decode(Envelope::new("call-request", json!({ "from": "u1" })))
            .unwrap_err();
        assert!(matches!(err, SignalingError::Malformed { .. }));
    }
}
