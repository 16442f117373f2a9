//! In-process coordination server
//!
//! Routes named events between connected users the way the chat server relays
//! call events: the routing field (`userToCall` / `to`) is stripped and the
//! sender's id is stamped as `from` before delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};

use super::messages::{events, Envelope};
use super::{SignalingChannel, SignalingError};

/// Per-user inbound queue depth
const INBOX_CAPACITY: usize = 100;

/// Shared relay for all users of one process
#[derive(Clone, Default)]
pub struct SignalingHub {
    users: Arc<RwLock<HashMap<String, mpsc::Sender<Envelope>>>>,
}

impl SignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `user_id` and return its outbound handle plus inbound queue.
    ///
    /// A second connect for the same user replaces the first one; the old
    /// receiver sees its channel close.
    pub async fn connect(&self, user_id: &str) -> (HubConnection, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.users.write().await.insert(user_id.to_string(), tx);
        tracing::debug!("Signaling hub: {} connected", user_id);

        let connection = HubConnection {
            user_id: user_id.to_string(),
            hub: self.clone(),
            connected: Arc::new(AtomicBool::new(true)),
        };
        (connection, rx)
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.users.read().await.contains_key(user_id)
    }

    async fn remove(&self, user_id: &str) {
        self.users.write().await.remove(user_id);
    }

    async fn deliver(&self, to: &str, envelope: Envelope) {
        let sender = self.users.read().await.get(to).cloned();
        match sender {
            Some(tx) => {
                if tx.send(envelope).await.is_err() {
                    tracing::debug!("Signaling hub: {} went away, dropping message", to);
                    self.remove(to).await;
                }
            }
            None => {
                tracing::debug!("Signaling hub: {} is offline, dropping {}", to, envelope.event);
            }
        }
    }

    /// Rewrite an outbound frame into what the recipient receives
    fn relay(from: &str, envelope: &Envelope) -> Result<(String, Envelope), SignalingError> {
        let data = &envelope.data;
        let target = |field: &str| -> Result<String, SignalingError> {
            data.get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| SignalingError::SendFailed(format!("{} without `{}`", envelope.event, field)))
        };

        let routed = match envelope.event.as_str() {
            events::CALL_REQUEST => {
                let to = target("userToCall")?;
                let payload = json!({
                    "from": data.get("from").cloned().unwrap_or_else(|| json!(from)),
                    "name": data.get("name").cloned().unwrap_or(Value::Null),
                    "signal": data.get("signalData").cloned().unwrap_or(Value::Null),
                    "callType": data.get("callType").cloned().unwrap_or_else(|| json!("voice")),
                });
                (to, payload)
            }
            events::CALL_ANSWERED => {
                let to = target("to")?;
                (to, data.get("signal").cloned().unwrap_or(Value::Null))
            }
            events::CALL_DECLINED | events::CALL_ENDED => (target("to")?, json!({ "from": from })),
            events::ICE_CANDIDATE => {
                let to = target("to")?;
                let candidate = data.get("candidate").cloned().unwrap_or(Value::Null);
                (to, json!({ "from": from, "candidate": candidate }))
            }
            _ => (target("to")?, data.clone()),
        };

        Ok((routed.0, Envelope::new(envelope.event.clone(), routed.1)))
    }
}

/// One user's connection to the hub
#[derive(Clone)]
pub struct HubConnection {
    user_id: String,
    hub: SignalingHub,
    connected: Arc<AtomicBool>,
}

impl HubConnection {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Drop the link. Messages in flight to this user are lost.
    pub async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.hub.remove(&self.user_id).await;
            tracing::debug!("Signaling hub: {} disconnected", self.user_id);
        }
    }
}

#[async_trait]
impl SignalingChannel for HubConnection {
    async fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        let (to, routed) = SignalingHub::relay(&self.user_id, &envelope)?;
        self.hub.deliver(&to, routed).await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CallKind;
    use crate::signaling::messages::{IceCandidate, OutboundSignal, SessionDescription};
    use crate::signaling::{Dispatcher, InboundSignal};

    #[tokio::test]
    async fn test_call_request_is_relayed_with_sender() {
        let hub = SignalingHub::new();
        let (alice, _alice_rx) = hub.connect("u1").await;
        let (_bob, mut bob_rx) = hub.connect("u2").await;

        let request = OutboundSignal::CallRequest {
            to: "u2".to_string(),
            offer: SessionDescription::offer("v=0"),
            from: "u1".to_string(),
            from_name: "Alice".to_string(),
            kind: CallKind::Video,
        };
        alice.send(request.to_envelope().unwrap()).await.unwrap();

        let received = bob_rx.recv().await.unwrap();
        let decoded = Dispatcher::new().decode(received).unwrap();
        assert_eq!(
            decoded,
            InboundSignal::CallRequest {
                from: "u1".to_string(),
                name: "Alice".to_string(),
                offer: SessionDescription::offer("v=0"),
                kind: CallKind::Video,
            }
        );
    }

    #[tokio::test]
    async fn test_answer_is_delivered_bare() {
        let hub = SignalingHub::new();
        let (_alice, mut alice_rx) = hub.connect("u1").await;
        let (bob, _bob_rx) = hub.connect("u2").await;

        let answer = OutboundSignal::CallAnswered {
            to: "u1".to_string(),
            answer: SessionDescription::answer("v=1"),
        };
        bob.send(answer.to_envelope().unwrap()).await.unwrap();

        let received = alice_rx.recv().await.unwrap();
        assert_eq!(received.event, "call-answered");
        assert_eq!(received.data, json!({ "type": "answer", "sdp": "v=1" }));
    }

    #[tokio::test]
    async fn test_candidate_and_hangup_carry_from() {
        let hub = SignalingHub::new();
        let (_alice, mut alice_rx) = hub.connect("u1").await;
        let (bob, _bob_rx) = hub.connect("u2").await;

        let ice = OutboundSignal::IceCandidate {
            to: "u1".to_string(),
            candidate: IceCandidate::new("candidate:x"),
        };
        bob.send(ice.to_envelope().unwrap()).await.unwrap();
        let ended = OutboundSignal::CallEnded { to: "u1".to_string() };
        bob.send(ended.to_envelope().unwrap()).await.unwrap();

        let dispatcher = Dispatcher::new();
        let first = dispatcher.decode(alice_rx.recv().await.unwrap()).unwrap();
        assert_eq!(first.from(), Some("u2"));
        let second = dispatcher.decode(alice_rx.recv().await.unwrap()).unwrap();
        assert_eq!(second, InboundSignal::CallEnded { from: Some("u2".to_string()) });
    }

    #[tokio::test]
    async fn test_offline_recipient_is_dropped_silently() {
        let hub = SignalingHub::new();
        let (alice, _rx) = hub.connect("u1").await;
        let ended = OutboundSignal::CallEnded { to: "nobody".to_string() };
        assert!(alice.send(ended.to_envelope().unwrap()).await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_closes_both_directions() {
        let hub = SignalingHub::new();
        let (alice, mut alice_rx) = hub.connect("u1").await;
        assert!(hub.is_online("u1").await);

        alice.disconnect().await;
        alice.disconnect().await;

        assert!(!alice.is_connected());
        assert!(!hub.is_online("u1").await);
        assert!(alice_rx.recv().await.is_none());

        let ended = OutboundSignal::CallEnded { to: "u2".to_string() };
        let err = alice.send(ended.to_envelope().unwrap()).await.unwrap_err();
        assert!(matches!(err, SignalingError::NotConnected));
    }
}
