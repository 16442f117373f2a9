//! Signaling channel seam
//!
//! The call manager talks to its peer through a named-event channel supplied
//! by the environment. Outbound frames go through [`SignalingChannel::send`];
//! inbound frames arrive on an `mpsc::Receiver<Envelope>` handed to the
//! manager when it is spawned.

pub mod dispatch;
pub mod memory;
pub mod messages;

pub use dispatch::Dispatcher;
pub use memory::{HubConnection, SignalingHub};
pub use messages::{
    events, Envelope, IceCandidate, InboundSignal, OutboundSignal, SdpType, SessionDescription,
};

use async_trait::async_trait;
use thiserror::Error;

use crate::call::CallErrorKind;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Signaling channel is not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Malformed {event} payload: {reason}")]
    Malformed { event: String, reason: String },

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl SignalingError {
    pub fn kind(&self) -> CallErrorKind {
        CallErrorKind::SignalingUnavailable
    }
}

/// Outbound half of the coordination-server connection
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Deliver one named event. Delivery is best effort: a connected channel may
    /// still lose the frame if the link drops.
    async fn send(&self, envelope: Envelope) -> Result<(), SignalingError>;

    fn is_connected(&self) -> bool;
}
