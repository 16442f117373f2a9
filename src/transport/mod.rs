//! Peer transport seam
//!
//! One [`PeerTransport`] per call attempt negotiates and carries the media.
//! Transports never touch call state; they report what happened through
//! [`TransportEvents`] and the call manager decides what it means.

pub mod peer_connection;

pub use peer_connection::{WebRtcTransport, WebRtcTransportFactory};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::call::CallErrorKind;
use crate::media::{LocalTrack, RemoteTrack};
use crate::signaling::{IceCandidate, SessionDescription};

/// Transport errors
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Failed to create peer connection: {0}")]
    CreateFailed(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Candidate rejected: {0}")]
    Candidate(String),

    #[error("Track error: {0}")]
    Track(String),

    #[error("Transport is closed")]
    Closed,
}

impl TransportError {
    pub fn kind(&self) -> CallErrorKind {
        match self {
            TransportError::Candidate(_) => CallErrorKind::IceFailure,
            _ => CallErrorKind::NegotiationFailed,
        }
    }
}

/// STUN/TURN endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// Connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Facts a transport reports about itself
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local candidate to forward to the peer
    LocalCandidate(IceCandidate),
    /// Incoming media
    RemoteTrack(RemoteTrack),
    ConnectionState(TransportState),
    /// ICE gave up on every candidate pair
    IceFailed,
}

/// Event sink stamped with the attempt it belongs to
#[derive(Clone)]
pub struct TransportEvents {
    call_id: Uuid,
    tx: mpsc::UnboundedSender<(Uuid, TransportEvent)>,
}

impl TransportEvents {
    pub fn new(call_id: Uuid, tx: mpsc::UnboundedSender<(Uuid, TransportEvent)>) -> Self {
        Self { call_id, tx }
    }

    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    /// Never blocks; events for a manager that is gone are dropped.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send((self.call_id, event));
    }
}

/// One peer connection for one call attempt
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an offer and apply it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Create an answer to the applied remote offer and apply it locally
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn attach_local_track(&self, track: &LocalTrack) -> Result<(), TransportError>;

    /// Release all native resources. Idempotent.
    async fn close(&self);
}

/// Creates one transport per call attempt
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
