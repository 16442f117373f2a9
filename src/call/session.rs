//! Call session
//!
//! Everything the manager knows about the one call in flight. Owned by the
//! manager task; nothing here is shared.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::candidates::{CandidatePump, CandidateQueue};
use super::timers::Timer;
use super::CallErrorKind;
use crate::media::{LocalStream, RemoteStream};
use crate::models::{CallKind, CallRole, CallState, PeerInfo};
use crate::signaling::SessionDescription;
use crate::state::CallSnapshot;
use crate::transport::{PeerTransport, TransportState};

/// Async step the session is waiting on. Completions for anything else are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingOp {
    /// Acquiring media and building the offer or answer
    Prepare,
    /// Applying the callee's answer
    ApplyAnswer,
}

/// One call attempt
pub(crate) struct CallSession {
    /// Identity of this attempt; stale completions carry an older id
    pub call_id: Uuid,
    /// The other party
    pub peer: PeerInfo,
    /// Voice or video
    pub kind: CallKind,
    /// Whether we placed the call or received it
    pub role: CallRole,
    /// Current lifecycle state
    pub state: CallState,
    /// Our captured media, once acquired
    pub local_stream: Option<LocalStream>,
    /// Media received from the peer
    pub remote_stream: Option<RemoteStream>,
    /// Local audio track disabled
    pub muted: bool,
    /// Local video track disabled
    pub video_off: bool,
    /// Whole seconds spent Active
    pub duration_seconds: u64,
    /// Start and accept attempts made for this call
    pub attempt_count: u32,
    /// Failure that ended the attempt
    pub last_error: Option<CallErrorKind>,
    /// When the session was created
    pub started_at: DateTime<Utc>,
    /// When media connected
    pub connected_at: Option<DateTime<Utc>>,
    /// Caller's offer, held while ringing
    pub remote_offer: Option<SessionDescription>,
    /// Peer connection for this attempt
    pub transport: Option<Arc<dyn PeerTransport>>,
    /// Last connection state the transport reported
    pub transport_state: Option<TransportState>,
    /// Async step in flight, if any
    pub pending: Option<PendingOp>,
    /// call-request or call-answered went out
    pub signaled: bool,
    /// Transport connected or delivered media before Negotiating
    pub media_ready: bool,
    /// Our candidates, held until the peer has heard from us
    pub local_candidates: CandidateQueue,
    /// Peer candidates, held until the remote description is applied
    pub remote_candidates: CandidateQueue,
    /// Applies remote candidates in arrival order
    pub pump: Option<CandidatePump>,
    /// Parent token of every task the session owns
    pub cancel: CancellationToken,
    /// Bounds OutgoingRinging and an accept in progress
    pub ringing_timer: Option<Timer>,
    /// Bounds Negotiating
    pub negotiation_timer: Option<Timer>,
    /// Drives `duration_seconds` while Active
    pub duration_timer: Option<Timer>,
    /// Running while a disconnected transport may still recover
    pub grace_timer: Option<Timer>,
}

impl CallSession {
    fn new(peer: PeerInfo, kind: CallKind, role: CallRole) -> Self {
        Self {
            call_id: Uuid::new_v4(),
            peer,
            kind,
            role,
            state: CallState::Idle,
            local_stream: None,
            remote_stream: None,
            muted: false,
            video_off: false,
            duration_seconds: 0,
            attempt_count: 0,
            last_error: None,
            started_at: Utc::now(),
            connected_at: None,
            remote_offer: None,
            transport: None,
            transport_state: None,
            pending: None,
            signaled: false,
            media_ready: false,
            local_candidates: CandidateQueue::new(),
            remote_candidates: CandidateQueue::new(),
            pump: None,
            cancel: CancellationToken::new(),
            ringing_timer: None,
            negotiation_timer: None,
            duration_timer: None,
            grace_timer: None,
        }
    }

    /// Create a session for a call we place
    pub fn outgoing(peer: PeerInfo, kind: CallKind) -> Self {
        Self::new(peer, kind, CallRole::Caller)
    }

    /// Create a session for a call-request we received
    pub fn incoming(peer: PeerInfo, kind: CallKind, offer: SessionDescription) -> Self {
        let mut session = Self::new(peer, kind, CallRole::Callee);
        session.remote_offer = Some(offer);
        session
    }

    pub fn is_current(&self, call_id: Uuid) -> bool {
        self.call_id == call_id
    }

    /// Inbound signals without a sender are trusted to be about this call
    pub fn is_from_peer(&self, from: Option<&str>) -> bool {
        from.map_or(true, |from| from == self.peer.peer_id)
    }

    pub fn is_connecting_or_active(&self) -> bool {
        matches!(self.state, CallState::Negotiating | CallState::Active)
    }

    /// Seconds since media connected, or since the attempt started
    pub fn elapsed(&self) -> u64 {
        let start = self.connected_at.unwrap_or(self.started_at);
        (Utc::now() - start).num_seconds().max(0) as u64
    }

    pub fn cancel_timers(&mut self) {
        for timer in [
            self.ringing_timer.take(),
            self.negotiation_timer.take(),
            self.duration_timer.take(),
            self.grace_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.cancel();
        }
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: Some(self.call_id),
            state: self.state,
            peer: Some(self.peer.clone()),
            kind: Some(self.kind),
            role: Some(self.role),
            duration_seconds: self.duration_seconds,
            muted: self.muted,
            video_off: self.video_off,
            last_error: self.last_error,
            local_stream: self.local_stream.clone(),
            remote_stream: self.remote_stream.clone(),
            attempt_count: self.attempt_count,
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("call_id", &self.call_id)
            .field("peer", &self.peer)
            .field("kind", &self.kind)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("pending", &self.pending)
            .field("signaled", &self.signaled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incoming_session_holds_offer() {
        let session = CallSession::incoming(
            PeerInfo::new("u1", "Alice"),
            CallKind::Video,
            SessionDescription::offer("v=0"),
        );
        assert_eq!(session.role, CallRole::Callee);
        assert_eq!(session.state, CallState::Idle);
        assert!(session.remote_offer.is_some());
        assert!(session.is_from_peer(Some("u1")));
        assert!(session.is_from_peer(None));
        assert!(!session.is_from_peer(Some("u9")));
    }

    #[test]
    fn test_sessions_get_distinct_ids() {
        let a = CallSession::outgoing(PeerInfo::new("u2", "Bob"), CallKind::Voice);
        let b = CallSession::outgoing(PeerInfo::new("u2", "Bob"), CallKind::Voice);
        assert_ne!(a.call_id, b.call_id);
        assert!(a.is_current(a.call_id));
        assert!(!a.is_current(b.call_id));
    }

    #[test]
    fn test_snapshot_mirrors_session() {
        let mut session = CallSession::outgoing(PeerInfo::new("u2", "Bob"), CallKind::Voice);
        session.state = CallState::OutgoingRinging;
        session.attempt_count = 2;
        let snapshot = session.snapshot();
        assert_eq!(snapshot.state, CallState::OutgoingRinging);
        assert_eq!(snapshot.role, Some(CallRole::Caller));
        assert_eq!(snapshot.attempt_count, 2);
        assert_eq!(snapshot.peer.map(|p| p.peer_id), Some("u2".to_string()));
    }
}
