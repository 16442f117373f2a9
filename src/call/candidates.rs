//! Candidate ordering
//!
//! Remote candidates must not reach the transport before the remote
//! description is applied; local candidates must not reach the peer before
//! our offer/answer does. Both directions hold candidates in a
//! [`CandidateQueue`] until the gate opens.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::signaling::IceCandidate;
use crate::transport::PeerTransport;

/// FIFO that holds candidates until opened, then lets them straight through
#[derive(Debug, Default)]
pub(crate) struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    open: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the candidate back when it may be delivered now
    pub fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.open {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    /// Open the gate and hand back everything held, oldest first
    pub fn open(&mut self) -> Vec<IceCandidate> {
        self.open = true;
        self.pending.drain(..).collect()
    }
}

/// Applies remote candidates to one transport strictly in arrival order
pub(crate) struct CandidatePump {
    tx: mpsc::UnboundedSender<IceCandidate>,
}

impl CandidatePump {
    pub fn start(call_id: Uuid, transport: Arc<dyn PeerTransport>, cancel: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<IceCandidate>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(candidate) => {
                            if let Err(e) = transport.add_ice_candidate(candidate).await {
                                tracing::warn!("Call {} - error adding ICE candidate: {}", call_id, e);
                            }
                        }
                        None => break,
                    },
                }
            }
            tracing::debug!("Call {} - candidate pump stopped", call_id);
        });

        Self { tx }
    }

    pub fn push(&self, candidate: IceCandidate) {
        // Only fails once the pump was cancelled with its session
        let _ = self.tx.send(candidate);
    }
}
