//! PeerCall - one-to-one call signaling and session lifecycle
//!
//! Drives a single voice or video call between two peers: acquiring local
//! media, negotiating a peer connection over an external signaling channel,
//! tracking call state and tearing everything down on every exit path.

pub mod call;
pub mod media;
pub mod models;
pub mod signaling;
pub mod state;
pub mod transport;
