//! Local capture devices
//!
//! The call manager acquires one [`LocalStream`] per attempt and releases it
//! exactly once when the attempt ends. Mute and video-off flip a track's
//! enabled flag; the track stays attached to the peer transport.

pub mod device;
pub mod stream;

pub use device::{DeviceProfile, VirtualDevices};
pub use stream::{LocalStream, LocalTrack, RemoteStream, RemoteTrack, TrackKind};

use async_trait::async_trait;
use thiserror::Error;

use crate::call::CallErrorKind;
use crate::models::CallKind;

/// Device acquisition errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Capture permission denied")]
    PermissionDenied,

    #[error("No {0} found")]
    NotFound(String),

    #[error("Capture device is already in use")]
    Busy,

    #[error("Device error: {0}")]
    Unknown(String),

    #[error("Capture error: {0}")]
    Capture(String),
}

impl DeviceError {
    pub fn kind(&self) -> CallErrorKind {
        match self {
            DeviceError::PermissionDenied => CallErrorKind::PermissionDenied,
            DeviceError::NotFound(_) => CallErrorKind::DeviceNotFound,
            DeviceError::Busy => CallErrorKind::DeviceBusy,
            DeviceError::Unknown(_) | DeviceError::Capture(_) => CallErrorKind::DeviceError,
        }
    }
}

/// Source of local capture streams
#[async_trait]
pub trait MediaDeviceSource: Send + Sync {
    /// Open microphone (and camera for video calls)
    async fn acquire(&self, kind: CallKind) -> Result<LocalStream, DeviceError>;

    /// Stop the stream's tracks and free the devices. Safe to call more than once.
    fn release(&self, stream: &LocalStream);

    /// Enable or disable the stream's track of `kind` without detaching it
    fn set_track_enabled(&self, stream: &LocalStream, kind: TrackKind, enabled: bool) -> bool {
        stream.set_track_enabled(kind, enabled)
    }
}

/// Track kinds a call of `kind` captures
pub fn tracks_for(kind: CallKind) -> &'static [TrackKind] {
    match kind {
        CallKind::Voice => &[TrackKind::Audio],
        CallKind::Video => &[TrackKind::Audio, TrackKind::Video],
    }
}
