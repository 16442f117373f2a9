//! Virtual capture devices
//!
//! Exclusive microphone/camera pair that hands out sample-fed tracks. The
//! application pushes encoded frames with [`LocalTrack::write_sample`].
//!
//! [`LocalTrack::write_sample`]: super::LocalTrack::write_sample

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{tracks_for, DeviceError, LocalStream, MediaDeviceSource};
use crate::models::CallKind;

/// Which devices exist and whether capture is allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub microphone: bool,
    pub camera: bool,
    pub permission_granted: bool,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            microphone: true,
            camera: true,
            permission_granted: true,
        }
    }
}

impl DeviceProfile {
    pub fn audio_only() -> Self {
        Self {
            camera: false,
            ..Self::default()
        }
    }
}

/// Device source backed by in-process sample tracks
pub struct VirtualDevices {
    profile: DeviceProfile,
    /// Id of the stream currently holding the devices
    holder: Mutex<Option<String>>,
}

impl VirtualDevices {
    pub fn new(profile: DeviceProfile) -> Self {
        Self {
            profile,
            holder: Mutex::new(None),
        }
    }

    pub fn profile(&self) -> DeviceProfile {
        self.profile
    }

    pub fn in_use(&self) -> bool {
        self.holder.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

impl Default for VirtualDevices {
    fn default() -> Self {
        Self::new(DeviceProfile::default())
    }
}

#[async_trait]
impl MediaDeviceSource for VirtualDevices {
    async fn acquire(&self, kind: CallKind) -> Result<LocalStream, DeviceError> {
        if !self.profile.permission_granted {
            return Err(DeviceError::PermissionDenied);
        }
        if !self.profile.microphone {
            return Err(DeviceError::NotFound("microphone".to_string()));
        }
        if kind.has_video() && !self.profile.camera {
            return Err(DeviceError::NotFound("camera".to_string()));
        }

        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        if holder.is_some() {
            return Err(DeviceError::Busy);
        }

        let stream = LocalStream::new(tracks_for(kind));
        *holder = Some(stream.id().to_string());
        tracing::debug!("Acquired {} capture stream {}", kind, stream.id());
        Ok(stream)
    }

    fn release(&self, stream: &LocalStream) {
        if stream.stop() {
            tracing::debug!("Released capture stream {}", stream.id());
        }

        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        if holder.as_deref() == Some(stream.id()) {
            *holder = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackKind;

    #[tokio::test]
    async fn test_voice_and_video_track_sets() {
        let devices = VirtualDevices::default();
        let voice = devices.acquire(CallKind::Voice).await.unwrap();
        assert_eq!(voice.tracks().len(), 1);
        devices.release(&voice);

        let video = devices.acquire(CallKind::Video).await.unwrap();
        assert!(video.track(TrackKind::Video).is_some());
        devices.release(&video);
    }

    #[tokio::test]
    async fn test_acquire_errors() {
        let denied = VirtualDevices::new(DeviceProfile {
            permission_granted: false,
            ..DeviceProfile::default()
        });
        assert_eq!(denied.acquire(CallKind::Voice).await.unwrap_err(), DeviceError::PermissionDenied);

        let no_camera = VirtualDevices::new(DeviceProfile::audio_only());
        let err = no_camera.acquire(CallKind::Video).await.unwrap_err();
        assert!(matches!(err, DeviceError::NotFound(ref d) if d == "camera"));
        assert!(no_camera.acquire(CallKind::Voice).await.is_ok());
    }

    #[tokio::test]
    async fn test_capture_is_exclusive_until_released() {
        let devices = VirtualDevices::default();
        let first = devices.acquire(CallKind::Voice).await.unwrap();
        assert!(devices.in_use());
        assert_eq!(devices.acquire(CallKind::Voice).await.unwrap_err(), DeviceError::Busy);

        devices.release(&first);
        devices.release(&first);
        assert!(!devices.in_use());
        assert!(first.is_released());

        let second = devices.acquire(CallKind::Voice).await.unwrap();
        // releasing a stale stream must not free the current holder
        devices.release(&first);
        assert!(devices.in_use());
        devices.release(&second);
    }

    #[test]
    fn test_error_kinds() {
        use crate::call::CallErrorKind;
        assert_eq!(DeviceError::Busy.kind(), CallErrorKind::DeviceBusy);
        assert_eq!(DeviceError::PermissionDenied.kind(), CallErrorKind::PermissionDenied);
        assert_eq!(DeviceError::NotFound("camera".into()).kind(), CallErrorKind::DeviceNotFound);
        assert_eq!(DeviceError::Unknown("x".into()).kind(), CallErrorKind::DeviceError);
    }
}
