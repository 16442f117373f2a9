//! Local and remote media stream handles

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::DeviceError;

/// Track media type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

struct LocalTrackInner {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtp: Arc<TrackLocalStaticSample>,
}

/// A captured track. Clones share the same underlying track and flags.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<LocalTrackInner>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let id = format!("{}-{}", kind, Uuid::new_v4());
        let rtp = Arc::new(TrackLocalStaticSample::new(codec, id.clone(), stream_id.to_string()));

        Self {
            inner: Arc::new(LocalTrackInner {
                id,
                kind,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                rtp,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// The RTP-level track to attach to a peer connection
    pub fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.inner.rtp.clone()
    }

    /// Push one captured frame. Returns `false` when the frame was dropped
    /// because the track is disabled or stopped.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool, DeviceError> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(false);
        }
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.inner
            .rtp
            .write_sample(&sample)
            .await
            .map_err(|e| DeviceError::Capture(e.to_string()))?;
        Ok(true)
    }

    fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

struct LocalStreamInner {
    id: String,
    tracks: Vec<LocalTrack>,
    released: AtomicBool,
}

/// Ownership handle for captured media
#[derive(Clone)]
pub struct LocalStream {
    inner: Arc<LocalStreamInner>,
}

impl LocalStream {
    /// Build a stream with one track per kind
    pub fn new(kinds: &[TrackKind]) -> Self {
        let id = Uuid::new_v4().to_string();
        let tracks = kinds.iter().map(|kind| LocalTrack::new(*kind, &id)).collect();
        Self {
            inner: Arc::new(LocalStreamInner {
                id,
                tracks,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.inner.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.inner.tracks.iter().find(|t| t.kind() == kind)
    }

    /// Flip the enabled flag of the first track of `kind`. Returns `false`
    /// when the stream has no such track.
    pub fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        match self.track(kind) {
            Some(track) => {
                track.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Stop every track. Returns `true` only for the call that actually
    /// released the stream.
    pub(crate) fn stop(&self) -> bool {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        for track in &self.inner.tracks {
            track.stop();
        }
        true
    }
}

impl std::fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.inner.id)
            .field("tracks", &self.inner.tracks)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Incoming track reported by the transport
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    handle: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            handle: None,
        }
    }

    pub fn with_handle(mut self, handle: Arc<TrackRemote>) -> Self {
        self.handle = Some(handle);
        self
    }

    /// RTP reader for the UI's renderer
    pub fn handle(&self) -> Option<&Arc<TrackRemote>> {
        self.handle.as_ref()
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Incoming media of one call
#[derive(Clone, Debug)]
pub struct RemoteStream {
    id: String,
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn from_track(track: RemoteTrack) -> Self {
        Self {
            id: track.stream_id.clone(),
            tracks: vec![track],
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Video)
    }

    /// Add a later track of the same call. Duplicate ids are ignored.
    pub fn add_track(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_tracks_per_kind() {
        let stream = LocalStream::new(&[TrackKind::Audio, TrackKind::Video]);
        assert_eq!(stream.tracks().len(), 2);
        assert!(stream.track(TrackKind::Audio).is_some());
        assert!(stream.track(TrackKind::Video).is_some());

        let voice = LocalStream::new(&[TrackKind::Audio]);
        assert!(voice.track(TrackKind::Video).is_none());
        assert!(!voice.set_track_enabled(TrackKind::Video, false));
    }

    #[test]
    fn test_set_track_enabled_keeps_track() {
        let stream = LocalStream::new(&[TrackKind::Audio]);
        assert!(stream.set_track_enabled(TrackKind::Audio, false));
        let track = stream.track(TrackKind::Audio).unwrap();
        assert!(!track.is_enabled());
        assert!(!track.is_stopped());
        assert_eq!(stream.tracks().len(), 1);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let stream = LocalStream::new(&[TrackKind::Audio]);
        let clone = stream.clone();
        assert!(stream.stop());
        assert!(!clone.stop());
        assert!(clone.is_released());
        assert!(stream.track(TrackKind::Audio).unwrap().is_stopped());
        assert_eq!(stream.id(), clone.id());
    }

    #[tokio::test]
    async fn test_disabled_track_drops_samples() {
        let stream = LocalStream::new(&[TrackKind::Audio]);
        let track = stream.track(TrackKind::Audio).unwrap();
        track.set_enabled(false);
        let written = track
            .write_sample(Bytes::from_static(&[0u8; 4]), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!written);
    }

    #[test]
    fn test_remote_stream_ignores_duplicate_tracks() {
        let mut remote = RemoteStream::from_track(RemoteTrack::new("a1", "s1", TrackKind::Audio));
        assert!(!remote.add_track(RemoteTrack::new("a1", "s1", TrackKind::Audio)));
        assert!(remote.add_track(RemoteTrack::new("v1", "s1", TrackKind::Video)));
        assert_eq!(remote.id(), "s1");
        assert!(remote.has_video());
    }
}
