//! WebRTC peer transport
//!
//! Wraps an `RTCPeerConnection` from the `webrtc` crate. Callbacks registered
//! on the connection only translate and forward; every decision is left to
//! the call manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use super::{
    IceServer, PeerTransport, PeerTransportFactory, TransportError, TransportEvent, TransportEvents,
    TransportState,
};
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

/// Builds peer connections from one shared WebRTC API instance
pub struct WebRtcTransportFactory {
    api: Arc<API>,
}

impl WebRtcTransportFactory {
    /// API with the default codec set and interceptors (NACK, RTCP reports)
    pub fn new() -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::CreateFailed(e.to_string()))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| TransportError::CreateFailed(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api: Arc::new(api) })
    }
}

fn rtc_config(ice_servers: &[IceServer]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
            })
            .collect(),
        ..Default::default()
    }
}

fn connection_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

fn candidate_from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn remote_track(track: &Arc<TrackRemote>) -> RemoteTrack {
    let kind = match track.kind() {
        RTPCodecType::Video => TrackKind::Video,
        _ => TrackKind::Audio,
    };
    RemoteTrack::new(track.id().to_string(), track.stream_id().to_string(), kind).with_handle(track.clone())
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config(ice_servers))
                .await
                .map_err(|e| TransportError::CreateFailed(e.to_string()))?,
        );
        let call_id = events.call_id();

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            // `None` marks the end of gathering
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => candidate_events.emit(TransportEvent::LocalCandidate(candidate_from_init(init))),
                    Err(e) => tracing::warn!("Call {} - unusable local candidate: {}", call_id, e),
                }
            }
            Box::pin(async {})
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::debug!("Call {} - peer connection state {:?}", call_id, state);
            if let Some(state) = connection_state(state) {
                state_events.emit(TransportEvent::ConnectionState(state));
            }
            Box::pin(async {})
        }));

        let ice_events = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            tracing::debug!("Call {} - ICE connection state {:?}", call_id, state);
            if state == RTCIceConnectionState::Failed {
                ice_events.emit(TransportEvent::IceFailed);
            }
            Box::pin(async {})
        }));

        let track_events = events;
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            tracing::info!("Call {} - remote {:?} track {}", call_id, track.kind(), track.id());
            track_events.emit(TransportEvent::RemoteTrack(remote_track(&track)));
            Box::pin(async {})
        }));

        tracing::debug!("Call {} - peer connection created", call_id);
        Ok(Arc::new(WebRtcTransport {
            pc,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Peer connection for one call attempt
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

impl WebRtcTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

fn negotiation(e: webrtc::Error) -> TransportError {
    TransportError::Negotiation(e.to_string())
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        let remote = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
            SdpType::Rollback => {
                return Err(TransportError::Negotiation("rollback is not supported".to_string()))
            }
        }
        .map_err(negotiation)?;

        self.pc.set_remote_description(remote).await.map_err(negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    async fn attach_local_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        self.ensure_open()?;
        let sender = self
            .pc
            .add_track(track.rtp_track())
            .await
            .map_err(|e| TransportError::Track(e.to_string()))?;

        // Interceptors only run while someone drains the sender's RTCP
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Error closing peer connection: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtc_config_maps_credentials() {
        let servers = vec![
            IceServer::stun("stun:stun.l.google.com:19302"),
            IceServer {
                urls: vec!["turn:turn.example.org:3478".to_string()],
                username: Some("user".to_string()),
                credential: Some("secret".to_string()),
            },
        ];
        let config = rtc_config(&servers);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[0].username, "");
        assert_eq!(config.ice_servers[1].credential, "secret");
    }

    #[test]
    fn test_connection_state_mapping() {
        assert_eq!(connection_state(RTCPeerConnectionState::Connected), Some(TransportState::Connected));
        assert_eq!(connection_state(RTCPeerConnectionState::Failed), Some(TransportState::Failed));
        assert_eq!(connection_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[tokio::test]
    async fn test_offer_answer_between_two_connections() {
        let factory = WebRtcTransportFactory::new().unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let caller = factory
            .create(&[], TransportEvents::new(uuid::Uuid::new_v4(), tx.clone()))
            .await
            .unwrap();
        let callee = factory
            .create(&[], TransportEvents::new(uuid::Uuid::new_v4(), tx))
            .await
            .unwrap();

        let stream = crate::media::LocalStream::new(&[TrackKind::Audio]);
        caller.attach_local_track(&stream.tracks()[0]).await.unwrap();

        let offer = caller.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));

        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        caller.set_remote_description(answer).await.unwrap();

        caller.close().await;
        caller.close().await;
        callee.close().await;
        assert!(matches!(caller.create_offer().await, Err(TransportError::Closed)));
    }
}
