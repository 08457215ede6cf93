//! Negotiation engine backed by `webrtc::RTCPeerConnection`

use crate::config::CallConfig;
use crate::engine::{
    ConnectivityState, EngineError, EngineEvent, EngineEventSender, EngineFactory,
    NegotiationEngine,
};
use crate::media::{LocalTrack, MediaKind, RemoteTrack};
use crate::types::{CallId, IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Creates one [`RtcEngine`] per call
#[derive(Debug, Clone)]
pub struct RtcEngineFactory {
    ice_servers: Vec<String>,
}

impl RtcEngineFactory {
    /// Factory using the given STUN/TURN URLs
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    /// Factory using the ICE servers from a controller configuration
    pub fn from_config(config: &CallConfig) -> Self {
        Self::new(config.ice_servers.clone())
    }
}

fn setup_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Setup(e.to_string())
}

fn description_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Description(e.to_string())
}

fn connectivity_from(state: RTCIceConnectionState) -> Option<ConnectivityState> {
    match state {
        RTCIceConnectionState::New => Some(ConnectivityState::New),
        RTCIceConnectionState::Checking => Some(ConnectivityState::Checking),
        RTCIceConnectionState::Connected => Some(ConnectivityState::Connected),
        RTCIceConnectionState::Completed => Some(ConnectivityState::Completed),
        RTCIceConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        RTCIceConnectionState::Failed => Some(ConnectivityState::Failed),
        RTCIceConnectionState::Closed => Some(ConnectivityState::Closed),
        _ => None,
    }
}

#[async_trait]
impl EngineFactory for RtcEngineFactory {
    async fn create(
        &self,
        call_id: CallId,
        events: EngineEventSender,
    ) -> Result<Arc<dyn NegotiationEngine>, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(setup_err)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(setup_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut config = RTCConfiguration::default();
        if !self.ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }];
        }

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(setup_err)?);

        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx.send(EngineEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::warn!(error = %e, "Could not serialize local candidate"),
                }
            }
            Box::pin(async {})
        }));

        let state_tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            if let Some(state) = connectivity_from(state) {
                let _ = state_tx.send(EngineEvent::Connectivity(state));
            }
            Box::pin(async {})
        }));

        let track_tx = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(MediaKind::Audio),
                RTPCodecType::Video => Some(MediaKind::Video),
                _ => None,
            };
            if let Some(kind) = kind {
                let _ = track_tx.send(EngineEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    kind,
                    stream_id: track.stream_id(),
                }));
            }
            Box::pin(async {})
        }));

        tracing::debug!(call_id = %call_id, "RTCPeerConnection created");
        Ok(Arc::new(RtcEngine { pc }))
    }
}

/// [`NegotiationEngine`] over a `webrtc` peer connection
pub struct RtcEngine {
    pc: Arc<RTCPeerConnection>,
}

impl RtcEngine {
    fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
        match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(description_err)
    }
}

#[async_trait]
impl NegotiationEngine for RtcEngine {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), EngineError> {
        let codec = match track.kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            codec,
            track.id.clone(),
            track.stream_id.clone(),
        ));
        self.pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(setup_err)?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self.pc.create_offer(None).await.map_err(description_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self.pc.create_answer(None).await.map_err(description_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_local_description(Self::to_rtc(desc)?)
            .await
            .map_err(description_err)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_remote_description(Self::to_rtc(desc)?)
            .await
            .map_err(description_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| EngineError::Candidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), EngineError> {
        // Replace the handlers so the event senders they captured are dropped.
        self.pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_ice_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
        self.pc.close().await.map_err(|_| EngineError::Closed)
    }
}
