//! WebRTC Backend für die Peer Connection
//!
//! Baut `RTCPeerConnection`s mit Opus/VP8 und leitet deren Callbacks als
//! `PeerEvent`s an den Manager weiter.

use super::{
    IceServer, PeerConfig, PeerConnection, PeerConnectionFactory, PeerError, PeerEvent,
    PeerState, SdpKind, SessionDescription,
};
use crate::media::{MediaHandle, MediaTrack, TrackKind};
use crate::signaling::IceCandidate;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

const OPUS_CLOCK_RATE: u32 = 48000;
const VIDEO_CLOCK_RATE: u32 = 90000;

fn rtc_error(e: webrtc::Error) -> PeerError {
    PeerError::WebRtc(e.to_string())
}

fn to_rtc_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerState::New),
        RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerState::Closed),
        _ => None,
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt echte WebRTC Peer Connections
#[derive(Debug, Default, Clone)]
pub struct WebRtcPeerFactory;

impl WebRtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        config: PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        // Media Engine mit Opus/VP8
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(rtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.iter().map(to_rtc_server).collect(),
            ice_transport_policy: if config.relay_only {
                RTCIceTransportPolicy::Relay
            } else {
                RTCIceTransportPolicy::All
            },
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(rtc_error)?,
        );
        register_handlers(&pc, events);

        tracing::debug!(
            "Created peer connection (relay_only={}, servers={})",
            config.relay_only,
            config.ice_servers.len()
        );
        Ok(Arc::new(WebRtcPeer { pc }))
    }
}

/// Registriert die Callbacks der Peer Connection
fn register_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<PeerEvent>) {
    let state_tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);
        if let Some(state) = map_state(s) {
            let _ = state_tx.send(PeerEvent::StateChanged(state));
        }
        Box::pin(async {})
    }));

    let candidate_tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => {
                    let _ = candidate_tx.send(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Err(e) => tracing::warn!("Unserializable local candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let track_tx = events;
    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        tracing::info!("Received remote {:?} track: {:?}", kind, track.codec());
        let _ = track_tx.send(PeerEvent::RemoteTrack(Arc::new(MediaTrack::new(
            format!("remote-{}", track.id()),
            kind,
        ))));
        Box::pin(async {})
    }));
}

// ============================================================================
// CONNECTION
// ============================================================================

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_local_stream(&self, stream: &MediaHandle) -> Result<(), PeerError> {
        for track in stream.tracks() {
            let capability = match track.kind() {
                TrackKind::Audio => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: OPUS_CLOCK_RATE,
                    channels: 2,
                    ..Default::default()
                },
                TrackKind::Video => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: VIDEO_CLOCK_RATE,
                    ..Default::default()
                },
            };

            let local = Arc::new(TrackLocalStaticRTP::new(
                capability,
                track.id().to_string(),
                stream.id().to_string(),
            ));
            self.pc
                .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(rtc_error)?;
        }
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String, PeerError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });

        let offer = self.pc.create_offer(options).await.map_err(rtc_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(rtc_error)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(rtc_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(rtc_error)?;
        Ok(answer.sdp)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| PeerError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| PeerError::InvalidSdp(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(rtc_error)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::debug!("Closing peer connection failed: {}", e);
        }
    }
}
