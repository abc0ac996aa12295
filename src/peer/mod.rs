//! Peer Module - Verbindungsaufbau und Recovery
//!
//! Dieses Modul verwaltet:
//! - Abstraktion der Peer Connection (WebRTC Backend oder Test-Fake)
//! - Frische ICE Server pro Verbindungsversuch
//! - Offer/Answer/Candidate Verhandlung mit Generationen
//! - Gestufte Recovery bei Verbindungsfehlern
//!

mod ice;
mod manager;
mod recovery;
mod rtc;

pub use rtc::WebRtcPeerFactory;
pub use ice::{
    provider_from_config, IceCredentialProvider, IceServer, StaticIceProvider, TurnRestProvider,
};
pub use manager::{ManagerEvent, ManagerOptions, PeerConnectionManager};
pub use recovery::{RecoveryAction, RecoveryMode, RecoveryPolicy};

use crate::media::{MediaHandle, MediaTrack};
use crate::signaling::{IceCandidate, SignalingError};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid session description: {0}")]
    InvalidSdp(String),

    #[error("ICE configuration failed: {0}")]
    Ice(String),

    #[error("Peer connection is closed")]
    Closed,

    #[error("Unexpected {0} for this side of the call")]
    UnexpectedSignal(String),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

// ============================================================================
// CONNECTION TYPES
// ============================================================================

/// Zustand der Peer Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::New => "new",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Events einer einzelnen Peer Connection
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    StateChanged(PeerState),
    RemoteTrack(Arc<MediaTrack>),
}

/// Konfiguration für eine neue Peer Connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
    /// Nur Relay-Kandidaten (TURN) verwenden
    pub relay_only: bool,
}

impl PeerConfig {
    pub fn new(ice_servers: Vec<IceServer>, relay_only: bool) -> Self {
        // STUN ist im Relay-Modus nutzlos, sofern TURN vorhanden ist
        let ice_servers = if relay_only && ice_servers.iter().any(IceServer::is_relay) {
            ice_servers.into_iter().filter(IceServer::is_relay).collect()
        } else {
            ice_servers
        };
        Self {
            ice_servers,
            relay_only,
        }
    }
}

// ============================================================================
// BACKEND CONTRACTS
// ============================================================================

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_stream(&self, stream: &MediaHandle) -> Result<(), PeerError>;

    /// Erzeugt ein Offer und setzt es als lokale Beschreibung
    async fn create_offer(&self, ice_restart: bool) -> Result<String, PeerError>;

    /// Erzeugt ein Answer und setzt es als lokale Beschreibung
    async fn create_answer(&self) -> Result<String, PeerError>;

    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
