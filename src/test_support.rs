//! Test-Doubles für Peer Connections und ICE
//!
//! Die Fake-Verbindung protokolliert jeden Aufruf und lässt Zustände und
//! Candidates von außen auslösen. Mit `auto_connect` meldet sie nach
//! abgeschlossener Verhandlung von selbst `connected`.

use crate::media::{MediaHandle, MediaTrack, TrackKind};
use crate::peer::{
    IceCredentialProvider, IceServer, PeerConfig, PeerConnection, PeerConnectionFactory,
    PeerError, PeerEvent, PeerState, SdpKind, SessionDescription,
};
use crate::signaling::IceCandidate;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub fn candidate(name: &str) -> IceCandidate {
    IceCandidate {
        candidate: name.to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

/// Wartet (in Test-Zeit) bis `check` wahr ist
pub async fn wait_until<F: Fn() -> bool>(check: F, limit: Duration) -> bool {
    let step = Duration::from_millis(10);
    let mut waited = Duration::ZERO;
    while !check() {
        if waited >= limit {
            return false;
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
    true
}

// ============================================================================
// FAKE PEER CONNECTION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOp {
    AddStream(String),
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetRemote(SdpKind, String),
    AddCandidate(String),
    Close,
}

pub struct FakePeer {
    config: PeerConfig,
    events: mpsc::UnboundedSender<PeerEvent>,
    ops: Mutex<Vec<PeerOp>>,
    has_remote: AtomicBool,
    closed: AtomicBool,
    auto_connect: Arc<AtomicBool>,
    tracks: AtomicU32,
}

impl FakePeer {
    pub fn config(&self) -> PeerConfig {
        self.config.clone()
    }

    pub fn ops(&self) -> Vec<PeerOp> {
        self.ops.lock().clone()
    }

    pub fn candidates_added(&self) -> Vec<String> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                PeerOp::AddCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn offers_created(&self) -> u32 {
        self.count(|op| matches!(op, PeerOp::CreateOffer { .. }))
    }

    pub fn ice_restarts(&self) -> u32 {
        self.count(|op| matches!(op, PeerOp::CreateOffer { ice_restart: true }))
    }

    fn count(&self, f: impl Fn(&PeerOp) -> bool) -> u32 {
        self.ops.lock().iter().filter(|op| f(op)).count() as u32
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn emit_state(&self, state: PeerState) {
        let _ = self.events.send(PeerEvent::StateChanged(state));
    }

    pub fn emit_candidate(&self, name: &str) {
        let _ = self.events.send(PeerEvent::LocalCandidate(candidate(name)));
    }

    pub fn emit_track(&self, kind: TrackKind) {
        let n = self.tracks.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(PeerEvent::RemoteTrack(Arc::new(MediaTrack::new(
            format!("remote-track-{}", n),
            kind,
        ))));
    }

    fn record(&self, op: PeerOp) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        self.ops.lock().push(op);
        Ok(())
    }

    fn connect_if_auto(&self) {
        if self.auto_connect.load(Ordering::SeqCst) {
            self.emit_state(PeerState::Connecting);
            self.emit_state(PeerState::Connected);
            self.emit_track(TrackKind::Audio);
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_local_stream(&self, stream: &MediaHandle) -> Result<(), PeerError> {
        self.record(PeerOp::AddStream(stream.id().to_string()))
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String, PeerError> {
        self.record(PeerOp::CreateOffer { ice_restart })?;
        Ok(format!("v=0 fake-offer restart={}", ice_restart))
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        if !self.has_remote.load(Ordering::SeqCst) {
            return Err(PeerError::WebRtc("no remote description".into()));
        }
        self.record(PeerOp::CreateAnswer)?;
        self.connect_if_auto();
        Ok("v=0 fake-answer".to_string())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        if !description.sdp.starts_with("v=0") {
            return Err(PeerError::InvalidSdp(description.sdp));
        }
        self.record(PeerOp::SetRemote(description.kind, description.sdp))?;
        self.has_remote.store(true, Ordering::SeqCst);
        if description.kind == SdpKind::Answer {
            self.connect_if_auto();
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if !self.has_remote.load(Ordering::SeqCst) {
            return Err(PeerError::WebRtc("candidate before remote description".into()));
        }
        self.record(PeerOp::AddCandidate(candidate.candidate))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.ops.lock().push(PeerOp::Close);
            let _ = self.events.send(PeerEvent::StateChanged(PeerState::Closed));
        }
    }
}

/// Factory für `FakePeer`s, merkt sich alle erzeugten Verbindungen
#[derive(Default)]
pub struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    auto_connect: Arc<AtomicBool>,
    fail_create: AtomicBool,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Verbindungen melden nach Offer/Answer selbst `connected`
    pub fn connecting() -> Arc<Self> {
        let factory = Self::new();
        factory.set_auto_connect(true);
        factory
    }

    pub fn set_auto_connect(&self, on: bool) {
        self.auto_connect.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_create(&self, on: bool) {
        self.fail_create.store(on, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn peer(&self, index: usize) -> Arc<FakePeer> {
        Arc::clone(&self.peers.lock()[index])
    }

    pub fn last(&self) -> Arc<FakePeer> {
        Arc::clone(self.peers.lock().last().expect("no peer connection created"))
    }

    pub fn all_closed(&self) -> bool {
        self.peers.lock().iter().all(|p| p.is_closed())
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        config: PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(PeerError::WebRtc("fake factory failure".into()));
        }

        let peer = Arc::new(FakePeer {
            config,
            events,
            ops: Mutex::new(Vec::new()),
            has_remote: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            auto_connect: Arc::clone(&self.auto_connect),
            tracks: AtomicU32::new(0),
        });
        self.peers.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

// ============================================================================
// ICE
// ============================================================================

/// Zählt Abrufe und Invalidierungen
#[derive(Debug, Default)]
pub struct CountingIceProvider {
    fetches: AtomicU32,
    invalidations: AtomicU32,
}

impl CountingIceProvider {
    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn invalidations(&self) -> u32 {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IceCredentialProvider for CountingIceProvider {
    async fn ice_servers(&self) -> Result<Vec<IceServer>, PeerError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(vec![IceServer {
            urls: vec!["turn:turn.test:3478".to_string()],
            username: Some(format!("user-{}", n)),
            credential: Some("secret".to_string()),
        }])
    }

    fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}
