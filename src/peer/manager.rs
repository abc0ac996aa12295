//! Peer Connection Manager
//!
//! Besitzt die Peer Connection eines Calls und alles, was zu ihrer
//! Verhandlung gehört:
//! - Nur der Initiator erzeugt Offers; jede neue Verbindung des Initiators
//!   bekommt eine höhere Generation
//! - Remote Candidates werden gepuffert, bis die passende Remote
//!   Description gesetzt ist, und danach in Ankunftsreihenfolge angewendet
//! - Answers werden nur angenommen, solange ein Offer derselben Generation
//!   offen ist
//! - Bei `failed` entscheidet die `RecoveryPolicy` über Relay-Neuaufbau,
//!   ICE-Restart oder Aufgabe
//!
//! Events einer ersetzten Verbindung werden anhand ihrer Seriennummer
//! verworfen.

use super::{
    IceCredentialProvider, PeerConfig, PeerConnection, PeerConnectionFactory, PeerError,
    PeerEvent, PeerState, RecoveryAction, RecoveryPolicy, SessionDescription,
};
use crate::config::CallConfig;
use crate::media::{MediaHandle, MediaStream};
use crate::signaling::{IceCandidate, SignalEnvelope, SignalPayload, SignalingTransport};
use crate::timers::Timers;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Ereignisse für die Call State Machine
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    ConnectionState(PeerState),
    RemoteStream(MediaHandle),
    /// Recovery-Budget erschöpft, der Call ist verloren
    Fatal,
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub call_id: String,
    pub initiator: bool,
    pub force_relay: bool,
    pub max_ice_restarts: u32,
    pub recovery_delay: Duration,
    pub disconnected_grace: Duration,
}

impl ManagerOptions {
    pub fn from_config(call_id: &str, initiator: bool, config: &CallConfig) -> Self {
        Self {
            call_id: call_id.to_string(),
            initiator,
            force_relay: config.force_relay,
            max_ice_restarts: config.max_ice_restarts,
            recovery_delay: config.recovery_delay(),
            disconnected_grace: config.disconnected_grace(),
        }
    }
}

struct ManagerState {
    pc: Option<Arc<dyn PeerConnection>>,
    /// Seriennummer der aktuellen Verbindung (beim Initiator = Generation)
    serial: u32,
    /// Generation des zuletzt angewendeten Offers (nur Angerufener)
    remote_generation: u32,
    has_remote_description: bool,
    awaiting_answer: bool,
    last_offer: Option<SignalEnvelope>,
    pending_candidates: Vec<(u32, IceCandidate)>,
    policy: RecoveryPolicy,
    peer_state: PeerState,
    remote_stream: Option<MediaHandle>,
    closed: bool,
}

impl ManagerState {
    /// Generation, unter der gerade verhandelt wird
    fn negotiation_generation(&self, initiator: bool) -> u32 {
        if initiator {
            self.serial
        } else {
            self.remote_generation
        }
    }

    /// Entnimmt gepufferte Candidates für `generation`, ältere werden verworfen
    fn take_candidates(&mut self, generation: u32) -> Vec<IceCandidate> {
        let mut ready = Vec::new();
        let mut later = Vec::new();
        for (gen, candidate) in self.pending_candidates.drain(..) {
            if gen == generation {
                ready.push(candidate);
            } else if gen > generation {
                later.push((gen, candidate));
            }
        }
        self.pending_candidates = later;
        ready
    }
}

pub struct PeerConnectionManager {
    call_id: String,
    initiator: bool,
    local_stream: MediaHandle,
    factory: Arc<dyn PeerConnectionFactory>,
    ice: Arc<dyn IceCredentialProvider>,
    transport: Arc<SignalingTransport>,
    events: mpsc::UnboundedSender<ManagerEvent>,
    state: Mutex<ManagerState>,
    timers: Mutex<Timers>,
}

impl PeerConnectionManager {
    /// Baut die erste Verbindung auf; der Initiator sendet sofort ein Offer
    pub async fn start(
        options: ManagerOptions,
        local_stream: MediaHandle,
        factory: Arc<dyn PeerConnectionFactory>,
        ice: Arc<dyn IceCredentialProvider>,
        transport: Arc<SignalingTransport>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ManagerEvent>), PeerError> {
        let (events, rx) = mpsc::unbounded_channel();
        let policy = RecoveryPolicy::new(
            options.max_ice_restarts,
            options.recovery_delay,
            options.disconnected_grace,
            options.force_relay,
        );

        let manager = Arc::new(Self {
            call_id: options.call_id,
            initiator: options.initiator,
            local_stream,
            factory,
            ice,
            transport,
            events,
            state: Mutex::new(ManagerState {
                pc: None,
                serial: 0,
                remote_generation: 0,
                has_remote_description: false,
                awaiting_answer: false,
                last_offer: None,
                pending_candidates: Vec::new(),
                policy,
                peer_state: PeerState::New,
                remote_stream: None,
                closed: false,
            }),
            timers: Mutex::new(Timers::new()),
        });

        manager.connect().await?;
        if manager.initiator {
            manager.send_offer(false).await?;
        }
        Ok((manager, rx))
    }

    // ========================================================================
    // CONNECTION LIFECYCLE
    // ========================================================================

    /// Erstellt eine neue Peer Connection mit frischer ICE Konfiguration
    async fn connect(self: &Arc<Self>) -> Result<(), PeerError> {
        let relay_only = self.state.lock().policy.relay_forced();
        let servers = self.ice.ice_servers().await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let pc = self
            .factory
            .create(PeerConfig::new(servers, relay_only), tx)
            .await?;

        if let Err(e) = pc.add_local_stream(&self.local_stream).await {
            pc.close().await;
            return Err(e);
        }

        // Während des Aufbaus geschlossen: Verbindung sofort wieder abbauen
        let serial = {
            let mut st = self.state.lock();
            if st.closed {
                None
            } else {
                st.serial += 1;
                st.pc = Some(Arc::clone(&pc));
                st.has_remote_description = false;
                st.awaiting_answer = false;
                st.peer_state = PeerState::New;
                Some(st.serial)
            }
        };
        let Some(serial) = serial else {
            pc.close().await;
            return Err(PeerError::Closed);
        };

        let weak = Arc::downgrade(self);
        self.timers.lock().spawn("pump", async move {
            while let Some(event) = rx.recv().await {
                let Some(manager) = weak.upgrade() else { break };
                manager.on_peer_event(serial, event).await;
            }
        });

        tracing::info!(
            "Peer connection #{} ready for call {} (relay_only={})",
            serial,
            self.call_id,
            relay_only
        );
        Ok(())
    }

    /// Nimmt die aktuelle Verbindung aus dem Zustand
    fn retire_current(&self) -> Option<Arc<dyn PeerConnection>> {
        let mut st = self.state.lock();
        st.has_remote_description = false;
        st.awaiting_answer = false;
        st.pc.take()
    }

    /// Schließt die aktuelle Verbindung und baut eine neue auf
    pub async fn recreate(self: &Arc<Self>) -> Result<(), PeerError> {
        tracing::info!("Recreating peer connection for call {}", self.call_id);

        if let Some(old) = self.retire_current() {
            old.close().await;
        }
        self.connect().await?;
        if self.initiator {
            self.send_offer(false).await?;
        }
        Ok(())
    }

    async fn send_offer(&self, ice_restart: bool) -> Result<(), PeerError> {
        let (pc, generation, relay_only) = {
            let st = self.state.lock();
            let pc = st.pc.clone().ok_or(PeerError::Closed)?;
            (pc, st.serial, st.policy.relay_forced())
        };

        let sdp = pc.create_offer(ice_restart).await?;
        self.state.lock().awaiting_answer = true;

        let envelope = self
            .transport
            .send(SignalPayload::Offer {
                sdp,
                ice_restart,
                relay_only,
                generation,
            })
            .await?;
        self.state.lock().last_offer = Some(envelope);
        Ok(())
    }

    async fn ice_restart(&self, attempt: u32) -> Result<(), PeerError> {
        tracing::info!("ICE restart attempt {} for call {}", attempt, self.call_id);
        self.send_offer(true).await
    }

    /// Manueller Retry: frische Credentials, Relay erzwungen, volles Budget
    pub async fn retry_with_fresh_credentials(self: &Arc<Self>) -> Result<(), PeerError> {
        self.ice.invalidate();
        self.state.lock().policy.reset_for_manual_retry();
        {
            let mut timers = self.timers.lock();
            timers.cancel("recovery");
            timers.cancel("grace");
        }

        if self.initiator {
            self.recreate().await
        } else {
            // Nur der Initiator darf Offers erzeugen
            self.transport
                .send(SignalPayload::Ready { renegotiate: true })
                .await?;
            Ok(())
        }
    }

    /// Schließt die Verbindung und stoppt alle Timer
    pub async fn close(&self) {
        let pc = {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.pending_candidates.clear();
            st.awaiting_answer = false;
            st.pc.take()
        };

        self.timers.lock().cancel_all();
        if let Some(pc) = pc {
            pc.close().await;
        }
        tracing::info!("Peer connection manager closed for call {}", self.call_id);
    }

    // ========================================================================
    // REMOTE SIGNALS
    // ========================================================================

    /// Wendet eine Signaling-Nachricht an
    ///
    /// Fehler betreffen nur diese Nachricht; der Call läuft weiter.
    pub async fn apply_signal(self: &Arc<Self>, envelope: &SignalEnvelope) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }

        match &envelope.payload {
            SignalPayload::Offer {
                sdp,
                relay_only,
                generation,
                ..
            } => self.handle_offer(sdp, *relay_only, *generation).await,
            SignalPayload::Answer { sdp, generation } => self.handle_answer(sdp, *generation).await,
            SignalPayload::IceCandidate {
                candidate,
                generation,
            } => self.handle_candidate(candidate.clone(), *generation).await,
            SignalPayload::Ready { renegotiate } => self.handle_ready(*renegotiate).await,
            SignalPayload::Hangup => Ok(()),
        }
    }

    async fn handle_offer(
        self: &Arc<Self>,
        sdp: &str,
        relay_only: bool,
        generation: u32,
    ) -> Result<(), PeerError> {
        if self.initiator {
            return Err(PeerError::UnexpectedSignal("offer".to_string()));
        }

        let replace = {
            let mut st = self.state.lock();
            if generation < st.remote_generation {
                tracing::debug!("Dropping stale offer generation {}", generation);
                return Ok(());
            }
            if relay_only {
                st.policy.force_relay();
            }
            st.remote_generation != 0 && generation > st.remote_generation
        };

        // Der Initiator hat neu aufgebaut: eigene Verbindung ebenfalls ersetzen
        if replace {
            tracing::info!(
                "Offer generation {} replaces current connection for call {}",
                generation,
                self.call_id
            );
            if let Some(old) = self.retire_current() {
                old.close().await;
            }
            self.connect().await?;
        }

        let pc = self.current_pc()?;
        pc.set_remote_description(SessionDescription::offer(sdp))
            .await?;

        let buffered = {
            let mut st = self.state.lock();
            st.has_remote_description = true;
            st.remote_generation = generation;
            st.take_candidates(generation)
        };
        self.add_candidates(&pc, buffered).await;

        let answer = pc.create_answer().await?;
        self.transport
            .send(SignalPayload::Answer {
                sdp: answer,
                generation,
            })
            .await?;
        Ok(())
    }

    async fn handle_answer(&self, sdp: &str, generation: u32) -> Result<(), PeerError> {
        if !self.initiator {
            return Err(PeerError::UnexpectedSignal("answer".to_string()));
        }

        {
            let st = self.state.lock();
            if generation != st.serial {
                tracing::debug!("Dropping answer for stale generation {}", generation);
                return Ok(());
            }
            if !st.awaiting_answer {
                tracing::warn!("Dropping answer without outstanding offer");
                return Ok(());
            }
        }

        let pc = self.current_pc()?;
        pc.set_remote_description(SessionDescription::answer(sdp))
            .await?;

        let buffered = {
            let mut st = self.state.lock();
            st.awaiting_answer = false;
            st.has_remote_description = true;
            st.take_candidates(generation)
        };
        self.add_candidates(&pc, buffered).await;
        Ok(())
    }

    async fn handle_candidate(&self, candidate: IceCandidate, generation: u32) -> Result<(), PeerError> {
        let pc = {
            let mut st = self.state.lock();
            let current = st.negotiation_generation(self.initiator);

            let stale = if self.initiator {
                generation != st.serial
            } else {
                generation < st.remote_generation
            };
            if stale {
                tracing::debug!("Dropping candidate for stale generation {}", generation);
                return Ok(());
            }

            if st.has_remote_description && generation == current {
                st.pc.clone()
            } else {
                st.pending_candidates.push((generation, candidate.clone()));
                None
            }
        };

        if let Some(pc) = pc {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to add remote candidate: {}", e);
            }
        }
        Ok(())
    }

    async fn handle_ready(self: &Arc<Self>, renegotiate: bool) -> Result<(), PeerError> {
        if !self.initiator {
            return Ok(());
        }

        if renegotiate {
            tracing::info!("Remote requested renegotiation for call {}", self.call_id);
            return self.retry_with_fresh_credentials().await;
        }

        // Offer ging womöglich verloren, bevor die Gegenseite zuhörte
        let pending = {
            let st = self.state.lock();
            if st.awaiting_answer {
                st.last_offer.clone()
            } else {
                None
            }
        };
        if let Some(offer) = pending {
            tracing::debug!("Retransmitting offer {} after ready", offer.message_id);
            self.transport.resend(&offer).await?;
        }
        Ok(())
    }

    async fn add_candidates(&self, pc: &Arc<dyn PeerConnection>, candidates: Vec<IceCandidate>) {
        for candidate in candidates {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to add buffered candidate: {}", e);
            }
        }
    }

    fn current_pc(&self) -> Result<Arc<dyn PeerConnection>, PeerError> {
        self.state.lock().pc.clone().ok_or(PeerError::Closed)
    }

    // ========================================================================
    // LOCAL EVENTS
    // ========================================================================

    async fn on_peer_event(self: &Arc<Self>, serial: u32, event: PeerEvent) {
        {
            let st = self.state.lock();
            if st.closed || st.pc.is_none() || st.serial != serial {
                return;
            }
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let generation = self.state.lock().negotiation_generation(self.initiator);
                if let Err(e) = self
                    .transport
                    .send(SignalPayload::IceCandidate {
                        candidate,
                        generation,
                    })
                    .await
                {
                    tracing::warn!("Failed to send local candidate: {}", e);
                }
            }
            PeerEvent::RemoteTrack(track) => {
                let stream = {
                    let mut st = self.state.lock();
                    let call_id = self.call_id.clone();
                    Arc::clone(
                        st.remote_stream
                            .get_or_insert_with(|| Arc::new(MediaStream::new(format!("remote-{}", call_id)))),
                    )
                };
                stream.add_track(track);
                let _ = self.events.send(ManagerEvent::RemoteStream(stream));
            }
            PeerEvent::StateChanged(state) => self.on_state_change(state),
        }
    }

    fn on_state_change(self: &Arc<Self>, state: PeerState) {
        let grace = {
            let mut st = self.state.lock();
            st.peer_state = state;
            st.policy.disconnected_grace()
        };
        tracing::debug!("Call {} connection state: {}", self.call_id, state);
        let _ = self.events.send(ManagerEvent::ConnectionState(state));

        match state {
            PeerState::Connected => {
                let mut timers = self.timers.lock();
                timers.cancel("grace");
                timers.cancel("recovery");
            }
            PeerState::Disconnected => {
                // Kurze Aussetzer erholen sich meist von selbst
                let weak = Arc::downgrade(self);
                self.timers.lock().schedule("grace", grace, async move {
                    if let Some(manager) = weak.upgrade() {
                        if manager.peer_state() == PeerState::Disconnected {
                            tracing::warn!(
                                "Call {} still disconnected after grace period",
                                manager.call_id
                            );
                            manager.handle_failure();
                        }
                    }
                });
            }
            PeerState::Failed => {
                self.timers.lock().cancel("grace");
                self.handle_failure();
            }
            _ => {}
        }
    }

    fn handle_failure(self: &Arc<Self>) {
        let action = self.state.lock().policy.on_failed();

        match action {
            RecoveryAction::GiveUp => {
                tracing::error!("Recovery exhausted for call {}", self.call_id);
                let _ = self.events.send(ManagerEvent::Fatal);
            }
            _ if !self.initiator => {
                tracing::info!(
                    "Call {} failed, waiting for initiator to renegotiate",
                    self.call_id
                );
            }
            RecoveryAction::RecreateWithRelay { delay } => {
                tracing::warn!(
                    "Call {} failed, recreating with relay in {:?}",
                    self.call_id,
                    delay
                );
                self.schedule_recovery(delay, None);
            }
            RecoveryAction::IceRestart { attempt, delay } => {
                self.schedule_recovery(delay, Some(attempt));
            }
        }
    }

    fn schedule_recovery(self: &Arc<Self>, delay: Duration, restart_attempt: Option<u32>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.timers.lock().schedule("recovery", delay, async move {
            let Some(manager) = weak.upgrade() else { return };
            let result = match restart_attempt {
                Some(attempt) => manager.ice_restart(attempt).await,
                None => manager.recreate().await,
            };
            if let Err(e) = result {
                tracing::error!("Recovery for call {} failed: {}", manager.call_id, e);
                if !manager.is_closed() {
                    let _ = manager.events.send(ManagerEvent::Fatal);
                }
            }
        });
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn peer_state(&self) -> PeerState {
        self.state.lock().peer_state
    }

    pub fn remote_stream(&self) -> Option<MediaHandle> {
        self.state.lock().remote_stream.clone()
    }

    pub fn ice_restart_count(&self) -> u32 {
        self.state.lock().policy.restart_attempts()
    }

    pub fn relay_forced(&self) -> bool {
        self.state.lock().policy.relay_forced()
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.state.lock().pending_candidates.len()
    }

    /// Seriennummer der aktuellen Verbindung
    pub fn connection_serial(&self) -> u32 {
        self.state.lock().serial
    }

    pub fn has_pending_timers(&self) -> bool {
        !self.timers.lock().is_empty()
    }
}

impl std::fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionManager")
            .field("call_id", &self.call_id)
            .field("initiator", &self.initiator)
            .field("state", &self.peer_state())
            .field("serial", &self.connection_serial())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
