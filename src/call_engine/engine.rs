//! Call State Machine
//!
//! Besitzt genau eine Call-Session pro Client und setzt sie aus den
//! Bausteinen zusammen:
//! - Lokale Medien (exklusiv für die Session)
//! - Signaling Transport (Broadcast + durable Queue)
//! - Peer Connection Manager (Verhandlung und Recovery)
//! - Klingel-Timeout und Record-Updates der Gegenseite
//!
//! Jeder Anrufversuch hat eine Attempt-Nummer. Hintergrund-Trigger (Timer,
//! Hangup, Record-Update, Recovery-Abbruch) nennen ihren Attempt; ein
//! Teardown für einen nicht mehr aktuellen Attempt ist wirkungslos.

use super::lock::{HostSignal, SuspendSignalSource, UiLock};
use super::watcher::CallAvailability;
use crate::config::CallConfig;
use crate::database::{
    CallKind, CallRecord, CallRecordStore, CallRecordUpdate, CallStatus, NewCallRecord,
    RecordEvent, RecordFilter, RecordSubscription, SignalStore, StoreError,
};
use crate::media::{MediaCapture, MediaError, MediaHandle};
use crate::peer::{
    IceCredentialProvider, ManagerEvent, ManagerOptions, PeerConnectionFactory,
    PeerConnectionManager, PeerError, PeerState,
};
use crate::signaling::{
    BroadcastChannel, SignalEnvelope, SignalPayload, SignalingError, SignalingTransport,
};
use crate::timers::Timers;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("Only the callee can answer or decline this call")]
    NotCallee,

    #[error("Call is {0}, expected ringing")]
    InvalidRecordState(CallStatus),

    #[error("Call was ended while it was being set up")]
    Cancelled,

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("Call record error: {0}")]
    Store(#[from] StoreError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Peer connection error: {0}")]
    Peer(#[from] PeerError),
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Status der lokalen Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    /// Kein aktiver Anruf
    #[default]
    Idle,
    /// Ausgehender Anruf, Gegenseite hat noch nicht angenommen
    Calling,
    /// Angenommen, Verbindung wird aufgebaut
    Ringing,
    /// Peer Connection steht
    Connected,
    /// Teardown läuft, danach wieder Idle
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Calling => "calling",
            CallState::Ringing => "ringing",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
        }
    }

    /// Session existiert und ist nicht im Abbau
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CallState::Calling | CallState::Ringing | CallState::Connected
        )
    }
}

/// Warum ein Anruf endete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    /// Gegenseite hat den Record auf einen Endstatus gesetzt
    RemoteStatus(CallStatus),
    Timeout,
    ConnectionLost,
    Suspended,
    /// Start oder Annahme ist fehlgeschlagen
    Aborted,
}

/// Events für die UI
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StatusChanged(CallState),
    ConnectionStateChanged(PeerState),
    RemoteStream(MediaHandle),
    CallEnded {
        call_id: Option<String>,
        reason: EndReason,
    },
    Error(String),
}

/// Externe Kollaborateure der Engine
#[derive(Clone)]
pub struct CallDeps {
    pub records: Arc<dyn CallRecordStore>,
    pub signals: Arc<dyn SignalStore>,
    pub broadcast: Arc<dyn BroadcastChannel>,
    pub media: Arc<dyn MediaCapture>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub ice: Arc<dyn IceCredentialProvider>,
}

#[derive(Default)]
struct Session {
    attempt: u64,
    status: CallState,
    initiator: bool,
    /// Gegenseite hat angenommen (Record `answered` oder `ready`)
    answered: bool,
    record: Option<CallRecord>,
    local_media: Option<MediaHandle>,
    remote_media: Option<MediaHandle>,
    muted: bool,
    video_disabled: bool,
    connection_state: Option<PeerState>,
    transport: Option<Arc<SignalingTransport>>,
    manager: Option<Arc<PeerConnectionManager>>,
}

impl Session {
    fn is_current(&self, attempt: u64) -> bool {
        self.attempt == attempt && self.status.is_active()
    }

    /// Endstatus für einen lokal beendeten Anruf
    fn local_end_status(&self) -> CallStatus {
        if self.answered {
            CallStatus::Ended
        } else {
            CallStatus::Missed
        }
    }
}

/// Was beim Teardown nach außen passiert
#[derive(Debug, Clone, Copy)]
struct EndPlan {
    reason: EndReason,
    hangup: bool,
    record_status: Option<CallStatus>,
}

impl EndPlan {
    /// Gegenseite hat beendet: nichts mehr senden oder schreiben
    fn remote(reason: EndReason) -> Self {
        Self {
            reason,
            hangup: false,
            record_status: None,
        }
    }

    fn local(reason: EndReason, status: CallStatus) -> Self {
        Self {
            reason,
            hangup: true,
            record_status: Some(status),
        }
    }

    fn aborted(initiator: bool) -> Self {
        let status = if initiator {
            CallStatus::Missed
        } else {
            CallStatus::Ended
        };
        Self::local(EndReason::Aborted, status)
    }
}

enum LoopEvent {
    Signal(SignalEnvelope),
    Peer(ManagerEvent),
    Record(RecordEvent),
}

// ============================================================================
// CALL ENGINE
// ============================================================================

/// Call State Machine
///
/// Günstig klonbar; alle Klone teilen sich dieselbe Session.
#[derive(Clone)]
pub struct CallEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    user_id: String,
    config: CallConfig,
    deps: CallDeps,
    session: Mutex<Session>,
    ui_lock: UiLock,
    tearing_down: AtomicBool,
    attempts: AtomicU64,
    timers: Mutex<Timers>,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl CallEngine {
    pub fn new(user_id: &str, config: CallConfig, deps: CallDeps) -> Self {
        let (event_tx, _) = broadcast::channel(256);

        Self {
            inner: Arc::new(EngineInner {
                user_id: user_id.to_string(),
                config,
                deps,
                session: Mutex::new(Session::default()),
                ui_lock: UiLock::new(),
                tearing_down: AtomicBool::new(false),
                attempts: AtomicU64::new(0),
                timers: Mutex::new(Timers::new()),
                event_tx,
            }),
        }
    }

    fn from_inner(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn status(&self) -> CallState {
        self.inner.session.lock().status
    }

    pub fn current_record(&self) -> Option<CallRecord> {
        self.inner.session.lock().record.clone()
    }

    pub fn local_media(&self) -> Option<MediaHandle> {
        self.inner.session.lock().local_media.clone()
    }

    pub fn remote_media(&self) -> Option<MediaHandle> {
        self.inner.session.lock().remote_media.clone()
    }

    pub fn is_muted(&self) -> bool {
        self.inner.session.lock().muted
    }

    pub fn is_video_disabled(&self) -> bool {
        self.inner.session.lock().video_disabled
    }

    pub fn connection_state(&self) -> Option<PeerState> {
        self.inner.session.lock().connection_state
    }

    pub fn ice_restart_count(&self) -> u32 {
        self.inner
            .session
            .lock()
            .manager
            .as_ref()
            .map(|m| m.ice_restart_count())
            .unwrap_or(0)
    }

    pub fn ui_lock(&self) -> UiLock {
        self.inner.ui_lock.clone()
    }

    /// Ob noch Timer oder die Session-Schleife laufen
    pub fn has_pending_timers(&self) -> bool {
        !self.inner.timers.lock().is_empty()
    }

    // ========================================================================
    // ACTIONS
    // ========================================================================

    /// Startet einen ausgehenden Anruf
    ///
    /// Bei einem Fehler ist die Session vollständig zurückgerollt.
    pub async fn start_call(
        &self,
        callee_id: &str,
        conversation_id: Option<String>,
        kind: CallKind,
    ) -> Result<CallRecord, CallError> {
        let attempt = self.begin_attempt(CallState::Calling, true)?;
        tracing::info!("Starting {} call to {}", kind.as_str(), callee_id);

        match self
            .start_inner(attempt, callee_id, conversation_id, kind)
            .await
        {
            Ok(record) => Ok(record),
            Err(e) => {
                self.abort_attempt(attempt, true, &e).await;
                Err(e)
            }
        }
    }

    async fn start_inner(
        &self,
        attempt: u64,
        callee_id: &str,
        conversation_id: Option<String>,
        kind: CallKind,
    ) -> Result<CallRecord, CallError> {
        let deps = &self.inner.deps;

        // Berechtigungsdialog kann Lifecycle-Signale auslösen
        self.inner.ui_lock.engage();
        let media = deps.media.acquire(kind).await?;
        if !self.adopt(attempt, |s| s.local_media = Some(Arc::clone(&media))) {
            media.stop_all();
            return Err(CallError::Cancelled);
        }

        let record = deps
            .records
            .create_record(NewCallRecord {
                caller_id: self.inner.user_id.clone(),
                callee_id: callee_id.to_string(),
                conversation_id,
                kind,
            })
            .await?;
        if !self.adopt(attempt, |s| s.record = Some(record.clone())) {
            self.finalize_record(&record.id, CallStatus::Missed).await;
            return Err(CallError::Cancelled);
        }

        self.connect(attempt, &record, media, true).await?;
        if !self.schedule_ring_timeout(attempt) {
            return Err(CallError::Cancelled);
        }
        Ok(record)
    }

    /// Nimmt einen eingehenden Anruf an
    pub async fn answer_call(&self, record: &CallRecord) -> Result<(), CallError> {
        if record.callee_id != self.inner.user_id {
            return Err(CallError::NotCallee);
        }
        if record.status != CallStatus::Ringing {
            return Err(CallError::InvalidRecordState(record.status));
        }

        let attempt = self.begin_attempt(CallState::Ringing, false)?;
        tracing::info!("Answering call {} from {}", record.id, record.caller_id);

        match self.answer_inner(attempt, record).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abort_attempt(attempt, false, &e).await;
                Err(e)
            }
        }
    }

    async fn answer_inner(&self, attempt: u64, record: &CallRecord) -> Result<(), CallError> {
        let deps = &self.inner.deps;

        self.inner.ui_lock.engage();
        let media = deps.media.acquire(record.kind).await?;
        if !self.adopt(attempt, |s| s.local_media = Some(Arc::clone(&media))) {
            media.stop_all();
            return Err(CallError::Cancelled);
        }

        let answered = deps
            .records
            .update_record(&record.id, CallRecordUpdate::status(CallStatus::Answered))
            .await?;
        if !self.adopt(attempt, |s| s.record = Some(answered.clone())) {
            self.finalize_record(&answered.id, CallStatus::Ended).await;
            return Err(CallError::Cancelled);
        }

        self.connect(attempt, &answered, media, false).await?;

        let transport = self.inner.session.lock().transport.clone();
        if let Some(transport) = transport {
            // Offer kam womöglich vor unserem Broadcast-Abo
            match transport.drain_queue().await {
                Ok(n) if n > 0 => tracing::debug!("Consumed {} queued signals on answer", n),
                Ok(_) => {}
                Err(e) => tracing::warn!("Reading queued signals failed: {}", e),
            }
            if let Err(e) = transport
                .send(SignalPayload::Ready { renegotiate: false })
                .await
            {
                tracing::warn!("Failed to send ready for call {}: {}", answered.id, e);
            }
        }
        Ok(())
    }

    /// Lehnt einen eingehenden Anruf ab
    pub async fn decline_call(&self, record: &CallRecord) -> Result<(), CallError> {
        if record.callee_id != self.inner.user_id {
            return Err(CallError::NotCallee);
        }

        let in_session = self
            .inner
            .session
            .lock()
            .record
            .as_ref()
            .is_some_and(|r| r.id == record.id);
        if in_session {
            return self.end_call().await;
        }

        let deps = &self.inner.deps;
        let current = deps.records.get_record(&record.id).await?;
        if current.status != CallStatus::Ringing {
            return Err(CallError::InvalidRecordState(current.status));
        }

        deps.records
            .update_record(&record.id, CallRecordUpdate::status(CallStatus::Declined))
            .await?;

        if let Err(e) = SignalingTransport::post(
            deps.signals.as_ref(),
            &record.id,
            &self.inner.user_id,
            SignalPayload::Hangup,
        )
        .await
        {
            tracing::warn!("Failed to queue hangup for declined call {}: {}", record.id, e);
        }

        tracing::info!("Declined call {} from {}", record.id, record.caller_id);
        Ok(())
    }

    /// Beendet den aktuellen Anruf
    pub async fn end_call(&self) -> Result<(), CallError> {
        let (attempt, plan) = {
            let s = self.inner.session.lock();
            match s.status {
                CallState::Idle => return Err(CallError::NoActiveCall),
                CallState::Ended => return Ok(()),
                _ => (
                    s.attempt,
                    EndPlan::local(EndReason::LocalHangup, s.local_end_status()),
                ),
            }
        };

        self.teardown(attempt, plan).await;
        Ok(())
    }

    /// Schaltet das Mikrofon stumm bzw. wieder an, gibt den neuen Zustand zurück
    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        let (media, muted) = {
            let mut s = self.inner.session.lock();
            let media = s.local_media.clone().ok_or(CallError::NoActiveCall)?;
            s.muted = !s.muted;
            (media, s.muted)
        };

        for track in media.audio_tracks() {
            track.set_enabled(!muted);
        }
        tracing::debug!("Microphone {}", if muted { "muted" } else { "unmuted" });
        Ok(muted)
    }

    /// Schaltet die Kamera ab bzw. wieder an, gibt den neuen Zustand zurück
    pub fn toggle_video(&self) -> Result<bool, CallError> {
        let (media, disabled) = {
            let mut s = self.inner.session.lock();
            let media = s.local_media.clone().ok_or(CallError::NoActiveCall)?;
            s.video_disabled = !s.video_disabled;
            (media, s.video_disabled)
        };

        for track in media.video_tracks() {
            track.set_enabled(!disabled);
        }
        tracing::debug!("Camera {}", if disabled { "disabled" } else { "enabled" });
        Ok(disabled)
    }

    /// Manueller Verbindungs-Retry mit frischen Credentials
    pub async fn retry_connection(&self) -> Result<(), CallError> {
        let manager = {
            let s = self.inner.session.lock();
            if !s.status.is_active() {
                return Err(CallError::NoActiveCall);
            }
            s.manager.clone().ok_or(CallError::NoActiveCall)?
        };

        tracing::info!("Manual connection retry for call {}", manager.call_id());
        manager.retry_with_fresh_credentials().await?;
        Ok(())
    }

    /// Verarbeitet ein Host-Lifecycle Signal
    ///
    /// Gibt `true` zurück, wenn dadurch ein Anruf beendet wurde.
    pub async fn handle_host_signal(&self, signal: HostSignal) -> bool {
        if !signal.is_suspension() {
            return false;
        }

        if self.inner.ui_lock.is_engaged() {
            tracing::debug!("Ignoring {:?} while call UI lock is engaged", signal);
            return false;
        }

        let (attempt, plan) = {
            let s = self.inner.session.lock();
            if !s.status.is_active() {
                return false;
            }
            (
                s.attempt,
                EndPlan::local(EndReason::Suspended, s.local_end_status()),
            )
        };

        tracing::info!("Host {:?}, ending active call", signal);
        self.teardown(attempt, plan).await
    }

    /// Leitet Signale einer Host-Quelle an `handle_host_signal` weiter
    pub fn attach_suspend_source(&self, source: &dyn SuspendSignalSource) -> JoinHandle<()> {
        let mut rx = source.subscribe();
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(signal) => {
                        let Some(inner) = weak.upgrade() else { break };
                        CallEngine::from_inner(inner).handle_host_signal(signal).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Missed {} host signals", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // ========================================================================
    // SESSION SETUP
    // ========================================================================

    /// Reserviert die Session für einen neuen Attempt
    fn begin_attempt(&self, status: CallState, initiator: bool) -> Result<u64, CallError> {
        let attempt = {
            let mut s = self.inner.session.lock();
            if s.status != CallState::Idle {
                return Err(CallError::AlreadyInCall);
            }

            let attempt = self.inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            *s = Session {
                attempt,
                status,
                initiator,
                answered: !initiator,
                ..Default::default()
            };
            attempt
        };

        self.emit(EngineEvent::StatusChanged(status));
        Ok(attempt)
    }

    /// Übernimmt eine Ressource in die Session, falls der Attempt noch aktuell ist
    fn adopt(&self, attempt: u64, apply: impl FnOnce(&mut Session)) -> bool {
        let mut s = self.inner.session.lock();
        if !s.is_current(attempt) {
            return false;
        }
        apply(&mut s);
        true
    }

    /// Öffnet Transport und Peer Connection und startet die Session-Schleife
    async fn connect(
        &self,
        attempt: u64,
        record: &CallRecord,
        media: MediaHandle,
        initiator: bool,
    ) -> Result<(), CallError> {
        let inner = &self.inner;

        let (transport, inbound) = SignalingTransport::open(
            &record.id,
            &inner.user_id,
            inner.deps.broadcast.as_ref(),
            Arc::clone(&inner.deps.signals),
            inner.config.poll_interval(),
        )
        .await;
        let subscription = inner
            .deps
            .records
            .subscribe_records(RecordFilter::call(record.id.clone()));

        if !self.adopt(attempt, |s| s.transport = Some(Arc::clone(&transport))) {
            transport.close().await;
            return Err(CallError::Cancelled);
        }

        let (manager, peer_events) = PeerConnectionManager::start(
            ManagerOptions::from_config(&record.id, initiator, &inner.config),
            media,
            Arc::clone(&inner.deps.peers),
            Arc::clone(&inner.deps.ice),
            Arc::clone(&transport),
        )
        .await?;

        // Schleife unter dem Session-Lock starten, sonst überlebt sie einen Teardown
        let adopted = {
            let mut s = inner.session.lock();
            let current = s.is_current(attempt);
            if current {
                s.manager = Some(Arc::clone(&manager));
                self.spawn_session_loop(attempt, inbound, peer_events, subscription);
            }
            current
        };
        if !adopted {
            manager.close().await;
            return Err(CallError::Cancelled);
        }
        Ok(())
    }

    fn spawn_session_loop(
        &self,
        attempt: u64,
        mut inbound: mpsc::UnboundedReceiver<SignalEnvelope>,
        mut peer_events: mpsc::UnboundedReceiver<ManagerEvent>,
        mut records: RecordSubscription,
    ) {
        let weak = Arc::downgrade(&self.inner);

        self.inner.timers.lock().spawn("session", async move {
            loop {
                let event = tokio::select! {
                    Some(envelope) = inbound.recv() => LoopEvent::Signal(envelope),
                    Some(event) = peer_events.recv() => LoopEvent::Peer(event),
                    Some(event) = records.next() => LoopEvent::Record(event),
                    else => break,
                };

                let Some(inner) = weak.upgrade() else { break };
                CallEngine::from_inner(inner).dispatch(attempt, event).await;
            }
        });
    }

    /// Arm den Ring-Timer, solange der Versuch noch läuft
    fn schedule_ring_timeout(&self, attempt: u64) -> bool {
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.config.ring_timeout();

        // Session-Lock halten: ein Teardown dazwischen räumt den Timer sonst nicht ab
        let session = self.inner.session.lock();
        if !session.is_current(attempt) {
            return false;
        }
        self.inner.timers.lock().schedule("ring", timeout, async move {
            let Some(inner) = weak.upgrade() else { return };
            let engine = CallEngine::from_inner(inner);

            let status = {
                let s = engine.inner.session.lock();
                if !s.is_current(attempt) || s.status == CallState::Connected {
                    return;
                }
                s.local_end_status()
            };

            tracing::info!("No connection after {:?}, giving up", timeout);
            engine.spawn_teardown(attempt, EndPlan::local(EndReason::Timeout, status));
        });
        drop(session);
        true
    }

    async fn abort_attempt(&self, attempt: u64, initiator: bool, error: &CallError) {
        if !matches!(error, CallError::Cancelled) {
            tracing::error!("Call setup failed: {}", error);
            self.emit(EngineEvent::Error(error.to_string()));
        }
        self.teardown(attempt, EndPlan::aborted(initiator)).await;
    }

    // ========================================================================
    // SESSION EVENTS
    // ========================================================================

    async fn dispatch(&self, attempt: u64, event: LoopEvent) {
        if !self.inner.session.lock().is_current(attempt) {
            return;
        }

        match event {
            LoopEvent::Signal(envelope) => self.on_signal(attempt, envelope).await,
            LoopEvent::Peer(event) => self.on_manager_event(attempt, event),
            LoopEvent::Record(event) => self.on_record_event(attempt, event),
        }
    }

    async fn on_signal(&self, attempt: u64, envelope: SignalEnvelope) {
        match &envelope.payload {
            SignalPayload::Hangup => {
                tracing::info!("Remote hung up call {}", envelope.call_id);
                self.spawn_teardown(attempt, EndPlan::remote(EndReason::RemoteHangup));
                return;
            }
            SignalPayload::Ready { renegotiate: false } => self.mark_answered(attempt),
            _ => {}
        }

        let manager = self.inner.session.lock().manager.clone();
        if let Some(manager) = manager {
            if let Err(e) = manager.apply_signal(&envelope).await {
                tracing::warn!(
                    "Dropping {} for call {}: {}",
                    envelope.kind(),
                    envelope.call_id,
                    e
                );
            }
        }
    }

    fn on_manager_event(&self, attempt: u64, event: ManagerEvent) {
        match event {
            ManagerEvent::ConnectionState(state) => {
                let promoted = {
                    let mut s = self.inner.session.lock();
                    if s.attempt != attempt {
                        return;
                    }
                    s.connection_state = Some(state);
                    if state == PeerState::Connected && s.status != CallState::Connected {
                        s.status = CallState::Connected;
                        s.answered = true;
                        true
                    } else {
                        false
                    }
                };

                self.emit(EngineEvent::ConnectionStateChanged(state));
                if promoted {
                    self.inner.timers.lock().cancel("ring");
                    tracing::info!("Call connected");
                    self.emit(EngineEvent::StatusChanged(CallState::Connected));
                }
            }
            ManagerEvent::RemoteStream(stream) => {
                self.inner.session.lock().remote_media = Some(Arc::clone(&stream));
                self.emit(EngineEvent::RemoteStream(stream));
            }
            ManagerEvent::Fatal => {
                self.emit(EngineEvent::Error("Connection lost".to_string()));
                let status = self.inner.session.lock().local_end_status();
                self.spawn_teardown(attempt, EndPlan::local(EndReason::ConnectionLost, status));
            }
        }
    }

    fn on_record_event(&self, attempt: u64, event: RecordEvent) {
        let record = event.record().clone();
        self.inner.session.lock().record = Some(record.clone());

        match record.status {
            CallStatus::Ringing => {}
            CallStatus::Answered => self.mark_answered(attempt),
            CallStatus::Declined | CallStatus::Ended | CallStatus::Missed => {
                tracing::info!("Call {} is {} remotely", record.id, record.status);
                self.spawn_teardown(attempt, EndPlan::remote(EndReason::RemoteStatus(record.status)));
            }
        }
    }

    /// Angerufener hat angenommen: calling → ringing
    fn mark_answered(&self, attempt: u64) {
        let changed = {
            let mut s = self.inner.session.lock();
            if !s.is_current(attempt) {
                return;
            }
            s.answered = true;
            if s.initiator && s.status == CallState::Calling {
                s.status = CallState::Ringing;
                true
            } else {
                false
            }
        };

        if changed {
            tracing::info!("Callee answered");
            self.emit(EngineEvent::StatusChanged(CallState::Ringing));
        }
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Teardown auf einem eigenen Task
    ///
    /// Der Teardown bricht alle Timer und die Session-Schleife ab und darf
    /// deshalb nicht auf einem von ihnen laufen.
    fn spawn_teardown(&self, attempt: u64, plan: EndPlan) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.teardown(attempt, plan).await;
        });
    }

    /// Baut die Session für `attempt` ab (idempotent)
    ///
    /// Gibt `true` zurück, wenn dieser Aufruf den Abbau durchgeführt hat.
    async fn teardown(&self, attempt: u64, plan: EndPlan) -> bool {
        if self.inner.tearing_down.swap(true, Ordering::SeqCst) {
            tracing::debug!("Teardown already running, ignoring {:?}", plan.reason);
            return false;
        }

        let parts = {
            let mut s = self.inner.session.lock();
            if !s.is_current(attempt) {
                None
            } else {
                s.status = CallState::Ended;
                Some((
                    s.record.clone(),
                    s.transport.take(),
                    s.manager.take(),
                    s.local_media.take(),
                ))
            }
        };
        let Some((record, transport, manager, local_media)) = parts else {
            self.inner.tearing_down.store(false, Ordering::SeqCst);
            return false;
        };

        let call_id = record.as_ref().map(|r| r.id.clone());
        tracing::info!("Ending call {:?} ({:?})", call_id, plan.reason);
        self.emit(EngineEvent::StatusChanged(CallState::Ended));

        self.inner.timers.lock().cancel_all();

        if plan.hangup {
            if let Some(transport) = &transport {
                if let Err(e) = transport.send(SignalPayload::Hangup).await {
                    tracing::warn!("Failed to send hangup: {}", e);
                }
            }
        }
        if let (Some(status), Some(record)) = (plan.record_status, &record) {
            self.finalize_record(&record.id, status).await;
        }

        if let Some(transport) = transport {
            transport.close().await;
        }
        if let Some(manager) = manager {
            manager.close().await;
        }
        if let Some(media) = local_media {
            media.stop_all();
        }

        self.inner.ui_lock.release();
        {
            let mut s = self.inner.session.lock();
            *s = Session {
                attempt: s.attempt,
                ..Default::default()
            };
        }
        self.inner.tearing_down.store(false, Ordering::SeqCst);

        self.emit(EngineEvent::CallEnded {
            call_id,
            reason: plan.reason,
        });
        self.emit(EngineEvent::StatusChanged(CallState::Idle));
        true
    }

    /// Schreibt einen Endstatus; bereits fortgeschrittene Records werden passend abgeschlossen
    async fn finalize_record(&self, id: &str, status: CallStatus) {
        let records = &self.inner.deps.records;

        match records
            .update_record(id, CallRecordUpdate::status(status))
            .await
        {
            Ok(_) => {}
            Err(StoreError::InvalidTransition { from, .. }) => {
                let fallback = match from {
                    CallStatus::Ringing => Some(CallStatus::Missed),
                    CallStatus::Answered => Some(CallStatus::Ended),
                    _ => None,
                };
                match fallback {
                    Some(next) if next != status => {
                        if let Err(e) = records
                            .update_record(id, CallRecordUpdate::status(next))
                            .await
                        {
                            tracing::warn!("Failed to close call record {}: {}", id, e);
                        }
                    }
                    _ => tracing::debug!("Call record {} already {}", id, from),
                }
            }
            Err(e) => tracing::warn!("Failed to update call record {}: {}", id, e),
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.inner.event_tx.send(event);
    }
}

impl CallAvailability for CallEngine {
    fn is_busy(&self) -> bool {
        self.status() != CallState::Idle || self.inner.ui_lock.is_engaged()
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("user_id", &self.inner.user_id)
            .field("status", &self.status())
            .field("is_muted", &self.is_muted())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
