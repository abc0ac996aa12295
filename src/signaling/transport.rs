//! Dual-Path Signaling Transport
//!
//! Jede ausgehende Nachricht geht über zwei unabhängige Pfade:
//! 1. Broadcast-Kanal pro Call (schnell, kann beim Attach verloren gehen)
//! 2. Durabler Store, vom Empfänger alle ~500ms gepollt (langsam, garantiert)
//!
//! Beide Pfade speisen dieselbe `deliver`-Funktion, die Duplikate verwirft.

use super::broadcast::{BroadcastChannel, BroadcastTopic};
use super::messages::{DedupeKey, SignalEnvelope, SignalPayload};
use super::SignalingError;
use crate::database::SignalStore;
use crate::timers::Timers;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Broadcast-Topic eines Calls
pub fn call_topic(call_id: &str) -> String {
    format!("call:{}", call_id)
}

// ============================================================================
// INBOUND
// ============================================================================

/// Gemeinsamer Eingang beider Pfade
struct Inbound {
    call_id: String,
    self_id: String,
    seen: Mutex<HashSet<DedupeKey>>,
    tx: mpsc::UnboundedSender<SignalEnvelope>,
}

impl Inbound {
    /// Leitet eine Nachricht genau einmal weiter
    fn deliver(&self, envelope: SignalEnvelope, path: &'static str) -> bool {
        if envelope.call_id != self.call_id || envelope.sender_id == self.self_id {
            return false;
        }

        if !self.seen.lock().insert(envelope.dedupe_key()) {
            tracing::trace!(
                "Duplicate {} {} via {}",
                envelope.kind(),
                envelope.message_id,
                path
            );
            return false;
        }

        tracing::debug!(
            "Received {} for call {} via {}",
            envelope.kind(),
            envelope.call_id,
            path
        );
        self.tx.send(envelope).is_ok()
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

pub struct SignalingTransport {
    call_id: String,
    self_id: String,
    store: Arc<dyn SignalStore>,
    topic: Option<Box<dyn BroadcastTopic>>,
    inbound: Arc<Inbound>,
    timers: Mutex<Timers>,
    closed: AtomicBool,
}

impl SignalingTransport {
    /// Öffnet beide Pfade für `call_id`
    ///
    /// Ein fehlgeschlagenes Broadcast-Abo ist nicht fatal, der Poll-Pfad
    /// läuft in jedem Fall.
    pub async fn open(
        call_id: &str,
        self_id: &str,
        broadcast: &dyn BroadcastChannel,
        store: Arc<dyn SignalStore>,
        poll_interval: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SignalEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inbound = Arc::new(Inbound {
            call_id: call_id.to_string(),
            self_id: self_id.to_string(),
            seen: Mutex::new(HashSet::new()),
            tx,
        });
        let mut timers = Timers::new();

        let topic = match broadcast.open(&call_topic(call_id)).await {
            Ok(topic) => {
                // Handler anhängen, bevor das Abo bestätigt wird
                let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<String>();
                topic.on_message(raw_tx);

                let sink = Arc::clone(&inbound);
                timers.spawn("broadcast", async move {
                    while let Some(text) = raw_rx.recv().await {
                        match SignalEnvelope::from_json(&text) {
                            Ok(envelope) => {
                                sink.deliver(envelope, "broadcast");
                            }
                            Err(e) => tracing::warn!("Dropping malformed broadcast: {}", e),
                        }
                    }
                });

                if let Err(e) = topic.subscribe().await {
                    tracing::warn!(
                        "Broadcast subscription for {} failed, relying on queue: {}",
                        call_id,
                        e
                    );
                }
                Some(topic)
            }
            Err(e) => {
                tracing::warn!("Broadcast channel unavailable for {}: {}", call_id, e);
                None
            }
        };

        let poll_store = Arc::clone(&store);
        let poll_sink = Arc::clone(&inbound);
        timers.spawn("poll", async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = Self::poll_once(poll_store.as_ref(), &poll_sink).await {
                    tracing::warn!("Signal queue poll failed: {}", e);
                }
            }
        });

        tracing::info!("Signaling transport open for call {}", call_id);

        let transport = Arc::new(Self {
            call_id: call_id.to_string(),
            self_id: self_id.to_string(),
            store,
            topic,
            inbound,
            timers: Mutex::new(timers),
            closed: AtomicBool::new(false),
        });
        (transport, rx)
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Liest den durablen Pfad sofort (z.B. Offer, das vor dem Abo ankam)
    pub async fn drain_queue(&self) -> Result<usize, SignalingError> {
        Self::poll_once(self.store.as_ref(), &self.inbound).await
    }

    async fn poll_once(store: &dyn SignalStore, inbound: &Inbound) -> Result<usize, SignalingError> {
        let rows = store
            .pending_signals(&inbound.call_id, &inbound.self_id)
            .await?;

        let mut delivered = 0;
        for row in rows {
            match SignalEnvelope::from_json(&row.payload) {
                Ok(envelope) => {
                    if inbound.deliver(envelope, "queue") {
                        delivered += 1;
                    }
                }
                Err(e) => tracing::warn!("Dropping unreadable signal row {}: {}", row.id, e),
            }
            store.mark_processed(row.id).await?;
        }
        Ok(delivered)
    }

    /// Sendet eine neue Nachricht über beide Pfade
    pub async fn send(&self, payload: SignalPayload) -> Result<SignalEnvelope, SignalingError> {
        let envelope = SignalEnvelope::new(&self.call_id, &self.self_id, payload);
        self.transmit(&envelope).await?;
        Ok(envelope)
    }

    /// Wiederholt eine bereits gesendete Nachricht mit derselben ID
    pub async fn resend(&self, envelope: &SignalEnvelope) -> Result<(), SignalingError> {
        self.transmit(envelope).await
    }

    async fn transmit(&self, envelope: &SignalEnvelope) -> Result<(), SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::NotConnected);
        }

        let json = envelope.to_json()?;

        if let Some(topic) = &self.topic {
            if let Err(e) = topic.send(json.clone()).await {
                tracing::warn!(
                    "Broadcast delivery of {} failed, queue remains authoritative: {}",
                    envelope.kind(),
                    e
                );
            }
        }

        self.store
            .append_signal(&self.call_id, &self.self_id, envelope.kind(), &json)
            .await?;

        tracing::debug!("Sent {} for call {}", envelope.kind(), self.call_id);
        Ok(())
    }

    /// Legt eine einzelne Nachricht nur im durablen Pfad ab, ohne Transport zu öffnen
    pub async fn post(
        store: &dyn SignalStore,
        call_id: &str,
        sender_id: &str,
        payload: SignalPayload,
    ) -> Result<SignalEnvelope, SignalingError> {
        let envelope = SignalEnvelope::new(call_id, sender_id, payload);
        store
            .append_signal(call_id, sender_id, envelope.kind(), &envelope.to_json()?)
            .await?;
        Ok(envelope)
    }

    /// Stoppt Poller und Broadcast-Abo
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.timers.lock().cancel_all();
        if let Some(topic) = &self.topic {
            topic.close().await;
        }
        tracing::info!("Signaling transport closed for call {}", self.call_id);
    }

    /// Ob der Poller noch läuft
    pub fn is_polling(&self) -> bool {
        self.timers.lock().is_pending("poll")
    }
}

impl std::fmt::Debug for SignalingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingTransport")
            .field("call_id", &self.call_id)
            .field("self_id", &self.self_id)
            .field("broadcast", &self.topic.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{SignalKind, SqliteCallStore};
    use crate::signaling::{LocalBroadcastHub, MessageHandler};
    use async_trait::async_trait;

    const POLL: Duration = Duration::from_millis(500);

    /// Kanal, dessen Abo nie bestätigt wird
    struct RejectingChannel;

    struct RejectingTopic;

    #[async_trait]
    impl BroadcastChannel for RejectingChannel {
        async fn open(&self, _topic: &str) -> Result<Box<dyn BroadcastTopic>, SignalingError> {
            Ok(Box::new(RejectingTopic))
        }
    }

    #[async_trait]
    impl BroadcastTopic for RejectingTopic {
        fn on_message(&self, _handler: MessageHandler) {}

        async fn subscribe(&self) -> Result<(), SignalingError> {
            Err(SignalingError::SubscribeFailed("channel refused".to_string()))
        }

        async fn send(&self, _message: String) -> Result<(), SignalingError> {
            Err(SignalingError::NotConnected)
        }

        async fn close(&self) {}
    }

    async fn pair(
        hub: &LocalBroadcastHub,
        store: &Arc<SqliteCallStore>,
    ) -> (
        (Arc<SignalingTransport>, mpsc::UnboundedReceiver<SignalEnvelope>),
        (Arc<SignalingTransport>, mpsc::UnboundedReceiver<SignalEnvelope>),
    ) {
        let x = SignalingTransport::open("call-1", "x", hub, store.clone(), POLL).await;
        let y = SignalingTransport::open("call-1", "y", hub, store.clone(), POLL).await;
        (x, y)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SignalEnvelope>) -> Vec<SignalEnvelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_paths_deliver_once() {
        let hub = LocalBroadcastHub::new();
        let store = Arc::new(SqliteCallStore::open_in_memory().unwrap());
        let ((x, mut x_rx), (_y, mut y_rx)) = pair(&hub, &store).await;

        x.send(SignalPayload::Hangup).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let received = drain(&mut y_rx);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind(), SignalKind::Hangup);

        // Eigene Nachrichten kommen nicht zurück
        assert!(drain(&mut x_rx).is_empty());
        // Poller hat die Zeile als verarbeitet markiert
        assert!(store.pending_signals("call-1", "y").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_is_deduplicated() {
        let hub = LocalBroadcastHub::new();
        let store = Arc::new(SqliteCallStore::open_in_memory().unwrap());
        let ((x, _x_rx), (_y, mut y_rx)) = pair(&hub, &store).await;

        let envelope = x.send(SignalPayload::Ready { renegotiate: false }).await.unwrap();
        x.resend(&envelope).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(drain(&mut y_rx).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_subscriber_reads_queue() {
        let hub = LocalBroadcastHub::new();
        let store = Arc::new(SqliteCallStore::open_in_memory().unwrap());

        let (x, _x_rx) = SignalingTransport::open("call-1", "x", &hub, store.clone(), POLL).await;
        x.send(SignalPayload::Offer {
            sdp: "v=0".into(),
            ice_restart: false,
            relay_only: false,
            generation: 1,
        })
        .await
        .unwrap();

        let (y, mut y_rx) = SignalingTransport::open("call-1", "y", &hub, store.clone(), POLL).await;
        assert_eq!(y.drain_queue().await.unwrap(), 1);

        let received = drain(&mut y_rx);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind(), SignalKind::Offer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_failure_is_not_fatal() {
        let hub = LocalBroadcastHub::new();
        let store = Arc::new(SqliteCallStore::open_in_memory().unwrap());
        let ((x, _x_rx), (_y, mut y_rx)) = pair(&hub, &store).await;

        hub.set_failing(true);
        x.send(SignalPayload::Hangup).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(drain(&mut y_rx).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_subscription_falls_back_to_polling() {
        let store = Arc::new(SqliteCallStore::open_in_memory().unwrap());
        let (y, mut y_rx) =
            SignalingTransport::open("call-1", "y", &RejectingChannel, store.clone(), POLL).await;
        assert!(y.is_polling());

        let sent = SignalingTransport::post(store.as_ref(), "call-1", "x", SignalPayload::Hangup)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        let received = drain(&mut y_rx);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message_id, sent.message_id);
        assert_eq!(received[0].kind(), SignalKind::Hangup);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_rows_are_dropped() {
        let hub = LocalBroadcastHub::new();
        let store = Arc::new(SqliteCallStore::open_in_memory().unwrap());
        store
            .append_signal("call-1", "x", SignalKind::Offer, "not json")
            .await
            .unwrap();

        let (y, mut y_rx) = SignalingTransport::open("call-1", "y", &hub, store.clone(), POLL).await;
        assert_eq!(y.drain_queue().await.unwrap(), 0);
        assert!(drain(&mut y_rx).is_empty());
        assert!(store.pending_signals("call-1", "y").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_polling() {
        let hub = LocalBroadcastHub::new();
        let store = Arc::new(SqliteCallStore::open_in_memory().unwrap());
        let ((x, _x_rx), (y, mut y_rx)) = pair(&hub, &store).await;

        assert!(y.is_polling());
        y.close().await;
        assert!(!y.is_polling());

        x.send(SignalPayload::Hangup).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(drain(&mut y_rx).is_empty());
        assert!(matches!(
            y.send(SignalPayload::Hangup).await,
            Err(SignalingError::NotConnected)
        ));
    }
}
