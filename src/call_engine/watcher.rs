//! Incoming Call Watcher
//!
//! Beobachtet neue Call Records mit dem lokalen User als Angerufenem,
//! unabhängig davon, ob gerade eine Session läuft. Ein eingehender Anruf
//! wird wieder entfernt, sobald sein Record nicht mehr `ringing` ist.

use crate::database::{CallRecord, CallRecordStore, CallStatus, RecordEvent, RecordFilter};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

// ============================================================================
// COLLABORATORS
// ============================================================================

/// Anzeige-Informationen zum Anrufer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerProfile {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl CallerProfile {
    /// Platzhalter, wenn kein Profil gefunden wurde
    pub fn fallback(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: user_id.to_string(),
            avatar_url: None,
        }
    }
}

#[async_trait]
pub trait ProfileResolver: Send + Sync {
    async fn resolve(&self, user_id: &str) -> Option<CallerProfile>;
}

/// Ob der lokale User gerade keinen neuen Anruf annehmen kann
pub trait CallAvailability: Send + Sync {
    fn is_busy(&self) -> bool;
}

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct IncomingCall {
    pub record: CallRecord,
    pub caller: CallerProfile,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatcherEvent {
    Incoming(IncomingCall),
    /// Eingehender Anruf wurde angenommen, abgelehnt oder ist verfallen
    Cleared { call_id: String, status: CallStatus },
}

// ============================================================================
// WATCHER
// ============================================================================

pub struct IncomingCallWatcher {
    inner: Arc<WatcherInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct WatcherInner {
    user_id: String,
    records: Arc<dyn CallRecordStore>,
    profiles: Arc<dyn ProfileResolver>,
    availability: Arc<dyn CallAvailability>,
    current: Mutex<Option<IncomingCall>>,
    event_tx: broadcast::Sender<WatcherEvent>,
}

impl IncomingCallWatcher {
    pub fn new(
        user_id: &str,
        records: Arc<dyn CallRecordStore>,
        profiles: Arc<dyn ProfileResolver>,
        availability: Arc<dyn CallAvailability>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(WatcherInner {
                user_id: user_id.to_string(),
                records,
                profiles,
                availability,
                current: Mutex::new(None),
                event_tx,
            }),
            task: Mutex::new(None),
        }
    }

    /// Startet die Beobachtung (idempotent)
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let mut subscription = inner
            .records
            .subscribe_records(RecordFilter::callee(inner.user_id.clone()));

        tracing::info!("Watching incoming calls for {}", inner.user_id);
        *task = Some(tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                inner.handle(event).await;
            }
            tracing::debug!("Record stream closed, incoming call watcher stops");
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.inner.current.lock().take();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatcherEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Aktuell klingelnder Anruf
    pub fn current(&self) -> Option<IncomingCall> {
        self.inner.current.lock().clone()
    }
}

impl Drop for IncomingCallWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl WatcherInner {
    async fn handle(&self, event: RecordEvent) {
        match event {
            RecordEvent::Created(record) => self.on_created(record).await,
            RecordEvent::Updated(record) => self.on_updated(record),
        }
    }

    async fn on_created(&self, record: CallRecord) {
        if record.status != CallStatus::Ringing || record.caller_id == self.user_id {
            return;
        }

        if self.availability.is_busy() {
            tracing::info!("Ignoring call {} from {}: busy", record.id, record.caller_id);
            return;
        }

        let caller = match self.profiles.resolve(&record.caller_id).await {
            Some(profile) => profile,
            None => {
                tracing::debug!("No profile for {}, using fallback", record.caller_id);
                CallerProfile::fallback(&record.caller_id)
            }
        };

        tracing::info!(
            "Incoming {} call {} from {}",
            record.kind.as_str(),
            record.id,
            caller.display_name
        );
        let incoming = IncomingCall { record, caller };
        *self.current.lock() = Some(incoming.clone());
        let _ = self.event_tx.send(WatcherEvent::Incoming(incoming));
    }

    fn on_updated(&self, record: CallRecord) {
        if record.status == CallStatus::Ringing {
            return;
        }

        let cleared = {
            let mut current = self.current.lock();
            let matches = current
                .as_ref()
                .is_some_and(|incoming| incoming.record.id == record.id);
            if matches {
                current.take();
            }
            matches
        };

        if cleared {
            tracing::debug!("Incoming call {} cleared ({})", record.id, record.status);
            let _ = self.event_tx.send(WatcherEvent::Cleared {
                call_id: record.id,
                status: record.status,
            });
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{CallKind, CallRecordUpdate, NewCallRecord, SqliteCallStore};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Directory(HashMap<String, String>);

    #[async_trait]
    impl ProfileResolver for Directory {
        async fn resolve(&self, user_id: &str) -> Option<CallerProfile> {
            self.0.get(user_id).map(|name| CallerProfile {
                user_id: user_id.to_string(),
                display_name: name.clone(),
                avatar_url: None,
            })
        }
    }

    #[derive(Default)]
    struct Busy(AtomicBool);

    impl CallAvailability for Busy {
        fn is_busy(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Fixture {
        store: Arc<SqliteCallStore>,
        busy: Arc<Busy>,
        watcher: IncomingCallWatcher,
        events: broadcast::Receiver<WatcherEvent>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteCallStore::open_in_memory().unwrap());
        let busy = Arc::new(Busy::default());
        let mut names = HashMap::new();
        names.insert("alice".to_string(), "Alice".to_string());

        let watcher = IncomingCallWatcher::new(
            "bob",
            store.clone(),
            Arc::new(Directory(names)),
            busy.clone(),
        );
        watcher.start();
        let events = watcher.subscribe();
        Fixture {
            store,
            busy,
            watcher,
            events,
        }
    }

    async fn ring(store: &SqliteCallStore, caller: &str, callee: &str) -> CallRecord {
        store
            .create_record(NewCallRecord {
                caller_id: caller.into(),
                callee_id: callee.into(),
                conversation_id: None,
                kind: CallKind::Audio,
            })
            .await
            .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_incoming_call_resolves_profile() {
        let mut f = fixture();
        let record = ring(&f.store, "alice", "bob").await;
        settle().await;

        match f.events.try_recv().unwrap() {
            WatcherEvent::Incoming(incoming) => {
                assert_eq!(incoming.record.id, record.id);
                assert_eq!(incoming.caller.display_name, "Alice");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(f.watcher.current().is_some());
    }

    #[tokio::test]
    async fn test_unknown_caller_falls_back_to_id() {
        let mut f = fixture();
        ring(&f.store, "carol", "bob").await;
        settle().await;

        let Ok(WatcherEvent::Incoming(incoming)) = f.events.try_recv() else {
            panic!("no incoming call");
        };
        assert_eq!(incoming.caller, CallerProfile::fallback("carol"));
    }

    #[tokio::test]
    async fn test_ignores_other_callees_and_busy_state() {
        let mut f = fixture();
        ring(&f.store, "alice", "dave").await;

        f.busy.0.store(true, Ordering::SeqCst);
        ring(&f.store, "alice", "bob").await;
        settle().await;

        assert!(f.events.try_recv().is_err());
        assert!(f.watcher.current().is_none());
    }

    #[tokio::test]
    async fn test_cleared_when_any_party_resolves() {
        let mut f = fixture();
        let record = ring(&f.store, "alice", "bob").await;
        settle().await;
        let _ = f.events.try_recv();

        f.store
            .update_record(&record.id, CallRecordUpdate::status(CallStatus::Missed))
            .await
            .unwrap();
        settle().await;

        assert_eq!(
            f.events.try_recv().unwrap(),
            WatcherEvent::Cleared {
                call_id: record.id,
                status: CallStatus::Missed,
            }
        );
        assert!(f.watcher.current().is_none());
    }

    #[tokio::test]
    async fn test_stop_ends_watching() {
        let mut f = fixture();
        f.watcher.stop();
        ring(&f.store, "alice", "bob").await;
        settle().await;
        assert!(f.events.try_recv().is_err());
    }
}
