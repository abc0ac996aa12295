//! Calls Database
//!
//! SQLite-Implementierung von Call-Record-Store und Signaling-Store.
//! Änderungen an Call Records werden zusätzlich per Broadcast verteilt,
//! damit Watcher und Engine sie abonnieren können.

use super::records::*;
use super::{CallRecordStore, SignalStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

/// Kapazität des Record-Event-Kanals
const EVENT_CAPACITY: usize = 256;

const RECORD_COLUMNS: &str =
    "id, caller_id, callee_id, conversation_id, kind, status, started_at, ended_at";

// ============================================================================
// DATABASE
// ============================================================================

/// SQLite-Datenbank für Calls (Thread-safe durch Mutex)
pub struct SqliteCallStore {
    conn: Mutex<Connection>,
    events: broadcast::Sender<RecordEvent>,
}

impl SqliteCallStore {
    /// Öffnet oder erstellt die Datenbank im App-Datenverzeichnis
    pub fn open() -> Result<Self, StoreError> {
        let db_path = Self::default_database_path()?;
        Self::open_at(&db_path)
    }

    /// Öffnet oder erstellt die Datenbank unter `path`
    pub fn open_at(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening call database at {:?}", path);
        Self::with_connection(Connection::open(path)?)
    }

    /// In-Memory Datenbank (Tests, In-Process Demo)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let db = Self {
            conn: Mutex::new(conn),
            events,
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Ermittelt den Pfad zur Datenbank-Datei
    fn default_database_path() -> Result<PathBuf, StoreError> {
        let proj_dirs = directories::ProjectDirs::from("com", "callcore", "call-core")
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine app data directory",
                )
            })?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("calls.db");
        Ok(path)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS call_records (
                id TEXT PRIMARY KEY,
                caller_id TEXT NOT NULL,
                callee_id TEXT NOT NULL,
                conversation_id TEXT,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_call_records_callee ON call_records(callee_id);

            CREATE TABLE IF NOT EXISTS signal_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                call_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_signal_messages_pending
                ON signal_messages(call_id, processed);
            "#,
        )?;
        Ok(())
    }

    fn record_by_id(conn: &Connection, id: &str) -> Result<CallRecord, StoreError> {
        conn.query_row(
            &format!("SELECT {} FROM call_records WHERE id = ?1", RECORD_COLUMNS),
            params![id],
            RawRecord::from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::RecordNotFound(id.to_string()))?
        .into_record()
    }

    fn publish(&self, event: RecordEvent) {
        // Keine Abonnenten ist kein Fehler
        let _ = self.events.send(event);
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

/// Zeile vor der Validierung der Enum-/Zeitspalten
struct RawRecord {
    id: String,
    caller_id: String,
    callee_id: String,
    conversation_id: Option<String>,
    kind: String,
    status: String,
    started_at: String,
    ended_at: Option<String>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            caller_id: row.get(1)?,
            callee_id: row.get(2)?,
            conversation_id: row.get(3)?,
            kind: row.get(4)?,
            status: row.get(5)?,
            started_at: row.get(6)?,
            ended_at: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<CallRecord, StoreError> {
        Ok(CallRecord {
            kind: CallKind::parse(&self.kind)
                .ok_or_else(|| StoreError::Corrupt(format!("call kind '{}'", self.kind)))?,
            status: CallStatus::parse(&self.status)
                .ok_or_else(|| StoreError::Corrupt(format!("call status '{}'", self.status)))?,
            started_at: parse_timestamp(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_timestamp).transpose()?,
            id: self.id,
            caller_id: self.caller_id,
            callee_id: self.callee_id,
            conversation_id: self.conversation_id,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", value, e)))
}

fn signal_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, String, String, bool, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get::<_, i32>(5)? != 0,
        row.get(6)?,
    ))
}

// ============================================================================
// CALL RECORD STORE
// ============================================================================

#[async_trait]
impl CallRecordStore for SqliteCallStore {
    async fn create_record(&self, new: NewCallRecord) -> Result<CallRecord, StoreError> {
        let record = CallRecord {
            id: uuid::Uuid::new_v4().to_string(),
            caller_id: new.caller_id,
            callee_id: new.callee_id,
            conversation_id: new.conversation_id,
            kind: new.kind,
            status: CallStatus::Ringing,
            started_at: Utc::now(),
            ended_at: None,
        };

        {
            let conn = self.conn.lock();
            conn.execute(
                r#"
                INSERT INTO call_records
                    (id, caller_id, callee_id, conversation_id, kind, status, started_at, ended_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)
                "#,
                params![
                    record.id,
                    record.caller_id,
                    record.callee_id,
                    record.conversation_id,
                    record.kind.as_str(),
                    record.status.as_str(),
                    record.started_at.to_rfc3339(),
                ],
            )?;
        }

        tracing::debug!("Created call record {}", record.id);
        self.publish(RecordEvent::Created(record.clone()));
        Ok(record)
    }

    async fn update_record(
        &self,
        id: &str,
        update: CallRecordUpdate,
    ) -> Result<CallRecord, StoreError> {
        let updated = {
            let conn = self.conn.lock();
            let current = Self::record_by_id(&conn, id)?;

            if current.status == update.status {
                return Ok(current);
            }
            if !current.status.can_transition_to(update.status) {
                return Err(StoreError::InvalidTransition {
                    from: current.status,
                    to: update.status,
                });
            }

            let started_at = update.started_at.unwrap_or(current.started_at);
            let ended_at = match update.ended_at {
                Some(ts) => Some(ts),
                None if update.status.is_terminal() => Some(Utc::now()),
                None => current.ended_at,
            };

            conn.execute(
                r#"
                UPDATE call_records
                SET status = ?2, started_at = ?3, ended_at = ?4
                WHERE id = ?1
                "#,
                params![
                    id,
                    update.status.as_str(),
                    started_at.to_rfc3339(),
                    ended_at.map(|ts| ts.to_rfc3339()),
                ],
            )?;

            CallRecord {
                status: update.status,
                started_at,
                ended_at,
                ..current
            }
        };

        tracing::debug!("Call record {} -> {}", id, updated.status);
        self.publish(RecordEvent::Updated(updated.clone()));
        Ok(updated)
    }

    async fn get_record(&self, id: &str) -> Result<CallRecord, StoreError> {
        let conn = self.conn.lock();
        Self::record_by_id(&conn, id)
    }

    fn record_events(&self) -> broadcast::Receiver<RecordEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// SIGNAL STORE
// ============================================================================

#[async_trait]
impl SignalStore for SqliteCallStore {
    async fn append_signal(
        &self,
        call_id: &str,
        sender_id: &str,
        kind: SignalKind,
        payload: &str,
    ) -> Result<SignalMessage, StoreError> {
        let created_at = Utc::now();
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO signal_messages (call_id, sender_id, kind, payload, processed, created_at)
            VALUES (?1, ?2, ?3, ?4, 0, ?5)
            "#,
            params![call_id, sender_id, kind.as_str(), payload, created_at.to_rfc3339()],
        )?;

        Ok(SignalMessage {
            id: conn.last_insert_rowid(),
            call_id: call_id.to_string(),
            sender_id: sender_id.to_string(),
            kind,
            payload: payload.to_string(),
            processed: false,
            created_at,
        })
    }

    async fn pending_signals(
        &self,
        call_id: &str,
        exclude_sender: &str,
    ) -> Result<Vec<SignalMessage>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, call_id, sender_id, kind, payload, processed, created_at
            FROM signal_messages
            WHERE call_id = ?1 AND processed = 0 AND sender_id != ?2
            ORDER BY id ASC
            "#,
        )?;

        let rows = stmt
            .query_map(params![call_id, exclude_sender], signal_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, call_id, sender_id, kind, payload, processed, created_at)| {
                Ok(SignalMessage {
                    id,
                    kind: SignalKind::parse(&kind)
                        .ok_or_else(|| StoreError::Corrupt(format!("signal kind '{}'", kind)))?,
                    created_at: parse_timestamp(&created_at)?,
                    call_id,
                    sender_id,
                    payload,
                    processed,
                })
            })
            .collect()
    }

    async fn mark_processed(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE signal_messages SET processed = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::RecordFilter;

    fn new_call(caller: &str, callee: &str) -> NewCallRecord {
        NewCallRecord {
            caller_id: caller.to_string(),
            callee_id: callee.to_string(),
            conversation_id: Some("conv-1".to_string()),
            kind: CallKind::Video,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_record() {
        let db = SqliteCallStore::open_in_memory().unwrap();
        let record = db.create_record(new_call("alice", "bob")).await.unwrap();

        assert_eq!(record.status, CallStatus::Ringing);
        assert!(record.ended_at.is_none());

        let loaded = db.get_record(&record.id).await.unwrap();
        assert_eq!(loaded.caller_id, "alice");
        assert_eq!(loaded.conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(loaded.kind, CallKind::Video);
    }

    #[tokio::test]
    async fn test_terminal_update_sets_ended_at() {
        let db = SqliteCallStore::open_in_memory().unwrap();
        let record = db.create_record(new_call("alice", "bob")).await.unwrap();

        let answered = db
            .update_record(&record.id, CallRecordUpdate::status(CallStatus::Answered))
            .await
            .unwrap();
        assert!(answered.ended_at.is_none());

        let ended = db
            .update_record(&record.id, CallRecordUpdate::status(CallStatus::Ended))
            .await
            .unwrap();
        assert!(ended.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_rejects_non_monotonic_update() {
        let db = SqliteCallStore::open_in_memory().unwrap();
        let record = db.create_record(new_call("alice", "bob")).await.unwrap();
        db.update_record(&record.id, CallRecordUpdate::status(CallStatus::Missed))
            .await
            .unwrap();

        let err = db
            .update_record(&record.id, CallRecordUpdate::status(CallStatus::Answered))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_repeated_status_is_silent_noop() {
        let db = SqliteCallStore::open_in_memory().unwrap();
        let record = db.create_record(new_call("alice", "bob")).await.unwrap();
        let mut events = db.record_events();

        db.update_record(&record.id, CallRecordUpdate::status(CallStatus::Declined))
            .await
            .unwrap();
        db.update_record(&record.id, CallRecordUpdate::status(CallStatus::Declined))
            .await
            .unwrap();

        assert!(matches!(events.try_recv(), Ok(RecordEvent::Updated(_))));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_update_unknown_record() {
        let db = SqliteCallStore::open_in_memory().unwrap();
        let err = db
            .update_record("nope", CallRecordUpdate::status(CallStatus::Ended))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RecordNotFound(_)));
    }

    #[tokio::test]
    async fn test_subscription_filters_by_callee() {
        let db = SqliteCallStore::open_in_memory().unwrap();
        let mut sub = db.subscribe_records(RecordFilter::callee("bob"));

        db.create_record(new_call("alice", "carol")).await.unwrap();
        let for_bob = db.create_record(new_call("alice", "bob")).await.unwrap();

        match sub.next().await {
            Some(RecordEvent::Created(record)) => assert_eq!(record.id, for_bob.id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pending_signals_filter_and_order() {
        let db = SqliteCallStore::open_in_memory().unwrap();
        db.append_signal("call-1", "alice", SignalKind::Offer, "{}")
            .await
            .unwrap();
        db.append_signal("call-1", "bob", SignalKind::Ready, "{}")
            .await
            .unwrap();
        let second = db
            .append_signal("call-1", "alice", SignalKind::IceCandidate, "{}")
            .await
            .unwrap();
        db.append_signal("call-2", "alice", SignalKind::Offer, "{}")
            .await
            .unwrap();

        let pending = db.pending_signals("call-1", "bob").await.unwrap();
        let kinds: Vec<_> = pending.iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![SignalKind::Offer, SignalKind::IceCandidate]);

        db.mark_processed(second.id).await.unwrap();
        let pending = db.pending_signals("call-1", "bob").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, SignalKind::Offer);
    }
}
