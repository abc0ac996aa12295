//! Database Module - Call Records und Signaling-Nachrichten
//!
//! Definiert die Verträge der beiden geteilten Stores:
//! - Call-Record-Store (anlegen, aktualisieren, Änderungen abonnieren)
//! - Signaling-Message-Store (anhängen, unverarbeitete abfragen, markieren)
//!
//! `SqliteCallStore` implementiert beide Verträge lokal.

mod calls;
mod records;

pub use calls::SqliteCallStore;
pub use records::{
    CallKind, CallRecord, CallRecordUpdate, CallStatus, NewCallRecord, RecordEvent, SignalKind,
    SignalMessage,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Call record not found: {0}")]
    RecordNotFound(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: CallStatus, to: CallStatus },

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

// ============================================================================
// STORE CONTRACTS
// ============================================================================

/// Geteilter Store für Call Records
#[async_trait]
pub trait CallRecordStore: Send + Sync {
    async fn create_record(&self, new: NewCallRecord) -> Result<CallRecord, StoreError>;

    /// Setzt einen neuen Status; nicht-monotone Übergänge werden abgelehnt
    async fn update_record(
        &self,
        id: &str,
        update: CallRecordUpdate,
    ) -> Result<CallRecord, StoreError>;

    async fn get_record(&self, id: &str) -> Result<CallRecord, StoreError>;

    /// Roher Event-Stream aller Änderungen
    fn record_events(&self) -> broadcast::Receiver<RecordEvent>;

    fn subscribe_records(&self, filter: RecordFilter) -> RecordSubscription {
        RecordSubscription::new(self.record_events(), filter)
    }
}

/// Geteilter, durabler Store für Signaling-Nachrichten
#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn append_signal(
        &self,
        call_id: &str,
        sender_id: &str,
        kind: SignalKind,
        payload: &str,
    ) -> Result<SignalMessage, StoreError>;

    /// Unverarbeitete Nachrichten eines Calls, ohne eigene, nach Erstellung sortiert
    async fn pending_signals(
        &self,
        call_id: &str,
        exclude_sender: &str,
    ) -> Result<Vec<SignalMessage>, StoreError>;

    async fn mark_processed(&self, id: i64) -> Result<(), StoreError>;
}

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

/// Filter für Record-Events
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub call_id: Option<String>,
    pub callee_id: Option<String>,
}

impl RecordFilter {
    pub fn call(call_id: impl Into<String>) -> Self {
        Self {
            call_id: Some(call_id.into()),
            callee_id: None,
        }
    }

    pub fn callee(callee_id: impl Into<String>) -> Self {
        Self {
            call_id: None,
            callee_id: Some(callee_id.into()),
        }
    }

    pub fn matches(&self, record: &CallRecord) -> bool {
        self.call_id.as_deref().map_or(true, |id| id == record.id)
            && self
                .callee_id
                .as_deref()
                .map_or(true, |id| id == record.callee_id)
    }
}

/// Gefilterter Empfänger für Record-Events
pub struct RecordSubscription {
    rx: broadcast::Receiver<RecordEvent>,
    filter: RecordFilter,
}

impl RecordSubscription {
    pub fn new(rx: broadcast::Receiver<RecordEvent>, filter: RecordFilter) -> Self {
        Self { rx, filter }
    }

    /// Nächstes passendes Event; `None` wenn der Store geschlossen wurde
    pub async fn next(&mut self) -> Option<RecordEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(event.record()) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Record subscription lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
