//! Call UI Lock und Host-Lifecycle Signale
//!
//! Kamera/Mikrofon-Dialoge lösen auf manchen Hosts dieselben Signale aus
//! wie ein echtes Minimieren. Solange der Lock gesetzt ist, beenden diese
//! Signale keinen Anruf.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Schutz vor Teardown durch Lifecycle-Rauschen
#[derive(Debug, Clone, Default)]
pub struct UiLock {
    engaged: Arc<AtomicBool>,
}

impl UiLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engage(&self) {
        if !self.engaged.swap(true, Ordering::SeqCst) {
            tracing::debug!("Call UI lock engaged");
        }
    }

    pub fn release(&self) {
        if self.engaged.swap(false, Ordering::SeqCst) {
            tracing::debug!("Call UI lock released");
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }
}

// ============================================================================
// HOST SIGNALS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    /// App in den Hintergrund / Fenster verdeckt
    Hidden,
    Visible,
    /// Prozess wird beendet
    Terminating,
}

impl HostSignal {
    /// Signale, die ohne Lock einen Anruf beenden
    pub fn is_suspension(&self) -> bool {
        matches!(self, HostSignal::Hidden | HostSignal::Terminating)
    }
}

/// Quelle für Host-Lifecycle Signale (nicht vertrauenswürdig)
pub trait SuspendSignalSource: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<HostSignal>;
}

/// Einfache Signalquelle, die der Host selbst befüllt
#[derive(Debug, Clone)]
pub struct HostSignalChannel {
    tx: broadcast::Sender<HostSignal>,
}

impl HostSignalChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    pub fn emit(&self, signal: HostSignal) {
        let _ = self.tx.send(signal);
    }
}

impl Default for HostSignalChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SuspendSignalSource for HostSignalChannel {
    fn subscribe(&self) -> broadcast::Receiver<HostSignal> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_shared_between_clones() {
        let lock = UiLock::new();
        let view = lock.clone();
        assert!(!view.is_engaged());

        lock.engage();
        lock.engage();
        assert!(view.is_engaged());

        view.release();
        assert!(!lock.is_engaged());
    }

    #[test]
    fn test_suspension_signals() {
        assert!(HostSignal::Hidden.is_suspension());
        assert!(HostSignal::Terminating.is_suspension());
        assert!(!HostSignal::Visible.is_suspension());
    }

    #[tokio::test]
    async fn test_channel_delivers_to_subscribers() {
        let channel = HostSignalChannel::new();
        let mut rx = channel.subscribe();
        channel.emit(HostSignal::Hidden);
        assert_eq!(rx.recv().await.unwrap(), HostSignal::Hidden);
    }
}
