//! Benannte One-Shot Timer und Hintergrund-Tasks
//!
//! Jeder Eintrag ist ein tokio-Task. Ein neuer Eintrag unter demselben
//! Namen bricht den alten ab, `cancel_all` räumt beim Teardown alles weg.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct Timers {
    tasks: HashMap<&'static str, JoinHandle<()>>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Führt `fut` nach `delay` aus
    pub fn schedule<F>(&mut self, name: &'static str, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(name, async move {
            tokio::time::sleep(delay).await;
            fut.await;
        });
    }

    /// Startet einen langlebigen Task (Poller, Event-Pumpe)
    pub fn spawn<F>(&mut self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(previous) = self.tasks.insert(name, tokio::spawn(fut)) {
            previous.abort();
        }
    }

    pub fn cancel(&mut self, name: &'static str) {
        if let Some(handle) = self.tasks.remove(name) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }

    /// Prüft ob ein Eintrag existiert und noch nicht abgelaufen ist
    pub fn is_pending(&self, name: &'static str) -> bool {
        self.tasks
            .get(name)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.values().all(|handle| handle.is_finished())
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_once() {
        let hits = Arc::new(AtomicU32::new(0));
        let mut timers = Timers::new();

        let counter = Arc::clone(&hits);
        timers.schedule("ring", Duration::from_secs(60), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(timers.is_pending("ring"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!timers.is_pending("ring"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_previous() {
        let hits = Arc::new(AtomicU32::new(0));
        let mut timers = Timers::new();

        for _ in 0..3 {
            let counter = Arc::clone(&hits);
            timers.schedule("retry", Duration::from_secs(3), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let hits = Arc::new(AtomicU32::new(0));
        let mut timers = Timers::new();

        for name in ["a", "b"] {
            let counter = Arc::clone(&hits);
            timers.schedule(name, Duration::from_secs(1), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        timers.cancel_all();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(timers.is_empty());
    }
}
