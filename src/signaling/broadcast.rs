//! Broadcast-Kanal Primitive
//!
//! Niedrige Latenz, best effort. Handler müssen angehängt sein, bevor die
//! Subscription bestätigt wird, sonst gehen frühe Nachrichten verloren.

use super::SignalingError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Handler für eingehende Rohnachrichten (JSON-Text)
pub type MessageHandler = mpsc::UnboundedSender<String>;

/// Fabrik für Topic-Kanäle
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    async fn open(&self, topic: &str) -> Result<Box<dyn BroadcastTopic>, SignalingError>;
}

/// Ein geöffneter Topic-Kanal
#[async_trait]
pub trait BroadcastTopic: Send + Sync {
    /// Hängt den Handler an; muss vor `subscribe` passieren
    fn on_message(&self, handler: MessageHandler);

    /// Abonniert das Topic und wartet auf Bestätigung
    async fn subscribe(&self) -> Result<(), SignalingError>;

    async fn send(&self, message: String) -> Result<(), SignalingError>;

    async fn close(&self);
}

// ============================================================================
// LOCAL HUB
// ============================================================================

/// In-Process Broadcast für mehrere Clients im selben Prozess
///
/// Nachrichten an ein Topic ohne Abonnenten werden verworfen, genau wie beim
/// echten Relay. Ein Topic lebt nur, solange es Abonnenten hat.
#[derive(Clone, Default)]
pub struct LocalBroadcastHub {
    topics: Arc<Mutex<HashMap<String, TopicEntry>>>,
    failing_sends: Arc<Mutex<bool>>,
}

struct TopicEntry {
    sender: broadcast::Sender<String>,
    subscribers: usize,
}

impl LocalBroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lässt alle Sendeversuche fehlschlagen (Ausfall des schnellen Pfads)
    pub fn set_failing(&self, failing: bool) {
        *self.failing_sends.lock() = failing;
    }

    /// Anzahl der Topics mit mindestens einem Abonnenten
    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }

    fn join(&self, topic: &str) -> broadcast::Receiver<String> {
        let mut topics = self.topics.lock();
        let entry = topics.entry(topic.to_string()).or_insert_with(|| TopicEntry {
            sender: broadcast::channel(256).0,
            subscribers: 0,
        });
        entry.subscribers += 1;
        entry.sender.subscribe()
    }

    fn leave(&self, topic: &str) {
        let mut topics = self.topics.lock();
        let empty = match topics.get_mut(topic) {
            Some(entry) => {
                entry.subscribers = entry.subscribers.saturating_sub(1);
                entry.subscribers == 0
            }
            None => false,
        };
        if empty {
            topics.remove(topic);
            tracing::debug!("Dropped local topic {}", topic);
        }
    }

    fn publish(&self, topic: &str, message: String) {
        if let Some(entry) = self.topics.lock().get(topic) {
            let _ = entry.sender.send(message);
        }
    }
}

#[async_trait]
impl BroadcastChannel for LocalBroadcastHub {
    async fn open(&self, topic: &str) -> Result<Box<dyn BroadcastTopic>, SignalingError> {
        Ok(Box::new(LocalTopic {
            hub: self.clone(),
            topic: topic.to_string(),
            handler: Mutex::new(None),
            forwarder: Mutex::new(None),
            subscribed: AtomicBool::new(false),
        }))
    }
}

struct LocalTopic {
    hub: LocalBroadcastHub,
    topic: String,
    handler: Mutex<Option<MessageHandler>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    subscribed: AtomicBool,
}

impl LocalTopic {
    fn detach(&self) {
        if let Some(task) = self.forwarder.lock().take() {
            task.abort();
        }
        if self.subscribed.swap(false, Ordering::SeqCst) {
            self.hub.leave(&self.topic);
        }
    }
}

#[async_trait]
impl BroadcastTopic for LocalTopic {
    fn on_message(&self, handler: MessageHandler) {
        *self.handler.lock() = Some(handler);
    }

    async fn subscribe(&self) -> Result<(), SignalingError> {
        let handler = self
            .handler
            .lock()
            .clone()
            .ok_or(SignalingError::HandlerNotAttached)?;

        let mut rx = self.hub.join(&self.topic);
        if self.subscribed.swap(true, Ordering::SeqCst) {
            // Erneutes Abo ersetzt das alte
            self.hub.leave(&self.topic);
        }
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if handler.send(message).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Local broadcast lagged, skipped {} messages", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.forwarder.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn send(&self, message: String) -> Result<(), SignalingError> {
        if *self.hub.failing_sends.lock() {
            return Err(SignalingError::SendFailed("broadcast unavailable".to_string()));
        }
        // Kein Empfänger ist kein Fehler
        self.hub.publish(&self.topic, message);
        Ok(())
    }

    async fn close(&self) {
        self.detach();
        self.handler.lock().take();
    }
}

impl Drop for LocalTopic {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_messages() {
        let hub = LocalBroadcastHub::new();
        let receiver = hub.open("call:1").await.unwrap();
        let sender = hub.open("call:1").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.on_message(tx);
        receiver.subscribe().await.unwrap();

        sender.send("hello".to_string()).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_messages_before_subscription_are_lost() {
        let hub = LocalBroadcastHub::new();
        let sender = hub.open("call:1").await.unwrap();
        sender.send("early".to_string()).await.unwrap();

        let receiver = hub.open("call:1").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.on_message(tx);
        receiver.subscribe().await.unwrap();

        sender.send("late".to_string()).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_topic_released_with_last_subscriber() {
        let hub = LocalBroadcastHub::new();
        let first = hub.open("call:1").await.unwrap();
        let second = hub.open("call:1").await.unwrap();
        let sender = hub.open("call:2").await.unwrap();

        for topic in [&first, &second] {
            let (tx, _rx) = mpsc::unbounded_channel();
            topic.on_message(tx);
            topic.subscribe().await.unwrap();
        }
        // Senden ohne Abonnenten legt kein Topic an
        sender.send("nobody".to_string()).await.unwrap();
        assert_eq!(hub.topic_count(), 1);

        // Erneutes Abo zählt nicht doppelt
        second.subscribe().await.unwrap();
        first.close().await;
        assert_eq!(hub.topic_count(), 1);

        drop(second);
        assert_eq!(hub.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_requires_handler() {
        let hub = LocalBroadcastHub::new();
        let topic = hub.open("call:1").await.unwrap();
        assert!(matches!(
            topic.subscribe().await,
            Err(SignalingError::HandlerNotAttached)
        ));
    }
}
