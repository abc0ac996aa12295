//! WebSocket Client für das Broadcast-Relay
//!
//! Implementiert den Broadcast-Kanal über einen Realtime-Relay:
//! - Ein WebSocket pro Topic
//! - Handler wird vor dem Join angehängt
//! - Join wird erst nach `joined` vom Server als abonniert gemeldet

use super::broadcast::{BroadcastChannel, BroadcastTopic, MessageHandler};
use super::messages::RelayFrame;
use super::SignalingError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Maximale Wartezeit auf die Join-Bestätigung
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// RELAY CHANNEL
// ============================================================================

/// Broadcast-Kanal über einen WebSocket-Relay
#[derive(Debug, Clone)]
pub struct WsRelayChannel {
    url: url::Url,
}

impl WsRelayChannel {
    pub fn new(relay_url: &str) -> Result<Self, SignalingError> {
        let url = url::Url::parse(relay_url)
            .map_err(|e| SignalingError::InvalidUrl(format!("{}: {}", relay_url, e)))?;

        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                other
            ))),
        }
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

#[async_trait]
impl BroadcastChannel for WsRelayChannel {
    async fn open(&self, topic: &str) -> Result<Box<dyn BroadcastTopic>, SignalingError> {
        Ok(Box::new(WsRelayTopic {
            url: self.url.to_string(),
            topic: topic.to_string(),
            handler: Mutex::new(None),
            tx: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

// ============================================================================
// RELAY TOPIC
// ============================================================================

struct WsRelayTopic {
    url: String,
    topic: String,
    handler: Mutex<Option<MessageHandler>>,
    tx: Mutex<Option<mpsc::Sender<String>>>,
    connected: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsRelayTopic {
    fn frame_text(frame: &RelayFrame) -> Result<String, SignalingError> {
        serde_json::to_string(frame).map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    async fn send_frame(&self, frame: RelayFrame) -> Result<(), SignalingError> {
        let tx = self.tx.lock().clone().ok_or(SignalingError::NotConnected)?;
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SignalingError::NotConnected);
        }

        tx.send(Self::frame_text(&frame)?)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Verarbeitet einen eingehenden Frame
    fn handle_frame(
        frame: RelayFrame,
        topic: &str,
        handler: &MessageHandler,
        join_tx: &mpsc::Sender<Result<(), SignalingError>>,
    ) {
        match frame {
            RelayFrame::Joined { topic: joined } if joined == topic => {
                let _ = join_tx.try_send(Ok(()));
            }
            RelayFrame::Broadcast {
                topic: target,
                payload,
            } if target == topic => {
                let _ = handler.send(payload);
            }
            RelayFrame::Error { message } => {
                tracing::error!("Relay error on {}: {}", topic, message);
                let _ = join_tx.try_send(Err(SignalingError::ServerError(message)));
            }
            _ => {}
        }
    }
}

#[async_trait]
impl BroadcastTopic for WsRelayTopic {
    fn on_message(&self, handler: MessageHandler) {
        *self.handler.lock() = Some(handler);
    }

    async fn subscribe(&self) -> Result<(), SignalingError> {
        let handler = self
            .handler
            .lock()
            .clone()
            .ok_or(SignalingError::HandlerNotAttached)?;

        tracing::info!("Connecting to relay {} for {}", self.url, self.topic);

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(100);
        let (join_tx, mut join_rx) = mpsc::channel::<Result<(), SignalingError>>(1);

        *self.tx.lock() = Some(tx.clone());
        self.connected.store(true, Ordering::SeqCst);

        // Read-Task: Handler ist bereits angehängt
        let topic = self.topic.clone();
        let connected = Arc::clone(&self.connected);
        let read_task = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RelayFrame>(&text) {
                        Ok(frame) => Self::handle_frame(frame, &topic, &handler, &join_tx),
                        Err(e) => tracing::debug!("Ignoring relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("Relay closed connection for {}", topic);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Relay socket error on {}: {}", topic, e);
                        break;
                    }
                    _ => {}
                }
            }
            connected.store(false, Ordering::SeqCst);
        });

        // Write-Task
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::warn!("Failed to write relay frame: {}", e);
                    break;
                }
            }
        });

        self.tasks.lock().extend([read_task, write_task]);

        self.send_frame(RelayFrame::Join {
            topic: self.topic.clone(),
        })
        .await?;

        tokio::select! {
            result = join_rx.recv() => match result {
                Some(Ok(())) => {
                    tracing::debug!("Joined relay topic {}", self.topic);
                    Ok(())
                }
                Some(Err(e)) => Err(e),
                None => Err(SignalingError::SubscribeFailed("connection closed".to_string())),
            },
            _ = tokio::time::sleep(JOIN_TIMEOUT) => {
                Err(SignalingError::SubscribeFailed("timeout".to_string()))
            }
        }
    }

    async fn send(&self, message: String) -> Result<(), SignalingError> {
        self.send_frame(RelayFrame::Broadcast {
            topic: self.topic.clone(),
            payload: message,
        })
        .await
    }

    async fn close(&self) {
        let leave = RelayFrame::Leave {
            topic: self.topic.clone(),
        };
        if let Err(e) = self.send_frame(leave).await {
            tracing::debug!("Leave frame not sent for {}: {}", self.topic, e);
        }

        self.connected.store(false, Ordering::SeqCst);
        self.tx.lock().take();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for WsRelayTopic {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for WsRelayTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsRelayTopic")
            .field("url", &self.url)
            .field("topic", &self.topic)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_websocket_url() {
        assert!(WsRelayChannel::new("wss://relay.example.com/socket").is_ok());
        assert!(matches!(
            WsRelayChannel::new("https://relay.example.com"),
            Err(SignalingError::InvalidUrl(_))
        ));
        assert!(WsRelayChannel::new("not a url").is_err());
    }

    #[test]
    fn test_frames_routed_by_topic() {
        let (handler, mut messages) = mpsc::unbounded_channel();
        let (join_tx, mut join_rx) = mpsc::channel(1);

        WsRelayTopic::handle_frame(
            RelayFrame::Broadcast {
                topic: "call:other".into(),
                payload: "x".into(),
            },
            "call:1",
            &handler,
            &join_tx,
        );
        WsRelayTopic::handle_frame(
            RelayFrame::Broadcast {
                topic: "call:1".into(),
                payload: "y".into(),
            },
            "call:1",
            &handler,
            &join_tx,
        );
        WsRelayTopic::handle_frame(
            RelayFrame::Joined {
                topic: "call:1".into(),
            },
            "call:1",
            &handler,
            &join_tx,
        );

        assert_eq!(messages.try_recv().ok().as_deref(), Some("y"));
        assert!(messages.try_recv().is_err());
        assert!(matches!(join_rx.try_recv(), Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_send_before_subscribe_fails() {
        let channel = WsRelayChannel::new("ws://127.0.0.1:9/socket").unwrap();
        let topic = channel.open("call:1").await.unwrap();
        assert!(matches!(
            topic.send("x".into()).await,
            Err(SignalingError::NotConnected)
        ));
    }
}
