//! Signaling Module - Dual-Path Zustellung von Verhandlungsnachrichten
//!
//! Dieses Modul verwaltet:
//! - Broadcast-Kanal pro Call (WebSocket-Relay oder In-Process Hub)
//! - Durablen Nachrichten-Store als Fallback mit Polling
//! - Deduplizierung über beide Pfade
//!

mod broadcast;
mod client;
mod messages;
mod transport;

pub use broadcast::{BroadcastChannel, BroadcastTopic, LocalBroadcastHub, MessageHandler};
pub use client::WsRelayChannel;
pub use messages::*;
pub use transport::{call_topic, SignalingTransport};

use crate::database::StoreError;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling channel")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Subscription failed: {0}")]
    SubscribeFailed(String),

    #[error("Message handler must be attached before subscribing")]
    HandlerNotAttached,

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Signal store error: {0}")]
    Store(#[from] StoreError),

    #[error("Malformed signal: {0}")]
    Malformed(#[from] serde_json::Error),
}
