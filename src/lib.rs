//! Call Core - Orchestrierung von 1:1 Audio/Video-Anrufen
//!
//! Bausteine:
//! - Signaling über Broadcast-Kanal plus durable Queue mit Polling
//! - Peer Connection Manager mit gestufter Recovery (Relay, ICE-Restart)
//! - Call State Machine mit Klingel-Timeout und idempotentem Teardown
//! - Watcher für eingehende Anrufe
//! - Call UI Lock gegen falsche Suspend-Signale des Hosts
//!
//! Der Host liefert Stores, Broadcast-Kanal, Medien und Peer-Backend über
//! `CallDeps`; Oberfläche und Benachrichtigungen liegen außerhalb.

pub mod call_engine;
pub mod config;
pub mod database;
pub mod media;
pub mod peer;
pub mod signaling;
pub mod timers;

#[cfg(test)]
mod test_support;

pub use call_engine::{CallDeps, CallEngine, CallError, CallState, EngineEvent};
pub use config::CallConfig;

use tracing_subscriber::EnvFilter;

/// Initialisiert das Logging
///
/// `RUST_LOG` hat Vorrang. Mehrfache Aufrufe sind harmlos.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("call_core=debug,webrtc=warn"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
