//! Konfiguration der Call-Orchestrierung
//!
//! Alle Zeitkonstanten (Klingel-Timeout, Poll-Intervall, Recovery-Delays)
//! und die ICE-Einstellungen an einer Stelle. Werte können über
//! Umgebungsvariablen überschrieben werden.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// DEFAULTS
// ============================================================================

/// Default Relay-URL für den Broadcast-Kanal
pub const DEFAULT_RELAY_URL: &str = "wss://realtime.call-core.local/socket";

/// Öffentliche STUN Server (reichen für die meisten NAT-Situationen)
pub const DEFAULT_STUN_URLS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

// ============================================================================
// CALL CONFIG
// ============================================================================

/// Laufzeit-Konfiguration für eine [`crate::CallEngine`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    /// WebSocket-URL des Broadcast-Relays
    pub relay_url: String,
    /// Maximale Klingeldauer eines ausgehenden Anrufs
    pub ring_timeout_ms: u64,
    /// Poll-Intervall des durablen Signaling-Pfads
    pub poll_interval_ms: u64,
    /// Wartezeit vor Relay-Retry bzw. ICE-Restart
    pub recovery_delay_ms: u64,
    /// Gnadenfrist für `disconnected`, bevor Recovery startet
    pub disconnected_grace_ms: u64,
    /// Anzahl erlaubter ICE-Restarts nach dem Relay-Retry
    pub max_ice_restarts: u32,
    /// Nur TURN-Relay Kandidaten verwenden
    pub force_relay: bool,
    pub stun_urls: Vec<String>,
    pub turn_urls: Vec<String>,
    /// Shared Secret für zeitlich begrenzte TURN Credentials
    pub turn_secret: Option<String>,
    pub turn_credential_ttl_secs: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            ring_timeout_ms: 60_000,
            poll_interval_ms: 500,
            recovery_delay_ms: 3_000,
            disconnected_grace_ms: 12_000,
            max_ice_restarts: 3,
            force_relay: is_constrained_runtime(),
            stun_urls: DEFAULT_STUN_URLS.iter().map(|s| s.to_string()).collect(),
            turn_urls: Vec::new(),
            turn_secret: None,
            turn_credential_ttl_secs: 3_600,
        }
    }
}

impl CallConfig {
    /// Lädt die Konfiguration aus Umgebungsvariablen
    ///
    /// Nicht gesetzte Variablen fallen auf die Defaults zurück.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("CALL_RELAY_URL") {
            config.relay_url = url;
        }

        if let Ok(value) = std::env::var("CALL_FORCE_RELAY") {
            config.force_relay = matches!(value.as_str(), "1" | "true" | "yes");
        }

        if let Ok(urls) = std::env::var("CALL_TURN_URL") {
            config.turn_urls = urls
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(secret) = std::env::var("CALL_TURN_SECRET") {
            config.turn_secret = Some(secret);
        }

        // Eingebettete Mobile-Runtimes brauchen immer Relay
        config.force_relay |= is_constrained_runtime();
        config
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub fn disconnected_grace(&self) -> Duration {
        Duration::from_millis(self.disconnected_grace_ms)
    }
}

/// Erkennt eingebettete Mobile-Runtimes, auf denen ICE ohne Relay
/// zuverlässig scheitert
pub fn is_constrained_runtime() -> bool {
    cfg!(any(target_os = "android", target_os = "ios"))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings() {
        let config = CallConfig::default();
        assert_eq!(config.ring_timeout(), Duration::from_secs(60));
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.recovery_delay(), Duration::from_secs(3));
        assert_eq!(config.disconnected_grace(), Duration::from_secs(12));
        assert_eq!(config.max_ice_restarts, 3);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CallConfig =
            serde_json::from_str(r#"{"ring_timeout_ms": 1000, "force_relay": true}"#).unwrap();
        assert_eq!(config.ring_timeout(), Duration::from_secs(1));
        assert!(config.force_relay);
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.stun_urls.len(), DEFAULT_STUN_URLS.len());
    }
}
