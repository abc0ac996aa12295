//! ICE Server Konfiguration
//!
//! STUN/TURN Endpunkte werden pro Verbindungsversuch frisch geholt.
//! TURN Credentials sind zeitlich begrenzt (TURN REST API) und werden bei
//! einem manuellen Retry explizit verworfen.

use super::PeerError;
use crate::config::CallConfig;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::sync::Arc;

const MIN_TTL_SECS: i64 = 60;
const MAX_TTL_SECS: i64 = 24 * 60 * 60;

// ============================================================================
// ICE SERVER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(urls: Vec<String>) -> Self {
        Self {
            urls,
            username: None,
            credential: None,
        }
    }

    /// TURN Server (liefern Relay-Kandidaten)
    pub fn is_relay(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// Liefert die ICE Server für einen Verbindungsversuch
#[async_trait]
pub trait IceCredentialProvider: Send + Sync {
    async fn ice_servers(&self) -> Result<Vec<IceServer>, PeerError>;

    /// Verwirft zwischengespeicherte Credentials
    fn invalidate(&self);
}

// ============================================================================
// STATIC PROVIDER
// ============================================================================

/// Feste Serverliste ohne Ablaufzeit
#[derive(Debug, Clone)]
pub struct StaticIceProvider {
    servers: Vec<IceServer>,
}

impl StaticIceProvider {
    pub fn new(servers: Vec<IceServer>) -> Self {
        Self { servers }
    }
}

#[async_trait]
impl IceCredentialProvider for StaticIceProvider {
    async fn ice_servers(&self) -> Result<Vec<IceServer>, PeerError> {
        Ok(self.servers.clone())
    }

    fn invalidate(&self) {}
}

// ============================================================================
// TURN REST CREDENTIALS
// ============================================================================

/// Zeitlich begrenzte TURN Credentials nach der TURN REST API
///
/// `username = "<ablauf-unix>:<user>"`, `credential = base64(HMAC-SHA1(secret, username))`.
pub struct TurnRestProvider {
    stun_urls: Vec<String>,
    turn_urls: Vec<String>,
    secret: String,
    user_id: String,
    ttl: ChronoDuration,
    cache: Mutex<Option<(Vec<IceServer>, DateTime<Utc>)>>,
}

impl TurnRestProvider {
    pub fn new(
        stun_urls: Vec<String>,
        turn_urls: Vec<String>,
        secret: String,
        user_id: String,
        ttl_secs: u64,
    ) -> Self {
        Self {
            stun_urls,
            turn_urls,
            secret,
            user_id,
            ttl: ChronoDuration::seconds(clamp_ttl(ttl_secs)),
            cache: Mutex::new(None),
        }
    }

    fn issue(&self, now: DateTime<Utc>) -> Result<(Vec<IceServer>, DateTime<Utc>), PeerError> {
        let expires_at = now + self.ttl;
        let username = format!("{}:{}", expires_at.timestamp(), self.user_id);

        let mut mac = Hmac::<Sha1>::new_from_slice(self.secret.as_bytes())
            .map_err(|e| PeerError::Ice(e.to_string()))?;
        mac.update(username.as_bytes());
        let credential = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        let mut servers = Vec::new();
        if !self.stun_urls.is_empty() {
            servers.push(IceServer::stun(self.stun_urls.clone()));
        }
        servers.push(IceServer {
            urls: self.turn_urls.clone(),
            username: Some(username),
            credential: Some(credential),
        });
        Ok((servers, expires_at))
    }
}

#[async_trait]
impl IceCredentialProvider for TurnRestProvider {
    async fn ice_servers(&self) -> Result<Vec<IceServer>, PeerError> {
        let now = Utc::now();
        let mut cache = self.cache.lock();

        // Eine Minute Reserve vor Ablauf
        if let Some((servers, expires_at)) = cache.as_ref() {
            if *expires_at - ChronoDuration::seconds(60) > now {
                return Ok(servers.clone());
            }
        }

        let (servers, expires_at) = self.issue(now)?;
        tracing::debug!("Issued TURN credentials valid until {}", expires_at);
        *cache = Some((servers.clone(), expires_at));
        Ok(servers)
    }

    fn invalidate(&self) {
        self.cache.lock().take();
    }
}

/// Gültigkeit zwischen einer Minute und einem Tag
fn clamp_ttl(ttl_secs: u64) -> i64 {
    i64::try_from(ttl_secs)
        .unwrap_or(i64::MAX)
        .clamp(MIN_TTL_SECS, MAX_TTL_SECS)
}

/// Wählt den Provider passend zur Konfiguration
///
/// TURN-URLs ohne Secret sind unbrauchbar und werden ausgelassen.
pub fn provider_from_config(config: &CallConfig, user_id: &str) -> Arc<dyn IceCredentialProvider> {
    match (&config.turn_secret, config.turn_urls.is_empty()) {
        (Some(secret), false) => Arc::new(TurnRestProvider::new(
            config.stun_urls.clone(),
            config.turn_urls.clone(),
            secret.clone(),
            user_id.to_string(),
            config.turn_credential_ttl_secs,
        )),
        (None, false) => {
            tracing::warn!(
                "Ignoring {} TURN URLs without shared secret",
                config.turn_urls.len()
            );
            Arc::new(StaticIceProvider::new(vec![IceServer::stun(
                config.stun_urls.clone(),
            )]))
        }
        _ => Arc::new(StaticIceProvider::new(vec![IceServer::stun(
            config.stun_urls.clone(),
        )])),
    }
}

// ============================================================================
// TESTS
// ============================================================================
