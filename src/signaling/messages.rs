//! Message Types für das Signaling-Protokoll
//!
//! Beide Zustellpfade (Broadcast und durabler Store) transportieren dasselbe
//! JSON-Envelope. Die `message_id` ist auf beiden Pfaden identisch und dient
//! als Dedupe-Key.

use crate::database::SignalKind;
use serde::{Deserialize, Serialize};

// ============================================================================
// PAYLOADS
// ============================================================================

/// ICE Candidate wie von der Peer Connection geliefert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

/// Inhalt einer Signaling-Nachricht
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    /// SDP Offer des Initiators
    Offer {
        sdp: String,
        #[serde(default)]
        ice_restart: bool,
        #[serde(default)]
        relay_only: bool,
        /// Generation der Peer Connection des Initiators
        generation: u32,
    },

    /// SDP Answer auf das Offer mit `generation`
    Answer { sdp: String, generation: u32 },

    IceCandidate {
        #[serde(flatten)]
        candidate: IceCandidate,
        generation: u32,
    },

    Hangup,

    /// Angerufener ist bereit; mit `renegotiate` fordert er eine neue Verbindung an
    Ready {
        #[serde(default)]
        renegotiate: bool,
    },
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Offer { .. } => SignalKind::Offer,
            SignalPayload::Answer { .. } => SignalKind::Answer,
            SignalPayload::IceCandidate { .. } => SignalKind::IceCandidate,
            SignalPayload::Hangup => SignalKind::Hangup,
            SignalPayload::Ready { .. } => SignalKind::Ready,
        }
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub message_id: String,
    pub call_id: String,
    pub sender_id: String,
    pub payload: SignalPayload,
}

impl SignalEnvelope {
    pub fn new(call_id: &str, sender_id: &str, payload: SignalPayload) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            call_id: call_id.to_string(),
            sender_id: sender_id.to_string(),
            payload,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }

    /// Schlüssel für die Duplikaterkennung über beide Pfade
    pub fn dedupe_key(&self) -> DedupeKey {
        DedupeKey {
            call_id: self.call_id.clone(),
            kind: self.kind(),
            sender_id: self.sender_id.clone(),
            message_id: self.message_id.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupeKey {
    pub call_id: String,
    pub kind: SignalKind,
    pub sender_id: String,
    pub message_id: String,
}

// ============================================================================
// RELAY FRAMES
// ============================================================================

/// Frames des WebSocket-Relays (beide Richtungen)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    /// Client → Server: Topic abonnieren
    Join { topic: String },

    /// Server → Client: Abonnement bestätigt
    Joined { topic: String },

    /// Client → Server: Topic verlassen
    Leave { topic: String },

    /// Nachricht an alle Abonnenten eines Topics
    Broadcast { topic: String, payload: String },

    /// Fehler vom Server
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_payload_is_flat() {
        let env = SignalEnvelope::new(
            "call-1",
            "alice",
            SignalPayload::IceCandidate {
                candidate: IceCandidate {
                    candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                },
                generation: 1,
            },
        );

        let value: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value["payload"]["type"], "ice_candidate");
        assert_eq!(value["payload"]["sdp_mid"], "0");
        assert_eq!(value["payload"]["generation"], 1);

        let parsed = SignalEnvelope::from_json(&env.to_json().unwrap()).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn test_optional_flags_default() {
        let text = r#"{"message_id":"m","call_id":"c","sender_id":"s",
            "payload":{"type":"offer","sdp":"v=0","generation":1}}"#;
        let env = SignalEnvelope::from_json(text).unwrap();
        assert_eq!(
            env.payload,
            SignalPayload::Offer {
                sdp: "v=0".into(),
                ice_restart: false,
                relay_only: false,
                generation: 1,
            }
        );

        let ready = r#"{"message_id":"m","call_id":"c","sender_id":"s","payload":{"type":"ready"}}"#;
        let env = SignalEnvelope::from_json(ready).unwrap();
        assert_eq!(env.payload, SignalPayload::Ready { renegotiate: false });
    }

    #[test]
    fn test_dedupe_key_includes_sender_and_kind() {
        let a = SignalEnvelope::new("c", "alice", SignalPayload::Hangup);
        let mut b = a.clone();
        assert_eq!(a.dedupe_key(), b.dedupe_key());
        b.sender_id = "bob".into();
        assert_ne!(a.dedupe_key(), b.dedupe_key());
    }
}
