//! Datenmodell für Call Records und Signaling-Nachrichten

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// CALL KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Video,
    Audio,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Video => "video",
            CallKind::Audio => "audio",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "video" => Some(CallKind::Video),
            "audio" => Some(CallKind::Audio),
            _ => None,
        }
    }

    /// Benötigte Geräte, für Fehlermeldungen
    pub fn device_label(&self) -> &'static str {
        match self {
            CallKind::Video => "camera and microphone",
            CallKind::Audio => "microphone",
        }
    }
}

// ============================================================================
// CALL STATUS
// ============================================================================

/// Persistierter Status eines Call Records
///
/// Übergänge sind monoton: `ringing → {answered → ended} | declined | missed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Answered,
    Declined,
    Ended,
    Missed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Answered => "answered",
            CallStatus::Declined => "declined",
            CallStatus::Ended => "ended",
            CallStatus::Missed => "missed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ringing" => Some(CallStatus::Ringing),
            "answered" => Some(CallStatus::Answered),
            "declined" => Some(CallStatus::Declined),
            "ended" => Some(CallStatus::Ended),
            "missed" => Some(CallStatus::Missed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Declined | CallStatus::Ended | CallStatus::Missed
        )
    }

    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        matches!(
            (self, next),
            (CallStatus::Ringing, CallStatus::Answered)
                | (CallStatus::Ringing, CallStatus::Declined)
                | (CallStatus::Ringing, CallStatus::Missed)
                | (CallStatus::Answered, CallStatus::Ended)
        )
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CALL RECORD
// ============================================================================

/// Ein Anrufversuch und sein Ergebnis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    pub caller_id: String,
    pub callee_id: String,
    pub conversation_id: Option<String>,
    pub kind: CallKind,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallRecord {
    /// Die jeweils andere Partei aus Sicht von `user_id`
    pub fn peer_of(&self, user_id: &str) -> &str {
        if self.caller_id == user_id {
            &self.callee_id
        } else {
            &self.caller_id
        }
    }
}

/// Neuer Call Record ohne ID (für INSERT)
#[derive(Debug, Clone)]
pub struct NewCallRecord {
    pub caller_id: String,
    pub callee_id: String,
    pub conversation_id: Option<String>,
    pub kind: CallKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallRecordUpdate {
    pub status: CallStatus,
    pub started_at: Option<DateTime<Utc>>,
    /// Wird bei terminalen Status automatisch gesetzt, falls leer
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallRecordUpdate {
    pub fn status(status: CallStatus) -> Self {
        Self {
            status,
            started_at: None,
            ended_at: None,
        }
    }
}

/// Änderungen am Call-Record-Store
#[derive(Debug, Clone, PartialEq)]
pub enum RecordEvent {
    Created(CallRecord),
    Updated(CallRecord),
}

impl RecordEvent {
    pub fn record(&self) -> &CallRecord {
        match self {
            RecordEvent::Created(record) | RecordEvent::Updated(record) => record,
        }
    }
}

// ============================================================================
// SIGNAL MESSAGE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    Hangup,
    Ready,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
            SignalKind::Hangup => "hangup",
            SignalKind::Ready => "ready",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "offer" => Some(SignalKind::Offer),
            "answer" => Some(SignalKind::Answer),
            "ice-candidate" => Some(SignalKind::IceCandidate),
            "hangup" => Some(SignalKind::Hangup),
            "ready" => Some(SignalKind::Ready),
            _ => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Zeile im durablen Signaling-Store (append-only)
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMessage {
    pub id: i64,
    pub call_id: String,
    pub sender_id: String,
    pub kind: SignalKind,
    /// Opaker Payload (serialisiertes Envelope)
    pub payload: String,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_are_monotonic() {
        use CallStatus::*;
        assert!(Ringing.can_transition_to(Answered));
        assert!(Ringing.can_transition_to(Declined));
        assert!(Ringing.can_transition_to(Missed));
        assert!(Answered.can_transition_to(Ended));

        assert!(!Ringing.can_transition_to(Ended));
        assert!(!Answered.can_transition_to(Ringing));
        assert!(!Answered.can_transition_to(Missed));
        for terminal in [Declined, Ended, Missed] {
            assert!(terminal.is_terminal());
            for next in [Ringing, Answered, Declined, Ended, Missed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_signal_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&SignalKind::IceCandidate).unwrap(),
            "\"ice-candidate\""
        );
        assert_eq!(SignalKind::parse("ice-candidate"), Some(SignalKind::IceCandidate));
        assert_eq!(SignalKind::parse("bye"), None);
    }
}
