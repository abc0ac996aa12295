//! Media Handles
//!
//! Modelliert lokale und entfernte Media Streams unabhängig vom
//! Capture-Backend. Der lokale Stream gehört exklusiv der aktiven
//! Session, der Remote Stream gehört der Peer Connection.

use crate::database::CallKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied: {} access was refused", .kind.device_label())]
    PermissionDenied { kind: CallKind },

    #[error("No usable {} available: {reason}", .kind.device_label())]
    DeviceUnavailable { kind: CallKind, reason: String },
}

impl MediaError {
    /// Art des Anrufs, für den die Akquise fehlschlug
    pub fn kind(&self) -> CallKind {
        match self {
            MediaError::PermissionDenied { kind } | MediaError::DeviceUnavailable { kind, .. } => {
                *kind
            }
        }
    }
}

// ============================================================================
// TRACKS & STREAMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Einzelner Audio- oder Video-Track
#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Sammlung von Tracks, die gemeinsam übertragen werden
#[derive(Debug)]
pub struct MediaStream {
    id: String,
    tracks: Mutex<Vec<Arc<MediaTrack>>>,
}

/// Geteilter Handle auf einen Stream
pub type MediaHandle = Arc<MediaStream>;

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn add_track(&self, track: Arc<MediaTrack>) {
        let mut tracks = self.tracks.lock();
        if !tracks.iter().any(|t| t.id() == track.id()) {
            tracks.push(track);
        }
    }

    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks.lock().clone()
    }

    pub fn audio_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks_of(TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks_of(TrackKind::Video)
    }

    fn tracks_of(&self, kind: TrackKind) -> Vec<Arc<MediaTrack>> {
        self.tracks
            .lock()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    /// Stoppt alle Tracks (gibt Kamera/Mikrofon frei)
    pub fn stop_all(&self) {
        for track in self.tracks.lock().iter() {
            track.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.lock().iter().all(|t| t.is_stopped())
    }
}

// ============================================================================
// CAPTURE
// ============================================================================

/// Zugriff auf Kamera/Mikrofon des Hosts
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Fordert Audio (und bei Videoanrufen Video) an
    async fn acquire(&self, kind: CallKind) -> Result<MediaHandle, MediaError>;
}

/// Capture ohne echte Geräte
///
/// Liefert Streams mit Platzhalter-Tracks. Fehler und Verzögerungen lassen
/// sich setzen, um Berechtigungsdialoge nachzustellen.
#[derive(Debug, Default)]
pub struct SyntheticMediaCapture {
    failure: Mutex<Option<MediaError>>,
    delay: Mutex<Option<Duration>>,
    issued: Mutex<Vec<MediaHandle>>,
    counter: AtomicU32,
}

impl SyntheticMediaCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nächste Akquisen schlagen mit `failure` fehl (None = Erfolg)
    pub fn set_failure(&self, failure: Option<MediaError>) {
        *self.failure.lock() = failure;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Alle bisher ausgegebenen Streams
    pub fn issued(&self) -> Vec<MediaHandle> {
        self.issued.lock().clone()
    }
}

#[async_trait]
impl MediaCapture for SyntheticMediaCapture {
    async fn acquire(&self, kind: CallKind) -> Result<MediaHandle, MediaError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(failure) = self.failure.lock().clone() {
            return Err(failure);
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let stream = Arc::new(MediaStream::new(format!("local-{}", n)));
        stream.add_track(Arc::new(MediaTrack::new(
            format!("local-{}-audio", n),
            TrackKind::Audio,
        )));
        if kind == CallKind::Video {
            stream.add_track(Arc::new(MediaTrack::new(
                format!("local-{}-video", n),
                TrackKind::Video,
            )));
        }

        self.issued.lock().push(Arc::clone(&stream));
        Ok(stream)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_video_stream_has_both_tracks() {
        let capture = SyntheticMediaCapture::new();
        let stream = capture.acquire(CallKind::Video).await.unwrap();
        assert_eq!(stream.audio_tracks().len(), 1);
        assert_eq!(stream.video_tracks().len(), 1);

        let audio = capture.acquire(CallKind::Audio).await.unwrap();
        assert!(audio.video_tracks().is_empty());
    }

    #[tokio::test]
    async fn test_stop_all() {
        let capture = SyntheticMediaCapture::new();
        let stream = capture.acquire(CallKind::Video).await.unwrap();
        assert!(!stream.is_stopped());
        stream.stop_all();
        assert!(stream.is_stopped());
    }

    #[test]
    fn test_error_message_distinguishes_video_and_audio() {
        let video = MediaError::PermissionDenied {
            kind: CallKind::Video,
        };
        let audio = MediaError::PermissionDenied {
            kind: CallKind::Audio,
        };
        assert!(video.to_string().contains("camera"));
        assert!(!audio.to_string().contains("camera"));
        assert!(audio.to_string().contains("microphone"));
    }

    #[tokio::test]
    async fn test_configured_failure() {
        let capture = SyntheticMediaCapture::new();
        capture.set_failure(Some(MediaError::DeviceUnavailable {
            kind: CallKind::Audio,
            reason: "busy".to_string(),
        }));
        let err = capture.acquire(CallKind::Audio).await.unwrap_err();
        assert_eq!(err.kind(), CallKind::Audio);
        assert!(capture.issued().is_empty());
    }
}
