//! Local media capture for calls
//!
//! [`MediaSessionManager`] owns the single local stream of a call. It opens
//! capture through a [`CaptureDevice`] the first time the call is accepted,
//! hands read-only track clones to peer links, and is the only place that
//! flips the enabled/stopped flags of those tracks.

use crate::types::{MediaConstraints, MediaKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// User or platform refused access to capture devices
    #[error("Permission denied")]
    PermissionDenied,

    /// Device in use by another application
    #[error("Device busy")]
    DeviceBusy,

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// No local stream held
    #[error("No local media acquired")]
    NotAcquired,
}

/// Media events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaEvent {
    /// Stream started
    StreamStarted {
        /// Stream identifier
        stream_id: String,
    },
    /// Stream stopped
    StreamStopped {
        /// Stream identifier
        stream_id: String,
    },
    /// A track was muted or unmuted
    TrackToggled {
        /// Track identifier
        track_id: String,
        /// Track kind
        kind: MediaKind,
        /// New enabled flag
        enabled: bool,
    },
}

/// One captured local track
///
/// Clones share the enabled/stopped flags, so every peer link sees a toggle
/// made by the [`MediaSessionManager`] without renegotiation.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    stream_id: String,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    /// Create an enabled, running track
    pub fn new(id: impl Into<String>, kind: MediaKind, stream_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            stream_id: stream_id.into(),
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Track identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Audio or video
    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Owning stream identifier
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Whether media is currently sent on this track
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether capture has been stopped
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// A set of tracks captured together
#[derive(Debug, Clone)]
pub struct LocalStream {
    /// Stream identifier
    pub id: String,
    /// Captured tracks
    pub tracks: Vec<LocalTrack>,
}

impl LocalStream {
    /// Tracks of one kind
    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// Whether the stream carries video
    #[must_use]
    pub fn has_video(&self) -> bool {
        self.tracks_of(MediaKind::Video).next().is_some()
    }

    /// Whether any track is still running
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(|t| !t.is_stopped())
    }
}

/// Source of local capture (microphone/camera)
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Open capture for the requested kinds
    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError>;
}

/// Capture device producing placeholder tracks
///
/// Grants every request unless a denial is configured, which lets callers
/// exercise permission failures.
#[derive(Debug, Default)]
pub struct SyntheticCaptureDevice {
    denial: Mutex<Option<MediaError>>,
    opened: AtomicUsize,
}

impl SyntheticCaptureDevice {
    /// Device that always grants access
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Device that refuses every request with `error`
    #[must_use]
    pub fn denying(error: MediaError) -> Self {
        let device = Self::default();
        device.set_denial(Some(error));
        device
    }

    /// Change whether requests are refused
    pub fn set_denial(&self, denial: Option<MediaError>) {
        *self.denial.lock() = denial;
    }

    /// Number of streams opened so far
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureDevice for SyntheticCaptureDevice {
    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        if let Some(error) = self.denial.lock().clone() {
            return Err(error);
        }
        let kinds = constraints.to_media_kinds();
        if kinds.is_empty() {
            return Err(MediaError::DeviceNotFound(
                "no media kind requested".to_string(),
            ));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);

        let stream_id = format!("stream-{}", Uuid::new_v4());
        let tracks = kinds
            .into_iter()
            .map(|kind| {
                let label = match kind {
                    MediaKind::Audio => "audio",
                    MediaKind::Video => "video",
                };
                LocalTrack::new(format!("{}-{}", label, Uuid::new_v4()), kind, &stream_id)
            })
            .collect();
        Ok(LocalStream {
            id: stream_id,
            tracks,
        })
    }
}

/// Owner of the local stream of one call
pub struct MediaSessionManager {
    device: Arc<dyn CaptureDevice>,
    stream: Option<LocalStream>,
    event_sender: broadcast::Sender<MediaEvent>,
}

impl MediaSessionManager {
    /// Create a manager capturing from `device`
    #[must_use]
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            device,
            stream: None,
            event_sender,
        }
    }

    /// Acquire local media, or return the stream already held
    ///
    /// # Errors
    ///
    /// Returns error if the capture device refuses
    #[tracing::instrument(skip(self))]
    pub async fn acquire(
        &mut self,
        constraints: MediaConstraints,
    ) -> Result<LocalStream, MediaError> {
        if let Some(stream) = self.stream.as_ref().filter(|s| s.is_active()) {
            tracing::debug!(stream_id = %stream.id, "Local media already held");
            return Ok(stream.clone());
        }

        let stream = self.device.open(&constraints).await?;
        tracing::info!(
            stream_id = %stream.id,
            tracks = stream.tracks.len(),
            "Local media acquired"
        );
        let _ = self.event_sender.send(MediaEvent::StreamStarted {
            stream_id: stream.id.clone(),
        });
        self.stream = Some(stream.clone());
        Ok(stream)
    }

    /// Tracks currently held, empty when nothing is acquired
    #[must_use]
    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.stream
            .as_ref()
            .map(|s| s.tracks.clone())
            .unwrap_or_default()
    }

    /// Whether a running stream is held
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.stream.as_ref().is_some_and(LocalStream::is_active)
    }

    /// The held stream
    #[must_use]
    pub fn stream(&self) -> Option<&LocalStream> {
        self.stream.as_ref()
    }

    /// Mute or unmute audio
    ///
    /// # Errors
    ///
    /// Returns `MediaError::NotAcquired` if no stream is held
    pub fn set_audio_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.set_enabled(MediaKind::Audio, enabled)
    }

    /// Turn the camera on or off
    ///
    /// # Errors
    ///
    /// Returns `MediaError::NotAcquired` if no stream is held
    pub fn set_video_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.set_enabled(MediaKind::Video, enabled)
    }

    fn set_enabled(&self, kind: MediaKind, enabled: bool) -> Result<(), MediaError> {
        let stream = self.stream.as_ref().ok_or(MediaError::NotAcquired)?;
        for track in stream.tracks_of(kind) {
            if track.is_enabled() != enabled {
                track.set_enabled(enabled);
                tracing::debug!(track_id = %track.id(), kind = ?kind, enabled, "Track toggled");
                let _ = self.event_sender.send(MediaEvent::TrackToggled {
                    track_id: track.id().to_string(),
                    kind,
                    enabled,
                });
            }
        }
        Ok(())
    }

    /// Stop every track and drop the stream
    pub fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            for track in &stream.tracks {
                track.stop();
            }
            tracing::info!(stream_id = %stream.id, "Local media released");
            let _ = self.event_sender.send(MediaEvent::StreamStopped {
                stream_id: stream.id,
            });
        }
    }

    /// Subscribe to media events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.event_sender.subscribe()
    }
}

impl Drop for MediaSessionManager {
    fn drop(&mut self) {
        self.release();
    }
}
