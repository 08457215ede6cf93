//! Local media acquisition and remote media aggregation
//!
//! Capturing audio/video is the host platform's job; the controller only
//! needs something that hands it live tracks or fails with a permission or
//! device error. [`DeviceMediaSource`] models that over a device inventory.
//!
//! Remote tracks arrive one `track` event at a time. [`RemoteMediaAggregator`]
//! merges them per stream id so observers always see one stream per peer.

use crate::types::MediaConstraints;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// User or platform refused access to capture devices
    #[error("Permission denied")]
    PermissionDenied,

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Stream error
    #[error("Stream error: {0}")]
    Stream(String),
}

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio
    Audio,
    /// Video
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// A captured local track
#[derive(Debug, Clone)]
pub struct LocalTrack {
    /// Track identifier
    pub id: String,
    /// Audio or video
    pub kind: MediaKind,
    /// Stream the track belongs to
    pub stream_id: String,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    /// Create a live track
    pub fn new(id: impl Into<String>, kind: MediaKind, stream_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            stream_id: stream_id.into(),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Stop capturing. Idempotent.
    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    /// Whether the track is still capturing
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// Local media acquired for one call
#[derive(Debug, Clone)]
pub struct LocalMedia {
    /// Stream identifier shared by all tracks
    pub stream_id: String,
    /// Captured tracks
    pub tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    /// Stop every track
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// Whether a video track was captured
    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == MediaKind::Video)
    }
}

/// Source of local audio/video
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire live tracks matching the constraints
    ///
    /// # Errors
    ///
    /// Returns `MediaError::PermissionDenied` or `MediaError::DeviceNotFound`
    /// when capture is impossible
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// Audio device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDevice {
    /// Device identifier
    pub id: String,
    /// Device name
    pub name: String,
}

/// Video device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoDevice {
    /// Device identifier
    pub id: String,
    /// Device name
    pub name: String,
}

/// Media source backed by a device inventory
///
/// Keeps a handle on every track it hands out so callers can check that
/// nothing is left capturing after a call.
pub struct DeviceMediaSource {
    audio_devices: Vec<AudioDevice>,
    video_devices: Vec<VideoDevice>,
    permission_granted: AtomicBool,
    acquire_delay: Duration,
    acquisitions: AtomicU64,
    issued: Mutex<Vec<LocalTrack>>,
}

impl DeviceMediaSource {
    /// Create a source over the given devices
    pub fn new(audio_devices: Vec<AudioDevice>, video_devices: Vec<VideoDevice>) -> Self {
        Self {
            audio_devices,
            video_devices,
            permission_granted: AtomicBool::new(true),
            acquire_delay: Duration::ZERO,
            acquisitions: AtomicU64::new(0),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Source with a microphone but no camera
    pub fn audio_only() -> Self {
        Self::new(vec![default_audio_device()], Vec::new())
    }

    /// Delay every acquisition, as a slow permission prompt would
    #[must_use]
    pub fn with_acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = delay;
        self
    }

    /// Grant or revoke capture permission
    pub fn set_permission(&self, granted: bool) {
        self.permission_granted.store(granted, Ordering::SeqCst);
    }

    /// Available audio devices
    pub fn audio_devices(&self) -> &[AudioDevice] {
        &self.audio_devices
    }

    /// Available video devices
    pub fn video_devices(&self) -> &[VideoDevice] {
        &self.video_devices
    }

    /// Successful acquisitions so far
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Tracks handed out that are still capturing
    pub fn live_tracks(&self) -> usize {
        self.issued.lock().iter().filter(|t| t.is_live()).count()
    }
}

impl Default for DeviceMediaSource {
    fn default() -> Self {
        Self::new(
            vec![default_audio_device()],
            vec![VideoDevice {
                id: "default-video".to_string(),
                name: "Default Video Device".to_string(),
            }],
        )
    }
}

fn default_audio_device() -> AudioDevice {
    AudioDevice {
        id: "default-audio".to_string(),
        name: "Default Audio Device".to_string(),
    }
}

#[async_trait]
impl MediaSource for DeviceMediaSource {
    #[tracing::instrument(skip(self), fields(audio = constraints.audio, video = constraints.video))]
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError> {
        if !self.acquire_delay.is_zero() {
            tokio::time::sleep(self.acquire_delay).await;
        }
        if !self.permission_granted.load(Ordering::SeqCst) {
            tracing::warn!("Capture permission denied");
            return Err(MediaError::PermissionDenied);
        }

        let stream_id = format!("local-{}", Uuid::new_v4());
        let mut tracks = Vec::new();
        if constraints.has_audio() {
            let device = self
                .audio_devices
                .first()
                .ok_or_else(|| MediaError::DeviceNotFound("audio".to_string()))?;
            tracks.push(LocalTrack::new(
                format!("audio-{}", device.id),
                MediaKind::Audio,
                stream_id.clone(),
            ));
        }
        if constraints.has_video() {
            let device = self
                .video_devices
                .first()
                .ok_or_else(|| MediaError::DeviceNotFound("video".to_string()))?;
            tracks.push(LocalTrack::new(
                format!("video-{}", device.id),
                MediaKind::Video,
                stream_id.clone(),
            ));
        }
        if tracks.is_empty() {
            return Err(MediaError::Stream("no tracks requested".to_string()));
        }

        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        self.issued.lock().extend(tracks.iter().cloned());
        tracing::debug!(stream_id = %stream_id, tracks = tracks.len(), "Local media acquired");
        Ok(LocalMedia { stream_id, tracks })
    }
}

/// A track received from the remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// Track identifier
    pub id: String,
    /// Audio or video
    pub kind: MediaKind,
    /// Remote stream id the track belongs to
    pub stream_id: String,
}

/// Remote tracks merged by stream id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStream {
    /// Stream identifier
    pub stream_id: String,
    /// Tracks in arrival order
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Whether a video track has arrived
    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == MediaKind::Video)
    }
}

/// Merges remote `track` events into per-stream aggregates
#[derive(Debug, Default)]
pub struct RemoteMediaAggregator {
    streams: Vec<RemoteStream>,
}

impl RemoteMediaAggregator {
    /// Create an empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a track; returns the merged stream when something changed
    pub fn add(&mut self, track: RemoteTrack) -> Option<RemoteStream> {
        if let Some(stream) = self
            .streams
            .iter_mut()
            .find(|s| s.stream_id == track.stream_id)
        {
            if stream.tracks.iter().any(|t| t.id == track.id) {
                return None;
            }
            stream.tracks.push(track);
            return Some(stream.clone());
        }

        let stream = RemoteStream {
            stream_id: track.stream_id.clone(),
            tracks: vec![track],
        };
        self.streams.push(stream.clone());
        Some(stream)
    }

    /// Streams seen so far
    pub fn streams(&self) -> &[RemoteStream] {
        &self.streams
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_video_call() {
        let source = DeviceMediaSource::default();
        let media = source
            .acquire(&MediaConstraints::video_call())
            .await
            .unwrap();
        assert_eq!(media.tracks.len(), 2);
        assert!(media.has_video());
        assert_eq!(source.live_tracks(), 2);

        media.stop_all();
        assert_eq!(source.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let source = DeviceMediaSource::default();
        source.set_permission(false);
        let err = source
            .acquire(&MediaConstraints::audio_only())
            .await
            .unwrap_err();
        assert_eq!(err, MediaError::PermissionDenied);
        assert_eq!(source.acquisitions(), 0);
    }

    #[tokio::test]
    async fn test_missing_camera() {
        let source = DeviceMediaSource::audio_only();
        let err = source
            .acquire(&MediaConstraints::video_call())
            .await
            .unwrap_err();
        assert_eq!(err, MediaError::DeviceNotFound("video".to_string()));
        assert_eq!(source.live_tracks(), 0);
    }

    #[test]
    fn test_aggregator_merges_by_stream() {
        let mut aggregator = RemoteMediaAggregator::new();
        let audio = RemoteTrack {
            id: "a1".to_string(),
            kind: MediaKind::Audio,
            stream_id: "s1".to_string(),
        };
        let video = RemoteTrack {
            id: "v1".to_string(),
            kind: MediaKind::Video,
            stream_id: "s1".to_string(),
        };

        let first = aggregator.add(audio.clone()).unwrap();
        assert_eq!(first.tracks.len(), 1);
        let merged = aggregator.add(video).unwrap();
        assert_eq!(merged.tracks.len(), 2);
        assert!(merged.has_video());

        assert!(aggregator.add(audio).is_none());
        assert_eq!(aggregator.streams().len(), 1);
    }
}
