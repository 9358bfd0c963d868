//! Local capture state and the seam to the platform's capture devices.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signaling::ParticipantMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSource {
    Microphone,
    Camera,
    Screen,
}

impl CaptureSource {
    pub fn kind(self) -> TrackKind {
        match self {
            CaptureSource::Microphone => TrackKind::Audio,
            CaptureSource::Camera | CaptureSource::Screen => TrackKind::Video,
        }
    }
}

/// A captured local track. Identity is the `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    pub source: CaptureSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl LocalStream {
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        self.tracks.iter().find(|track| track.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

/// Every inbound track received from the primary peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStream {
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Adds a track unless one with the same id is already present.
    pub fn add(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|existing| existing.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission denied for {0:?}")]
    PermissionDenied(CaptureSource),
    #[error("{device:?} unavailable: {reason}")]
    Unavailable {
        device: CaptureSource,
        reason: String,
    },
}

/// Platform capture devices. `release` must stop the track synchronously.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn acquire(&self, source: CaptureSource) -> Result<MediaTrack, MediaError>;
    fn release(&self, track: &MediaTrack);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMediaFlags {
    pub camera_on: bool,
    pub mic_on: bool,
    pub screen_sharing: bool,
}

impl LocalMediaFlags {
    pub fn to_metadata(self, display_name: &str) -> ParticipantMetadata {
        ParticipantMetadata {
            display_name: display_name.to_string(),
            camera_on: self.camera_on,
            mic_on: self.mic_on,
            screen_sharing: self.screen_sharing,
        }
    }
}

/// Owns the tracks currently captured for this session.
pub struct LocalMedia {
    capture: Arc<dyn MediaCapture>,
    stream_id: String,
    microphone: Option<MediaTrack>,
    camera: Option<MediaTrack>,
    screen: Option<MediaTrack>,
}

impl LocalMedia {
    pub fn new(capture: Arc<dyn MediaCapture>) -> Self {
        Self {
            capture,
            stream_id: uuid::Uuid::new_v4().to_string(),
            microphone: None,
            camera: None,
            screen: None,
        }
    }

    pub fn flags(&self) -> LocalMediaFlags {
        LocalMediaFlags {
            camera_on: self.camera.is_some(),
            mic_on: self.microphone.is_some(),
            screen_sharing: self.screen.is_some(),
        }
    }

    /// The outbound stream: microphone plus one video track, the screen while it is
    /// shared and the camera otherwise.
    pub fn stream(&self) -> LocalStream {
        let video = self.screen.as_ref().or(self.camera.as_ref());
        LocalStream {
            id: self.stream_id.clone(),
            tracks: self
                .microphone
                .iter()
                .chain(video)
                .cloned()
                .collect(),
        }
    }

    /// Flips one source and returns whether it is now on. A failed acquire leaves the
    /// current state untouched.
    pub async fn toggle(&mut self, source: CaptureSource) -> Result<bool, MediaError> {
        if let Some(track) = self.slot(source).take() {
            self.capture.release(&track);
            tracing::debug!(target: "huddle::media", ?source, track = %track.id, "released track");
            return Ok(false);
        }
        let track = self.capture.acquire(source).await?;
        tracing::debug!(target: "huddle::media", ?source, track = %track.id, "acquired track");
        *self.slot(source) = Some(track);
        Ok(true)
    }

    pub fn stop_all(&mut self) {
        for source in [CaptureSource::Microphone, CaptureSource::Camera, CaptureSource::Screen] {
            if let Some(track) = self.slot(source).take() {
                self.capture.release(&track);
            }
        }
    }

    fn slot(&mut self, source: CaptureSource) -> &mut Option<MediaTrack> {
        match source {
            CaptureSource::Microphone => &mut self.microphone,
            CaptureSource::Camera => &mut self.camera,
            CaptureSource::Screen => &mut self.screen,
        }
    }
}
