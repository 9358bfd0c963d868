use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::{LocalStream, RemoteTrack};
use crate::signaling::IceCandidatePayload;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerConnectionState::New => "new",
            PeerConnectionState::Connecting => "connecting",
            PeerConnectionState::Connected => "connected",
            PeerConnectionState::Disconnected => "disconnected",
            PeerConnectionState::Failed => "failed",
            PeerConnectionState::Closed => "closed",
        }
    }

    pub fn needs_recovery(self) -> bool {
        matches!(self, PeerConnectionState::Failed | PeerConnectionState::Disconnected)
    }
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_established(self) -> bool {
        matches!(self, IceConnectionState::Connected | IceConnectionState::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum BackendEvent {
    LocalCandidate(IceCandidatePayload),
    ConnectionState(PeerConnectionState),
    IceConnectionState(IceConnectionState),
    RemoteTrack(RemoteTrack),
}

/// A backend event tagged with the generation of the backend that produced it.
#[derive(Debug, Clone)]
pub struct TaggedEvent {
    pub generation: u64,
    pub event: BackendEvent,
}

pub type BackendEventSender = mpsc::UnboundedSender<TaggedEvent>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("operation not valid in the current signaling state: {0}")]
    WrongState(String),
    #[error("negotiation failed: {0}")]
    Failed(String),
    #[error("peer connection is closed")]
    Closed,
}

impl BackendError {
    pub fn is_wrong_state(&self) -> bool {
        matches!(self, BackendError::WrongState(_))
    }
}

/// One negotiation object: descriptions, candidates and outbound tracks.
#[async_trait]
pub trait NegotiationBackend: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, BackendError>;
    async fn create_answer(&self) -> Result<SessionDescription, BackendError>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), BackendError>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), BackendError>;
    /// Returns a half-finished exchange to `stable`.
    async fn rollback(&self) -> Result<(), BackendError>;
    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), BackendError>;
    /// Replaces every outbound track with the tracks of `stream`.
    async fn replace_local_tracks(&self, stream: &LocalStream) -> Result<(), BackendError>;
    async fn has_remote_description(&self) -> bool;
    fn signaling_state(&self) -> SignalingState;
    async fn close(&self) -> Result<(), BackendError>;
}

/// Builds fresh backends. Every backend reports its events on `events`, tagged with
/// the generation it was created for.
#[async_trait]
pub trait NegotiationFactory: Send + Sync {
    async fn create(
        &self,
        generation: u64,
        events: BackendEventSender,
    ) -> Result<Box<dyn NegotiationBackend>, BackendError>;
}
