use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::engine::PeerConnectionState;
use crate::identity::SessionId;
use crate::media::RemoteStream;
use crate::signaling::ParticipantMetadata;

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteParticipant {
    pub session_id: SessionId,
    pub display_name: String,
    pub camera_on: bool,
    pub mic_on: bool,
    pub screen_sharing: bool,
    pub connection_state: PeerConnectionState,
    pub last_seen_at: Instant,
    pub media_stream: Option<RemoteStream>,
}

impl RemoteParticipant {
    fn new(session_id: &str, now: Instant) -> Self {
        Self {
            session_id: session_id.to_string(),
            display_name: session_id.to_string(),
            camera_on: false,
            mic_on: false,
            screen_sharing: false,
            connection_state: PeerConnectionState::New,
            last_seen_at: now,
            media_stream: None,
        }
    }

    fn apply_metadata(&mut self, metadata: &ParticipantMetadata) {
        if !metadata.display_name.is_empty() {
            self.display_name = metadata.display_name.clone();
        }
        self.camera_on = metadata.camera_on;
        self.mic_on = metadata.mic_on;
        self.screen_sharing = metadata.screen_sharing;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    Joined,
    Updated,
}

/// Which remote participants are currently alive, derived from their heartbeats.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    participants: HashMap<SessionId, RemoteParticipant>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts the sender and refreshes its liveness.
    pub fn record_heartbeat(
        &mut self,
        sender: &str,
        metadata: Option<&ParticipantMetadata>,
        now: Instant,
    ) -> Heartbeat {
        let outcome = if self.participants.contains_key(sender) {
            Heartbeat::Updated
        } else {
            tracing::info!(target: "huddle::presence", peer = %sender, "participant joined");
            Heartbeat::Joined
        };
        let participant = self
            .participants
            .entry(sender.to_string())
            .or_insert_with(|| RemoteParticipant::new(sender, now));
        participant.last_seen_at = now;
        if let Some(metadata) = metadata {
            participant.apply_metadata(metadata);
        }
        outcome
    }

    /// Refreshes liveness for a known participant; unknown ids are ignored.
    pub fn touch(&mut self, sender: &str, now: Instant) -> bool {
        match self.participants.get_mut(sender) {
            Some(participant) => {
                participant.last_seen_at = now;
                true
            }
            None => false,
        }
    }

    /// Removes and returns every participant silent for longer than `threshold`.
    pub fn sweep_stale(&mut self, threshold: Duration, now: Instant) -> Vec<RemoteParticipant> {
        let stale: Vec<SessionId> = self
            .participants
            .values()
            .filter(|participant| now.saturating_duration_since(participant.last_seen_at) > threshold)
            .map(|participant| participant.session_id.clone())
            .collect();
        let mut removed: Vec<RemoteParticipant> = stale
            .iter()
            .filter_map(|id| self.participants.remove(id))
            .collect();
        removed.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        for participant in &removed {
            tracing::info!(
                target: "huddle::presence",
                peer = %participant.session_id,
                "participant went stale"
            );
        }
        removed
    }

    /// Idempotent: an absent id is a no-op.
    pub fn mark_left(&mut self, sender: &str) -> Option<RemoteParticipant> {
        let removed = self.participants.remove(sender);
        if removed.is_some() {
            tracing::info!(target: "huddle::presence", peer = %sender, "participant left");
        }
        removed
    }

    pub fn get(&self, session_id: &str) -> Option<&RemoteParticipant> {
        self.participants.get(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.participants.contains_key(session_id)
    }

    pub fn set_connection_state(&mut self, session_id: &str, state: PeerConnectionState) {
        if let Some(participant) = self.participants.get_mut(session_id) {
            participant.connection_state = state;
        }
    }

    pub fn set_media(&mut self, session_id: &str, stream: Option<RemoteStream>) {
        if let Some(participant) = self.participants.get_mut(session_id) {
            participant.media_stream = stream;
        }
    }

    /// Participants ordered by session id.
    pub fn participants(&self) -> Vec<RemoteParticipant> {
        let mut participants: Vec<_> = self.participants.values().cloned().collect();
        participants.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        participants
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.participants.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
