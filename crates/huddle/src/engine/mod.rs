//! The peer connection engine: one negotiation object, the exchange of descriptions and
//! candidates with the primary peer, and the combined inbound media.

pub mod backend;
pub mod sdp;
mod webrtc_backend;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub use backend::{
    BackendError, BackendEvent, BackendEventSender, IceConnectionState, NegotiationBackend,
    NegotiationFactory, PeerConnectionState, SdpKind, SessionDescription, SignalingState,
    TaggedEvent,
};
pub use webrtc_backend::{TrackRegistry, WebRtcFactory};

use crate::config::SessionConfig;
use crate::identity::{is_initiator, SessionId};
use crate::media::{LocalStream, RemoteStream, RemoteTrack};
use crate::signaling::{
    EnvelopeKind, EnvelopeSink, IceCandidatePayload, ParticipantMetadata, SignalingEnvelope,
};
use sdp::{apply_bandwidth_caps, BandwidthCaps};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("no primary peer selected")]
    NoPrimaryPeer,
    #[error("engine is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Answered,
    /// The offer was already applied; the previous answer went out again.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Applied,
    Duplicate,
    Ignored,
    /// The answer could not be applied and a fresh offer was sent instead.
    Reoffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    Queued,
    Duplicate,
}

/// What the session needs to hear about after feeding the engine a backend event.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineNotice {
    StateChanged {
        from: PeerConnectionState,
        to: PeerConnectionState,
    },
    RemoteTrack(RemoteTrack),
}

pub struct PeerConnectionEngine {
    local_id: SessionId,
    sink: Arc<dyn EnvelopeSink>,
    factory: Arc<dyn NegotiationFactory>,
    events: BackendEventSender,
    backend: Box<dyn NegotiationBackend>,
    generation: u64,
    state: PeerConnectionState,
    ice_state: Option<IceConnectionState>,
    closed: bool,
    primary: Option<SessionId>,
    pending_candidates: HashMap<SessionId, VecDeque<IceCandidatePayload>>,
    applied_candidates: HashSet<(SessionId, String)>,
    last_remote_offer: Option<(SessionId, String)>,
    last_remote_answer: Option<String>,
    last_answer_sent: Option<String>,
    local_stream: Option<LocalStream>,
    local_metadata: ParticipantMetadata,
    remote_stream: RemoteStream,
    has_remote_user: bool,
    bandwidth: BandwidthCaps,
    offer_retry_delay: Duration,
}

impl PeerConnectionEngine {
    pub async fn new(
        local_id: impl Into<SessionId>,
        sink: Arc<dyn EnvelopeSink>,
        factory: Arc<dyn NegotiationFactory>,
        events: BackendEventSender,
        config: &SessionConfig,
    ) -> Result<Self, EngineError> {
        let generation = 1;
        let backend = factory.create(generation, events.clone()).await?;
        Ok(Self {
            local_id: local_id.into(),
            sink,
            factory,
            events,
            backend,
            generation,
            state: PeerConnectionState::New,
            ice_state: None,
            closed: false,
            primary: None,
            pending_candidates: HashMap::new(),
            applied_candidates: HashSet::new(),
            last_remote_offer: None,
            last_remote_answer: None,
            last_answer_sent: None,
            local_stream: None,
            local_metadata: ParticipantMetadata::default(),
            remote_stream: RemoteStream::default(),
            has_remote_user: false,
            bandwidth: config.bandwidth,
            offer_retry_delay: config.offer_retry_delay,
        })
    }

    pub fn state(&self) -> PeerConnectionState {
        self.state
    }

    pub fn ice_state(&self) -> Option<IceConnectionState> {
        self.ice_state
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.backend.signaling_state()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn primary_peer(&self) -> Option<&str> {
        self.primary.as_deref()
    }

    pub fn primary_remote_stream(&self) -> &RemoteStream {
        &self.remote_stream
    }

    pub fn has_remote_user(&self) -> bool {
        self.has_remote_user
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.values().map(VecDeque::len).sum()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True when the negotiation object reports a live connection, either through
    /// the peer connection state or through ICE having completed.
    pub fn is_established(&self) -> bool {
        self.state == PeerConnectionState::Connected
            || (!self.state.needs_recovery()
                && self.state != PeerConnectionState::Closed
                && self.ice_state.is_some_and(IceConnectionState::is_established))
    }

    pub fn set_local_metadata(&mut self, metadata: ParticipantMetadata) {
        self.local_metadata = metadata;
    }

    /// Makes `peer` the one remote participant this engine negotiates with.
    pub fn set_primary(&mut self, peer: &str) {
        if self.primary.as_deref() == Some(peer) {
            return;
        }
        if let Some(previous) = self.primary.replace(peer.to_string()) {
            tracing::info!(
                target: "huddle::engine",
                previous = %previous,
                peer = %peer,
                "replaced primary peer"
            );
        } else {
            tracing::info!(target: "huddle::engine", peer = %peer, "selected primary peer");
        }
        self.remote_stream.clear();
        self.has_remote_user = false;
    }

    pub fn clear_primary(&mut self) -> Option<SessionId> {
        let previous = self.primary.take();
        if let Some(peer) = &previous {
            tracing::info!(target: "huddle::engine", peer = %peer, "cleared primary peer");
            self.remote_stream.clear();
            self.has_remote_user = false;
        }
        previous
    }

    /// Drops everything held for `peer`; clears the primary if it was them.
    pub fn forget_peer(&mut self, peer: &str) {
        self.pending_candidates.remove(peer);
        self.applied_candidates.retain(|(sender, _)| sender != peer);
        if matches!(&self.last_remote_offer, Some((sender, _)) if sender == peer) {
            self.last_remote_offer = None;
            self.last_answer_sent = None;
        }
        if self.primary.as_deref() == Some(peer) {
            self.clear_primary();
            self.last_remote_answer = None;
        }
    }

    /// Replaces every outbound track, tells the room about the new media state and
    /// renegotiates with the primary peer if there is one.
    pub async fn attach_local_media(&mut self, stream: LocalStream) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.backend.replace_local_tracks(&stream).await?;
        tracing::debug!(
            target: "huddle::engine",
            tracks = stream.tracks.len(),
            generation = self.generation,
            "attached local media"
        );
        self.local_stream = Some(stream);
        self.sink.send(
            SignalingEnvelope::new(EnvelopeKind::StatusUpdate).with_metadata(self.local_metadata.clone()),
        );
        if self.primary.is_some() {
            self.renegotiate(false).await?;
        }
        Ok(())
    }

    /// Starts a new exchange with the primary peer. Only the initiator offers; the
    /// other side asks the initiator to do so.
    pub async fn renegotiate(&mut self, ice_restart: bool) -> Result<(), EngineError> {
        self.ensure_open()?;
        let peer = self.primary.clone().ok_or(EngineError::NoPrimaryPeer)?;
        if is_initiator(&self.local_id, &peer) {
            self.create_offer(ice_restart).await
        } else {
            tracing::debug!(target: "huddle::engine", peer = %peer, "asking initiator to renegotiate");
            self.sink.send(
                SignalingEnvelope::new(EnvelopeKind::Renegotiate)
                    .to(peer)
                    .with_metadata(self.local_metadata.clone()),
            );
            Ok(())
        }
    }

    pub async fn restart_ice(&mut self) -> Result<(), EngineError> {
        self.renegotiate(true).await
    }

    /// Sends a fresh offer to the primary peer, retrying once after a short delay.
    pub async fn create_offer(&mut self, ice_restart: bool) -> Result<(), EngineError> {
        match self.try_create_offer(ice_restart).await {
            Ok(()) => Ok(()),
            Err(EngineError::Backend(err)) if err != BackendError::Closed => {
                tracing::warn!(
                    target: "huddle::engine",
                    error = %err,
                    retry_ms = self.offer_retry_delay.as_millis() as u64,
                    "offer failed; retrying once"
                );
                tokio::time::sleep(self.offer_retry_delay).await;
                self.try_create_offer(ice_restart).await
            }
            Err(err) => Err(err),
        }
    }

    async fn try_create_offer(&mut self, ice_restart: bool) -> Result<(), EngineError> {
        self.ensure_open()?;
        let peer = self.primary.clone().ok_or(EngineError::NoPrimaryPeer)?;
        if self.backend.signaling_state() == SignalingState::HaveLocalOffer {
            // An unanswered offer is replaced, not stacked.
            self.backend.rollback().await?;
        }
        let offer = self.backend.create_offer(ice_restart).await?;
        self.backend.set_local_description(offer.clone()).await?;
        let outgoing = apply_bandwidth_caps(&offer.sdp, self.bandwidth);
        tracing::debug!(
            target: "huddle::engine",
            peer = %peer,
            ice_restart,
            generation = self.generation,
            "sending offer"
        );
        self.sink.send(
            SignalingEnvelope::new(EnvelopeKind::Offer)
                .to(peer)
                .with_sdp(outgoing)
                .with_metadata(self.local_metadata.clone()),
        );
        Ok(())
    }

    pub async fn handle_offer(&mut self, sdp: String, sender: &str) -> Result<OfferOutcome, EngineError> {
        self.ensure_open()?;
        if self.is_duplicate_offer(sender, &sdp) {
            if let Some(answer) = self.last_answer_sent.clone() {
                tracing::debug!(target: "huddle::engine", peer = %sender, "duplicate offer; re-sending answer");
                self.send_answer(sender, answer);
                return Ok(OfferOutcome::Duplicate);
            }
        }

        if self.backend.signaling_state() != SignalingState::Stable {
            tracing::debug!(
                target: "huddle::engine",
                peer = %sender,
                state = ?self.backend.signaling_state(),
                "offer collision; rolling back"
            );
            if let Err(err) = self.backend.rollback().await {
                tracing::warn!(target: "huddle::engine", error = %err, "rollback failed; rebuilding");
                self.rebuild().await?;
            }
        }

        let description = SessionDescription::offer(sdp.clone());
        if let Err(err) = self.backend.set_remote_description(description.clone()).await {
            if err.is_wrong_state() || err == BackendError::Closed {
                return Err(err.into());
            }
            tracing::warn!(
                target: "huddle::engine",
                peer = %sender,
                error = %err,
                "remote offer rejected; rebuilding negotiation backend"
            );
            self.rebuild().await?;
            self.backend.set_remote_description(description).await?;
        }

        self.set_primary(sender);
        self.last_remote_offer = Some((sender.to_string(), sdp));
        self.last_remote_answer = None;
        self.flush_pending_candidates(sender).await;

        let answer = self.backend.create_answer().await?;
        self.backend.set_local_description(answer.clone()).await?;
        let outgoing = apply_bandwidth_caps(&answer.sdp, self.bandwidth);
        self.last_answer_sent = Some(outgoing.clone());
        tracing::debug!(target: "huddle::engine", peer = %sender, "sending answer");
        self.send_answer(sender, outgoing);
        Ok(OfferOutcome::Answered)
    }

    pub async fn handle_answer(&mut self, sdp: String, sender: &str) -> Result<AnswerOutcome, EngineError> {
        self.ensure_open()?;
        if self.primary.as_deref() != Some(sender) {
            tracing::debug!(target: "huddle::engine", peer = %sender, "answer from non-primary peer ignored");
            return Ok(AnswerOutcome::Ignored);
        }
        if self.backend.signaling_state() == SignalingState::Stable {
            if self.last_remote_answer.as_deref() == Some(sdp.as_str()) {
                return Ok(AnswerOutcome::Duplicate);
            }
            tracing::debug!(target: "huddle::engine", peer = %sender, "answer without outstanding offer ignored");
            return Ok(AnswerOutcome::Ignored);
        }

        match self
            .backend
            .set_remote_description(SessionDescription::answer(sdp.clone()))
            .await
        {
            Ok(()) => {
                self.last_remote_answer = Some(sdp);
                self.flush_pending_candidates(sender).await;
                Ok(AnswerOutcome::Applied)
            }
            Err(err) if err.is_wrong_state() => {
                tracing::debug!(target: "huddle::engine", error = %err, "answer arrived in the wrong state");
                Ok(AnswerOutcome::Ignored)
            }
            Err(BackendError::Closed) => Err(BackendError::Closed.into()),
            Err(err) => {
                tracing::warn!(
                    target: "huddle::engine",
                    peer = %sender,
                    error = %err,
                    "failed to apply answer; sending a fresh offer"
                );
                self.create_offer(false).await?;
                Ok(AnswerOutcome::Reoffered)
            }
        }
    }

    /// Applies a remote candidate, or queues it until the sender's description is in
    /// place. Queued candidates are applied in arrival order.
    pub async fn handle_ice_candidate(
        &mut self,
        candidate: IceCandidatePayload,
        sender: &str,
    ) -> Result<CandidateOutcome, EngineError> {
        self.ensure_open()?;
        let key = (sender.to_string(), candidate.candidate.clone());
        let queued = self
            .pending_candidates
            .get(sender)
            .is_some_and(|queue| queue.iter().any(|c| c.candidate == candidate.candidate));
        if queued || self.applied_candidates.contains(&key) {
            return Ok(CandidateOutcome::Duplicate);
        }

        if !self.remote_description_ready(sender).await {
            let queue = self.pending_candidates.entry(sender.to_string()).or_default();
            queue.push_back(candidate);
            tracing::trace!(
                target: "huddle::engine",
                peer = %sender,
                queued = queue.len(),
                "queued early candidate"
            );
            return Ok(CandidateOutcome::Queued);
        }

        self.apply_candidate(sender, candidate).await;
        Ok(CandidateOutcome::Applied)
    }

    async fn remote_description_ready(&self, sender: &str) -> bool {
        self.primary.as_deref() == Some(sender) && self.backend.has_remote_description().await
    }

    async fn flush_pending_candidates(&mut self, sender: &str) {
        let Some(queue) = self.pending_candidates.remove(sender) else {
            return;
        };
        tracing::debug!(
            target: "huddle::engine",
            peer = %sender,
            count = queue.len(),
            "flushing queued candidates"
        );
        for candidate in queue {
            self.apply_candidate(sender, candidate).await;
        }
    }

    async fn apply_candidate(&mut self, sender: &str, candidate: IceCandidatePayload) {
        let line = candidate.candidate.clone();
        match self.backend.add_ice_candidate(candidate).await {
            Ok(()) => {
                self.applied_candidates.insert((sender.to_string(), line));
            }
            Err(err) => tracing::warn!(
                target: "huddle::engine",
                peer = %sender,
                error = %err,
                "failed to add remote candidate"
            ),
        }
    }

    /// Feeds one backend event through the engine. Events from a replaced backend are
    /// dropped.
    pub fn on_backend_event(&mut self, tagged: TaggedEvent) -> Option<EngineNotice> {
        if tagged.generation != self.generation || self.closed {
            tracing::trace!(
                target: "huddle::engine",
                event_generation = tagged.generation,
                generation = self.generation,
                "ignoring event from stale backend"
            );
            return None;
        }
        match tagged.event {
            BackendEvent::LocalCandidate(candidate) => {
                match self.primary.clone() {
                    Some(peer) => self.sink.send(
                        SignalingEnvelope::new(EnvelopeKind::IceCandidate)
                            .to(peer)
                            .with_candidate(candidate),
                    ),
                    None => tracing::debug!(target: "huddle::engine", "local candidate with no primary peer dropped"),
                }
                None
            }
            BackendEvent::ConnectionState(state) => self.update_state(state),
            BackendEvent::IceConnectionState(state) => {
                tracing::debug!(target: "huddle::engine", ice_state = ?state, "ice connection state changed");
                self.ice_state = Some(state);
                None
            }
            BackendEvent::RemoteTrack(track) => {
                if self.primary.is_none() {
                    return None;
                }
                self.has_remote_user = true;
                if self.remote_stream.add(track.clone()) {
                    tracing::info!(
                        target: "huddle::engine",
                        track = %track.id,
                        kind = ?track.kind,
                        "remote track received"
                    );
                    Some(EngineNotice::RemoteTrack(track))
                } else {
                    None
                }
            }
        }
    }

    fn update_state(&mut self, state: PeerConnectionState) -> Option<EngineNotice> {
        if state == self.state {
            return None;
        }
        let from = self.state;
        self.state = state;
        tracing::info!(
            target: "huddle::engine",
            from = %from,
            to = %state,
            generation = self.generation,
            peer = self.primary.as_deref().unwrap_or("-"),
            "peer connection state changed"
        );
        Some(EngineNotice::StateChanged { from, to: state })
    }

    /// Tears the negotiation object down and replaces it with a fresh one, keeping the
    /// primary peer and re-attaching local media.
    pub async fn rebuild(&mut self) -> Result<(), EngineError> {
        self.ensure_open()?;
        let generation = self.generation + 1;
        let fresh = self.factory.create(generation, self.events.clone()).await?;
        let previous = std::mem::replace(&mut self.backend, fresh);
        self.generation = generation;
        if let Err(err) = previous.close().await {
            tracing::debug!(target: "huddle::engine", error = %err, "closing replaced backend failed");
        }
        self.state = PeerConnectionState::New;
        self.ice_state = None;
        self.applied_candidates.clear();
        self.last_remote_offer = None;
        self.last_remote_answer = None;
        self.last_answer_sent = None;
        self.remote_stream.clear();
        self.has_remote_user = false;
        if let Some(stream) = &self.local_stream {
            self.backend.replace_local_tracks(stream).await?;
        }
        tracing::info!(target: "huddle::engine", generation, "rebuilt negotiation backend");
        Ok(())
    }

    /// Explicit teardown. The engine reports `closed` from here on.
    pub async fn close(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.state = PeerConnectionState::Closed;
        self.primary = None;
        self.pending_candidates.clear();
        self.applied_candidates.clear();
        self.local_stream = None;
        self.remote_stream.clear();
        self.has_remote_user = false;
        self.backend.close().await?;
        tracing::info!(target: "huddle::engine", generation = self.generation, "peer connection closed");
        Ok(())
    }

    fn is_duplicate_offer(&self, sender: &str, sdp: &str) -> bool {
        self.backend.signaling_state() == SignalingState::Stable
            && matches!(&self.last_remote_offer, Some((peer, offer)) if peer == sender && offer == sdp)
    }

    fn send_answer(&self, peer: &str, sdp: String) {
        self.sink.send(
            SignalingEnvelope::new(EnvelopeKind::Answer)
                .to(peer)
                .with_sdp(sdp)
                .with_metadata(self.local_metadata.clone()),
        );
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }
}
