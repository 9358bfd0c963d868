use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};

use super::snapshot::{connected_flag, DebugInfo, SessionSnapshot};
use super::{Command, SessionDeps, SessionError, SessionEvent};
use crate::config::SessionConfig;
use crate::engine::{EngineNotice, PeerConnectionEngine, PeerConnectionState, TaggedEvent};
use crate::identity::{is_initiator, SessionId, SessionIdentity};
use crate::media::{CaptureSource, LocalMedia, LocalStream};
use crate::presence::{Heartbeat, PresenceTracker};
use crate::reconnect::{ReconnectDecision, ReconnectStatus, ReconnectionController, RecoveryStrategy};
use crate::signaling::{
    ChannelOptions, EnvelopeKind, EnvelopeSink, ParticipantMetadata, SignalingChannel,
    SignalingEnvelope,
};

enum Wake {
    Command(Option<Command>),
    Envelope(SignalingEnvelope),
    Backend(TaggedEvent),
    Heartbeat,
    Sweep,
    PeriodicOffer,
    ReconnectDue,
    AttemptExpired,
}

pub(super) struct SessionActor {
    room_id: String,
    identity: SessionIdentity,
    config: SessionConfig,
    deps: SessionDeps,
    media: LocalMedia,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    live: Option<LiveRoom>,
    last_state: PeerConnectionState,
    last_error: Option<String>,
}

impl SessionActor {
    pub(super) fn new(
        room_id: String,
        identity: SessionIdentity,
        config: SessionConfig,
        deps: SessionDeps,
        commands: mpsc::Receiver<Command>,
        events: broadcast::Sender<SessionEvent>,
    ) -> (Self, watch::Receiver<SessionSnapshot>) {
        let media = LocalMedia::new(Arc::clone(&deps.capture));
        let initial = SessionSnapshot::initial(&identity.session_id, &room_id, media.stream());
        let (state, state_rx) = watch::channel(initial);
        let actor = Self {
            room_id,
            identity,
            config,
            deps,
            media,
            commands,
            state,
            events,
            live: None,
            last_state: PeerConnectionState::New,
            last_error: None,
        };
        (actor, state_rx)
    }

    pub(super) async fn run(mut self) {
        tracing::debug!(
            target: "huddle::session",
            room = %self.room_id,
            session_id = %self.identity.session_id,
            "session task started"
        );
        loop {
            match self.next_wake().await {
                Wake::Command(None) => break,
                Wake::Command(Some(command)) => self.handle_command(command).await,
                wake => {
                    if let Some(live) = self.live.as_mut() {
                        live.handle(wake).await;
                    }
                }
            }
            self.publish();
        }
        self.leave_room().await;
        self.publish();
        tracing::debug!(target: "huddle::session", room = %self.room_id, "session task stopped");
    }

    async fn next_wake(&mut self) -> Wake {
        let Some(live) = self.live.as_mut() else {
            return Wake::Command(self.commands.recv().await);
        };
        tokio::select! {
            command = self.commands.recv() => Wake::Command(command),
            Some(envelope) = live.inbound.recv() => Wake::Envelope(envelope),
            Some(event) = live.backend_events.recv() => Wake::Backend(event),
            _ = live.heartbeat.tick() => Wake::Heartbeat,
            _ = live.sweep.tick() => Wake::Sweep,
            _ = live.periodic_offer.tick() => Wake::PeriodicOffer,
            _ = sleep_until_opt(live.reconnect_at) => Wake::ReconnectDue,
            _ = sleep_until_opt(live.attempt_deadline) => Wake::AttemptExpired,
        }
    }

    /// Replies only after the snapshot reflects the command.
    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                let result = self.join_room().await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::Disconnect(reply) => {
                self.leave_room().await;
                self.publish();
                let _ = reply.send(Ok(()));
            }
            Command::Toggle(source, reply) => {
                let result = self.toggle(source).await;
                self.publish();
                let _ = reply.send(result);
            }
        }
    }

    async fn join_room(&mut self) -> Result<(), SessionError> {
        if self.live.is_some() {
            return Ok(());
        }
        let local_id = self.identity.session_id.clone();
        let channel = Arc::new(SignalingChannel::open(
            self.room_id.clone(),
            local_id.clone(),
            Arc::clone(&self.deps.room_log),
            ChannelOptions::from(&self.config),
        ));
        let inbound = channel.subscribe();
        let (backend_tx, backend_events) = mpsc::unbounded_channel();
        let sink: Arc<dyn EnvelopeSink> = channel.clone();

        let mut engine = match PeerConnectionEngine::new(
            local_id.clone(),
            sink,
            Arc::clone(&self.deps.negotiation),
            backend_tx,
            &self.config,
        )
        .await
        {
            Ok(engine) => engine,
            Err(err) => {
                channel.close().await;
                return Err(err.into());
            }
        };
        let metadata = self.metadata();
        engine.set_local_metadata(metadata.clone());
        let stream = self.media.stream();
        if !stream.is_empty() {
            if let Err(err) = engine.attach_local_media(stream).await {
                let _ = engine.close().await;
                channel.close().await;
                return Err(err.into());
            }
        }

        let now = Instant::now();
        self.live = Some(LiveRoom {
            local_id,
            stale_threshold: self.config.stale_threshold,
            channel,
            inbound,
            engine,
            backend_events,
            presence: PresenceTracker::new(),
            reconnect: ReconnectionController::new(self.config.reconnect.clone()),
            metadata,
            events: self.events.clone(),
            heartbeat: ticker(interval(self.config.heartbeat_interval)),
            sweep: ticker(interval_at(now + self.config.sweep_interval, self.config.sweep_interval)),
            periodic_offer: ticker(interval_at(
                now + self.config.periodic_offer_interval,
                self.config.periodic_offer_interval,
            )),
            reconnect_at: None,
            attempt_deadline: None,
            last_error: None,
        });
        tracing::info!(
            target: "huddle::session",
            room = %self.room_id,
            session_id = %self.identity.session_id,
            "joined room"
        );
        Ok(())
    }

    async fn leave_room(&mut self) {
        self.media.stop_all();
        let Some(mut live) = self.live.take() else {
            return;
        };
        live.channel
            .send(SignalingEnvelope::new(EnvelopeKind::ParticipantLeft));
        if let Err(err) = live.engine.close().await {
            tracing::debug!(target: "huddle::session", error = %err, "engine close reported an error");
        }
        live.channel.close().await;
        self.last_state = PeerConnectionState::Closed;
        tracing::info!(target: "huddle::session", room = %self.room_id, "left room");
    }

    async fn toggle(&mut self, source: CaptureSource) -> Result<bool, SessionError> {
        let enabled = match self.media.toggle(source).await {
            Ok(enabled) => enabled,
            Err(err) => {
                tracing::warn!(target: "huddle::session", ?source, error = %err, "media toggle failed");
                self.last_error = Some(err.to_string());
                let _ = self.events.send(SessionEvent::MediaError {
                    source,
                    message: err.to_string(),
                });
                return Err(err.into());
            }
        };
        let metadata = self.metadata();
        let stream = self.media.stream();
        if let Some(live) = self.live.as_mut() {
            live.update_local_media(metadata, stream).await;
            live.sync_participants();
        }
        Ok(enabled)
    }

    fn metadata(&self) -> ParticipantMetadata {
        self.media.flags().to_metadata(&self.identity.display_name)
    }

    fn publish(&mut self) {
        let next = self.build_snapshot();
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn build_snapshot(&self) -> SessionSnapshot {
        let local_media = self.media.flags();
        let local_stream = self.media.stream();
        let Some(live) = self.live.as_ref() else {
            let mut snapshot =
                SessionSnapshot::initial(&self.identity.session_id, &self.room_id, local_stream);
            snapshot.connection_state = self.last_state;
            snapshot.local_media = local_media;
            snapshot.debug_info.last_error = self.last_error.clone();
            return snapshot;
        };

        let engine = &live.engine;
        let state = engine.state();
        let primary = engine.primary_peer();
        SessionSnapshot {
            connection_state: state,
            is_connected: connected_flag(state, engine.is_established(), self.config.strict_connected),
            local_media,
            local_stream,
            remote_stream: engine.primary_remote_stream().clone(),
            remote_participant: primary.and_then(|id| live.presence.get(id)).cloned(),
            remote_participants: live.presence.participants(),
            reconnect: live.reconnect.status(),
            debug_info: DebugInfo {
                session_id: self.identity.session_id.clone(),
                room_id: self.room_id.clone(),
                generation: engine.generation(),
                primary_peer: primary.map(str::to_string),
                ice_state: engine.ice_state(),
                signaling_state: Some(engine.signaling_state()),
                pending_candidates: engine.pending_candidate_count(),
                reconnect_attempts: live.reconnect.attempts(),
                last_error: live.last_error.clone().or_else(|| self.last_error.clone()),
            },
        }
    }
}

/// Per-room state; exists between `connect` and `disconnect`. Dropping it cancels
/// every timer.
struct LiveRoom {
    local_id: SessionId,
    stale_threshold: Duration,
    channel: Arc<SignalingChannel>,
    inbound: mpsc::UnboundedReceiver<SignalingEnvelope>,
    engine: PeerConnectionEngine,
    backend_events: mpsc::UnboundedReceiver<TaggedEvent>,
    presence: PresenceTracker,
    reconnect: ReconnectionController,
    metadata: ParticipantMetadata,
    events: broadcast::Sender<SessionEvent>,
    heartbeat: Interval,
    sweep: Interval,
    periodic_offer: Interval,
    reconnect_at: Option<Instant>,
    attempt_deadline: Option<Instant>,
    last_error: Option<String>,
}

impl LiveRoom {
    async fn handle(&mut self, wake: Wake) {
        match wake {
            Wake::Envelope(envelope) => self.on_envelope(envelope).await,
            Wake::Backend(event) => self.on_backend_event(event).await,
            Wake::Heartbeat => self.broadcast_presence(),
            Wake::Sweep => self.sweep().await,
            Wake::PeriodicOffer => self.periodic_offer().await,
            Wake::ReconnectDue => self.run_reconnect_attempt().await,
            Wake::AttemptExpired => self.attempt_expired().await,
            Wake::Command(_) => {}
        }
        self.sync_participants();
    }

    async fn on_envelope(&mut self, envelope: SignalingEnvelope) {
        let now = Instant::now();
        let SignalingEnvelope {
            kind,
            sender,
            sdp,
            candidate,
            metadata,
            ..
        } = envelope;
        tracing::trace!(target: "huddle::session", kind = kind.as_str(), peer = %sender, "envelope received");

        match kind {
            EnvelopeKind::Presence => {
                self.record_heartbeat(&sender, metadata.as_ref(), now);
                self.maybe_initiate().await;
            }
            EnvelopeKind::StatusUpdate => self.record_heartbeat(&sender, metadata.as_ref(), now),
            EnvelopeKind::ParticipantLeft => {
                if self.presence.mark_left(&sender).is_some() {
                    self.emit(SessionEvent::ParticipantLeft {
                        session_id: sender.clone(),
                        stale: false,
                    });
                }
                self.release_peer(&sender).await;
            }
            EnvelopeKind::Offer => {
                self.record_heartbeat(&sender, metadata.as_ref(), now);
                match sdp {
                    Some(sdp) => self.on_offer(sdp, &sender).await,
                    None => tracing::debug!(target: "huddle::session", peer = %sender, "offer without sdp dropped"),
                }
            }
            EnvelopeKind::Answer => {
                self.record_heartbeat(&sender, metadata.as_ref(), now);
                let Some(sdp) = sdp else {
                    tracing::debug!(target: "huddle::session", peer = %sender, "answer without sdp dropped");
                    return;
                };
                match self.engine.handle_answer(sdp, &sender).await {
                    Ok(outcome) => {
                        tracing::debug!(target: "huddle::session", peer = %sender, ?outcome, "answer handled")
                    }
                    Err(err) => self.note_error("apply answer", &err),
                }
            }
            EnvelopeKind::IceCandidate => {
                self.presence.touch(&sender, now);
                let Some(candidate) = candidate else {
                    return;
                };
                if let Err(err) = self.engine.handle_ice_candidate(candidate, &sender).await {
                    self.note_error("apply candidate", &err);
                }
            }
            EnvelopeKind::Renegotiate => {
                self.presence.touch(&sender, now);
                self.on_renegotiate(&sender).await;
            }
            EnvelopeKind::ChannelReset => {
                tracing::debug!(target: "huddle::session", peer = %sender, "room log was reset; re-announcing");
                self.broadcast_presence();
            }
        }
    }

    fn record_heartbeat(&mut self, sender: &str, metadata: Option<&ParticipantMetadata>, now: Instant) {
        if self.presence.record_heartbeat(sender, metadata, now) == Heartbeat::Joined {
            let display_name = self
                .presence
                .get(sender)
                .map(|participant| participant.display_name.clone())
                .unwrap_or_else(|| sender.to_string());
            self.emit(SessionEvent::ParticipantJoined {
                session_id: sender.to_string(),
                display_name,
            });
        }
    }

    /// Picks the lowest present id as the primary peer when none is negotiated, and
    /// offers if we are the lower side.
    async fn maybe_initiate(&mut self) {
        if self.engine.primary_peer().is_some() {
            return;
        }
        let Some(peer) = self.presence.ids().into_iter().next() else {
            return;
        };
        if !is_initiator(&self.local_id, &peer) {
            tracing::debug!(target: "huddle::session", peer = %peer, "waiting for the lower id to offer");
            return;
        }
        self.engine.set_primary(&peer);
        self.reconnect.reset();
        self.emit(SessionEvent::PrimaryPeerSelected {
            session_id: peer.clone(),
        });
        if let Err(err) = self.engine.create_offer(false).await {
            self.note_error("initial offer", &err);
        }
    }

    async fn on_offer(&mut self, sdp: String, sender: &str) {
        if let Some(primary) = self.engine.primary_peer().map(str::to_string) {
            if primary != sender {
                if self.presence.contains(&primary) {
                    tracing::debug!(
                        target: "huddle::session",
                        peer = %sender,
                        primary = %primary,
                        "offer from non-primary peer ignored"
                    );
                    return;
                }
                self.engine.forget_peer(&primary);
            }
        }
        let newly_selected = self.engine.primary_peer() != Some(sender);
        match self.engine.handle_offer(sdp, sender).await {
            Ok(outcome) => {
                tracing::debug!(target: "huddle::session", peer = %sender, ?outcome, "offer handled");
                if newly_selected {
                    self.reconnect.reset();
                    self.reconnect_at = None;
                    self.attempt_deadline = None;
                    self.emit(SessionEvent::PrimaryPeerSelected {
                        session_id: sender.to_string(),
                    });
                }
            }
            Err(err) => self.note_error("apply offer", &err),
        }
    }

    async fn on_renegotiate(&mut self, sender: &str) {
        if !is_initiator(&self.local_id, sender) {
            tracing::debug!(target: "huddle::session", peer = %sender, "renegotiate request from the initiator ignored");
            return;
        }
        match self.engine.primary_peer() {
            Some(primary) if primary == sender => {}
            None if self.presence.contains(sender) => {
                self.engine.set_primary(sender);
                self.reconnect.reset();
                self.emit(SessionEvent::PrimaryPeerSelected {
                    session_id: sender.to_string(),
                });
            }
            _ => {
                tracing::debug!(target: "huddle::session", peer = %sender, "renegotiate request ignored");
                return;
            }
        }
        let ice_restart = !self.engine.is_established();
        if let Err(err) = self.engine.create_offer(ice_restart).await {
            self.note_error("renegotiation offer", &err);
        }
    }

    /// Forgets `peer`. When it was the primary, the backend is rebuilt so the next peer
    /// negotiates from scratch.
    async fn release_peer(&mut self, peer: &str) {
        let was_primary = self.engine.primary_peer() == Some(peer);
        self.engine.forget_peer(peer);
        if !was_primary {
            return;
        }
        self.reconnect.reset();
        self.reconnect_at = None;
        self.attempt_deadline = None;
        let before = self.engine.state();
        if let Err(err) = self.engine.rebuild().await {
            self.note_error("rebuild after primary left", &err);
        }
        if self.engine.state() != before {
            self.emit(SessionEvent::ConnectionStateChanged {
                state: self.engine.state(),
            });
        }
        self.maybe_initiate().await;
    }

    async fn release_absent_primary(&mut self) {
        let Some(primary) = self.engine.primary_peer().map(str::to_string) else {
            return;
        };
        if !self.presence.contains(&primary) {
            self.release_peer(&primary).await;
        }
    }

    async fn on_backend_event(&mut self, tagged: TaggedEvent) {
        let Some(notice) = self.engine.on_backend_event(tagged) else {
            return;
        };
        match notice {
            EngineNotice::StateChanged { to, .. } => {
                self.emit(SessionEvent::ConnectionStateChanged { state: to });
                let decision = self.reconnect.observe_state(to);
                self.apply_decision(decision).await;
            }
            EngineNotice::RemoteTrack(track) => {
                tracing::debug!(target: "huddle::session", track = %track.id, "remote media updated");
            }
        }
    }

    async fn sweep(&mut self) {
        let stale = self.presence.sweep_stale(self.stale_threshold, Instant::now());
        for participant in stale {
            let session_id = participant.session_id;
            self.emit(SessionEvent::ParticipantLeft {
                session_id: session_id.clone(),
                stale: true,
            });
            if self.engine.primary_peer() == Some(session_id.as_str()) {
                let decision = self.reconnect.observe_stale_primary(self.engine.state());
                self.apply_decision(decision).await;
                if self.reconnect.status() == ReconnectStatus::Exhausted {
                    self.release_absent_primary().await;
                }
            } else {
                self.engine.forget_peer(&session_id);
            }
        }
    }

    async fn periodic_offer(&mut self) {
        let Some(peer) = self.engine.primary_peer().map(str::to_string) else {
            return;
        };
        if !is_initiator(&self.local_id, &peer)
            || self.engine.is_established()
            || !matches!(
                self.engine.state(),
                PeerConnectionState::New | PeerConnectionState::Connecting
            )
            || self.reconnect.status() != ReconnectStatus::Idle
        {
            return;
        }
        tracing::debug!(target: "huddle::session", peer = %peer, "still not connected; re-offering");
        if let Err(err) = self.engine.create_offer(false).await {
            self.note_error("periodic offer", &err);
        }
    }

    async fn apply_decision(&mut self, decision: ReconnectDecision) {
        match decision {
            ReconnectDecision::None => {}
            ReconnectDecision::Schedule { delay, .. } => {
                self.reconnect_at = Some(Instant::now() + delay);
                self.attempt_deadline = None;
            }
            ReconnectDecision::Exhausted { attempts } => {
                self.reconnect_at = None;
                self.attempt_deadline = None;
                self.emit(SessionEvent::ConnectionFailed { attempts });
                self.release_absent_primary().await;
            }
            ReconnectDecision::Recovered { attempts } => {
                self.reconnect_at = None;
                self.attempt_deadline = None;
                self.emit(SessionEvent::Recovered { attempts });
            }
        }
    }

    async fn run_reconnect_attempt(&mut self) {
        self.reconnect_at = None;
        let Some((attempt, strategy)) = self.reconnect.begin_attempt() else {
            return;
        };
        self.broadcast_presence();
        let result = match strategy {
            RecoveryStrategy::IceRestart => self.engine.restart_ice().await,
            RecoveryStrategy::Rebuild => match self.engine.rebuild().await {
                Ok(()) => self.engine.renegotiate(true).await,
                Err(err) => Err(err),
            },
        };
        tracing::info!(target: "huddle::session", attempt, ?strategy, ok = result.is_ok(), "reconnect attempt");
        self.emit(SessionEvent::ReconnectAttempt { attempt, strategy });
        match result {
            Ok(()) => {
                self.attempt_deadline = Some(Instant::now() + self.reconnect.policy().attempt_timeout);
            }
            Err(err) => {
                self.note_error("reconnect attempt", &err);
                let decision = self.reconnect.attempt_failed();
                self.apply_decision(decision).await;
            }
        }
    }

    async fn attempt_expired(&mut self) {
        self.attempt_deadline = None;
        if self.engine.is_established() {
            return;
        }
        tracing::warn!(
            target: "huddle::session",
            attempt = self.reconnect.attempts(),
            state = %self.engine.state(),
            "reconnect attempt did not recover the connection"
        );
        let decision = self.reconnect.attempt_failed();
        self.apply_decision(decision).await;
    }

    async fn update_local_media(&mut self, metadata: ParticipantMetadata, stream: LocalStream) {
        self.metadata = metadata.clone();
        self.engine.set_local_metadata(metadata);
        if let Err(err) = self.engine.attach_local_media(stream).await {
            self.note_error("attach local media", &err);
        }
    }

    /// Mirrors the engine onto the tracker: the primary carries the engine's state and
    /// inbound media, everyone else is `new` with no media.
    fn sync_participants(&mut self) {
        let primary = self.engine.primary_peer().map(str::to_string);
        let state = self.engine.state();
        let stream = self.engine.primary_remote_stream();
        let media = (!stream.is_empty()).then(|| stream.clone());
        for id in self.presence.ids() {
            if primary.as_deref() == Some(id.as_str()) {
                self.presence.set_connection_state(&id, state);
                self.presence.set_media(&id, media.clone());
            } else {
                self.presence.set_connection_state(&id, PeerConnectionState::New);
                self.presence.set_media(&id, None);
            }
        }
    }

    fn broadcast_presence(&self) {
        self.channel
            .send(SignalingEnvelope::new(EnvelopeKind::Presence).with_metadata(self.metadata.clone()));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn note_error(&mut self, context: &str, err: &dyn fmt::Display) {
        tracing::warn!(target: "huddle::session", context, error = %err, "session operation failed");
        self.last_error = Some(format!("{context}: {err}"));
    }
}

fn ticker(mut interval: Interval) -> Interval {
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
