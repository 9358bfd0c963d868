//! Scripted stand-ins for the negotiation, capture and signaling seams.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use room_log::{LocalRoomLog, RoomLog};

use crate::config::SessionConfig;
use crate::engine::{
    BackendError, BackendEvent, BackendEventSender, NegotiationBackend, NegotiationFactory,
    PeerConnectionState, SdpKind, SessionDescription, SignalingState, TaggedEvent,
};
use crate::identity::SessionIdentity;
use crate::media::{CaptureSource, LocalStream, MediaCapture, MediaError, MediaTrack};
use crate::reconnect::ReconnectPolicy;
use crate::session::{SessionDeps, SessionHandle};
use crate::signaling::{EnvelopeKind, EnvelopeSink, IceCandidatePayload, SignalingEnvelope};

pub const ROOM: &str = "test-room";

/// Defaults with jitter off and no ICE servers. Bypasses `validate` so scenarios can
/// pick their own timing.
pub fn test_config() -> SessionConfig {
    SessionConfig {
        reconnect: ReconnectPolicy {
            jitter: false,
            ..ReconnectPolicy::default()
        },
        ice_servers: Vec::new(),
        ..SessionConfig::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedOffer {
    pub generation: u64,
    pub ice_restart: bool,
}

#[derive(Debug, Default)]
pub struct Records {
    pub offers: Vec<RecordedOffer>,
    pub answers: u32,
    pub rollbacks: u32,
    pub candidates: Vec<String>,
    pub tracks: Vec<Vec<String>>,
    /// Candidates applied before any remote description was set.
    pub violations: Vec<String>,
    pub generations: Vec<u64>,
}

struct FakeShared {
    label: String,
    auto_connect: AtomicBool,
    fail_offers: AtomicU32,
    fail_remote_answers: AtomicU32,
    fail_remote_offers: AtomicU32,
    fail_rollbacks: AtomicBool,
    sdp_counter: AtomicU64,
    records: Mutex<Records>,
    backends: Mutex<Vec<Arc<FakeCore>>>,
}

/// Builds scripted backends and keeps every one it built for inspection.
#[derive(Clone)]
pub struct FakeFactory {
    shared: Arc<FakeShared>,
}

impl FakeFactory {
    pub fn new(label: &str) -> Self {
        Self {
            shared: Arc::new(FakeShared {
                label: label.to_string(),
                auto_connect: AtomicBool::new(false),
                fail_offers: AtomicU32::new(0),
                fail_remote_answers: AtomicU32::new(0),
                fail_remote_offers: AtomicU32::new(0),
                fail_rollbacks: AtomicBool::new(false),
                sdp_counter: AtomicU64::new(0),
                records: Mutex::new(Records::default()),
                backends: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Reports `connecting` then `connected` once both descriptions are applied.
    pub fn auto_connect(self) -> Self {
        self.shared.auto_connect.store(true, Ordering::SeqCst);
        self
    }

    pub fn fail_next_offers(&self, count: u32) {
        self.shared.fail_offers.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_remote_answers(&self, count: u32) {
        self.shared.fail_remote_answers.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_remote_offers(&self, count: u32) {
        self.shared.fail_remote_offers.store(count, Ordering::SeqCst);
    }

    pub fn fail_rollbacks(&self) {
        self.shared.fail_rollbacks.store(true, Ordering::SeqCst);
    }

    pub fn records(&self) -> parking_lot::MutexGuard<'_, Records> {
        self.shared.records.lock()
    }

    pub fn backend_count(&self) -> usize {
        self.shared.backends.lock().len()
    }

    /// Emits a connection state from the most recently built backend.
    pub fn inject_state(&self, state: PeerConnectionState) {
        if let Some(core) = self.shared.backends.lock().last() {
            core.emit(BackendEvent::ConnectionState(state));
        }
    }

    /// Emits an event from the most recently built backend.
    pub fn inject(&self, event: BackendEvent) {
        if let Some(core) = self.shared.backends.lock().last() {
            core.emit(event);
        }
    }

    pub fn signaling_state(&self) -> Option<SignalingState> {
        self.shared
            .backends
            .lock()
            .last()
            .map(|core| core.state.lock().signaling)
    }
}

#[async_trait]
impl NegotiationFactory for FakeFactory {
    async fn create(
        &self,
        generation: u64,
        events: BackendEventSender,
    ) -> Result<Box<dyn NegotiationBackend>, BackendError> {
        let core = Arc::new(FakeCore {
            shared: Arc::clone(&self.shared),
            generation,
            events,
            state: Mutex::new(FakeState::default()),
        });
        self.shared.backends.lock().push(Arc::clone(&core));
        self.shared.records.lock().generations.push(generation);
        Ok(Box::new(FakeBackend(core)))
    }
}

struct FakeState {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    connection: PeerConnectionState,
    closed: bool,
    candidates_emitted: u32,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            local: None,
            remote: None,
            connection: PeerConnectionState::New,
            closed: false,
            candidates_emitted: 0,
        }
    }
}

struct FakeCore {
    shared: Arc<FakeShared>,
    generation: u64,
    events: BackendEventSender,
    state: Mutex<FakeState>,
}

impl FakeCore {
    fn emit(&self, event: BackendEvent) {
        let _ = self.events.send(TaggedEvent {
            generation: self.generation,
            event,
        });
    }

    fn fake_sdp(&self, kind: &str) -> String {
        let n = self.shared.sdp_counter.fetch_add(1, Ordering::SeqCst);
        format!(
            "v=0\r\no=- {n} {generation} IN IP4 0.0.0.0\r\ns={kind}-{label}\r\nt=0 0\r\n\
             m=audio 9 UDP/TLS/RTP/SAVPF 111\r\nc=IN IP4 0.0.0.0\r\na=rtpmap:111 opus/48000/2\r\n\
             m=video 9 UDP/TLS/RTP/SAVPF 96\r\nc=IN IP4 0.0.0.0\r\na=rtpmap:96 VP8/90000\r\n",
            generation = self.generation,
            label = self.shared.label,
        )
    }

    fn local_candidate(&self, state: &mut FakeState) -> IceCandidatePayload {
        state.candidates_emitted += 1;
        let mut candidate = IceCandidatePayload::new(format!(
            "candidate:{} 1 udp 2122260223 10.0.0.{} {} typ host",
            self.shared.label,
            self.generation,
            50_000 + state.candidates_emitted
        ));
        candidate.sdp_mid = Some("0".into());
        candidate.sdp_mline_index = Some(0);
        candidate
    }

    /// Events to emit once both descriptions are in place.
    fn connect_events(&self, state: &mut FakeState) -> Vec<BackendEvent> {
        let ready = self.shared.auto_connect.load(Ordering::SeqCst)
            && state.signaling == SignalingState::Stable
            && state.local.is_some()
            && state.remote.is_some()
            && state.connection != PeerConnectionState::Connected;
        if !ready {
            return Vec::new();
        }
        state.connection = PeerConnectionState::Connected;
        vec![
            BackendEvent::ConnectionState(PeerConnectionState::Connecting),
            BackendEvent::ConnectionState(PeerConnectionState::Connected),
        ]
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

struct FakeBackend(Arc<FakeCore>);

#[async_trait]
impl NegotiationBackend for FakeBackend {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, BackendError> {
        let core = &self.0;
        if core.state.lock().closed {
            return Err(BackendError::Closed);
        }
        if take_one(&core.shared.fail_offers) {
            return Err(BackendError::Failed("scripted offer failure".into()));
        }
        core.shared.records.lock().offers.push(RecordedOffer {
            generation: core.generation,
            ice_restart,
        });
        Ok(SessionDescription::offer(core.fake_sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, BackendError> {
        let core = &self.0;
        if core.state.lock().signaling != SignalingState::HaveRemoteOffer {
            return Err(BackendError::WrongState("no remote offer to answer".into()));
        }
        core.shared.records.lock().answers += 1;
        Ok(SessionDescription::answer(core.fake_sdp("answer")))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), BackendError> {
        let core = &self.0;
        let mut events = Vec::new();
        {
            let mut state = core.state.lock();
            if state.closed {
                return Err(BackendError::Closed);
            }
            match (description.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable) => {
                    state.signaling = SignalingState::HaveLocalOffer;
                }
                (SdpKind::Answer, SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::Stable;
                }
                (kind, current) => {
                    return Err(BackendError::WrongState(format!(
                        "cannot set local {kind:?} in signaling state {current:?}"
                    )));
                }
            }
            state.local = Some(description);
            events.push(BackendEvent::LocalCandidate(core.local_candidate(&mut state)));
            events.extend(core.connect_events(&mut state));
        }
        for event in events {
            core.emit(event);
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), BackendError> {
        let core = &self.0;
        let mut events = Vec::new();
        {
            let mut state = core.state.lock();
            if state.closed {
                return Err(BackendError::Closed);
            }
            match (description.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable) => {
                    if take_one(&core.shared.fail_remote_offers) {
                        return Err(BackendError::Failed("scripted remote offer failure".into()));
                    }
                    state.signaling = SignalingState::HaveRemoteOffer;
                }
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => {
                    if take_one(&core.shared.fail_remote_answers) {
                        return Err(BackendError::Failed("scripted remote answer failure".into()));
                    }
                    state.signaling = SignalingState::Stable;
                }
                (kind, current) => {
                    return Err(BackendError::WrongState(format!(
                        "cannot set remote {kind:?} in signaling state {current:?}"
                    )));
                }
            }
            state.remote = Some(description);
            events.extend(core.connect_events(&mut state));
        }
        for event in events {
            core.emit(event);
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), BackendError> {
        let core = &self.0;
        if core.shared.fail_rollbacks.load(Ordering::SeqCst) {
            return Err(BackendError::Failed("scripted rollback failure".into()));
        }
        let mut state = core.state.lock();
        match state.signaling {
            SignalingState::HaveLocalOffer => state.local = None,
            SignalingState::HaveRemoteOffer => state.remote = None,
            current => {
                return Err(BackendError::WrongState(format!(
                    "nothing to roll back in {current:?}"
                )))
            }
        }
        state.signaling = SignalingState::Stable;
        core.shared.records.lock().rollbacks += 1;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), BackendError> {
        let core = &self.0;
        if core.state.lock().remote.is_none() {
            core.shared
                .records
                .lock()
                .violations
                .push(candidate.candidate.clone());
            return Err(BackendError::WrongState("remote description not set".into()));
        }
        core.shared.records.lock().candidates.push(candidate.candidate);
        Ok(())
    }

    async fn replace_local_tracks(&self, stream: &LocalStream) -> Result<(), BackendError> {
        let ids = stream.tracks.iter().map(|track| track.id.clone()).collect();
        self.0.shared.records.lock().tracks.push(ids);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.0.state.lock().remote.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        self.0.state.lock().signaling
    }

    async fn close(&self) -> Result<(), BackendError> {
        let core = &self.0;
        {
            let mut state = core.state.lock();
            state.closed = true;
            state.signaling = SignalingState::Closed;
            state.connection = PeerConnectionState::Closed;
        }
        core.emit(BackendEvent::ConnectionState(PeerConnectionState::Closed));
        Ok(())
    }
}

/// Capture devices that hand out numbered tracks and can be told to refuse.
#[derive(Default)]
pub struct FakeCapture {
    next: AtomicU32,
    failing: Mutex<HashSet<CaptureSource>>,
    released: Mutex<Vec<String>>,
}

impl FakeCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, source: CaptureSource) {
        self.failing.lock().insert(source);
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn acquire(&self, source: CaptureSource) -> Result<MediaTrack, MediaError> {
        if self.failing.lock().contains(&source) {
            return Err(MediaError::PermissionDenied(source));
        }
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let prefix = match source {
            CaptureSource::Microphone => "mic",
            CaptureSource::Camera => "cam",
            CaptureSource::Screen => "screen",
        };
        Ok(MediaTrack {
            id: format!("{prefix}-{n}"),
            kind: source.kind(),
            source,
        })
    }

    fn release(&self, track: &MediaTrack) {
        self.released.lock().push(track.id.clone());
    }
}

/// Collects everything an engine sends.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<SignalingEnvelope>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<SignalingEnvelope> {
        self.sent.lock().clone()
    }

    pub fn of_kind(&self, kind: EnvelopeKind) -> Vec<SignalingEnvelope> {
        self.sent
            .lock()
            .iter()
            .filter(|envelope| envelope.kind == kind)
            .cloned()
            .collect()
    }
}

impl EnvelopeSink for RecordingSink {
    fn send(&self, envelope: SignalingEnvelope) {
        self.sent.lock().push(envelope);
    }
}

pub struct TestSession {
    pub handle: SessionHandle,
    pub factory: FakeFactory,
    pub capture: Arc<FakeCapture>,
}

pub fn spawn_session(
    session_id: &str,
    log: &Arc<LocalRoomLog>,
    factory: FakeFactory,
    config: SessionConfig,
) -> TestSession {
    let capture = FakeCapture::new();
    let deps = SessionDeps {
        room_log: Arc::clone(log) as Arc<dyn RoomLog>,
        negotiation: Arc::new(factory.clone()),
        capture: Arc::clone(&capture) as Arc<dyn MediaCapture>,
    };
    let handle = SessionHandle::spawn(
        ROOM,
        SessionIdentity::new(session_id, session_id.to_uppercase()),
        config,
        deps,
    );
    TestSession {
        handle,
        factory,
        capture,
    }
}

/// Every parseable envelope currently in the room log.
pub async fn logged_envelopes(log: &LocalRoomLog) -> Vec<SignalingEnvelope> {
    log.read_all(ROOM)
        .await
        .expect("read room log")
        .iter()
        .filter_map(|raw| SignalingEnvelope::from_json(raw).ok())
        .collect()
}

/// Writes an envelope into the room log as if another client had sent it.
pub async fn inject_envelope(log: &LocalRoomLog, envelope: SignalingEnvelope) {
    let raw = envelope.to_json().expect("serialize envelope");
    log.append(ROOM, raw).await.expect("append to room log");
}
