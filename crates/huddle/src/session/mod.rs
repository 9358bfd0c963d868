//! The session orchestrator: one task per joined room that owns the engine, the
//! presence tracker and the reconnection controller, fed by a cloneable handle.

mod actor;
mod snapshot;

use std::sync::Arc;

use room_log::RoomLog;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

pub use snapshot::{DebugInfo, SessionSnapshot};

use crate::config::SessionConfig;
use crate::engine::{EngineError, NegotiationFactory, PeerConnectionState};
use crate::identity::{SessionId, SessionIdentity};
use crate::media::{CaptureSource, MediaCapture, MediaError};
use crate::reconnect::RecoveryStrategy;
use actor::SessionActor;

const COMMAND_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("session task has stopped")]
    Stopped,
}

/// Discrete notifications for the rendering layer. State lives in the snapshot; these
/// mark the moments worth a toast or a log line.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ParticipantJoined {
        session_id: SessionId,
        display_name: String,
    },
    ParticipantLeft {
        session_id: SessionId,
        /// Swept for missing heartbeats rather than announced.
        stale: bool,
    },
    PrimaryPeerSelected {
        session_id: SessionId,
    },
    ConnectionStateChanged {
        state: PeerConnectionState,
    },
    ReconnectAttempt {
        attempt: u32,
        strategy: RecoveryStrategy,
    },
    Recovered {
        attempts: u32,
    },
    /// Retries are exhausted; the user has to reconnect.
    ConnectionFailed {
        attempts: u32,
    },
    MediaError {
        source: CaptureSource,
        message: String,
    },
}

/// The injected clients one session runs against.
#[derive(Clone)]
pub struct SessionDeps {
    pub room_log: Arc<dyn RoomLog>,
    pub negotiation: Arc<dyn NegotiationFactory>,
    pub capture: Arc<dyn MediaCapture>,
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

pub(crate) enum Command {
    Connect(Reply<()>),
    Disconnect(Reply<()>),
    Toggle(CaptureSource, Reply<bool>),
}

/// Cloneable front end to a running session. The session stops once every handle is
/// dropped.
#[derive(Clone)]
pub struct SessionHandle {
    identity: SessionIdentity,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    /// Spawns the session task. Must be called from within a Tokio runtime. `config` is
    /// passed through [`SessionConfig::validate`] first.
    pub fn spawn(
        room_id: impl Into<String>,
        identity: SessionIdentity,
        config: SessionConfig,
        deps: SessionDeps,
    ) -> Self {
        let room_id = room_id.into();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (events_tx, _) = broadcast::channel(EVENT_QUEUE);
        let (actor, state) = SessionActor::new(
            room_id,
            identity.clone(),
            config.validate(),
            deps,
            commands_rx,
            events_tx.clone(),
        );
        tokio::spawn(actor.run());
        Self {
            identity,
            commands: commands_tx,
            state,
            events: events_tx,
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Joins the room: opens the signaling channel and a fresh peer connection.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.request(Command::Connect).await
    }

    /// Leaves the room, stops local capture and cancels every timer.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(Command::Disconnect).await
    }

    pub async fn toggle_camera(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::Toggle(CaptureSource::Camera, reply))
            .await
    }

    pub async fn toggle_mic(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::Toggle(CaptureSource::Microphone, reply))
            .await
    }

    pub async fn toggle_screen_share(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::Toggle(CaptureSource::Screen, reply))
            .await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| SessionError::Stopped)?;
        reply_rx.await.map_err(|_| SessionError::Stopped)?
    }
}
