use serde::Serialize;

use crate::engine::{IceConnectionState, PeerConnectionState, SignalingState};
use crate::identity::SessionId;
use crate::media::{LocalMediaFlags, LocalStream, RemoteStream};
use crate::presence::RemoteParticipant;
use crate::reconnect::ReconnectStatus;

/// Diagnostics for the rendering layer's debug panel.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    pub session_id: SessionId,
    pub room_id: String,
    pub generation: u64,
    pub primary_peer: Option<SessionId>,
    pub ice_state: Option<IceConnectionState>,
    pub signaling_state: Option<SignalingState>,
    pub pending_candidates: usize,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

/// Everything the rendering layer shows, republished whenever it changes.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub connection_state: PeerConnectionState,
    pub is_connected: bool,
    pub local_media: LocalMediaFlags,
    pub local_stream: LocalStream,
    pub remote_stream: RemoteStream,
    /// The primary peer, if one is negotiated and still present.
    pub remote_participant: Option<RemoteParticipant>,
    pub remote_participants: Vec<RemoteParticipant>,
    pub reconnect: ReconnectStatus,
    pub debug_info: DebugInfo,
}

impl SessionSnapshot {
    pub(crate) fn initial(session_id: &str, room_id: &str, local_stream: LocalStream) -> Self {
        Self {
            connection_state: PeerConnectionState::New,
            is_connected: false,
            local_media: LocalMediaFlags::default(),
            local_stream,
            remote_stream: RemoteStream::default(),
            remote_participant: None,
            remote_participants: Vec::new(),
            reconnect: ReconnectStatus::Idle,
            debug_info: DebugInfo {
                session_id: session_id.to_string(),
                room_id: room_id.to_string(),
                ..DebugInfo::default()
            },
        }
    }
}

/// `new` and `connecting` count as connected unless `strict` is set. Either way a
/// connection the negotiation object reports as established is connected.
pub(crate) fn connected_flag(state: PeerConnectionState, established: bool, strict: bool) -> bool {
    if established {
        return true;
    }
    if strict {
        return state == PeerConnectionState::Connected;
    }
    matches!(
        state,
        PeerConnectionState::New | PeerConnectionState::Connecting | PeerConnectionState::Connected
    )
}
