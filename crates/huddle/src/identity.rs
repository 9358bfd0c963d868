use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub type SessionId = String;

/// Who this participant is for the lifetime of a room visit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    pub session_id: SessionId,
    pub display_name: String,
}

/// Session-scoped key/value storage that survives a reload of the same room.
pub trait IdentityStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
}

#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    entries: parking_lot::Mutex<HashMap<String, String>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.entries.lock().insert(key.to_string(), value);
    }
}

fn storage_key(room_id: &str) -> String {
    format!("huddle:identity:{room_id}")
}

impl SessionIdentity {
    pub fn new(session_id: impl Into<SessionId>, display_name: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            display_name: display_name.into(),
        }
    }

    pub fn generate(display_name: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), display_name)
    }

    /// Returns the identity stored for `room_id`, creating and storing a fresh one when
    /// none exists. A stored identity is returned as-is, display name included.
    pub fn load_or_create(
        store: &dyn IdentityStore,
        room_id: &str,
        display_name: impl Into<String>,
    ) -> Self {
        let key = storage_key(room_id);
        if let Some(raw) = store.get(&key) {
            match serde_json::from_str::<SessionIdentity>(&raw) {
                Ok(identity) => {
                    tracing::debug!(
                        target: "huddle::identity",
                        room = %room_id,
                        session_id = %identity.session_id,
                        "restored session identity"
                    );
                    return identity;
                }
                Err(err) => {
                    tracing::warn!(
                        target: "huddle::identity",
                        room = %room_id,
                        error = %err,
                        "discarding unreadable stored identity"
                    );
                }
            }
        }

        let identity = Self::generate(display_name);
        match serde_json::to_string(&identity) {
            Ok(raw) => store.set(&key, raw),
            Err(err) => tracing::warn!(
                target: "huddle::identity",
                error = %err,
                "failed to persist session identity"
            ),
        }
        identity
    }

    pub fn initiates_with(&self, remote: &str) -> bool {
        is_initiator(&self.session_id, remote)
    }
}

/// The side whose session id sorts lower opens every fresh negotiation.
pub fn is_initiator(local: &str, remote: &str) -> bool {
    local < remote
}
