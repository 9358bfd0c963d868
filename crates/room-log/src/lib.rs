//! Shared, bounded, multi-writer log that backs the room signaling channel.
//!
//! Every participant in a room appends serialized envelopes to the same log and
//! periodically reads the whole thing back. The log keeps only the most recent
//! entries; callers must not assume anything older survives.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use thiserror::Error;

#[cfg(feature = "redis-log")]
mod redis_log;

#[cfg(feature = "redis-log")]
pub use redis_log::RedisRoomLog;

/// Entries kept per room when no retention is configured.
pub const DEFAULT_RETENTION: usize = 100;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoomLogError {
    #[error("room log storage quota exceeded")]
    QuotaExceeded,
    #[error("room log unavailable: {0}")]
    Unavailable(String),
}

pub type RoomLogResult<T> = Result<T, RoomLogError>;

#[async_trait]
pub trait RoomLog: Send + Sync {
    /// Appends one entry to the end of the room's log, evicting the oldest entries
    /// beyond the retention bound.
    async fn append(&self, room: &str, payload: String) -> RoomLogResult<()>;

    /// Returns every retained entry, oldest first.
    async fn read_all(&self, room: &str) -> RoomLogResult<Vec<String>>;

    async fn clear(&self, room: &str) -> RoomLogResult<()>;
}

/// In-process log shared through an `Arc` by every participant of a room.
#[derive(Debug)]
pub struct LocalRoomLog {
    rooms: parking_lot::RwLock<HashMap<String, VecDeque<String>>>,
    retention: usize,
    quota_bytes: Option<usize>,
}

impl Default for LocalRoomLog {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl LocalRoomLog {
    pub fn new(retention: usize) -> Self {
        Self {
            rooms: parking_lot::RwLock::new(HashMap::new()),
            retention: retention.max(1),
            quota_bytes: None,
        }
    }

    /// Caps the total payload bytes a single room may hold. Appends that would exceed
    /// the cap fail with [`RoomLogError::QuotaExceeded`].
    pub fn with_quota_bytes(mut self, quota_bytes: usize) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn len(&self, room: &str) -> usize {
        self.rooms.read().get(room).map(VecDeque::len).unwrap_or(0)
    }

    pub fn is_empty(&self, room: &str) -> bool {
        self.len(room) == 0
    }
}

#[async_trait]
impl RoomLog for LocalRoomLog {
    async fn append(&self, room: &str, payload: String) -> RoomLogResult<()> {
        let mut guard = self.rooms.write();
        let entries = guard.entry(room.to_string()).or_default();
        if let Some(quota) = self.quota_bytes {
            let used: usize = entries.iter().map(String::len).sum();
            if used + payload.len() > quota {
                tracing::debug!(
                    target: "room_log",
                    room,
                    used,
                    incoming = payload.len(),
                    quota,
                    "append rejected: quota exceeded"
                );
                return Err(RoomLogError::QuotaExceeded);
            }
        }
        entries.push_back(payload);
        while entries.len() > self.retention {
            entries.pop_front();
        }
        Ok(())
    }

    async fn read_all(&self, room: &str) -> RoomLogResult<Vec<String>> {
        Ok(self
            .rooms
            .read()
            .get(room)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, room: &str) -> RoomLogResult<()> {
        self.rooms.write().remove(room);
        Ok(())
    }
}
