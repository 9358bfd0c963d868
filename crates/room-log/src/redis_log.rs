use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};

use crate::{RoomLog, RoomLogError, RoomLogResult};

/// Room log stored as a capped Redis list, so participants on different hosts can
/// share one room.
#[derive(Clone)]
pub struct RedisRoomLog {
    redis: ConnectionManager,
    retention: usize,
    ttl_seconds: u64,
}

impl RedisRoomLog {
    pub async fn connect(redis_url: &str, retention: usize, ttl_seconds: u64) -> RoomLogResult<Self> {
        let client = Client::open(redis_url).map_err(map_redis_error)?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(map_redis_error)?;
        Ok(Self {
            redis,
            retention: retention.max(1),
            ttl_seconds,
        })
    }

    fn key(room: &str) -> String {
        format!("huddle:room:{room}:log")
    }
}

#[async_trait]
impl RoomLog for RedisRoomLog {
    async fn append(&self, room: &str, payload: String) -> RoomLogResult<()> {
        let mut conn = self.redis.clone();
        let key = Self::key(room);
        let keep_from = -(self.retention as isize);
        redis::pipe()
            .cmd("RPUSH")
            .arg(&key)
            .arg(&payload)
            .ignore()
            .cmd("LTRIM")
            .arg(&key)
            .arg(keep_from)
            .arg(-1)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_seconds)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn read_all(&self, room: &str) -> RoomLogResult<Vec<String>> {
        let mut conn = self.redis.clone();
        conn.lrange::<_, Vec<String>>(Self::key(room), 0, -1)
            .await
            .map_err(map_redis_error)
    }

    async fn clear(&self, room: &str) -> RoomLogResult<()> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(Self::key(room))
            .await
            .map_err(map_redis_error)
    }
}

fn map_redis_error(err: RedisError) -> RoomLogError {
    if err.code() == Some("OOM") {
        tracing::warn!(target: "room_log", error = %err, "redis reported out of memory");
        RoomLogError::QuotaExceeded
    } else {
        RoomLogError::Unavailable(err.to_string())
    }
}
