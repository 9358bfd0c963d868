use std::env;
use std::time::Duration;

use room_log::LocalRoomLog;

use crate::engine::sdp::BandwidthCaps;
use crate::reconnect::ReconnectPolicy;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Tunables for one session. Every timing value has a working default; `from_env`
/// overrides them from `HUDDLE_*` variables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How often the signaling channel re-scans the room log.
    pub poll_interval: Duration,
    /// Entries kept by room logs built through [`SessionConfig::local_room_log`] or
    /// [`SessionConfig::redis_room_log`].
    pub log_retention: usize,
    /// Size of the recently-seen cache used to drop duplicate envelopes.
    pub dedupe_capacity: usize,
    pub heartbeat_interval: Duration,
    pub sweep_interval: Duration,
    /// Participants silent for longer than this are dropped on the next sweep.
    pub stale_threshold: Duration,
    /// While not connected, the initiator re-offers at this interval.
    pub periodic_offer_interval: Duration,
    pub offer_retry_delay: Duration,
    pub reconnect: ReconnectPolicy,
    pub bandwidth: BandwidthCaps,
    pub ice_servers: Vec<String>,
    /// Report `is_connected` only once the peer connection is actually connected.
    pub strict_connected: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(750),
            log_retention: room_log::DEFAULT_RETENTION,
            dedupe_capacity: 750,
            heartbeat_interval: Duration::from_secs(3),
            sweep_interval: Duration::from_secs(10),
            stale_threshold: Duration::from_secs(15),
            periodic_offer_interval: Duration::from_secs(7),
            offer_retry_delay: Duration::from_secs(2),
            reconnect: ReconnectPolicy::default(),
            bandwidth: BandwidthCaps::default(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            strict_connected: false,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Missing or unparsable values fall
    /// back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str, fallback: Duration| {
            lookup(key)
                .and_then(|val| val.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };
        let number = |key: &str| lookup(key).and_then(|val| val.trim().parse::<u64>().ok());
        let flag = |key: &str| {
            lookup(key).map(|value| {
                let value = value.trim();
                value == "1" || value.eq_ignore_ascii_case("true")
            })
        };

        let mut reconnect = defaults.reconnect.clone();
        if let Some(attempts) = number("HUDDLE_RECONNECT_MAX_ATTEMPTS") {
            reconnect.max_attempts = attempts as u32;
        }
        reconnect.backoff_initial = millis("HUDDLE_RECONNECT_BACKOFF_MS", reconnect.backoff_initial);
        reconnect.backoff_max = millis("HUDDLE_RECONNECT_BACKOFF_MAX_MS", reconnect.backoff_max);
        reconnect.attempt_timeout = millis("HUDDLE_RECONNECT_ATTEMPT_TIMEOUT_MS", reconnect.attempt_timeout);
        if let Some(jitter) = flag("HUDDLE_RECONNECT_JITTER") {
            reconnect.jitter = jitter;
        }

        let mut bandwidth = defaults.bandwidth;
        if let Some(kbps) = number("HUDDLE_VIDEO_BANDWIDTH_KBPS") {
            bandwidth.video_kbps = kbps as u32;
        }
        if let Some(kbps) = number("HUDDLE_AUDIO_BANDWIDTH_KBPS") {
            bandwidth.audio_kbps = kbps as u32;
        }

        let ice_servers = if flag("HUDDLE_LOCALHOST_ONLY").unwrap_or(false) {
            Vec::new()
        } else {
            lookup("HUDDLE_ICE_SERVERS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|url| !url.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(defaults.ice_servers.clone())
        };

        Self {
            poll_interval: millis("HUDDLE_POLL_INTERVAL_MS", defaults.poll_interval),
            log_retention: number("HUDDLE_LOG_RETENTION")
                .map(|n| n as usize)
                .unwrap_or(defaults.log_retention),
            dedupe_capacity: number("HUDDLE_DEDUPE_CAPACITY")
                .map(|n| n as usize)
                .unwrap_or(defaults.dedupe_capacity),
            heartbeat_interval: millis("HUDDLE_HEARTBEAT_MS", defaults.heartbeat_interval),
            sweep_interval: millis("HUDDLE_SWEEP_MS", defaults.sweep_interval),
            stale_threshold: millis("HUDDLE_STALE_MS", defaults.stale_threshold),
            periodic_offer_interval: millis(
                "HUDDLE_PERIODIC_OFFER_MS",
                defaults.periodic_offer_interval,
            ),
            offer_retry_delay: millis("HUDDLE_OFFER_RETRY_MS", defaults.offer_retry_delay),
            reconnect,
            bandwidth,
            ice_servers,
            strict_connected: flag("HUDDLE_STRICT_CONNECTED").unwrap_or(defaults.strict_connected),
        }
        .validate()
    }

    pub fn local_room_log(&self) -> LocalRoomLog {
        LocalRoomLog::new(self.log_retention)
    }

    #[cfg(feature = "redis-log")]
    pub async fn redis_room_log(
        &self,
        redis_url: &str,
        ttl_seconds: u64,
    ) -> room_log::RoomLogResult<room_log::RedisRoomLog> {
        room_log::RedisRoomLog::connect(redis_url, self.log_retention, ttl_seconds).await
    }

    /// Clamps values into the ranges the signaling design depends on. Zero intervals
    /// fall back to their defaults and no timer may exceed [`MAX_TIMER`].
    pub fn validate(mut self) -> Self {
        let defaults = Self::default();
        self.poll_interval = self
            .poll_interval
            .clamp(Duration::from_millis(500), Duration::from_millis(1000));
        self.log_retention = self.log_retention.clamp(50, 200);
        self.dedupe_capacity = self.dedupe_capacity.clamp(500, 1000);
        self.heartbeat_interval = timer(self.heartbeat_interval, defaults.heartbeat_interval);
        self.sweep_interval = timer(self.sweep_interval, defaults.sweep_interval);
        self.periodic_offer_interval = timer(self.periodic_offer_interval, defaults.periodic_offer_interval);
        self.offer_retry_delay = timer(self.offer_retry_delay, defaults.offer_retry_delay);
        self.stale_threshold = self.stale_threshold.min(MAX_TIMER);
        // A participant must miss several heartbeats before it is considered gone.
        if self.stale_threshold <= self.heartbeat_interval * 2 {
            self.stale_threshold = self.heartbeat_interval * 5;
        }

        let reconnect = &mut self.reconnect;
        reconnect.max_attempts = reconnect.max_attempts.max(1);
        reconnect.attempt_timeout = timer(reconnect.attempt_timeout, defaults.reconnect.attempt_timeout);
        reconnect.backoff_initial = reconnect.backoff_initial.min(MAX_TIMER);
        reconnect.backoff_max = reconnect.backoff_max.clamp(reconnect.backoff_initial, MAX_TIMER);
        if !reconnect.backoff_multiplier.is_finite() || reconnect.backoff_multiplier < 1.0 {
            reconnect.backoff_multiplier = defaults.reconnect.backoff_multiplier;
        }
        self
    }
}

/// Upper bound for every interval, threshold and backoff in a [`SessionConfig`].
pub const MAX_TIMER: Duration = Duration::from_secs(24 * 60 * 60);

fn timer(value: Duration, fallback: Duration) -> Duration {
    if value.is_zero() {
        fallback
    } else {
        value.min(MAX_TIMER)
    }
}
