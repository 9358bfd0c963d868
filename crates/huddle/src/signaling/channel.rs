use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use room_log::{RoomLog, RoomLogError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::dedupe::RecentlySeen;
use super::envelope::{EnvelopeKind, SignalingEnvelope};
use super::EnvelopeSink;
use crate::config::SessionConfig;
use crate::identity::SessionId;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub poll_interval: Duration,
    pub dedupe_capacity: usize,
}

impl From<&SessionConfig> for ChannelOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            dedupe_capacity: config.dedupe_capacity,
        }
    }
}

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<SignalingEnvelope>>>>;

/// Best-effort broadcast over a shared room log.
///
/// Sends are stamped and queued to a writer task; a poll task re-reads the log on a
/// fixed interval and fans new envelopes out to subscribers. Neither direction reports
/// errors to the caller.
pub struct SignalingChannel {
    room: String,
    local_id: SessionId,
    clock: Arc<SendClock>,
    send_tx: Mutex<Option<mpsc::UnboundedSender<SignalingEnvelope>>>,
    subscribers: Subscribers,
    writer: Mutex<Option<JoinHandle<()>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Starts the writer and poll tasks. Must be called from within a Tokio runtime.
    pub fn open(
        room: impl Into<String>,
        local_id: impl Into<SessionId>,
        log: Arc<dyn RoomLog>,
        options: ChannelOptions,
    ) -> Self {
        let room = room.into();
        let local_id = local_id.into();
        let clock = Arc::new(SendClock::new(local_id.clone()));
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let (send_tx, send_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(run_writer(
            room.clone(),
            Arc::clone(&log),
            Arc::clone(&clock),
            send_rx,
        ));
        let poller = tokio::spawn(run_poller(
            room.clone(),
            log,
            PollCursor::new(local_id.clone(), options.dedupe_capacity),
            Arc::clone(&subscribers),
            options.poll_interval,
        ));
        tracing::debug!(
            target: "huddle::signaling",
            room = %room,
            session_id = %local_id,
            poll_ms = options.poll_interval.as_millis() as u64,
            "signaling channel opened"
        );

        Self {
            room,
            local_id,
            clock,
            send_tx: Mutex::new(Some(send_tx)),
            subscribers,
            writer: Mutex::new(Some(writer)),
            poller: Mutex::new(Some(poller)),
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Stamps sender and send time, then queues the envelope for the writer.
    pub fn send(&self, mut envelope: SignalingEnvelope) {
        self.clock.stamp(&mut envelope);
        let guard = self.send_tx.lock();
        let Some(send_tx) = guard.as_ref() else {
            tracing::debug!(
                target: "huddle::signaling",
                kind = envelope.kind.as_str(),
                "channel closed; dropping envelope"
            );
            return;
        };
        if send_tx.send(envelope).is_err() {
            tracing::debug!(target: "huddle::signaling", "writer stopped; dropping envelope");
        }
    }

    /// Every envelope from another sender that is broadcast or addressed to us.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SignalingEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Flushes queued sends, then stops both tasks.
    pub async fn close(&self) {
        self.send_tx.lock().take();
        if let Some(poller) = self.poller.lock().take() {
            poller.abort();
        }
        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
                .await
                .is_err()
            {
                tracing::warn!(
                    target: "huddle::signaling",
                    room = %self.room,
                    "writer did not drain in time; aborting"
                );
                writer.abort();
            }
        }
        self.subscribers.lock().clear();
        tracing::debug!(target: "huddle::signaling", room = %self.room, "signaling channel closed");
    }
}

impl EnvelopeSink for SignalingChannel {
    fn send(&self, envelope: SignalingEnvelope) {
        SignalingChannel::send(self, envelope);
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        for slot in [&self.writer, &self.poller] {
            if let Some(handle) = slot.lock().take() {
                handle.abort();
            }
        }
    }
}

struct SendClock {
    local_id: SessionId,
    last: AtomicU64,
}

impl SendClock {
    fn new(local_id: SessionId) -> Self {
        Self {
            local_id,
            last: AtomicU64::new(0),
        }
    }

    fn stamp(&self, envelope: &mut SignalingEnvelope) {
        envelope.sender = self.local_id.clone();
        envelope.timestamp = self.next();
    }

    /// Wall-clock milliseconds, bumped when needed so values never repeat.
    fn next(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }
}

async fn run_writer(
    room: String,
    log: Arc<dyn RoomLog>,
    clock: Arc<SendClock>,
    mut outgoing: mpsc::UnboundedReceiver<SignalingEnvelope>,
) {
    while let Some(envelope) = outgoing.recv().await {
        let payload = match envelope.to_json() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(target: "huddle::signaling", error = %err, "failed to encode envelope");
                continue;
            }
        };
        match log.append(&room, payload.clone()).await {
            Ok(()) => tracing::trace!(
                target: "huddle::signaling",
                kind = envelope.kind.as_str(),
                target_peer = envelope.target.as_deref().unwrap_or("*"),
                timestamp = envelope.timestamp,
                "envelope appended"
            ),
            Err(RoomLogError::QuotaExceeded) => {
                tracing::warn!(
                    target: "huddle::signaling",
                    room = %room,
                    "room log quota exhausted; resetting log"
                );
                reset_log(&room, log.as_ref(), &clock, payload).await;
            }
            Err(err) => tracing::warn!(
                target: "huddle::signaling",
                room = %room,
                error = %err,
                "failed to append envelope"
            ),
        }
    }
}

/// Clears the log, re-appends the envelope that hit the quota, then announces the reset
/// with a later timestamp so receivers accept both.
async fn reset_log(room: &str, log: &dyn RoomLog, clock: &SendClock, pending: String) {
    if let Err(err) = log.clear(room).await {
        tracing::warn!(target: "huddle::signaling", error = %err, "failed to clear room log");
        return;
    }
    if let Err(err) = log.append(room, pending).await {
        tracing::warn!(target: "huddle::signaling", error = %err, "envelope lost during log reset");
    }
    let mut notice = SignalingEnvelope::new(EnvelopeKind::ChannelReset);
    clock.stamp(&mut notice);
    match notice.to_json() {
        Ok(payload) => {
            if let Err(err) = log.append(room, payload).await {
                tracing::warn!(target: "huddle::signaling", error = %err, "failed to announce log reset");
            }
        }
        Err(err) => {
            tracing::warn!(target: "huddle::signaling", error = %err, "failed to encode reset notice")
        }
    }
}

async fn run_poller(
    room: String,
    log: Arc<dyn RoomLog>,
    mut cursor: PollCursor,
    subscribers: Subscribers,
    poll_interval: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let entries = match log.read_all(&room).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::debug!(target: "huddle::signaling", error = %err, "room log read failed");
                continue;
            }
        };
        for raw in entries {
            let envelope = match SignalingEnvelope::from_json(&raw) {
                Ok(envelope) => envelope,
                Err(err) => {
                    tracing::debug!(
                        target: "huddle::signaling",
                        error = %err,
                        "skipping unreadable log entry"
                    );
                    continue;
                }
            };
            if let Some(envelope) = cursor.admit(envelope) {
                tracing::trace!(
                    target: "huddle::signaling",
                    kind = envelope.kind.as_str(),
                    sender = %envelope.sender,
                    timestamp = envelope.timestamp,
                    "envelope delivered"
                );
                subscribers
                    .lock()
                    .retain(|subscriber| subscriber.send(envelope.clone()).is_ok());
            }
        }
    }
}

/// Per-sender high-water marks plus a duplicate filter for negotiation envelopes.
struct PollCursor {
    local_id: SessionId,
    watermarks: HashMap<SessionId, u64>,
    recent: RecentlySeen,
}

impl PollCursor {
    fn new(local_id: SessionId, dedupe_capacity: usize) -> Self {
        Self {
            local_id,
            watermarks: HashMap::new(),
            recent: RecentlySeen::new(dedupe_capacity),
        }
    }

    fn admit(&mut self, envelope: SignalingEnvelope) -> Option<SignalingEnvelope> {
        if envelope.sender == self.local_id {
            return None;
        }
        let watermark = self.watermarks.entry(envelope.sender.clone()).or_insert(0);
        if envelope.timestamp <= *watermark {
            return None;
        }
        *watermark = envelope.timestamp;
        if !envelope.is_addressed_to(&self.local_id) {
            return None;
        }
        if envelope.kind.is_deduplicated() && !self.recent.insert(envelope.dedupe_key()) {
            return None;
        }
        Some(envelope)
    }
}
