//! Bounded recovery for a failed or disconnected peer connection.
//!
//! The controller never touches the connection itself. It turns observations into
//! decisions; the session performs the attempts and reports back.

use std::time::Duration;

use rand::Rng;

use crate::engine::PeerConnectionState;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Attempts per failure episode before giving up.
    pub max_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_multiplier: f64,
    pub backoff_max: Duration,
    /// Consecutive failed observations after which attempts rebuild the connection
    /// instead of restarting ICE.
    pub escalate_after: u32,
    /// Adds up to 25% random delay to each backoff.
    pub jitter: bool,
    /// An attempt that has not reconnected within this window counts as failed.
    pub attempt_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_initial: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            backoff_max: Duration::from_secs(8),
            escalate_after: 2,
            jitter: true,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let base_ms = self.backoff_initial.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let base_ms = base_ms.min(self.backoff_max.as_millis() as f64);
        let jitter_ms = if self.jitter && base_ms > 0.0 {
            rand::thread_rng().gen_range(0.0..base_ms * 0.25)
        } else {
            0.0
        };
        Duration::from_millis((base_ms + jitter_ms) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    IceRestart,
    Rebuild,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReconnectStatus {
    #[default]
    Idle,
    Reconnecting {
        attempt: u32,
    },
    /// Retries are spent; only the user can start over.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectDecision {
    None,
    Schedule {
        attempt: u32,
        delay: Duration,
        strategy: RecoveryStrategy,
    },
    Exhausted {
        attempts: u32,
    },
    Recovered {
        attempts: u32,
    },
}

#[derive(Debug, Clone, Copy)]
struct PendingAttempt {
    attempt: u32,
    strategy: RecoveryStrategy,
}

#[derive(Debug)]
pub struct ReconnectionController {
    policy: ReconnectPolicy,
    attempts: u32,
    consecutive_failures: u32,
    pending: Option<PendingAttempt>,
    status: ReconnectStatus,
}

impl ReconnectionController {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            consecutive_failures: 0,
            pending: None,
            status: ReconnectStatus::Idle,
        }
    }

    pub fn status(&self) -> ReconnectStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn has_pending_attempt(&self) -> bool {
        self.pending.is_some()
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn observe_state(&mut self, state: PeerConnectionState) -> ReconnectDecision {
        match state {
            PeerConnectionState::Connected => {
                let attempts = self.attempts;
                let was_recovering = self.status != ReconnectStatus::Idle;
                self.reset();
                if was_recovering || attempts > 0 {
                    tracing::info!(target: "huddle::reconnect", attempts, "connection recovered");
                    ReconnectDecision::Recovered { attempts }
                } else {
                    ReconnectDecision::None
                }
            }
            PeerConnectionState::Failed | PeerConnectionState::Disconnected => self.register_failure(state),
            _ => ReconnectDecision::None,
        }
    }

    /// The primary peer stopped heartbeating while the connection still claims to be
    /// alive.
    pub fn observe_stale_primary(&mut self, state: PeerConnectionState) -> ReconnectDecision {
        if state == PeerConnectionState::Closed {
            return ReconnectDecision::None;
        }
        self.register_failure(state)
    }

    /// The scheduled attempt could not even be started.
    pub fn attempt_failed(&mut self) -> ReconnectDecision {
        self.register_failure(PeerConnectionState::Failed)
    }

    /// Consumes the scheduled attempt, if any, and returns its number and strategy.
    pub fn begin_attempt(&mut self) -> Option<(u32, RecoveryStrategy)> {
        let pending = self.pending.take()?;
        self.attempts = pending.attempt;
        Some((pending.attempt, pending.strategy))
    }

    /// Forgets the current episode entirely.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.consecutive_failures = 0;
        self.pending = None;
        self.status = ReconnectStatus::Idle;
    }

    fn register_failure(&mut self, state: PeerConnectionState) -> ReconnectDecision {
        if self.status == ReconnectStatus::Exhausted || self.pending.is_some() {
            return ReconnectDecision::None;
        }
        self.consecutive_failures += 1;
        if self.attempts >= self.policy.max_attempts {
            self.status = ReconnectStatus::Exhausted;
            tracing::error!(
                target: "huddle::reconnect",
                attempts = self.attempts,
                state = %state,
                "reconnection attempts exhausted"
            );
            return ReconnectDecision::Exhausted {
                attempts: self.attempts,
            };
        }

        let attempt = self.attempts + 1;
        let strategy = if self.consecutive_failures >= self.policy.escalate_after {
            RecoveryStrategy::Rebuild
        } else {
            RecoveryStrategy::IceRestart
        };
        let delay = self.policy.backoff_for(attempt);
        self.pending = Some(PendingAttempt { attempt, strategy });
        self.status = ReconnectStatus::Reconnecting { attempt };
        tracing::warn!(
            target: "huddle::reconnect",
            attempt,
            ?strategy,
            delay_ms = delay.as_millis() as u64,
            state = %state,
            "scheduling reconnection attempt"
        );
        ReconnectDecision::Schedule {
            attempt,
            delay,
            strategy,
        }
    }
}
