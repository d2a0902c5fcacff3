//! Automatic reconnection with exponential backoff
//!
//! `ReconnectionPolicy::next_delay` is the pure backoff rule.
//! `ReconnectScheduler` owns the pending one-shot timer and the attempt
//! counter and re-arms itself after a failed attempt when asked to.

use crate::sync::timer::TaskHandle;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for automatic reconnection behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectionPolicy {
    /// Attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first attempt, doubled for each later one
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Ceiling for the doubled delay
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30_000
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl ReconnectionPolicy {
    /// Validate the entire policy
    ///
    /// # Returns
    ///
    /// * `Ok(())` if all fields are valid
    /// * `Err(PolicyValidationError)` with the first validation error encountered
    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        if !(1..=20).contains(&self.max_attempts) {
            return Err(PolicyValidationError::InvalidMaxAttempts(self.max_attempts));
        }
        if !(100..=60_000).contains(&self.base_delay_ms) {
            return Err(PolicyValidationError::InvalidBaseDelay(self.base_delay_ms));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(PolicyValidationError::MaxDelayLessThanBase(
                self.max_delay_ms,
                self.base_delay_ms,
            ));
        }
        Ok(())
    }

    /// Delay before attempt number `attempt` (0-indexed)
    ///
    /// Formula: base_delay × 2^attempt, capped at max_delay
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Validation errors for ReconnectionPolicy
#[derive(Debug, thiserror::Error)]
pub enum PolicyValidationError {
    #[error("max_attempts must be between 1 and 20, got: {0}")]
    InvalidMaxAttempts(u32),

    #[error("base_delay_ms must be between 100 and 60000, got: {0}")]
    InvalidBaseDelay(u64),

    #[error("max_delay_ms ({0}) must be >= base_delay_ms ({1})")]
    MaxDelayLessThanBase(u64, u64),
}

/// Result of one reconnect attempt as seen by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Connected,
    /// Attempt failed; `retry` when auto-reconnect is on and the connection is still down
    Failed { retry: bool },
}

/// The connect operation a scheduled attempt runs
pub type AttemptFn = Arc<dyn Fn() -> BoxFuture<'static, AttemptOutcome> + Send + Sync>;

struct SchedulerInner {
    policy: ReconnectionPolicy,
    attempts: AtomicU32,
    /// Bumped by `cancel()` so an attempt already running does not re-arm
    generation: AtomicU64,
    timer: Mutex<TaskHandle>,
}

/// Owns the pending reconnect timer and the attempt counter
#[derive(Clone)]
pub struct ReconnectScheduler {
    inner: Arc<SchedulerInner>,
}

impl ReconnectScheduler {
    pub fn new(policy: ReconnectionPolicy) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                policy,
                attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                timer: Mutex::new(TaskHandle::new()),
            }),
        }
    }

    fn timer(&self) -> MutexGuard<'_, TaskHandle> {
        self.inner.timer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn policy(&self) -> &ReconnectionPolicy {
        &self.inner.policy
    }

    pub fn attempt_count(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Whether a reconnect timer is armed
    pub fn is_pending(&self) -> bool {
        self.timer().is_active()
    }

    /// Arm a one-shot timer for the next attempt
    ///
    /// Returns the delay, or `None` once the attempt budget is spent (the
    /// counter is reset and nothing is armed).
    #[tracing::instrument(skip(self, attempt_fn), fields(max_attempts = self.inner.policy.max_attempts))]
    pub fn schedule(&self, attempt_fn: AttemptFn) -> Option<Duration> {
        let attempt = self.attempt_count();
        if attempt >= self.inner.policy.max_attempts {
            warn!(attempts = attempt, "Max reconnect attempts reached, giving up");
            self.inner.attempts.store(0, Ordering::SeqCst);
            return None;
        }

        let delay = self.inner.policy.next_delay(attempt);
        let generation = self.inner.generation.load(Ordering::SeqCst);
        info!(attempt = attempt + 1, ?delay, "Scheduling reconnect");

        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            // The attempt may cancel the scheduler; it must not abort itself
            this.timer().detach();

            let attempt = this.inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            info!(attempt, "Reconnect attempt firing");

            match attempt_fn().await {
                AttemptOutcome::Connected => {
                    info!(attempt, "Reconnected successfully");
                    this.inner.attempts.store(0, Ordering::SeqCst);
                }
                AttemptOutcome::Failed { retry } => {
                    let current = this.inner.generation.load(Ordering::SeqCst) == generation;
                    if retry && current {
                        this.schedule(attempt_fn);
                    } else {
                        debug!(attempt, retry, current, "Not rescheduling reconnect");
                    }
                }
            }
        });
        self.timer().replace(handle);
        Some(delay)
    }

    /// Disarm any pending attempt and reset the counter
    ///
    /// Safe to call any number of times.
    pub fn cancel(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if self.timer().stop() {
            debug!("Pending reconnect cancelled");
        }
        self.inner.attempts.store(0, Ordering::SeqCst);
    }
}
