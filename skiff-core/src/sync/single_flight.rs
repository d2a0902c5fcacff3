//! Named non-queuing mutual exclusion
//!
//! A `SingleFlightLock` lets at most one operation run per key. A second
//! caller arriving while the key is held does not wait: it is told the
//! work was skipped, so rapid repeated triggers collapse into one run.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;
use tracing::debug;

/// Outcome of [`SingleFlightLock::with_lock`]
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Flight<T> {
    /// The operation ran and produced a value
    Executed(T),
    /// Another holder had the key; nothing ran
    Skipped,
}

impl<T> Flight<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Flight::Skipped)
    }

    pub fn executed(self) -> Option<T> {
        match self {
            Flight::Executed(value) => Some(value),
            Flight::Skipped => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SingleFlightLock {
    held: Mutex<HashSet<String>>,
}

/// Releases its key when dropped
///
/// Dropping happens on normal return, on `?`, on panic unwinding, and when
/// the owning future is cancelled, so a key is never left locked.
#[derive(Debug)]
pub struct FlightGuard<'a> {
    lock: &'a SingleFlightLock,
    key: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(&self.key);
    }
}

impl SingleFlightLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the key if it is free
    pub fn try_acquire(&self, key: &str) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.insert(key.to_string())
    }

    /// Free the key; releasing a free key is a no-op
    pub fn release(&self, key: &str) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(key);
    }

    pub fn is_locked(&self, key: &str) -> bool {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.contains(key)
    }

    /// Take the key and get a guard that frees it on drop
    pub fn acquire_guard(&self, key: &str) -> Option<FlightGuard<'_>> {
        if self.try_acquire(key) {
            Some(FlightGuard {
                lock: self,
                key: key.to_string(),
            })
        } else {
            None
        }
    }

    /// Run `operation` while holding `key`, or skip it if the key is taken
    pub async fn with_lock<F, Fut, T>(&self, key: &str, operation: F) -> Flight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(_guard) = self.acquire_guard(key) else {
            debug!(key, "Operation already in progress, skipping");
            return Flight::Skipped;
        };
        Flight::Executed(operation().await)
    }
}
