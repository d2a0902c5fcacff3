//! Stoppable background tasks
//!
//! Every periodic or one-shot timer in the client is a tokio task owned by
//! a `TaskHandle`. Stopping is idempotent and dropping the handle stops
//! the task, so cleanup paths can call `stop()` as often as they like.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Default)]
pub struct TaskHandle {
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a task is attached and still running
    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Attach a task, stopping any previous one
    pub fn replace(&mut self, handle: JoinHandle<()>) {
        self.stop();
        self.handle = Some(handle);
    }

    /// Abort the task; returns whether one was attached
    pub fn stop(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Forget the task without aborting it
    ///
    /// Used by a task that is about to run its own body and must not be
    /// aborted by a `stop()` issued from inside that body.
    pub fn detach(&mut self) {
        self.handle = None;
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn a task calling `tick` every `period`
///
/// With `immediate` the first call happens right away, otherwise after one
/// period. The task ends when `tick` returns `ControlFlow::Break`.
pub fn spawn_periodic<F, Fut>(period: Duration, immediate: bool, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ControlFlow<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if !immediate {
            timer.tick().await; // Consume first immediate tick
        }
        loop {
            timer.tick().await;
            if tick().await.is_break() {
                break;
            }
        }
    })
}
