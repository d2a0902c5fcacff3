//! Heartbeat reconciliation against the engine
//!
//! The state machine sets its status optimistically; the engine is the
//! source of truth. `reconcile` decides, for one poll, how the two should
//! be merged. `ActionClock` timestamps user actions so a poll that started
//! before an action is never used to override it.

use crate::engine::{EngineStatus, EngineStatusReport};
use crate::sync::timer::{spawn_periodic, TaskHandle};
use crate::vpn::state::ConnectionStatus;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// What to do with one heartbeat observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Local and engine agree
    InSync,
    /// A recent action has not reached the engine yet; check again next tick
    Wait,
    /// Connecting for longer than the grace period with the engine still down
    ConnectTimedOut,
    /// The engine kept a tunnel up that local state lost track of
    Recover {
        server_id: Option<u64>,
        connected_at: Option<DateTime<Utc>>,
    },
    /// Take the engine's status as-is
    Adopt(EngineStatus),
}

/// Merge the local status with an engine report
///
/// `since_last_action` is measured from the last connect/disconnect to the
/// moment the poll started; pass `Duration::MAX` when there was none.
pub fn reconcile(
    local: &ConnectionStatus,
    remote: &EngineStatusReport,
    since_last_action: Duration,
    grace: Duration,
) -> Decision {
    let within_grace = since_last_action < grace;

    match (local, remote.status) {
        (ConnectionStatus::Connecting, EngineStatus::Disconnected) => {
            if within_grace {
                Decision::Wait
            } else {
                Decision::ConnectTimedOut
            }
        }
        (ConnectionStatus::Disconnecting, EngineStatus::Connected) if within_grace => {
            Decision::Wait
        }
        (local, EngineStatus::Connected) if local.is_disconnected() => Decision::Recover {
            server_id: remote.server_id,
            connected_at: remote.connected_at,
        },
        (local, status) if local.as_engine_status() == status => Decision::InSync,
        (_, status) => Decision::Adopt(status),
    }
}

/// How a finished poll relates to the last user action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollWindow {
    /// An action happened after the poll started; discard the poll
    Stale,
    /// Time from the last action to the poll start
    Elapsed(Duration),
}

/// Timestamp of the last connect/disconnect action
#[derive(Debug, Default)]
pub struct ActionClock {
    last_action: Mutex<Option<Instant>>,
}

impl ActionClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Option<Instant>> {
        self.last_action.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an action happening now
    pub fn record(&self) -> Instant {
        let now = Instant::now();
        *self.guard() = Some(now);
        now
    }

    /// Classify a poll that started at `poll_started`
    pub fn window(&self, poll_started: Instant) -> PollWindow {
        match *self.guard() {
            Some(last) if last > poll_started => PollWindow::Stale,
            Some(last) => PollWindow::Elapsed(poll_started.duration_since(last)),
            None => PollWindow::Elapsed(Duration::MAX),
        }
    }
}

/// Periodic status poll; stopping is idempotent
#[derive(Debug, Default)]
pub struct Heartbeat {
    task: Mutex<TaskHandle>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    fn task(&self) -> MutexGuard<'_, TaskHandle> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start polling; does nothing when already running
    pub fn start<F, Fut>(&self, period: Duration, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut task = self.task();
        if task.is_active() {
            return false;
        }
        task.replace(spawn_periodic(period, true, move || {
            let fut = tick();
            async move {
                fut.await;
                ControlFlow::Continue(())
            }
        }));
        true
    }

    pub fn stop(&self) -> bool {
        self.task().stop()
    }

    pub fn is_active(&self) -> bool {
        self.task().is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE: Duration = Duration::from_secs(5);

    fn report(status: EngineStatus) -> EngineStatusReport {
        EngineStatusReport {
            status,
            server_id: None,
            connected_at: None,
        }
    }

    #[test]
    fn test_connecting_waits_within_grace() {
        let decision = reconcile(
            &ConnectionStatus::Connecting,
            &report(EngineStatus::Disconnected),
            Duration::from_millis(4999),
            GRACE,
        );
        assert_eq!(decision, Decision::Wait);
    }

    #[test]
    fn test_connecting_times_out_at_grace() {
        for elapsed in [GRACE, Duration::from_secs(30), Duration::MAX] {
            let decision = reconcile(
                &ConnectionStatus::Connecting,
                &report(EngineStatus::Disconnected),
                elapsed,
                GRACE,
            );
            assert_eq!(decision, Decision::ConnectTimedOut);
        }
    }

    #[test]
    fn test_lost_connection_is_recovered() {
        let connected_at = Utc::now();
        let remote = EngineStatusReport {
            status: EngineStatus::Connected,
            server_id: Some(9),
            connected_at: Some(connected_at),
        };
        for local in [
            ConnectionStatus::Disconnected,
            ConnectionStatus::Errored("old".into()),
        ] {
            assert_eq!(
                reconcile(&local, &remote, Duration::ZERO, GRACE),
                Decision::Recover {
                    server_id: Some(9),
                    connected_at: Some(connected_at)
                }
            );
        }
    }

    #[test]
    fn test_disconnecting_tolerates_stale_connected() {
        let remote = report(EngineStatus::Connected);
        assert_eq!(
            reconcile(&ConnectionStatus::Disconnecting, &remote, Duration::from_secs(1), GRACE),
            Decision::Wait
        );
        assert_eq!(
            reconcile(&ConnectionStatus::Disconnecting, &remote, GRACE, GRACE),
            Decision::Adopt(EngineStatus::Connected)
        );
    }

    #[test]
    fn test_other_mismatches_adopt_engine() {
        assert_eq!(
            reconcile(
                &ConnectionStatus::Connected,
                &report(EngineStatus::Disconnected),
                Duration::ZERO,
                GRACE
            ),
            Decision::Adopt(EngineStatus::Disconnected)
        );
        assert_eq!(
            reconcile(
                &ConnectionStatus::Connecting,
                &report(EngineStatus::Connected),
                Duration::ZERO,
                GRACE
            ),
            Decision::Adopt(EngineStatus::Connected)
        );
        assert_eq!(
            reconcile(
                &ConnectionStatus::Connected,
                &report(EngineStatus::Connected),
                Duration::ZERO,
                GRACE
            ),
            Decision::InSync
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_started_before_action_is_stale() {
        let clock = ActionClock::new();
        let early_poll = Instant::now();
        assert_eq!(clock.window(early_poll), PollWindow::Elapsed(Duration::MAX));

        tokio::time::advance(Duration::from_millis(10)).await;
        clock.record();
        assert_eq!(clock.window(early_poll), PollWindow::Stale);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(
            clock.window(Instant::now()),
            PollWindow::Elapsed(Duration::from_secs(2))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_start_is_idempotent() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let heartbeat = Heartbeat::new();
        let ticks = Arc::new(AtomicU32::new(0));
        let make_tick = |ticks: Arc<AtomicU32>| {
            move || {
                let ticks = ticks.clone();
                async move {
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            }
        };

        assert!(heartbeat.start(Duration::from_secs(3), make_tick(ticks.clone())));
        assert!(!heartbeat.start(Duration::from_secs(3), make_tick(ticks.clone())));

        tokio::time::sleep(Duration::from_millis(6500)).await;
        // Immediate tick plus two intervals
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        assert!(heartbeat.stop());
        assert!(!heartbeat.stop());
        assert!(!heartbeat.is_active());
    }
}
