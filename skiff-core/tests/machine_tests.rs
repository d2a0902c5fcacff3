//! Connection state machine scenarios against fake engine and backend
//!
//! Timer-driven behaviour runs on paused tokio time.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{tokyo, FakeBackend, Harness, GIB};
use skiff_core::api::{PrecheckResponse, RealtimeUsage};
use skiff_core::config::ClientConfig;
use skiff_core::engine::{EngineEvent, EngineStatus, TerminationReason, TrafficSample};
use skiff_core::error::{ApiError, ConnectError};
use skiff_core::vpn::ConnectionStatus;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_test::assert_ok;

fn config() -> ClientConfig {
    ClientConfig::default()
}

fn auto_reconnect_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.connection.auto_reconnect = true;
    config
}

fn sample(download: u64, upload: u64) -> EngineEvent {
    EngineEvent::TrafficSample(TrafficSample {
        download_bytes: download,
        upload_bytes: upload,
        download_rate: 10,
        upload_rate: 5,
    })
}

#[tokio::test(start_paused = true)]
async fn test_connect_without_login_never_starts_engine() {
    // Given: A machine with a server selected but nobody logged in
    let h = Harness::new(config());
    h.machine.select_server(tokyo());

    // When: Connecting
    let result = h.machine.connect().await;

    // Then: Login is required and the engine was never touched
    assert_eq!(result, Err(ConnectError::NeedsLogin));
    assert_eq!(h.engine.starts(), 0);
    assert_eq!(h.backend.precheck_calls(), 0);
    assert_eq!(h.machine.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_connect_refreshes_expired_access_token() {
    // Given: A stored session whose access token has already expired
    let h = Harness::with_backend(config(), FakeBackend::with_expiry(-1));
    h.ready_to_connect().await;
    assert!(!h.auth.is_valid());

    // When: Connecting
    assert_ok!(h.machine.connect().await);

    // Then: The refresh token was used once and the tunnel came up
    assert_eq!(h.backend.refresh_calls(), 1);
    assert!(h.auth.is_valid());
    assert_eq!(h.engine.starts(), 1);
    assert_eq!(h.machine.status(), ConnectionStatus::Connected);
    h.auth.stop_auto_refresh();
}

#[tokio::test(start_paused = true)]
async fn test_connect_requires_selected_server() {
    let h = Harness::new(config());
    h.login().await;

    assert_eq!(h.machine.connect().await, Err(ConnectError::NoServerSelected));
    assert_eq!(h.engine.starts(), 0);
    assert_eq!(h.machine.error().as_deref(), Some("No server selected"));
}

#[tokio::test(start_paused = true)]
async fn test_connect_requires_ready_engine() {
    let h = Harness::new(config());
    h.ready_to_connect().await;
    h.engine.ready.store(false, Ordering::SeqCst);

    assert_eq!(h.machine.connect().await, Err(ConnectError::EngineNotReady));
    assert_eq!(h.engine.starts(), 0);
    assert_eq!(h.machine.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_quota_rejection_signals_upgrade_without_engine_command() {
    // Given: The backend reports the daily traffic limit as spent
    let h = Harness::new(config());
    h.ready_to_connect().await;
    *h.backend.precheck.lock().unwrap() = Ok(PrecheckResponse {
        can_connect: false,
        reject_reason: Some("Daily traffic limit exceeded".to_string()),
        daily_traffic_used: GIB,
        daily_time_used: 600,
        node_allowed: true,
    });

    // When: Connecting
    let result = h.machine.connect().await;

    // Then: Quota error, upgrade flow raised, no engine command, server totals adopted
    assert!(result.as_ref().is_err_and(ConnectError::is_quota));
    let snapshot = h.machine.snapshot();
    assert!(snapshot.show_upgrade_prompt);
    assert!(snapshot.pending_connect_after_purchase);
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert_eq!(h.engine.starts(), 0);
    assert_eq!(h.usage.usage().traffic_bytes, GIB);
}

#[tokio::test(start_paused = true)]
async fn test_node_not_allowed_is_rejected() {
    let h = Harness::new(config());
    h.ready_to_connect().await;
    *h.backend.precheck.lock().unwrap() = Ok(PrecheckResponse {
        node_allowed: false,
        ..common::allowed_precheck()
    });

    let result = h.machine.connect().await;
    assert!(matches!(result, Err(ConnectError::QuotaExceeded { .. })));
    assert_eq!(h.engine.starts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_precheck_outage_falls_back_to_local_limits() {
    let h = Harness::new(config());
    h.ready_to_connect().await;
    *h.backend.precheck.lock().unwrap() = Err(ApiError::Transport("connection refused".into()));

    // Local usage already at the Standard traffic limit
    h.usage.adopt_server_totals(GIB, 0);
    let result = h.machine.connect().await;
    assert!(result.as_ref().is_err_and(ConnectError::is_quota));
    assert_eq!(h.engine.starts(), 0);

    // With headroom the outage does not block the connect
    h.usage.adopt_server_totals(0, 0);
    assert_eq!(h.machine.connect().await, Ok(()));
    assert_eq!(h.engine.starts(), 1);
    assert_eq!(h.machine.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_connect_reaches_connected_and_starts_monitors() {
    let h = Harness::new(config());
    h.ready_to_connect().await;

    assert_eq!(h.machine.connect().await, Ok(()));

    let snapshot = h.machine.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    assert_eq!(snapshot.server_id, Some(7));
    assert!(snapshot.started_at.is_some());
    assert!(!snapshot.busy);
    assert!(h.machine.session_monitors_active());
    assert_eq!(h.engine.starts(), 1);

    // Ping loop fires immediately and records the fake latency
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.machine.stats().latency_ms, 42);
}

#[tokio::test(start_paused = true)]
async fn test_connect_is_noop_when_already_connected() {
    let h = Harness::new(config());
    h.ready_to_connect().await;
    assert_ok!(h.machine.connect().await);

    assert_eq!(h.machine.connect().await, Ok(()));
    assert_eq!(h.engine.starts(), 1);
    assert_eq!(h.backend.precheck_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connects_collapse_into_one() {
    let h = Harness::new(config());
    h.ready_to_connect().await;

    let (first, second) = tokio::join!(h.machine.connect(), h.machine.connect());

    assert!(first.is_ok());
    assert!(matches!(second, Ok(()) | Err(ConnectError::AlreadyInProgress)));
    assert_eq!(h.engine.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connecting_times_out_after_grace_period() {
    // Given: An engine that never comes up, and a running heartbeat
    let h = Harness::new(config());
    h.ready_to_connect().await;
    h.engine.connect_on_start.store(false, Ordering::SeqCst);
    h.machine.start();

    // When: Connecting
    assert_eq!(h.machine.connect().await, Ok(()));
    assert_eq!(h.machine.status(), ConnectionStatus::Connecting);

    // Then: Inside the grace window the optimistic status holds
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(h.machine.status(), ConnectionStatus::Connecting);

    // Then: Past the window the attempt fails with a timeout
    tokio::time::sleep(Duration::from_secs(3)).await;
    let snapshot = h.machine.snapshot();
    assert!(snapshot.status.is_disconnected());
    assert_eq!(snapshot.error.as_deref(), Some("Connection attempt timed out"));
    assert!(!snapshot.busy);

    h.machine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_recovers_running_tunnel() {
    // Given: Local state lost while the engine kept a tunnel up since T
    let h = Harness::new(config());
    h.login().await;
    let connected_at = Utc::now() - ChronoDuration::minutes(10);
    h.engine
        .set_report(EngineStatus::Connected, Some(7), Some(connected_at));

    // When: The heartbeat reconciles
    h.machine.sync_status().await;

    // Then: Connected with the engine's start time and monitors running
    let snapshot = h.machine.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    assert_eq!(snapshot.started_at, Some(connected_at));
    assert_eq!(snapshot.server_id, Some(7));
    assert!(h.machine.session_monitors_active());
}

#[tokio::test(start_paused = true)]
async fn test_recovery_without_timestamp_uses_now() {
    let h = Harness::new(config());
    h.engine.set_report(EngineStatus::Connected, None, None);

    let before = Utc::now();
    h.machine.sync_status().await;

    let started_at = h.machine.snapshot().started_at.expect("start time");
    assert!(started_at >= before);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_accumulates_and_reports_once() {
    // Given: A recovered session that has been up for two minutes
    let h = Harness::new(config());
    h.login().await;
    h.machine.select_server(tokyo());
    let connected_at = Utc::now() - ChronoDuration::seconds(120);
    h.engine
        .set_report(EngineStatus::Connected, Some(7), Some(connected_at));
    h.machine.sync_status().await;
    h.machine.handle_event(sample(3000, 1000)).await;

    // When: The user disconnects
    h.machine.disconnect().await;

    // Then: Usage counted once, session reported, engine stopped, flags cleared
    let snapshot = h.machine.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert!(!snapshot.busy);
    assert_eq!(snapshot.stats.download_bytes, 0);
    assert!(!h.machine.session_monitors_active());
    assert_eq!(h.engine.stops(), 1);

    let usage = h.usage.usage();
    assert_eq!(usage.traffic_bytes, 4000);
    assert!(usage.time_seconds >= 120);

    let reports = h.backend.reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].node_id, 7);
    assert_eq!(reports[0].traffic_download, 3000);
    assert_eq!(reports[0].connected_at, connected_at);

    // A second disconnect is a no-op
    h.machine.disconnect().await;
    assert_eq!(h.engine.stops(), 1);
    assert_eq!(h.usage.usage().traffic_bytes, 4000);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_when_disconnected_is_noop() {
    let h = Harness::new(config());
    h.machine.disconnect().await;
    assert_eq!(h.engine.stops(), 0);
    assert!(!h.machine.is_busy());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_connect_only_while_connecting() {
    let h = Harness::new(config());
    h.ready_to_connect().await;
    assert!(!h.machine.cancel_connect().await);

    h.engine.connect_on_start.store(false, Ordering::SeqCst);
    assert_ok!(h.machine.connect().await);
    assert_eq!(h.machine.status(), ConnectionStatus::Connecting);

    assert!(h.machine.cancel_connect().await);
    assert_eq!(h.machine.status(), ConnectionStatus::Disconnected);
    assert_eq!(h.engine.stops(), 1);
    assert!(!h.machine.is_busy());
}

#[tokio::test(start_paused = true)]
async fn test_stale_stats_events_are_discarded() {
    let h = Harness::new(config());
    h.machine.handle_event(sample(5000, 5000)).await;
    h.machine
        .handle_event(EngineEvent::LatencySample { ms: 80 })
        .await;

    let stats = h.machine.stats();
    assert_eq!(stats.total_bytes(), 0);
    assert_eq!(stats.latency_ms, 0);
}

#[tokio::test(start_paused = true)]
async fn test_engine_events_flow_through_channel() {
    let h = Harness::new(config());
    h.ready_to_connect().await;
    assert_ok!(h.machine.connect().await);

    h.engine.emit(sample(2048, 512));
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(h.machine.stats().download_bytes, 2048);
    assert_eq!(h.machine.stats().upload_bytes, 512);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_connection_error_forces_disconnected() {
    let h = Harness::new(config());
    h.ready_to_connect().await;
    assert_ok!(h.machine.connect().await);

    h.machine
        .handle_event(EngineEvent::ConnectionError {
            message: "tls handshake failed".to_string(),
            fatal: true,
        })
        .await;

    let snapshot = h.machine.snapshot();
    assert!(snapshot.status.is_disconnected());
    assert_eq!(
        snapshot.error.as_deref(),
        Some("Connection failed: tls handshake failed")
    );
    assert_eq!(snapshot.stats.total_bytes(), 0);
    assert!(!h.machine.session_monitors_active());
}

#[tokio::test(start_paused = true)]
async fn test_engine_recovering_after_fatal_error_counts_as_new_session() {
    // Given: A first session that carried 1000 bytes before a fatal error
    let h = Harness::new(config());
    h.ready_to_connect().await;
    assert_ok!(h.machine.connect().await);
    h.machine.handle_event(sample(1000, 0)).await;
    h.machine
        .handle_event(EngineEvent::ConnectionError {
            message: "tls handshake failed".to_string(),
            fatal: true,
        })
        .await;
    assert_eq!(h.usage.usage().traffic_bytes, 1000);

    // When: The engine reports Connected again and carries 5000 more bytes
    h.machine
        .handle_event(EngineEvent::StatusChanged {
            status: EngineStatus::Connected,
        })
        .await;
    let snapshot = h.machine.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    assert!(snapshot.started_at.is_some());
    assert_eq!(snapshot.stats.download_bytes, 0);
    h.machine.handle_event(sample(5000, 0)).await;
    h.engine.set_report(EngineStatus::Disconnected, None, None);
    h.machine.disconnect().await;

    // Then: Both sessions reached the daily usage
    assert_eq!(h.usage.usage().traffic_bytes, 6000);
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_exit_reconnects_when_enabled() {
    // Given: A connected session with auto-reconnect on
    let h = Harness::new(auto_reconnect_config());
    h.ready_to_connect().await;
    assert_ok!(h.machine.connect().await);

    // When: The engine process dies on its own
    h.engine.set_report(EngineStatus::Disconnected, None, None);
    h.machine
        .handle_event(EngineEvent::ProcessTerminated {
            reason: TerminationReason::Exited { code: Some(1) },
        })
        .await;

    // Then: A reconnect is armed and brings the tunnel back
    assert_eq!(h.machine.status(), ConnectionStatus::Disconnected);
    assert!(h.machine.reconnect_scheduler().is_pending());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.engine.starts(), 2);
    assert_eq!(h.machine.status(), ConnectionStatus::Connected);
    assert_eq!(h.machine.reconnect_scheduler().attempt_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_exit_without_auto_reconnect_stays_down() {
    let h = Harness::new(config());
    h.ready_to_connect().await;
    assert_ok!(h.machine.connect().await);

    h.machine
        .handle_event(EngineEvent::ProcessTerminated {
            reason: TerminationReason::Exited { code: None },
        })
        .await;

    assert!(!h.machine.reconnect_scheduler().is_pending());
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.engine.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_termination_never_reconnects() {
    let h = Harness::new(auto_reconnect_config());
    h.ready_to_connect().await;
    assert_ok!(h.machine.connect().await);

    h.machine
        .handle_event(EngineEvent::ProcessTerminated {
            reason: TerminationReason::FatalError,
        })
        .await;

    assert_eq!(
        h.machine.error().as_deref(),
        Some("Connection terminated unexpectedly.")
    );
    assert!(!h.machine.reconnect_scheduler().is_pending());
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.engine.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_termination_during_user_disconnect_is_expected() {
    let h = Harness::new(auto_reconnect_config());
    h.ready_to_connect().await;
    assert_ok!(h.machine.connect().await);
    h.machine.disconnect().await;

    h.machine
        .handle_event(EngineEvent::ProcessTerminated {
            reason: TerminationReason::Exited { code: Some(0) },
        })
        .await;

    assert!(!h.machine.reconnect_scheduler().is_pending());
    assert_eq!(h.machine.error(), None);
}

#[tokio::test(start_paused = true)]
async fn test_backend_requested_disconnect() {
    // Given: A connected session and a backend that wants it ended
    let h = Harness::new(config());
    h.ready_to_connect().await;
    assert_ok!(h.machine.connect().await);
    *h.backend.realtime.lock().unwrap() = Ok(RealtimeUsage {
        daily_traffic_used: GIB,
        daily_time_used: 3600,
        should_disconnect: true,
        disconnect_reason: Some("Daily traffic limit exceeded".to_string()),
    });

    // When: The realtime usage poll runs
    tokio::time::sleep(Duration::from_secs(61)).await;

    // Then: Disconnected with the server's reason and the upgrade prompt
    let snapshot = h.machine.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert_eq!(snapshot.error.as_deref(), Some("Daily traffic limit exceeded"));
    assert!(snapshot.show_upgrade_prompt);
    assert_eq!(h.usage.usage().traffic_bytes, GIB);
}

#[tokio::test(start_paused = true)]
async fn test_in_session_limit_disconnects() {
    let h = Harness::new(config());
    h.ready_to_connect().await;
    assert_ok!(h.machine.connect().await);
    h.usage.adopt_server_totals(GIB - 100, 0);

    h.machine.handle_event(sample(200, 0)).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let snapshot = h.machine.snapshot();
    assert!(snapshot.status.is_disconnected());
    assert_eq!(
        snapshot.error.as_deref(),
        Some("Usage limit reached. Upgrade to Pro.")
    );
    assert!(snapshot.show_upgrade_prompt);
}

#[tokio::test(start_paused = true)]
async fn test_connect_with_limit_check_defers_until_purchase() {
    // Given: Local usage at the limit
    let h = Harness::new(config());
    h.ready_to_connect().await;
    h.usage.adopt_server_totals(GIB, 0);

    // When: Connecting with the local check
    let result = h.machine.connect_with_limit_check().await;

    // Then: Upgrade offered, connect kept pending
    assert!(result.as_ref().is_err_and(ConnectError::is_quota));
    assert!(h.machine.snapshot().pending_connect_after_purchase);
    assert!(h.machine.check_daily_limit().exceeded);
    assert_eq!(h.engine.starts(), 0);

    // When: The purchase lifts the limit
    h.backend.user.lock().unwrap().roles = vec!["vip".to_string()];
    assert_eq!(h.machine.handle_purchase_success().await, Ok(()));

    // Then: The pending connect runs
    let snapshot = h.machine.snapshot();
    assert!(!snapshot.show_upgrade_prompt);
    assert!(!snapshot.pending_connect_after_purchase);
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    assert_eq!(h.engine.starts(), 1);
    assert!(!h.machine.check_daily_limit().exceeded);
}

#[tokio::test(start_paused = true)]
async fn test_logout_disconnects_first() {
    let h = Harness::new(config());
    h.ready_to_connect().await;
    assert_ok!(h.machine.connect().await);

    h.machine.logout().await;

    assert_eq!(h.machine.status(), ConnectionStatus::Disconnected);
    assert_eq!(h.engine.stops(), 1);
    assert_eq!(h.backend.logout_calls.load(Ordering::SeqCst), 1);
    assert!(h.auth.needs_login());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_is_idempotent() {
    let h = Harness::new(config());
    h.machine.start();
    assert!(h.machine.is_heartbeat_active());

    h.machine.shutdown();
    h.machine.shutdown();
    assert!(!h.machine.is_heartbeat_active());
    assert!(!h.machine.session_monitors_active());
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_watch_sees_transitions() {
    let h = Harness::with_backend(config(), FakeBackend::new());
    h.ready_to_connect().await;
    let mut rx = h.machine.subscribe();

    assert_ok!(h.machine.connect().await);

    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().status, ConnectionStatus::Connected);
}
