//! Connection lifecycle orchestration
//!
//! `ConnectionStateMachine` ties the token coordinator, the usage guard,
//! the reconnect scheduler and the heartbeat to one `TunnelEngine`.
//! Status is set optimistically on user actions, then corrected by engine
//! events (consumed from the engine's broadcast channel) and by heartbeat
//! polls. Observers read `MachineSnapshot`s from a watch channel.
//!
//! Background tasks hold a weak reference to the machine; they stop on
//! their own once the last handle is dropped, and `shutdown()` stops them
//! eagerly.

use crate::api::{BackendApi, PrecheckRequest, UsageReport};
use crate::auth::TokenRefreshCoordinator;
use crate::config::{ClientConfig, ConnectionConfig};
use crate::engine::{
    EngineEvent, EngineStatus, LogLevel, ServerParams, TerminationReason, TrafficSample,
    TunnelEngine,
};
use crate::error::ConnectError;
use crate::sync::single_flight::{Flight, SingleFlightLock};
use crate::sync::timer::{spawn_periodic, TaskHandle};
use crate::types::Server;
use crate::vpn::heartbeat::{reconcile, ActionClock, Decision, Heartbeat, PollWindow};
use crate::vpn::reconnect::{AttemptFn, AttemptOutcome, ReconnectScheduler};
use crate::vpn::state::{ConnectionSession, ConnectionStatus, FinishedSession, SessionStats};
use crate::vpn::usage::{ConnectDecision, DailyLimitStatus, UsageLimitGuard, REASON_TRAFFIC_EXCEEDED};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Single-flight key for connect attempts
pub const CONNECT_LOCK_KEY: &str = "vpn-connect";
/// Single-flight key for disconnect and cancel
pub const DISCONNECT_LOCK_KEY: &str = "vpn-disconnect";

/// Latency recorded when a ping fails
pub const FAILED_LATENCY_MS: u64 = 999;

const MSG_CONNECT_TIMEOUT: &str = "Connection attempt timed out";
const MSG_TERMINATED: &str = "Connection terminated unexpectedly.";
const MSG_SESSION_LIMIT: &str = "Usage limit reached. Upgrade to Pro.";
const MSG_USAGE_EXCEEDED: &str = "Usage limit exceeded";
const MSG_RECONNECT_GAVE_UP: &str = "Unable to reconnect";

const ELAPSED_TICK: Duration = Duration::from_secs(1);

/// Read-only view of the machine for UI/CLI callers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineSnapshot {
    pub status: ConnectionStatus,
    pub server_id: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub stats: SessionStats,
    /// Last user-visible error
    pub error: Option<String>,
    /// A connect or disconnect is being carried out
    pub busy: bool,
    /// Quota was hit; the UI should offer an upgrade
    pub show_upgrade_prompt: bool,
    /// Connect again once a purchase goes through
    pub pending_connect_after_purchase: bool,
}

#[derive(Default)]
struct MachineState {
    session: ConnectionSession,
    selected: Option<Server>,
    error: Option<String>,
    busy: bool,
    /// Set by `disconnect()`; a termination seen meanwhile is not unexpected
    user_disconnecting: bool,
    show_upgrade_prompt: bool,
    pending_connect_after_purchase: bool,
}

impl MachineState {
    fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            status: self.session.status.clone(),
            server_id: self.session.server_id,
            started_at: self.session.started_at,
            stats: self.session.stats,
            error: self.error.clone(),
            busy: self.busy,
            show_upgrade_prompt: self.show_upgrade_prompt,
            pending_connect_after_purchase: self.pending_connect_after_purchase,
        }
    }
}

/// Timers that only run while Connected
#[derive(Default)]
struct SessionTimers {
    elapsed: TaskHandle,
    ping: TaskHandle,
    realtime_usage: TaskHandle,
}

impl SessionTimers {
    fn all_active(&self) -> bool {
        self.elapsed.is_active() && self.ping.is_active() && self.realtime_usage.is_active()
    }
}

/// Side effects to run after a state update, outside the state lock
enum Followup {
    Nothing,
    SessionStarted,
    SessionEnded(Option<FinishedSession>),
}

struct Shared {
    engine: Arc<dyn TunnelEngine>,
    backend: Arc<dyn BackendApi>,
    auth: TokenRefreshCoordinator,
    usage: Arc<UsageLimitGuard>,
    reconnect: ReconnectScheduler,
    heartbeat: Heartbeat,
    clock: ActionClock,
    locks: SingleFlightLock,
    config: ConnectionConfig,
    client_version: String,
    state: Mutex<MachineState>,
    timers: Mutex<SessionTimers>,
    event_loop: Mutex<TaskHandle>,
    snapshot_tx: watch::Sender<MachineSnapshot>,
}

/// Owns the connection lifecycle
///
/// Cheap to clone; clones drive the same machine.
#[derive(Clone)]
pub struct ConnectionStateMachine {
    shared: Arc<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Clears the busy flag when a disconnect ends, however it ends
struct BusyGuard<'a>(&'a ConnectionStateMachine);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.update(|state| state.busy = false);
    }
}

impl ConnectionStateMachine {
    /// Compose a machine from its collaborators
    ///
    /// Nothing runs until `start()` (or the first connect) is called.
    pub fn new(
        engine: Arc<dyn TunnelEngine>,
        backend: Arc<dyn BackendApi>,
        auth: TokenRefreshCoordinator,
        usage: Arc<UsageLimitGuard>,
        config: &ClientConfig,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(MachineSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                engine,
                backend,
                auth,
                usage,
                reconnect: ReconnectScheduler::new(config.reconnection.clone()),
                heartbeat: Heartbeat::new(),
                clock: ActionClock::new(),
                locks: SingleFlightLock::new(),
                config: config.connection.clone(),
                client_version: config.api.client_version.clone(),
                state: Mutex::new(MachineState::default()),
                timers: Mutex::new(SessionTimers::default()),
                event_loop: Mutex::new(TaskHandle::new()),
                snapshot_tx,
            }),
        }
    }

    fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    /// Mutate state under the lock and publish the new snapshot
    fn update<R>(&self, f: impl FnOnce(&mut MachineState) -> R) -> R {
        let mut state = lock(&self.shared.state);
        let result = f(&mut *state);
        self.shared.snapshot_tx.send_replace(state.snapshot());
        result
    }

    fn read<R>(&self, f: impl FnOnce(&MachineState) -> R) -> R {
        let state = lock(&self.shared.state);
        f(&*state)
    }

    // --- observers ---

    pub fn snapshot(&self) -> MachineSnapshot {
        self.read(MachineState::snapshot)
    }

    /// Receive a snapshot after every state change
    pub fn subscribe(&self) -> watch::Receiver<MachineSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.read(|state| state.session.status.clone())
    }

    pub fn stats(&self) -> SessionStats {
        self.read(|state| state.session.stats)
    }

    pub fn error(&self) -> Option<String> {
        self.read(|state| state.error.clone())
    }

    pub fn clear_error(&self) {
        self.update(|state| state.error = None);
    }

    pub fn selected_server(&self) -> Option<Server> {
        self.read(|state| state.selected.clone())
    }

    pub fn is_busy(&self) -> bool {
        self.read(|state| state.busy)
    }

    pub fn auth(&self) -> &TokenRefreshCoordinator {
        &self.shared.auth
    }

    pub fn usage(&self) -> &UsageLimitGuard {
        &self.shared.usage
    }

    pub fn reconnect_scheduler(&self) -> &ReconnectScheduler {
        &self.shared.reconnect
    }

    pub fn is_heartbeat_active(&self) -> bool {
        self.shared.heartbeat.is_active()
    }

    /// Whether the elapsed, ping and realtime usage timers are all running
    pub fn session_monitors_active(&self) -> bool {
        lock(&self.shared.timers).all_active()
    }

    // --- user actions ---

    /// Choose the server the next connect uses
    pub fn select_server(&self, server: Server) {
        info!(server_id = server.id, name = %server.name, "Server selected");
        self.update(|state| state.selected = Some(server));
    }

    /// Start the event loop and the heartbeat (app start or resume)
    pub fn start(&self) {
        self.ensure_event_loop();
        if self.start_heartbeat() {
            debug!("Heartbeat started");
        }
    }

    /// Connect to the selected server
    ///
    /// A no-op when not Disconnected. Preconditions are checked before the
    /// single-flight lock is taken; a failed precondition leaves the status
    /// untouched.
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), ConnectError> {
        // A user connect supersedes any pending automatic attempt
        self.shared.reconnect.cancel();
        self.try_connect().await
    }

    async fn try_connect(&self) -> Result<(), ConnectError> {
        let status = self.status();
        if !status.is_disconnected() {
            debug!(%status, "Connect ignored");
            return Ok(());
        }
        if self.shared.locks.is_locked(CONNECT_LOCK_KEY) {
            return Err(ConnectError::AlreadyInProgress);
        }

        let server = match self.check_preconditions().await {
            Ok(server) => server,
            Err(e) => {
                info!(error = %e, "Connect precondition failed");
                self.update(|state| state.error = Some(e.to_string()));
                return Err(e);
            }
        };

        match self
            .shared
            .locks
            .with_lock(CONNECT_LOCK_KEY, || self.start_session(server))
            .await
        {
            Flight::Executed(result) => result,
            Flight::Skipped => Err(ConnectError::AlreadyInProgress),
        }
    }

    async fn check_preconditions(&self) -> Result<Server, ConnectError> {
        let auth = &self.shared.auth;
        if !auth.has_session() || !auth.ensure_fresh().await {
            return Err(ConnectError::NeedsLogin);
        }
        let server = self
            .selected_server()
            .ok_or(ConnectError::NoServerSelected)?;
        self.precheck(&server).await?;
        if !self.shared.engine.is_ready().await {
            return Err(ConnectError::EngineNotReady);
        }
        Ok(server)
    }

    async fn precheck(&self, server: &Server) -> Result<(), ConnectError> {
        let request = PrecheckRequest {
            node_id: server.id,
            connection_mode: self.shared.config.mode.as_str().to_string(),
            client_version: self.shared.client_version.clone(),
        };
        let request = &request;
        let backend = self.shared.backend.clone();
        let result = self
            .shared
            .auth
            .with_auth(move |token| {
                let backend = backend.clone();
                async move { backend.connect_precheck(&token, request).await }
            })
            .await;

        if matches!(&result, Err(e) if e.is_unauthorized()) {
            return Err(ConnectError::NeedsLogin);
        }

        let user = self.shared.auth.current_user();
        match self.shared.usage.decide(&result, user.as_ref()) {
            ConnectDecision::Allowed => Ok(()),
            ConnectDecision::Rejected {
                reason,
                upgrade: true,
            } => {
                self.update(|state| {
                    state.show_upgrade_prompt = true;
                    state.pending_connect_after_purchase = true;
                });
                Err(ConnectError::QuotaExceeded { reason })
            }
            ConnectDecision::Rejected { reason, .. } => Err(ConnectError::Rejected { reason }),
        }
    }

    async fn start_session(&self, server: Server) -> Result<(), ConnectError> {
        let began = self.update(|state| {
            if !state.session.status.is_disconnected() {
                return false;
            }
            self.shared.clock.record();
            state.session.begin(server.id);
            state.busy = true;
            state.user_disconnecting = false;
            state.error = None;
            true
        });
        if !began {
            return Ok(());
        }

        self.ensure_event_loop();
        info!(server_id = server.id, mode = %self.shared.config.mode, "Connecting");

        let params = ServerParams {
            server,
            mode: self.shared.config.mode,
        };
        if let Err(e) = self.shared.engine.start_tunnel(&params).await {
            error!(error = ?e, "Failed to start tunnel");
            let message = e.to_string();
            self.update(|state| {
                state
                    .session
                    .finish(ConnectionStatus::Errored(message.clone()), Utc::now());
                state.busy = false;
                state.error = Some(message.clone());
            });
            return Err(ConnectError::Engine { message });
        }

        tokio::time::sleep(self.shared.config.connect_settle()).await;
        self.sync_status().await;
        Ok(())
    }

    /// Tear down the current session
    ///
    /// A no-op when already Disconnected. Usage is accumulated and reported
    /// before the engine is stopped; report and stop failures are logged
    /// and do not abort the disconnect.
    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) {
        if self.status().is_disconnected() {
            debug!("Disconnect ignored, already disconnected");
            return;
        }
        let flight = self
            .shared
            .locks
            .with_lock(DISCONNECT_LOCK_KEY, || self.run_disconnect())
            .await;
        if flight.is_skipped() {
            debug!("Disconnect already in progress");
        }
    }

    async fn run_disconnect(&self) {
        let _busy = BusyGuard(self);
        let finished = self.update(|state| {
            self.shared.clock.record();
            state.user_disconnecting = true;
            state.busy = true;
            state
                .session
                .finish(ConnectionStatus::Disconnecting, Utc::now())
        });
        info!("Disconnecting");

        self.shared.reconnect.cancel();
        self.stop_session_timers();
        if let Some(session) = &finished {
            self.shared.usage.accumulate(session);
            self.report_session(session).await;
        }

        if let Err(e) = self.shared.engine.stop_tunnel().await {
            error!(error = ?e, "Failed to stop tunnel");
            self.update(|state| state.error = Some(e.to_string()));
        }

        tokio::time::sleep(self.shared.config.disconnect_settle()).await;
        self.sync_status().await;
    }

    /// Abort a connection attempt; only valid while Connecting
    pub async fn cancel_connect(&self) -> bool {
        if self.status() != ConnectionStatus::Connecting {
            return false;
        }
        info!("Cancelling connection attempt");
        self.disconnect().await;
        true
    }

    /// Quota state for the current user
    pub fn check_daily_limit(&self) -> DailyLimitStatus {
        let user = self.shared.auth.current_user();
        self.shared.usage.check_daily_limit(user.as_ref())
    }

    /// Connect unless the local daily quota is already spent
    ///
    /// When it is, the upgrade prompt is raised and the connect is kept
    /// pending until `handle_purchase_success()`.
    pub async fn connect_with_limit_check(&self) -> Result<(), ConnectError> {
        if !self.shared.auth.has_session() {
            return Err(ConnectError::NeedsLogin);
        }
        let user = self.shared.auth.current_user();
        let check = self.shared.usage.check_before_connect(user.as_ref());
        if !check.can_connect {
            let reason = check
                .reason
                .unwrap_or_else(|| REASON_TRAFFIC_EXCEEDED.to_string());
            info!(%reason, "Daily limit reached, offering upgrade");
            self.update(|state| {
                state.error = Some(reason.clone());
                state.show_upgrade_prompt = true;
                state.pending_connect_after_purchase = true;
            });
            return Err(ConnectError::QuotaExceeded { reason });
        }
        self.connect().await
    }

    /// Reload the profile after a purchase and run the pending connect
    pub async fn handle_purchase_success(&self) -> Result<(), ConnectError> {
        self.shared.auth.refresh_user_info().await;
        let pending = self.update(|state| {
            state.show_upgrade_prompt = false;
            state.error = None;
            std::mem::take(&mut state.pending_connect_after_purchase)
        });
        if pending {
            info!("Purchase complete, resuming connect");
            self.connect().await
        } else {
            Ok(())
        }
    }

    pub fn dismiss_upgrade_prompt(&self) {
        self.update(|state| {
            state.show_upgrade_prompt = false;
            state.pending_connect_after_purchase = false;
        });
    }

    /// Disconnect if needed, then log out
    pub async fn logout(&self) {
        if !self.status().is_disconnected() {
            self.disconnect().await;
        }
        self.shared.auth.logout().await;
        self.update(|state| {
            state.error = None;
            state.show_upgrade_prompt = false;
            state.pending_connect_after_purchase = false;
        });
    }

    /// Stop every background task; safe to call repeatedly
    pub fn shutdown(&self) {
        self.shared.heartbeat.stop();
        self.stop_session_timers();
        lock(&self.shared.event_loop).stop();
        self.shared.reconnect.cancel();
        debug!("Connection state machine shut down");
    }

    // --- reconciliation ---

    /// Poll the engine once and reconcile local status with it
    pub async fn sync_status(&self) {
        let poll_started = Instant::now();
        let report = match self.shared.engine.query_status().await {
            Ok(report) => report,
            Err(e) => {
                debug!(error = %e, "Engine status query failed");
                return;
            }
        };

        let grace = self.shared.config.grace_period();
        let outcome = self.update(|state| {
            // Checked under the state lock, which is also where actions are recorded
            let since_last_action = match self.shared.clock.window(poll_started) {
                PollWindow::Stale => return None,
                PollWindow::Elapsed(elapsed) => elapsed,
            };
            let decision = reconcile(&state.session.status, &report, since_last_action, grace);
            let followup = apply_decision(state, &decision);
            Some((decision, followup))
        });

        let Some((decision, followup)) = outcome else {
            debug!("Discarding status poll that predates the last action");
            return;
        };
        match &decision {
            Decision::InSync | Decision::Wait => trace!(?decision, "Heartbeat"),
            Decision::ConnectTimedOut => warn!("Engine did not connect within the grace period"),
            Decision::Recover { server_id, .. } => {
                info!(?server_id, "Recovered a running tunnel")
            }
            Decision::Adopt(status) => info!(status = status.as_str(), "Adopted engine status"),
        }
        self.run_followup(followup);
    }

    fn start_heartbeat(&self) -> bool {
        let weak = self.downgrade();
        self.shared
            .heartbeat
            .start(self.shared.config.heartbeat_interval(), move || {
                let machine = Self::upgrade(&weak);
                async move {
                    if let Some(machine) = machine {
                        machine.heartbeat_tick().await;
                    }
                }
            })
    }

    pub fn stop_heartbeat(&self) {
        self.shared.heartbeat.stop();
    }

    async fn heartbeat_tick(&self) {
        let locks = &self.shared.locks;
        if locks.is_locked(CONNECT_LOCK_KEY) || locks.is_locked(DISCONNECT_LOCK_KEY) {
            trace!("Heartbeat skipped while an operation is in flight");
            return;
        }
        self.sync_status().await;
    }

    fn run_followup(&self, followup: Followup) {
        match followup {
            Followup::Nothing => {}
            Followup::SessionStarted => {
                self.shared.reconnect.cancel();
                self.start_session_monitors();
                self.ensure_event_loop();
            }
            Followup::SessionEnded(finished) => {
                self.stop_session_timers();
                if let Some(session) = finished {
                    self.shared.usage.accumulate(&session);
                    let machine = self.clone();
                    tokio::spawn(async move { machine.report_session(&session).await });
                }
            }
        }
    }

    // --- engine events ---

    fn ensure_event_loop(&self) {
        let mut task = lock(&self.shared.event_loop);
        if task.is_active() {
            return;
        }
        let mut events = self.shared.engine.subscribe();
        let weak = self.downgrade();
        task.replace(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(machine) = Self::upgrade(&weak) else {
                            break;
                        };
                        machine.handle_event(event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Engine events lagged");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Engine event channel closed");
                        break;
                    }
                }
            }
        }));
    }

    /// Apply one engine event
    pub async fn handle_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::StatusChanged { status } => self.on_status_changed(status),
            EngineEvent::TrafficSample(sample) => self.on_traffic(&sample),
            EngineEvent::LatencySample { ms } => self.update(|state| {
                if state.session.status.is_connected() {
                    state.session.stats.latency_ms = ms;
                }
            }),
            EngineEvent::ConnectionError { message, fatal } => {
                self.on_connection_error(&message, fatal)
            }
            EngineEvent::ProcessTerminated { reason } => self.on_terminated(reason).await,
            EngineEvent::LogLine { level, message } => forward_log(level, &message),
        }
    }

    fn on_status_changed(&self, status: EngineStatus) {
        debug!(status = status.as_str(), "Engine status changed");
        let followup = self.update(|state| match (status, state.session.status.clone()) {
            // Stale events from a session being torn down or replaced
            (EngineStatus::Connected, ConnectionStatus::Disconnecting)
            | (EngineStatus::Disconnected, ConnectionStatus::Connecting) => Followup::Nothing,
            (EngineStatus::Connected, _) => {
                state.session.mark_connected(Utc::now());
                state.busy = false;
                state.user_disconnecting = false;
                Followup::SessionStarted
            }
            (EngineStatus::Disconnected, _) => {
                let finished = state
                    .session
                    .finish(ConnectionStatus::Disconnected, Utc::now());
                state.busy = false;
                state.user_disconnecting = false;
                Followup::SessionEnded(finished)
            }
            (other, _) => {
                state.session.set_status(other.into());
                Followup::Nothing
            }
        });
        self.run_followup(followup);
    }

    fn on_traffic(&self, sample: &TrafficSample) {
        let stats = self.update(|state| {
            if !state.session.status.is_connected() {
                return None;
            }
            state.session.stats.apply_traffic(sample);
            Some(state.session.stats)
        });
        if let Some(stats) = stats {
            self.enforce_session_limit(&stats);
        }
    }

    fn on_connection_error(&self, message: &str, fatal: bool) {
        let message = format!("Connection failed: {}", message);
        if fatal {
            error!(%message, "Fatal engine error");
        } else {
            warn!(%message, "Engine reported an error");
        }
        let followup = self.update(|state| {
            state.error = Some(message.clone());
            state.busy = false;
            if fatal {
                let finished = state
                    .session
                    .finish(ConnectionStatus::Errored(message.clone()), Utc::now());
                Followup::SessionEnded(finished)
            } else {
                Followup::Nothing
            }
        });
        self.run_followup(followup);
    }

    async fn on_terminated(&self, reason: TerminationReason) {
        let fatal = matches!(reason, TerminationReason::FatalError);
        let finished = self.update(|state| {
            if state.user_disconnecting || state.session.status.is_disconnected() {
                return None;
            }
            let status = if fatal {
                state.error = Some(MSG_TERMINATED.to_string());
                ConnectionStatus::Errored(MSG_TERMINATED.to_string())
            } else {
                ConnectionStatus::Disconnected
            };
            state.busy = false;
            Some(state.session.finish(status, Utc::now()))
        });
        let Some(finished) = finished else {
            debug!(reason = reason.as_str(), "Expected tunnel termination");
            return;
        };

        warn!(reason = reason.as_str(), "Tunnel terminated unexpectedly");
        self.stop_session_timers();
        if let Some(session) = &finished {
            self.shared.usage.accumulate(session);
            self.report_session(session).await;
        }

        if !fatal && self.shared.config.auto_reconnect {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&self) {
        let weak = self.downgrade();
        let auto_reconnect = self.shared.config.auto_reconnect;
        let attempt: AttemptFn = Arc::new(move || {
            let weak = weak.clone();
            async move {
                let Some(machine) = Self::upgrade(&weak) else {
                    return AttemptOutcome::Failed { retry: false };
                };
                match machine.try_connect().await {
                    Ok(()) if machine.status().is_connected() => AttemptOutcome::Connected,
                    // Still Connecting; the heartbeat settles it
                    Ok(()) => AttemptOutcome::Failed { retry: false },
                    Err(e) => {
                        warn!(error = %e, "Reconnect attempt failed");
                        AttemptOutcome::Failed {
                            retry: auto_reconnect && machine.status().is_disconnected(),
                        }
                    }
                }
            }
            .boxed()
        });

        if self.shared.reconnect.schedule(attempt).is_none() {
            self.update(|state| state.error = Some(MSG_RECONNECT_GAVE_UP.to_string()));
        }
    }

    // --- session monitors ---

    fn start_session_monitors(&self) {
        let mut timers = lock(&self.shared.timers);

        if !timers.elapsed.is_active() {
            let weak = self.downgrade();
            timers
                .elapsed
                .replace(spawn_periodic(ELAPSED_TICK, false, move || {
                    let machine = Self::upgrade(&weak);
                    async move {
                        let Some(machine) = machine else {
                            return ControlFlow::Break(());
                        };
                        machine.tick_elapsed();
                        ControlFlow::Continue(())
                    }
                }));
        }

        if !timers.ping.is_active() {
            let weak = self.downgrade();
            timers.ping.replace(spawn_periodic(
                self.shared.config.ping_interval(),
                true,
                move || {
                    let machine = Self::upgrade(&weak);
                    async move {
                        let Some(machine) = machine else {
                            return ControlFlow::Break(());
                        };
                        machine.ping_once().await;
                        ControlFlow::Continue(())
                    }
                },
            ));
        }

        if !timers.realtime_usage.is_active() {
            let weak = self.downgrade();
            timers.realtime_usage.replace(spawn_periodic(
                self.shared.config.realtime_usage_interval(),
                false,
                move || {
                    let machine = Self::upgrade(&weak);
                    async move {
                        let Some(machine) = machine else {
                            return ControlFlow::Break(());
                        };
                        machine.poll_realtime_usage().await;
                        ControlFlow::Continue(())
                    }
                },
            ));
        }
        debug!("Session monitors running");
    }

    fn stop_session_timers(&self) {
        let mut timers = lock(&self.shared.timers);
        timers.elapsed.stop();
        timers.ping.stop();
        timers.realtime_usage.stop();
    }

    fn tick_elapsed(&self) {
        let stats = self.update(|state| {
            if !state.session.status.is_connected() {
                return None;
            }
            state.session.stats.elapsed_seconds = state.session.elapsed_at(Utc::now());
            Some(state.session.stats)
        });
        if let Some(stats) = stats {
            self.enforce_session_limit(&stats);
        }
    }

    fn enforce_session_limit(&self, stats: &SessionStats) {
        let user = self.shared.auth.current_user();
        if !self.shared.usage.check_during_session(user.as_ref(), stats) {
            return;
        }
        warn!(
            traffic = stats.total_bytes(),
            elapsed = stats.elapsed_seconds,
            "Daily limit reached during session, disconnecting"
        );
        self.update(|state| {
            state.error = Some(MSG_SESSION_LIMIT.to_string());
            state.show_upgrade_prompt = true;
        });
        // Runs outside the timer task, which the disconnect stops
        let machine = self.clone();
        tokio::spawn(async move { machine.disconnect().await });
    }

    async fn ping_once(&self) {
        let target = self.read(|state| {
            if !state.session.status.is_connected() {
                return None;
            }
            state
                .selected
                .as_ref()
                .filter(|server| Some(server.id) == state.session.server_id)
                .map(Server::address)
        });
        let Some(target) = target else {
            return;
        };

        let latency = match self.shared.engine.test_latency(&target).await {
            Ok(ms) => ms,
            Err(e) => {
                debug!(%target, error = %e, "Ping failed");
                FAILED_LATENCY_MS
            }
        };
        self.update(|state| {
            if state.session.status.is_connected() {
                state.session.stats.latency_ms = latency;
            }
        });
    }

    async fn poll_realtime_usage(&self) {
        if !self.status().is_connected() {
            return;
        }
        let backend = self.shared.backend.clone();
        let usage = match self
            .shared
            .auth
            .with_auth(move |token| {
                let backend = backend.clone();
                async move { backend.realtime_usage(&token).await }
            })
            .await
        {
            Ok(usage) => usage,
            Err(e) => {
                debug!(error = %e, "Realtime usage check failed");
                return;
            }
        };

        self.shared
            .usage
            .adopt_server_totals(usage.daily_traffic_used, usage.daily_time_used);
        if !usage.should_disconnect {
            return;
        }

        let reason = usage
            .disconnect_reason
            .filter(|reason| !reason.is_empty())
            .unwrap_or_else(|| MSG_USAGE_EXCEEDED.to_string());
        warn!(%reason, "Backend requested disconnect");
        let machine = self.clone();
        tokio::spawn(async move {
            machine.disconnect().await;
            machine.update(|state| {
                state.error = Some(reason);
                state.show_upgrade_prompt = true;
            });
        });
    }

    /// Best-effort usage report for a finished session
    async fn report_session(&self, session: &FinishedSession) {
        let (Some(node_id), Some(connected_at)) = (session.server_id, session.started_at) else {
            return;
        };
        let duration = session.duration_secs();
        if duration == 0 || !self.shared.auth.is_authenticated() {
            return;
        }

        let report = UsageReport {
            node_id,
            traffic_download: session.stats.download_bytes,
            traffic_upload: session.stats.upload_bytes,
            duration,
            connected_at,
            disconnected_at: session.ended_at,
        };
        let report = &report;
        let backend = self.shared.backend.clone();
        match self
            .shared
            .auth
            .with_auth(move |token| {
                let backend = backend.clone();
                async move { backend.report_usage(&token, report).await }
            })
            .await
        {
            Ok(result) => debug!(
                session_id = session.session_id,
                limit_exceeded = result.limit_exceeded,
                "Session usage reported"
            ),
            Err(e) => warn!(error = %e, "Failed to report session usage"),
        }
    }
}

/// Apply a reconcile decision to state; the returned followup runs unlocked
fn apply_decision(state: &mut MachineState, decision: &Decision) -> Followup {
    let now = Utc::now();
    match decision {
        Decision::InSync | Decision::Wait => Followup::Nothing,
        Decision::ConnectTimedOut => {
            state.session.finish(
                ConnectionStatus::Errored(MSG_CONNECT_TIMEOUT.to_string()),
                now,
            );
            state.error = Some(MSG_CONNECT_TIMEOUT.to_string());
            state.busy = false;
            Followup::SessionEnded(None)
        }
        Decision::Recover {
            server_id,
            connected_at,
        } => {
            let server_id = server_id.or(state.selected.as_ref().map(|server| server.id));
            state.session.adopt(server_id, connected_at.unwrap_or(now));
            state.busy = false;
            state.user_disconnecting = false;
            state.error = None;
            Followup::SessionStarted
        }
        Decision::Adopt(EngineStatus::Connected) => {
            state.session.mark_connected(now);
            state.busy = false;
            state.user_disconnecting = false;
            Followup::SessionStarted
        }
        Decision::Adopt(EngineStatus::Disconnected) => {
            let finished = state.session.finish(ConnectionStatus::Disconnected, now);
            state.busy = false;
            Followup::SessionEnded(finished)
        }
        Decision::Adopt(other) => {
            state.session.set_status((*other).into());
            Followup::Nothing
        }
    }
}

fn forward_log(level: LogLevel, message: &str) {
    match level {
        LogLevel::Error => error!(target: "skiff::engine", "{}", message),
        LogLevel::Warn => warn!(target: "skiff::engine", "{}", message),
        LogLevel::Info => info!(target: "skiff::engine", "{}", message),
        LogLevel::Debug => debug!(target: "skiff::engine", "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineStatusReport;

    fn connected_report() -> EngineStatusReport {
        EngineStatusReport {
            status: EngineStatus::Connected,
            server_id: None,
            connected_at: None,
        }
    }

    #[test]
    fn test_timeout_decision_surfaces_error() {
        let mut state = MachineState::default();
        state.session.begin(4);
        state.busy = true;

        let followup = apply_decision(&mut state, &Decision::ConnectTimedOut);
        assert!(matches!(followup, Followup::SessionEnded(None)));
        assert!(state.session.status.is_disconnected());
        assert_eq!(state.error.as_deref(), Some(MSG_CONNECT_TIMEOUT));
        assert!(!state.busy);
    }

    #[test]
    fn test_recover_falls_back_to_selected_server() {
        let mut state = MachineState {
            selected: Some(Server {
                id: 12,
                name: "Tokyo".into(),
                domain: "jp.example.com".into(),
                port: 443,
                password: String::new(),
            }),
            ..Default::default()
        };
        let decision = reconcile(
            &state.session.status,
            &connected_report(),
            Duration::MAX,
            Duration::from_secs(5),
        );

        let followup = apply_decision(&mut state, &decision);
        assert!(matches!(followup, Followup::SessionStarted));
        assert_eq!(state.session.status, ConnectionStatus::Connected);
        assert_eq!(state.session.server_id, Some(12));
        assert!(state.session.started_at.is_some());
    }

    #[test]
    fn test_recover_clears_stale_user_disconnect() {
        let mut state = MachineState {
            user_disconnecting: true,
            ..Default::default()
        };
        let decision = Decision::Recover {
            server_id: Some(3),
            connected_at: None,
        };

        let followup = apply_decision(&mut state, &decision);
        assert!(matches!(followup, Followup::SessionStarted));
        assert!(!state.user_disconnecting);
        assert_eq!(state.session.server_id, Some(3));
    }

    #[test]
    fn test_adopt_disconnected_ends_session() {
        let mut state = MachineState::default();
        state.session.begin(1);
        state.session.mark_connected(Utc::now());
        state.session.stats.download_bytes = 2048;
        state.busy = true;

        let followup = apply_decision(&mut state, &Decision::Adopt(EngineStatus::Disconnected));
        let Followup::SessionEnded(Some(finished)) = followup else {
            panic!("expected a finished session");
        };
        assert_eq!(finished.stats.download_bytes, 2048);
        assert_eq!(state.session.stats, SessionStats::default());
        assert_eq!(state.session.status, ConnectionStatus::Disconnected);
        assert!(!state.busy);
    }
}
