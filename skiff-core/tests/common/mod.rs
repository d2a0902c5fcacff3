//! Shared test doubles for the integration suites
//!
//! `FakeEngine` and `FakeBackend` count every command and network call so
//! tests can assert on what did (or did not) reach the outside world.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skiff_core::api::{
    BackendApi, LoginResponse, PrecheckRequest, PrecheckResponse, RealtimeUsage, TokenResponse,
    UsageReport, UsageReportResult,
};
use skiff_core::auth::TokenRefreshCoordinator;
use skiff_core::config::ClientConfig;
use skiff_core::engine::{
    EngineEvent, EngineStatus, EngineStatusReport, ServerParams, TunnelEngine,
};
use skiff_core::error::{ApiError, EngineError};
use skiff_core::storage::MemoryStore;
use skiff_core::types::{AccessToken, Password, RefreshToken, Server, User};
use skiff_core::vpn::{ConnectionStateMachine, UsageLimitGuard};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

pub const GIB: u64 = 1024 * 1024 * 1024;

pub struct FakeEngine {
    pub ready: AtomicBool,
    /// `start_tunnel` brings the tunnel up immediately
    pub connect_on_start: AtomicBool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub report: Mutex<EngineStatusReport>,
    pub latency: Mutex<Result<u64, EngineError>>,
    events: broadcast::Sender<EngineEvent>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            ready: AtomicBool::new(true),
            connect_on_start: AtomicBool::new(true),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            report: Mutex::new(EngineStatusReport::disconnected()),
            latency: Mutex::new(Ok(42)),
            events,
        })
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn set_report(
        &self,
        status: EngineStatus,
        server_id: Option<u64>,
        connected_at: Option<DateTime<Utc>>,
    ) {
        *self.report.lock().unwrap() = EngineStatusReport {
            status,
            server_id,
            connected_at,
        };
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl TunnelEngine for FakeEngine {
    async fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn start_tunnel(&self, params: &ServerParams) -> Result<(), EngineError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.connect_on_start.load(Ordering::SeqCst) {
            self.set_report(
                EngineStatus::Connected,
                Some(params.server.id),
                Some(Utc::now()),
            );
        }
        Ok(())
    }

    async fn stop_tunnel(&self) -> Result<(), EngineError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        *self.report.lock().unwrap() = EngineStatusReport::disconnected();
        Ok(())
    }

    async fn query_status(&self) -> Result<EngineStatusReport, EngineError> {
        Ok(self.report.lock().unwrap().clone())
    }

    async fn test_latency(&self, _target: &str) -> Result<u64, EngineError> {
        self.latency.lock().unwrap().clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

pub struct FakeBackend {
    pub user: Mutex<User>,
    pub expires_in: i64,
    pub refresh_delay: Duration,
    pub refresh_result: Mutex<Result<TokenResponse, ApiError>>,
    pub precheck: Mutex<Result<PrecheckResponse, ApiError>>,
    pub realtime: Mutex<Result<RealtimeUsage, ApiError>>,
    pub refresh_calls: AtomicUsize,
    pub precheck_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub reports: Mutex<Vec<UsageReport>>,
}

pub fn allowed_precheck() -> PrecheckResponse {
    PrecheckResponse {
        can_connect: true,
        reject_reason: None,
        daily_traffic_used: 0,
        daily_time_used: 0,
        node_allowed: true,
    }
}

pub fn token_response(access: &str) -> TokenResponse {
    TokenResponse {
        access_token: access.to_string(),
        refresh_token: format!("{}-refresh", access),
        expires_in: 3600,
        token_type: "Bearer".to_string(),
    }
}

pub fn standard_user() -> User {
    User {
        id: 1,
        username: "alice".to_string(),
        roles: vec!["user".to_string()],
        ..Default::default()
    }
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Self::with_expiry(3600)
    }

    /// Backend whose login hands out tokens living `expires_in` seconds
    pub fn with_expiry(expires_in: i64) -> Arc<Self> {
        Self::build(expires_in, Duration::ZERO)
    }

    pub fn build(expires_in: i64, refresh_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            user: Mutex::new(standard_user()),
            expires_in,
            refresh_delay,
            refresh_result: Mutex::new(Ok(token_response("refreshed"))),
            precheck: Mutex::new(Ok(allowed_precheck())),
            realtime: Mutex::new(Ok(RealtimeUsage {
                daily_traffic_used: 0,
                daily_time_used: 0,
                should_disconnect: false,
                disconnect_reason: None,
            })),
            refresh_calls: AtomicUsize::new(0),
            precheck_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            reports: Mutex::new(Vec::new()),
        })
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn precheck_calls(&self) -> usize {
        self.precheck_calls.load(Ordering::SeqCst)
    }
}

fn unauthorized() -> ApiError {
    ApiError::Status {
        status: 401,
        message: "Unauthorized".to_string(),
    }
}

#[async_trait]
impl BackendApi for FakeBackend {
    async fn login(&self, account: &str, password: &Password) -> Result<LoginResponse, ApiError> {
        if password.expose() != "secret" {
            return Err(ApiError::Envelope {
                code: 1001,
                message: "Invalid account or password".to_string(),
            });
        }
        let user = self.user.lock().unwrap().clone();
        Ok(LoginResponse {
            access_token: format!("{}-access", account),
            refresh_token: format!("{}-refresh", account),
            expires_in: self.expires_in,
            token_type: "Bearer".to_string(),
            user,
        })
    }

    async fn refresh(&self, _refresh_token: &RefreshToken) -> Result<TokenResponse, ApiError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        self.refresh_result.lock().unwrap().clone()
    }

    async fn logout(&self, _access_token: &AccessToken) -> Result<(), ApiError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn profile(&self, access_token: &AccessToken) -> Result<User, ApiError> {
        if access_token.is_empty() {
            return Err(unauthorized());
        }
        Ok(self.user.lock().unwrap().clone())
    }

    async fn connect_precheck(
        &self,
        _access_token: &AccessToken,
        _request: &PrecheckRequest,
    ) -> Result<PrecheckResponse, ApiError> {
        self.precheck_calls.fetch_add(1, Ordering::SeqCst);
        self.precheck.lock().unwrap().clone()
    }

    async fn realtime_usage(&self, _access_token: &AccessToken) -> Result<RealtimeUsage, ApiError> {
        self.realtime.lock().unwrap().clone()
    }

    async fn report_usage(
        &self,
        _access_token: &AccessToken,
        report: &UsageReport,
    ) -> Result<UsageReportResult, ApiError> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(UsageReportResult::default())
    }
}

pub fn tokyo() -> Server {
    Server {
        id: 7,
        name: "Tokyo".to_string(),
        domain: "jp.example.com".to_string(),
        port: 443,
        password: "node-secret".to_string(),
    }
}

/// A machine wired to fakes and in-memory stores
pub struct Harness {
    pub engine: Arc<FakeEngine>,
    pub backend: Arc<FakeBackend>,
    pub auth: TokenRefreshCoordinator,
    pub usage: Arc<UsageLimitGuard>,
    pub machine: ConnectionStateMachine,
}

impl Harness {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_backend(config, FakeBackend::new())
    }

    pub fn with_backend(config: ClientConfig, backend: Arc<FakeBackend>) -> Self {
        let engine = FakeEngine::new();
        let secure_store = Arc::new(MemoryStore::new());
        let profile_store = Arc::new(MemoryStore::new());
        let auth = TokenRefreshCoordinator::new(
            backend.clone(),
            secure_store,
            profile_store.clone(),
            config.auth.clone(),
        );
        let usage = Arc::new(UsageLimitGuard::new(profile_store, config.limits));
        let machine = ConnectionStateMachine::new(
            engine.clone(),
            backend.clone(),
            auth.clone(),
            usage.clone(),
            &config,
        );
        Self {
            engine,
            backend,
            auth,
            usage,
            machine,
        }
    }

    pub async fn login(&self) {
        self.auth
            .login("alice", &Password::new("secret".to_string()))
            .await
            .expect("login");
    }

    /// Logged in with Tokyo selected
    pub async fn ready_to_connect(&self) {
        self.login().await;
        self.machine.select_server(tokyo());
    }
}
