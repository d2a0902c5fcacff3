//! Account backend interface
//!
//! The connection core only needs a handful of endpoints: login, token
//! refresh, logout, profile, connect precheck, realtime usage and usage
//! reporting. They sit behind `BackendApi` so the state machine can be
//! exercised against a fake.

use crate::error::ApiError;
use crate::types::{AccessToken, Password, RefreshToken, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod http;

pub use http::HttpBackend;

/// `POST /auth/login` body
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    pub account: &'a str,
    pub password: &'a str,
}

/// `POST /auth/login` result
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
    pub user: User,
}

/// `POST /auth/refresh` result
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
}

/// `POST /vpn/connect/precheck` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrecheckRequest {
    pub node_id: u64,
    pub connection_mode: String,
    pub client_version: String,
}

/// `POST /vpn/connect/precheck` result
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PrecheckResponse {
    pub can_connect: bool,
    #[serde(default)]
    pub reject_reason: Option<String>,
    #[serde(default)]
    pub daily_traffic_used: u64,
    #[serde(default)]
    pub daily_time_used: u64,
    #[serde(default = "default_true")]
    pub node_allowed: bool,
}

fn default_true() -> bool {
    true
}

/// `GET /usage/realtime` result
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RealtimeUsage {
    #[serde(default)]
    pub daily_traffic_used: u64,
    #[serde(default)]
    pub daily_time_used: u64,
    #[serde(default)]
    pub should_disconnect: bool,
    #[serde(default)]
    pub disconnect_reason: Option<String>,
}

/// `POST /usage/report` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageReport {
    pub node_id: u64,
    pub traffic_download: u64,
    pub traffic_upload: u64,
    /// Session length in seconds
    pub duration: u64,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: DateTime<Utc>,
}

/// `POST /usage/report` result
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UsageReportResult {
    #[serde(default)]
    pub daily_traffic_used: u64,
    #[serde(default)]
    pub daily_time_used: u64,
    #[serde(default)]
    pub limit_exceeded: bool,
}

#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn login(&self, account: &str, password: &Password) -> Result<LoginResponse, ApiError>;

    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<TokenResponse, ApiError>;

    async fn logout(&self, access_token: &AccessToken) -> Result<(), ApiError>;

    async fn profile(&self, access_token: &AccessToken) -> Result<User, ApiError>;

    async fn connect_precheck(
        &self,
        access_token: &AccessToken,
        request: &PrecheckRequest,
    ) -> Result<PrecheckResponse, ApiError>;

    async fn realtime_usage(&self, access_token: &AccessToken) -> Result<RealtimeUsage, ApiError>;

    async fn report_usage(
        &self,
        access_token: &AccessToken,
        report: &UsageReport,
    ) -> Result<UsageReportResult, ApiError>;
}
