//! HTTP implementation of the backend interface
//!
//! Every response is wrapped in a `{code, message, data}` envelope; a
//! non-zero code is an application error even on HTTP 200.

use crate::api::{
    BackendApi, LoginRequest, LoginResponse, PrecheckRequest, PrecheckResponse, RealtimeUsage,
    TokenResponse, UsageReport, UsageReportResult,
};
use crate::error::ApiError;
use crate::types::{AccessToken, Password, RefreshToken, User};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

/// Reqwest-backed client for the account backend
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    /// Create a new backend client
    ///
    /// # Arguments
    /// * `base_url` - HTTP/HTTPS URL the endpoint paths are appended to
    /// * `timeout` - Maximum duration to wait for any single request
    #[tracing::instrument(skip(timeout), fields(base_url = %base_url, timeout_ms = timeout.as_millis()))]
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let url = Url::parse(base_url)
            .map_err(|e| ApiError::Transport(format!("Failed to parse URL: {}", e)))?;

        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(ApiError::Transport(format!(
                    "Only HTTP/HTTPS schemes are supported, got: {}",
                    scheme
                )));
            }
        }

        let client = Client::builder()
            .timeout(timeout)
            .use_rustls_tls()
            .build()
            .map_err(|e| ApiError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = request.send().await.map_err(|e| {
            warn!(error = %e, "Backend request failed");
            ApiError::from(e)
        })?;

        let status = response.status();
        let body = response.text().await.map_err(ApiError::from)?;

        if !status.is_success() {
            let message = serde_json::from_str::<Envelope<serde_json::Value>>(&body)
                .ok()
                .and_then(|env| env.message)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
            debug!(status = status.as_u16(), %message, "Backend returned error status");
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: Envelope<T> =
            serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))?;

        if envelope.code != 0 {
            return Err(ApiError::Envelope {
                code: envelope.code,
                message: envelope.message.unwrap_or_else(|| "Error".to_string()),
            });
        }

        match envelope.data {
            Some(data) => Ok(data),
            // Endpoints without a payload answer `data: null`
            None => serde_json::from_value(serde_json::Value::Null)
                .map_err(|_| ApiError::Decode("missing data field".to_string())),
        }
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    #[tracing::instrument(skip(self, password))]
    async fn login(&self, account: &str, password: &Password) -> Result<LoginResponse, ApiError> {
        let body = LoginRequest {
            account,
            password: password.expose(),
        };
        self.send(self.client.post(self.url("/auth/login")).json(&body))
            .await
    }

    #[tracing::instrument(skip_all)]
    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<TokenResponse, ApiError> {
        let body = serde_json::json!({ "refresh_token": refresh_token.expose() });
        self.send(self.client.post(self.url("/auth/refresh")).json(&body))
            .await
    }

    #[tracing::instrument(skip_all)]
    async fn logout(&self, access_token: &AccessToken) -> Result<(), ApiError> {
        self.send::<Option<serde_json::Value>>(
            self.client
                .post(self.url("/auth/logout"))
                .bearer_auth(access_token.expose()),
        )
        .await
        .map(|_| ())
    }

    #[tracing::instrument(skip_all)]
    async fn profile(&self, access_token: &AccessToken) -> Result<User, ApiError> {
        self.send(
            self.client
                .get(self.url("/user/profile"))
                .bearer_auth(access_token.expose()),
        )
        .await
    }

    #[tracing::instrument(skip(self, access_token), fields(node_id = request.node_id))]
    async fn connect_precheck(
        &self,
        access_token: &AccessToken,
        request: &PrecheckRequest,
    ) -> Result<PrecheckResponse, ApiError> {
        self.send(
            self.client
                .post(self.url("/vpn/connect/precheck"))
                .bearer_auth(access_token.expose())
                .json(request),
        )
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn realtime_usage(&self, access_token: &AccessToken) -> Result<RealtimeUsage, ApiError> {
        self.send(
            self.client
                .get(self.url("/usage/realtime"))
                .bearer_auth(access_token.expose()),
        )
        .await
    }

    #[tracing::instrument(skip(self, access_token), fields(node_id = report.node_id, duration = report.duration))]
    async fn report_usage(
        &self,
        access_token: &AccessToken,
        report: &UsageReport,
    ) -> Result<UsageReportResult, ApiError> {
        self.send::<Option<UsageReportResult>>(
            self.client
                .post(self.url("/usage/report"))
                .bearer_auth(access_token.expose())
                .json(report),
        )
        .await
        .map(Option::unwrap_or_default)
    }
}
