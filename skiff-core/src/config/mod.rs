//! Configuration module
//!
//! Handles the client configuration and its TOML file representation.
//! Credentials are never stored here; they go to the keyring.

use crate::engine::process::EngineConfig;
use crate::types::{ConnectionMode, Server};
use crate::vpn::reconnect::{PolicyValidationError, ReconnectionPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod toml_config;

/// Complete client configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub reconnection: ReconnectionPolicy,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Nodes available to `up` and `ping`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<Server>,
}

impl ClientConfig {
    /// Validate every section
    pub fn validate(&self) -> Result<(), String> {
        self.api.validate()?;
        self.connection.validate()?;
        self.reconnection
            .validate()
            .map_err(|e: PolicyValidationError| format!("Invalid reconnection policy: {}", e))?;
        self.auth.validate()?;
        self.engine.validate()?;
        for (i, server) in self.servers.iter().enumerate() {
            if server.domain.trim().is_empty() || server.port == 0 {
                return Err(format!("Server {} needs a domain and a non-zero port", server.id));
            }
            if self.servers[..i].iter().any(|s| s.id == server.id) {
                return Err(format!("Duplicate server id {}", server.id));
            }
        }
        Ok(())
    }

    /// Find a configured server by id or by name (case-insensitive)
    pub fn find_server(&self, key: &str) -> Option<&Server> {
        match key.parse::<u64>() {
            Ok(id) => self.servers.iter().find(|s| s.id == id),
            Err(_) => self
                .servers
                .iter()
                .find(|s| s.name.eq_ignore_ascii_case(key)),
        }
    }
}

/// Account backend settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL all endpoint paths are appended to
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,

    /// Version string sent with the connect precheck
    #[serde(default = "default_client_version")]
    pub client_version: String,
}

fn default_base_url() -> String {
    "http://localhost:8080/api/v1".to_string()
}
fn default_api_timeout() -> u64 {
    10
}
fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_api_timeout(),
            client_version: default_client_version(),
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        match url::Url::parse(&self.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(format!(
                    "API base URL scheme must be http or https, got: {}",
                    url.scheme()
                ))
            }
            Err(e) => return Err(format!("Invalid API base URL: {}", e)),
        }

        if self.timeout_secs == 0 {
            return Err("API timeout cannot be zero".to_string());
        }

        Ok(())
    }
}

/// Connection lifecycle timing and policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub mode: ConnectionMode,

    /// Retry with backoff after an unexpected drop
    #[serde(default)]
    pub auto_reconnect: bool,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// How long a fresh connect/disconnect may disagree with the engine
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_realtime_usage_interval")]
    pub realtime_usage_interval_secs: u64,

    /// Pause before re-syncing after the engine start call returns
    #[serde(default = "default_connect_settle")]
    pub connect_settle_ms: u64,

    /// Pause before re-syncing after the engine stop call returns
    #[serde(default = "default_disconnect_settle")]
    pub disconnect_settle_ms: u64,
}

fn default_heartbeat_interval() -> u64 {
    3
}
fn default_grace_period() -> u64 {
    5
}
fn default_ping_interval() -> u64 {
    5
}
fn default_realtime_usage_interval() -> u64 {
    60
}
fn default_connect_settle() -> u64 {
    500
}
fn default_disconnect_settle() -> u64 {
    300
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mode: ConnectionMode::default(),
            auto_reconnect: false,
            heartbeat_interval_secs: default_heartbeat_interval(),
            grace_period_secs: default_grace_period(),
            ping_interval_secs: default_ping_interval(),
            realtime_usage_interval_secs: default_realtime_usage_interval(),
            connect_settle_ms: default_connect_settle(),
            disconnect_settle_ms: default_disconnect_settle(),
        }
    }
}

impl ConnectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn realtime_usage_interval(&self) -> Duration {
        Duration::from_secs(self.realtime_usage_interval_secs)
    }

    pub fn connect_settle(&self) -> Duration {
        Duration::from_millis(self.connect_settle_ms)
    }

    pub fn disconnect_settle(&self) -> Duration {
        Duration::from_millis(self.disconnect_settle_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval_secs == 0 {
            return Err("Heartbeat interval cannot be zero".to_string());
        }
        if self.ping_interval_secs == 0 {
            return Err("Ping interval cannot be zero".to_string());
        }
        if self.realtime_usage_interval_secs == 0 {
            return Err("Realtime usage interval cannot be zero".to_string());
        }
        Ok(())
    }
}

/// Client-side fallback daily limits for the standard tier
///
/// Only used when the backend precheck cannot be reached and the profile
/// carries no per-account override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_daily_traffic")]
    pub daily_traffic_bytes: u64,

    #[serde(default = "default_daily_time")]
    pub daily_time_secs: u64,
}

fn default_daily_traffic() -> u64 {
    1024 * 1024 * 1024
}
fn default_daily_time() -> u64 {
    2 * 60 * 60
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            daily_traffic_bytes: default_daily_traffic(),
            daily_time_secs: default_daily_time(),
        }
    }
}

/// Token refresh timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Refresh this long before the access token expires
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: u64,

    /// How often the background task looks at the expiry
    #[serde(default = "default_refresh_check_interval")]
    pub refresh_check_interval_secs: u64,
}

fn default_refresh_threshold() -> u64 {
    5 * 60
}
fn default_refresh_check_interval() -> u64 {
    60
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_threshold_secs: default_refresh_threshold(),
            refresh_check_interval_secs: default_refresh_check_interval(),
        }
    }
}

impl AuthConfig {
    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.refresh_threshold_secs)
    }

    pub fn refresh_check_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_check_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.refresh_check_interval_secs == 0 {
            return Err("Refresh check interval cannot be zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.grace_period(), Duration::from_secs(5));
        assert_eq!(config.connection.heartbeat_interval(), Duration::from_secs(3));
        assert_eq!(config.limits.daily_traffic_bytes, 1_073_741_824);
        assert_eq!(config.limits.daily_time_secs, 7200);
        assert_eq!(config.auth.refresh_threshold(), Duration::from_secs(300));
        assert!(!config.connection.auto_reconnect);
    }

    #[test]
    fn test_invalid_base_url() {
        let mut config = ClientConfig::default();
        config.api.base_url = "ftp://example.com".to_string();
        assert!(config.validate().unwrap_err().contains("http or https"));

        config.api.base_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_lookup_and_validation() {
        let mut config = ClientConfig::default();
        config.servers = vec![
            Server {
                id: 7,
                name: "Tokyo".to_string(),
                domain: "jp.example.com".to_string(),
                port: 443,
                password: String::new(),
            },
            Server {
                id: 9,
                name: "Frankfurt".to_string(),
                domain: "de.example.com".to_string(),
                port: 8443,
                password: String::new(),
            },
        ];
        assert!(config.validate().is_ok());
        assert_eq!(config.find_server("9").map(|s| s.port), Some(8443));
        assert_eq!(config.find_server("tokyo").map(|s| s.id), Some(7));
        assert!(config.find_server("3").is_none());

        config.servers[1].id = 7;
        assert!(config.validate().unwrap_err().contains("Duplicate"));

        config.servers[1].id = 9;
        config.servers[1].domain = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut config = ClientConfig::default();
        config.connection.heartbeat_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.auth.refresh_check_interval_secs = 0;
        assert!(config.validate().is_err());
    }
}
