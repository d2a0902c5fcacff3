//! Type definitions and wrappers for secure data handling
//!
//! This module provides type-safe wrappers for bearer credentials using the
//! secrecy crate to prevent accidental exposure in logs or debug output,
//! plus the user and server records shared by the other modules.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};

/// Opaque bearer token sent with authenticated requests
#[derive(Clone, Debug)]
pub struct AccessToken(Secret<String>);

impl AccessToken {
    pub fn new(token: String) -> Self {
        Self(Secret::new(token))
    }

    /// Expose the token value (use with caution!)
    ///
    /// Only for building the `Authorization` header or persisting it to the
    /// secure store.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl From<String> for AccessToken {
    fn from(token: String) -> Self {
        Self::new(token)
    }
}

/// Long-lived token exchanged for a new access token
#[derive(Clone, Debug)]
pub struct RefreshToken(Secret<String>);

impl RefreshToken {
    pub fn new(token: String) -> Self {
        Self(Secret::new(token))
    }

    /// Expose the token value (use with caution!)
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl From<String> for RefreshToken {
    fn from(token: String) -> Self {
        Self::new(token)
    }
}

/// Account password, only held for the duration of a login call
#[derive(Clone, Debug)]
pub struct Password(Secret<String>);

impl Password {
    pub fn new(password: String) -> Self {
        Self(Secret::new(password))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

/// Role names granting unlimited usage
pub const ADMIN_ROLES: &[&str] = &["super_admin", "admin", "administrator"];

/// Role name granting elevated (subscriber) usage
pub const VIP_ROLE: &str = "vip";

/// Account profile returned by the backend
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Subscription end; absent means the subscription does not lapse
    #[serde(default)]
    pub vip_expire_at: Option<DateTime<Utc>>,
    /// Per-account daily traffic limit in bytes, 0 means use the client default
    #[serde(default)]
    pub daily_traffic_limit: u64,
    /// Per-account daily time limit in seconds, 0 means use the client default
    #[serde(default)]
    pub daily_time_limit: u64,
}

impl User {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        ADMIN_ROLES.iter().any(|role| self.has_role(role))
    }

    /// VIP role that has not lapsed at `now`
    pub fn is_vip_at(&self, now: DateTime<Utc>) -> bool {
        if !self.has_role(VIP_ROLE) {
            return false;
        }
        match self.vip_expire_at {
            Some(expire_at) => expire_at > now,
            None => true,
        }
    }

    /// Name shown in status output
    pub fn display_name(&self) -> &str {
        if !self.nickname.is_empty() {
            &self.nickname
        } else {
            &self.username
        }
    }
}

/// How the engine routes traffic
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Local SOCKS proxy only
    #[default]
    Socks,
    /// System-wide TUN device
    Tun,
}

impl ConnectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionMode::Socks => "socks",
            ConnectionMode::Tun => "tun",
        }
    }
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConnectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "socks" => Ok(ConnectionMode::Socks),
            "tun" => Ok(ConnectionMode::Tun),
            other => Err(format!("unknown connection mode: {}", other)),
        }
    }
}

/// A VPN node the user can connect to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    pub domain: String,
    pub port: u16,
    #[serde(default)]
    pub password: String,
}

impl Server {
    /// `host:port` form used for latency tests and logging
    pub fn address(&self) -> String {
        format!("{}:{}", self.domain, self.port)
    }
}
