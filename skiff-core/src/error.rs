//! Error types for the skiff VPN client
//!
//! This module defines all error types used throughout the client,
//! keeping raw transport causes (for logs) separate from the short,
//! classified messages shown to the user.

use thiserror::Error;

/// Main error type for the skiff client
#[derive(Error, Debug)]
pub enum SkiffError {
    /// Errors related to configuration loading/parsing
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Errors related to persistent storage
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Errors returned by the account backend
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Authentication and credential errors
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Errors reported by the tunnel engine
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// A connection attempt was refused or failed
    #[error("{0}")]
    Connect(#[from] ConnectError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {path}")]
    LoadFailed { path: String },

    #[error("Failed to save configuration file: {path}")]
    SaveFailed { path: String },

    #[error("Invalid API base URL: {url}")]
    InvalidUrl { url: String },

    #[error("Configuration validation error: {message}")]
    ValidationError { message: String },

    #[error("I/O error: {message}")]
    IoError { message: String },
}

/// Key-value storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Keyring service unavailable")]
    ServiceUnavailable,

    #[error("Failed to write key {key}")]
    WriteFailed { key: String },

    #[error("Failed to read key {key}")]
    ReadFailed { key: String },

    #[error("Stored value for {key} is malformed: {message}")]
    Malformed { key: String, message: String },

    #[error("I/O error: {message}")]
    Io { message: String },
}

/// Backend request errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The request never reached the server or timed out
    #[error("Network error: {0}")]
    Transport(String),

    /// The server answered with a non-success HTTP status
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// The server answered 200 with an error envelope
    #[error("Backend error {code}: {message}")]
    Envelope { code: i64, message: String },

    /// The response body could not be decoded
    #[error("Invalid response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether the failure is a network-level problem worth falling back on
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }

    /// Whether the server rejected the bearer token
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Status { status: 401, .. })
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Transport(format!("request timed out: {}", e))
        } else if e.is_connect() || e.is_request() {
            ApiError::Transport(e.to_string())
        } else if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            ApiError::Status {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            ApiError::Transport(e.to_string())
        }
    }
}

/// Authentication errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Not logged in")]
    NotAuthenticated,

    #[error("Login failed: {0}")]
    LoginFailed(String),

    #[error("Session expired")]
    SessionExpired,

    #[error("Refresh token rejected")]
    RefreshRejected,
}

/// Tunnel engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Tunnel engine is not installed or not ready")]
    NotReady,

    #[error("Failed to start tunnel: {0}")]
    StartFailed(String),

    #[error("Failed to stop tunnel: {0}")]
    StopFailed(String),

    #[error("Status query failed: {0}")]
    QueryFailed(String),

    #[error("Latency test to {target} failed: {reason}")]
    LatencyFailed { target: String, reason: String },
}

/// Why a connection attempt did not go ahead
///
/// These are the short strings surfaced to the user; the raw cause is
/// logged where it happens.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Please log in first")]
    NeedsLogin,

    #[error("No server selected")]
    NoServerSelected,

    #[error("System extension required")]
    EngineNotReady,

    #[error("{reason}")]
    QuotaExceeded { reason: String },

    #[error("{reason}")]
    Rejected { reason: String },

    #[error("{message}")]
    Engine { message: String },

    #[error("A connection attempt is already in progress")]
    AlreadyInProgress,
}

impl ConnectError {
    /// Whether the user should be offered an upgrade instead of a retry
    pub fn is_quota(&self) -> bool {
        matches!(self, ConnectError::QuotaExceeded { .. })
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, SkiffError>;
