//! VPN connection state
//!
//! Defines the connection status enum and the session record the state
//! machine owns. `started_at` is only ever set while Connected; ending a
//! session hands back a `FinishedSession` and zeroes the counters.

use crate::engine::{EngineStatus, TrafficSample};
use chrono::{DateTime, Utc};

/// VPN connection states
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not connected
    #[default]
    Disconnected,

    /// Start requested, engine not yet confirmed
    Connecting,

    /// Tunnel is up
    Connected,

    /// Stop requested, engine not yet confirmed
    Disconnecting,

    /// Not connected, carrying the last error
    Errored(String),
}

impl ConnectionStatus {
    /// Disconnected or Errored
    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionStatus::Disconnected | ConnectionStatus::Errored(_))
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    /// Status as the engine would report it
    pub fn as_engine_status(&self) -> EngineStatus {
        match self {
            ConnectionStatus::Disconnected | ConnectionStatus::Errored(_) => {
                EngineStatus::Disconnected
            }
            ConnectionStatus::Connecting => EngineStatus::Connecting,
            ConnectionStatus::Connected => EngineStatus::Connected,
            ConnectionStatus::Disconnecting => EngineStatus::Disconnecting,
        }
    }
}

impl From<EngineStatus> for ConnectionStatus {
    fn from(status: EngineStatus) -> Self {
        match status {
            EngineStatus::Disconnected => ConnectionStatus::Disconnected,
            EngineStatus::Connecting => ConnectionStatus::Connecting,
            EngineStatus::Connected => ConnectionStatus::Connected,
            EngineStatus::Disconnecting => ConnectionStatus::Disconnecting,
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnecting => write!(f, "disconnecting"),
            ConnectionStatus::Errored(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// Live counters for the current session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub download_bytes: u64,
    pub upload_bytes: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub latency_ms: u64,
    pub elapsed_seconds: u64,
}

impl SessionStats {
    /// Fold a traffic sample in; byte totals never move backwards
    pub fn apply_traffic(&mut self, sample: &TrafficSample) {
        self.download_bytes = self.download_bytes.max(sample.download_bytes);
        self.upload_bytes = self.upload_bytes.max(sample.upload_bytes);
        self.download_rate = sample.download_rate;
        self.upload_rate = sample.upload_rate;
    }

    pub fn total_bytes(&self) -> u64 {
        self.download_bytes.saturating_add(self.upload_bytes)
    }
}

/// What is left of a session after it ends, for usage accounting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedSession {
    pub session_id: u64,
    pub server_id: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub stats: SessionStats,
}

impl FinishedSession {
    /// Whole seconds the session was connected
    pub fn duration_secs(&self) -> u64 {
        match self.started_at {
            Some(started) => (self.ended_at - started).num_seconds().max(0) as u64,
            None => self.stats.elapsed_seconds,
        }
    }
}

/// The one active connection record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSession {
    pub status: ConnectionStatus,
    pub server_id: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub stats: SessionStats,
    /// Increments for every new session; used to accumulate usage once
    pub session_id: u64,
}

impl ConnectionSession {
    /// Enter Connecting for `server_id` with fresh counters
    pub fn begin(&mut self, server_id: u64) {
        self.session_id += 1;
        self.status = ConnectionStatus::Connecting;
        self.server_id = Some(server_id);
        self.started_at = None;
        self.stats = SessionStats::default();
    }

    /// Enter Connected
    ///
    /// Completes the attempt opened by `begin()`. Arriving from any other
    /// status starts a new session on the last known server.
    pub fn mark_connected(&mut self, at: DateTime<Utc>) {
        match self.status {
            ConnectionStatus::Connected => {}
            ConnectionStatus::Connecting => {
                self.status = ConnectionStatus::Connected;
                self.started_at.get_or_insert(at);
            }
            _ => self.adopt(None, at),
        }
    }

    /// Adopt a session discovered already running
    pub fn adopt(&mut self, server_id: Option<u64>, started_at: DateTime<Utc>) {
        self.session_id += 1;
        self.status = ConnectionStatus::Connected;
        if server_id.is_some() {
            self.server_id = server_id;
        }
        self.started_at = Some(started_at);
        self.stats = SessionStats::default();
    }

    /// Close the session record and move to `status`
    ///
    /// Returns the finished session if one was running (Connected); the
    /// counters are zeroed either way.
    pub fn finish(&mut self, status: ConnectionStatus, now: DateTime<Utc>) -> Option<FinishedSession> {
        let finished = self.started_at.take().map(|started_at| FinishedSession {
            session_id: self.session_id,
            server_id: self.server_id,
            started_at: Some(started_at),
            ended_at: now,
            stats: self.stats,
        });
        self.stats = SessionStats::default();
        self.status = status;
        finished
    }

    /// Change status without touching counters, keeping `started_at` only while Connected
    pub fn set_status(&mut self, status: ConnectionStatus) {
        if !status.is_connected() {
            self.started_at = None;
        }
        self.status = status;
    }

    pub fn elapsed_at(&self, now: DateTime<Utc>) -> u64 {
        self.started_at
            .map(|started| (now - started).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }
}
