//! Tunnel engine boundary
//!
//! The packet-level tunnel runs outside this crate. The connection state
//! machine drives it through `TunnelEngine` commands and consumes the
//! `EngineEvent` messages it broadcasts.

use crate::error::EngineError;
use crate::types::{ConnectionMode, Server};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

pub mod output_parser;
pub mod process;

pub use output_parser::OutputParser;
pub use process::{EngineConfig, ProcessEngine};

/// Connection status as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::Disconnected => "disconnected",
            EngineStatus::Connecting => "connecting",
            EngineStatus::Connected => "connected",
            EngineStatus::Disconnecting => "disconnecting",
        }
    }
}

/// Answer to `query_status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatusReport {
    pub status: EngineStatus,
    pub server_id: Option<u64>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl EngineStatusReport {
    pub fn disconnected() -> Self {
        Self {
            status: EngineStatus::Disconnected,
            server_id: None,
            connected_at: None,
        }
    }
}

/// Everything the engine needs to open a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerParams {
    pub server: Server,
    pub mode: ConnectionMode,
}

/// Cumulative counters and current rates for the running tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSample {
    pub download_bytes: u64,
    pub upload_bytes: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// Why the engine process went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// The engine logged a fatal error before exiting
    FatalError,
    /// The process exited on its own
    Exited { code: Option<i32> },
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::FatalError => "fatal_error",
            TerminationReason::Exited { .. } => "exit",
        }
    }
}

/// Asynchronous notifications from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    StatusChanged { status: EngineStatus },
    TrafficSample(TrafficSample),
    LatencySample { ms: u64 },
    ConnectionError { message: String, fatal: bool },
    ProcessTerminated { reason: TerminationReason },
    LogLine { level: LogLevel, message: String },
}

/// Outcome of one target in a batch latency test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyResult {
    pub target: String,
    pub latency: Result<u64, EngineError>,
}

/// Command side of the engine boundary
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Whether the engine is installed and able to start a tunnel
    async fn is_ready(&self) -> bool;

    async fn start_tunnel(&self, params: &ServerParams) -> Result<(), EngineError>;

    async fn stop_tunnel(&self) -> Result<(), EngineError>;

    async fn query_status(&self) -> Result<EngineStatusReport, EngineError>;

    /// Round-trip time to `target` (`host:port`) in milliseconds
    async fn test_latency(&self, target: &str) -> Result<u64, EngineError>;

    async fn batch_test_latency(&self, targets: &[String]) -> Vec<LatencyResult> {
        let probes = targets.iter().map(|target| async move {
            LatencyResult {
                target: target.clone(),
                latency: self.test_latency(target).await,
            }
        });
        futures::future::join_all(probes).await
    }

    /// New receiver for engine events
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}
