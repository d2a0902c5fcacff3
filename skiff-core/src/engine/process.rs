//! Process-backed tunnel engine
//!
//! Runs an external tunnel binary, turns its output into `EngineEvent`s,
//! polls its local stats endpoint for traffic counters and stops it with
//! SIGTERM, escalating to SIGKILL after a timeout.

use crate::engine::{
    EngineEvent, EngineStatus, EngineStatusReport, LogLevel, OutputParser, ServerParams,
    TerminationReason, TrafficSample, TunnelEngine,
};
use crate::error::EngineError;
use crate::sync::timer::spawn_periodic;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How to run and observe the tunnel binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Executable name or path
    #[serde(default = "default_command")]
    pub command: String,

    /// Arguments; `{host}`, `{port}`, `{mode}` and `{server_id}` are substituted
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Write the server password to the engine's stdin instead of the command line
    #[serde(default = "default_true")]
    pub password_on_stdin: bool,

    #[serde(default = "default_ready_pattern")]
    pub ready_pattern: String,

    #[serde(default = "default_fatal_pattern")]
    pub fatal_pattern: String,

    #[serde(default = "default_error_pattern")]
    pub error_pattern: String,

    /// Local endpoint returning `{"downloadTotal": n, "uploadTotal": n}`
    #[serde(default = "default_stats_url")]
    pub stats_url: Option<String>,

    #[serde(default = "default_stats_interval")]
    pub stats_interval_ms: u64,

    #[serde(default = "default_latency_timeout")]
    pub latency_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

fn default_command() -> String {
    "skiff-tunnel".to_string()
}
fn default_args() -> Vec<String> {
    ["run", "--server", "{host}:{port}", "--mode", "{mode}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_true() -> bool {
    true
}
fn default_ready_pattern() -> String {
    r"(?i)sing-box started|tunnel started".to_string()
}
fn default_fatal_pattern() -> String {
    r"(?i)^(FATAL|PANIC)|panic:|address already in use".to_string()
}
fn default_error_pattern() -> String {
    r"^ERROR".to_string()
}
fn default_stats_url() -> Option<String> {
    Some("http://127.0.0.1:9090/connections".to_string())
}
fn default_stats_interval() -> u64 {
    1000
}
fn default_latency_timeout() -> u64 {
    5000
}
fn default_stop_timeout() -> u64 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            password_on_stdin: default_true(),
            ready_pattern: default_ready_pattern(),
            fatal_pattern: default_fatal_pattern(),
            error_pattern: default_error_pattern(),
            stats_url: default_stats_url(),
            stats_interval_ms: default_stats_interval(),
            latency_timeout_ms: default_latency_timeout(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("Engine command cannot be empty".to_string());
        }
        for (name, pattern) in [
            ("ready_pattern", &self.ready_pattern),
            ("fatal_pattern", &self.fatal_pattern),
            ("error_pattern", &self.error_pattern),
        ] {
            regex::Regex::new(pattern).map_err(|e| format!("Invalid engine {}: {}", name, e))?;
        }
        if let Some(url) = &self.stats_url {
            url::Url::parse(url).map_err(|e| format!("Invalid engine stats URL: {}", e))?;
        }
        if self.stats_interval_ms == 0 {
            return Err("Engine stats interval cannot be zero".to_string());
        }
        if self.latency_timeout_ms == 0 {
            return Err("Engine latency timeout cannot be zero".to_string());
        }
        Ok(())
    }

    /// Arguments with the server placeholders filled in
    pub fn render_args(&self, params: &ServerParams) -> Vec<String> {
        let port = params.server.port.to_string();
        let server_id = params.server.id.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{host}", &params.server.domain)
                    .replace("{port}", &port)
                    .replace("{mode}", params.mode.as_str())
                    .replace("{server_id}", &server_id)
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(rename = "downloadTotal")]
    download_total: u64,
    #[serde(rename = "uploadTotal")]
    upload_total: u64,
}

#[derive(Debug)]
struct TunnelState {
    status: EngineStatus,
    server_id: Option<u64>,
    connected_at: Option<DateTime<Utc>>,
    pid: Option<u32>,
    /// Set by `stop_tunnel` so the exit is not reported as a crash
    stopping: bool,
    fatal_seen: bool,
}

impl Default for TunnelState {
    fn default() -> Self {
        Self {
            status: EngineStatus::Disconnected,
            server_id: None,
            connected_at: None,
            pid: None,
            stopping: false,
            fatal_seen: false,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Tunnel engine running an external binary
pub struct ProcessEngine {
    config: EngineConfig,
    parser: Arc<OutputParser>,
    events: broadcast::Sender<EngineEvent>,
    state: Arc<Mutex<TunnelState>>,
    /// Kept open for the lifetime of the process; closing it ends some engines
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    exited: Mutex<Option<watch::Receiver<bool>>>,
    monitors: Mutex<Vec<JoinHandle<()>>>,
    http: reqwest::Client,
}

impl ProcessEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let parser = OutputParser::new(
            &config.ready_pattern,
            &config.fatal_pattern,
            &config.error_pattern,
        )
        .map_err(|e| EngineError::StartFailed(format!("invalid output pattern: {}", e)))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| EngineError::StartFailed(e.to_string()))?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            parser: Arc::new(parser),
            events,
            state: Arc::new(Mutex::new(TunnelState::default())),
            stdin: Arc::new(tokio::sync::Mutex::new(None)),
            exited: Mutex::new(None),
            monitors: Mutex::new(Vec::new()),
            http,
        })
    }

    fn emit(events: &broadcast::Sender<EngineEvent>, event: EngineEvent) {
        // No subscribers is fine; events are advisory
        let _ = events.send(event);
    }

    fn spawn_output_monitor<R>(&self, stream: R, name: &'static str) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let parser = Arc::clone(&self.parser);
        let events = self.events.clone();
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Some(parsed) = parser.parse_line(&line) else {
                    continue;
                };
                debug!(stream = name, "engine: {}", line);

                if parsed.level != LogLevel::Debug {
                    Self::emit(
                        &events,
                        EngineEvent::LogLine {
                            level: parsed.level,
                            message: parsed.message.clone(),
                        },
                    );
                }

                match &parsed.event {
                    Some(EngineEvent::StatusChanged {
                        status: EngineStatus::Connected,
                    }) => {
                        let mut state = lock(&state);
                        state.status = EngineStatus::Connected;
                        state.connected_at.get_or_insert_with(Utc::now);
                    }
                    Some(EngineEvent::ConnectionError { fatal: true, .. }) => {
                        lock(&state).fatal_seen = true;
                    }
                    _ => {}
                }

                if let Some(event) = parsed.event {
                    Self::emit(&events, event);
                }
            }
        })
    }

    fn spawn_stats_poller(&self, url: String) -> JoinHandle<()> {
        let http = self.http.clone();
        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        let period = Duration::from_millis(self.config.stats_interval_ms);
        let last = Arc::new(Mutex::new((0u64, 0u64)));

        spawn_periodic(period, false, move || {
            let http = http.clone();
            let events = events.clone();
            let state = Arc::clone(&state);
            let last = Arc::clone(&last);
            let url = url.clone();
            async move {
                let status = {
                    let state = lock(&state);
                    if state.pid.is_none() {
                        return ControlFlow::Break(());
                    }
                    state.status
                };
                if status != EngineStatus::Connected {
                    return ControlFlow::Continue(());
                }

                let stats = match http.get(&url).send().await {
                    Ok(response) if response.status().is_success() => {
                        response.json::<StatsResponse>().await
                    }
                    Ok(response) => {
                        debug!(status = %response.status(), "Stats endpoint returned error");
                        return ControlFlow::Continue(());
                    }
                    Err(e) => Err(e),
                };

                match stats {
                    Ok(stats) => {
                        let secs = period.as_secs_f64().max(0.001);
                        let (prev_down, prev_up) = {
                            let mut last = lock(&last);
                            let prev = *last;
                            *last = (stats.download_total, stats.upload_total);
                            prev
                        };
                        let sample = TrafficSample {
                            download_bytes: stats.download_total,
                            upload_bytes: stats.upload_total,
                            download_rate: (stats.download_total.saturating_sub(prev_down) as f64
                                / secs) as u64,
                            upload_rate: (stats.upload_total.saturating_sub(prev_up) as f64 / secs)
                                as u64,
                        };
                        Self::emit(&events, EngineEvent::TrafficSample(sample));
                    }
                    Err(e) => debug!(error = %e, "Stats poll failed"),
                }
                ControlFlow::Continue(())
            }
        })
    }
}

/// Kill a child that never became the tunnel and wait briefly for its exit
///
/// Returns whether the child was reaped.
async fn discard_child(mut child: Child) -> bool {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Engine child already gone");
    }
    match tokio::time::timeout(Duration::from_secs(1), child.wait()).await {
        Ok(Ok(status)) => {
            debug!(%status, "Discarded engine child exited");
            true
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Failed to reap engine child");
            false
        }
        Err(_) => {
            warn!(pid = ?child.id(), "Engine child did not exit after kill");
            false
        }
    }
}

#[async_trait]
impl TunnelEngine for ProcessEngine {
    async fn is_ready(&self) -> bool {
        which::which(&self.config.command).is_ok()
    }

    #[tracing::instrument(skip(self, params), fields(server_id = params.server.id, mode = %params.mode))]
    async fn start_tunnel(&self, params: &ServerParams) -> Result<(), EngineError> {
        if lock(&self.state).pid.is_some() {
            return Err(EngineError::StartFailed("tunnel already running".to_string()));
        }
        let program = which::which(&self.config.command).map_err(|_| EngineError::NotReady)?;

        let mut cmd = Command::new(program);
        cmd.args(self.config.render_args(params))
            .stdin(if self.config.password_on_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::StartFailed(format!("failed to spawn engine: {}", e)))?;
        let pid = child.id();
        info!(?pid, "Tunnel engine spawned");

        if let Some(mut stdin) = child.stdin.take() {
            let written = async {
                stdin.write_all(params.server.password.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            }
            .await;
            if let Err(e) = written {
                discard_child(child).await;
                return Err(EngineError::StartFailed(format!(
                    "failed to write credentials to engine: {}",
                    e
                )));
            }
            *self.stdin.lock().await = Some(stdin);
        }

        {
            let mut state = lock(&self.state);
            *state = TunnelState {
                status: EngineStatus::Connecting,
                server_id: Some(params.server.id),
                pid,
                ..TunnelState::default()
            };
        }
        Self::emit(
            &self.events,
            EngineEvent::StatusChanged {
                status: EngineStatus::Connecting,
            },
        );

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_output_monitor(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_output_monitor(stderr, "stderr"));
        }
        let mut tasks = Vec::new();
        if let Some(url) = self.config.stats_url.clone() {
            tasks.push(self.spawn_stats_poller(url));
        }

        let (exit_tx, exit_rx) = watch::channel(false);
        *lock(&self.exited) = Some(exit_rx);

        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        let stdin = Arc::clone(&self.stdin);
        tasks.push(tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    error!(error = %e, "Failed to wait for engine process");
                    None
                }
            };
            stdin.lock().await.take();
            // Drain remaining output so a fatal last line is seen before classifying the exit
            let drained = futures::future::join_all(readers);
            if tokio::time::timeout(Duration::from_secs(1), drained).await.is_err() {
                debug!("Engine output still open after exit");
            }

            let (stopping, fatal_seen) = {
                let mut state = lock(&state);
                let flags = (state.stopping, state.fatal_seen);
                *state = TunnelState::default();
                flags
            };
            let _ = exit_tx.send(true);

            if stopping {
                info!(?code, "Tunnel engine stopped");
                Self::emit(
                    &events,
                    EngineEvent::StatusChanged {
                        status: EngineStatus::Disconnected,
                    },
                );
            } else {
                let reason = if fatal_seen {
                    TerminationReason::FatalError
                } else {
                    TerminationReason::Exited { code }
                };
                warn!(?code, reason = reason.as_str(), "Tunnel engine exited unexpectedly");
                Self::emit(&events, EngineEvent::ProcessTerminated { reason });
            }
        }));

        let mut monitors = lock(&self.monitors);
        monitors.retain(|h| !h.is_finished());
        monitors.extend(tasks);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn stop_tunnel(&self) -> Result<(), EngineError> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = {
            let mut state = lock(&self.state);
            let Some(pid) = state.pid else {
                debug!("No engine process to stop");
                return Ok(());
            };
            state.stopping = true;
            state.status = EngineStatus::Disconnecting;
            pid
        };
        let exited = lock(&self.exited).clone();
        let pid = Pid::from_raw(pid as i32);

        info!(%pid, "Sending SIGTERM to engine process");
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            // ESRCH: already gone, the waiter will clean up
            if e != nix::errno::Errno::ESRCH {
                return Err(EngineError::StopFailed(format!("SIGTERM failed: {}", e)));
            }
        }

        let Some(mut exited) = exited else {
            return Ok(());
        };
        let timeout = Duration::from_secs(self.config.stop_timeout_secs);
        let graceful = tokio::time::timeout(timeout, exited.wait_for(|done| *done))
            .await
            .is_ok();
        if graceful {
            return Ok(());
        }

        warn!(%pid, "Graceful shutdown timed out, sending SIGKILL");
        kill(pid, Signal::SIGKILL)
            .map_err(|e| EngineError::StopFailed(format!("SIGKILL failed: {}", e)))?;
        let killed = tokio::time::timeout(Duration::from_secs(1), exited.wait_for(|done| *done))
            .await
            .is_ok();
        if killed {
            Ok(())
        } else {
            Err(EngineError::StopFailed("engine process did not exit".to_string()))
        }
    }

    async fn query_status(&self) -> Result<EngineStatusReport, EngineError> {
        let state = lock(&self.state);
        Ok(EngineStatusReport {
            status: state.status,
            server_id: state.server_id,
            connected_at: state.connected_at,
        })
    }

    async fn test_latency(&self, target: &str) -> Result<u64, EngineError> {
        let timeout = Duration::from_millis(self.config.latency_timeout_ms);
        let started = Instant::now();
        match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
            Ok(Ok(_stream)) => Ok(started.elapsed().as_millis() as u64),
            Ok(Err(e)) => Err(EngineError::LatencyFailed {
                target: target.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(EngineError::LatencyFailed {
                target: target.to_string(),
                reason: "timed out".to_string(),
            }),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

impl Drop for ProcessEngine {
    fn drop(&mut self) {
        for handle in lock(&self.monitors).drain(..) {
            handle.abort();
        }
    }
}
