//! CLI command implementations
//!
//! `Client` wires the skiff-core components the way every command needs
//! them; the submodules hold one command family each.

use skiff_core::api::HttpBackend;
use skiff_core::auth::TokenRefreshCoordinator;
use skiff_core::config::toml_config::{get_state_path, load_config};
use skiff_core::config::ClientConfig;
use skiff_core::engine::ProcessEngine;
use skiff_core::error::SkiffError;
use skiff_core::storage::{FileStore, KeyValueStore, KeyringStore};
use skiff_core::vpn::{ConnectionStateMachine, Remaining, UsageLimitGuard};
use std::sync::Arc;
use tracing::{debug, warn};

pub mod account;
pub mod session;
pub mod status;

/// Components shared by all commands
pub struct Client {
    pub config: ClientConfig,
    pub backend: Arc<HttpBackend>,
    pub auth: TokenRefreshCoordinator,
    pub usage: Arc<UsageLimitGuard>,
    pub engine: Arc<ProcessEngine>,
}

impl Client {
    /// Load the configuration and restore persisted credentials and usage
    pub fn load() -> Result<Self, SkiffError> {
        let config = load_config()?;

        let backend = Arc::new(HttpBackend::new(&config.api.base_url, config.api.timeout())?);
        let state_store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(get_state_path()?));
        let secure_store: Arc<dyn KeyValueStore> = Arc::new(KeyringStore::default());

        let auth = TokenRefreshCoordinator::new(
            backend.clone(),
            secure_store,
            state_store.clone(),
            config.auth.clone(),
        );
        match auth.restore() {
            Ok(true) => debug!("Restored stored credentials"),
            Ok(false) => debug!("No stored credentials"),
            // A locked keyring should not stop commands that work signed out
            Err(e) => warn!(error = %e, "Failed to restore credentials"),
        }

        let usage = Arc::new(UsageLimitGuard::new(state_store, config.limits));
        let engine = Arc::new(ProcessEngine::new(config.engine.clone())?);

        Ok(Self {
            config,
            backend,
            auth,
            usage,
            engine,
        })
    }

    /// A state machine over this client's engine, backend and stores
    pub fn machine(&self) -> ConnectionStateMachine {
        ConnectionStateMachine::new(
            self.engine.clone(),
            self.backend.clone(),
            self.auth.clone(),
            self.usage.clone(),
            &self.config,
        )
    }
}

/// Human-readable byte count using binary units
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// `1h 02m 03s` style duration
pub fn format_duration(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

pub fn format_remaining(remaining: Remaining, unit: impl Fn(u64) -> String) -> String {
    match remaining {
        Remaining::Unbounded => "unlimited".to_string(),
        Remaining::Limited(n) => unit(n),
    }
}
