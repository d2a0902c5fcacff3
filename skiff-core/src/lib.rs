//! Core library for the skiff VPN client
//!
//! This crate coordinates a tunnel engine with the account backend:
//! credentials and token refresh, daily usage quotas, the connection state
//! machine, heartbeat reconciliation and automatic reconnection.

pub mod error;
pub mod types;

pub mod api;
pub mod auth;
pub mod config;
pub mod engine;
pub mod storage;
pub mod sync;
pub mod vpn;

/// Initialize logging infrastructure
///
/// Sets up tracing with systemd journal logging when running under
/// systemd, otherwise logs to stderr with pretty formatting. The level
/// comes from `RUST_LOG` and defaults to `info`.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    {
        if std::env::var("JOURNAL_STREAM").is_ok() {
            // We're running under systemd, use journal logging
            let journal_layer = tracing_journald::layer()?;
            tracing_subscriber::registry()
                .with(journal_layer)
                .with(filter)
                .try_init()?;
            return Ok(());
        }
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
        .with(filter)
        .try_init()?;

    Ok(())
}
