//! skiff - VPN client CLI
//!
//! Drives a tunnel engine through the skiff-core connection state machine:
//! account login with keyring-backed tokens, daily usage quotas, and
//! automatic reconnection after unexpected drops.

use clap::{Parser, Subcommand};
use colored::Colorize;
use skiff_core::error::{AuthError, ConnectError, SkiffError};
use skiff_core::init_logging;

mod cli;

#[derive(Parser)]
#[command(name = "skiff")]
#[command(version, about = "VPN client with usage quotas and automatic reconnection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in to the account backend
    Login {
        /// Account name or email; prompted when omitted
        account: Option<String>,
    },
    /// Log out and forget stored credentials
    Logout,
    /// Show account, engine and quota status
    Status,
    /// Show today's traffic and time usage
    Usage {
        /// Fetch the latest totals from the backend first
        #[arg(long)]
        refresh: bool,
    },
    /// Measure latency to servers (host:port); defaults to configured servers
    Ping { targets: Vec<String> },
    /// Connect and stay connected until Ctrl+C
    Up {
        /// Server id or name from the configuration; defaults to the first one
        #[arg(short, long)]
        server: Option<String>,
    },
}

async fn run(command: Commands) -> anyhow::Result<()> {
    let client = cli::Client::load()?;
    match command {
        Commands::Login { account } => cli::account::run_login(&client, account).await,
        Commands::Logout => cli::account::run_logout(&client).await,
        Commands::Status => cli::status::run_status(&client).await,
        Commands::Usage { refresh } => cli::status::run_usage(&client, refresh).await,
        Commands::Ping { targets } => cli::session::run_ping(&client, targets).await,
        Commands::Up { server } => cli::session::run_up(&client, server.as_deref()).await,
    }
}

/// Configuration and credential problems exit with 2, runtime failures with 1
fn exit_code(error: &anyhow::Error) -> i32 {
    for cause in error.chain() {
        if let Some(e) = cause.downcast_ref::<SkiffError>() {
            return match e {
                SkiffError::Config(_)
                | SkiffError::Toml(_)
                | SkiffError::TomlSerialize(_)
                | SkiffError::Storage(_)
                | SkiffError::Auth(_) => 2,
                SkiffError::Connect(ConnectError::NeedsLogin) => 2,
                SkiffError::Api(_)
                | SkiffError::Engine(_)
                | SkiffError::Connect(_)
                | SkiffError::Io(_) => 1,
            };
        }
        if cause.downcast_ref::<AuthError>().is_some() {
            return 2;
        }
        if let Some(e) = cause.downcast_ref::<ConnectError>() {
            return if *e == ConnectError::NeedsLogin { 2 } else { 1 };
        }
    }
    1
}

fn main() {
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(2);
    }

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    match runtime.block_on(run(cli.command)) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            std::process::exit(exit_code(&e));
        }
    }
}
