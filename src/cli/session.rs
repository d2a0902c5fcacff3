//! Connection commands
//!
//! `up` runs the state machine in the foreground: it connects, prints
//! status changes and periodic stats, and disconnects on Ctrl+C. Without
//! `auto_reconnect` an unexpected drop ends the command; with it the
//! machine keeps retrying until interrupted.

use super::{format_bytes, format_duration, Client};
use anyhow::Context;
use colored::{ColoredString, Colorize};
use skiff_core::config::ClientConfig;
use skiff_core::engine::TunnelEngine;
use skiff_core::error::{ConfigError, SkiffError};
use skiff_core::types::Server;
use skiff_core::vpn::{ConnectionStateMachine, ConnectionStatus, MachineSnapshot};
use std::time::Duration;

/// How often `up` prints a stats line while connected
const STATS_INTERVAL: Duration = Duration::from_secs(30);

fn config_error(message: impl Into<String>) -> SkiffError {
    SkiffError::Config(ConfigError::ValidationError {
        message: message.into(),
    })
}

/// Server named by `key` (id or name), or the first configured one
fn pick_server(config: &ClientConfig, key: Option<&str>) -> Result<Server, SkiffError> {
    match key {
        Some(key) => config
            .find_server(key)
            .cloned()
            .ok_or_else(|| config_error(format!("Unknown server: {}", key))),
        None => config.servers.first().cloned().ok_or_else(|| {
            config_error("No servers configured; add a [[servers]] entry to the configuration")
        }),
    }
}

/// Run the up command
pub async fn run_up(client: &Client, server_key: Option<&str>) -> anyhow::Result<()> {
    let server = pick_server(&client.config, server_key)?;

    let machine = client.machine();
    machine.start();
    machine.select_server(server.clone());
    if client.auth.has_session() {
        client.auth.start_auto_refresh();
    }

    println!(
        "Connecting to {} ({})...",
        server.name.bold(),
        server.address()
    );
    let result = hold_session(client, &machine).await;

    machine.shutdown();
    client.auth.stop_auto_refresh();
    result
}

async fn hold_session(client: &Client, machine: &ConnectionStateMachine) -> anyhow::Result<()> {
    if let Err(e) = machine.connect_with_limit_check().await {
        if e.is_quota() {
            println!("{}", "Upgrade your plan to keep connecting today.".yellow());
        }
        return Err(SkiffError::Connect(e).into());
    }

    let auto_reconnect = client.config.connection.auto_reconnect;
    let mut snapshots = machine.subscribe();
    let mut last_status: Option<ConnectionStatus> = None;
    let mut stats_timer = tokio::time::interval(STATS_INTERVAL);
    stats_timer.tick().await;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        if last_status.as_ref() != Some(&snapshot.status) {
            print_status(&snapshot);
            last_status = Some(snapshot.status.clone());
        }
        if snapshot.status.is_disconnected() && !snapshot.busy && !auto_reconnect {
            return match session_error(&snapshot) {
                Some(message) => Err(anyhow::anyhow!(message)),
                None => Ok(()),
            };
        }

        tokio::select! {
            signal = &mut ctrl_c => {
                signal.context("Failed to listen for Ctrl+C")?;
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = stats_timer.tick() => {
                if snapshot.status.is_connected() {
                    print_stats(&machine.snapshot());
                }
            }
        }
    }

    let before = machine.snapshot();
    println!("Disconnecting...");
    machine.disconnect().await;

    if before.status.is_connected() {
        println!(
            "Session: {}, {} down, {} up",
            format_duration(before.stats.elapsed_seconds),
            format_bytes(before.stats.download_bytes),
            format_bytes(before.stats.upload_bytes)
        );
    }
    if let Some(error) = machine.error() {
        println!("{} {}", "!".yellow(), error);
    }
    Ok(())
}

fn session_error(snapshot: &MachineSnapshot) -> Option<String> {
    match &snapshot.status {
        ConnectionStatus::Errored(message) => Some(message.clone()),
        _ => snapshot.error.clone(),
    }
}

fn print_status(snapshot: &MachineSnapshot) {
    let label = match &snapshot.status {
        ConnectionStatus::Connected => "● connected".green().bold(),
        ConnectionStatus::Connecting => "◌ connecting".yellow(),
        ConnectionStatus::Disconnecting => "◌ disconnecting".yellow(),
        ConnectionStatus::Disconnected => "○ disconnected".normal(),
        ConnectionStatus::Errored(_) => "✗ failed".red().bold(),
    };
    match session_error(snapshot) {
        Some(message) if snapshot.status.is_disconnected() => println!("{}: {}", label, message),
        _ => println!("{}", label),
    }
}

fn print_stats(snapshot: &MachineSnapshot) {
    let stats = &snapshot.stats;
    println!(
        "  {}  ↓ {}/s ↑ {}/s  total {}  {} ms",
        format_duration(stats.elapsed_seconds),
        format_bytes(stats.download_rate),
        format_bytes(stats.upload_rate),
        format_bytes(stats.total_bytes()),
        stats.latency_ms
    );
}

fn latency_label(ms: u64) -> ColoredString {
    let text = format!("{} ms", ms);
    if ms < 100 {
        text.green()
    } else if ms < 300 {
        text.yellow()
    } else {
        text.red()
    }
}

/// Run the ping command
pub async fn run_ping(client: &Client, targets: Vec<String>) -> anyhow::Result<()> {
    let labelled: Vec<(String, String)> = if targets.is_empty() {
        client
            .config
            .servers
            .iter()
            .map(|server| {
                let label = if server.name.is_empty() {
                    server.address()
                } else {
                    server.name.clone()
                };
                (label, server.address())
            })
            .collect()
    } else {
        targets.into_iter().map(|t| (t.clone(), t)).collect()
    };
    if labelled.is_empty() {
        return Err(config_error(
            "No servers configured; pass host:port targets or add [[servers]] entries",
        )
        .into());
    }

    let addresses: Vec<String> = labelled.iter().map(|(_, address)| address.clone()).collect();
    let results = client.engine.batch_test_latency(&addresses).await;

    let width = labelled.iter().map(|(label, _)| label.len()).max().unwrap_or(0);
    let mut reachable = 0;
    for ((label, _), result) in labelled.iter().zip(results) {
        match result.latency {
            Ok(ms) => {
                reachable += 1;
                println!("{:width$}  {}", label, latency_label(ms), width = width);
            }
            Err(e) => println!("{:width$}  {}", label, e.to_string().red(), width = width),
        }
    }

    if reachable == 0 {
        anyhow::bail!("No server reachable");
    }
    Ok(())
}
