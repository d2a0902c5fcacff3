//! Status and usage commands

use super::{format_bytes, format_duration, format_remaining, Client};
use anyhow::Context;
use chrono::Utc;
use colored::Colorize;
use skiff_core::api::BackendApi;
use skiff_core::error::SkiffError;
use skiff_core::engine::TunnelEngine;
use skiff_core::vpn::usage::classify;
use skiff_core::vpn::UserLimitTier;

/// Run the status command
pub async fn run_status(client: &Client) -> anyhow::Result<()> {
    let user = client.auth.current_user();
    let tier = classify(user.as_ref(), Utc::now());

    println!("{}", "Account".bold());
    match (&user, client.auth.tokens()) {
        (Some(user), Some(tokens)) => {
            println!("  User:    {} ({})", user.display_name(), tier_label(tier));
            let token_state = if !client.auth.is_valid() {
                "expired".red()
            } else if client.auth.is_expiring_soon() {
                "expiring soon".yellow()
            } else {
                "valid".green()
            };
            println!(
                "  Token:   {} (expires {})",
                token_state,
                tokens.expires_at.format("%Y-%m-%d %H:%M UTC")
            );
        }
        _ => println!("  {}", "Not logged in".yellow()),
    }

    println!("{}", "Engine".bold());
    let ready = if client.engine.is_ready().await {
        "ready".green()
    } else {
        "not installed".red()
    };
    println!("  {}: {}", client.config.engine.command, ready);
    println!("  Mode:    {}", client.config.connection.mode);
    println!("  Servers: {} configured", client.config.servers.len());

    print_usage(client);
    Ok(())
}

/// Run the usage command
pub async fn run_usage(client: &Client, refresh: bool) -> anyhow::Result<()> {
    if refresh {
        if !client.auth.has_session() {
            return Err(SkiffError::Connect(skiff_core::error::ConnectError::NeedsLogin).into());
        }
        let backend = client.backend.clone();
        let realtime = client
            .auth
            .with_auth(|token| {
                let backend = backend.clone();
                async move { backend.realtime_usage(&token).await }
            })
            .await
            .map_err(SkiffError::from)
            .context("Failed to fetch usage from the backend")?;
        client
            .usage
            .adopt_server_totals(realtime.daily_traffic_used, realtime.daily_time_used);
    }

    print_usage(client);
    Ok(())
}

fn print_usage(client: &Client) {
    let user = client.auth.current_user();
    let usage = client.usage.usage();
    let check = client.usage.check_before_connect(user.as_ref());
    let status = client.usage.check_daily_limit(user.as_ref());

    println!("{} ({})", "Today".bold(), usage.date);
    println!(
        "  Traffic: {} used, {} left",
        format_bytes(usage.traffic_bytes),
        format_remaining(check.remaining_traffic, format_bytes)
    );
    println!(
        "  Time:    {} used, {} left",
        format_duration(usage.time_seconds),
        format_remaining(check.remaining_time, format_duration)
    );
    match status.reason {
        Some(reason) if status.exceeded => println!("  {}", reason.red()),
        _ => println!("  {}", "Within daily limits".green()),
    }
}

fn tier_label(tier: UserLimitTier) -> &'static str {
    match tier {
        UserLimitTier::Unlimited => "unlimited",
        UserLimitTier::Elevated => "pro",
        UserLimitTier::Standard => "free",
    }
}
