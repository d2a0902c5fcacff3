//! Account commands
//!
//! `login` stores the token pair in the system keyring and the profile in
//! the state file; `logout` disconnects first, then clears both.

use super::Client;
use anyhow::Context;
use colored::Colorize;
use skiff_core::error::SkiffError;
use skiff_core::types::Password;
use std::io::{self, Write};

/// Run the login command
pub async fn run_login(client: &Client, account: Option<String>) -> anyhow::Result<()> {
    let account = match account {
        Some(account) => account,
        None => prompt_required("Account")?,
    };
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;
    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }

    let user = client
        .auth
        .login(&account, &Password::new(password))
        .await
        .map_err(SkiffError::from)?;
    // The process exits right after; nothing is left to refresh
    client.auth.stop_auto_refresh();

    println!("{} Logged in as {}", "✓".green(), user.display_name().bold());
    Ok(())
}

/// Run the logout command
pub async fn run_logout(client: &Client) -> anyhow::Result<()> {
    if !client.auth.has_session() {
        println!("Not logged in");
        return Ok(());
    }

    let machine = client.machine();
    machine.logout().await;
    machine.shutdown();

    println!("{} Logged out", "✓".green());
    Ok(())
}

/// Prompt until a non-empty line is entered
fn prompt_required(prompt: &str) -> anyhow::Result<String> {
    loop {
        print!("{}: ", prompt);
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            anyhow::bail!("No input for {}", prompt.to_lowercase());
        }
        let input = input.trim();
        if !input.is_empty() {
            return Ok(input.to_string());
        }
        println!("{} This field is required.", "✗".red());
    }
}
