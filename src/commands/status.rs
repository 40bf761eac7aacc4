//! `authflow status <server>`

use std::sync::Arc;

use colored::Colorize;
use prettytable::{row, Table};

use crate::auth::manager::{AuthManager, ServerStatus};
use crate::auth::redirect::PrintOnlyLauncher;
use crate::config::Config;
use crate::error::Result;

/// Prints what is stored for `server`.
///
/// # Errors
///
/// Returns unknown-server and credential-store errors.
pub fn run_status(config: Config, server: &str) -> Result<()> {
    let manager = AuthManager::from_config(config, Arc::new(PrintOnlyLauncher))?;
    let status = manager.status(server)?;
    println!("\nStored credentials for {}:\n", server.bold());
    status_table(&status).printstd();
    println!();
    Ok(())
}

fn status_table(status: &ServerStatus) -> Table {
    let mut table = Table::new();
    table.add_row(row!["Entry", "State", "Details"]);

    match &status.tokens {
        Some(tokens) => {
            let state = if tokens.is_expired() {
                "expired".yellow().to_string()
            } else {
                "valid".green().to_string()
            };
            let expiry = tokens
                .expires_at()
                .map(|at| format!("expires {}", at.to_rfc3339()))
                .unwrap_or_else(|| "no expiry".to_string());
            let refresh = if tokens.can_refresh() { "refreshable" } else { "no refresh token" };
            table.add_row(row!["tokens", state, format!("{expiry}, {refresh}")]);
        }
        None => {
            table.add_row(row!["tokens", "none", ""]);
        }
    }

    match &status.registration {
        Some(registration) => {
            table.add_row(row![
                "client_registration",
                format!("{:?}", registration.origin).to_lowercase(),
                registration.client_id
            ]);
        }
        None => {
            table.add_row(row!["client_registration", "none", ""]);
        }
    }

    match &status.pending {
        Some(marker) => {
            table.add_row(row![
                "pending_authorization",
                "parked".cyan().to_string(),
                format!("since {}", marker.parked_at.to_rfc3339())
            ]);
        }
        None => {
            table.add_row(row!["pending_authorization", "none", ""]);
        }
    }
    table
}
