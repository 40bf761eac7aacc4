//! `authflow token <server>`

use std::sync::Arc;

use crate::auth::manager::AuthManager;
use crate::auth::redirect::PrintOnlyLauncher;
use crate::config::Config;
use crate::error::Result;

/// Prints a valid access token on stdout, refreshing it when needed.
///
/// # Errors
///
/// Returns an error when no token can be produced without a new
/// authorization.
pub async fn run_token(config: Config, server: &str) -> Result<()> {
    let manager = AuthManager::from_config(config, Arc::new(PrintOnlyLauncher))?;
    let token = manager.access_token(server).await?;
    println!("{token}");
    Ok(())
}
