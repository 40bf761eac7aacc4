//! `authflow reset <server> --scope <scope>`

use std::sync::Arc;

use crate::auth::manager::AuthManager;
use crate::auth::redirect::PrintOnlyLauncher;
use crate::config::Config;
use crate::error::Result;
use crate::flow::machine::ResetScope;

/// Returns the server's flow to `idle` and forgets the scope's credentials.
///
/// # Errors
///
/// Returns unknown-server and credential-store errors.
pub fn run_reset(config: Config, server: &str, scope: ResetScope) -> Result<()> {
    let manager = AuthManager::from_config(config, Arc::new(PrintOnlyLauncher))?;
    manager.reset(server, scope)?;
    println!("Reset {server} ({scope}).");
    Ok(())
}
