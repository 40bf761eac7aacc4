//! `authflow callback <url>`

use std::sync::Arc;

use crate::auth::callback::CallbackParams;
use crate::auth::manager::AuthManager;
use crate::auth::redirect::PrintOnlyLauncher;
use crate::config::Config;
use crate::error::Result;

/// Delivers a redirect captured outside authflow to the flow waiting for it.
///
/// # Errors
///
/// Returns an error when the input carries no callback parameters or no
/// flow is pending.
pub async fn run_callback(config: Config, raw: &str) -> Result<()> {
    let callback = CallbackParams::parse(raw)?;
    let manager = AuthManager::from_config(config, Arc::new(PrintOnlyLauncher))?;
    let state = manager.route_callback(callback).await?;
    super::print_outcome(&state);
    Ok(())
}
