//! `authflow connect <server>`
//!
//! Runs discovery and registration, opens the browser, and waits on the
//! loopback redirect URI for the callback. When the listener cannot bind,
//! the flow stays parked and the callback can be delivered later with
//! `authflow callback`.

use std::sync::Arc;

use crate::auth::callback::LoopbackListener;
use crate::auth::manager::AuthManager;
use crate::auth::redirect::{BrowserLauncher, PrintOnlyLauncher, SystemBrowser};
use crate::config::Config;
use crate::error::Result;
use crate::flow::state::FlowStep;

/// Authorizes against `server`.
///
/// # Errors
///
/// Returns configuration, store, and listener errors. Flow failures are
/// printed, not returned.
pub async fn run_connect(config: Config, server: &str, no_browser: bool, trace: bool) -> Result<()> {
    let launcher: Arc<dyn BrowserLauncher> = if no_browser {
        Arc::new(PrintOnlyLauncher)
    } else {
        Arc::new(SystemBrowser)
    };
    let redirect_uri = config.redirect_uri()?;
    let redirect_timeout = config.flow.redirect_timeout();
    let manager = AuthManager::from_config(config, launcher)?;
    let machine = manager.flow(server)?;

    // Bound before the browser opens so a fast redirect is not lost.
    let listener = match LoopbackListener::bind(&redirect_uri).await {
        Ok(listener) => Some(listener),
        Err(e) => {
            tracing::warn!("callback listener unavailable: {e:#}");
            None
        }
    };

    let mut state = manager.connect(server).await?;
    if state.step == FlowStep::RedirectToAuthorize {
        match listener {
            Some(listener) => {
                println!("Waiting for the authorization callback on {redirect_uri} ...");
                state = match listener.wait_for_callback(redirect_timeout).await? {
                    Some(callback) => {
                        let accepted = machine.deliver_callback(callback).await?;
                        if accepted.step == FlowStep::Error {
                            accepted
                        } else {
                            machine.run_until_parked().await?
                        }
                    }
                    None => machine.proceed().await?,
                };
            }
            None => {
                println!(
                    "Finish in the browser, then run `authflow callback '<redirected url>'`."
                );
            }
        }
    }

    super::print_outcome(&state);
    if trace {
        super::print_exchanges(&state, true);
    }
    Ok(())
}
