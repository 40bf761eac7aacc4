//! Per-server flow coordinator
//!
//! [`AuthManager`] holds one [`FlowMachine`] per configured server, created
//! on first use. A server whose flow parked in an earlier process is
//! resumed from the credential store when its machine is created, so a
//! callback can be delivered by a different process than the one that
//! opened the browser.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use authflow::auth::manager::AuthManager;
//! use authflow::auth::redirect::SystemBrowser;
//! use authflow::config::Config;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::from_file("config/authflow.yaml")?;
//! let manager = AuthManager::from_config(config, Arc::new(SystemBrowser))?;
//! let token = manager.access_token("notion").await?;
//! println!("{}", token.len());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::auth::callback::CallbackParams;
use crate::auth::redirect::BrowserLauncher;
use crate::auth::registration::ClientRegistration;
use crate::auth::token::TokenSet;
use crate::config::{Config, ServerConfig};
use crate::error::{AuthflowError, Result};
use crate::flow::machine::{FlowMachine, ResetScope};
use crate::flow::marker::PendingFlowMarker;
use crate::flow::state::{FlowState, FlowStep};
use crate::store::{self, load_json, CredentialKind, CredentialStore};
use crate::transport::http::ReqwestTransport;
use crate::transport::HttpTransport;

/// What the credential store holds for one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    /// Server identifier.
    pub server_id: String,
    /// Stored tokens.
    #[serde(skip)]
    pub tokens: Option<TokenSet>,
    /// Stored dynamic registration.
    #[serde(skip)]
    pub registration: Option<ClientRegistration>,
    /// Outstanding redirect.
    pub pending: Option<PendingFlowMarker>,
}

/// Coordinates the flows of all configured servers.
pub struct AuthManager {
    config: Config,
    transport: Arc<dyn HttpTransport>,
    store: Arc<dyn CredentialStore>,
    launcher: Arc<dyn BrowserLauncher>,
    flows: Mutex<HashMap<String, Arc<FlowMachine>>>,
}

impl AuthManager {
    /// A manager over explicit collaborators.
    pub fn new(
        config: Config,
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn CredentialStore>,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Self {
        Self {
            config,
            transport,
            store,
            launcher,
            flows: Mutex::new(HashMap::new()),
        }
    }

    /// A manager using `reqwest` and the configured credential store.
    ///
    /// # Errors
    ///
    /// Returns an error when the HTTP client or the store cannot be built.
    pub fn from_config(config: Config, launcher: Arc<dyn BrowserLauncher>) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(
            config.http.timeout(),
            &config.http.user_agent,
        )?);
        let store = store::from_config(&config.store)?;
        Ok(Self::new(config, transport, store, launcher))
    }

    /// The loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The credential store shared by all flows.
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Configured servers.
    pub fn servers(&self) -> &[ServerConfig] {
        &self.config.servers
    }

    /// The flow for `server_id`, created (and resumed from the store) on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::ServerNotFound`] for unknown servers.
    pub fn flow(&self, server_id: &str) -> Result<Arc<FlowMachine>> {
        let server = self.config.server(server_id)?;
        let mut flows = self
            .flows
            .lock()
            .map_err(|_| AuthflowError::InvalidOperation("flow registry lock poisoned".to_string()))?;
        if let Some(machine) = flows.get(server_id) {
            return Ok(Arc::clone(machine));
        }

        let machine = Arc::new(FlowMachine::for_server(
            &self.config,
            server,
            Arc::clone(&self.transport),
            Arc::clone(&self.store),
            Arc::clone(&self.launcher),
        )?);
        match machine.resume() {
            Ok(Some(state)) => {
                tracing::debug!(server_id, step = %state.step, "flow restored from store");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(server_id, "could not resume pending flow: {e:#}");
            }
        }
        flows.insert(server_id.to_string(), Arc::clone(&machine));
        Ok(machine)
    }

    /// Runs the flow until it parks at the redirect, is authorized, or
    /// fails.
    ///
    /// # Errors
    ///
    /// Propagates unknown-server and credential-store errors.
    pub async fn connect(&self, server_id: &str) -> Result<Arc<FlowState>> {
        let machine = self.flow(server_id)?;
        tracing::info!(server_id, "starting authorization");
        machine.run_until_parked().await
    }

    /// Delivers a redirect callback to the flow it belongs to and finishes
    /// the exchange.
    ///
    /// The flow is found by the callback's `state`. A callback whose state
    /// matches nothing goes to the single pending flow, if there is exactly
    /// one, where it is rejected as a state mismatch.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::Callback`] when no flow is pending or the
    /// target is ambiguous.
    pub async fn route_callback(&self, callback: CallbackParams) -> Result<Arc<FlowState>> {
        let mut pending = Vec::new();
        for server in &self.config.servers {
            let machine = self.flow(&server.id)?;
            let snapshot = machine.snapshot();
            if snapshot.is_parked() {
                pending.push((machine, snapshot));
            }
        }

        let matched = pending.iter().position(|(_, snapshot)| {
            let expected = snapshot.pending_pkce.as_ref().map(|p| p.state.as_str());
            expected.is_some() && expected == callback.state.as_deref()
        });
        let target = match (matched, pending.len()) {
            (Some(idx), _) => Arc::clone(&pending[idx].0),
            (None, 1) => Arc::clone(&pending[0].0),
            (None, 0) => {
                return Err(AuthflowError::Callback(
                    "no authorization is pending; run connect first".to_string(),
                )
                .into())
            }
            (None, n) => {
                return Err(AuthflowError::Callback(format!(
                    "callback state matches none of the {n} pending flows"
                ))
                .into())
            }
        };

        let accepted = target.deliver_callback(callback).await?;
        if accepted.step == FlowStep::Error {
            return Ok(accepted);
        }
        target.run_until_parked().await
    }

    /// A usable access token for `server_id`.
    ///
    /// Returns the stored token while it is valid. An expired token with a
    /// refresh token is refreshed, running discovery first when this
    /// process has not done it yet.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::InvalidOperation`] when no token can be
    /// produced without user interaction.
    pub async fn access_token(&self, server_id: &str) -> Result<String> {
        let machine = self.flow(server_id)?;
        let snapshot = machine.snapshot();
        if let Some(tokens) = snapshot.token_set.as_ref().filter(|t| !t.is_expired()) {
            return Ok(tokens.access_token.clone());
        }

        let stored: Option<TokenSet> =
            load_json(self.store.as_ref(), server_id, CredentialKind::Tokens)?;
        let Some(stored) = stored else {
            return Err(not_authorized(server_id));
        };
        if !stored.is_expired() {
            return Ok(stored.access_token);
        }
        if !stored.can_refresh() {
            return Err(not_authorized(server_id));
        }

        tracing::info!(server_id, "stored token expired; refreshing");
        if snapshot.step == FlowStep::Idle {
            let ready = machine
                .drive_until(|s| s.step == FlowStep::RegisterClient)
                .await?;
            if ready.step != FlowStep::RegisterClient {
                return Err(refresh_failed(server_id, &ready));
            }
        }
        let refreshed = machine.refresh().await?;
        match refreshed.token_set.as_ref() {
            Some(tokens) if refreshed.step == FlowStep::Authorized => {
                Ok(tokens.access_token.clone())
            }
            _ => Err(refresh_failed(server_id, &refreshed)),
        }
    }

    /// Stored credentials for `server_id`.
    ///
    /// # Errors
    ///
    /// Propagates unknown-server and credential-store errors.
    pub fn status(&self, server_id: &str) -> Result<ServerStatus> {
        self.config.server(server_id)?;
        let store = self.store.as_ref();
        Ok(ServerStatus {
            server_id: server_id.to_string(),
            tokens: load_json(store, server_id, CredentialKind::Tokens)?,
            registration: load_json(store, server_id, CredentialKind::ClientRegistration)?,
            pending: load_json(store, server_id, CredentialKind::PendingFlowMarker)?,
        })
    }

    /// Resets the flow and clears the scope's stored credentials.
    ///
    /// # Errors
    ///
    /// Propagates unknown-server and credential-store errors.
    pub fn reset(&self, server_id: &str, scope: ResetScope) -> Result<Arc<FlowState>> {
        self.flow(server_id)?.reset(scope)
    }

    /// Discards the tokens after the resource server rejected them, so the
    /// next [`connect`](Self::connect) authorizes from scratch.
    ///
    /// # Errors
    ///
    /// Propagates unknown-server and credential-store errors.
    pub fn handle_unauthorized(&self, server_id: &str) -> Result<Arc<FlowState>> {
        tracing::warn!(server_id, "token rejected by the resource server");
        self.reset(server_id, ResetScope::Tokens)
    }
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthManager")
            .field("servers", &self.config.servers.len())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

fn not_authorized(server_id: &str) -> anyhow::Error {
    AuthflowError::InvalidOperation(format!(
        "'{server_id}' is not authorized; run `authflow connect {server_id}`"
    ))
    .into()
}

fn refresh_failed(server_id: &str, state: &FlowState) -> anyhow::Error {
    let reason = state
        .last_error
        .as_ref()
        .map(|f| f.error.to_string())
        .unwrap_or_else(|| format!("flow stopped at {}", state.step));
    AuthflowError::InvalidOperation(format!("could not refresh '{server_id}': {reason}")).into()
}
