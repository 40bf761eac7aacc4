//! The flow orchestrator
//!
//! [`FlowMachine`] owns one server's current [`FlowState`] snapshot and
//! advances it one step per [`FlowMachine::proceed`] call. It is the only
//! component that talks to the credential store: it persists the client
//! registration, the PKCE verifier and pending-flow marker before parking,
//! and the issued tokens.
//!
//! Step failures are not `Err`s. They move the snapshot to
//! [`FlowStep::Error`] with a [`StepFailure`]; calling `proceed()` again
//! retries the failed work when the error is retryable. `Err` is reserved
//! for credential-store failures and misuse, and leaves the snapshot as it
//! was.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use authflow::auth::redirect::PrintOnlyLauncher;
//! use authflow::flow::machine::{FlowMachine, FlowSettings};
//! use authflow::flow::state::FlowState;
//! use authflow::flow::version::ProtocolVersion;
//! use authflow::store::memory::MemoryStore;
//! use authflow::transport::http::ReqwestTransport;
//! use url::Url;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let state = FlowState::new(
//!     "notion",
//!     Url::parse("https://mcp.notion.com/mcp")?,
//!     ProtocolVersion::V2025_11_25,
//!     Default::default(),
//! );
//! let machine = FlowMachine::new(
//!     state,
//!     FlowSettings::new(Url::parse("http://127.0.0.1:8765/callback")?),
//!     Arc::new(ReqwestTransport::new(std::time::Duration::from_secs(10), "authflow")?),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(PrintOnlyLauncher),
//! );
//! let parked = machine.run_until_parked().await?;
//! println!("open {}", parked.authorization_url.as_ref().unwrap());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use uuid::Uuid;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::callback::CallbackParams;
use crate::auth::discovery::{self, endpoint_url, DiscoveryFallback};
use crate::auth::pkce::PendingPkce;
use crate::auth::redirect::{build_authorize_url, AuthorizeParams, BrowserLauncher};
use crate::auth::registration::{
    register_dynamic, reusable_registration, static_registration, ClientMetadata,
    ClientRegistration,
};
use crate::auth::token::{self, carry_refresh_token, TokenRequest, TokenSet};
use crate::config::{Config, ServerConfig};
use crate::error::{AuthflowError, FlowError, FlowResult, Result, TokenErrorCode};
use crate::flow::capture::{HttpExchange, Recorder};
use crate::flow::marker::{PendingFlowMarker, StoredVerifier};
use crate::flow::state::{FlowState, FlowStep, StepFailure, Transition};
use crate::store::{load_json, save_json, CredentialKind, CredentialStore};
use crate::transport::HttpTransport;

/// Upper bound on `proceed()` calls made by the drive helpers.
const MAX_DRIVE_STEPS: usize = 16;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Caller-supplied knobs for one flow.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    /// Redirect URI presented to the authorization server.
    pub redirect_uri: Url,
    /// `client_name` for dynamic registration.
    pub client_name: String,
    /// `client_uri` for dynamic registration.
    pub client_uri: Option<String>,
    /// Scope override; takes precedence over advertised scopes.
    pub scope: Option<String>,
    /// Authorization server override; replaces the first advertised one.
    pub authorization_server: Option<Url>,
    /// How long a parked flow waits for its callback.
    pub redirect_timeout: Duration,
    /// Policy when no authorization server metadata is found.
    pub discovery_fallback: DiscoveryFallback,
}

impl FlowSettings {
    /// Defaults for everything except the redirect URI.
    pub fn new(redirect_uri: Url) -> Self {
        Self {
            redirect_uri,
            client_name: "authflow".to_string(),
            client_uri: None,
            scope: None,
            authorization_server: None,
            redirect_timeout: Duration::from_secs(300),
            discovery_fallback: DiscoveryFallback::default(),
        }
    }

    /// Settings for a configured server.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::Config`] for unparseable URLs.
    pub fn from_config(config: &Config, server: &ServerConfig) -> Result<Self> {
        Ok(Self {
            redirect_uri: config.redirect_uri()?,
            client_name: config.client.name.clone(),
            client_uri: config.client.client_uri.clone(),
            scope: server.scope.clone(),
            authorization_server: server.authorization_server_url()?,
            redirect_timeout: config.flow.redirect_timeout(),
            discovery_fallback: config.flow.discovery_fallback,
        })
    }
}

// ---------------------------------------------------------------------------
// ResetScope
// ---------------------------------------------------------------------------

/// What [`FlowMachine::reset`] removes from the credential store besides the
/// pending verifier and marker, which are always removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ResetScope {
    /// Tokens and client registration too.
    #[default]
    All,
    /// The client registration too.
    Client,
    /// The tokens too.
    Tokens,
    /// Nothing more.
    Verifier,
}

impl ResetScope {
    /// Store entries removed for this scope.
    pub fn credential_kinds(self) -> &'static [CredentialKind] {
        match self {
            Self::All => &CredentialKind::ALL,
            Self::Client => &[
                CredentialKind::PkceVerifier,
                CredentialKind::PendingFlowMarker,
                CredentialKind::ClientRegistration,
            ],
            Self::Tokens => &[
                CredentialKind::PkceVerifier,
                CredentialKind::PendingFlowMarker,
                CredentialKind::Tokens,
            ],
            Self::Verifier => &[CredentialKind::PkceVerifier, CredentialKind::PendingFlowMarker],
        }
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Client => "client",
            Self::Tokens => "tokens",
            Self::Verifier => "verifier",
        }
    }
}

impl fmt::Display for ResetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResetScope {
    type Err = AuthflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "client" => Ok(Self::Client),
            "tokens" => Ok(Self::Tokens),
            "verifier" => Ok(Self::Verifier),
            other => Err(AuthflowError::InvalidOperation(format!(
                "unknown reset scope '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// FlowMachine
// ---------------------------------------------------------------------------

/// Drives one server's authorization flow.
pub struct FlowMachine {
    transport: Arc<dyn HttpTransport>,
    store: Arc<dyn CredentialStore>,
    launcher: Arc<dyn BrowserLauncher>,
    settings: FlowSettings,
    current: RwLock<Arc<FlowState>>,
    in_flight: AtomicBool,
    /// Held while store entries are written for a step or removed by a
    /// reset.
    persist: Mutex<()>,
}

/// Clears the re-entry flag when the running call ends, including when its
/// future is dropped mid-step.
struct InFlight<'a> {
    machine: &'a FlowMachine,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let snapshot = self.machine.snapshot();
        if snapshot.in_flight {
            self.machine
                .replace(Arc::new(snapshot.with_in_flight(false)));
        }
        self.machine.in_flight.store(false, Ordering::Release);
    }
}

impl FlowMachine {
    /// A machine starting from `state`.
    pub fn new(
        state: FlowState,
        settings: FlowSettings,
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn CredentialStore>,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Self {
        Self {
            transport,
            store,
            launcher,
            settings,
            current: RwLock::new(Arc::new(state.with_in_flight(false))),
            in_flight: AtomicBool::new(false),
            persist: Mutex::new(()),
        }
    }

    /// An `idle` machine for a configured server.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::Config`] for unparseable URLs.
    pub fn for_server(
        config: &Config,
        server: &ServerConfig,
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn CredentialStore>,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Result<Self> {
        let state = FlowState::new(
            server.id.clone(),
            server.resource_url()?,
            server.protocol_version,
            server.registration.clone(),
        );
        Ok(Self::new(
            state,
            FlowSettings::from_config(config, server)?,
            transport,
            store,
            launcher,
        ))
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<FlowState> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// The flow's settings.
    pub fn settings(&self) -> &FlowSettings {
        &self.settings
    }

    /// The server this machine authorizes against.
    pub fn server_id(&self) -> String {
        self.snapshot().server_id.clone()
    }

    /// The persisted pending-flow marker, if a redirect is outstanding.
    ///
    /// # Errors
    ///
    /// Propagates credential-store failures.
    pub fn pending_marker(&self) -> Result<Option<PendingFlowMarker>> {
        load_json(
            self.store.as_ref(),
            &self.server_id(),
            CredentialKind::PendingFlowMarker,
        )
    }

    /// Runs the current step's work and returns the next snapshot.
    ///
    /// While another call is in flight this is a no-op returning the
    /// current snapshot. At `redirect_to_authorize` without a delivered
    /// callback it is a no-op until the redirect timeout expires. At
    /// `authorized` it refreshes an expired token that has a refresh token.
    /// At a retryable `error` it re-runs the failed work.
    ///
    /// # Errors
    ///
    /// Returns credential-store failures; the snapshot is then unchanged.
    pub async fn proceed(&self) -> Result<Arc<FlowState>> {
        let Some((_guard, base)) = self.begin() else {
            tracing::debug!("proceed ignored: a step is already in flight");
            return Ok(self.snapshot());
        };
        match self.advance(&base).await? {
            Some(next) => Ok(self.commit(&base, next)),
            None => Ok(self.commit(&base, (*base).clone())),
        }
    }

    /// Records the redirect callback on the parked flow and runs the
    /// callback check.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::InvalidOperation`] when no redirect is
    /// outstanding or another call is in flight, and propagates
    /// credential-store failures.
    pub async fn deliver_callback(&self, callback: CallbackParams) -> Result<Arc<FlowState>> {
        let Some((_guard, base)) = self.begin() else {
            return Err(in_flight_error());
        };
        if !base.is_parked() {
            return Err(AuthflowError::InvalidOperation(format!(
                "no authorization redirect is outstanding for '{}' (step {})",
                base.server_id, base.step
            ))
            .into());
        }
        tracing::info!(server_id = %base.server_id, "callback delivered");
        let delivered = base.apply(Transition::CallbackDelivered { callback }, Vec::new());
        let next = self
            .run_step(&delivered, FlowStep::RedirectToAuthorize)
            .await?;
        Ok(self.commit(&base, next))
    }

    /// Refreshes the tokens now.
    ///
    /// Valid at `authorized`, after a retryable refresh failure, and at
    /// `register_client`, where the refresh token comes from the store.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::InvalidOperation`] at other steps and
    /// propagates credential-store failures.
    pub async fn refresh(&self) -> Result<Arc<FlowState>> {
        let Some((_guard, base)) = self.begin() else {
            return Err(in_flight_error());
        };
        let refreshable = match base.step {
            FlowStep::Authorized | FlowStep::RegisterClient => true,
            FlowStep::Error => base
                .last_error
                .as_ref()
                .is_some_and(|f| f.failed_at == FlowStep::Authorized && f.is_retryable()),
            _ => false,
        };
        if !refreshable {
            return Err(AuthflowError::InvalidOperation(format!(
                "cannot refresh at step {}",
                base.step
            ))
            .into());
        }
        let next = self.refresh_step(&base).await?;
        Ok(self.commit(&base, next))
    }

    /// Replaces the authorization server chosen from the resource metadata.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::InvalidOperation`] unless the flow is at
    /// `received_resource_metadata`.
    pub fn override_authorization_server(&self, issuer: Url) -> Result<Arc<FlowState>> {
        let Some((_guard, base)) = self.begin() else {
            return Err(in_flight_error());
        };
        if base.step != FlowStep::ReceivedResourceMetadata {
            return Err(AuthflowError::InvalidOperation(format!(
                "the authorization server can only be overridden at {}, flow is at {}",
                FlowStep::ReceivedResourceMetadata,
                base.step
            ))
            .into());
        }
        tracing::info!(server_id = %base.server_id, issuer = %issuer, "authorization server overridden");
        let next = base.apply(
            Transition::AuthorizationServerOverridden {
                authorization_server: issuer,
            },
            Vec::new(),
        );
        Ok(self.commit(&base, next))
    }

    /// Returns the flow to `idle` and removes the scope's store entries.
    ///
    /// A step still in flight keeps running, but it writes nothing to the
    /// store once the reset has happened and its result is discarded.
    ///
    /// # Errors
    ///
    /// Propagates credential-store failures; the snapshot is then unchanged.
    pub fn reset(&self, scope: ResetScope) -> Result<Arc<FlowState>> {
        let _persist = self.lock_persist();
        let current = self.snapshot();
        for kind in scope.credential_kinds() {
            self.store.remove(&current.server_id, *kind)?;
        }
        let fresh = Arc::new(current.reset());
        self.replace(Arc::clone(&fresh));
        tracing::info!(server_id = %current.server_id, scope = %scope, "flow reset");
        Ok(fresh)
    }

    /// Rebuilds a parked flow from the persisted marker and verifier.
    ///
    /// Returns `Ok(None)` when nothing is pending. A marker without its
    /// verifier, or one recorded for a different resource or redirect URI,
    /// is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::InvalidOperation`] unless the flow is
    /// `idle`, or when the stored entries disagree with each other or with
    /// the configured strategy.
    pub fn resume(&self) -> Result<Option<Arc<FlowState>>> {
        let Some((_guard, base)) = self.begin() else {
            return Err(in_flight_error());
        };
        if base.step != FlowStep::Idle {
            return Err(AuthflowError::InvalidOperation(format!(
                "resume requires an idle flow, '{}' is at {}",
                base.server_id, base.step
            ))
            .into());
        }
        let server_id = base.server_id.as_str();
        let Some(marker) =
            load_json::<PendingFlowMarker>(self.store.as_ref(), server_id, CredentialKind::PendingFlowMarker)?
        else {
            return Ok(None);
        };
        let verifier: Option<StoredVerifier> =
            load_json(self.store.as_ref(), server_id, CredentialKind::PkceVerifier)?;
        let Some(verifier) = verifier else {
            tracing::warn!(server_id, "pending flow marker without a verifier; discarding");
            self.clear_pending_entries(server_id)?;
            return Ok(None);
        };
        if marker.server_id != base.server_id || marker.resource_url != base.resource_url {
            tracing::warn!(server_id, "pending flow was recorded for another resource; discarding");
            self.clear_pending_entries(server_id)?;
            return Ok(None);
        }
        if marker.redirect_uri != self.settings.redirect_uri.as_str() {
            tracing::warn!(
                server_id,
                recorded = %marker.redirect_uri,
                "pending flow used another redirect URI; discarding"
            );
            self.clear_pending_entries(server_id)?;
            return Ok(None);
        }

        let resumed = marker.into_state(verifier, base.registration_strategy.clone())?;
        tracing::info!(server_id, flow_id = %resumed.flow_id, "resumed parked flow");
        Ok(Some(self.commit(&base, resumed)))
    }

    /// Calls `proceed()` until the flow parks, is authorized, fails, or
    /// `stop` returns `true`.
    ///
    /// # Errors
    ///
    /// Propagates `proceed()` errors.
    pub async fn drive_until<F>(&self, stop: F) -> Result<Arc<FlowState>>
    where
        F: Fn(&FlowState) -> bool,
    {
        let mut state = self.snapshot();
        for _ in 0..MAX_DRIVE_STEPS {
            if stop(state.as_ref())
                || matches!(
                    state.step,
                    FlowStep::RedirectToAuthorize | FlowStep::Authorized | FlowStep::Error
                )
            {
                break;
            }
            state = self.proceed().await?;
        }
        Ok(state)
    }

    /// Calls `proceed()` until the flow parks at the redirect, is
    /// authorized, or fails.
    ///
    /// # Errors
    ///
    /// Propagates `proceed()` errors.
    pub async fn run_until_parked(&self) -> Result<Arc<FlowState>> {
        self.drive_until(|_| false).await
    }

    // -----------------------------------------------------------------------
    // Snapshot bookkeeping
    // -----------------------------------------------------------------------

    fn replace(&self, next: Arc<FlowState>) {
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    fn begin(&self) -> Option<(InFlight<'_>, Arc<FlowState>)> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let guard = InFlight { machine: self };
        let base = self.snapshot();
        self.replace(Arc::new(base.with_in_flight(true)));
        Some((guard, base))
    }

    /// Publishes `next` unless a reset started a new attempt meanwhile.
    fn commit(&self, base: &FlowState, next: FlowState) -> Arc<FlowState> {
        let current = self.snapshot();
        if current.flow_id != base.flow_id {
            tracing::debug!(
                server_id = %base.server_id,
                "flow was reset during the step; discarding its result"
            );
            return current;
        }
        let next = Arc::new(next.with_in_flight(false));
        self.replace(Arc::clone(&next));
        next
    }

    fn lock_persist(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.persist.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Runs `write` unless the attempt `flow_id` was reset meanwhile.
    /// Returns `None` when the write was skipped.
    fn persist_for<T>(&self, flow_id: Uuid, write: impl FnOnce() -> Result<T>) -> Result<Option<T>> {
        let _persist = self.lock_persist();
        if self.snapshot().flow_id != flow_id {
            tracing::debug!(flow_id = %flow_id, "flow was reset; skipping store write");
            return Ok(None);
        }
        write().map(Some)
    }

    fn clear_pending_entries(&self, server_id: &str) -> Result<()> {
        self.store.remove(server_id, CredentialKind::PkceVerifier)?;
        self.store.remove(server_id, CredentialKind::PendingFlowMarker)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    async fn advance(&self, state: &FlowState) -> Result<Option<FlowState>> {
        match state.step {
            FlowStep::Error => match &state.last_error {
                Some(failure) if failure.is_retryable() => {
                    tracing::info!(
                        server_id = %state.server_id,
                        step = %failure.resume_from,
                        "retrying after {}",
                        failure.error
                    );
                    self.run_step(state, failure.resume_from).await.map(Some)
                }
                _ => {
                    tracing::debug!(server_id = %state.server_id, "flow failed fatally; reset required");
                    Ok(None)
                }
            },
            FlowStep::RedirectToAuthorize if state.callback.is_none() => {
                self.check_redirect_timeout(state)
            }
            FlowStep::Authorized => match &state.token_set {
                Some(tokens) if tokens.is_expired() && tokens.can_refresh() => {
                    self.refresh_step(state).await.map(Some)
                }
                _ => Ok(None),
            },
            current => self.run_step(state, current).await.map(Some),
        }
    }

    /// Runs the work leading from `from` to the next step of the plan.
    async fn run_step(&self, state: &FlowState, from: FlowStep) -> Result<FlowState> {
        if from == FlowStep::Authorized {
            return self.refresh_step(state).await;
        }
        let target = state.plan().next(from).ok_or_else(|| {
            AuthflowError::InvalidOperation(format!("no step follows {from}"))
        })?;

        let mut recorder = Recorder::new(self.transport.as_ref(), target);
        let outcome = match target {
            FlowStep::SentUnauthenticatedRequest => self.send_probe(state, &mut recorder).await,
            FlowStep::ReceivedUnauthorized => read_challenge(state),
            FlowStep::RequestResourceMetadata => plan_resource_metadata(state),
            FlowStep::ReceivedResourceMetadata => {
                self.fetch_resource_metadata(state, &mut recorder).await
            }
            FlowStep::RequestAuthorizationServerMetadata => self.plan_auth_server_metadata(state),
            FlowStep::ReceivedAuthorizationServerMetadata => {
                self.fetch_auth_server_metadata(state, &mut recorder).await
            }
            FlowStep::RegisterClient => self.register_client(state, &mut recorder).await?,
            FlowStep::RedirectToAuthorize => self.issue_redirect(state)?,
            FlowStep::ReceivedCallback => accept_callback(state),
            FlowStep::ExchangeToken => self.plan_token_request(state),
            FlowStep::Authorized => self.exchange_code(state, &mut recorder).await?,
            FlowStep::Idle | FlowStep::Error => {
                return Err(AuthflowError::InvalidOperation(format!(
                    "{target} is not a step with work"
                ))
                .into())
            }
        };
        self.settle(state, from, target, outcome, recorder.into_exchanges())
    }

    /// Turns a step outcome into the next snapshot. Pending artifacts
    /// dropped from the snapshot are dropped from the store too.
    fn settle(
        &self,
        state: &FlowState,
        from: FlowStep,
        target: FlowStep,
        outcome: FlowResult<Transition>,
        exchanges: Vec<HttpExchange>,
    ) -> Result<FlowState> {
        match outcome {
            Ok(transition) => {
                let next = state.apply(transition, exchanges);
                tracing::info!(server_id = %next.server_id, step = %next.step, "step complete");
                Ok(next)
            }
            Err(error) => {
                let (resume_from, clear_pending) = match error {
                    FlowError::RedirectTimeout { .. } | FlowError::AuthorizationDenied { .. } => {
                        (FlowStep::RegisterClient, true)
                    }
                    // A retry re-sends the unauthenticated request.
                    _ if target == FlowStep::ReceivedUnauthorized => (FlowStep::Idle, false),
                    _ => (from, false),
                };
                tracing::warn!(
                    server_id = %state.server_id,
                    step = %target,
                    retryable = error.is_retryable(),
                    "step failed: {error}"
                );
                let next = state.apply(
                    Transition::Failed {
                        failure: StepFailure::new(target, resume_from, error),
                        clear_pending,
                    },
                    exchanges,
                );
                if state.pending_pkce.is_some() && next.pending_pkce.is_none() {
                    self.persist_for(state.flow_id, || {
                        self.clear_pending_entries(&state.server_id)
                    })?;
                }
                Ok(next)
            }
        }
    }

    fn check_redirect_timeout(&self, state: &FlowState) -> Result<Option<FlowState>> {
        let Some(parked_at) = state.parked_at else {
            return Ok(None);
        };
        let waited = (Utc::now() - parked_at).to_std().unwrap_or_default();
        if waited < self.settings.redirect_timeout {
            return Ok(None);
        }
        let failed = self.settle(
            state,
            FlowStep::RedirectToAuthorize,
            FlowStep::ReceivedCallback,
            Err(FlowError::RedirectTimeout {
                timeout_secs: self.settings.redirect_timeout.as_secs(),
            }),
            Vec::new(),
        )?;
        Ok(Some(failed))
    }

    // -----------------------------------------------------------------------
    // Step work
    // -----------------------------------------------------------------------

    async fn send_probe(
        &self,
        state: &FlowState,
        recorder: &mut Recorder<'_>,
    ) -> FlowResult<Transition> {
        let probe = discovery::probe_resource(recorder, &state.resource_url).await?;
        Ok(Transition::Probed { probe })
    }

    async fn fetch_resource_metadata(
        &self,
        state: &FlowState,
        recorder: &mut Recorder<'_>,
    ) -> FlowResult<Transition> {
        let (metadata, served_by) =
            discovery::fetch_resource_metadata(recorder, &state.discovery_candidates).await?;
        if metadata.resource.trim_end_matches('/') != state.resource_url.as_str().trim_end_matches('/')
        {
            tracing::debug!(
                server_id = %state.server_id,
                advertised = %metadata.resource,
                "resource metadata names a different resource identifier"
            );
        }
        let authorization_server = discovery::select_authorization_server(
            &metadata,
            self.settings.authorization_server.as_ref(),
        )?;
        Ok(Transition::ResourceMetadataDiscovered {
            metadata,
            served_by,
            authorization_server,
        })
    }

    fn plan_auth_server_metadata(&self, state: &FlowState) -> FlowResult<Transition> {
        let plan = state.plan();
        let issuer = if plan.uses_resource_metadata() {
            state.authorization_server.clone().ok_or_else(|| {
                FlowError::discovery("no authorization server was selected")
            })?
        } else {
            self.settings
                .authorization_server
                .clone()
                .unwrap_or_else(|| plan.legacy_issuer(&state.resource_url, state.challenge.as_ref()))
        };
        let candidates = plan.auth_server_candidates(&issuer);
        Ok(Transition::AuthServerMetadataPlanned { issuer, candidates })
    }

    async fn fetch_auth_server_metadata(
        &self,
        state: &FlowState,
        recorder: &mut Recorder<'_>,
    ) -> FlowResult<Transition> {
        let issuer = state
            .authorization_server
            .as_ref()
            .ok_or_else(|| FlowError::discovery("no authorization server was selected"))?;
        let (metadata, source) = discovery::fetch_auth_server_metadata(
            recorder,
            issuer,
            &state.discovery_candidates,
            self.settings.discovery_fallback,
        )
        .await?;
        discovery::check_pkce_support(&metadata)?;
        tracing::debug!(server_id = %state.server_id, source = %source, "authorization server metadata");
        Ok(Transition::AuthServerMetadataDiscovered { metadata, source })
    }

    async fn register_client(
        &self,
        state: &FlowState,
        recorder: &mut Recorder<'_>,
    ) -> Result<FlowResult<Transition>> {
        let Some(server) = state.auth_server_metadata.as_ref() else {
            return Ok(Err(FlowError::registration(
                "authorization server metadata is missing",
            )));
        };
        let redirect_uri = self.settings.redirect_uri.as_str();
        let scope = self.resolve_scope(state);

        if let Some(registration) =
            static_registration(&state.registration_strategy, server, redirect_uri)
        {
            return Ok(Ok(Transition::ClientRegistered {
                registration,
                scope,
            }));
        }

        let stored: Option<ClientRegistration> = load_json(
            self.store.as_ref(),
            &state.server_id,
            CredentialKind::ClientRegistration,
        )?;
        if let Some(registration) = reusable_registration(stored, redirect_uri) {
            tracing::info!(
                server_id = %state.server_id,
                client_id = %registration.client_id,
                "reusing stored client registration"
            );
            return Ok(Ok(Transition::ClientRegistered {
                registration,
                scope,
            }));
        }

        let metadata = ClientMetadata::public_client(
            &self.settings.client_name,
            redirect_uri,
            scope.as_deref(),
            self.settings.client_uri.as_deref(),
        );
        match register_dynamic(recorder, server, &metadata).await {
            Ok(registration) => {
                self.persist_for(state.flow_id, || {
                    save_json(
                        self.store.as_ref(),
                        &state.server_id,
                        CredentialKind::ClientRegistration,
                        &registration,
                    )
                })?;
                Ok(Ok(Transition::ClientRegistered {
                    registration,
                    scope,
                }))
            }
            Err(e) => Ok(Err(e)),
        }
    }

    fn issue_redirect(&self, state: &FlowState) -> Result<FlowResult<Transition>> {
        let (Some(server), Some(client)) = (
            state.auth_server_metadata.as_ref(),
            state.client_registration.as_ref(),
        ) else {
            return Ok(Err(FlowError::registration("client identity is missing")));
        };
        let redirect_uri = self.settings.redirect_uri.as_str();
        let pkce = PendingPkce::generate(state.flow_id);
        let resource = self.resource_indicator(state);
        let authorization_url = match build_authorize_url(&AuthorizeParams {
            authorization_endpoint: &server.authorization_endpoint,
            client,
            redirect_uri,
            scope: state.scope.as_deref(),
            pkce: &pkce,
            resource: resource.as_ref(),
        }) {
            Ok(url) => url,
            Err(e) => {
                return Ok(Err(FlowError::discovery(format!(
                    "invalid authorization_endpoint {}: {e}",
                    server.authorization_endpoint
                ))))
            }
        };
        let parked_at = Utc::now();
        let transition = Transition::RedirectIssued {
            pkce: pkce.clone(),
            authorization_url: authorization_url.clone(),
            parked_at,
        };

        // Both entries must be durable before the browser sees the URL.
        let parked = state.apply(transition.clone(), Vec::new());
        let marker = PendingFlowMarker::from_state(&parked, redirect_uri).ok_or_else(|| {
            AuthflowError::InvalidOperation("parked flow is missing discovery artifacts".to_string())
        })?;
        let saved = self.persist_for(state.flow_id, || {
            save_json(
                self.store.as_ref(),
                &state.server_id,
                CredentialKind::PkceVerifier,
                &PendingFlowMarker::verifier_for(&pkce),
            )?;
            save_json(
                self.store.as_ref(),
                &state.server_id,
                CredentialKind::PendingFlowMarker,
                &marker,
            )
        })?;
        if saved.is_none() {
            return Ok(Ok(transition));
        }

        if let Err(e) = self.launcher.open(&authorization_url) {
            tracing::warn!(server_id = %state.server_id, "browser launch failed: {e}");
        }
        Ok(Ok(transition))
    }

    fn plan_token_request(&self, state: &FlowState) -> FlowResult<Transition> {
        let server = state
            .auth_server_metadata
            .as_ref()
            .ok_or_else(|| FlowError::discovery("authorization server metadata is missing"))?;
        let client = state
            .client_registration
            .as_ref()
            .ok_or_else(|| FlowError::registration("client identity is missing"))?;
        let pkce = state
            .pending_pkce
            .as_ref()
            .ok_or_else(|| FlowError::state_mismatch("no PKCE verifier for this flow"))?;
        let code = state
            .callback
            .as_ref()
            .and_then(|c| c.code.as_deref())
            .ok_or_else(|| FlowError::state_mismatch("no authorization code was received"))?;
        let endpoint = endpoint_url("token_endpoint", &server.token_endpoint)?;
        let resource = self.resource_indicator(state);
        Ok(Transition::TokenRequestPlanned {
            request: TokenRequest::authorization_code(
                endpoint,
                code,
                self.settings.redirect_uri.as_str(),
                client,
                &pkce.code_verifier,
                resource.as_ref(),
            ),
        })
    }

    async fn exchange_code(
        &self,
        state: &FlowState,
        recorder: &mut Recorder<'_>,
    ) -> Result<FlowResult<Transition>> {
        let Some(request) = state.token_request.as_ref() else {
            return Ok(Err(FlowError::TokenExchange {
                code: TokenErrorCode::Other("no_token_request".to_string()),
                message: "no token request was planned".to_string(),
                transient: false,
            }));
        };
        match token::execute(recorder, request).await {
            Ok(token_set) => {
                self.persist_for(state.flow_id, || {
                    save_json(
                        self.store.as_ref(),
                        &state.server_id,
                        CredentialKind::Tokens,
                        &token_set,
                    )?;
                    self.clear_pending_entries(&state.server_id)
                })?;
                tracing::info!(server_id = %state.server_id, "authorized");
                Ok(Ok(Transition::Authorized { token_set }))
            }
            Err(e) => Ok(Err(e)),
        }
    }

    async fn refresh_step(&self, state: &FlowState) -> Result<FlowState> {
        let mut recorder = Recorder::new(self.transport.as_ref(), FlowStep::Authorized);
        let outcome = self.refresh_tokens(state, &mut recorder).await?;
        self.settle(
            state,
            FlowStep::Authorized,
            FlowStep::Authorized,
            outcome,
            recorder.into_exchanges(),
        )
    }

    async fn refresh_tokens(
        &self,
        state: &FlowState,
        recorder: &mut Recorder<'_>,
    ) -> Result<FlowResult<Transition>> {
        let previous = match &state.token_set {
            Some(tokens) => Some(tokens.clone()),
            None => load_json::<TokenSet>(self.store.as_ref(), &state.server_id, CredentialKind::Tokens)?,
        };
        let Some(previous) = previous else {
            return Ok(Err(cannot_refresh("no tokens are stored for this server")));
        };
        let Some(refresh_token) = previous.refresh_token.as_deref() else {
            return Ok(Err(cannot_refresh("the stored tokens carry no refresh token")));
        };
        let Some(server) = state.auth_server_metadata.as_ref() else {
            return Ok(Err(FlowError::discovery(
                "authorization server metadata is unknown; run discovery first",
            )));
        };
        let Some(client) = state.client_registration.as_ref() else {
            return Ok(Err(FlowError::registration("client identity is missing")));
        };
        if client.client_id != previous.client_id {
            return Ok(Err(cannot_refresh(
                "the stored tokens were issued to a different client",
            )));
        }
        let endpoint = match endpoint_url("token_endpoint", &server.token_endpoint) {
            Ok(url) => url,
            Err(e) => return Ok(Err(e)),
        };
        let resource = self.resource_indicator(state);
        let request = TokenRequest::refresh(
            endpoint,
            refresh_token,
            client,
            previous.scope.as_deref().or(state.scope.as_deref()),
            resource.as_ref(),
        );

        match token::execute(recorder, &request).await {
            Ok(fresh) => {
                let token_set = carry_refresh_token(fresh, &previous);
                self.persist_for(state.flow_id, || {
                    save_json(
                        self.store.as_ref(),
                        &state.server_id,
                        CredentialKind::Tokens,
                        &token_set,
                    )
                })?;
                tracing::info!(server_id = %state.server_id, "tokens refreshed");
                Ok(Ok(Transition::Refreshed { token_set }))
            }
            Err(e) => {
                if !e.is_retryable() {
                    tracing::warn!(server_id = %state.server_id, "refresh rejected; discarding stored tokens");
                    self.persist_for(state.flow_id, || {
                        self.store.remove(&state.server_id, CredentialKind::Tokens)
                    })?;
                }
                Ok(Err(e))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Scope precedence: configured, challenge `scope`, resource metadata
    /// `scopes_supported`, authorization server `scopes_supported`.
    fn resolve_scope(&self, state: &FlowState) -> Option<String> {
        let joined = |scopes: Option<&Vec<String>>| {
            scopes.filter(|s| !s.is_empty()).map(|s| s.join(" "))
        };
        self.settings
            .scope
            .clone()
            .or_else(|| {
                state
                    .challenge
                    .as_ref()
                    .and_then(|c| c.scope())
                    .map(str::to_string)
            })
            .or_else(|| joined(state.resource_metadata.as_ref().and_then(|m| m.scopes_supported.as_ref())))
            .or_else(|| joined(state.auth_server_metadata.as_ref().and_then(|m| m.scopes_supported.as_ref())))
    }

    /// RFC 8707 `resource` value, on versions that send it.
    fn resource_indicator(&self, state: &FlowState) -> Option<Url> {
        if !state.plan().sends_resource_parameter() {
            return None;
        }
        state
            .resource_metadata
            .as_ref()
            .and_then(|m| Url::parse(&m.resource).ok())
            .or_else(|| Some(state.resource_url.clone()))
    }
}

impl fmt::Debug for FlowMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("FlowMachine")
            .field("server_id", &snapshot.server_id)
            .field("step", &snapshot.step)
            .field("transport", &self.transport)
            .field("store", &self.store)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn in_flight_error() -> anyhow::Error {
    AuthflowError::InvalidOperation("another flow operation is in flight".to_string()).into()
}

fn cannot_refresh(message: &str) -> FlowError {
    FlowError::TokenExchange {
        code: TokenErrorCode::Other("no_refresh_token".to_string()),
        message: message.to_string(),
        transient: false,
    }
}

fn read_challenge(state: &FlowState) -> FlowResult<Transition> {
    let probe = state
        .probe
        .as_ref()
        .ok_or_else(|| FlowError::discovery("no unauthenticated request was recorded"))?;
    let challenge = discovery::require_unauthorized(probe)?;
    Ok(Transition::Challenged { challenge })
}

fn plan_resource_metadata(state: &FlowState) -> FlowResult<Transition> {
    let candidates = state
        .plan()
        .resource_metadata_candidates(&state.resource_url, state.challenge.as_ref());
    if candidates.is_empty() {
        return Err(FlowError::discovery("no resource metadata location to try"));
    }
    Ok(Transition::ResourceMetadataPlanned { candidates })
}

/// Checks the delivered callback against the outstanding request.
fn accept_callback(state: &FlowState) -> FlowResult<Transition> {
    let callback = state
        .callback
        .clone()
        .ok_or_else(|| FlowError::state_mismatch("no callback was delivered"))?;

    let expected = state.pending_pkce.as_ref().map(|p| p.state.as_str());
    match (expected, callback.state.as_deref()) {
        (Some(expected), Some(received)) if expected == received => {}
        (None, _) => {
            return Err(FlowError::state_mismatch(
                "no authorization request is outstanding",
            ))
        }
        (Some(_), None) => {
            return Err(FlowError::state_mismatch("callback carried no state"));
        }
        (Some(_), Some(_)) => {
            return Err(FlowError::state_mismatch(
                "callback state does not match the authorization request",
            ))
        }
    }

    // Only a callback carrying our state may end the attempt with an error.
    if let Some(error) = &callback.error {
        return Err(FlowError::AuthorizationDenied {
            error: error.clone(),
            description: callback.error_description.clone(),
        });
    }
    if callback.code.is_none() {
        return Err(FlowError::state_mismatch(
            "callback carried neither a code nor an error",
        ));
    }
    Ok(Transition::CallbackAccepted { callback })
}
