//! Immutable flow snapshots and the transition function
//!
//! A [`FlowState`] is never mutated in place. Each completed step produces a
//! [`Transition`], and [`FlowState::apply`] builds the next snapshot from the
//! current one. The orchestrator in [`crate::flow::machine`] publishes
//! snapshots as `Arc<FlowState>`, so a caller holding an older snapshot
//! keeps a consistent view.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use url::Url;
use uuid::Uuid;

use crate::auth::callback::CallbackParams;
use crate::auth::discovery::{
    AuthServerMetadata, MetadataSource, ProbeResult, ResourceMetadata, WwwAuthenticate,
};
use crate::auth::pkce::PendingPkce;
use crate::auth::registration::{ClientRegistration, RegistrationStrategy};
use crate::auth::token::{TokenRequest, TokenSet};
use crate::error::FlowError;
use crate::flow::capture::HttpExchange;
use crate::flow::version::{ProtocolVersion, StepPlan};

// ---------------------------------------------------------------------------
// FlowStep
// ---------------------------------------------------------------------------

/// A step of the authorization flow.
///
/// Versions use an ordered subset; see
/// [`StepPlan::steps`](crate::flow::version::StepPlan::steps).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStep {
    /// Nothing has happened yet.
    Idle,
    /// The resource was requested without credentials.
    SentUnauthenticatedRequest,
    /// The resource answered `401`.
    #[serde(rename = "received_401")]
    ReceivedUnauthorized,
    /// Resource metadata candidates are planned.
    RequestResourceMetadata,
    /// Resource metadata was fetched and an authorization server chosen.
    ReceivedResourceMetadata,
    /// Authorization server metadata candidates are planned.
    RequestAuthorizationServerMetadata,
    /// Authorization server metadata was fetched.
    ReceivedAuthorizationServerMetadata,
    /// The client identity is known.
    RegisterClient,
    /// The authorize URL was issued; the flow waits for the callback.
    RedirectToAuthorize,
    /// A callback with a valid state arrived.
    ReceivedCallback,
    /// The token request is planned.
    ExchangeToken,
    /// Tokens were issued.
    Authorized,
    /// A step failed; see [`FlowState::last_error`].
    Error,
}

impl FlowStep {
    /// Wire name of the step.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::SentUnauthenticatedRequest => "sent_unauthenticated_request",
            Self::ReceivedUnauthorized => "received_401",
            Self::RequestResourceMetadata => "request_resource_metadata",
            Self::ReceivedResourceMetadata => "received_resource_metadata",
            Self::RequestAuthorizationServerMetadata => "request_authorization_server_metadata",
            Self::ReceivedAuthorizationServerMetadata => "received_authorization_server_metadata",
            Self::RegisterClient => "register_client",
            Self::RedirectToAuthorize => "redirect_to_authorize",
            Self::ReceivedCallback => "received_callback",
            Self::ExchangeToken => "exchange_token",
            Self::Authorized => "authorized",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for FlowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StepFailure
// ---------------------------------------------------------------------------

/// The error recorded when a step's work fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    /// The step whose work failed.
    pub failed_at: FlowStep,
    /// The step `proceed()` resumes from when the error is retryable.
    pub resume_from: FlowStep,
    /// The categorized error.
    pub error: FlowError,
    /// When the failure happened.
    pub at: DateTime<Utc>,
}

impl StepFailure {
    /// Records `error` for the work that leads from `resume_from` to
    /// `failed_at`.
    pub fn new(failed_at: FlowStep, resume_from: FlowStep, error: FlowError) -> Self {
        Self {
            failed_at,
            resume_from,
            error,
            at: Utc::now(),
        }
    }

    /// Whether `proceed()` may retry.
    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }
}

// ---------------------------------------------------------------------------
// FlowState
// ---------------------------------------------------------------------------

/// Snapshot of one server's authorization flow.
///
/// Secrets are kept verbatim for the flow's own use; `Serialize` emits
/// redacted summaries of the PKCE secret, client registration, and tokens.
#[derive(Debug, Clone, Serialize)]
pub struct FlowState {
    /// Identifies this attempt; a reset starts a new one.
    pub flow_id: Uuid,
    /// Configured server identifier.
    pub server_id: String,
    /// The protected resource.
    pub resource_url: Url,
    /// Protocol revision, fixed for the flow's lifetime.
    pub protocol_version: ProtocolVersion,
    /// Registration strategy, fixed for the flow's lifetime.
    #[serde(serialize_with = "serialize_strategy")]
    pub registration_strategy: RegistrationStrategy,
    /// Current step.
    pub step: FlowStep,
    /// Result of the unauthenticated request.
    pub probe: Option<ProbeResult>,
    /// Parsed `WWW-Authenticate` challenge.
    pub challenge: Option<WwwAuthenticate>,
    /// URLs the next `received_*` step will try.
    pub discovery_candidates: Vec<Url>,
    /// RFC 9728 metadata.
    pub resource_metadata: Option<ResourceMetadata>,
    /// The URL that served the resource metadata.
    pub resource_metadata_url: Option<Url>,
    /// The chosen authorization server issuer.
    pub authorization_server: Option<Url>,
    /// RFC 8414 / OIDC metadata.
    pub auth_server_metadata: Option<AuthServerMetadata>,
    /// Which endpoint produced `auth_server_metadata`.
    pub metadata_source: Option<MetadataSource>,
    /// Client identity.
    #[serde(serialize_with = "serialize_registration")]
    pub client_registration: Option<ClientRegistration>,
    /// Scope requested at the authorization endpoint.
    pub scope: Option<String>,
    /// PKCE secret while a redirect is outstanding.
    #[serde(serialize_with = "serialize_pkce")]
    pub pending_pkce: Option<PendingPkce>,
    /// The issued authorize URL.
    pub authorization_url: Option<Url>,
    /// When the flow parked waiting for the callback.
    pub parked_at: Option<DateTime<Utc>>,
    /// The accepted callback.
    pub callback: Option<CallbackParams>,
    /// The planned token request.
    pub token_request: Option<TokenRequest>,
    /// Issued tokens; only present at `authorized`.
    #[serde(serialize_with = "serialize_tokens")]
    pub token_set: Option<TokenSet>,
    /// The last failure; present at `error`.
    pub last_error: Option<StepFailure>,
    /// Every HTTP exchange in call order.
    pub exchanges: Vec<HttpExchange>,
    /// `true` while a `proceed()` call is running.
    pub in_flight: bool,
    /// When this attempt started.
    pub created_at: DateTime<Utc>,
    /// When this snapshot was produced.
    pub updated_at: DateTime<Utc>,
}

/// A completed step's outcome.
#[derive(Debug, Clone)]
pub enum Transition {
    /// The unauthenticated request was answered.
    Probed {
        /// Status and challenge header.
        probe: ProbeResult,
    },
    /// The answer was a `401`.
    Challenged {
        /// Parsed challenge, if a header was present.
        challenge: Option<WwwAuthenticate>,
    },
    /// Resource metadata URLs are planned.
    ResourceMetadataPlanned {
        /// URLs to try in order.
        candidates: Vec<Url>,
    },
    /// Resource metadata was fetched.
    ResourceMetadataDiscovered {
        /// The document.
        metadata: ResourceMetadata,
        /// The URL that served it.
        served_by: Url,
        /// The selected issuer.
        authorization_server: Url,
    },
    /// The caller replaced the selected authorization server.
    AuthorizationServerOverridden {
        /// The caller's issuer.
        authorization_server: Url,
    },
    /// Authorization server metadata URLs are planned.
    AuthServerMetadataPlanned {
        /// The issuer being discovered.
        issuer: Url,
        /// URLs to try in order.
        candidates: Vec<Url>,
    },
    /// Authorization server metadata was fetched or defaulted.
    AuthServerMetadataDiscovered {
        /// The document.
        metadata: AuthServerMetadata,
        /// Where it came from.
        source: MetadataSource,
    },
    /// The client identity is known.
    ClientRegistered {
        /// Client identity.
        registration: ClientRegistration,
        /// Scope to request.
        scope: Option<String>,
    },
    /// The authorize URL was issued.
    RedirectIssued {
        /// New PKCE secret.
        pkce: PendingPkce,
        /// The authorize URL.
        authorization_url: Url,
        /// When the flow parked.
        parked_at: DateTime<Utc>,
    },
    /// A callback arrived at the parked flow; it is checked by the next
    /// `proceed()`.
    CallbackDelivered {
        /// The callback.
        callback: CallbackParams,
    },
    /// The callback's state matched.
    CallbackAccepted {
        /// The callback.
        callback: CallbackParams,
    },
    /// The token request is planned.
    TokenRequestPlanned {
        /// The request.
        request: TokenRequest,
    },
    /// Tokens were issued by the code exchange.
    Authorized {
        /// The tokens.
        token_set: TokenSet,
    },
    /// Tokens were renewed from `authorized`.
    Refreshed {
        /// The tokens.
        token_set: TokenSet,
    },
    /// A step failed.
    Failed {
        /// The failure.
        failure: StepFailure,
        /// Drop the PKCE secret and callback (redirect timeout, denial,
        /// fatal callback errors).
        clear_pending: bool,
    },
}

impl FlowState {
    /// A fresh flow at `idle`.
    pub fn new(
        server_id: impl Into<String>,
        resource_url: Url,
        protocol_version: ProtocolVersion,
        registration_strategy: RegistrationStrategy,
    ) -> Self {
        let now = Utc::now();
        Self {
            flow_id: Uuid::new_v4(),
            server_id: server_id.into(),
            resource_url,
            protocol_version,
            registration_strategy,
            step: FlowStep::Idle,
            probe: None,
            challenge: None,
            discovery_candidates: Vec::new(),
            resource_metadata: None,
            resource_metadata_url: None,
            authorization_server: None,
            auth_server_metadata: None,
            metadata_source: None,
            client_registration: None,
            scope: None,
            pending_pkce: None,
            authorization_url: None,
            parked_at: None,
            callback: None,
            token_request: None,
            token_set: None,
            last_error: None,
            exchanges: Vec::new(),
            in_flight: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// The flow's version plan.
    pub fn plan(&self) -> StepPlan {
        StepPlan::for_version(self.protocol_version, self.registration_strategy.kind())
    }

    /// A fresh `idle` flow for the same server, version, and strategy.
    pub fn reset(&self) -> Self {
        Self::new(
            self.server_id.clone(),
            self.resource_url.clone(),
            self.protocol_version,
            self.registration_strategy.clone(),
        )
    }

    /// `true` while waiting at `redirect_to_authorize`.
    pub fn is_parked(&self) -> bool {
        self.step == FlowStep::RedirectToAuthorize
    }

    /// `true` at `authorized` or at a non-retryable error.
    pub fn is_terminal(&self) -> bool {
        match self.step {
            FlowStep::Authorized => true,
            FlowStep::Error => self
                .last_error
                .as_ref()
                .is_some_and(|f| !f.is_retryable()),
            _ => false,
        }
    }

    /// The same snapshot with the in-flight flag set to `in_flight`.
    pub fn with_in_flight(&self, in_flight: bool) -> Self {
        Self {
            in_flight,
            ..self.clone()
        }
    }

    /// Builds the next snapshot. `exchanges` are appended after the
    /// existing ones.
    pub fn apply(&self, transition: Transition, exchanges: Vec<HttpExchange>) -> Self {
        let mut all_exchanges = self.exchanges.clone();
        all_exchanges.extend(exchanges);
        let base = Self {
            exchanges: all_exchanges,
            in_flight: false,
            last_error: None,
            updated_at: Utc::now(),
            ..self.clone()
        };

        match transition {
            Transition::Probed { probe } => Self {
                step: FlowStep::SentUnauthenticatedRequest,
                probe: Some(probe),
                ..base
            },
            Transition::Challenged { challenge } => Self {
                step: FlowStep::ReceivedUnauthorized,
                challenge,
                ..base
            },
            Transition::ResourceMetadataPlanned { candidates } => Self {
                step: FlowStep::RequestResourceMetadata,
                discovery_candidates: candidates,
                ..base
            },
            Transition::ResourceMetadataDiscovered {
                metadata,
                served_by,
                authorization_server,
            } => Self {
                step: FlowStep::ReceivedResourceMetadata,
                discovery_candidates: Vec::new(),
                resource_metadata: Some(metadata),
                resource_metadata_url: Some(served_by),
                authorization_server: Some(authorization_server),
                ..base
            },
            Transition::AuthorizationServerOverridden {
                authorization_server,
            } => Self {
                authorization_server: Some(authorization_server),
                ..base
            },
            Transition::AuthServerMetadataPlanned { issuer, candidates } => Self {
                step: FlowStep::RequestAuthorizationServerMetadata,
                authorization_server: Some(issuer),
                discovery_candidates: candidates,
                ..base
            },
            Transition::AuthServerMetadataDiscovered { metadata, source } => Self {
                step: FlowStep::ReceivedAuthorizationServerMetadata,
                discovery_candidates: Vec::new(),
                auth_server_metadata: Some(metadata),
                metadata_source: Some(source),
                ..base
            },
            Transition::ClientRegistered {
                registration,
                scope,
            } => Self {
                step: FlowStep::RegisterClient,
                client_registration: Some(registration),
                scope,
                ..base
            },
            Transition::RedirectIssued {
                pkce,
                authorization_url,
                parked_at,
            } => Self {
                step: FlowStep::RedirectToAuthorize,
                pending_pkce: Some(pkce),
                authorization_url: Some(authorization_url),
                parked_at: Some(parked_at),
                callback: None,
                token_request: None,
                ..base
            },
            Transition::CallbackDelivered { callback } => Self {
                callback: Some(callback),
                ..base
            },
            Transition::CallbackAccepted { callback } => Self {
                step: FlowStep::ReceivedCallback,
                callback: Some(callback),
                ..base
            },
            Transition::TokenRequestPlanned { request } => Self {
                step: FlowStep::ExchangeToken,
                token_request: Some(request),
                ..base
            },
            Transition::Authorized { token_set } | Transition::Refreshed { token_set } => Self {
                step: FlowStep::Authorized,
                token_set: Some(token_set),
                pending_pkce: None,
                parked_at: None,
                callback: None,
                token_request: None,
                ..base
            },
            Transition::Failed {
                failure,
                clear_pending,
            } => {
                let fatal = !failure.is_retryable();
                let drop_pending = clear_pending || fatal;
                Self {
                    step: FlowStep::Error,
                    token_set: None,
                    pending_pkce: if drop_pending { None } else { base.pending_pkce.clone() },
                    parked_at: if drop_pending { None } else { base.parked_at },
                    callback: if drop_pending { None } else { base.callback.clone() },
                    token_request: if drop_pending { None } else { base.token_request.clone() },
                    last_error: Some(failure),
                    ..base
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Redacting serializers
// ---------------------------------------------------------------------------

fn serialize_strategy<S: Serializer>(
    strategy: &RegistrationStrategy,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&strategy.kind().to_string())
}

#[derive(Serialize)]
struct RegistrationSummary<'a> {
    client_id: &'a str,
    confidential: bool,
    redirect_uris: &'a [String],
    origin: crate::auth::registration::RegistrationOrigin,
}

fn serialize_registration<S: Serializer>(
    registration: &Option<ClientRegistration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    registration
        .as_ref()
        .map(|r| RegistrationSummary {
            client_id: &r.client_id,
            confidential: r.is_confidential(),
            redirect_uris: &r.redirect_uris,
            origin: r.origin,
        })
        .serialize(serializer)
}

#[derive(Serialize)]
struct PkceSummary<'a> {
    flow_id: Uuid,
    code_challenge: &'a str,
    state: &'a str,
}

fn serialize_pkce<S: Serializer>(
    pkce: &Option<PendingPkce>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    pkce.as_ref()
        .map(|p| PkceSummary {
            flow_id: p.flow_id,
            code_challenge: &p.code_challenge,
            state: &p.state,
        })
        .serialize(serializer)
}

#[derive(Serialize)]
struct TokenSummary<'a> {
    token_type: &'a str,
    client_id: &'a str,
    scope: Option<&'a str>,
    expires_at: Option<DateTime<Utc>>,
    has_refresh_token: bool,
}

fn serialize_tokens<S: Serializer>(
    tokens: &Option<TokenSet>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    tokens
        .as_ref()
        .map(|t| TokenSummary {
            token_type: &t.token_type,
            client_id: &t.client_id,
            scope: t.scope.as_deref(),
            expires_at: t.expires_at(),
            has_refresh_token: t.can_refresh(),
        })
        .serialize(serializer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::registration::RegistrationOrigin;

    fn idle() -> FlowState {
        FlowState::new(
            "srv",
            Url::parse("https://mcp.example.com/mcp").unwrap(),
            ProtocolVersion::V2025_11_25,
            RegistrationStrategy::Dcr,
        )
    }

    fn token() -> TokenSet {
        TokenSet {
            access_token: "secret-access".to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: Some("secret-refresh".to_string()),
            expires_in: Some(3600),
            scope: None,
            client_id: "c".to_string(),
            obtained_at: Utc::now(),
        }
    }

    fn parked() -> FlowState {
        idle().apply(
            Transition::RedirectIssued {
                pkce: PendingPkce::generate(Uuid::new_v4()),
                authorization_url: Url::parse("https://as.example/authorize").unwrap(),
                parked_at: Utc::now(),
            },
            Vec::new(),
        )
    }

    #[test]
    fn test_new_state_is_idle() {
        let state = idle();
        assert_eq!(state.step, FlowStep::Idle);
        assert!(state.pending_pkce.is_none());
        assert!(state.token_set.is_none());
        assert!(!state.in_flight);
    }

    #[test]
    fn test_step_serializes_received_401() {
        assert_eq!(
            serde_json::to_string(&FlowStep::ReceivedUnauthorized).unwrap(),
            "\"received_401\""
        );
        assert_eq!(FlowStep::ReceivedUnauthorized.to_string(), "received_401");
    }

    #[test]
    fn test_apply_does_not_touch_previous_snapshot() {
        let before = idle();
        let after = before.apply(
            Transition::Probed {
                probe: ProbeResult {
                    status: 401,
                    www_authenticate: None,
                },
            },
            Vec::new(),
        );
        assert_eq!(before.step, FlowStep::Idle);
        assert!(before.probe.is_none());
        assert_eq!(after.step, FlowStep::SentUnauthenticatedRequest);
        assert_eq!(after.flow_id, before.flow_id);
    }

    #[test]
    fn test_authorized_clears_pending_pkce() {
        let state = parked().apply(Transition::Authorized { token_set: token() }, Vec::new());
        assert_eq!(state.step, FlowStep::Authorized);
        assert!(state.pending_pkce.is_none());
        assert!(state.token_set.is_some());
    }

    #[test]
    fn test_retryable_failure_keeps_pending_and_artifacts() {
        let state = parked().apply(
            Transition::Failed {
                failure: StepFailure::new(
                    FlowStep::Authorized,
                    FlowStep::ExchangeToken,
                    FlowError::TokenExchange {
                        code: crate::error::TokenErrorCode::Transport,
                        message: "timeout".to_string(),
                        transient: true,
                    },
                ),
                clear_pending: false,
            },
            Vec::new(),
        );
        assert_eq!(state.step, FlowStep::Error);
        assert!(state.pending_pkce.is_some());
        assert!(state.authorization_url.is_some());
        assert!(!state.is_terminal());
    }

    #[test]
    fn test_fatal_failure_clears_pending() {
        let state = parked().apply(
            Transition::Failed {
                failure: StepFailure::new(
                    FlowStep::ReceivedCallback,
                    FlowStep::RedirectToAuthorize,
                    FlowError::state_mismatch("forged"),
                ),
                clear_pending: false,
            },
            Vec::new(),
        );
        assert!(state.pending_pkce.is_none());
        assert!(state.is_terminal());
    }

    #[test]
    fn test_failure_drops_token_set() {
        let authorized = idle().apply(Transition::Authorized { token_set: token() }, Vec::new());
        let failed = authorized.apply(
            Transition::Failed {
                failure: StepFailure::new(
                    FlowStep::Authorized,
                    FlowStep::Authorized,
                    FlowError::TokenExchange {
                        code: crate::error::TokenErrorCode::InvalidGrant,
                        message: "revoked".to_string(),
                        transient: false,
                    },
                ),
                clear_pending: false,
            },
            Vec::new(),
        );
        assert!(failed.token_set.is_none());
    }

    #[test]
    fn test_reset_starts_new_attempt() {
        let state = parked();
        let fresh = state.reset();
        assert_eq!(fresh.step, FlowStep::Idle);
        assert_ne!(fresh.flow_id, state.flow_id);
        assert!(fresh.pending_pkce.is_none());
        assert!(fresh.exchanges.is_empty());
    }

    #[test]
    fn test_serialize_redacts_secrets() {
        let mut state = parked().apply(Transition::Authorized { token_set: token() }, Vec::new());
        state.client_registration = Some(ClientRegistration {
            client_id: "c".to_string(),
            client_secret: Some("secret-client".to_string()),
            redirect_uris: vec![],
            origin: RegistrationOrigin::Dynamic,
            registered_at: Utc::now(),
        });
        let json = serde_json::to_string(&state).unwrap();
        assert!(!json.contains("secret-access"));
        assert!(!json.contains("secret-refresh"));
        assert!(!json.contains("secret-client"));
        assert!(json.contains("\"has_refresh_token\":true"));
    }
}
