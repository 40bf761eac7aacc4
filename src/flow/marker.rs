//! What survives a restart while a redirect is outstanding
//!
//! Before the flow parks at `redirect_to_authorize` it writes two entries to
//! the credential store: the [`StoredVerifier`] and a [`PendingFlowMarker`]
//! describing everything discovered so far. Together they let a new process
//! rebuild the parked snapshot and finish the exchange when the callback
//! arrives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::auth::discovery::{AuthServerMetadata, MetadataSource, ResourceMetadata};
use crate::auth::pkce::PendingPkce;
use crate::auth::registration::{ClientRegistration, RegistrationStrategy, StrategyKind};
use crate::error::{AuthflowError, Result};
use crate::flow::state::{FlowState, FlowStep};
use crate::flow::version::ProtocolVersion;

/// The PKCE verifier of a parked flow.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredVerifier {
    /// Attempt the verifier belongs to.
    pub flow_id: Uuid,
    /// The verifier.
    pub code_verifier: String,
}

impl std::fmt::Debug for StoredVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredVerifier")
            .field("flow_id", &self.flow_id)
            .field("code_verifier", &crate::flow::capture::REDACTED)
            .finish()
    }
}

/// Public description of a parked flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingFlowMarker {
    /// Attempt identifier; must match the stored verifier.
    pub flow_id: Uuid,
    /// Configured server.
    pub server_id: String,
    /// The protected resource.
    pub resource_url: Url,
    /// Protocol revision of the attempt.
    pub protocol_version: ProtocolVersion,
    /// Registration strategy of the attempt.
    pub strategy: StrategyKind,
    /// CSRF state expected on the callback.
    pub state: String,
    /// S256 challenge sent with the authorize request.
    pub code_challenge: String,
    /// Redirect URI used in the authorize request.
    pub redirect_uri: String,
    /// The issued authorize URL.
    pub authorization_url: Url,
    /// Requested scope.
    #[serde(default)]
    pub scope: Option<String>,
    /// RFC 9728 metadata, when the version uses it.
    #[serde(default)]
    pub resource_metadata: Option<ResourceMetadata>,
    /// URL that served the resource metadata.
    #[serde(default)]
    pub resource_metadata_url: Option<Url>,
    /// Chosen issuer.
    #[serde(default)]
    pub authorization_server: Option<Url>,
    /// Authorization server metadata.
    pub auth_server_metadata: AuthServerMetadata,
    /// Where the metadata came from.
    #[serde(default)]
    pub metadata_source: Option<MetadataSource>,
    /// Client identity.
    pub client_registration: ClientRegistration,
    /// When the flow parked.
    pub parked_at: DateTime<Utc>,
}

impl PendingFlowMarker {
    /// Captures a parked snapshot. `None` when the snapshot is not parked or
    /// lacks the artifacts a resume needs.
    pub fn from_state(state: &FlowState, redirect_uri: &str) -> Option<Self> {
        if state.step != FlowStep::RedirectToAuthorize {
            return None;
        }
        let pkce = state.pending_pkce.as_ref()?;
        Some(Self {
            flow_id: state.flow_id,
            server_id: state.server_id.clone(),
            resource_url: state.resource_url.clone(),
            protocol_version: state.protocol_version,
            strategy: state.registration_strategy.kind(),
            state: pkce.state.clone(),
            code_challenge: pkce.code_challenge.clone(),
            redirect_uri: redirect_uri.to_string(),
            authorization_url: state.authorization_url.clone()?,
            scope: state.scope.clone(),
            resource_metadata: state.resource_metadata.clone(),
            resource_metadata_url: state.resource_metadata_url.clone(),
            authorization_server: state.authorization_server.clone(),
            auth_server_metadata: state.auth_server_metadata.clone()?,
            metadata_source: state.metadata_source.clone(),
            client_registration: state.client_registration.clone()?,
            parked_at: state.parked_at?,
        })
    }

    /// The verifier entry paired with this marker.
    pub fn verifier_for(pkce: &PendingPkce) -> StoredVerifier {
        StoredVerifier {
            flow_id: pkce.flow_id,
            code_verifier: pkce.code_verifier.clone(),
        }
    }

    /// Rebuilds the parked snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::InvalidOperation`] when the verifier belongs
    /// to another attempt, does not hash to the recorded challenge, or the
    /// configured strategy differs from the one the flow parked with.
    pub fn into_state(
        self,
        verifier: StoredVerifier,
        strategy: RegistrationStrategy,
    ) -> Result<FlowState> {
        if verifier.flow_id != self.flow_id {
            return Err(AuthflowError::InvalidOperation(format!(
                "stored verifier belongs to flow {}, marker to flow {}",
                verifier.flow_id, self.flow_id
            ))
            .into());
        }
        if strategy.kind() != self.strategy {
            return Err(AuthflowError::InvalidOperation(format!(
                "flow parked with {} registration but {} is configured",
                self.strategy,
                strategy.kind()
            ))
            .into());
        }
        let pkce = PendingPkce::from_parts(self.flow_id, verifier.code_verifier, self.state);
        if pkce.code_challenge != self.code_challenge {
            return Err(AuthflowError::InvalidOperation(
                "stored verifier does not match the recorded challenge".to_string(),
            )
            .into());
        }

        let mut state = FlowState::new(
            self.server_id,
            self.resource_url,
            self.protocol_version,
            strategy,
        );
        state.flow_id = self.flow_id;
        state.step = FlowStep::RedirectToAuthorize;
        state.resource_metadata = self.resource_metadata;
        state.resource_metadata_url = self.resource_metadata_url;
        state.authorization_server = self.authorization_server;
        state.auth_server_metadata = Some(self.auth_server_metadata);
        state.metadata_source = self.metadata_source;
        state.client_registration = Some(self.client_registration);
        state.scope = self.scope;
        state.pending_pkce = Some(pkce);
        state.authorization_url = Some(self.authorization_url);
        state.parked_at = Some(self.parked_at);
        Ok(state)
    }
}
