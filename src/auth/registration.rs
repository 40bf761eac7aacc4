//! Client identity: dynamic registration, preregistered ids, and client ID
//! metadata documents
//!
//! Three strategies decide which `client_id` the flow presents:
//!
//! - [`RegistrationStrategy::Dcr`] POSTs client metadata to the
//!   authorization server's `registration_endpoint` (RFC 7591).
//! - [`RegistrationStrategy::Preregistered`] uses a client id (and optional
//!   secret) configured out of band.
//! - [`RegistrationStrategy::Cimd`] presents the URL of a client ID metadata
//!   document as the client id.
//!
//! Only `dcr` touches the network.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::discovery::{endpoint_url, AuthServerMetadata};
use crate::error::{FlowError, FlowResult};
use crate::flow::capture::Recorder;
use crate::transport::HttpRequest;

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// How the client obtains its identity at the authorization server.
///
/// # Examples
///
/// ```
/// use authflow::auth::registration::RegistrationStrategy;
///
/// let yaml = "strategy: preregistered\nclient_id: my-app\n";
/// let strategy: RegistrationStrategy = serde_yaml::from_str(yaml).unwrap();
/// assert!(matches!(strategy, RegistrationStrategy::Preregistered { .. }));
/// ```
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RegistrationStrategy {
    /// Dynamic Client Registration (RFC 7591).
    #[default]
    Dcr,
    /// A client registered out of band.
    Preregistered {
        /// The issued client id.
        client_id: String,
        /// Secret for confidential clients.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_secret: Option<String>,
    },
    /// A client ID metadata document; `client_id` is its URL.
    Cimd {
        /// URL of the client metadata document.
        client_id: String,
    },
}

/// Discriminant of [`RegistrationStrategy`], used for step planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Dynamic registration.
    Dcr,
    /// Client id metadata document.
    Cimd,
    /// Preregistered client.
    Preregistered,
}

impl RegistrationStrategy {
    /// The strategy's discriminant.
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Dcr => StrategyKind::Dcr,
            Self::Preregistered { .. } => StrategyKind::Preregistered,
            Self::Cimd { .. } => StrategyKind::Cimd,
        }
    }
}

impl fmt::Debug for RegistrationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dcr => f.write_str("Dcr"),
            Self::Preregistered {
                client_id,
                client_secret,
            } => f
                .debug_struct("Preregistered")
                .field("client_id", client_id)
                .field("client_secret", &client_secret.as_ref().map(|_| "[REDACTED]"))
                .finish(),
            Self::Cimd { client_id } => f.debug_struct("Cimd").field("client_id", client_id).finish(),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dcr => "dcr",
            Self::Cimd => "cimd",
            Self::Preregistered => "preregistered",
        })
    }
}

// ---------------------------------------------------------------------------
// ClientRegistration
// ---------------------------------------------------------------------------

/// Where a [`ClientRegistration`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationOrigin {
    /// Issued by the registration endpoint.
    Dynamic,
    /// Configured out of band.
    Preregistered,
    /// A client ID metadata document URL.
    MetadataDocument,
}

/// The client identity used for authorization and token requests.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistration {
    /// Client identifier.
    pub client_id: String,
    /// Client secret for confidential clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Redirect URIs the identity is valid for.
    pub redirect_uris: Vec<String>,
    /// How the identity was obtained.
    pub origin: RegistrationOrigin,
    /// When the identity was obtained or configured.
    pub registered_at: DateTime<Utc>,
}

impl ClientRegistration {
    /// `true` when token requests must carry `client_secret`.
    pub fn is_confidential(&self) -> bool {
        self.client_secret.is_some()
    }

    /// `true` when the identity was registered for `redirect_uri`.
    pub fn allows_redirect(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|u| u == redirect_uri)
    }
}

impl fmt::Debug for ClientRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistration")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field("redirect_uris", &self.redirect_uris)
            .field("origin", &self.origin)
            .field("registered_at", &self.registered_at)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Dynamic registration
// ---------------------------------------------------------------------------

/// Client metadata POSTed to the registration endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientMetadata {
    /// Display name.
    pub client_name: String,
    /// Redirect URIs.
    pub redirect_uris: Vec<String>,
    /// Always `authorization_code` and `refresh_token`.
    pub grant_types: Vec<String>,
    /// Always `code`.
    pub response_types: Vec<String>,
    /// Always `none`: the client is public and proves possession with PKCE.
    pub token_endpoint_auth_method: String,
    /// Requested scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Client home page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<String>,
}

impl ClientMetadata {
    /// Metadata for a public client using the authorization code grant.
    ///
    /// # Examples
    ///
    /// ```
    /// use authflow::auth::registration::ClientMetadata;
    ///
    /// let meta = ClientMetadata::public_client("authflow", "http://127.0.0.1:8765/callback", None, None);
    /// assert_eq!(meta.token_endpoint_auth_method, "none");
    /// assert_eq!(meta.grant_types, vec!["authorization_code", "refresh_token"]);
    /// ```
    pub fn public_client(
        client_name: &str,
        redirect_uri: &str,
        scope: Option<&str>,
        client_uri: Option<&str>,
    ) -> Self {
        Self {
            client_name: client_name.to_string(),
            redirect_uris: vec![redirect_uri.to_string()],
            grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
            response_types: vec!["code".to_string()],
            token_endpoint_auth_method: "none".to_string(),
            scope: scope.map(str::to_string),
            client_uri: client_uri.map(str::to_string),
        }
    }
}

/// RFC 7591 registration response.
#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    redirect_uris: Option<Vec<String>>,
}

/// RFC 7591 section 3.2.2 error response.
#[derive(Debug, Deserialize)]
struct RegistrationErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Registers the client at the authorization server's registration
/// endpoint.
///
/// # Errors
///
/// Returns [`FlowError::Registration`] when the server has no registration
/// endpoint, the endpoint is unreachable, or it rejects the metadata.
pub async fn register_dynamic(
    recorder: &mut Recorder<'_>,
    server: &AuthServerMetadata,
    metadata: &ClientMetadata,
) -> FlowResult<ClientRegistration> {
    let endpoint = server.registration_endpoint.as_deref().ok_or_else(|| {
        FlowError::registration(format!(
            "authorization server {} has no registration_endpoint; configure a preregistered client",
            server.issuer
        ))
    })?;
    let endpoint = endpoint_url("registration_endpoint", endpoint)
        .map_err(|e| FlowError::registration(e.to_string()))?;

    let body = serde_json::to_value(metadata)
        .map_err(|e| FlowError::registration(format!("cannot encode client metadata: {e}")))?;
    let request = HttpRequest::post_json(endpoint.clone(), &body)
        .map_err(|e| FlowError::registration(format!("cannot encode client metadata: {e}")))?;

    let response = recorder
        .send(request)
        .await
        .map_err(|e| FlowError::registration(format!("registration endpoint unreachable: {e}")))?;

    if !response.is_success() {
        let detail = match response.json::<RegistrationErrorBody>() {
            Ok(err) => match err.error_description {
                Some(desc) => format!("{}: {desc}", err.error),
                None => err.error,
            },
            Err(_) => response.body.clone(),
        };
        return Err(FlowError::registration(format!(
            "registration endpoint {endpoint} returned {}: {detail}",
            response.status
        )));
    }

    let issued: RegistrationResponse = response
        .json()
        .map_err(|e| FlowError::registration(format!("malformed registration response: {e}")))?;

    tracing::info!(client_id = %issued.client_id, "registered client dynamically");

    Ok(ClientRegistration {
        client_id: issued.client_id,
        client_secret: issued.client_secret,
        redirect_uris: issued
            .redirect_uris
            .unwrap_or_else(|| metadata.redirect_uris.clone()),
        origin: RegistrationOrigin::Dynamic,
        registered_at: Utc::now(),
    })
}

/// The identity for strategies that need no network call.
///
/// Returns `None` for [`RegistrationStrategy::Dcr`].
pub fn static_registration(
    strategy: &RegistrationStrategy,
    server: &AuthServerMetadata,
    redirect_uri: &str,
) -> Option<ClientRegistration> {
    let (client_id, client_secret, origin) = match strategy {
        RegistrationStrategy::Dcr => return None,
        RegistrationStrategy::Preregistered {
            client_id,
            client_secret,
        } => (client_id, client_secret.clone(), RegistrationOrigin::Preregistered),
        RegistrationStrategy::Cimd { client_id } => {
            if server.client_id_metadata_document_supported == Some(false) {
                tracing::warn!(
                    issuer = %server.issuer,
                    "authorization server declares no client ID metadata document support"
                );
            }
            (client_id, None, RegistrationOrigin::MetadataDocument)
        }
    };

    Some(ClientRegistration {
        client_id: client_id.clone(),
        client_secret,
        redirect_uris: vec![redirect_uri.to_string()],
        origin,
        registered_at: Utc::now(),
    })
}

/// A stored dynamic registration that can be reused for `redirect_uri`.
pub fn reusable_registration(
    stored: Option<ClientRegistration>,
    redirect_uri: &str,
) -> Option<ClientRegistration> {
    stored.filter(|r| r.origin == RegistrationOrigin::Dynamic && r.allows_redirect(redirect_uri))
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    const REDIRECT: &str = "http://127.0.0.1:8765/callback";

    fn server() -> AuthServerMetadata {
        AuthServerMetadata::default_endpoints(&Url::parse("https://as.example").unwrap())
    }

    #[test]
    fn test_client_metadata_serialization_omits_absent_fields() {
        let meta = ClientMetadata::public_client("authflow", REDIRECT, None, None);
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["client_name"], "authflow");
        assert_eq!(json["response_types"][0], "code");
        assert!(json.get("scope").is_none());
        assert!(json.get("client_uri").is_none());
    }

    #[test]
    fn test_static_registration_preregistered_keeps_secret() {
        let strategy = RegistrationStrategy::Preregistered {
            client_id: "app".to_string(),
            client_secret: Some("s3cret".to_string()),
        };
        let reg = static_registration(&strategy, &server(), REDIRECT).unwrap();
        assert_eq!(reg.client_id, "app");
        assert!(reg.is_confidential());
        assert_eq!(reg.origin, RegistrationOrigin::Preregistered);
    }

    #[test]
    fn test_static_registration_cimd_uses_document_url() {
        let strategy = RegistrationStrategy::Cimd {
            client_id: "https://app.example/client.json".to_string(),
        };
        let reg = static_registration(&strategy, &server(), REDIRECT).unwrap();
        assert_eq!(reg.client_id, "https://app.example/client.json");
        assert_eq!(reg.origin, RegistrationOrigin::MetadataDocument);
        assert!(!reg.is_confidential());
    }

    #[test]
    fn test_static_registration_dcr_is_none() {
        assert!(static_registration(&RegistrationStrategy::Dcr, &server(), REDIRECT).is_none());
    }

    #[test]
    fn test_reusable_registration_requires_matching_redirect() {
        let reg = ClientRegistration {
            client_id: "dyn".to_string(),
            client_secret: None,
            redirect_uris: vec![REDIRECT.to_string()],
            origin: RegistrationOrigin::Dynamic,
            registered_at: Utc::now(),
        };
        assert!(reusable_registration(Some(reg.clone()), REDIRECT).is_some());
        assert!(reusable_registration(Some(reg), "http://127.0.0.1:9999/callback").is_none());
        assert!(reusable_registration(None, REDIRECT).is_none());
    }

    #[test]
    fn test_debug_redacts_client_secret() {
        let strategy = RegistrationStrategy::Preregistered {
            client_id: "app".to_string(),
            client_secret: Some("s3cret".to_string()),
        };
        assert!(!format!("{strategy:?}").contains("s3cret"));
        let reg = static_registration(&strategy, &server(), REDIRECT).unwrap();
        assert!(!format!("{reg:?}").contains("s3cret"));
    }

    #[test]
    fn test_strategy_kind_display() {
        assert_eq!(RegistrationStrategy::Dcr.kind().to_string(), "dcr");
    }
}
