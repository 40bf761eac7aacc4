//! Resource and authorization server discovery
//!
//! This module implements the network half of the discovery steps:
//!
//! 1. The unauthenticated probe ([`probe_resource`]) and parsing of the
//!    `WWW-Authenticate` challenge ([`WwwAuthenticate::parse`]).
//! 2. RFC 9728 Protected Resource Metadata ([`fetch_resource_metadata`]).
//! 3. Deterministic selection of an authorization server
//!    ([`select_authorization_server`]).
//! 4. RFC 8414 / OpenID Connect Discovery ([`fetch_auth_server_metadata`]),
//!    with an optional fallback to conventional endpoint paths.
//!
//! Which well-known URLs are tried is decided by the protocol version; the
//! candidate builders here are the building blocks the
//! [`StepPlan`](crate::flow::version::StepPlan) combines. Every call goes
//! through a [`Recorder`] so the exchanges land on the flow snapshot.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{FlowError, FlowResult};
use crate::flow::capture::Recorder;
use crate::transport::HttpRequest;

// ---------------------------------------------------------------------------
// Protected Resource Metadata (RFC 9728)
// ---------------------------------------------------------------------------

/// Metadata document describing a protected resource.
///
/// # Examples
///
/// ```
/// use authflow::auth::discovery::ResourceMetadata;
///
/// let json = r#"{
///     "resource": "https://mcp.example.com/mcp",
///     "authorization_servers": ["https://auth.example.com"]
/// }"#;
///
/// let meta: ResourceMetadata = serde_json::from_str(json).unwrap();
/// assert_eq!(meta.authorization_servers.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    /// The URI of the protected resource itself.
    pub resource: String,

    /// Issuer URIs of the authorization servers protecting this resource,
    /// in the server's order of preference.
    #[serde(default)]
    pub authorization_servers: Vec<String>,

    /// Scopes the resource advertises.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,

    /// Supported methods for presenting bearer tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_methods_supported: Option<Vec<String>>,

    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Authorization Server Metadata (RFC 8414 / OIDC Discovery)
// ---------------------------------------------------------------------------

/// Metadata document describing an authorization server.
///
/// # Examples
///
/// ```
/// use authflow::auth::discovery::AuthServerMetadata;
///
/// let json = r#"{
///     "issuer": "https://auth.example.com",
///     "authorization_endpoint": "https://auth.example.com/authorize",
///     "token_endpoint": "https://auth.example.com/token",
///     "code_challenge_methods_supported": ["S256"]
/// }"#;
///
/// let meta: AuthServerMetadata = serde_json::from_str(json).unwrap();
/// assert!(meta.registration_endpoint.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthServerMetadata {
    /// Issuer identifier.
    pub issuer: String,

    /// Authorization endpoint (RFC 6749 section 3.1).
    pub authorization_endpoint: String,

    /// Token endpoint (RFC 6749 section 3.2).
    pub token_endpoint: String,

    /// Dynamic Client Registration endpoint (RFC 7591).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,

    /// Scopes the server supports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,

    /// Supported `response_type` values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_types_supported: Option<Vec<String>>,

    /// Supported `grant_type` values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_types_supported: Option<Vec<String>>,

    /// Supported PKCE challenge methods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_methods_supported: Option<Vec<String>>,

    /// Whether URL-formatted client ids (client ID metadata documents) are
    /// accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_metadata_document_supported: Option<bool>,

    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl AuthServerMetadata {
    /// Conventional endpoints relative to the issuer, used only when the
    /// fallback policy allows guessing.
    ///
    /// # Examples
    ///
    /// ```
    /// use authflow::auth::discovery::AuthServerMetadata;
    /// use url::Url;
    ///
    /// let meta = AuthServerMetadata::default_endpoints(&Url::parse("https://auth.example.com").unwrap());
    /// assert_eq!(meta.token_endpoint, "https://auth.example.com/token");
    /// ```
    pub fn default_endpoints(issuer: &Url) -> Self {
        let base = issuer.as_str().trim_end_matches('/');
        Self {
            issuer: base.to_string(),
            authorization_endpoint: format!("{base}/authorize"),
            token_endpoint: format!("{base}/token"),
            registration_endpoint: Some(format!("{base}/register")),
            scopes_supported: None,
            response_types_supported: None,
            grant_types_supported: None,
            code_challenge_methods_supported: None,
            client_id_metadata_document_supported: None,
            extra: HashMap::new(),
        }
    }
}

/// Where the authorization server metadata came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetadataSource {
    /// An RFC 8414 `oauth-authorization-server` document.
    OauthAuthorizationServer {
        /// The URL that answered.
        url: Url,
    },
    /// An OpenID Connect `openid-configuration` document.
    OpenidConfiguration {
        /// The URL that answered.
        url: Url,
    },
    /// No document was found; conventional endpoints were assumed.
    FallbackDefaults,
}

impl MetadataSource {
    fn for_url(url: &Url) -> Self {
        if url.path().contains("/.well-known/openid-configuration") {
            Self::OpenidConfiguration { url: url.clone() }
        } else {
            Self::OauthAuthorizationServer { url: url.clone() }
        }
    }
}

impl fmt::Display for MetadataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OauthAuthorizationServer { url } => write!(f, "oauth-authorization-server ({url})"),
            Self::OpenidConfiguration { url } => write!(f, "openid-configuration ({url})"),
            Self::FallbackDefaults => f.write_str("fallback defaults"),
        }
    }
}

/// What to do when no authorization server metadata candidate answers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryFallback {
    /// Fail the step with a discovery error.
    #[default]
    Fail,
    /// Assume `{issuer}/authorize`, `{issuer}/token`, and `{issuer}/register`.
    DefaultEndpoints,
}

// ---------------------------------------------------------------------------
// Probe and WWW-Authenticate
// ---------------------------------------------------------------------------

/// Outcome of the unauthenticated request to the resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Status code the resource answered with.
    pub status: u16,
    /// Raw `WWW-Authenticate` header, if present.
    pub www_authenticate: Option<String>,
}

/// A parsed `WWW-Authenticate` challenge.
///
/// Only the first challenge is parsed. Parameter names are lowercased;
/// quoted values are unescaped.
///
/// # Examples
///
/// ```
/// use authflow::auth::discovery::WwwAuthenticate;
///
/// let challenge = WwwAuthenticate::parse(
///     r#"Bearer realm="mcp", resource_metadata="https://mcp.example.com/.well-known/oauth-protected-resource", scope="files:read""#,
/// );
/// assert_eq!(challenge.scheme, "Bearer");
/// assert_eq!(challenge.realm(), Some("mcp"));
/// assert_eq!(challenge.scope(), Some("files:read"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WwwAuthenticate {
    /// Authentication scheme, e.g. `Bearer`.
    pub scheme: String,
    /// All auth-params by lowercased name.
    pub params: BTreeMap<String, String>,
}

fn auth_param_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z0-9_\-]+)\s*=\s*(?:"((?:[^"\\]|\\.)*)"|([^\s,]+))"#).ok()
    })
    .as_ref()
}

impl WwwAuthenticate {
    /// Parses a header value. Never fails: unknown syntax yields an empty
    /// parameter map.
    pub fn parse(header: &str) -> Self {
        let header = header.trim();
        let (scheme, rest) = match header.split_once(char::is_whitespace) {
            Some((scheme, rest)) if !scheme.contains('=') => (scheme.to_string(), rest),
            _ if !header.contains('=') => (header.to_string(), ""),
            _ => (String::new(), header),
        };

        let mut params = BTreeMap::new();
        let Some(re) = auth_param_regex() else {
            return Self { scheme, params };
        };
        for caps in re.captures_iter(rest) {
            let name = caps[1].to_ascii_lowercase();
            let value = match (caps.get(2), caps.get(3)) {
                (Some(quoted), _) => quoted.as_str().replace("\\\"", "\"").replace("\\\\", "\\"),
                (None, Some(token)) => token.as_str().to_string(),
                (None, None) => continue,
            };
            // First occurrence wins; a second challenge may repeat names.
            params.entry(name).or_insert(value);
        }

        Self { scheme, params }
    }

    fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// `realm` parameter.
    pub fn realm(&self) -> Option<&str> {
        self.param("realm")
    }

    /// RFC 9728 `resource_metadata` parameter.
    pub fn resource_metadata(&self) -> Option<&str> {
        self.param("resource_metadata")
    }

    /// `scope` parameter.
    pub fn scope(&self) -> Option<&str> {
        self.param("scope")
    }

    /// `error` parameter.
    pub fn error(&self) -> Option<&str> {
        self.param("error")
    }

    /// `error_description` parameter.
    pub fn error_description(&self) -> Option<&str> {
        self.param("error_description")
    }

    /// Pre-RFC 9728 authorization server hint (`authorization_uri` or
    /// `as_uri`).
    pub fn authorization_uri(&self) -> Option<&str> {
        self.param("authorization_uri").or_else(|| self.param("as_uri"))
    }
}

/// Sends the unauthenticated request to the resource.
///
/// Any HTTP status is a successful probe; whether it is acceptable is
/// decided by [`require_unauthorized`].
///
/// # Errors
///
/// Returns [`FlowError::Discovery`] when the resource could not be reached.
pub async fn probe_resource(recorder: &mut Recorder<'_>, resource: &Url) -> FlowResult<ProbeResult> {
    let response = recorder
        .send(HttpRequest::get(resource.clone()))
        .await
        .map_err(|e| FlowError::discovery(format!("resource {resource} unreachable: {e}")))?;

    Ok(ProbeResult {
        status: response.status,
        www_authenticate: response.header("www-authenticate").map(str::to_string),
    })
}

/// Checks that the probe answered `401` and parses its challenge.
///
/// # Errors
///
/// Returns [`FlowError::Discovery`] for any other status.
pub fn require_unauthorized(probe: &ProbeResult) -> FlowResult<Option<WwwAuthenticate>> {
    if probe.status != 401 {
        return Err(FlowError::discovery(format!(
            "expected 401 from the unauthenticated request, got {}",
            probe.status
        )));
    }
    Ok(probe.www_authenticate.as_deref().map(WwwAuthenticate::parse))
}

// ---------------------------------------------------------------------------
// Candidate URL builders
// ---------------------------------------------------------------------------

/// `scheme://host[:port]` of a URL.
pub fn origin_of(url: &Url) -> Url {
    let mut origin = url.clone();
    origin.set_path("/");
    origin.set_query(None);
    origin.set_fragment(None);
    origin
}

fn at_path(base: &Url, path: &str) -> Url {
    let mut url = origin_of(base);
    url.set_path(path);
    url
}

fn trimmed_path(url: &Url) -> &str {
    url.path().trim_end_matches('/')
}

/// `{origin}/.well-known/oauth-protected-resource{path}`.
///
/// # Examples
///
/// ```
/// use authflow::auth::discovery::resource_metadata_url;
/// use url::Url;
///
/// let url = resource_metadata_url(&Url::parse("https://mcp.example.com/v1/mcp").unwrap());
/// assert_eq!(url.as_str(), "https://mcp.example.com/.well-known/oauth-protected-resource/v1/mcp");
/// ```
pub fn resource_metadata_url(resource: &Url) -> Url {
    at_path(
        resource,
        &format!("/.well-known/oauth-protected-resource{}", trimmed_path(resource)),
    )
}

/// `{origin}/.well-known/oauth-protected-resource`.
pub fn root_resource_metadata_url(resource: &Url) -> Url {
    at_path(resource, "/.well-known/oauth-protected-resource")
}

/// `{origin}/.well-known/oauth-authorization-server{path}` (RFC 8414 path
/// insertion).
pub fn oauth_metadata_url(issuer: &Url) -> Url {
    at_path(
        issuer,
        &format!("/.well-known/oauth-authorization-server{}", trimmed_path(issuer)),
    )
}

/// `{origin}/.well-known/openid-configuration{path}` (path insertion).
pub fn openid_inserted_url(issuer: &Url) -> Url {
    at_path(
        issuer,
        &format!("/.well-known/openid-configuration{}", trimmed_path(issuer)),
    )
}

/// `{issuer}/.well-known/openid-configuration` (path appending, OIDC
/// Discovery 1.0).
pub fn openid_appended_url(issuer: &Url) -> Url {
    at_path(
        issuer,
        &format!("{}/.well-known/openid-configuration", trimmed_path(issuer)),
    )
}

/// `{origin}/.well-known/oauth-authorization-server`.
pub fn root_oauth_metadata_url(issuer: &Url) -> Url {
    at_path(issuer, "/.well-known/oauth-authorization-server")
}

/// `{origin}/.well-known/openid-configuration`.
pub fn root_openid_url(issuer: &Url) -> Url {
    at_path(issuer, "/.well-known/openid-configuration")
}

/// Removes later duplicates, keeping first-seen order.
pub fn dedup_candidates(candidates: Vec<Url>) -> Vec<Url> {
    let mut seen: Vec<Url> = Vec::with_capacity(candidates.len());
    for c in candidates {
        if !seen.contains(&c) {
            seen.push(c);
        }
    }
    seen
}

/// The five authorization server metadata orderings, deduplicated:
///
/// 1. path-inserted `oauth-authorization-server`
/// 2. path-inserted `openid-configuration`
/// 3. path-appended `openid-configuration`
/// 4. root `oauth-authorization-server`
/// 5. root `openid-configuration`
pub fn all_auth_server_candidates(issuer: &Url) -> Vec<Url> {
    dedup_candidates(vec![
        oauth_metadata_url(issuer),
        openid_inserted_url(issuer),
        openid_appended_url(issuer),
        root_oauth_metadata_url(issuer),
        root_openid_url(issuer),
    ])
}

// ---------------------------------------------------------------------------
// Fetching
// ---------------------------------------------------------------------------

async fn fetch_first<T: serde::de::DeserializeOwned>(
    recorder: &mut Recorder<'_>,
    candidates: &[Url],
    what: &str,
) -> Result<(T, Url), Vec<String>> {
    let mut failures = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let response = match recorder.send(HttpRequest::get(candidate.clone())).await {
            Ok(r) => r,
            Err(e) => {
                failures.push(format!("{candidate}: {e}"));
                continue;
            }
        };

        if !response.is_success() {
            tracing::debug!(url = %candidate, status = response.status, "{what} candidate rejected");
            failures.push(format!("{candidate}: HTTP {}", response.status));
            continue;
        }

        match response.json::<T>() {
            Ok(doc) => return Ok((doc, candidate.clone())),
            Err(e) => failures.push(format!("{candidate}: malformed {what}: {e}")),
        }
    }
    Err(failures)
}

/// GETs the resource metadata candidates in order and returns the first
/// valid document with the URL that served it.
///
/// # Errors
///
/// Returns [`FlowError::Discovery`] when every candidate fails.
pub async fn fetch_resource_metadata(
    recorder: &mut Recorder<'_>,
    candidates: &[Url],
) -> FlowResult<(ResourceMetadata, Url)> {
    if candidates.is_empty() {
        return Err(FlowError::discovery("no resource metadata candidates to try"));
    }
    fetch_first::<ResourceMetadata>(recorder, candidates, "resource metadata")
        .await
        .map_err(|failures| {
            FlowError::discovery(format!(
                "protected resource metadata not found ({})",
                failures.join("; ")
            ))
        })
}

/// Picks the authorization server: the override if given, otherwise the
/// first advertised issuer.
///
/// # Errors
///
/// Returns [`FlowError::Discovery`] when the list is empty and no override
/// exists, or the chosen issuer is not a URL.
///
/// # Examples
///
/// ```
/// use authflow::auth::discovery::{select_authorization_server, ResourceMetadata};
///
/// let meta: ResourceMetadata = serde_json::from_str(r#"{
///     "resource": "https://mcp.example.com",
///     "authorization_servers": ["https://a.example", "https://b.example"]
/// }"#).unwrap();
/// let chosen = select_authorization_server(&meta, None).unwrap();
/// assert_eq!(chosen.as_str(), "https://a.example/");
/// ```
pub fn select_authorization_server(
    metadata: &ResourceMetadata,
    override_url: Option<&Url>,
) -> FlowResult<Url> {
    if let Some(chosen) = override_url {
        return Ok(chosen.clone());
    }
    let first = metadata.authorization_servers.first().ok_or_else(|| {
        FlowError::discovery(format!(
            "resource {} lists no authorization servers",
            metadata.resource
        ))
    })?;
    Url::parse(first)
        .map_err(|e| FlowError::discovery(format!("invalid authorization server {first}: {e}")))
}

/// GETs the authorization server metadata candidates in order.
///
/// When every candidate fails, `fallback` decides between a discovery
/// error and [`AuthServerMetadata::default_endpoints`].
///
/// # Errors
///
/// Returns [`FlowError::Discovery`] when no candidate answers and the
/// fallback policy is [`DiscoveryFallback::Fail`].
pub async fn fetch_auth_server_metadata(
    recorder: &mut Recorder<'_>,
    issuer: &Url,
    candidates: &[Url],
    fallback: DiscoveryFallback,
) -> FlowResult<(AuthServerMetadata, MetadataSource)> {
    match fetch_first::<AuthServerMetadata>(recorder, candidates, "authorization server metadata")
        .await
    {
        Ok((meta, url)) => Ok((meta, MetadataSource::for_url(&url))),
        Err(failures) => match fallback {
            DiscoveryFallback::DefaultEndpoints => {
                tracing::warn!(
                    issuer = %issuer,
                    "authorization server metadata not found, assuming default endpoints"
                );
                Ok((
                    AuthServerMetadata::default_endpoints(issuer),
                    MetadataSource::FallbackDefaults,
                ))
            }
            DiscoveryFallback::Fail => Err(FlowError::discovery(format!(
                "authorization server metadata not found for {issuer} ({})",
                failures.join("; ")
            ))),
        },
    }
}

/// Rejects servers that advertise PKCE methods without `S256`.
///
/// # Errors
///
/// Returns [`FlowError::Discovery`] when `S256` is missing from a present
/// `code_challenge_methods_supported`.
pub fn check_pkce_support(metadata: &AuthServerMetadata) -> FlowResult<()> {
    match &metadata.code_challenge_methods_supported {
        Some(methods) if methods.iter().any(|m| m == "S256") => Ok(()),
        Some(methods) => Err(FlowError::discovery(format!(
            "authorization server {} does not support S256 (advertises {:?})",
            metadata.issuer, methods
        ))),
        None => {
            tracing::warn!(
                issuer = %metadata.issuer,
                "authorization server does not advertise code_challenge_methods_supported; assuming S256"
            );
            Ok(())
        }
    }
}

/// Parses an endpoint advertised in metadata.
///
/// # Errors
///
/// Returns [`FlowError::Discovery`] for values that are not absolute URLs.
pub fn endpoint_url(name: &str, value: &str) -> FlowResult<Url> {
    Url::parse(value).map_err(|e| FlowError::discovery(format!("invalid {name} {value}: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
