//! Token endpoint requests and the resulting [`TokenSet`]
//!
//! Both grants the flow uses are modelled as a [`TokenRequest`]: the
//! authorization code grant (with the PKCE verifier) and the refresh token
//! grant (without PKCE). A request is planned first and stored on the flow
//! snapshot, then executed by [`execute`], which classifies failures into
//! [`FlowError::TokenExchange`].

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::registration::ClientRegistration;
use crate::error::{FlowError, FlowResult, TokenErrorCode};
use crate::flow::capture::{Recorder, REDACTED};
use crate::transport::HttpRequest;

/// Seconds before the real expiry at which a token is treated as expired.
pub const EXPIRY_SKEW_SECS: i64 = 60;

// ---------------------------------------------------------------------------
// TokenSet
// ---------------------------------------------------------------------------

/// Tokens issued for one server.
///
/// # Examples
///
/// ```
/// use authflow::auth::token::TokenSet;
/// use chrono::{Duration, Utc};
///
/// let token = TokenSet {
///     access_token: "at".to_string(),
///     token_type: "Bearer".to_string(),
///     refresh_token: None,
///     expires_in: Some(3600),
///     scope: None,
///     client_id: "client".to_string(),
///     obtained_at: Utc::now(),
/// };
/// assert!(!token.is_expired());
///
/// let stale = TokenSet { obtained_at: Utc::now() - Duration::hours(2), ..token };
/// assert!(stale.is_expired());
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    /// The access token.
    pub access_token: String,
    /// Token type, normally `Bearer`.
    pub token_type: String,
    /// Refresh token, if issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds from `obtained_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    /// Granted scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// The client the tokens were issued to.
    pub client_id: String,
    /// When the token response was received.
    pub obtained_at: DateTime<Utc>,
}

impl TokenSet {
    /// Absolute expiry, if the server reported a lifetime.
    ///
    /// A lifetime too large to represent is treated as no lifetime.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.expires_in?).ok()?;
        self.obtained_at
            .checked_add_signed(Duration::try_seconds(secs)?)
    }

    /// `true` when the token expires within [`EXPIRY_SKEW_SECS`]. Tokens
    /// without a lifetime never expire.
    pub fn is_expired(&self) -> bool {
        match self.expires_at() {
            None => false,
            Some(at) => {
                let deadline = at
                    .checked_sub_signed(Duration::seconds(EXPIRY_SKEW_SECS))
                    .unwrap_or(at);
                Utc::now() >= deadline
            }
        }
    }

    /// `true` when a refresh token is available.
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }

    /// `Authorization` header value for the resource server.
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &REDACTED)
            .field("token_type", &self.token_type)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| REDACTED))
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .field("client_id", &self.client_id)
            .field("obtained_at", &self.obtained_at)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TokenRequest
// ---------------------------------------------------------------------------

/// Grant used by a [`TokenRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    /// `authorization_code` with PKCE.
    AuthorizationCode,
    /// `refresh_token`.
    RefreshToken,
}

impl GrantType {
    fn as_str(self) -> &'static str {
        match self {
            Self::AuthorizationCode => "authorization_code",
            Self::RefreshToken => "refresh_token",
        }
    }
}

/// A planned POST to the token endpoint.
///
/// Parameters are kept verbatim; `Debug` and `Serialize` mask secrets.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenRequest {
    /// Grant type.
    pub grant: GrantType,
    /// Token endpoint.
    pub endpoint: Url,
    /// Form parameters in send order.
    pub params: Vec<(String, String)>,
    /// Client the tokens will be issued to.
    pub client_id: String,
}

const SECRET_PARAMS: &[&str] = &["code", "code_verifier", "client_secret", "refresh_token"];

impl TokenRequest {
    /// Plans the authorization code exchange.
    ///
    /// # Examples
    ///
    /// ```
    /// use authflow::auth::registration::{ClientRegistration, RegistrationOrigin};
    /// use authflow::auth::token::TokenRequest;
    /// use chrono::Utc;
    /// use url::Url;
    ///
    /// let client = ClientRegistration {
    ///     client_id: "client".to_string(),
    ///     client_secret: None,
    ///     redirect_uris: vec!["http://127.0.0.1:8765/callback".to_string()],
    ///     origin: RegistrationOrigin::Dynamic,
    ///     registered_at: Utc::now(),
    /// };
    /// let req = TokenRequest::authorization_code(
    ///     Url::parse("https://as.example/token").unwrap(),
    ///     "the-code",
    ///     "http://127.0.0.1:8765/callback",
    ///     &client,
    ///     "the-verifier",
    ///     None,
    /// );
    /// assert_eq!(req.param("grant_type"), Some("authorization_code"));
    /// assert_eq!(req.param("client_secret"), None);
    /// ```
    pub fn authorization_code(
        endpoint: Url,
        code: &str,
        redirect_uri: &str,
        client: &ClientRegistration,
        code_verifier: &str,
        resource: Option<&Url>,
    ) -> Self {
        let mut params = vec![
            ("grant_type".to_string(), GrantType::AuthorizationCode.as_str().to_string()),
            ("code".to_string(), code.to_string()),
            ("redirect_uri".to_string(), redirect_uri.to_string()),
            ("client_id".to_string(), client.client_id.clone()),
            ("code_verifier".to_string(), code_verifier.to_string()),
        ];
        if let Some(secret) = &client.client_secret {
            params.push(("client_secret".to_string(), secret.clone()));
        }
        if let Some(resource) = resource {
            params.push(("resource".to_string(), resource.to_string()));
        }
        Self {
            grant: GrantType::AuthorizationCode,
            endpoint,
            params,
            client_id: client.client_id.clone(),
        }
    }

    /// Plans a refresh token grant. No PKCE parameters are sent.
    pub fn refresh(
        endpoint: Url,
        refresh_token: &str,
        client: &ClientRegistration,
        scope: Option<&str>,
        resource: Option<&Url>,
    ) -> Self {
        let mut params = vec![
            ("grant_type".to_string(), GrantType::RefreshToken.as_str().to_string()),
            ("refresh_token".to_string(), refresh_token.to_string()),
            ("client_id".to_string(), client.client_id.clone()),
        ];
        if let Some(secret) = &client.client_secret {
            params.push(("client_secret".to_string(), secret.clone()));
        }
        if let Some(scope) = scope {
            params.push(("scope".to_string(), scope.to_string()));
        }
        if let Some(resource) = resource {
            params.push(("resource".to_string(), resource.to_string()));
        }
        Self {
            grant: GrantType::RefreshToken,
            endpoint,
            params,
            client_id: client.client_id.clone(),
        }
    }

    /// First value of a form parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn redacted_params(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .map(|(k, v)| {
                if SECRET_PARAMS.contains(&k.as_str()) {
                    (k.clone(), REDACTED.to_string())
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect()
    }

    fn to_http(&self) -> HttpRequest {
        let pairs: Vec<(&str, &str)> = self
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        HttpRequest::post_form(self.endpoint.clone(), &pairs)
    }
}

impl fmt::Debug for TokenRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRequest")
            .field("grant", &self.grant)
            .field("endpoint", &self.endpoint.as_str())
            .field("params", &self.redacted_params())
            .finish()
    }
}

#[derive(Serialize)]
struct TokenRequestView<'a> {
    grant: GrantType,
    endpoint: &'a str,
    params: Vec<(String, String)>,
    client_id: &'a str,
}

impl Serialize for TokenRequest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        TokenRequestView {
            grant: self.grant,
            endpoint: self.endpoint.as_str(),
            params: self.redacted_params(),
            client_id: &self.client_id,
        }
        .serialize(serializer)
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

#[derive(Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

fn transport_failure(message: String) -> FlowError {
    FlowError::TokenExchange {
        code: TokenErrorCode::Transport,
        message,
        transient: true,
    }
}

/// Sends the planned request and converts the response.
///
/// # Errors
///
/// Returns [`FlowError::TokenExchange`]:
///
/// - transient with [`TokenErrorCode::Transport`] for network failures, 5xx,
///   and 429 responses without an OAuth error body;
/// - non-transient with the server's code for RFC 6749 error responses;
/// - non-transient for success responses without an `access_token`.
pub async fn execute(recorder: &mut Recorder<'_>, request: &TokenRequest) -> FlowResult<TokenSet> {
    let response = recorder
        .send(request.to_http())
        .await
        .map_err(|e| transport_failure(format!("token endpoint unreachable: {e}")))?;

    if !response.is_success() {
        let server_side = response.status >= 500 || response.status == 429;
        return Err(match response.json::<TokenErrorBody>() {
            Ok(body) => FlowError::TokenExchange {
                code: TokenErrorCode::from_oauth(&body.error),
                message: body
                    .error_description
                    .unwrap_or_else(|| format!("token endpoint returned {}", response.status)),
                transient: server_side,
            },
            Err(_) if server_side => {
                transport_failure(format!("token endpoint returned {}", response.status))
            }
            Err(_) => FlowError::TokenExchange {
                code: TokenErrorCode::Other(format!("http_{}", response.status)),
                message: format!("token endpoint returned {} without an OAuth error", response.status),
                transient: false,
            },
        });
    }

    let issued: TokenResponse = response.json().map_err(|e| FlowError::TokenExchange {
        code: TokenErrorCode::Other("invalid_response".to_string()),
        message: format!("malformed token response: {e}"),
        transient: false,
    })?;

    Ok(TokenSet {
        access_token: issued.access_token,
        token_type: issued.token_type,
        refresh_token: issued.refresh_token,
        expires_in: issued.expires_in,
        scope: issued.scope,
        client_id: request.client_id.clone(),
        obtained_at: Utc::now(),
    })
}

/// Keeps the previous refresh token when a refresh response omits one.
pub fn carry_refresh_token(mut fresh: TokenSet, previous: &TokenSet) -> TokenSet {
    if fresh.refresh_token.is_none() {
        fresh.refresh_token = previous.refresh_token.clone();
    }
    if fresh.scope.is_none() {
        fresh.scope = previous.scope.clone();
    }
    fresh
}
