//! Error types for authflow
//!
//! Two layers of errors live here:
//!
//! - [`AuthflowError`] -- crate-level failures (configuration, storage,
//!   transport plumbing) propagated through [`Result`] with `?`.
//! - [`FlowError`] -- categorized authorization failures recorded on a
//!   [`FlowState`](crate::flow::state::FlowState). These are domain values,
//!   not `Err` paths: a failed step leaves the flow in the `error`
//!   pseudo-state with the category attached so the caller can inspect it
//!   and retry.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for authflow operations
#[derive(Error, Debug)]
pub enum AuthflowError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No configuration or flow is registered for the server identifier
    #[error("Unknown server: {0}")]
    ServerNotFound(String),

    /// The requested operation is not valid for the flow's current step
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Redirect callback could not be parsed or routed
    #[error("Callback error: {0}")]
    Callback(String),

    /// HTTP transport failures below the HTTP layer (timeouts, refused
    /// connections, TLS errors)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Credential storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Keyring/credential storage errors
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// Result type alias for authflow operations
///
/// Uses `anyhow::Error` so callers get context chains and easy propagation.
pub type Result<T> = anyhow::Result<T>;

/// Result of a single flow step's work: either the step's product or the
/// categorized failure recorded on the snapshot.
pub type FlowResult<T> = std::result::Result<T, FlowError>;

// ---------------------------------------------------------------------------
// FlowError
// ---------------------------------------------------------------------------

/// Error code returned by an OAuth token endpoint (RFC 6749 section 5.2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenErrorCode {
    /// The code, refresh token, or PKCE verifier was rejected.
    InvalidGrant,
    /// Client authentication failed or the client is unknown.
    InvalidClient,
    /// The client is not allowed to use this grant type.
    UnauthorizedClient,
    /// The request is missing a parameter or is otherwise malformed.
    InvalidRequest,
    /// The grant type is not supported by the authorization server.
    UnsupportedGrantType,
    /// The requested scope is invalid or exceeds what was granted.
    InvalidScope,
    /// The request never produced an OAuth error body (network failure,
    /// timeout, 5xx, unparseable response).
    Transport,
    /// Any other error code reported by the server.
    Other(String),
}

impl TokenErrorCode {
    /// Maps the `error` field of a token endpoint error body to a code.
    ///
    /// # Examples
    ///
    /// ```
    /// use authflow::error::TokenErrorCode;
    ///
    /// assert_eq!(TokenErrorCode::from_oauth("invalid_grant"), TokenErrorCode::InvalidGrant);
    /// assert_eq!(
    ///     TokenErrorCode::from_oauth("slow_down"),
    ///     TokenErrorCode::Other("slow_down".to_string())
    /// );
    /// ```
    pub fn from_oauth(code: &str) -> Self {
        match code {
            "invalid_grant" => Self::InvalidGrant,
            "invalid_client" => Self::InvalidClient,
            "unauthorized_client" => Self::UnauthorizedClient,
            "invalid_request" => Self::InvalidRequest,
            "unsupported_grant_type" => Self::UnsupportedGrantType,
            "invalid_scope" => Self::InvalidScope,
            other => Self::Other(other.to_string()),
        }
    }

    /// The wire form of the code.
    pub fn as_str(&self) -> &str {
        match self {
            Self::InvalidGrant => "invalid_grant",
            Self::InvalidClient => "invalid_client",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::InvalidRequest => "invalid_request",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::InvalidScope => "invalid_scope",
            Self::Transport => "transport",
            Self::Other(code) => code,
        }
    }

    /// Human-readable next step for the person running the flow.
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::InvalidGrant => {
                "The authorization code or refresh token was rejected. It may have expired, \
                 been used already, or the PKCE verifier did not match. Reset the flow and \
                 authorize again."
            }
            Self::InvalidClient => {
                "The authorization server does not recognize this client. Reset the client \
                 registration (reset --scope client) and register again."
            }
            Self::UnauthorizedClient => {
                "This client is not permitted to use the authorization code grant. Check the \
                 grant types allowed for the client at the authorization server."
            }
            Self::InvalidRequest => "The token request was malformed. Check the client configuration.",
            Self::UnsupportedGrantType => "The authorization server does not support this grant type.",
            Self::InvalidScope => "The requested scope was rejected. Adjust the configured scope.",
            Self::Transport => {
                "The token endpoint could not be reached or returned a server error. Proceed \
                 again to retry."
            }
            Self::Other(_) => "The authorization server rejected the token request.",
        }
    }
}

impl std::fmt::Display for TokenErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categorized authorization failure recorded on a flow snapshot.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum FlowError {
    /// Probe, resource metadata, or authorization server metadata failure.
    #[error("Discovery error: {message}")]
    Discovery {
        /// What went wrong.
        message: String,
    },

    /// The registration endpoint rejected the client metadata, or no
    /// registration endpoint exists.
    #[error("Registration error: {message}")]
    Registration {
        /// What went wrong.
        message: String,
    },

    /// No callback arrived within the redirect timeout.
    #[error("Redirect timed out after {timeout_secs}s waiting for the authorization callback")]
    RedirectTimeout {
        /// The configured wait, in seconds.
        timeout_secs: u64,
    },

    /// The callback did not carry the `state` generated for this flow.
    #[error("Callback state mismatch: {message}")]
    CallbackStateMismatch {
        /// What went wrong.
        message: String,
    },

    /// The authorization server redirected back with an `error` parameter.
    #[error("Authorization denied: {error}{}", .description.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    AuthorizationDenied {
        /// The `error` query parameter.
        error: String,
        /// The `error_description` query parameter, if any.
        description: Option<String>,
    },

    /// Authorization code or refresh token exchange failed.
    #[error("Token exchange error [{code}]: {message}")]
    TokenExchange {
        /// Server-reported (or transport) error code.
        code: TokenErrorCode,
        /// The server's `error_description`, or a transport message.
        message: String,
        /// `true` when the failure is a network problem or server error
        /// that may succeed on a later attempt.
        transient: bool,
    },
}

impl FlowError {
    /// Builds a [`FlowError::Discovery`].
    pub fn discovery(message: impl Into<String>) -> Self {
        Self::Discovery {
            message: message.into(),
        }
    }

    /// Builds a [`FlowError::Registration`].
    pub fn registration(message: impl Into<String>) -> Self {
        Self::Registration {
            message: message.into(),
        }
    }

    /// Builds a [`FlowError::CallbackStateMismatch`].
    pub fn state_mismatch(message: impl Into<String>) -> Self {
        Self::CallbackStateMismatch {
            message: message.into(),
        }
    }

    /// Whether calling `proceed()` again may succeed without a `reset()`.
    ///
    /// # Examples
    ///
    /// ```
    /// use authflow::error::FlowError;
    ///
    /// assert!(FlowError::discovery("404").is_retryable());
    /// assert!(!FlowError::state_mismatch("forged").is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Discovery { .. }
            | Self::Registration { .. }
            | Self::RedirectTimeout { .. }
            | Self::AuthorizationDenied { .. } => true,
            Self::TokenExchange { transient, .. } => *transient,
            Self::CallbackStateMismatch { .. } => false,
        }
    }

    /// Short guidance string for display next to the error.
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::Discovery { .. } => {
                "Check that the server URL is correct and reachable, then proceed again."
            }
            Self::Registration { .. } => {
                "The authorization server rejected dynamic registration. Configure a \
                 preregistered client id or fix the client metadata, then proceed again."
            }
            Self::RedirectTimeout { .. } => {
                "Proceed again to open a new authorization request."
            }
            Self::CallbackStateMismatch { .. } => {
                "The callback may be forged or belong to another attempt. Reset the flow \
                 before trying again."
            }
            Self::AuthorizationDenied { .. } => {
                "Authorization was declined at the server. Proceed again to retry."
            }
            Self::TokenExchange { code, .. } => code.guidance(),
        }
    }
}
