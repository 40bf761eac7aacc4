//! Authorization redirect: URL construction and browser hand-off
//!
//! The flow never drives a browser itself. It builds the authorize URL and
//! hands it to a [`BrowserLauncher`], then parks until a callback arrives.

use std::io::Write as _;

use url::Url;

use crate::auth::pkce::{PendingPkce, CHALLENGE_METHOD};
use crate::auth::registration::ClientRegistration;
use crate::error::{AuthflowError, Result};

/// Parameters of one authorization request.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizeParams<'a> {
    /// The server's authorization endpoint.
    pub authorization_endpoint: &'a str,
    /// Client identity.
    pub client: &'a ClientRegistration,
    /// Redirect URI registered for the client.
    pub redirect_uri: &'a str,
    /// Requested scope.
    pub scope: Option<&'a str>,
    /// PKCE challenge and CSRF state.
    pub pkce: &'a PendingPkce,
    /// RFC 8707 resource indicator, on versions that send one.
    pub resource: Option<&'a Url>,
}

/// Builds the authorization URL.
///
/// Existing query parameters on the endpoint are preserved.
///
/// # Errors
///
/// Returns [`AuthflowError::Url`] if the endpoint is not an absolute URL.
///
/// # Examples
///
/// ```
/// use authflow::auth::pkce::PendingPkce;
/// use authflow::auth::redirect::{build_authorize_url, AuthorizeParams};
/// use authflow::auth::registration::{ClientRegistration, RegistrationOrigin};
/// use chrono::Utc;
/// use uuid::Uuid;
///
/// let client = ClientRegistration {
///     client_id: "client".to_string(),
///     client_secret: None,
///     redirect_uris: vec![],
///     origin: RegistrationOrigin::Preregistered,
///     registered_at: Utc::now(),
/// };
/// let pkce = PendingPkce::generate(Uuid::new_v4());
/// let url = build_authorize_url(&AuthorizeParams {
///     authorization_endpoint: "https://as.example/authorize",
///     client: &client,
///     redirect_uri: "http://127.0.0.1:8765/callback",
///     scope: Some("files:read"),
///     pkce: &pkce,
///     resource: None,
/// })
/// .unwrap();
/// assert!(url.as_str().contains("code_challenge_method=S256"));
/// ```
pub fn build_authorize_url(params: &AuthorizeParams<'_>) -> Result<Url> {
    let mut url = Url::parse(params.authorization_endpoint).map_err(AuthflowError::Url)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("response_type", "code");
        query.append_pair("client_id", &params.client.client_id);
        query.append_pair("redirect_uri", params.redirect_uri);
        if let Some(scope) = params.scope {
            query.append_pair("scope", scope);
        }
        query.append_pair("state", &params.pkce.state);
        query.append_pair("code_challenge", &params.pkce.code_challenge);
        query.append_pair("code_challenge_method", CHALLENGE_METHOD);
        if let Some(resource) = params.resource {
            query.append_pair("resource", resource.as_str());
        }
    }
    Ok(url)
}

// ---------------------------------------------------------------------------
// BrowserLauncher
// ---------------------------------------------------------------------------

/// Opens the authorization URL for the user.
#[cfg_attr(test, mockall::automock)]
pub trait BrowserLauncher: Send + Sync {
    /// Presents `url` to the user.
    ///
    /// # Errors
    ///
    /// Implementations report failures they cannot recover from; the flow
    /// records them but still parks, since the user may open the URL by
    /// hand.
    fn open(&self, url: &Url) -> Result<()>;
}

/// Prints the URL to stderr and tries the platform's URL opener.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &Url) -> Result<()> {
        print_url(url);

        #[cfg(target_os = "macos")]
        let spawned = std::process::Command::new("open").arg(url.as_str()).spawn();
        #[cfg(target_os = "windows")]
        let spawned = std::process::Command::new("cmd")
            .args(["/C", "start", "", url.as_str()])
            .spawn();
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        let spawned = std::process::Command::new("xdg-open").arg(url.as_str()).spawn();

        if let Err(e) = spawned {
            tracing::warn!("could not open a browser ({e}); open the URL manually");
        }
        Ok(())
    }
}

/// Only prints the URL; for headless hosts and `--no-browser`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrintOnlyLauncher;

impl BrowserLauncher for PrintOnlyLauncher {
    fn open(&self, url: &Url) -> Result<()> {
        print_url(url);
        Ok(())
    }
}

fn print_url(url: &Url) {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(
        stderr,
        "Open the following URL in your browser to authorize:\n{url}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::registration::RegistrationOrigin;
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn client() -> ClientRegistration {
        ClientRegistration {
            client_id: "client-1".to_string(),
            client_secret: Some("never-in-url".to_string()),
            redirect_uris: vec![],
            origin: RegistrationOrigin::Dynamic,
            registered_at: Utc::now(),
        }
    }

    fn query(url: &Url) -> HashMap<String, String> {
        url.query_pairs().into_owned().collect()
    }

    #[test]
    fn test_build_authorize_url_contains_required_params() {
        let pkce = PendingPkce::generate(Uuid::new_v4());
        let resource = Url::parse("https://mcp.example.com/mcp").unwrap();
        let client = client();
        let url = build_authorize_url(&AuthorizeParams {
            authorization_endpoint: "https://as.example/authorize",
            client: &client,
            redirect_uri: "http://127.0.0.1:8765/callback",
            scope: Some("a b"),
            pkce: &pkce,
            resource: Some(&resource),
        })
        .unwrap();

        let q = query(&url);
        assert_eq!(q["response_type"], "code");
        assert_eq!(q["client_id"], "client-1");
        assert_eq!(q["redirect_uri"], "http://127.0.0.1:8765/callback");
        assert_eq!(q["scope"], "a b");
        assert_eq!(q["state"], pkce.state);
        assert_eq!(q["code_challenge"], pkce.code_challenge);
        assert_eq!(q["code_challenge_method"], "S256");
        assert_eq!(q["resource"], "https://mcp.example.com/mcp");
        assert!(!url.as_str().contains("never-in-url"));
        assert!(!url.as_str().contains(&pkce.code_verifier));
    }

    #[test]
    fn test_build_authorize_url_omits_optional_params() {
        let pkce = PendingPkce::generate(Uuid::new_v4());
        let client = client();
        let url = build_authorize_url(&AuthorizeParams {
            authorization_endpoint: "https://as.example/authorize?tenant=x",
            client: &client,
            redirect_uri: "http://127.0.0.1:8765/callback",
            scope: None,
            pkce: &pkce,
            resource: None,
        })
        .unwrap();
        let q = query(&url);
        assert_eq!(q["tenant"], "x");
        assert!(!q.contains_key("scope"));
        assert!(!q.contains_key("resource"));
    }

    #[test]
    fn test_build_authorize_url_rejects_relative_endpoint() {
        let pkce = PendingPkce::generate(Uuid::new_v4());
        let client = client();
        let result = build_authorize_url(&AuthorizeParams {
            authorization_endpoint: "/authorize",
            client: &client,
            redirect_uri: "http://127.0.0.1:8765/callback",
            scope: None,
            pkce: &pkce,
            resource: None,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_mock_launcher_receives_url() {
        let mut launcher = MockBrowserLauncher::new();
        launcher
            .expect_open()
            .withf(|url| url.host_str() == Some("as.example"))
            .times(1)
            .returning(|_| Ok(()));
        launcher
            .open(&Url::parse("https://as.example/authorize").unwrap())
            .unwrap();
    }
}
