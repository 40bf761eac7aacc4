//! Redirect callback parsing and the loopback receiver
//!
//! A callback reaches the flow in one of two ways: the [`LoopbackListener`]
//! serves the redirect URI on localhost and captures the browser's request,
//! or the user pastes the redirected URL (`authflow callback <url>`) and it
//! is parsed with [`CallbackParams::parse`].

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::Uri;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use url::Url;

use crate::error::{AuthflowError, Result};

const SUCCESS_PAGE: &str = "<!doctype html><html><body>\
<h3>Authorization received.</h3><p>You can close this window and return to the terminal.</p>\
</body></html>";

const ERROR_PAGE: &str = "<!doctype html><html><body>\
<h3>Authorization was not completed.</h3><p>Return to the terminal for details.</p>\
</body></html>";

// ---------------------------------------------------------------------------
// CallbackParams
// ---------------------------------------------------------------------------

/// Query parameters of an authorization redirect.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct CallbackParams {
    /// Authorization code on success.
    #[serde(serialize_with = "serialize_redacted")]
    pub code: Option<String>,
    /// Echoed CSRF state.
    pub state: Option<String>,
    /// OAuth error code on failure.
    pub error: Option<String>,
    /// Human-readable error detail.
    pub error_description: Option<String>,
    /// When the callback was received.
    pub received_at: DateTime<Utc>,
}

fn serialize_redacted<S: serde::Serializer>(
    value: &Option<String>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(_) => serializer.serialize_some(crate::flow::capture::REDACTED),
        None => serializer.serialize_none(),
    }
}

impl CallbackParams {
    /// Extracts the parameters from an encoded query string.
    pub fn from_query(query: &str) -> Self {
        let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        let take = |name: &str| params.get(name).filter(|v| !v.is_empty()).cloned();
        Self {
            code: take("code"),
            state: take("state"),
            error: take("error"),
            error_description: take("error_description"),
            received_at: Utc::now(),
        }
    }

    /// Extracts the parameters from the redirected URL.
    ///
    /// # Examples
    ///
    /// ```
    /// use authflow::auth::callback::CallbackParams;
    /// use url::Url;
    ///
    /// let url = Url::parse("http://127.0.0.1:8765/callback?code=abc&state=xyz").unwrap();
    /// let params = CallbackParams::from_url(&url);
    /// assert_eq!(params.code.as_deref(), Some("abc"));
    /// assert_eq!(params.state.as_deref(), Some("xyz"));
    /// assert!(params.error.is_none());
    /// ```
    pub fn from_url(url: &Url) -> Self {
        Self::from_query(url.query().unwrap_or_default())
    }

    /// Parses either a full redirected URL or a bare query string.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::Callback`] when the input carries none of
    /// `code`, `state`, or `error`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let params = match Url::parse(raw) {
            Ok(url) => Self::from_url(&url),
            Err(_) => Self::from_query(raw.trim_start_matches('?')),
        };
        if params.code.is_none() && params.state.is_none() && params.error.is_none() {
            return Err(AuthflowError::Callback(
                "no code, state, or error parameter found in callback".to_string(),
            )
            .into());
        }
        Ok(params)
    }

    /// `true` when the server reported an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl fmt::Debug for CallbackParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackParams")
            .field("code", &self.code.as_ref().map(|_| "[REDACTED]"))
            .field("state", &self.state)
            .field("error", &self.error)
            .field("error_description", &self.error_description)
            .field("received_at", &self.received_at)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// LoopbackListener
// ---------------------------------------------------------------------------

type CallbackSlot = Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>;

/// One-shot HTTP receiver bound to the redirect URI's loopback address.
#[derive(Debug)]
pub struct LoopbackListener {
    listener: TcpListener,
    path: String,
}

impl LoopbackListener {
    /// Binds the host and port of `redirect_uri`.
    ///
    /// `localhost` binds `127.0.0.1`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::Callback`] for non-loopback hosts and
    /// [`AuthflowError::Io`] when the port is unavailable.
    pub async fn bind(redirect_uri: &Url) -> Result<Self> {
        let ip = match redirect_uri.host_str() {
            Some("localhost") => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Some(host) => host
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<IpAddr>()
                .map_err(|_| {
                    AuthflowError::Callback(format!("redirect host {host} is not a loopback address"))
                })?,
            None => {
                return Err(AuthflowError::Callback(format!(
                    "redirect URI {redirect_uri} has no host"
                ))
                .into())
            }
        };
        if !ip.is_loopback() {
            return Err(AuthflowError::Callback(format!(
                "redirect host {ip} is not a loopback address"
            ))
            .into());
        }
        let port = redirect_uri.port_or_known_default().unwrap_or(80);
        let listener = TcpListener::bind(SocketAddr::new(ip, port))
            .await
            .map_err(AuthflowError::Io)?;

        tracing::debug!(addr = %SocketAddr::new(ip, port), "callback listener bound");

        Ok(Self {
            listener,
            path: redirect_uri.path().to_string(),
        })
    }

    /// The bound address.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::Io`] if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(AuthflowError::Io)?)
    }

    /// Serves until one callback arrives or `timeout` elapses.
    ///
    /// Returns `None` on timeout.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::Io`] if the server fails.
    pub async fn wait_for_callback(self, timeout: Duration) -> Result<Option<CallbackParams>> {
        let (tx, rx) = oneshot::channel();
        let slot: CallbackSlot = Arc::new(Mutex::new(Some(tx)));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let app = Router::new()
            .route(&self.path, get(receive))
            .with_state(slot);

        let server = tokio::spawn(async move {
            axum::serve(self.listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        let outcome = tokio::time::timeout(timeout, rx).await;
        let _ = shutdown_tx.send(());
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(AuthflowError::Io(e).into()),
            Err(e) => {
                return Err(AuthflowError::Callback(format!("callback server task failed: {e}")).into())
            }
        }

        match outcome {
            Ok(Ok(params)) => Ok(Some(params)),
            Ok(Err(_)) => Err(AuthflowError::Callback("callback channel closed".to_string()).into()),
            Err(_) => Ok(None),
        }
    }
}

async fn receive(State(slot): State<CallbackSlot>, uri: Uri) -> Html<&'static str> {
    let params = CallbackParams::from_query(uri.query().unwrap_or_default());
    let page = if params.is_error() || params.code.is_none() {
        ERROR_PAGE
    } else {
        SUCCESS_PAGE
    };
    let sender = slot.lock().ok().and_then(|mut guard| guard.take());
    match sender {
        Some(tx) => {
            let _ = tx.send(params);
        }
        None => tracing::debug!("ignoring repeated callback request"),
    }
    Html(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_url_with_error() {
        let url = Url::parse(
            "http://127.0.0.1:8765/callback?error=access_denied&error_description=User+declined&state=s",
        )
        .unwrap();
        let params = CallbackParams::from_url(&url);
        assert!(params.is_error());
        assert_eq!(params.error.as_deref(), Some("access_denied"));
        assert_eq!(params.error_description.as_deref(), Some("User declined"));
        assert!(params.code.is_none());
    }

    #[test]
    fn test_parse_accepts_bare_query() {
        let params = CallbackParams::parse("?code=abc&state=xyz").unwrap();
        assert_eq!(params.code.as_deref(), Some("abc"));
    }

    #[test]
    fn test_parse_rejects_unrelated_url() {
        assert!(CallbackParams::parse("https://example.com/?foo=bar").is_err());
    }

    #[test]
    fn test_empty_values_are_absent() {
        let params = CallbackParams::from_query("code=&state=xyz");
        assert!(params.code.is_none());
    }

    #[test]
    fn test_debug_and_serialize_hide_code() {
        let params = CallbackParams::from_query("code=secret-code&state=xyz");
        assert!(!format!("{params:?}").contains("secret-code"));
        assert!(!serde_json::to_string(&params).unwrap().contains("secret-code"));
    }

    #[tokio::test]
    async fn test_bind_rejects_non_loopback_host() {
        let uri = Url::parse("http://example.com:8765/callback").unwrap();
        assert!(LoopbackListener::bind(&uri).await.is_err());
    }

    #[tokio::test]
    async fn test_listener_receives_callback() {
        let uri = Url::parse("http://127.0.0.1:0/callback").unwrap();
        let listener = LoopbackListener::bind(&uri).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let waiter = tokio::spawn(listener.wait_for_callback(Duration::from_secs(5)));
        let body = reqwest::get(format!("http://{addr}/callback?code=abc&state=xyz"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("Authorization received"));

        let params = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(params.code.as_deref(), Some("abc"));
        assert_eq!(params.state.as_deref(), Some("xyz"));
    }

    #[tokio::test]
    async fn test_listener_times_out() {
        let uri = Url::parse("http://127.0.0.1:0/callback").unwrap();
        let listener = LoopbackListener::bind(&uri).await.unwrap();
        let result = listener
            .wait_for_callback(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
