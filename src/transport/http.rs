//! `reqwest`-backed [`HttpTransport`]
//!
//! A single [`reqwest::Client`] is built with the configured per-call timeout
//! and user agent, and shared by every flow. Redirects are not followed: a
//! well-known endpoint answering with a redirect is reported as such in the
//! captured exchange rather than silently chased.

use std::time::Duration;

use crate::error::{AuthflowError, Result};
use crate::transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport};

/// Default per-call timeout for discovery, registration, and token calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Production HTTP transport.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use authflow::transport::http::ReqwestTransport;
///
/// let transport = ReqwestTransport::new(Duration::from_secs(5), "authflow/0.1").unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestTransport {
    /// Builds a transport with the given per-call timeout and user agent.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::Http`] if the TLS backend cannot be
    /// initialised.
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(AuthflowError::Http)?;
        Ok(Self { client, timeout })
    }

    /// Wraps an existing client, e.g. one configured with a proxy.
    pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };

        let mut builder = self.client.request(method, request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        tracing::debug!(method = %request.method, url = %request.url, "sending request");

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AuthflowError::Transport(format!(
                    "request to {} timed out after {}s",
                    request.url,
                    self.timeout.as_secs()
                ))
            } else {
                AuthflowError::Transport(format!("request to {} failed: {e}", request.url))
            }
        })?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = resp.text().await.map_err(|e| {
            AuthflowError::Transport(format!("failed to read body from {}: {e}", request.url))
        })?;

        tracing::debug!(status, url = %request.url, "received response");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_builds_client() {
        let transport = ReqwestTransport::new(Duration::from_secs(3), "authflow-test");
        assert!(transport.is_ok());
        assert_eq!(transport.unwrap().timeout, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let transport = ReqwestTransport::new(Duration::from_secs(2), "authflow-test").unwrap();
        // Port 9 (discard) on localhost is almost never listening.
        let req = HttpRequest::get(url::Url::parse("http://127.0.0.1:9/").unwrap());
        let err = transport.execute(req).await.unwrap_err();
        let err = err.downcast::<AuthflowError>().unwrap();
        assert!(matches!(err, AuthflowError::Transport(_)));
    }
}
