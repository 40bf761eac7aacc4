//! HTTP transport abstraction
//!
//! Every discovery, registration, and token call made by the flow goes
//! through the [`HttpTransport`] trait. The trait is deliberately generic
//! (`request(method, url, headers, body) -> {status, headers, body}`) so that
//! proxying, custom TLS, or test doubles stay invisible to the state
//! machine.
//!
//! - [`http::ReqwestTransport`] -- production implementation backed by
//!   `reqwest` with a per-call timeout.
//!
//! # Canonical Import Path
//!
//! ```no_run
//! use authflow::transport::{HttpRequest, HttpResponse, HttpTransport};
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Result;

pub mod http;

/// HTTP methods used by the authorization flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// `GET`
    Get,
    /// `POST`
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => f.write_str("GET"),
            Self::Post => f.write_str("POST"),
        }
    }
}

/// A fully materialized outbound request.
///
/// The body is kept as a string so it can be captured verbatim for
/// inspection; the helpers set the matching `Content-Type`.
#[derive(Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Request method.
    pub method: HttpMethod,
    /// Absolute target URL.
    pub url: Url,
    /// Header name/value pairs in insertion order.
    pub headers: Vec<(String, String)>,
    /// Encoded request body, if any.
    pub body: Option<String>,
}

impl HttpRequest {
    /// A `GET` request that accepts JSON.
    ///
    /// # Examples
    ///
    /// ```
    /// use authflow::transport::{HttpMethod, HttpRequest};
    /// use url::Url;
    ///
    /// let req = HttpRequest::get(Url::parse("https://as.example/.well-known/oauth-authorization-server").unwrap());
    /// assert_eq!(req.method, HttpMethod::Get);
    /// assert_eq!(req.header("accept"), Some("application/json"));
    /// ```
    pub fn get(url: Url) -> Self {
        Self {
            method: HttpMethod::Get,
            url,
            headers: vec![("Accept".to_string(), "application/json".to_string())],
            body: None,
        }
    }

    /// A `POST` with an `application/x-www-form-urlencoded` body.
    pub fn post_form(url: Url, params: &[(&str, &str)]) -> Self {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter())
            .finish();
        Self {
            method: HttpMethod::Post,
            url,
            headers: vec![
                (
                    "Content-Type".to_string(),
                    "application/x-www-form-urlencoded".to_string(),
                ),
                ("Accept".to_string(), "application/json".to_string()),
            ],
            body: Some(body),
        }
    }

    /// A `POST` with a JSON body.
    pub fn post_json(url: Url, body: &serde_json::Value) -> Result<Self> {
        Ok(Self {
            method: HttpMethod::Post,
            url,
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
            ],
            body: Some(serde_json::to_string(body)?),
        })
    }

    /// Appends a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Case-insensitive header lookup (first match).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print raw headers or bodies; they may carry secrets.
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers.len())
            .field("body_len", &self.body.as_ref().map(String::len))
            .finish()
    }
}

/// A response as seen by the flow.
#[derive(Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Response body decoded as text.
    pub body: String,
}

impl HttpResponse {
    /// `true` for 2xx status codes.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup (first match).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Deserializes the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers.len())
            .field("body_len", &self.body.len())
            .finish()
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Abstraction over the HTTP client used by every flow step.
///
/// Implementations must not retry on their own: a failure is reported once
/// and the flow decides what happens next.
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync + fmt::Debug {
    /// Executes the request and returns the response, whatever its status.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::AuthflowError::Transport`] when no HTTP
    /// response was obtained (timeout, connection failure, TLS error).
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}
