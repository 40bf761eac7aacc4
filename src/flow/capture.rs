//! Request/response capture for flow introspection
//!
//! Every HTTP call a flow step makes goes through a [`Recorder`], which
//! forwards it to the [`HttpTransport`] and keeps an [`HttpExchange`]
//! describing exactly what was sent and received. Exchanges are appended to
//! the flow snapshot in call order, including the calls of failed steps.
//!
//! Raw exchanges keep secrets (bearer tokens, client secrets, PKCE
//! verifiers, authorization codes) because callers may need them to
//! diagnose a failure. Every externally displayed form -- `Debug`, the
//! `Serialize` output, and [`HttpExchange::redacted`] -- masks them.

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::flow::state::FlowStep;
use crate::transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport};

/// Replacement text for masked values.
pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
];

const SENSITIVE_FIELDS: &[&str] = &[
    "access_token",
    "refresh_token",
    "id_token",
    "client_secret",
    "code",
    "code_verifier",
    "registration_access_token",
];

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// What a step sent.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct RequestRecord {
    /// Request method.
    pub method: HttpMethod,
    /// Full request URL.
    pub url: String,
    /// Header name/value pairs in the order they were sent.
    pub headers: Vec<(String, String)>,
    /// Encoded request body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// What a step received.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct ResponseRecord {
    /// Status code.
    pub status: u16,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Body as text.
    pub body: String,
}

/// One request and its outcome.
///
/// `response` is `None` when the transport failed before any HTTP response
/// arrived; `transport_error` then says why.
#[derive(Clone, PartialEq, Eq)]
pub struct HttpExchange {
    /// The step whose work issued the call.
    pub step: FlowStep,
    /// When the request was sent.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration of the call.
    pub elapsed_ms: u64,
    /// The request as sent.
    pub request: RequestRecord,
    /// The response, if one was received.
    pub response: Option<ResponseRecord>,
    /// Transport failure message when no response was received.
    pub transport_error: Option<String>,
}

impl RequestRecord {
    fn from_request(request: &HttpRequest) -> Self {
        Self {
            method: request.method,
            url: request.url.to_string(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        }
    }

    /// Copy with sensitive headers, query parameters, and body fields
    /// masked.
    ///
    /// # Examples
    ///
    /// ```
    /// use authflow::flow::capture::RequestRecord;
    /// use authflow::transport::HttpMethod;
    ///
    /// let record = RequestRecord {
    ///     method: HttpMethod::Post,
    ///     url: "https://as.example/token".to_string(),
    ///     headers: vec![("Authorization".to_string(), "Bearer abc".to_string())],
    ///     body: Some("grant_type=authorization_code&code_verifier=xyz".to_string()),
    /// };
    /// let shown = record.redacted();
    /// assert_eq!(shown.headers[0].1, "Bearer [REDACTED]");
    /// assert_eq!(
    ///     shown.body.as_deref(),
    ///     Some("grant_type=authorization_code&code_verifier=%5BREDACTED%5D")
    /// );
    /// ```
    pub fn redacted(&self) -> Self {
        let content_type = self
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.as_str());
        Self {
            method: self.method,
            url: redact_url(&self.url),
            headers: redact_headers(&self.headers),
            body: self.body.as_deref().map(|b| redact_body(b, content_type)),
        }
    }
}

impl ResponseRecord {
    fn from_response(response: &HttpResponse) -> Self {
        Self {
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
        }
    }

    /// Copy with sensitive headers and body fields masked.
    pub fn redacted(&self) -> Self {
        let content_type = self
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.as_str());
        Self {
            status: self.status,
            headers: redact_headers(&self.headers),
            body: redact_body(&self.body, content_type),
        }
    }
}

impl HttpExchange {
    /// Copy safe to display or log.
    pub fn redacted(&self) -> Self {
        Self {
            step: self.step,
            started_at: self.started_at,
            elapsed_ms: self.elapsed_ms,
            request: self.request.redacted(),
            response: self.response.as_ref().map(ResponseRecord::redacted),
            transport_error: self.transport_error.clone(),
        }
    }

    /// Status code, if a response was received.
    pub fn status(&self) -> Option<u16> {
        self.response.as_ref().map(|r| r.status)
    }
}

impl fmt::Debug for RequestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = self.redacted();
        f.debug_struct("RequestRecord")
            .field("method", &shown.method)
            .field("url", &shown.url)
            .field("headers", &shown.headers)
            .field("body", &shown.body)
            .finish()
    }
}

impl fmt::Debug for ResponseRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = self.redacted();
        f.debug_struct("ResponseRecord")
            .field("status", &shown.status)
            .field("headers", &shown.headers)
            .field("body", &shown.body)
            .finish()
    }
}

impl fmt::Debug for HttpExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpExchange")
            .field("step", &self.step)
            .field("started_at", &self.started_at)
            .field("elapsed_ms", &self.elapsed_ms)
            .field("request", &self.request)
            .field("response", &self.response)
            .field("transport_error", &self.transport_error)
            .finish()
    }
}

#[derive(Serialize)]
struct ExchangeView<'a> {
    step: FlowStep,
    started_at: DateTime<Utc>,
    elapsed_ms: u64,
    request: RequestRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<ResponseRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transport_error: Option<&'a str>,
}

impl Serialize for HttpExchange {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        ExchangeView {
            step: self.step,
            started_at: self.started_at,
            elapsed_ms: self.elapsed_ms,
            request: self.request.redacted(),
            response: self.response.as_ref().map(ResponseRecord::redacted),
            transport_error: self.transport_error.as_deref(),
        }
        .serialize(serializer)
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Wraps a transport for the duration of one step and records each call.
pub struct Recorder<'a> {
    transport: &'a dyn HttpTransport,
    step: FlowStep,
    exchanges: Vec<HttpExchange>,
}

impl<'a> Recorder<'a> {
    /// Starts recording calls attributed to `step`.
    pub fn new(transport: &'a dyn HttpTransport, step: FlowStep) -> Self {
        Self {
            transport,
            step,
            exchanges: Vec::new(),
        }
    }

    /// Sends the request and records the exchange, successful or not.
    ///
    /// # Errors
    ///
    /// Propagates the transport error after recording it.
    pub async fn send(&mut self, request: HttpRequest) -> Result<HttpResponse> {
        let record = RequestRecord::from_request(&request);
        let started_at = Utc::now();
        let started = Instant::now();

        let outcome = self.transport.execute(request).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (response, transport_error) = match &outcome {
            Ok(resp) => (Some(ResponseRecord::from_response(resp)), None),
            Err(e) => (None, Some(e.to_string())),
        };

        tracing::debug!(
            step = %self.step,
            method = %record.method,
            url = %redact_url(&record.url),
            status = ?response.as_ref().map(|r| r.status),
            elapsed_ms,
            "captured exchange"
        );

        self.exchanges.push(HttpExchange {
            step: self.step,
            started_at,
            elapsed_ms,
            request: record,
            response,
            transport_error,
        });

        outcome
    }

    /// Number of calls recorded so far.
    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    /// `true` when no call was recorded.
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    /// Consumes the recorder, yielding the exchanges in call order.
    pub fn into_exchanges(self) -> Vec<HttpExchange> {
        self.exchanges
    }
}

// ---------------------------------------------------------------------------
// Redaction helpers
// ---------------------------------------------------------------------------

fn is_sensitive_field(name: &str) -> bool {
    SENSITIVE_FIELDS.iter().any(|f| f.eq_ignore_ascii_case(name))
}

fn redact_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            if SENSITIVE_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name)) {
                // Keep the auth scheme; it is useful and not secret.
                let masked = match value.split_once(' ') {
                    Some((scheme, _)) if name.eq_ignore_ascii_case("authorization") => {
                        format!("{scheme} {REDACTED}")
                    }
                    _ => REDACTED.to_string(),
                };
                (name.clone(), masked)
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}

fn redact_pairs(encoded: &str) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(url::form_urlencoded::parse(encoded.as_bytes()).map(|(k, v)| {
            if is_sensitive_field(&k) {
                (k.into_owned(), REDACTED.to_string())
            } else {
                (k.into_owned(), v.into_owned())
            }
        }))
        .finish()
}

fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut url) => {
            if let Some(query) = url.query().map(str::to_string) {
                url.set_query(Some(&redact_pairs(&query)));
            }
            url.to_string()
        }
        Err(_) => raw.to_string(),
    }
}

fn redact_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if is_sensitive_field(key) {
                    *v = serde_json::Value::String(REDACTED.to_string());
                } else {
                    redact_json(v);
                }
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(redact_json),
        _ => {}
    }
}

fn redact_body(body: &str, content_type: Option<&str>) -> String {
    let content_type = content_type.unwrap_or_default().to_ascii_lowercase();
    if content_type.starts_with("application/x-www-form-urlencoded") {
        return redact_pairs(body);
    }
    // JSON is the default for OAuth endpoints even when the server omits the
    // content type.
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(mut value) => {
            redact_json(&mut value);
            value.to_string()
        }
        Err(_) => body.to_string(),
    }
}
