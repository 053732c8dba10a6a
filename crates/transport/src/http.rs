//! reqwest-backed transport
//!
//! Joins the configured base URL with the descriptor's path and query,
//! injects static headers from config, and normalizes every failure into a
//! `TransportFailure`: non-2xx statuses keep the backend's message, reqwest
//! timeouts become `Timeout`, connect/request errors become `Network`.

use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;
use reqwest::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use tracing::{debug, warn};

use crate::error::TransportFailure;
use crate::request::{ApiResponse, RequestDescriptor};
use crate::{BoxFuture, Transport};

/// Maximum length of a response body carried in a failure message.
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Header injection rule (name + value pair from config).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

/// HTTP transport over a shared `reqwest::Client`.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl HttpTransport {
    /// Invalid header rules are skipped with a warning, and a rule naming
    /// `Authorization` is refused: the bearer credential belongs to the
    /// session pipeline alone.
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        timeout: Duration,
        injections: &[HeaderInjection],
    ) -> Self {
        let mut headers = Vec::with_capacity(injections.len());
        for injection in injections {
            let name = match HeaderName::from_str(&injection.name) {
                Ok(n) => n,
                Err(e) => {
                    warn!(header = %injection.name, error = %e, "skipping invalid header name");
                    continue;
                }
            };
            if name == reqwest::header::AUTHORIZATION {
                warn!(header = %injection.name, "refusing to inject authorization header from config");
                continue;
            }
            let value = match HeaderValue::from_str(&injection.value) {
                Ok(v) => v,
                Err(e) => {
                    warn!(header = %injection.name, error = %e, "skipping invalid header value");
                    continue;
                }
            };
            headers.push((name, value));
        }

        Self {
            client,
            base_url: base_url.into(),
            timeout,
            headers,
        }
    }

    fn url_for(&self, request: &RequestDescriptor) -> Result<Url, TransportFailure> {
        let raw = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            request.path.trim_start_matches('/')
        );
        let mut url = Url::parse(&raw)
            .map_err(|e| TransportFailure::other(format!("invalid request url {raw}: {e}")))?;
        if !request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &request.query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    async fn dispatch(&self, request: RequestDescriptor) -> Result<ApiResponse, TransportFailure> {
        let url = self.url_for(&request)?;

        let mut headers = request.headers.clone();
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .headers(headers)
            .timeout(self.timeout);
        if let Some(body) = &request.body {
            let bytes = serde_json::to_vec(body)
                .map_err(|e| TransportFailure::other(format!("serializing request body: {e}")))?;
            builder = builder
                .header(CONTENT_TYPE, "application/json")
                .body(bytes);
        }

        let response = builder.send().await.map_err(normalize_error)?;
        let status = response.status();
        let resp_headers = response.headers().clone();
        let body = response.bytes().await.map_err(normalize_error)?;

        if status.is_success() {
            debug!(method = %request.method, path = %request.path, status = status.as_u16(), "request succeeded");
            return Ok(ApiResponse {
                status: status.as_u16(),
                headers: resp_headers,
                body,
            });
        }

        let text = String::from_utf8_lossy(&body).into_owned();
        let message = backend_message(&text).unwrap_or_else(|| {
            if text.trim().is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                truncate_body(&text)
            }
        });
        Err(TransportFailure::http(status.as_u16(), message).with_body(truncate_body(&text)))
    }
}

impl Transport for HttpTransport {
    fn send<'a>(
        &'a self,
        request: RequestDescriptor,
    ) -> BoxFuture<'a, Result<ApiResponse, TransportFailure>> {
        Box::pin(self.dispatch(request))
    }
}

/// Map a reqwest error onto the transport signal taxonomy.
fn normalize_error(e: reqwest::Error) -> TransportFailure {
    let failure = if e.is_timeout() {
        TransportFailure::timeout(format!("request timed out: {e}"))
    } else if e.is_connect() || e.is_request() {
        TransportFailure::network(format!("network error: {e}"))
    } else {
        TransportFailure::other(format!("transport error: {e}"))
    };
    failure.with_cause(e)
}

/// Extract the human-readable message from a backend error envelope.
///
/// Recognizes `{"message": "..."}` and `{"error": {"message": "..."}}` as
/// well as `{"error": "..."}`.
fn backend_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    if let Some(msg) = value.get("message").and_then(|m| m.as_str()) {
        return Some(msg.to_string());
    }
    match value.get("error")? {
        serde_json::Value::String(msg) => Some(msg.clone()),
        serde_json::Value::Object(obj) => obj
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string),
        _ => None,
    }
}

/// Truncate a response body to avoid carrying excessive data in errors.
fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}... (truncated, {} total bytes)",
        &body[..end],
        body.len()
    )
}
