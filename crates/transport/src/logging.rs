//! Request logging and metrics middleware
//!
//! Assigns every logical request an `x-request-id` and records its outcome.
//! Placed outermost in the chain, so a request replayed after a token
//! refresh is still logged (and counted) once.

use std::time::Instant;

use reqwest::header::{HeaderName, HeaderValue};
use tracing::{Instrument, debug, info_span, warn};

use crate::error::ApiError;
use crate::middleware::{Next, RequestMiddleware};
use crate::request::{ApiResponse, RequestDescriptor};
use crate::BoxFuture;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Default, Clone)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

impl RequestMiddleware for LoggingMiddleware {
    fn id(&self) -> &str {
        "logging"
    }

    fn intercept<'a>(
        &'a self,
        request: RequestDescriptor,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<ApiResponse, ApiError>> {
        let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());
        let method = request.method.to_string();
        let path = request.path.clone();
        let span = info_span!("api_request", request_id = %request_id, method = %method, path = %path);

        let request = match HeaderValue::from_str(&request_id) {
            Ok(value) => request.with_header(HeaderName::from_static(REQUEST_ID_HEADER), value),
            Err(_) => request,
        };

        Box::pin(
            async move {
                let started = Instant::now();
                let result = next.run(request).await;
                let elapsed = started.elapsed().as_secs_f64();

                match &result {
                    Ok(response) => {
                        debug!(status = response.status, elapsed_secs = elapsed, "request completed");
                        record_request(response.status, &method, elapsed);
                    }
                    Err(err) => {
                        warn!(
                            kind = err.kind.label(),
                            status = err.http_status,
                            error = %err.message,
                            elapsed_secs = elapsed,
                            "request failed"
                        );
                        record_request(err.http_status.unwrap_or(0), &method, elapsed);
                        record_error(err);
                    }
                }
                result
            }
            .instrument(span),
        )
    }
}

/// Record a completed request with status code and HTTP method labels.
/// Status 0 means no HTTP response was received.
fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("api_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("api_request_duration_seconds", "status" => status_str).record(duration_secs);
}

fn record_error(err: &ApiError) {
    metrics::counter!("api_errors_total", "kind" => err.kind.label()).increment(1);
}
