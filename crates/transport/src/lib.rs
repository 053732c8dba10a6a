//! HTTP transport boundary for the Pitchside API client
//!
//! Defines the request model shared by every API call, the `Transport` trait
//! that performs a single dispatch, and the `RequestMiddleware` chain that
//! wraps it. Raw failures are normalized at this boundary into
//! `TransportFailure` and classified into the fixed `ErrorKind` taxonomy
//! before they reach callers.
//!
//! Call flow:
//! 1. Caller builds a `RequestDescriptor` and hands it to `Client::send`
//! 2. Each middleware (outermost first) intercepts and calls `Next::run`
//! 3. The end of the chain dispatches through the `Transport`
//! 4. Non-2xx/transport failures are classified into an `ApiError`

pub mod classify;
pub mod error;
pub mod http;
pub mod logging;
pub mod middleware;
pub mod request;

pub use classify::{ErrorKind, classify};
pub use error::{ApiError, TransportFailure, TransportSignal};
pub use http::{HeaderInjection, HttpTransport};
pub use logging::LoggingMiddleware;
pub use middleware::{Client, Next, RequestMiddleware};
pub use request::{ApiResponse, RequestDescriptor};

use std::future::Future;
use std::pin::Pin;

/// Boxed future used at dyn-compatible trait seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A single dispatch of a request to the backend.
///
/// Implementations must not retry, refresh, or classify: they return the
/// response for 2xx statuses and a normalized `TransportFailure` for
/// everything else. Uses `Pin<Box<dyn Future>>` return types so it can be
/// shared as `Arc<dyn Transport>`.
pub trait Transport: Send + Sync {
    fn send<'a>(
        &'a self,
        request: RequestDescriptor,
    ) -> BoxFuture<'a, Result<ApiResponse, TransportFailure>>;
}
