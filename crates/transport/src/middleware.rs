//! Explicit request middleware chain
//!
//! Middlewares are composed once, at client construction time, in the order
//! they are added: the first one added sees the request first and the
//! response last. The end of the chain dispatches through the `Transport`
//! and classifies raw failures into `ApiError`.

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::error::{ApiError, TransportFailure};
use crate::request::{ApiResponse, RequestDescriptor};
use crate::{BoxFuture, Transport};

/// A decorator around request dispatch.
///
/// `intercept` may inspect or rewrite the descriptor, call `next.run` zero
/// or more times, and rewrite the result. `Next` is `Copy`, so replaying a
/// request is a second `next.run(...)`.
pub trait RequestMiddleware: Send + Sync {
    /// Identifier for logging (e.g. "logging", "auth")
    fn id(&self) -> &str;

    fn intercept<'a>(
        &'a self,
        request: RequestDescriptor,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<ApiResponse, ApiError>>;
}

/// The remainder of the chain after the current middleware.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    transport: &'a dyn Transport,
    middlewares: &'a [Arc<dyn RequestMiddleware>],
}

impl<'a> Next<'a> {
    pub fn run(self, request: RequestDescriptor) -> BoxFuture<'a, Result<ApiResponse, ApiError>> {
        match self.middlewares.split_first() {
            Some((middleware, rest)) => middleware.intercept(
                request,
                Next {
                    transport: self.transport,
                    middlewares: rest,
                },
            ),
            None => {
                let transport = self.transport;
                Box::pin(async move { transport.send(request).await.map_err(ApiError::from) })
            }
        }
    }
}

/// API client: a transport plus an explicitly ordered middleware chain.
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    middlewares: Vec<Arc<dyn RequestMiddleware>>,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            middlewares: Vec::new(),
        }
    }

    /// Append a middleware. Earlier middlewares wrap later ones.
    pub fn with(mut self, middleware: impl RequestMiddleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Middleware ids in chain order, outermost first.
    pub fn middleware_ids(&self) -> Vec<&str> {
        self.middlewares.iter().map(|m| m.id()).collect()
    }

    pub async fn send(&self, request: RequestDescriptor) -> Result<ApiResponse, ApiError> {
        Next {
            transport: self.transport.as_ref(),
            middlewares: &self.middlewares,
        }
        .run(request)
        .await
    }

    /// Send and decode a JSON body. Undecodable bodies surface as `Unknown`.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestDescriptor,
    ) -> Result<T, ApiError> {
        let path = request.path.clone();
        let response = self.send(request).await?;
        response.json::<T>().map_err(|e| {
            ApiError::from(
                TransportFailure::other(format!("invalid response body from {path}: {e}"))
                    .with_cause(e),
            )
        })
    }
}
