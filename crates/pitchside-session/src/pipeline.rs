//! Authenticated request pipeline
//!
//! `AuthMiddleware` attaches the current access token, and on a 401 asks
//! the refresh coordinator for a new one and replays the request exactly
//! once. A replayed request that fails again is surfaced as-is; it never
//! starts a second refresh.

use std::sync::Arc;

use pitchside_auth::CredentialStore;
use tracing::debug;
use transport::{ApiError, ApiResponse, BoxFuture, Next, RequestDescriptor, RequestMiddleware};

use crate::refresh::{RefreshCoordinator, RefreshOutcome};

pub struct AuthMiddleware {
    store: Arc<CredentialStore>,
    coordinator: RefreshCoordinator,
}

impl AuthMiddleware {
    pub fn new(store: Arc<CredentialStore>, coordinator: RefreshCoordinator) -> Self {
        Self { store, coordinator }
    }

    async fn dispatch(
        &self,
        request: RequestDescriptor,
        next: Next<'_>,
    ) -> Result<ApiResponse, ApiError> {
        // Public endpoints, and calls made while signed out, go out bare;
        // a 401 on them is the caller's problem, not an expiry.
        if request.anonymous {
            return next.run(request).await;
        }
        let Some(token) = self.store.access_token() else {
            return next.run(request).await;
        };

        let original = match next.run(request.clone().with_bearer(&token)).await {
            Err(e) if e.is_unauthorized() => e,
            other => return other,
        };

        debug!(method = %request.method, path = %request.path, "401 with bearer token, refreshing");
        match self.coordinator.refresh_after(Some(&token)).await {
            RefreshOutcome::Refreshed => {
                let Some(fresh) = self.store.access_token() else {
                    return Err(original);
                };
                debug!(path = %request.path, "replaying request with refreshed token");
                next.run(request.with_bearer(&fresh)).await
            }
            RefreshOutcome::Failed(failure) if failure.expires_session() => {
                Err(original.into_session_expired())
            }
            RefreshOutcome::Failed(failure) => {
                debug!(?failure, path = %request.path, "refresh failed, surfacing original 401");
                Err(original)
            }
        }
    }
}

impl RequestMiddleware for AuthMiddleware {
    fn id(&self) -> &str {
        "auth"
    }

    fn intercept<'a>(
        &'a self,
        request: RequestDescriptor,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<ApiResponse, ApiError>> {
        Box::pin(self.dispatch(request, next))
    }
}
