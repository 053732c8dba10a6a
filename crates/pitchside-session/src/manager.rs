//! Session manager
//!
//! One `SessionManager` is built at process start and handed to everything
//! that needs the session: the UI layer reads `current_state` / `subscribe`
//! and calls the imperative actions, API callers use `client()`. Nothing
//! else touches the credential store directly.

use std::sync::Arc;

use pitchside_auth::{
    AuthApi, AuthSession, CredentialRecord, CredentialStore, Error as AuthError, KeyValueStore,
    RestoreOutcome, UserProfile,
};
use tokio::sync::watch;
use tracing::{info, warn};
use transport::{ApiError, Client, LoggingMiddleware, Transport};

use crate::pipeline::AuthMiddleware;
use crate::refresh::{RefreshCoordinator, RefreshOutcome};
use crate::state::{SessionEvent, SessionLifecycle, SessionState};

pub struct SessionManager {
    transport: Arc<dyn Transport>,
    store: Arc<CredentialStore>,
    lifecycle: Arc<SessionLifecycle>,
    auth: AuthApi,
    coordinator: RefreshCoordinator,
}

impl SessionManager {
    /// Build a manager in the `Restoring` state. Call `restore` next.
    pub fn new(transport: Arc<dyn Transport>, storage: Arc<dyn KeyValueStore>) -> Self {
        let store = Arc::new(CredentialStore::new(storage));
        let lifecycle = Arc::new(SessionLifecycle::new());
        let auth = AuthApi::new(transport.clone());
        let coordinator = RefreshCoordinator::new(store.clone(), auth.clone(), lifecycle.clone());
        Self {
            transport,
            store,
            lifecycle,
            auth,
            coordinator,
        }
    }

    /// Hydrate from durable storage. Never fails: unreadable or incomplete
    /// records leave the session signed out.
    pub fn restore(&self) -> RestoreOutcome {
        let outcome = self.store.restore();
        self.lifecycle.apply(SessionEvent::RestoreCompleted {
            complete: outcome == RestoreOutcome::Restored,
        });
        outcome
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<UserProfile, ApiError> {
        let session = self.auth.login(email, password).await?;
        Ok(self.establish(session, SessionEvent::LoggedIn))
    }

    pub async fn register(&self, profile: &serde_json::Value) -> Result<UserProfile, ApiError> {
        let session = self.auth.register(profile).await?;
        Ok(self.establish(session, SessionEvent::Registered))
    }

    /// Sign out locally. The backend keeps no session to revoke.
    pub fn logout(&self) {
        self.end_session(SessionEvent::LoggedOut);
    }

    /// Sign out after the backend confirmed the account was deleted.
    pub fn confirm_account_deletion(&self) {
        self.end_session(SessionEvent::AccountDeleted);
    }

    /// Shallow-merge `partial` into the signed-in user's profile.
    pub fn update_user(
        &self,
        partial: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<UserProfile, ApiError> {
        let user = match self.store.update_user(partial) {
            Ok(user) => user,
            Err(AuthError::Storage(e)) => {
                warn!(error = %e, "failed to persist profile update");
                self.store.user().ok_or(AuthError::NotAuthenticated)?
            }
            Err(e) => return Err(e.into()),
        };
        self.lifecycle.apply(SessionEvent::ProfileUpdated);
        Ok(user)
    }

    pub fn current_state(&self) -> SessionState {
        self.lifecycle.current()
    }

    /// Receiver woken once per externally visible transition.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.lifecycle.subscribe()
    }

    pub fn credentials(&self) -> CredentialRecord {
        self.store.get()
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.store.user()
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.is_authenticated()
    }

    /// Refresh the access token now, or join the refresh in flight.
    pub async fn refresh(&self) -> RefreshOutcome {
        self.coordinator.refresh().await
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// API client with request logging outermost and the auth pipeline
    /// directly above the transport.
    pub fn client(&self) -> Client {
        Client::new(self.transport.clone())
            .with(LoggingMiddleware::new())
            .with(AuthMiddleware::new(
                self.store.clone(),
                self.coordinator.clone(),
            ))
    }

    fn establish(&self, session: AuthSession, event: SessionEvent) -> UserProfile {
        let user = session.user.clone();
        if let Err(e) = self
            .store
            .set(session.user, session.access_token, session.refresh_token)
        {
            warn!(error = %e, "failed to persist new session");
        }
        info!(user_id = %user.id, ?event, "signed in");
        self.lifecycle.apply(event);
        user
    }

    fn end_session(&self, event: SessionEvent) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "failed to remove persisted session");
        }
        self.lifecycle.apply(event);
    }
}
