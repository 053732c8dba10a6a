//! Single-flight token refresh
//!
//! At most one refresh call is outstanding at any time. The first caller
//! spawns the refresh as a tokio task and parks a `Shared` handle to it in
//! the coordinator; every caller that arrives while it runs awaits the same
//! handle and observes the same outcome.
//!
//! The task owns the whole cycle: network call, credential update, and
//! forced expiry. All of it is applied before the shared handle resolves,
//! so a released waiter always sees the rotated token (or the signed-out
//! state). Dropping a waiter never cancels the task.

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use pitchside_auth::{AuthApi, CredentialStore, Error as AuthError};
use tracing::{debug, error, info, warn};
use transport::{ErrorKind, classify};

use crate::metrics;
use crate::state::{SessionEvent, SessionLifecycle};

/// Settled result of a refresh cycle, shared by every waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    Failed(RefreshFailure),
}

impl RefreshOutcome {
    pub fn is_refreshed(&self) -> bool {
        matches!(self, RefreshOutcome::Refreshed)
    }

    fn label(&self) -> &'static str {
        match self {
            RefreshOutcome::Refreshed => "refreshed",
            RefreshOutcome::Failed(f) => f.label(),
        }
    }
}

/// Why a refresh cycle did not produce a new access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    /// No refresh token stored; the session was expired
    MissingRefreshToken,
    /// Backend rejected the refresh token (401/403); the session was expired
    Rejected { status: u16 },
    /// Network, timeout, 5xx: credentials left untouched
    Transient { kind: ErrorKind, message: String },
    /// 2xx without a usable access token: credentials left untouched
    MalformedResponse(String),
    /// The session the refresh started for was cleared or replaced while
    /// the call was in flight; store and lifecycle were left untouched
    SessionChanged,
    /// The refresh task panicked or was cancelled by runtime shutdown
    Aborted,
}

impl RefreshFailure {
    /// True iff this failure cleared the credentials and expired the session.
    pub fn expires_session(&self) -> bool {
        matches!(
            self,
            RefreshFailure::MissingRefreshToken | RefreshFailure::Rejected { .. }
        )
    }

    fn label(&self) -> &'static str {
        match self {
            RefreshFailure::MissingRefreshToken => "missing_refresh_token",
            RefreshFailure::Rejected { .. } => "rejected",
            RefreshFailure::Transient { .. } => "transient",
            RefreshFailure::MalformedResponse(_) => "malformed_response",
            RefreshFailure::SessionChanged => "session_changed",
            RefreshFailure::Aborted => "aborted",
        }
    }
}

type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct InFlight {
    generation: u64,
    future: SharedRefresh,
}

#[derive(Default)]
struct Slot {
    next_generation: u64,
    in_flight: Option<InFlight>,
}

struct Inner {
    store: Arc<CredentialStore>,
    auth: AuthApi,
    lifecycle: Arc<SessionLifecycle>,
    slot: Mutex<Slot>,
}

/// Deduplicates concurrent refresh requests into one network call.
///
/// Clones share the same in-flight slot.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        auth: AuthApi,
        lifecycle: Arc<SessionLifecycle>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                auth,
                lifecycle,
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    /// Refresh now, or join the refresh already in flight.
    pub async fn refresh(&self) -> RefreshOutcome {
        self.refresh_after(None).await
    }

    /// Refresh because `stale_token` stopped working.
    ///
    /// If the store already holds a different access token, a refresh that
    /// settled after `stale_token` was read has already replaced it; the
    /// caller can retry with the current token without another call.
    pub async fn refresh_after(&self, stale_token: Option<&str>) -> RefreshOutcome {
        let future = {
            let mut slot = self.lock_slot();
            let already_rotated = stale_token.is_some_and(|stale| {
                self.inner
                    .store
                    .access_token()
                    .is_some_and(|current| current != stale)
            });
            if let Some(in_flight) = &slot.in_flight {
                debug!(generation = in_flight.generation, "joining in-flight refresh");
                in_flight.future.clone()
            } else if already_rotated {
                debug!("access token already rotated, skipping refresh");
                return RefreshOutcome::Refreshed;
            } else {
                let generation = slot.next_generation;
                slot.next_generation += 1;
                let future = self.start(generation);
                slot.in_flight = Some(InFlight {
                    generation,
                    future: future.clone(),
                });
                future
            }
        };
        future.await
    }

    /// True while a refresh cycle is running.
    pub fn is_in_flight(&self) -> bool {
        self.lock_slot().in_flight.is_some()
    }

    /// Spawn the refresh task. Called with the slot lock held; the task's
    /// guard takes the same lock, so it cannot clear the slot before it is
    /// filled.
    fn start(&self, generation: u64) -> SharedRefresh {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let _guard = SlotGuard {
                inner: inner.clone(),
                generation,
            };
            let outcome = execute(&inner).await;
            metrics::record_refresh(outcome.label());
            outcome
        });

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "refresh task did not complete");
                    RefreshOutcome::Failed(RefreshFailure::Aborted)
                }
            }
        }
        .boxed()
        .shared()
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Discards the in-flight slot when the refresh task ends, including on
/// panic, so the next 401 starts a fresh cycle.
struct SlotGuard {
    inner: Arc<Inner>,
    generation: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slot = self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot
            .in_flight
            .as_ref()
            .is_some_and(|f| f.generation == self.generation)
        {
            slot.in_flight = None;
        }
    }
}

/// One refresh cycle. Runs inside the spawned task.
///
/// Every store write is conditional on the refresh token read at the start
/// still being current, so a cycle that outlives its session cannot touch
/// the next one.
async fn execute(inner: &Inner) -> RefreshOutcome {
    let Some(refresh_token) = inner.store.refresh_token() else {
        warn!("no refresh token available, expiring session");
        if !expire(inner, None) {
            return RefreshOutcome::Failed(RefreshFailure::SessionChanged);
        }
        return RefreshOutcome::Failed(RefreshFailure::MissingRefreshToken);
    };

    match inner.auth.refresh(&refresh_token).await {
        Ok(pair) => {
            let rotated = pair.refresh_token.is_some();
            let next_refresh = pair
                .refresh_token
                .unwrap_or_else(|| refresh_token.clone());
            match inner
                .store
                .update_tokens(&refresh_token, pair.access_token, next_refresh)
            {
                Ok(()) => {}
                Err(AuthError::NotAuthenticated | AuthError::SessionChanged) => {
                    info!("session ended during refresh, discarding new tokens");
                    return RefreshOutcome::Failed(RefreshFailure::SessionChanged);
                }
                Err(e) => {
                    warn!(error = %e, "failed to persist refreshed tokens");
                }
            }
            inner.lifecycle.apply(SessionEvent::TokensRotated);
            info!(rotated, "access token refreshed");
            RefreshOutcome::Refreshed
        }
        Err(AuthError::InvalidCredentials { status, message }) => {
            if !expire(inner, Some(&refresh_token)) {
                info!(status, "refresh rejected for a session that already ended");
                return RefreshOutcome::Failed(RefreshFailure::SessionChanged);
            }
            warn!(status, error = %message, "refresh token rejected, session expired");
            RefreshOutcome::Failed(RefreshFailure::Rejected { status })
        }
        Err(AuthError::Transport(failure)) => {
            let kind = classify(&failure, false);
            warn!(kind = kind.label(), error = %failure, "refresh failed, keeping session");
            RefreshOutcome::Failed(RefreshFailure::Transient {
                kind,
                message: failure.message,
            })
        }
        Err(AuthError::MalformedResponse(message)) => {
            warn!(error = %message, "refresh response unusable, keeping session");
            RefreshOutcome::Failed(RefreshFailure::MalformedResponse(message))
        }
        Err(e) => {
            warn!(error = %e, "refresh failed, keeping session");
            RefreshOutcome::Failed(RefreshFailure::Transient {
                kind: ErrorKind::Unknown,
                message: e.to_string(),
            })
        }
    }
}

/// Forced logout of the session holding `refresh_token`: clear credentials,
/// then publish the expiry. Returns false, doing nothing, if another
/// session has been stored since.
fn expire(inner: &Inner, refresh_token: Option<&str>) -> bool {
    match inner.store.clear_if(refresh_token) {
        Ok(false) => return false,
        Ok(true) => {}
        Err(e) => warn!(error = %e, "failed to remove persisted session"),
    }
    if inner.lifecycle.apply(SessionEvent::Expired) {
        metrics::record_forced_logout();
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{SessionState, SignOutReason};
    use crate::testing::{FakeBackend, RefreshBehaviour, signed_in_store};
    use std::time::Duration;

    fn coordinator(backend: &Arc<FakeBackend>) -> (RefreshCoordinator, Arc<CredentialStore>, Arc<SessionLifecycle>) {
        let store = signed_in_store("T1", "R1");
        let lifecycle = Arc::new(SessionLifecycle::new());
        lifecycle.apply(SessionEvent::RestoreCompleted { complete: true });
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            AuthApi::new(backend.clone()),
            lifecycle.clone(),
        );
        (coordinator, store, lifecycle)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_refresh() {
        let backend = FakeBackend::new("T1");
        backend.set_refresh_delay(Duration::from_millis(200));
        let (coordinator, store, _) = coordinator(&backend);

        let calls = (0..5).map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh().await })
        });
        let outcomes = futures_util::future::join_all(calls).await;

        for outcome in outcomes {
            assert_eq!(outcome.unwrap(), RefreshOutcome::Refreshed);
        }
        assert_eq!(backend.refresh_calls(), 1);
        assert_eq!(store.access_token().as_deref(), Some("T2"));
        assert_eq!(store.refresh_token().as_deref(), Some("R2"));
        assert!(!coordinator.is_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn slot_is_released_after_settlement() {
        let backend = FakeBackend::new("T1");
        let (coordinator, _, _) = coordinator(&backend);

        assert!(coordinator.refresh().await.is_refreshed());
        assert!(coordinator.refresh().await.is_refreshed());
        assert_eq!(backend.refresh_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_token_after_rotation_skips_network_call() {
        let backend = FakeBackend::new("T1");
        let (coordinator, store, _) = coordinator(&backend);

        assert!(coordinator.refresh_after(Some("T1")).await.is_refreshed());
        assert_eq!(backend.refresh_calls(), 1);

        // A request that failed with T1 after the rotation above settled
        assert!(coordinator.refresh_after(Some("T1")).await.is_refreshed());
        assert_eq!(backend.refresh_calls(), 1);
        assert_eq!(store.access_token().as_deref(), Some("T2"));
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_is_optional() {
        let backend = FakeBackend::new("T1");
        backend.set_refresh(RefreshBehaviour::Rotate {
            access: "T2".into(),
            refresh: None,
        });
        let (coordinator, store, _) = coordinator(&backend);

        assert!(coordinator.refresh().await.is_refreshed());
        assert_eq!(store.access_token().as_deref(), Some("T2"));
        assert_eq!(store.refresh_token().as_deref(), Some("R1"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_preserves_session() {
        let backend = FakeBackend::new("T1");
        backend.set_refresh(RefreshBehaviour::Fail(503));
        let (coordinator, store, lifecycle) = coordinator(&backend);

        let outcome = coordinator.refresh().await;
        match &outcome {
            RefreshOutcome::Failed(f @ RefreshFailure::Transient { kind, .. }) => {
                assert_eq!(*kind, ErrorKind::Server);
                assert!(!f.expires_session());
            }
            other => panic!("expected transient failure, got {other:?}"),
        }
        assert!(store.is_authenticated());
        assert_eq!(store.access_token().as_deref(), Some("T1"));
        assert_eq!(lifecycle.current(), SessionState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_access_token_preserves_session() {
        let backend = FakeBackend::new("T1");
        backend.set_refresh(RefreshBehaviour::MissingAccessToken);
        let (coordinator, store, _) = coordinator(&backend);

        let outcome = coordinator.refresh().await;
        assert!(matches!(
            outcome,
            RefreshOutcome::Failed(RefreshFailure::MalformedResponse(_))
        ));
        assert!(store.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_refresh_token_expires_session_before_waiters_resume() {
        let backend = FakeBackend::new("T1");
        backend.set_refresh(RefreshBehaviour::Reject(403));
        backend.set_refresh_delay(Duration::from_millis(50));
        let (coordinator, store, lifecycle) = coordinator(&backend);

        let waiters = (0..3).map(|_| {
            let coordinator = coordinator.clone();
            let store = store.clone();
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move {
                let outcome = coordinator.refresh().await;
                // Observed at the moment the waiter is released
                (outcome, store.is_authenticated(), lifecycle.current())
            })
        });

        for result in futures_util::future::join_all(waiters).await {
            let (outcome, authenticated, state) = result.unwrap();
            assert_eq!(
                outcome,
                RefreshOutcome::Failed(RefreshFailure::Rejected { status: 403 })
            );
            assert!(!authenticated);
            assert_eq!(
                state,
                SessionState::Unauthenticated {
                    reason: SignOutReason::SessionExpired
                }
            );
        }
        assert_eq!(backend.refresh_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_refresh_token_expires_without_network_call() {
        let backend = FakeBackend::new("T1");
        let (coordinator, store, lifecycle) = coordinator(&backend);
        store.clear().unwrap();
        lifecycle.apply(SessionEvent::LoggedIn);

        let outcome = coordinator.refresh().await;
        assert_eq!(
            outcome,
            RefreshOutcome::Failed(RefreshFailure::MissingRefreshToken)
        );
        assert_eq!(backend.refresh_calls(), 0);
        assert!(!lifecycle.current().is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_waiter_does_not_cancel_refresh() {
        let backend = FakeBackend::new("T1");
        backend.set_refresh_delay(Duration::from_millis(500));
        let (coordinator, store, _) = coordinator(&backend);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), coordinator.refresh()).await;
        assert!(abandoned.is_err());
        assert!(coordinator.is_in_flight());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.access_token().as_deref(), Some("T2"));
        assert!(!coordinator.is_in_flight());
        assert_eq!(backend.refresh_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_during_refresh_is_not_undone() {
        let backend = FakeBackend::new("T1");
        backend.set_refresh_delay(Duration::from_millis(100));
        let (coordinator, store, _) = coordinator(&backend);

        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.clear().unwrap();

        let outcome = pending.await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Failed(RefreshFailure::SessionChanged));
        assert!(!store.is_authenticated());
    }

    /// Signs the current session out and a different user in while the
    /// refresh for the first session is still pending.
    async fn switch_user_during_refresh(
        coordinator: &RefreshCoordinator,
        store: &Arc<CredentialStore>,
        lifecycle: &Arc<SessionLifecycle>,
    ) -> RefreshOutcome {
        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        store.clear().unwrap();
        lifecycle.apply(SessionEvent::LoggedOut);
        store
            .set(crate::testing::test_user(), "B-T".into(), "B-R".into())
            .unwrap();
        lifecycle.apply(SessionEvent::LoggedIn);

        pending.await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn late_rotation_does_not_overwrite_next_session() {
        let backend = FakeBackend::new("T1");
        backend.set_refresh(RefreshBehaviour::Rotate {
            access: "A-T2".into(),
            refresh: Some("A-R2".into()),
        });
        backend.set_refresh_delay(Duration::from_millis(100));
        let (coordinator, store, lifecycle) = coordinator(&backend);

        let outcome = switch_user_during_refresh(&coordinator, &store, &lifecycle).await;

        assert_eq!(outcome, RefreshOutcome::Failed(RefreshFailure::SessionChanged));
        assert_eq!(store.access_token().as_deref(), Some("B-T"));
        assert_eq!(store.refresh_token().as_deref(), Some("B-R"));
        assert_eq!(lifecycle.current(), SessionState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn late_rejection_does_not_expire_next_session() {
        let backend = FakeBackend::new("T1");
        backend.set_refresh(RefreshBehaviour::Reject(403));
        backend.set_refresh_delay(Duration::from_millis(100));
        let (coordinator, store, lifecycle) = coordinator(&backend);

        let outcome = switch_user_during_refresh(&coordinator, &store, &lifecycle).await;

        assert_eq!(outcome, RefreshOutcome::Failed(RefreshFailure::SessionChanged));
        assert!(store.is_authenticated());
        assert_eq!(store.refresh_token().as_deref(), Some("B-R"));
        assert_eq!(lifecycle.current(), SessionState::Authenticated);
    }
}
