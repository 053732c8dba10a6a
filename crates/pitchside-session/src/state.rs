//! Session state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! `SessionLifecycle` executes the action by publishing on a watch channel.
//!
//! Token rotation and profile edits keep the session `Authenticated`
//! without publishing, so observers only wake on transitions they can act
//! on. A forced expiry arriving while already signed out is a no-op, which
//! makes the expiry observable exactly once no matter how many concurrent
//! requests hit it.

use tokio::sync::watch;
use tracing::info;

use crate::metrics;

/// Why the session is not authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutReason {
    /// Nothing restored at startup (or the restored record was incomplete)
    NoSession,
    LoggedOut,
    AccountDeleted,
    /// Refresh token missing or rejected
    SessionExpired,
}

/// Session states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Loading persisted credentials at process start
    Restoring,
    Unauthenticated { reason: SignOutReason },
    Authenticated,
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated)
    }

    /// Label for logging and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Restoring => "restoring",
            SessionState::Unauthenticated { .. } => "unauthenticated",
            SessionState::Authenticated => "authenticated",
        }
    }
}

/// Events that drive state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Startup hydration finished; `complete` iff a full record was loaded
    RestoreCompleted { complete: bool },
    LoggedIn,
    Registered,
    LoggedOut,
    AccountDeleted,
    /// Refresh coordinator cleared the credentials
    Expired,
    TokensRotated,
    ProfileUpdated,
}

/// Actions the caller should execute after a state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Notify observers of the new state
    Publish,
    /// No-op
    None,
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: SessionState, event: SessionEvent) -> (SessionState, SessionAction) {
    use SessionAction::{None as Stay, Publish};

    match (state, event) {
        // --- Restoring ---
        (SessionState::Restoring, SessionEvent::RestoreCompleted { complete: true }) => {
            (SessionState::Authenticated, Publish)
        }
        (SessionState::Restoring, SessionEvent::RestoreCompleted { complete: false }) => (
            SessionState::Unauthenticated {
                reason: SignOutReason::NoSession,
            },
            Publish,
        ),

        // --- Sign in ---
        (
            SessionState::Restoring | SessionState::Unauthenticated { .. },
            SessionEvent::LoggedIn | SessionEvent::Registered,
        ) => (SessionState::Authenticated, Publish),

        // Signing in as someone else replaces the user
        (SessionState::Authenticated, SessionEvent::LoggedIn | SessionEvent::Registered) => {
            (SessionState::Authenticated, Publish)
        }

        // --- Sign out ---
        (
            SessionState::Restoring | SessionState::Authenticated,
            SessionEvent::LoggedOut | SessionEvent::AccountDeleted | SessionEvent::Expired,
        ) => {
            let reason = match event {
                SessionEvent::LoggedOut => SignOutReason::LoggedOut,
                SessionEvent::AccountDeleted => SignOutReason::AccountDeleted,
                _ => SignOutReason::SessionExpired,
            };
            (SessionState::Unauthenticated { reason }, Publish)
        }

        // --- Authenticated, credentials changed underneath ---
        (
            SessionState::Authenticated,
            SessionEvent::TokensRotated | SessionEvent::ProfileUpdated,
        ) => (SessionState::Authenticated, Stay),

        // Repeated sign-outs, late restores, rotations while signed out
        (state, _) => (state, Stay),
    }
}

/// Observable session state.
///
/// Cheap to read; subscribers are woken only on `SessionAction::Publish`.
pub struct SessionLifecycle {
    tx: watch::Sender<SessionState>,
}

impl SessionLifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Restoring);
        Self { tx }
    }

    /// Apply `event`; returns true if observers were notified.
    pub fn apply(&self, event: SessionEvent) -> bool {
        let mut published = None;
        self.tx.send_if_modified(|state| {
            let (next, action) = handle_event(state.clone(), event);
            match action {
                SessionAction::Publish => {
                    published = Some(next.clone());
                    *state = next;
                    true
                }
                SessionAction::None => false,
            }
        });

        match published {
            Some(state) => {
                info!(?event, state = state.label(), "session state changed");
                metrics::record_transition(state.label());
                true
            }
            None => false,
        }
    }

    pub fn current(&self) -> SessionState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }
}

impl Default for SessionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
