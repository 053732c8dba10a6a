//! Session lifecycle for the Pitchside API client
//!
//! Builds on `pitchside-auth` (credential record, auth endpoints) and
//! `transport` (request model, middleware chain) to provide:
//!
//! - `SessionManager`: the single owner of session state, built once at
//!   startup and passed to whoever needs it
//! - `AuthMiddleware`: bearer attachment with refresh-and-replay on 401
//! - `RefreshCoordinator`: at most one refresh call in flight
//! - `SessionLifecycle`: observable `Restoring` / `Authenticated` /
//!   `Unauthenticated` state
//! - `spawn_refresh_task`: optional proactive refresh ahead of JWT expiry

pub mod background;
pub mod manager;
pub mod metrics;
pub mod pipeline;
pub mod refresh;
pub mod state;

#[cfg(test)]
mod testing;

pub use background::spawn_refresh_task;
pub use manager::SessionManager;
pub use pipeline::AuthMiddleware;
pub use refresh::{RefreshCoordinator, RefreshFailure, RefreshOutcome};
pub use state::{
    SessionAction, SessionEvent, SessionLifecycle, SessionState, SignOutReason, handle_event,
};
