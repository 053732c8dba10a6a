//! Credentials and auth endpoints for the Pitchside API
//!
//! Owns the credential record (access token, refresh token, signed-in user),
//! its durable persistence, and the unauthenticated `/auth/*` calls that
//! produce or rotate it. Session lifecycle and request-time refresh live in
//! `pitchside-session`; this crate has no notion of state transitions.

pub mod constants;
pub mod credentials;
pub mod error;
pub mod jwt;
pub mod storage;
pub mod token;

pub use credentials::{CredentialRecord, CredentialStore, Credentials, RestoreOutcome, UserProfile};
pub use error::{Error, Result};
pub use jwt::{seconds_until_expiry, token_expiry};
pub use storage::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use token::{AuthApi, AuthSession, TokenPair};
