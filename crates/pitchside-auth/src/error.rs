//! Error types for authentication and credential storage

use transport::{ApiError, ErrorKind, TransportFailure};

/// Errors from auth endpoint calls and credential storage.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("auth request failed: {0}")]
    Transport(TransportFailure),

    /// Backend answered 2xx with `{ "status": "error", "message": ... }`
    #[error("auth request rejected: {0}")]
    Envelope(String),

    /// Refresh token rejected (401/403): the session cannot be recovered
    #[error("invalid credentials ({status}): {message}")]
    InvalidCredentials { status: u16, message: String },

    #[error("malformed auth response: {0}")]
    MalformedResponse(String),

    #[error("credential storage error: {0}")]
    Storage(String),

    #[error("no authenticated session")]
    NotAuthenticated,

    /// The stored session is no longer the one a conditional write expected
    #[error("session changed since the operation started")]
    SessionChanged,

    #[error("invalid user profile: {0}")]
    InvalidProfile(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for ApiError {
    /// Surface auth failures in the same taxonomy as every other API call.
    fn from(err: Error) -> Self {
        match err {
            Error::Transport(failure) => ApiError::from_failure(failure),
            Error::InvalidCredentials { status, message } => {
                ApiError::from_failure(TransportFailure::http(status, message))
            }
            Error::Envelope(message) => ApiError::new(ErrorKind::Validation, message),
            Error::NotAuthenticated => {
                ApiError::new(ErrorKind::Unauthorized, "no authenticated session")
            }
            other => ApiError::new(ErrorKind::Unknown, other.to_string()),
        }
    }
}
