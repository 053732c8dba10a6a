//! Error classification for failed API calls
//!
//! Maps a normalized `TransportFailure` onto exactly one `ErrorKind`. The
//! function is pure so identical backend failures always produce identical
//! classifications. Precedence, first match wins:
//!
//! 1. 401 → `SessionExpired` if the session was force-expired, else `Unauthorized`
//! 2. 400 → `Validation`
//! 3. ≥500 → `Server`
//! 4. 403 → `Forbidden`
//! 5. no response + timeout signal → `Timeout`
//! 6. no response + network signal → `Network`
//! 7. otherwise → `Unknown`

use std::fmt;

use crate::error::{TransportFailure, TransportSignal};

/// Closed set of failure kinds consumed by the rest of the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Timeout,
    SessionExpired,
    Validation,
    Server,
    Unauthorized,
    Forbidden,
    Unknown,
}

impl ErrorKind {
    /// Label for logging and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SessionExpired => "session_expired",
            ErrorKind::Validation => "validation",
            ErrorKind::Server => "server",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Whether the UI may offer a retry. Nothing in the client retries these
    /// automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Server
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Classify a failure.
///
/// `session_expired` is true only when the refresh coordinator has already
/// cleared the session because the refresh token was missing or rejected.
pub fn classify(failure: &TransportFailure, session_expired: bool) -> ErrorKind {
    match failure.status {
        Some(401) if session_expired => ErrorKind::SessionExpired,
        Some(401) => ErrorKind::Unauthorized,
        Some(400) => ErrorKind::Validation,
        Some(status) if status >= 500 => ErrorKind::Server,
        Some(403) => ErrorKind::Forbidden,
        Some(_) => ErrorKind::Unknown,
        None => match failure.signal {
            TransportSignal::Timeout => ErrorKind::Timeout,
            TransportSignal::Network => ErrorKind::Network,
            TransportSignal::None => ErrorKind::Unknown,
        },
    }
}
