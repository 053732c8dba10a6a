//! Normalized transport failures and the Error Record surfaced to callers

use std::fmt;
use std::sync::Arc;

use crate::classify::{ErrorKind, classify};

/// Network-layer signal for failures that produced no HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSignal {
    Timeout,
    Network,
    None,
}

/// A raw failure, normalized at the HTTP-client boundary.
///
/// Either `status` is set (the backend answered with a non-2xx code) or
/// `signal` describes why no response arrived. `cause` retains the
/// underlying error for logging only.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TransportFailure {
    pub status: Option<u16>,
    pub signal: TransportSignal,
    pub message: String,
    pub body: Option<String>,
    pub cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl TransportFailure {
    /// Backend answered with a non-success status.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            signal: TransportSignal::None,
            message: message.into(),
            body: None,
            cause: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::without_response(TransportSignal::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::without_response(TransportSignal::Network, message)
    }

    /// No response and no recognizable network signal.
    pub fn other(message: impl Into<String>) -> Self {
        Self::without_response(TransportSignal::None, message)
    }

    fn without_response(signal: TransportSignal, message: impl Into<String>) -> Self {
        Self {
            status: None,
            signal,
            message: message.into(),
            body: None,
            cause: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == Some(401)
    }
}

/// The Error Record every API caller receives.
///
/// `message` is the backend's message verbatim where one was provided;
/// localization happens at the UI boundary. `cause` is kept for logging.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub http_status: Option<u16>,
    pub cause: Option<Arc<TransportFailure>>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            http_status: None,
            cause: None,
        }
    }

    /// Classify a raw failure for a session that is still live.
    pub fn from_failure(failure: TransportFailure) -> Self {
        Self::classified(failure, false)
    }

    pub fn classified(failure: TransportFailure, session_expired: bool) -> Self {
        let kind = classify(&failure, session_expired);
        Self {
            kind,
            message: failure.message.clone(),
            http_status: failure.status,
            cause: Some(Arc::new(failure)),
        }
    }

    /// Re-label this error after the session was force-expired.
    ///
    /// Only a 401 becomes `SessionExpired`; other failures keep their kind.
    pub fn into_session_expired(self) -> Self {
        match self.cause {
            Some(cause) if cause.is_unauthorized() => {
                Self::classified(TransportFailure::clone(&cause), true)
            }
            _ => self,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.http_status == Some(401)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn failure(&self) -> Option<&TransportFailure> {
        self.cause.as_deref()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.http_status {
            Some(status) => write!(f, "{} ({status}): {}", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<TransportFailure> for ApiError {
    fn from(failure: TransportFailure) -> Self {
        Self::from_failure(failure)
    }
}
