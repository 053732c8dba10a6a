//! Auth endpoint calls: login, registration, and token refresh
//!
//! All three POST JSON to the backend through the raw `Transport`, never
//! through the middleware chain: they must not carry a bearer token and a
//! 401 from them must not trigger a refresh.
//!
//! The backend is inconsistent about wrapping: login and register answer
//! with a flat `{ user, accessToken, refreshToken }`, refresh answers with
//! `{ status: "success", data: { accessToken, refreshToken? } }`. Both
//! shapes are accepted everywhere.

use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};
use transport::{ApiResponse, RequestDescriptor, Transport};

use crate::constants::{LOGIN_PATH, REFRESH_PATH, REGISTER_PATH};
use crate::credentials::UserProfile;
use crate::error::{Error, Result};

/// Successful login or registration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    pub user: UserProfile,
    pub access_token: String,
    pub refresh_token: String,
}

/// Token pair returned by the refresh endpoint.
///
/// `refresh_token` is absent when the backend does not rotate it; the
/// caller keeps the existing one.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Client for the unauthenticated `/auth/*` endpoints.
#[derive(Clone)]
pub struct AuthApi {
    transport: Arc<dyn Transport>,
}

impl AuthApi {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Exchange email and password for a session.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession> {
        let body = json!({ "email": email, "password": password });
        let response = self.post(LOGIN_PATH, body).await?;
        let session: AuthSession = parse_payload(&response, "login")?;
        debug!(user_id = %session.user.id, "login succeeded");
        Ok(session)
    }

    /// Create an account. `profile` is forwarded to the backend as-is.
    pub async fn register(&self, profile: &Value) -> Result<AuthSession> {
        let response = self.post(REGISTER_PATH, profile.clone()).await?;
        let session: AuthSession = parse_payload(&response, "register")?;
        debug!(user_id = %session.user.id, "registration succeeded");
        Ok(session)
    }

    /// Exchange a refresh token for a new token pair.
    ///
    /// 401 and 403 mean the refresh token itself was rejected and are
    /// reported as `InvalidCredentials`. Any other failure is returned as
    /// `Transport` and leaves the session recoverable.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let body = json!({ "refreshToken": refresh_token });
        let response = match self.post(REFRESH_PATH, body).await {
            Err(Error::Transport(failure)) if matches!(failure.status, Some(401 | 403)) => {
                let status = failure.status.unwrap_or(401);
                warn!(status, "refresh token rejected");
                return Err(Error::InvalidCredentials {
                    status,
                    message: failure.message,
                });
            }
            other => other?,
        };

        let pair: TokenPair = parse_payload(&response, "refresh")?;
        if pair.access_token.is_empty() {
            return Err(Error::MalformedResponse(
                "refresh response carried an empty access token".into(),
            ));
        }
        debug!(rotated = pair.refresh_token.is_some(), "refresh succeeded");
        Ok(pair)
    }

    async fn post(&self, path: &str, body: Value) -> Result<ApiResponse> {
        let request = RequestDescriptor::post(path, body).anonymous();
        self.transport.send(request).await.map_err(Error::Transport)
    }
}

/// Extract the payload from a flat or `{status, data}` wrapped body.
fn parse_payload<T: DeserializeOwned>(response: &ApiResponse, operation: &str) -> Result<T> {
    let body: Value = response
        .json()
        .map_err(|e| Error::MalformedResponse(format!("{operation}: body is not JSON: {e}")))?;

    if body.get("status").and_then(Value::as_str) == Some("error") {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("request rejected")
            .to_string();
        return Err(Error::Envelope(message));
    }

    let payload = match body.get("data") {
        Some(data) if data.is_object() => data.clone(),
        _ => body,
    };

    serde_json::from_value(payload)
        .map_err(|e| Error::MalformedResponse(format!("{operation}: {e}")))
}
