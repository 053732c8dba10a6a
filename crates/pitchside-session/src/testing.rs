//! In-process fake backend shared by the unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pitchside_auth::{CredentialStore, MemoryKeyValueStore, UserProfile};
use serde_json::json;
use transport::{ApiResponse, BoxFuture, RequestDescriptor, Transport, TransportFailure};

/// How `/auth/refresh` answers.
#[derive(Debug, Clone)]
pub enum RefreshBehaviour {
    Rotate {
        access: String,
        refresh: Option<String>,
    },
    /// Reject the refresh token with this status
    Reject(u16),
    /// Fail with this (non-auth) status
    Fail(u16),
    /// 2xx without an access token
    MissingAccessToken,
}

/// Backend accepting exactly one access token at a time.
///
/// - `/auth/login`: returns user `u1` with `T1`/`R1`
/// - `/auth/refresh`: per `RefreshBehaviour`, after `refresh_delay`
/// - `/always-401`: 401 whatever the token
/// - `/forbidden`: 403 whatever the token
/// - anything else: 200 echoing the path if the bearer matches, else 401
pub struct FakeBackend {
    valid_token: Mutex<String>,
    refresh: Mutex<RefreshBehaviour>,
    refresh_delay: Mutex<Duration>,
    refresh_calls: AtomicUsize,
    seen: Mutex<Vec<(String, Option<String>)>>,
}

impl FakeBackend {
    pub fn new(valid_token: &str) -> Arc<Self> {
        Arc::new(Self {
            valid_token: Mutex::new(valid_token.to_string()),
            refresh: Mutex::new(RefreshBehaviour::Rotate {
                access: "T2".into(),
                refresh: Some("R2".into()),
            }),
            refresh_delay: Mutex::new(Duration::ZERO),
            refresh_calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn set_refresh(&self, behaviour: RefreshBehaviour) {
        *self.refresh.lock().unwrap() = behaviour;
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = delay;
    }

    /// Invalidate the current token, as if it expired server-side.
    pub fn set_valid_token(&self, token: &str) {
        *self.valid_token.lock().unwrap() = token.to_string();
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// `(path, bearer)` of every request received, in order.
    pub fn seen(&self) -> Vec<(String, Option<String>)> {
        self.seen.lock().unwrap().clone()
    }

    async fn handle(&self, request: RequestDescriptor) -> Result<ApiResponse, TransportFailure> {
        let bearer = request.bearer().map(str::to_string);
        self.seen
            .lock()
            .unwrap()
            .push((request.path.clone(), bearer.clone()));

        match request.path.as_str() {
            "/auth/login" | "/auth/register" => Ok(ApiResponse::json_body(
                200,
                &json!({
                    "user": {"_id": "u1", "name": "Sam", "role": "player"},
                    "accessToken": "T1",
                    "refreshToken": "R1",
                }),
            )),
            "/auth/refresh" => {
                self.refresh_calls.fetch_add(1, Ordering::SeqCst);
                let delay = *self.refresh_delay.lock().unwrap();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let behaviour = self.refresh.lock().unwrap().clone();
                match behaviour {
                    RefreshBehaviour::Rotate { access, refresh } => {
                        self.set_valid_token(&access);
                        let mut data = json!({ "accessToken": access });
                        if let Some(refresh) = refresh {
                            data["refreshToken"] = json!(refresh);
                        }
                        Ok(ApiResponse::json_body(
                            200,
                            &json!({"status": "success", "data": data}),
                        ))
                    }
                    RefreshBehaviour::Reject(status) | RefreshBehaviour::Fail(status) => {
                        Err(TransportFailure::http(status, "refresh refused"))
                    }
                    RefreshBehaviour::MissingAccessToken => Ok(ApiResponse::json_body(
                        200,
                        &json!({"status": "success", "data": {}}),
                    )),
                }
            }
            "/always-401" => Err(TransportFailure::http(401, "unauthorized")),
            "/forbidden" => Err(TransportFailure::http(403, "not a team member")),
            path => {
                let valid = self.valid_token.lock().unwrap().clone();
                if bearer.as_deref() == Some(valid.as_str()) {
                    Ok(ApiResponse::json_body(
                        200,
                        &json!({"path": path, "token": valid}),
                    ))
                } else {
                    Err(TransportFailure::http(401, "jwt expired"))
                }
            }
        }
    }
}

impl Transport for FakeBackend {
    fn send<'a>(
        &'a self,
        request: RequestDescriptor,
    ) -> BoxFuture<'a, Result<ApiResponse, TransportFailure>> {
        Box::pin(self.handle(request))
    }
}

pub fn test_user() -> UserProfile {
    let mut user = UserProfile::new("u1");
    user.name = Some("Sam".into());
    user
}

/// In-memory credential store already holding `access`/`refresh`.
pub fn signed_in_store(access: &str, refresh: &str) -> Arc<CredentialStore> {
    let store = CredentialStore::new(Arc::new(MemoryKeyValueStore::new()));
    store
        .set(test_user(), access.to_string(), refresh.to_string())
        .unwrap();
    Arc::new(store)
}
