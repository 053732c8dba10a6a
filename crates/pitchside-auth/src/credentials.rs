//! Credential store: access token, refresh token, and signed-in user
//!
//! The three values are held as one `Option<Credentials>`, so a reader sees
//! either all of them or none. Every mutation swaps the in-memory record
//! under a short write lock and then persists a snapshot through the
//! `KeyValueStore`. A separate persist lock serializes mutations so the
//! order of writes on disk matches the order in memory.
//!
//! Reads never touch the persistence backend and never suspend.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::SESSION_KEY;
use crate::error::{Error, Result};
use crate::storage::KeyValueStore;

/// Minimal identity of the signed-in user.
///
/// Fields the client does not interpret are kept in `extra` so profile
/// updates round-trip through storage without loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl UserProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: None,
            name: None,
            email: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Shallow-merge `partial` into this profile.
    ///
    /// Top-level keys in `partial` replace existing ones; nested objects are
    /// replaced wholesale, not merged.
    pub fn merged(&self, partial: &serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| Error::InvalidProfile(format!("serializing profile: {e}")))?;
        if let Some(obj) = value.as_object_mut() {
            for (key, field) in partial {
                obj.insert(key.clone(), field.clone());
            }
        }
        serde_json::from_value(value).map_err(|e| Error::InvalidProfile(e.to_string()))
    }
}

/// A complete authenticated credential set.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: UserProfile,
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
}

/// Snapshot of the store returned by `CredentialStore::get`.
#[derive(Debug, Clone, Default)]
pub struct CredentialRecord {
    credentials: Option<Credentials>,
}

impl CredentialRecord {
    pub fn access_token(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.access_token.as_str())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.refresh_token.as_str())
    }

    pub fn user(&self) -> Option<&UserProfile> {
        self.credentials.as_ref().map(|c| &c.user)
    }

    /// True iff access token, refresh token and user are all present.
    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }
}

/// Result of loading persisted credentials at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// A complete record was loaded
    Restored,
    /// Nothing persisted
    Missing,
    /// Persisted record lacked a token or the user; discarded
    Incomplete,
    /// Persistence backend failed or held garbage; treated as signed out
    Unreadable,
}

/// On-disk shape. Every field is optional so incomplete records can be
/// detected rather than failing to parse.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedRecord {
    #[serde(default)]
    user: Option<UserProfile>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl PersistedRecord {
    fn from_credentials(credentials: &Credentials) -> Self {
        Self {
            user: Some(credentials.user.clone()),
            access_token: Some(credentials.access_token.expose().clone()),
            refresh_token: Some(credentials.refresh_token.expose().clone()),
        }
    }

    fn into_credentials(self) -> Option<Credentials> {
        match (self.user, self.access_token, self.refresh_token) {
            (Some(user), Some(access), Some(refresh)) if !access.is_empty() && !refresh.is_empty() => {
                Some(Credentials {
                    user,
                    access_token: Secret::new(access),
                    refresh_token: Secret::new(refresh),
                })
            }
            _ => None,
        }
    }
}

/// Owner of the current credential record.
///
/// All mutation goes through `set`, `update_tokens`, `update_user`,
/// `clear` and `clear_if`. Mutating methods apply the in-memory change first and return
/// `Error::Storage` if persisting it failed; the in-memory state is kept
/// either way.
pub struct CredentialStore {
    record: RwLock<Option<Credentials>>,
    persist: Mutex<()>,
    backend: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    /// Create an empty store. Call `restore` to load persisted credentials.
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            record: RwLock::new(None),
            persist: Mutex::new(()),
            backend,
        }
    }

    /// Read the current record.
    pub fn get(&self) -> CredentialRecord {
        CredentialRecord {
            credentials: self
                .record
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.read_with(|c| c.access_token.expose().clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read_with(|c| c.refresh_token.expose().clone())
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.read_with(|c| c.user.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.read_with(|_| ()).is_some()
    }

    /// Replace user and both tokens as a single transition.
    pub fn set(&self, user: UserProfile, access_token: String, refresh_token: String) -> Result<()> {
        let _persist = self.persist_lock();
        let credentials = Credentials {
            user,
            access_token: Secret::new(access_token),
            refresh_token: Secret::new(refresh_token),
        };
        let snapshot = PersistedRecord::from_credentials(&credentials);
        debug!(user_id = %credentials.user.id, "storing credentials");
        *self.write() = Some(credentials);
        self.persist(&snapshot)
    }

    /// Replace the token pair after a refresh, leaving the user untouched.
    ///
    /// `expected_refresh` is the refresh token the refresh call sent. The
    /// write only applies while that token is still the stored one: an empty
    /// store fails with `NotAuthenticated`, a different session with
    /// `SessionChanged`, and neither case changes anything.
    pub fn update_tokens(
        &self,
        expected_refresh: &str,
        access_token: String,
        refresh_token: String,
    ) -> Result<()> {
        let _persist = self.persist_lock();
        let snapshot = {
            let mut record = self.write();
            let credentials = record.as_mut().ok_or(Error::NotAuthenticated)?;
            if credentials.refresh_token.as_str() != expected_refresh {
                return Err(Error::SessionChanged);
            }
            credentials.access_token = Secret::new(access_token);
            credentials.refresh_token = Secret::new(refresh_token);
            PersistedRecord::from_credentials(credentials)
        };
        debug!("rotated tokens");
        self.persist(&snapshot)
    }

    /// Shallow-merge a partial profile into the current user.
    pub fn update_user(
        &self,
        partial: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<UserProfile> {
        let _persist = self.persist_lock();
        let (user, snapshot) = {
            let mut record = self.write();
            let credentials = record.as_mut().ok_or(Error::NotAuthenticated)?;
            credentials.user = credentials.user.merged(partial)?;
            (
                credentials.user.clone(),
                PersistedRecord::from_credentials(credentials),
            )
        };
        debug!(user_id = %user.id, fields = partial.len(), "updated user profile");
        self.persist(&snapshot)?;
        Ok(user)
    }

    /// Reset all fields to absent and remove the persisted record.
    pub fn clear(&self) -> Result<()> {
        let _persist = self.persist_lock();
        self.clear_locked()
    }

    /// Clear only if the stored refresh token is still `expected_refresh`
    /// (`None`: only if the store is already empty).
    ///
    /// Returns `Ok(false)` without touching anything when another session
    /// has been stored since `expected_refresh` was read.
    pub fn clear_if(&self, expected_refresh: Option<&str>) -> Result<bool> {
        let _persist = self.persist_lock();
        let current = self.read_with(|c| c.refresh_token.expose().clone());
        if current.as_deref() != expected_refresh {
            return Ok(false);
        }
        self.clear_locked()?;
        Ok(true)
    }

    fn clear_locked(&self) -> Result<()> {
        let had_credentials = self.write().take().is_some();
        if had_credentials {
            debug!("cleared credentials");
        }
        self.backend.delete(SESSION_KEY)
    }

    /// Load a previously persisted record.
    ///
    /// Incomplete records are discarded rather than partially restored, and
    /// backend failures degrade to signed-out without fabricating anything.
    pub fn restore(&self) -> RestoreOutcome {
        let _persist = self.persist_lock();
        let raw = match self.backend.get(SESSION_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("no persisted session");
                *self.write() = None;
                return RestoreOutcome::Missing;
            }
            Err(e) => {
                warn!(error = %e, "failed to read persisted session, starting signed out");
                *self.write() = None;
                return RestoreOutcome::Unreadable;
            }
        };

        let persisted: PersistedRecord = match serde_json::from_str(&raw) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "persisted session is not valid JSON, discarding");
                *self.write() = None;
                self.discard_persisted();
                return RestoreOutcome::Unreadable;
            }
        };

        match persisted.into_credentials() {
            Some(credentials) => {
                info!(user_id = %credentials.user.id, "restored persisted session");
                *self.write() = Some(credentials);
                RestoreOutcome::Restored
            }
            None => {
                warn!("persisted session is incomplete, discarding");
                *self.write() = None;
                self.discard_persisted();
                RestoreOutcome::Incomplete
            }
        }
    }

    fn read_with<T>(&self, f: impl FnOnce(&Credentials) -> T) -> Option<T> {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(f)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<Credentials>> {
        self.record.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist_lock(&self) -> MutexGuard<'_, ()> {
        self.persist.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, snapshot: &PersistedRecord) -> Result<()> {
        let json = serde_json::to_string(snapshot)
            .map_err(|e| Error::Storage(format!("serializing credentials: {e}")))?;
        self.backend.set(SESSION_KEY, &json)
    }

    fn discard_persisted(&self) {
        if let Err(e) = self.backend.delete(SESSION_KEY) {
            warn!(error = %e, "failed to remove discarded session record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileKeyValueStore, MemoryKeyValueStore};

    fn user(id: &str) -> UserProfile {
        UserProfile {
            id: id.into(),
            role: Some("player".into()),
            name: Some("Sam".into()),
            email: Some("sam@example.com".into()),
            extra: serde_json::Map::new(),
        }
    }

    fn memory_store() -> (Arc<MemoryKeyValueStore>, CredentialStore) {
        let backend = Arc::new(MemoryKeyValueStore::new());
        let store = CredentialStore::new(backend.clone());
        (backend, store)
    }

    /// Backend whose every operation fails.
    struct BrokenBackend;

    impl KeyValueStore for BrokenBackend {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(Error::Storage("device not ready".into()))
        }
        fn set(&self, _key: &str, _value: &str) -> Result<()> {
            Err(Error::Storage("device not ready".into()))
        }
        fn delete(&self, _key: &str) -> Result<()> {
            Err(Error::Storage("device not ready".into()))
        }
    }

    #[test]
    fn empty_store_is_unauthenticated() {
        let (_, store) = memory_store();
        let record = store.get();
        assert!(!record.is_authenticated());
        assert_eq!(record.access_token(), None);
        assert_eq!(record.refresh_token(), None);
        assert!(record.user().is_none());
    }

    #[test]
    fn set_writes_all_three_fields() {
        let (backend, store) = memory_store();
        store.set(user("u1"), "T1".into(), "R1".into()).unwrap();

        let record = store.get();
        assert!(record.is_authenticated());
        assert_eq!(record.access_token(), Some("T1"));
        assert_eq!(record.refresh_token(), Some("R1"));
        assert_eq!(record.user().unwrap().id, "u1");

        let persisted: serde_json::Value =
            serde_json::from_str(&backend.get(SESSION_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(persisted["accessToken"], "T1");
        assert_eq!(persisted["refreshToken"], "R1");
        assert_eq!(persisted["user"]["id"], "u1");
    }

    #[test]
    fn update_tokens_keeps_user() {
        let (_, store) = memory_store();
        store.set(user("u1"), "T1".into(), "R1".into()).unwrap();
        store.update_tokens("R1", "T2".into(), "R2".into()).unwrap();

        let record = store.get();
        assert_eq!(record.access_token(), Some("T2"));
        assert_eq!(record.refresh_token(), Some("R2"));
        assert_eq!(record.user().unwrap().id, "u1");
    }

    #[test]
    fn update_tokens_on_empty_store_does_not_fabricate_session() {
        let (backend, store) = memory_store();
        let result = store.update_tokens("R1", "T2".into(), "R2".into());
        assert!(matches!(result, Err(Error::NotAuthenticated)));
        assert!(!store.is_authenticated());
        assert_eq!(backend.get(SESSION_KEY).unwrap(), None);
    }

    #[test]
    fn update_tokens_for_replaced_session_changes_nothing() {
        let (backend, store) = memory_store();
        store.set(user("u2"), "B-T".into(), "B-R".into()).unwrap();

        let result = store.update_tokens("A-R", "A-T2".into(), "A-R2".into());
        assert!(matches!(result, Err(Error::SessionChanged)));

        let record = store.get();
        assert_eq!(record.access_token(), Some("B-T"));
        assert_eq!(record.refresh_token(), Some("B-R"));
        assert_eq!(record.user().unwrap().id, "u2");
        let persisted: serde_json::Value =
            serde_json::from_str(&backend.get(SESSION_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(persisted["accessToken"], "B-T");
    }

    #[test]
    fn clear_if_only_clears_the_expected_session() {
        let (backend, store) = memory_store();
        store.set(user("u2"), "B-T".into(), "B-R".into()).unwrap();

        assert!(!store.clear_if(Some("A-R")).unwrap());
        assert!(!store.clear_if(None).unwrap());
        assert!(store.is_authenticated());
        assert!(backend.get(SESSION_KEY).unwrap().is_some());

        assert!(store.clear_if(Some("B-R")).unwrap());
        assert!(!store.is_authenticated());
        assert_eq!(backend.get(SESSION_KEY).unwrap(), None);

        assert!(store.clear_if(None).unwrap());
    }

    #[test]
    fn update_user_merges_shallowly() {
        let (_, store) = memory_store();
        store.set(user("u1"), "T1".into(), "R1".into()).unwrap();

        let partial = serde_json::json!({"name": "Samira", "favoriteField": "Parc des Sports"});
        let updated = store.update_user(partial.as_object().unwrap()).unwrap();

        assert_eq!(updated.name.as_deref(), Some("Samira"));
        assert_eq!(updated.email.as_deref(), Some("sam@example.com"));
        assert_eq!(updated.extra["favoriteField"], "Parc des Sports");
        assert_eq!(store.user().unwrap(), updated);
        assert_eq!(store.access_token().as_deref(), Some("T1"));
    }

    #[test]
    fn update_user_without_session_errors() {
        let (_, store) = memory_store();
        let partial = serde_json::json!({"name": "x"});
        let result = store.update_user(partial.as_object().unwrap());
        assert!(matches!(result, Err(Error::NotAuthenticated)));
    }

    #[test]
    fn update_user_rejects_profile_without_id() {
        let (_, store) = memory_store();
        store.set(user("u1"), "T1".into(), "R1".into()).unwrap();
        let partial = serde_json::json!({"id": null});
        let result = store.update_user(partial.as_object().unwrap());
        assert!(matches!(result, Err(Error::InvalidProfile(_))));
        assert_eq!(store.user().unwrap().id, "u1");
    }

    #[test]
    fn clear_removes_memory_and_persisted_record() {
        let (backend, store) = memory_store();
        store.set(user("u1"), "T1".into(), "R1".into()).unwrap();
        store.clear().unwrap();

        assert!(!store.get().is_authenticated());
        assert_eq!(backend.get(SESSION_KEY).unwrap(), None);
    }

    #[test]
    fn restore_complete_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        {
            let backend = Arc::new(FileKeyValueStore::open(path.clone()).unwrap());
            let store = CredentialStore::new(backend);
            store.set(user("u1"), "T1".into(), "R1".into()).unwrap();
        }

        let backend = Arc::new(FileKeyValueStore::open(path).unwrap());
        let store = CredentialStore::new(backend);
        assert_eq!(store.restore(), RestoreOutcome::Restored);
        assert_eq!(store.access_token().as_deref(), Some("T1"));
        assert_eq!(store.user().unwrap().name.as_deref(), Some("Sam"));
    }

    #[test]
    fn restore_missing_record() {
        let (_, store) = memory_store();
        assert_eq!(store.restore(), RestoreOutcome::Missing);
        assert!(!store.is_authenticated());
    }

    #[test]
    fn restore_discards_tokens_without_user() {
        let (backend, store) = memory_store();
        backend
            .set(SESSION_KEY, r#"{"accessToken":"T1","refreshToken":"R1"}"#)
            .unwrap();

        assert_eq!(store.restore(), RestoreOutcome::Incomplete);
        assert!(!store.is_authenticated());
        assert_eq!(store.access_token(), None);
        assert_eq!(backend.get(SESSION_KEY).unwrap(), None);
    }

    #[test]
    fn restore_discards_user_without_tokens() {
        let (backend, store) = memory_store();
        backend
            .set(SESSION_KEY, r#"{"user":{"_id":"u1","name":"Sam"}}"#)
            .unwrap();
        assert_eq!(store.restore(), RestoreOutcome::Incomplete);
        assert!(store.user().is_none());
    }

    #[test]
    fn restore_garbage_is_unreadable() {
        let (backend, store) = memory_store();
        backend.set(SESSION_KEY, "{{{").unwrap();
        assert_eq!(store.restore(), RestoreOutcome::Unreadable);
        assert!(!store.is_authenticated());
    }

    #[test]
    fn restore_backend_failure_degrades_to_signed_out() {
        let store = CredentialStore::new(Arc::new(BrokenBackend));
        assert_eq!(store.restore(), RestoreOutcome::Unreadable);
        assert!(!store.is_authenticated());
    }

    #[test]
    fn persist_failure_keeps_memory_state() {
        let store = CredentialStore::new(Arc::new(BrokenBackend));
        let result = store.set(user("u1"), "T1".into(), "R1".into());
        assert!(matches!(result, Err(Error::Storage(_))));
        assert_eq!(store.access_token().as_deref(), Some("T1"));
    }

    #[test]
    fn user_id_alias_is_accepted() {
        let profile: UserProfile =
            serde_json::from_str(r#"{"_id":"abc","role":"organizer","phone":"0600"}"#).unwrap();
        assert_eq!(profile.id, "abc");
        assert_eq!(profile.role.as_deref(), Some("organizer"));
        assert_eq!(profile.extra["phone"], "0600");
    }

    #[test]
    fn debug_output_never_contains_tokens() {
        let (_, store) = memory_store();
        store
            .set(user("u1"), "access-secret".into(), "refresh-secret".into())
            .unwrap();
        let debug = format!("{:?}", store.get());
        assert!(!debug.contains("access-secret"), "got: {debug}");
        assert!(!debug.contains("refresh-secret"), "got: {debug}");
    }

    #[test]
    fn readers_never_observe_partial_records() {
        let (_, store) = memory_store();
        let store = Arc::new(store);
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let writer = {
            let store = store.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut i = 0u32;
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    match i % 3 {
                        0 => store
                            .set(user("u1"), format!("T{i}"), format!("R{i}"))
                            .unwrap(),
                        1 => {
                            if let Some(current) = store.refresh_token() {
                                let _ = store.update_tokens(
                                    &current,
                                    format!("T{i}"),
                                    format!("R{i}"),
                                );
                            }
                        }
                        _ => store.clear().unwrap(),
                    }
                    i += 1;
                }
            })
        };

        for _ in 0..10_000 {
            let record = store.get();
            let present = [
                record.access_token().is_some(),
                record.refresh_token().is_some(),
                record.user().is_some(),
            ]
            .iter()
            .filter(|p| **p)
            .count();
            assert!(present == 0 || present == 3, "observed {present} of 3 fields");
            if let (Some(access), Some(refresh)) = (record.access_token(), record.refresh_token()) {
                assert_eq!(access[1..], refresh[1..], "token pair must rotate together");
            }
        }

        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        writer.join().unwrap();
    }
}
