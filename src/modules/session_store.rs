//! Token to artifact mapping with expiry and single-active-session eviction.
//!
//! The store owns every assembled artifact on disk: an artifact is deleted
//! exactly when its session is evicted, expires or the store is cleared.

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::SessionError;
use crate::modules::audit::{AuditAction, AuditLog};

/// Random 128-bit token, hex encoded.
pub fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Short form of a token for logs and audit entries.
pub fn token_prefix(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub artifact_path: PathBuf,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(artifact_path: PathBuf, expires_at: DateTime<Utc>) -> Self {
        Self::with_token(new_token(), artifact_path, expires_at)
    }

    pub fn with_token(token: String, artifact_path: PathBuf, expires_at: DateTime<Utc>) -> Self {
        Self {
            token,
            artifact_path,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Result of a read-only expiry probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryStatus {
    NotFound,
    Ended,
    Remaining(u64),
}

pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    audit: Arc<AuditLog>,
}

impl SessionStore {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            audit,
        }
    }

    /// Install `session` as the only live session.
    ///
    /// Every other session is removed and its artifact deleted before this
    /// returns.
    pub fn put(&self, session: Session) {
        let mut sessions = self.lock();
        for (token, previous) in sessions.drain() {
            if previous.artifact_path != session.artifact_path {
                remove_artifact(&previous.artifact_path);
            }
            info!("Evicted session {}", token_prefix(&token));
            self.audit.append(
                AuditAction::SessionEvicted,
                json!({
                    "token": token_prefix(&token),
                    "replaced_by": token_prefix(&session.token),
                }),
                None,
            );
        }
        info!(
            "Session {} active until {}",
            token_prefix(&session.token),
            session.expires_at
        );
        sessions.insert(session.token.clone(), session);
    }

    /// Resolve `token` to its artifact, enforcing expiry.
    ///
    /// An expired session is torn down and reported as `Expired` once; later
    /// lookups see `NotFound`. `source` is recorded with the expiry audit.
    pub fn get(
        &self,
        token: &str,
        now: DateTime<Utc>,
        source: Option<&str>,
    ) -> Result<PathBuf, SessionError> {
        let mut sessions = self.lock();
        let session = sessions.get(token).ok_or(SessionError::NotFound)?;

        if session.is_expired(now) {
            if let Some(expired) = sessions.remove(token) {
                remove_artifact(&expired.artifact_path);
                self.audit.append(
                    AuditAction::StreamExpired,
                    json!({ "token": token_prefix(token) }),
                    source,
                );
            }
            return Err(SessionError::Expired);
        }

        if !session.artifact_path.is_file() {
            warn!("Artifact for session {} is missing", token_prefix(token));
            return Err(SessionError::NotFound);
        }
        Ok(session.artifact_path.clone())
    }

    /// Report expiry without changing anything.
    ///
    /// Less than one whole second left counts as ended.
    pub fn check_expiry(&self, token: &str, now: DateTime<Utc>) -> ExpiryStatus {
        match self.lock().get(token) {
            None => ExpiryStatus::NotFound,
            Some(session) => match (session.expires_at - now).num_seconds() {
                seconds if seconds > 0 => ExpiryStatus::Remaining(seconds as u64),
                _ => ExpiryStatus::Ended,
            },
        }
    }

    /// Drop every session and delete every artifact.
    pub fn evict_all(&self) {
        let mut sessions = self.lock();
        let count = sessions.len();
        for (_, session) in sessions.drain() {
            remove_artifact(&session.artifact_path);
        }
        if count > 0 {
            info!("Evicted {} sessions", count);
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn remove_artifact(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove artifact {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::audit::DEFAULT_CAPACITY;
    use chrono::{Duration, TimeZone};

    fn store(dir: &Path) -> (SessionStore, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::open(dir.join("audit_log.json"), DEFAULT_CAPACITY));
        (SessionStore::new(audit.clone()), audit)
    }

    fn artifact(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"assembled").unwrap();
        path
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 18, 0, 0).unwrap()
    }

    #[test]
    fn test_get_within_window() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        let path = artifact(dir.path(), "a.mp4");
        let session = Session::new(path.clone(), t0() + Duration::hours(2));
        let token = session.token.clone();
        assert_eq!(token.len(), 32);

        store.put(session);
        assert_eq!(store.get(&token, t0(), None).unwrap(), path);
        assert_eq!(store.get(&token, t0() + Duration::hours(2), None).unwrap(), path);
        assert_eq!(store.get("unknown", t0(), None), Err(SessionError::NotFound));
    }

    #[test]
    fn test_new_session_evicts_previous() {
        let dir = tempfile::tempdir().unwrap();
        let (store, audit) = store(dir.path());
        let first_path = artifact(dir.path(), "first.mp4");
        let first = Session::new(first_path.clone(), t0() + Duration::hours(2));
        let first_token = first.token.clone();
        store.put(first);

        let second_path = artifact(dir.path(), "second.mp4");
        let second = Session::new(second_path.clone(), t0() + Duration::hours(2));
        let second_token = second.token.clone();
        store.put(second);

        assert!(!first_path.exists());
        assert!(second_path.exists());
        assert_eq!(store.active_count(), 1);
        assert_eq!(store.get(&first_token, t0(), None), Err(SessionError::NotFound));
        assert!(store.get(&second_token, t0(), None).is_ok());
        assert_eq!(audit.entries()[0].action, AuditAction::SessionEvicted);
    }

    #[test]
    fn test_expired_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let (store, audit) = store(dir.path());
        let path = artifact(dir.path(), "a.mp4");
        let session = Session::new(path.clone(), t0() + Duration::hours(2));
        let token = session.token.clone();
        store.put(session);

        let late = t0() + Duration::hours(3);
        assert_eq!(store.get(&token, late, Some("10.0.0.9")), Err(SessionError::Expired));
        assert!(!path.exists());
        let entries = audit.entries();
        assert_eq!(entries[0].action, AuditAction::StreamExpired);
        assert_eq!(entries[0].details["token"], token_prefix(&token));
        assert_eq!(entries[0].source.as_deref(), Some("10.0.0.9"));

        let audited = audit.len();
        assert_eq!(store.get(&token, late, None), Err(SessionError::NotFound));
        assert_eq!(audit.len(), audited);
    }

    #[test]
    fn test_missing_artifact_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        let path = artifact(dir.path(), "a.mp4");
        let session = Session::new(path.clone(), t0() + Duration::hours(2));
        let token = session.token.clone();
        store.put(session);
        fs::remove_file(&path).unwrap();

        assert_eq!(store.get(&token, t0(), None), Err(SessionError::NotFound));
    }

    #[test]
    fn test_check_expiry_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        let path = artifact(dir.path(), "a.mp4");
        let session = Session::new(path.clone(), t0() + Duration::hours(2));
        let token = session.token.clone();
        store.put(session);

        assert_eq!(
            store.check_expiry(&token, t0() + Duration::hours(1)),
            ExpiryStatus::Remaining(3600)
        );
        assert_eq!(
            store.check_expiry(&token, t0() + Duration::hours(3)),
            ExpiryStatus::Ended
        );
        assert_eq!(
            store.check_expiry(&token, t0() + Duration::hours(2) - Duration::milliseconds(400)),
            ExpiryStatus::Ended
        );
        assert_eq!(
            store.check_expiry(&token, t0() + Duration::hours(2) - Duration::seconds(1)),
            ExpiryStatus::Remaining(1)
        );
        assert!(path.exists());
        assert_eq!(store.check_expiry("missing", t0()), ExpiryStatus::NotFound);
    }

    #[test]
    fn test_evict_all_deletes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        let path = artifact(dir.path(), "a.mp4");
        store.put(Session::new(path.clone(), t0()));
        store.evict_all();
        assert_eq!(store.active_count(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_token_prefix() {
        assert_eq!(token_prefix("0123456789abcdef"), "01234567");
        assert_eq!(token_prefix("abc"), "abc");
    }
}
