//! Playback authorization: key and window checks against the published
//! manifest, assembly of the artifact and installation of the session.

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex};

use crate::error::{AuthError, ManifestError};
use crate::modules::assembler::ShardAssembler;
use crate::modules::audit::{AuditAction, AuditLog};
use crate::modules::crypto::ShardKey;
use crate::modules::manifest::{Manifest, WindowPhase};
use crate::modules::session_store::{new_token, token_prefix, Session, SessionStore};
use crate::modules::workspace::Workspace;

/// A granted playback session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Authorization {
    pub token: String,
    pub shards: usize,
    pub theatre_id: String,
    pub time_remaining_minutes: i64,
    pub window_end: DateTime<Utc>,
}

impl Authorization {
    /// Remaining time as shown to theatres, e.g. `"120 min"`.
    pub fn time_remaining(&self) -> String {
        format!("{} min", self.time_remaining_minutes)
    }
}

pub struct AuthorizationService {
    workspace: Arc<Workspace>,
    assembler: ShardAssembler,
    sessions: Arc<SessionStore>,
    audit: Arc<AuditLog>,
    gate: Mutex<()>,
}

impl AuthorizationService {
    pub fn new(
        workspace: Arc<Workspace>,
        assembler: ShardAssembler,
        sessions: Arc<SessionStore>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            workspace,
            assembler,
            sessions,
            audit,
            gate: Mutex::new(()),
        }
    }

    /// Validate `key` at `now` and, on success, install a new session.
    ///
    /// Every outcome is audited before returning.
    pub fn authorize(&self, key: &str, now: DateTime<Utc>, source: Option<&str>) -> Result<Authorization, AuthError> {
        match self.try_authorize(key, now) {
            Ok(auth) => {
                info!(
                    "Playback authorized token={} theatre={} remaining_min={}",
                    token_prefix(&auth.token),
                    auth.theatre_id,
                    auth.time_remaining_minutes
                );
                self.audit.append(
                    AuditAction::PlaybackAuth,
                    json!({
                        "theatre_id": auth.theatre_id,
                        "time_remaining_min": auth.time_remaining_minutes,
                        "token": token_prefix(&auth.token),
                    }),
                    source,
                );
                Ok(auth)
            }
            Err(e) => {
                warn!("Playback authorization failed reason={} error={}", e.kind(), e);
                self.audit.append(
                    AuditAction::PlaybackFailed,
                    json!({ "reason": e.kind(), "error": e.to_string() }),
                    source,
                );
                Err(e)
            }
        }
    }

    fn try_authorize(&self, key: &str, now: DateTime<Utc>) -> Result<Authorization, AuthError> {
        if key.trim().is_empty() {
            return Err(AuthError::MissingKey);
        }
        let _publication = self.workspace.read_publication();
        let manifest = Manifest::load(&self.workspace.manifest_path()).map_err(AuthError::NotReady)?;
        let window = manifest.playback_window;
        match window.phase(now) {
            WindowPhase::Early => return Err(AuthError::TooEarly { start: window.start }),
            WindowPhase::Closed => return Err(AuthError::Expired { end: window.end }),
            WindowPhase::Open => {}
        }

        let key = ShardKey::from_encoded(key).map_err(|_| AuthError::InvalidKey)?;
        self.assembler.verify_first_shard(&manifest, &key)?;

        let _gate = self
            .gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let token = new_token();
        let artifact_path = self
            .assembler
            .assemble(&manifest, &key, &self.workspace.artifact_path(&token))?;
        self.sessions
            .put(Session::with_token(token.clone(), artifact_path, window.end));

        Ok(Authorization {
            token,
            shards: manifest.shards.len(),
            theatre_id: manifest.theatre_id,
            time_remaining_minutes: window.remaining(now).num_minutes(),
            window_end: window.end,
        })
    }

    /// Published manifest, if a valid one exists.
    pub fn published_manifest(&self) -> Result<Manifest, ManifestError> {
        let _publication = self.workspace.read_publication();
        Manifest::load(&self.workspace.manifest_path())
    }
}
