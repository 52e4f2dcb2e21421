//! Bounded, append-only audit trail of security-relevant events.
//!
//! The log is rewritten as a pretty-printed JSON array after every append and
//! reloaded on startup. Only the most recent `capacity` entries are kept.

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::AuditError;
use crate::modules::workspace::write_atomically;

pub const DEFAULT_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Upload,
    Shard,
    Encrypt,
    Manifest,
    PipelineComplete,
    PipelineFailed,
    PlaybackAuth,
    PlaybackFailed,
    StreamExpired,
    SessionEvicted,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditAction::Upload => "UPLOAD",
            AuditAction::Shard => "SHARD",
            AuditAction::Encrypt => "ENCRYPT",
            AuditAction::Manifest => "MANIFEST",
            AuditAction::PipelineComplete => "PIPELINE_COMPLETE",
            AuditAction::PipelineFailed => "PIPELINE_FAILED",
            AuditAction::PlaybackAuth => "PLAYBACK_AUTH",
            AuditAction::PlaybackFailed => "PLAYBACK_FAILED",
            AuditAction::StreamExpired => "STREAM_EXPIRED",
            AuditAction::SessionEvicted => "SESSION_EVICTED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub details: Value,
    /// Remote address of the request that caused the event, if any.
    #[serde(default)]
    pub source: Option<String>,
}

pub struct AuditLog {
    path: PathBuf,
    capacity: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    /// Load the log at `path`. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let path = path.into();
        let capacity = capacity.max(1);
        let mut entries = match load_entries(&path) {
            Ok(entries) => entries,
            Err(AuditError::Io(e)) if e.kind() == io::ErrorKind::NotFound => VecDeque::new(),
            Err(e) => {
                warn!("Discarding unreadable audit log {}: {}", path.display(), e);
                VecDeque::new()
            }
        };
        while entries.len() > capacity {
            entries.pop_front();
        }
        info!(
            "Audit log opened path={} entries={} capacity={}",
            path.display(),
            entries.len(),
            capacity
        );
        Self {
            path,
            capacity,
            entries: Mutex::new(entries),
        }
    }

    /// Record an event and persist the log.
    ///
    /// A failed write is logged; the entry stays in memory.
    pub fn append(&self, action: AuditAction, details: Value, source: Option<&str>) -> AuditEntry {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            action,
            details,
            source: source.map(str::to_string),
        };
        info!("AUDIT action={} details={}", entry.action, entry.details);

        let mut entries = self.lock();
        entries.push_back(entry.clone());
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        if let Err(e) = persist(&self.path, &entries) {
            error!("Failed to persist audit log {}: {}", self.path.display(), e);
        }
        entry
    }

    /// All retained entries, newest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AuditEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn load_entries(path: &Path) -> Result<VecDeque<AuditEntry>, AuditError> {
    let json = fs::read_to_string(path)?;
    let entries: Vec<AuditEntry> = serde_json::from_str(&json)?;
    Ok(entries.into())
}

fn persist(path: &Path, entries: &VecDeque<AuditEntry>) -> Result<(), AuditError> {
    let json = serde_json::to_vec_pretty(entries)?;
    write_atomically(path, &json)?;
    Ok(())
}
