//! Producer pipeline: shard, encrypt and publish an uploaded source asset.
//!
//! A job moves `Uploaded -> Sharding -> Encrypting -> ManifestReady`, or to
//! `Error` from any non-terminal state. Leaving `Uploaded` is the per-movie
//! lease, so a second run of the same movie is rejected. Each run builds its
//! shard set in a private staging area and publishes it atomically.

use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::modules::audit::{AuditAction, AuditLog};
use crate::modules::crypto::{ShardCipher, ShardKey};
use crate::modules::manifest::Manifest;
use crate::modules::tools::Segmenter;
use crate::modules::workspace::{write_durably, Workspace, SHARD_EXTENSION};

/// Source containers accepted for upload.
pub const ALLOWED_EXTENSIONS: [&str; 4] = ["mp4", "mkv", "avi", "mov"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Uploaded,
    Sharding,
    Encrypting,
    ManifestReady,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::ManifestReady | JobStatus::Error)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Uploaded, JobStatus::Sharding)
            | (JobStatus::Sharding, JobStatus::Encrypting)
            | (JobStatus::Encrypting, JobStatus::ManifestReady) => true,
            (current, JobStatus::Error) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Uploaded => "uploaded",
            JobStatus::Sharding => "sharding",
            JobStatus::Encrypting => "encrypting",
            JobStatus::ManifestReady => "manifest_ready",
            JobStatus::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineJob {
    pub id: String,
    pub name: String,
    pub theatre_id: String,
    pub source_path: PathBuf,
    pub status: JobStatus,
    /// Encoded shard key, set once encryption has run.
    pub key: Option<String>,
}

impl PipelineJob {
    pub fn new(id: String, name: String, theatre_id: String, source_path: PathBuf) -> Self {
        Self {
            id,
            name,
            theatre_id,
            source_path,
            status: JobStatus::Uploaded,
            key: None,
        }
    }

    pub fn advance(&mut self, next: JobStatus) -> Result<(), PipelineError> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub movie_id: String,
    pub name: String,
    pub theatre_id: String,
    pub shards: usize,
    pub processed_at: DateTime<Utc>,
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStep {
    Cleanup,
    Sharding,
    ShardingDone,
    Encrypting,
    EncryptingDone,
    Manifest,
    ManifestDone,
    Done,
    Error,
}

impl ProgressStep {
    pub fn progress(self) -> u8 {
        match self {
            ProgressStep::Cleanup => 5,
            ProgressStep::Sharding => 15,
            ProgressStep::ShardingDone => 40,
            ProgressStep::Encrypting => 55,
            ProgressStep::EncryptingDone => 75,
            ProgressStep::Manifest => 85,
            ProgressStep::ManifestDone => 92,
            ProgressStep::Done => 100,
            ProgressStep::Error => 0,
        }
    }
}

/// One progress notification, serialized as the SSE `data` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub step: ProgressStep,
    pub message: String,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shards: Option<usize>,
}

impl ProgressEvent {
    pub fn stage(step: ProgressStep, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
            progress: step.progress(),
            key: None,
            shards: None,
        }
    }

    pub fn done(key: String, shards: usize) -> Self {
        Self {
            key: Some(key),
            shards: Some(shards),
            ..Self::stage(ProgressStep::Done, "Pipeline complete!")
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::stage(ProgressStep::Error, message)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.step, ProgressStep::Done | ProgressStep::Error)
    }
}

/// In-memory job table and processing history.
#[derive(Default)]
pub struct JobTable {
    jobs: Mutex<HashMap<String, PipelineJob>>,
    history: Mutex<Vec<HistoryRecord>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: PipelineJob) {
        lock(&self.jobs).insert(job.id.clone(), job);
    }

    pub fn get(&self, movie_id: &str) -> Option<PipelineJob> {
        lock(&self.jobs).get(movie_id).cloned()
    }

    /// Take the lease on `movie_id` by moving it out of `Uploaded`.
    pub fn begin(&self, movie_id: &str) -> Result<PipelineJob, PipelineError> {
        let mut jobs = lock(&self.jobs);
        let job = jobs
            .get_mut(movie_id)
            .ok_or_else(|| PipelineError::JobNotFound {
                movie_id: movie_id.to_string(),
            })?;
        if job.status != JobStatus::Uploaded {
            return Err(PipelineError::AlreadyStarted {
                movie_id: movie_id.to_string(),
                status: job.status.to_string(),
            });
        }
        job.advance(JobStatus::Sharding)?;
        Ok(job.clone())
    }

    pub fn advance(&self, movie_id: &str, next: JobStatus) -> Result<(), PipelineError> {
        let mut jobs = lock(&self.jobs);
        let job = jobs
            .get_mut(movie_id)
            .ok_or_else(|| PipelineError::JobNotFound {
                movie_id: movie_id.to_string(),
            })?;
        job.advance(next)
    }

    /// Mark the job ready and remember its key.
    pub fn complete(&self, movie_id: &str, key: String) -> Result<(), PipelineError> {
        let mut jobs = lock(&self.jobs);
        let job = jobs
            .get_mut(movie_id)
            .ok_or_else(|| PipelineError::JobNotFound {
                movie_id: movie_id.to_string(),
            })?;
        job.advance(JobStatus::ManifestReady)?;
        job.key = Some(key);
        Ok(())
    }

    pub fn fail(&self, movie_id: &str) {
        if let Some(job) = lock(&self.jobs).get_mut(movie_id) {
            if job.advance(JobStatus::Error).is_err() {
                warn!("Job {} already terminal as {}", movie_id, job.status);
            }
        }
    }

    pub fn record(&self, record: HistoryRecord) {
        lock(&self.history).push(record);
    }

    /// Processing history, newest first.
    pub fn history(&self) -> Vec<HistoryRecord> {
        lock(&self.history).iter().rev().cloned().collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// First 8 hex characters of a random UUID.
pub fn new_movie_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Reduce a client-supplied filename to a safe basename.
///
/// Keeps ASCII letters, digits, `.`, `_` and `-`; whitespace becomes `_`.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let cleaned: String = base
        .trim()
        .chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                Some(c)
            } else if c.is_whitespace() {
                Some('_')
            } else {
                None
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches(['.', '_']).to_string();
    (!cleaned.is_empty()).then_some(cleaned)
}

pub fn has_allowed_extension(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            ALLOWED_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
        .unwrap_or(false)
}

/// Trimmed and upper-cased theatre id, or `default` when blank.
pub fn normalize_theatre_id(raw: Option<&str>, default: &str) -> String {
    match raw.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_uppercase(),
        _ => default.to_string(),
    }
}

/// Encrypt every file in `plain_dir` into `out_dir` as `<name>.enc`.
///
/// Plaintext segments are removed once their ciphertext is durable.
pub fn encrypt_shards(
    plain_dir: &Path,
    out_dir: &Path,
    cipher: &dyn ShardCipher,
    key: &ShardKey,
) -> Result<usize, PipelineError> {
    let mut names: Vec<String> = fs::read_dir(plain_dir)?
        .flatten()
        .filter(|entry| entry.path().is_file())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    for name in &names {
        let plain_path = plain_dir.join(name);
        let plaintext = fs::read(&plain_path)?;
        let sealed = cipher.encrypt(&plaintext, key)?;
        write_durably(&out_dir.join(format!("{}.{}", name, SHARD_EXTENSION)), &sealed)?;
        fs::remove_file(&plain_path)?;
    }
    Ok(names.len())
}

pub struct ProducerPipeline {
    workspace: Arc<Workspace>,
    jobs: Arc<JobTable>,
    audit: Arc<AuditLog>,
    segmenter: Arc<dyn Segmenter>,
    cipher: Arc<dyn ShardCipher>,
    window: Duration,
}

impl ProducerPipeline {
    pub fn new(
        workspace: Arc<Workspace>,
        jobs: Arc<JobTable>,
        audit: Arc<AuditLog>,
        segmenter: Arc<dyn Segmenter>,
        cipher: Arc<dyn ShardCipher>,
        window: Duration,
    ) -> Self {
        Self {
            workspace,
            jobs,
            audit,
            segmenter,
            cipher,
            window,
        }
    }

    /// Record an accepted upload as a new job.
    pub fn register_upload(
        &self,
        movie_id: String,
        name: String,
        theatre_id: String,
        source_path: PathBuf,
        source: Option<&str>,
    ) -> PipelineJob {
        let job = PipelineJob::new(movie_id, name, theatre_id, source_path);
        self.audit.append(
            AuditAction::Upload,
            json!({
                "movie_id": job.id,
                "filename": job.name,
                "theatre_id": job.theatre_id,
            }),
            source,
        );
        info!("Upload registered movie_id={} file={}", job.id, job.name);
        self.jobs.insert(job.clone());
        job
    }

    /// Claim `movie_id` for processing.
    pub fn start(&self, movie_id: &str) -> Result<PipelineJob, PipelineError> {
        self.jobs.begin(movie_id)
    }

    /// Run a claimed job to completion, reporting progress through `emit`.
    ///
    /// Exactly one terminal event is emitted: `done` or `error`.
    pub fn run(
        &self,
        job: &PipelineJob,
        mut emit: impl FnMut(ProgressEvent),
    ) -> Result<HistoryRecord, PipelineError> {
        let result = self.execute(job, &mut emit);
        self.remove_upload(job);

        match result {
            Ok(record) => {
                self.jobs.record(record.clone());
                self.audit
                    .append(AuditAction::PipelineComplete, json!({ "movie_id": job.id }), None);
                info!(
                    "Pipeline complete movie_id={} shards={}",
                    job.id, record.shards
                );
                emit(ProgressEvent::done(record.key.clone(), record.shards));
                Ok(record)
            }
            Err(e) => {
                self.jobs.fail(&job.id);
                error!("Pipeline failed movie_id={} error={}", job.id, e);
                self.audit.append(
                    AuditAction::PipelineFailed,
                    json!({ "movie_id": job.id, "error": e.to_string() }),
                    None,
                );
                emit(ProgressEvent::error(e.to_string()));
                Err(e)
            }
        }
    }

    fn execute(
        &self,
        job: &PipelineJob,
        emit: &mut impl FnMut(ProgressEvent),
    ) -> Result<HistoryRecord, PipelineError> {
        emit(ProgressEvent::stage(ProgressStep::Cleanup, "Preparing workspace..."));
        let staging = self.workspace.stage(&job.id)?;

        emit(ProgressEvent::stage(
            ProgressStep::Sharding,
            "Splitting video into shards...",
        ));
        let produced = self
            .segmenter
            .segment(&job.source_path, staging.plain_dir())?;
        if produced == 0 {
            return Err(PipelineError::NoShards);
        }
        self.audit.append(
            AuditAction::Shard,
            json!({ "movie_id": job.id, "shards": produced }),
            None,
        );
        emit(ProgressEvent::stage(
            ProgressStep::ShardingDone,
            format!("Created {} shards", produced),
        ));

        self.jobs.advance(&job.id, JobStatus::Encrypting)?;
        emit(ProgressEvent::stage(
            ProgressStep::Encrypting,
            "Encrypting shards with AES-256-GCM...",
        ));
        let key = ShardKey::generate();
        let encrypted = encrypt_shards(
            staging.plain_dir(),
            staging.encrypted_dir(),
            self.cipher.as_ref(),
            &key,
        )?;
        self.audit.append(
            AuditAction::Encrypt,
            json!({ "movie_id": job.id, "shards": encrypted }),
            None,
        );
        emit(ProgressEvent::stage(
            ProgressStep::EncryptingDone,
            "All shards encrypted",
        ));

        emit(ProgressEvent::stage(
            ProgressStep::Manifest,
            "Generating secure manifest...",
        ));
        let manifest = Manifest::build(
            staging.encrypted_dir(),
            &job.theatre_id,
            self.window,
            Utc::now(),
        )?;
        self.workspace.publish(&staging, &manifest)?;
        let encoded_key = key.to_encoded();
        self.jobs.complete(&job.id, encoded_key.clone())?;
        self.audit.append(
            AuditAction::Manifest,
            json!({
                "movie_id": job.id,
                "theatre_id": manifest.theatre_id,
                "shards": manifest.shards.len(),
            }),
            None,
        );
        emit(ProgressEvent::stage(
            ProgressStep::ManifestDone,
            "Manifest created with SHA-256 hashes",
        ));

        Ok(HistoryRecord {
            movie_id: job.id.clone(),
            name: job.name.clone(),
            theatre_id: job.theatre_id.clone(),
            shards: manifest.shards.len(),
            processed_at: Utc::now(),
            key: encoded_key,
        })
    }

    fn remove_upload(&self, job: &PipelineJob) {
        match fs::remove_file(&job.source_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove upload {}: {}",
                job.source_path.display(),
                e
            ),
        }
    }
}
