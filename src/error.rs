//! Error types for shard distribution, authorization and delivery.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the shard cipher and key handling.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("Invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    #[error("Invalid key size: expected {expected}, got {got}")]
    InvalidKeySize { expected: usize, got: usize },

    #[error("Ciphertext too short: {len} bytes")]
    CiphertextTooShort { len: usize },

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
}

/// Errors raised while building, loading or publishing a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Manifest not found at {path}")]
    Missing { path: PathBuf },

    #[error("Malformed manifest: {0}")]
    Malformed(String),

    #[error("Manifest I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ManifestError {
    fn from(e: serde_json::Error) -> Self {
        ManifestError::Malformed(e.to_string())
    }
}

/// Failures of an external media tool (segmenter or remuxer).
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Failed to launch {tool}: {reason}")]
    Launch { tool: String, reason: String },

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("Unexpected output from {tool}: {detail}")]
    UnexpectedOutput { tool: String, detail: String },

    #[error("Tool I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the shard assembler.
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("Invalid decryption key")]
    InvalidKey,

    #[error("Integrity check failed for shard {shard_id}: {reason}")]
    IntegrityViolation { shard_id: String, reason: String },

    #[error("Remux failed: {0}")]
    Tool(#[from] ToolError),

    #[error("Assembly I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Every distinct outcome of a failed authorization.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Decryption key is required")]
    MissingKey,

    #[error("No movie available: {0}")]
    NotReady(ManifestError),

    #[error("Playback hasn't started yet. Window opens at {}", .start.format("%H:%M UTC"))]
    TooEarly { start: DateTime<Utc> },

    #[error("Playback window has expired at {end}")]
    Expired { end: DateTime<Utc> },

    #[error("Invalid decryption key")]
    InvalidKey,

    #[error("Integrity check failed for shard {shard_id}: {reason}")]
    IntegrityViolation { shard_id: String, reason: String },

    #[error("Media tool failed: {0}")]
    ToolFailure(ToolError),

    #[error("Authorization I/O error: {0}")]
    Io(std::io::Error),
}

impl AuthError {
    /// Stable identifier used in audit entries and API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::MissingKey => "invalid_request",
            AuthError::NotReady(_) => "not_ready",
            AuthError::TooEarly { .. } => "too_early",
            AuthError::Expired { .. } => "expired",
            AuthError::InvalidKey => "invalid_key",
            AuthError::IntegrityViolation { .. } => "integrity_violation",
            AuthError::ToolFailure(_) => "tool_failure",
            AuthError::Io(_) => "internal_error",
        }
    }
}

impl From<AssemblyError> for AuthError {
    fn from(e: AssemblyError) -> Self {
        match e {
            AssemblyError::InvalidKey => AuthError::InvalidKey,
            AssemblyError::IntegrityViolation { shard_id, reason } => {
                AuthError::IntegrityViolation { shard_id, reason }
            }
            AssemblyError::Tool(e) => AuthError::ToolFailure(e),
            AssemblyError::Io(e) => AuthError::Io(e),
        }
    }
}

/// Session lookup failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Video not found or session expired")]
    NotFound,

    #[error("Playback window expired")]
    Expired,
}

/// Errors raised while resolving a delivery request.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Requested range not satisfiable for {len} bytes")]
    RangeNotSatisfiable { len: u64 },

    #[error("Delivery I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the producer pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Movie {movie_id} not found")]
    JobNotFound { movie_id: String },

    #[error("Movie {movie_id} is already {status}")]
    AlreadyStarted { movie_id: String, status: String },

    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Segmenter produced no shards")]
    NoShards,

    #[error("Media tool failed: {0}")]
    Tool(#[from] ToolError),

    #[error("Shard encryption failed: {0}")]
    Cipher(#[from] CipherError),

    #[error("Manifest generation failed: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Pipeline I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audit log persistence errors.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audit log serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Invalid server configuration.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}
