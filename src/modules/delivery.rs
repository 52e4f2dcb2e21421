//! Range-aware delivery of assembled artifacts.
//!
//! Session expiry is checked on every request, so a token stops working the
//! moment its playback window closes even mid-stream.

use chrono::{DateTime, Utc};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, Take};

use crate::error::DeliveryError;
use crate::modules::session_store::SessionStore;

/// Parse a single `Range` header against a body of `len` bytes.
///
/// Accepts `bytes=a-b`, `bytes=a-` and `bytes=-n`. The end is clamped to the
/// last byte. Multiple ranges and anything malformed yield `None`.
pub fn parse_single_range(header: &str, len: u64) -> Option<(u64, u64)> {
    let lower = header.trim().to_ascii_lowercase();
    let rest = lower.strip_prefix("bytes=")?;
    if rest.contains(',') {
        return None;
    }
    let (a, b) = rest.split_once('-')?;
    let (a, b) = (a.trim(), b.trim());
    if len == 0 {
        return None;
    }
    let last = len - 1;

    if a.is_empty() {
        let suffix: u64 = b.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        return Some((len.saturating_sub(suffix), last));
    }

    let start: u64 = a.parse().ok()?;
    if start >= len {
        return None;
    }
    if b.is_empty() {
        return Some((start, last));
    }

    let end: u64 = b.parse().ok()?;
    if end < start {
        return None;
    }
    Some((start, end.min(last)))
}

/// What to send for one request: a whole file or one byte range of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPlan {
    pub path: PathBuf,
    pub total_len: u64,
    pub start: u64,
    pub end: u64,
    pub partial: bool,
}

impl DeliveryPlan {
    pub fn content_length(&self) -> u64 {
        if self.total_len == 0 {
            0
        } else {
            self.end - self.start + 1
        }
    }

    /// `Content-Range` value for a partial response.
    pub fn content_range(&self) -> Option<String> {
        self.partial
            .then(|| format!("bytes {}-{}/{}", self.start, self.end, self.total_len))
    }

    /// Open the artifact positioned at `start`, limited to the planned length.
    pub async fn open(&self) -> std::io::Result<Take<File>> {
        let mut file = File::open(&self.path).await?;
        if self.start > 0 {
            file.seek(SeekFrom::Start(self.start)).await?;
        }
        Ok(file.take(self.content_length()))
    }
}

pub struct Delivery {
    sessions: Arc<SessionStore>,
}

impl Delivery {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self { sessions }
    }

    /// Resolve `token` and an optional `Range` header into a delivery plan.
    ///
    /// Touches the filesystem; call from a blocking context.
    pub fn stream(
        &self,
        token: &str,
        range: Option<&str>,
        now: DateTime<Utc>,
        source: Option<&str>,
    ) -> Result<DeliveryPlan, DeliveryError> {
        let path = self.sessions.get(token, now, source)?;
        let total_len = std::fs::metadata(&path)?.len();

        let Some(header) = range else {
            return Ok(DeliveryPlan {
                path,
                total_len,
                start: 0,
                end: total_len.saturating_sub(1),
                partial: false,
            });
        };

        let (start, end) = parse_single_range(header, total_len)
            .ok_or(DeliveryError::RangeNotSatisfiable { len: total_len })?;
        Ok(DeliveryPlan {
            path,
            total_len,
            start,
            end,
            partial: true,
        })
    }
}
