//! Shard manifest: the authoritative descriptor of a published shard set.
//!
//! ```json
//! {
//!     "created_at": "2024-05-01T18:00:00Z",
//!     "theatre_id": "THEATRE_001",
//!     "playback_window": { "start": "...", "end": "..." },
//!     "shards": [ { "id": "movie_part000.mp4.enc", "sha256": "..." } ]
//! }
//! ```
//!
//! Hashes cover the encrypted bytes, so tampering is detected before any
//! decryption takes place.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use crate::error::ManifestError;
use crate::modules::crypto::sha256_file;
use crate::modules::workspace::write_atomically;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub id: String,
    pub sha256: String,
}

/// Where `now` falls relative to a playback window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPhase {
    Early,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackWindow {
    #[serde(with = "utc_timestamp")]
    pub start: DateTime<Utc>,
    #[serde(with = "utc_timestamp")]
    pub end: DateTime<Utc>,
}

impl PlaybackWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ManifestError> {
        if start > end {
            return Err(ManifestError::Malformed(format!(
                "playback window starts after it ends ({} > {})",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Both bounds are inclusive.
    pub fn phase(&self, now: DateTime<Utc>) -> WindowPhase {
        if now < self.start {
            WindowPhase::Early
        } else if now > self.end {
            WindowPhase::Closed
        } else {
            WindowPhase::Open
        }
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.phase(now) == WindowPhase::Open
    }

    /// Time left until the window closes, never negative.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.end - now).max(Duration::zero())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(with = "utc_timestamp")]
    pub created_at: DateTime<Utc>,
    pub theatre_id: String,
    pub playback_window: PlaybackWindow,
    pub shards: Vec<ShardEntry>,
}

impl Manifest {
    /// Hash every shard file in `shard_dir` in filename order.
    ///
    /// The window opens at `now` and closes `window_duration` later.
    pub fn build(
        shard_dir: &Path,
        theatre_id: &str,
        window_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, ManifestError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(shard_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().into_string().map_err(|name| {
                ManifestError::Malformed(format!("shard name is not UTF-8: {:?}", name))
            })?;
            names.push(name);
        }
        names.sort();

        let mut shards = Vec::with_capacity(names.len());
        for name in names {
            let sha256 = sha256_file(&shard_dir.join(&name))?;
            shards.push(ShardEntry { id: name, sha256 });
        }

        let manifest = Manifest {
            created_at: now,
            theatre_id: theatre_id.to_string(),
            playback_window: PlaybackWindow::new(now, now + window_duration)?,
            shards,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load and validate a published manifest.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let json = match fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ManifestError::Missing {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_json::from_str(json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check the structural invariants every manifest must hold.
    pub fn validate(&self) -> Result<(), ManifestError> {
        PlaybackWindow::new(self.playback_window.start, self.playback_window.end)?;

        if self.shards.is_empty() {
            return Err(ManifestError::Malformed("manifest lists no shards".into()));
        }

        let mut seen = HashSet::new();
        for shard in &self.shards {
            if shard.id.is_empty()
                || shard.id.contains('/')
                || shard.id.contains('\\')
                || shard.id == "."
                || shard.id == ".."
            {
                return Err(ManifestError::Malformed(format!(
                    "invalid shard id {:?}",
                    shard.id
                )));
            }
            if shard.sha256.len() != 64 || !shard.sha256.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ManifestError::Malformed(format!(
                    "shard {} has an invalid sha256",
                    shard.id
                )));
            }
            if !seen.insert(shard.id.as_str()) {
                return Err(ManifestError::Malformed(format!(
                    "duplicate shard id {}",
                    shard.id
                )));
            }
        }

        if self.shards.windows(2).any(|pair| pair[0].id > pair[1].id) {
            return Err(ManifestError::Malformed(
                "shards are not in lexicographic order".into(),
            ));
        }
        Ok(())
    }

    /// Replace the manifest at `path` as a whole, never partially.
    pub fn publish(&self, path: &Path) -> Result<(), ManifestError> {
        let mut json = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut json, formatter);
        self.serialize(&mut serializer)?;
        write_atomically(path, &json)?;
        Ok(())
    }

    pub fn first_shard(&self) -> Option<&ShardEntry> {
        self.shards.first()
    }
}

/// RFC 3339 timestamps; a missing offset is read as UTC.
mod utc_timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {:?}", raw)))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hash(c: char) -> String {
        std::iter::repeat(c).take(64).collect()
    }

    fn sample() -> Manifest {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 18, 0, 0).unwrap();
        Manifest {
            created_at: start,
            theatre_id: "THEATRE_001".into(),
            playback_window: PlaybackWindow::new(start, start + Duration::hours(2)).unwrap(),
            shards: vec![
                ShardEntry {
                    id: "a_part000.mp4.enc".into(),
                    sha256: hash('a'),
                },
                ShardEntry {
                    id: "a_part001.mp4.enc".into(),
                    sha256: hash('b'),
                },
            ],
        }
    }

    #[test]
    fn test_build_sorts_and_hashes_encrypted_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("m_part002.mp4.enc"), b"third").unwrap();
        fs::write(dir.path().join("m_part000.mp4.enc"), b"first").unwrap();
        fs::write(dir.path().join("m_part001.mp4.enc"), b"second").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let now = Utc.with_ymd_and_hms(2024, 5, 1, 18, 0, 0).unwrap();
        let manifest = Manifest::build(dir.path(), "THEATRE_009", Duration::hours(3), now).unwrap();

        let ids: Vec<_> = manifest.shards.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["m_part000.mp4.enc", "m_part001.mp4.enc", "m_part002.mp4.enc"]
        );
        assert_eq!(
            manifest.shards[0].sha256,
            crate::modules::crypto::sha256_hex(b"first")
        );
        assert_eq!(manifest.playback_window.start, now);
        assert_eq!(manifest.playback_window.end, now + Duration::hours(3));
        assert_eq!(manifest.theatre_id, "THEATRE_009");
    }

    #[test]
    fn test_build_empty_directory_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let result = Manifest::build(dir.path(), "THEATRE_001", Duration::hours(1), Utc::now());
        assert!(matches!(result, Err(ManifestError::Malformed(_))));
    }

    #[test]
    fn test_load_missing_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        assert!(matches!(
            Manifest::load(&path),
            Err(ManifestError::Missing { .. })
        ));

        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            Manifest::load(&path),
            Err(ManifestError::Malformed(_))
        ));
    }

    #[test]
    fn test_publish_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let manifest = sample();
        manifest.publish(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n    \"theatre_id\""));
        assert_eq!(Manifest::load(&path).unwrap(), manifest);
    }

    #[test]
    fn test_accepts_naive_and_zulu_timestamps() {
        let json = format!(
            r#"{{
                "created_at": "2024-05-01T18:00:00.123456Z",
                "theatre_id": "THEATRE_001",
                "playback_window": {{
                    "start": "2024-05-01T18:00:00.123456",
                    "end": "2024-05-01T20:00:00+00:00"
                }},
                "shards": [{{"id": "x.enc", "sha256": "{}"}}]
            }}"#,
            hash('c')
        );
        let manifest = Manifest::from_json(&json).unwrap();
        assert_eq!(
            manifest.playback_window.end,
            Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap()
        );
        assert!(manifest.playback_window.start < manifest.playback_window.end);
    }

    #[test]
    fn test_validate_rejects_broken_invariants() {
        let mut reversed = sample();
        reversed.playback_window.end = reversed.playback_window.start - Duration::seconds(1);
        assert!(reversed.validate().is_err());

        let mut duplicate = sample();
        duplicate.shards[1].id = duplicate.shards[0].id.clone();
        assert!(duplicate.validate().is_err());

        let mut unsorted = sample();
        unsorted.shards.reverse();
        assert!(unsorted.validate().is_err());

        let mut traversal = sample();
        traversal.shards[0].id = "../secret.key".into();
        assert!(traversal.validate().is_err());

        let mut bad_hash = sample();
        bad_hash.shards[0].sha256 = "xyz".into();
        assert!(bad_hash.validate().is_err());

        let mut empty = sample();
        empty.shards.clear();
        assert!(empty.validate().is_err());

        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_window_phase_is_inclusive() {
        let window = sample().playback_window;
        assert_eq!(
            window.phase(window.start - Duration::seconds(1)),
            WindowPhase::Early
        );
        assert_eq!(window.phase(window.start), WindowPhase::Open);
        assert_eq!(window.phase(window.end), WindowPhase::Open);
        assert_eq!(
            window.phase(window.end + Duration::seconds(1)),
            WindowPhase::Closed
        );
        assert_eq!(
            window.remaining(window.end + Duration::hours(1)),
            Duration::zero()
        );
        assert_eq!(
            window.remaining(window.start),
            Duration::hours(2)
        );
    }
}
