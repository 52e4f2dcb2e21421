//! On-disk working area shared by the producer pipeline and authorization.
//!
//! ```text
//! <root>/
//!   uploads/              accepted source files
//!   staging/<movie_id>/   private to one pipeline run
//!     plain/              segmenter output
//!     encrypted/          encrypted shards awaiting publication
//!   encrypted_shards/     published shard set
//!   manifest.json         published manifest
//!   temp/                 assembled artifacts, owned by the session store
//!   audit_log.json
//! ```
//!
//! Publication swaps the staged shard directory in with a rename and only
//! then renames the manifest into place, all under the publication write
//! lock. Authorization reads under the read lock.

use log::{info, warn};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard};

use crate::error::ManifestError;
use crate::modules::manifest::Manifest;

const UPLOADS_DIR: &str = "uploads";
const STAGING_DIR: &str = "staging";
const SHARDS_DIR: &str = "encrypted_shards";
const ARTIFACTS_DIR: &str = "temp";
const MANIFEST_FILE: &str = "manifest.json";
const AUDIT_FILE: &str = "audit_log.json";

/// Extension carried by every encrypted shard file.
pub const SHARD_EXTENSION: &str = "enc";

pub struct Workspace {
    root: PathBuf,
    publication: RwLock<()>,
}

impl Workspace {
    /// Create the directory layout under `root`.
    ///
    /// Leftover staging areas and artifacts from a previous process are
    /// removed: they are either half-built shard sets or decrypted content.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let workspace = Self {
            root: root.into(),
            publication: RwLock::new(()),
        };
        fs::create_dir_all(&workspace.root)?;
        fs::create_dir_all(workspace.uploads_dir())?;
        fs::create_dir_all(workspace.shards_dir())?;
        reset_dir(&workspace.staging_root())?;
        reset_dir(&workspace.artifacts_dir())?;
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join(UPLOADS_DIR)
    }

    pub fn shards_dir(&self) -> PathBuf {
        self.root.join(SHARDS_DIR)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join(ARTIFACTS_DIR)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.root.join(AUDIT_FILE)
    }

    /// Where the assembled artifact for `token` lives.
    pub fn artifact_path(&self, token: &str) -> PathBuf {
        self.artifacts_dir().join(format!("{}.mp4", token))
    }

    fn staging_root(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Hold this guard while reading the published manifest and shards.
    pub fn read_publication(&self) -> RwLockReadGuard<'_, ()> {
        self.publication
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True when the published shard directory holds at least one shard.
    pub fn has_published_shards(&self) -> bool {
        fs::read_dir(self.shards_dir())
            .map(|entries| {
                entries.flatten().any(|entry| {
                    entry.path().extension().and_then(|ext| ext.to_str()) == Some(SHARD_EXTENSION)
                })
            })
            .unwrap_or(false)
    }

    /// Create a fresh staging area for one pipeline run.
    pub fn stage(&self, movie_id: &str) -> io::Result<StagingArea> {
        let root = self.staging_root().join(movie_id);
        reset_dir(&root)?;
        let staging = StagingArea {
            plain_dir: root.join("plain"),
            encrypted_dir: root.join("encrypted"),
            root,
        };
        fs::create_dir_all(&staging.plain_dir)?;
        fs::create_dir_all(&staging.encrypted_dir)?;
        Ok(staging)
    }

    /// Make a staged shard set and its manifest the published version.
    pub fn publish(&self, staging: &StagingArea, manifest: &Manifest) -> Result<(), ManifestError> {
        manifest.validate()?;
        let _guard = self
            .publication
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let shards_dir = self.shards_dir();
        let retired = self.root.join(format!(
            "{}.retired-{}",
            SHARDS_DIR,
            staging.movie_id()
        ));
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }
        if shards_dir.exists() {
            fs::rename(&shards_dir, &retired)?;
        }
        if let Err(e) = fs::rename(&staging.encrypted_dir, &shards_dir) {
            if retired.exists() {
                let _ = fs::rename(&retired, &shards_dir);
            }
            return Err(e.into());
        }
        sync_dir(&self.root);

        if let Err(e) = manifest.publish(&self.manifest_path()) {
            restore_shards(&shards_dir, &retired, &staging.encrypted_dir);
            sync_dir(&self.root);
            return Err(e);
        }

        if retired.exists() {
            if let Err(e) = fs::remove_dir_all(&retired) {
                warn!("Failed to remove retired shard set {}: {}", retired.display(), e);
            }
        }
        info!(
            "Published {} shards for theatre {}",
            manifest.shards.len(),
            manifest.theatre_id
        );
        Ok(())
    }

    /// Remove every assembled artifact. Used at shutdown.
    pub fn clear_artifacts(&self) -> io::Result<()> {
        reset_dir(&self.artifacts_dir())
    }
}

/// Private per-run directory. Removed when dropped, whatever the outcome.
#[derive(Debug)]
pub struct StagingArea {
    root: PathBuf,
    plain_dir: PathBuf,
    encrypted_dir: PathBuf,
}

impl StagingArea {
    pub fn plain_dir(&self) -> &Path {
        &self.plain_dir
    }

    pub fn encrypted_dir(&self) -> &Path {
        &self.encrypted_dir
    }

    fn movie_id(&self) -> String {
        self.root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.root) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove staging area {}: {}", self.root.display(), e);
            }
        }
    }
}

/// Write `data` to a sibling temporary file, fsync it, then rename over `path`.
pub fn write_atomically(path: &Path, data: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let temp_path = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)
}

/// Write `data` to `path` and flush it to durable storage.
pub fn write_durably(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

// Put the previous shard set back after a failed manifest write.
fn restore_shards(shards_dir: &Path, retired: &Path, staged: &Path) {
    if let Err(e) = fs::rename(shards_dir, staged) {
        warn!("Failed to unstage shard set {}: {}", shards_dir.display(), e);
        if let Err(e) = fs::remove_dir_all(shards_dir) {
            warn!("Failed to remove shard set {}: {}", shards_dir.display(), e);
        }
    }
    let restored = if retired.exists() {
        fs::rename(retired, shards_dir)
    } else {
        fs::create_dir_all(shards_dir)
    };
    if let Err(e) = restored {
        warn!("Failed to restore shard set {}: {}", shards_dir.display(), e);
    }
}

fn reset_dir(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::create_dir_all(dir)
}

// Directory fsync is unsupported on some platforms.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}
