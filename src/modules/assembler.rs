//! Verifies and decrypts an ordered shard set into one playable artifact.
//!
//! Fail-closed: a shard is hashed before it is decrypted, the first failure
//! aborts the whole assembly, and plaintext only ever exists inside a
//! transient directory that is removed on every exit path.

use log::{debug, info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{AssemblyError, CipherError};
use crate::modules::crypto::{digest_matches, sha256_hex, ShardCipher, ShardKey};
use crate::modules::manifest::{Manifest, ShardEntry};
use crate::modules::tools::Remuxer;

pub struct ShardAssembler {
    shard_dir: PathBuf,
    cipher: Arc<dyn ShardCipher>,
    remuxer: Arc<dyn Remuxer>,
}

impl ShardAssembler {
    pub fn new(
        shard_dir: impl Into<PathBuf>,
        cipher: Arc<dyn ShardCipher>,
        remuxer: Arc<dyn Remuxer>,
    ) -> Self {
        Self {
            shard_dir: shard_dir.into(),
            cipher,
            remuxer,
        }
    }

    /// Hash-check and decrypt only the first shard. The plaintext is dropped.
    pub fn verify_first_shard(&self, manifest: &Manifest, key: &ShardKey) -> Result<(), AssemblyError> {
        let entry = manifest
            .first_shard()
            .ok_or_else(|| AssemblyError::IntegrityViolation {
                shard_id: String::new(),
                reason: "manifest lists no shards".into(),
            })?;
        self.open_shard(0, entry, key).map(|_| ())
    }

    /// Rebuild the full asset at `artifact_path`.
    pub fn assemble(
        &self,
        manifest: &Manifest,
        key: &ShardKey,
        artifact_path: &Path,
    ) -> Result<PathBuf, AssemblyError> {
        let parent = artifact_path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "artifact path has no parent"))?;
        fs::create_dir_all(parent)?;
        let scratch = tempfile::Builder::new()
            .prefix(".assembly-")
            .tempdir_in(parent)?;

        let mut parts = Vec::with_capacity(manifest.shards.len());
        for (index, entry) in manifest.shards.iter().enumerate() {
            let plaintext = self.open_shard(index, entry, key)?;
            let part = scratch.path().join(plain_name(&entry.id));
            fs::write(&part, &plaintext)?;
            parts.push(part);
            debug!("Decrypted shard {} ({} bytes)", entry.id, plaintext.len());
        }

        let joined = scratch.path().join("assembled.mp4");
        self.remuxer.concat(&parts, &joined)?;
        fs::rename(&joined, artifact_path)?;

        info!(
            "Assembled {} shards into {}",
            parts.len(),
            artifact_path.display()
        );
        Ok(artifact_path.to_path_buf())
    }

    fn open_shard(&self, index: usize, entry: &ShardEntry, key: &ShardKey) -> Result<Vec<u8>, AssemblyError> {
        let path = self.shard_dir.join(&entry.id);
        let encrypted = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Shard {} is missing", entry.id);
                return Err(AssemblyError::IntegrityViolation {
                    shard_id: entry.id.clone(),
                    reason: "shard file is missing".into(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if !digest_matches(&entry.sha256, &sha256_hex(&encrypted)) {
            warn!("Shard {} failed hash verification", entry.id);
            return Err(AssemblyError::IntegrityViolation {
                shard_id: entry.id.clone(),
                reason: "hash mismatch".into(),
            });
        }

        self.cipher
            .decrypt(&encrypted, key)
            .map_err(|e| decrypt_failure(index, entry, e))
    }
}

// Shard 0 decides whether the key is right; after that the key is known good
// and any failure means the shard itself is bad.
fn decrypt_failure(index: usize, entry: &ShardEntry, err: CipherError) -> AssemblyError {
    if index == 0 {
        debug!("Key rejected on first shard: {}", err);
        AssemblyError::InvalidKey
    } else {
        AssemblyError::IntegrityViolation {
            shard_id: entry.id.clone(),
            reason: err.to_string(),
        }
    }
}

fn plain_name(shard_id: &str) -> String {
    shard_id
        .strip_suffix(".enc")
        .unwrap_or(shard_id)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::crypto::AesGcmCipher;
    use crate::modules::manifest::ShardEntry;
    use crate::modules::tools::ByteConcatRemuxer;
    use chrono::{Duration, Utc};

    struct Fixture {
        dir: tempfile::TempDir,
        key: ShardKey,
        manifest: Manifest,
    }

    impl Fixture {
        fn new(parts: &[&[u8]]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let shards = dir.path().join("shards");
            fs::create_dir_all(&shards).unwrap();
            fs::create_dir_all(dir.path().join("temp")).unwrap();

            let key = ShardKey::generate();
            for (i, part) in parts.iter().enumerate() {
                let sealed = AesGcmCipher.encrypt(part, &key).unwrap();
                fs::write(shards.join(format!("m_part{:03}.mp4.enc", i)), sealed).unwrap();
            }
            let manifest = Manifest::build(&shards, "THEATRE_001", Duration::hours(2), Utc::now()).unwrap();
            Self { dir, key, manifest }
        }

        fn assembler(&self) -> ShardAssembler {
            ShardAssembler::new(
                self.dir.path().join("shards"),
                Arc::new(AesGcmCipher),
                Arc::new(ByteConcatRemuxer),
            )
        }

        fn artifact(&self) -> PathBuf {
            self.dir.path().join("temp").join("token.mp4")
        }

        fn temp_entries(&self) -> usize {
            fs::read_dir(self.dir.path().join("temp")).unwrap().count()
        }
    }

    #[test]
    fn test_assemble_in_order() {
        let fx = Fixture::new(&[b"alpha-", b"beta-", b"gamma"]);
        let out = fx.assembler().assemble(&fx.manifest, &fx.key, &fx.artifact()).unwrap();
        assert_eq!(fs::read(out).unwrap(), b"alpha-beta-gamma");
        assert_eq!(fx.temp_entries(), 1);
    }

    #[test]
    fn test_wrong_key_is_invalid_key() {
        let fx = Fixture::new(&[b"alpha", b"beta"]);
        let wrong = ShardKey::generate();
        let assembler = fx.assembler();

        assert!(matches!(
            assembler.verify_first_shard(&fx.manifest, &wrong),
            Err(AssemblyError::InvalidKey)
        ));
        assert!(matches!(
            assembler.assemble(&fx.manifest, &wrong, &fx.artifact()),
            Err(AssemblyError::InvalidKey)
        ));
        assert_eq!(fx.temp_entries(), 0);
        assert!(assembler.verify_first_shard(&fx.manifest, &fx.key).is_ok());
    }

    #[test]
    fn test_tampered_shard_aborts_without_plaintext() {
        let fx = Fixture::new(&[b"alpha", b"beta", b"gamma"]);
        let victim = fx.dir.path().join("shards").join(&fx.manifest.shards[1].id);
        let mut bytes = fs::read(&victim).unwrap();
        bytes[20] ^= 0xff;
        fs::write(&victim, bytes).unwrap();

        let result = fx.assembler().assemble(&fx.manifest, &fx.key, &fx.artifact());
        match result {
            Err(AssemblyError::IntegrityViolation { shard_id, .. }) => {
                assert_eq!(shard_id, fx.manifest.shards[1].id)
            }
            other => panic!("expected integrity violation, got {:?}", other),
        }
        assert!(!fx.artifact().exists());
        assert_eq!(fx.temp_entries(), 0);
    }

    #[test]
    fn test_missing_shard_is_integrity_violation() {
        let fx = Fixture::new(&[b"alpha", b"beta"]);
        fs::remove_file(fx.dir.path().join("shards").join(&fx.manifest.shards[1].id)).unwrap();
        let result = fx.assembler().assemble(&fx.manifest, &fx.key, &fx.artifact());
        assert!(matches!(result, Err(AssemblyError::IntegrityViolation { .. })));
    }

    #[test]
    fn test_later_shard_under_other_key_is_integrity_violation() {
        let mut fx = Fixture::new(&[b"alpha", b"beta"]);
        let shards = fx.dir.path().join("shards");
        let rogue = AesGcmCipher.encrypt(b"beta", &ShardKey::generate()).unwrap();
        fs::write(shards.join(&fx.manifest.shards[1].id), &rogue).unwrap();
        fx.manifest.shards[1] = ShardEntry {
            id: fx.manifest.shards[1].id.clone(),
            sha256: sha256_hex(&rogue),
        };

        let result = fx.assembler().assemble(&fx.manifest, &fx.key, &fx.artifact());
        assert!(matches!(result, Err(AssemblyError::IntegrityViolation { .. })));
    }

    #[test]
    fn test_plain_name() {
        assert_eq!(plain_name("m_part000.mp4.enc"), "m_part000.mp4");
        assert_eq!(plain_name("raw"), "raw");
    }
}
