//! Shard encryption with AES-256-GCM and SHA-256 content digests.
//!
//! Ciphertext layout: `[nonce (12B)][ciphertext][tag (16B)]`.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::KeyInit;
use aes_gcm::aead::{Aead, Key};
use aes_gcm::Aes256Gcm;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use rand_core::{OsRng, RngCore};
use secrecy::{ExposeSecret, Secret};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;

use crate::error::CipherError;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const MIN_CIPHERTEXT_SIZE: usize = NONCE_SIZE + TAG_SIZE;

/// Symmetric shard key. Zeroized on drop.
pub struct ShardKey {
    inner: Secret<[u8; KEY_SIZE]>,
}

impl ShardKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self {
            inner: Secret::new(bytes),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CipherError> {
        if bytes.len() != KEY_SIZE {
            return Err(CipherError::InvalidKeySize {
                expected: KEY_SIZE,
                got: bytes.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self {
            inner: Secret::new(key),
        })
    }

    /// Parse the URL-safe base64 form handed to theatres. Padding is optional.
    pub fn from_encoded(encoded: &str) -> Result<Self, CipherError> {
        let trimmed = encoded.trim();
        let bytes = URL_SAFE
            .decode(trimmed)
            .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
            .map_err(|e| CipherError::InvalidKeyEncoding(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_encoded(&self) -> String {
        URL_SAFE.encode(self.inner.expose_secret())
    }

    fn aead_key(&self) -> Key<Aes256Gcm> {
        Key::<Aes256Gcm>::from(*self.inner.expose_secret())
    }
}

impl fmt::Debug for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ShardKey([REDACTED])")
    }
}

impl Clone for ShardKey {
    fn clone(&self) -> Self {
        Self {
            inner: Secret::new(*self.inner.expose_secret()),
        }
    }
}

/// Authenticated-encryption provider used for shards.
pub trait ShardCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], key: &ShardKey) -> Result<Vec<u8>, CipherError>;
    fn decrypt(&self, ciphertext: &[u8], key: &ShardKey) -> Result<Vec<u8>, CipherError>;
}

/// AES-256-GCM with a random 96-bit nonce per shard.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesGcmCipher;

impl ShardCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8], key: &ShardKey) -> Result<Vec<u8>, CipherError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let nonce_ga = GenericArray::from_slice(&nonce);

        let cipher = Aes256Gcm::new(&key.aead_key());
        let sealed = cipher
            .encrypt(nonce_ga, plaintext)
            .map_err(|e| CipherError::EncryptionFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8], key: &ShardKey) -> Result<Vec<u8>, CipherError> {
        if ciphertext.len() < MIN_CIPHERTEXT_SIZE {
            return Err(CipherError::CiphertextTooShort {
                len: ciphertext.len(),
            });
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);
        let cipher = Aes256Gcm::new(&key.aead_key());
        cipher
            .decrypt(GenericArray::from_slice(nonce), sealed)
            .map_err(|e| CipherError::DecryptionFailed(e.to_string()))
    }
}

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Lowercase hex SHA-256 of a file, streamed.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compare two hex digests without early exit.
pub fn digest_matches(expected: &str, actual: &str) -> bool {
    let a = expected.as_bytes();
    let b = actual.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x.to_ascii_lowercase() ^ y.to_ascii_lowercase();
    }
    diff == 0
}
