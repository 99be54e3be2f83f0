//! Symmetric encryption for the persisted history blob.
//!
//! The key is created once per data directory and reused for every later
//! run. It is never regenerated over an existing key file: losing the key
//! makes the existing history unreadable, and that is preferred over
//! silently re-keying.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::errors::JobError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(key.as_slice());
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, JobError> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            JobError::Configuration(format!(
                "encryption key must be {KEY_LEN} bytes, found {}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Reads the key at `path`, creating it on first use.
///
/// `protected` is the encrypted file the key guards. A missing key is only
/// created while that file is absent or empty; otherwise the data would be
/// orphaned, so the call fails with a configuration error instead. An
/// existing but unreadable key file is never replaced either.
pub fn load_or_create_key(path: &Path, protected: &Path) -> Result<EncryptionKey, JobError> {
    match fs::read_to_string(path) {
        Ok(raw) => return decode_key(path, &raw),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(JobError::io_at("read", path, err)),
    }
    ensure_nothing_to_orphan(path, protected)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| JobError::io_at("create", parent, err))?;
    }
    let key = EncryptionKey::generate();
    match create_key_file(path) {
        Ok(mut file) => {
            file.write_all(BASE64.encode(key.as_bytes()).as_bytes())
                .and_then(|_| file.sync_all())
                .map_err(|err| JobError::io_at("write", path, err))?;
            tracing::info!(path = %path.display(), "created history encryption key");
            Ok(key)
        }
        // Another process won the race; use its key.
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            let raw = fs::read_to_string(path).map_err(|err| JobError::io_at("read", path, err))?;
            decode_key(path, &raw)
        }
        Err(err) => Err(JobError::io_at("create", path, err)),
    }
}

fn ensure_nothing_to_orphan(path: &Path, protected: &Path) -> Result<(), JobError> {
    match fs::metadata(protected) {
        Ok(meta) if meta.len() > 0 => Err(JobError::Configuration(format!(
            "encryption key {} is missing but {} holds encrypted data; restore the key or move the data aside",
            path.display(),
            protected.display()
        ))),
        Ok(_) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(JobError::io_at("inspect", protected, err)),
    }
}

fn decode_key(path: &Path, raw: &str) -> Result<EncryptionKey, JobError> {
    let bytes = BASE64.decode(raw.trim().as_bytes()).map_err(|err| {
        JobError::Configuration(format!(
            "encryption key at {} is not valid base64: {err}",
            path.display()
        ))
    })?;
    EncryptionKey::from_bytes(&bytes)
}

#[cfg(unix)]
fn create_key_file(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_key_file(path: &Path) -> std::io::Result<fs::File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// AES-256-GCM over whole blobs. Output layout is `nonce || ciphertext+tag`.
#[derive(Clone)]
pub struct CryptoStore {
    cipher: Aes256Gcm,
    key_path: Option<PathBuf>,
}

impl CryptoStore {
    pub fn new(key: &EncryptionKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes())),
            key_path: None,
        }
    }

    /// Opens the key guarding `protected`, creating it when nothing is
    /// encrypted yet.
    pub fn open(key_path: impl Into<PathBuf>, protected: &Path) -> Result<Self, JobError> {
        let key_path = key_path.into();
        let key = load_or_create_key(&key_path, protected)?;
        let mut store = Self::new(&key);
        store.key_path = Some(key_path);
        Ok(store)
    }

    pub fn key_path(&self) -> Option<&Path> {
        self.key_path.as_deref()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, JobError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| JobError::Configuration("history encryption failed".to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, JobError> {
        if blob.len() < NONCE_LEN {
            return Err(JobError::Decrypt(format!(
                "blob too short ({} bytes)",
                blob.len()
            )));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                JobError::Decrypt("authentication failed (tampered data or wrong key)".to_string())
            })
    }
}

impl std::fmt::Debug for CryptoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoStore")
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}
