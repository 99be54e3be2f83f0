use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use indexmap::IndexMap;

use crate::errors::JobError;

const IMAGE_EXT: &str = "jpg";

/// Bounded on-disk image cache keyed by prompt fingerprint.
///
/// Recency lives in `entries` (least recent first) and is mirrored into file
/// modification times so the order survives a restart. Inserting past
/// `capacity` evicts the least recently used entry and deletes its file.
#[derive(Debug)]
pub struct ImageCache {
    dir: PathBuf,
    capacity: usize,
    entries: IndexMap<String, PathBuf>,
}

impl ImageCache {
    pub fn open(dir: impl Into<PathBuf>, capacity: usize) -> Result<Self, JobError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| JobError::io_at("create", &dir, err))?;
        let mut found = scan_dir(&dir)?;
        found.sort_by_key(|(_, _, modified)| *modified);

        let mut cache = Self {
            dir,
            capacity: capacity.max(1),
            entries: IndexMap::new(),
        };
        for (key, path, _) in found {
            cache.entries.insert(key, path);
        }
        cache.evict_overflow();
        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns the cached file and marks it most recently used.
    pub fn get(&mut self, key: &str) -> Option<PathBuf> {
        let path = self.entries.shift_remove(key)?;
        if !path.exists() {
            return None;
        }
        touch(&path);
        self.entries.insert(key.to_string(), path.clone());
        Some(path)
    }

    pub fn put(&mut self, key: &str, bytes: &[u8]) -> Result<PathBuf, JobError> {
        if !is_fingerprint(key) {
            return Err(JobError::Validation(format!("invalid cache key '{key}'")));
        }
        let path = self.dir.join(format!("{key}.{IMAGE_EXT}"));
        fs::write(&path, bytes).map_err(|err| JobError::io_at("write", &path, err))?;
        self.entries.shift_remove(key);
        self.entries.insert(key.to_string(), path.clone());
        self.evict_overflow();
        Ok(path)
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        for (_, path) in self.entries.drain(..) {
            remove_quietly(&path);
        }
        removed
    }

    fn evict_overflow(&mut self) {
        while self.entries.len() > self.capacity {
            if let Some((key, path)) = self.entries.shift_remove_index(0) {
                tracing::debug!(key = %key, "evicting cached image");
                remove_quietly(&path);
            }
        }
    }
}

fn scan_dir(dir: &Path) -> Result<Vec<(String, PathBuf, SystemTime)>, JobError> {
    let mut found = Vec::new();
    let listing = fs::read_dir(dir).map_err(|err| JobError::io_at("list", dir, err))?;
    for entry in listing.flatten() {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(IMAGE_EXT) {
            continue;
        }
        let Some(key) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| is_fingerprint(stem))
            .map(str::to_string)
        else {
            continue;
        };
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        found.push((key, path, modified));
    }
    Ok(found)
}

fn is_fingerprint(key: &str) -> bool {
    key.len() == 64 && key.bytes().all(|byte| byte.is_ascii_hexdigit())
}

fn touch(path: &Path) {
    let result = fs::File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(SystemTime::now()));
    if let Err(err) = result {
        tracing::debug!(path = %path.display(), error = %err, "failed to refresh cache entry mtime");
    }
}

fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove cached image");
        }
    }
}
