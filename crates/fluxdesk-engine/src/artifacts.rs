use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use fluxdesk_contracts::errors::JobError;
use reqwest::blocking::Client as HttpClient;

use crate::http::{build_client, status_error, transport_error};

pub trait ArtifactFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, JobError>;
}

/// Downloads the finished image from the URL returned by the poll.
pub struct HttpFetcher {
    http: HttpClient,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, JobError> {
        Ok(Self {
            http: build_client(timeout)?,
        })
    }
}

impl ArtifactFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, JobError> {
        let response = self
            .http
            .get(url)
            .send()
            .map_err(|err| transport_error(&format!("image download failed ({url})"), err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(status_error(status, &body));
        }
        let bytes = response
            .bytes()
            .map_err(|err| transport_error("image bytes read failed", err))?;
        Ok(bytes.to_vec())
    }
}

pub fn temp_artifact_name(now: DateTime<Local>, tag: &str) -> String {
    format!("temp_flux_{}_{tag}.jpg", now.format("%Y%m%d_%H%M%S"))
}

/// Best effort; a file that is already gone is not an error.
pub fn cleanup_temp_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed temp artifact"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove temp artifact")
        }
    }
}

/// A downloaded image on disk that is deleted on drop unless [`keep`] was
/// called. Every failure path between download and success therefore
/// leaves nothing behind.
///
/// [`keep`]: TempArtifact::keep
#[derive(Debug)]
pub struct TempArtifact {
    path: PathBuf,
    kept: bool,
}

impl TempArtifact {
    pub fn create(dir: &Path, tag: &str, bytes: &[u8]) -> Result<Self, JobError> {
        fs::create_dir_all(dir).map_err(|err| JobError::io_at("create", dir, err))?;
        let path = dir.join(temp_artifact_name(Local::now(), tag));
        Self::create_with(path, |artifact| artifact.replace_contents(bytes))
    }

    /// The guard exists before the first byte is written, so a failed or
    /// partial write is removed on drop.
    fn create_with(
        path: PathBuf,
        write: impl FnOnce(&Self) -> Result<(), JobError>,
    ) -> Result<Self, JobError> {
        let artifact = Self { path, kept: false };
        write(&artifact)?;
        Ok(artifact)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn replace_contents(&self, bytes: &[u8]) -> Result<(), JobError> {
        fs::write(&self.path, bytes).map_err(|err| JobError::io_at("write", &self.path, err))
    }

    pub fn keep(mut self) -> PathBuf {
        self.kept = true;
        self.path.clone()
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if !self.kept {
            cleanup_temp_file(&self.path);
        }
    }
}
