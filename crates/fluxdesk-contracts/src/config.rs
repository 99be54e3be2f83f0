use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::JobError;

pub const DEFAULT_API_BASE: &str = "https://api.us1.bfl.ai/v1/flux-pro-1.1-ultra";
pub const DEFAULT_REFINE_ENDPOINT: &str =
    "https://api.stability.ai/v2beta/stable-image/generate/sd3";

/// Engine-wide tunables. Defaults reproduce the fixed constants of the
/// desktop client: 10 attempts, 5 s between attempts, 120 s refinement budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
    pub refinement_timeout_s: u64,
    pub request_timeout_s: u64,
    pub download_timeout_s: u64,
    pub batch_concurrency: Option<usize>,
    pub cache_capacity: usize,
    pub api_base: String,
    pub refine_endpoint: String,
    pub output_format: String,
    pub safety_tolerance: u8,
    pub raw: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            poll_interval_ms: 5_000,
            refinement_timeout_s: 120,
            request_timeout_s: 30,
            download_timeout_s: 60,
            batch_concurrency: None,
            cache_capacity: 64,
            api_base: DEFAULT_API_BASE.to_string(),
            refine_endpoint: DEFAULT_REFINE_ENDPOINT.to_string(),
            output_format: "jpeg".to_string(),
            safety_tolerance: 6,
            raw: true,
        }
    }
}

impl EngineConfig {
    /// Defaults, then `config.json` if readable, then environment overrides.
    pub fn load(config_path: Option<&Path>) -> Self {
        let base = config_path
            .and_then(read_config_file)
            .unwrap_or_default();
        base.with_env_overrides()
    }

    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(value) = env_u64("FLUXDESK_MAX_ATTEMPTS") {
            self.max_attempts = value.clamp(1, 50) as u32;
        }
        if let Some(value) = env_u64("FLUXDESK_POLL_INTERVAL_MS") {
            self.poll_interval_ms = value.min(60_000);
        }
        if let Some(value) = env_u64("FLUXDESK_REFINE_TIMEOUT_S") {
            self.refinement_timeout_s = value.clamp(1, 600);
        }
        if let Some(value) = env_u64("FLUXDESK_BATCH_CONCURRENCY") {
            self.batch_concurrency = Some(value.clamp(1, 64) as usize);
        }
        if let Some(value) = env_u64("FLUXDESK_CACHE_CAPACITY") {
            self.cache_capacity = value.clamp(1, 4096) as usize;
        }
        if let Some(value) = non_empty_env("FLUX_API_BASE") {
            self.api_base = value.trim_end_matches('/').to_string();
        }
        if let Some(value) = non_empty_env("FLUXDESK_REFINE_ENDPOINT") {
            self.refine_endpoint = value.trim_end_matches('/').to_string();
        }
        self
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn refinement_timeout(&self) -> Duration {
        Duration::from_secs(self.refinement_timeout_s.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_s.max(1))
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_s.max(1))
    }
}

fn read_config_file(path: &Path) -> Option<EngineConfig> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<EngineConfig>(&raw) {
        Ok(config) => Some(config),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable config file");
            None
        }
    }
}

/// The two API secrets. Both are required before any job may start.
#[derive(Clone)]
pub struct Credentials {
    pub flux_api_key: String,
    pub refine_api_key: String,
}

impl Credentials {
    pub fn from_env() -> Result<Self, JobError> {
        let flux_api_key = non_empty_env("FLUX_API_KEY")
            .or_else(|| non_empty_env("BFL_API_KEY"))
            .ok_or_else(|| {
                JobError::Configuration("FLUX_API_KEY environment variable not set".to_string())
            })?;
        let refine_api_key = non_empty_env("STABILITY_API_KEY").ok_or_else(|| {
            JobError::Configuration("STABILITY_API_KEY environment variable not set".to_string())
        })?;
        Ok(Self {
            flux_api_key,
            refine_api_key,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("flux_api_key", &"<redacted>")
            .field("refine_api_key", &"<redacted>")
            .finish()
    }
}

/// Per-user application directory layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub root: PathBuf,
}

impl AppPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Explicit root, then `FLUXDESK_HOME`, then the platform data dir.
    pub fn resolve(explicit: Option<PathBuf>) -> Result<Self, JobError> {
        if let Some(root) = explicit {
            return Ok(Self::new(root));
        }
        if let Some(root) = non_empty_env("FLUXDESK_HOME") {
            return Ok(Self::new(root));
        }
        dirs::data_dir()
            .map(|dir| Self::new(dir.join("fluxdesk")))
            .ok_or_else(|| {
                JobError::Configuration("could not determine a per-user data directory".to_string())
            })
    }

    pub fn ensure(&self) -> Result<(), JobError> {
        for dir in [self.root.clone(), self.images_dir(), self.temp_dir()] {
            std::fs::create_dir_all(&dir).map_err(|err| JobError::io_at("create", &dir, err))?;
        }
        Ok(())
    }

    pub fn history_file(&self) -> PathBuf {
        self.root.join("history.enc")
    }

    pub fn key_file(&self) -> PathBuf {
        self.root.join("history.key")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn events_file(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    non_empty_env(key).and_then(|raw| raw.parse::<u64>().ok())
}
