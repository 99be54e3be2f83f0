use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::JobError;

pub const MAX_PROMPT_CHARS: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "4:3")]
    Landscape4x3,
    #[serde(rename = "16:9")]
    Wide16x9,
    #[serde(rename = "9:16")]
    Tall9x16,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 4] = [
        AspectRatio::Square,
        AspectRatio::Landscape4x3,
        AspectRatio::Wide16x9,
        AspectRatio::Tall9x16,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Square => "1:1",
            Self::Landscape4x3 => "4:3",
            Self::Wide16x9 => "16:9",
            Self::Tall9x16 => "9:16",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AspectRatio {
    type Err = JobError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        Self::ALL
            .into_iter()
            .find(|ratio| ratio.as_str() == trimmed)
            .ok_or_else(|| {
                JobError::Validation(format!(
                    "Unsupported aspect ratio '{trimmed}' (expected one of 1:1, 4:3, 16:9, 9:16)"
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Standard,
    High,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = JobError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "high" => Ok(Self::High),
            other => Err(JobError::Validation(format!(
                "Unsupported quality '{other}' (expected standard or high)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct GenerationParams {
    pub aspect_ratio: AspectRatio,
    pub quality: Quality,
}

/// A validated prompt plus its parameters. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    prompt: String,
    params: GenerationParams,
}

impl GenerationRequest {
    pub fn new(prompt: &str, params: GenerationParams) -> Result<Self, JobError> {
        let prompt = validate_prompt(prompt)?;
        Ok(Self { prompt, params })
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn params(&self) -> GenerationParams {
        self.params
    }

    pub fn aspect_ratio(&self) -> AspectRatio {
        self.params.aspect_ratio
    }

    pub fn quality(&self) -> Quality {
        self.params.quality
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.prompt, self.params)
    }
}

/// Trims the prompt and enforces the 1..=5000 character window.
pub fn validate_prompt(raw: &str) -> Result<String, JobError> {
    let prompt = raw.trim();
    if prompt.is_empty() {
        return Err(JobError::Validation("Prompt cannot be empty".to_string()));
    }
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(JobError::Validation(format!(
            "Prompt too long (max {MAX_PROMPT_CHARS} characters)"
        )));
    }
    Ok(prompt.to_string())
}

pub fn fingerprint(prompt: &str, params: GenerationParams) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update([0u8]);
    hasher.update(params.aspect_ratio.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(params.quality.as_str().as_bytes());
    hex::encode(hasher.finalize())
}
