//! Optional second pass through the Stability image-to-image endpoint.
//!
//! One bounded call, no retry: every failure is terminal and surfaces as
//! `JobError::Refinement` carrying whatever message the remote sent back.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use fluxdesk_contracts::config::EngineConfig;
use fluxdesk_contracts::errors::{truncate_text, JobError};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;

use crate::http::{build_client, ERROR_BODY_MAX_CHARS};

pub const MIN_STRENGTH: f32 = 0.1;
pub const MAX_STRENGTH: f32 = 0.9;

#[derive(Debug, Clone, PartialEq)]
pub struct RefineOptions {
    pub strength: f32,
    pub negative_prompt: String,
    pub steps: u32,
    pub guidance_scale: f32,
}

impl Default for RefineOptions {
    fn default() -> Self {
        Self {
            strength: 0.35,
            negative_prompt: String::new(),
            steps: 30,
            guidance_scale: 7.0,
        }
    }
}

impl RefineOptions {
    pub fn with_strength(strength: f32) -> Self {
        Self {
            strength,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if !(MIN_STRENGTH..=MAX_STRENGTH).contains(&self.strength) {
            return Err(JobError::Validation(format!(
                "Refinement strength must be between {MIN_STRENGTH} and {MAX_STRENGTH}"
            )));
        }
        Ok(())
    }
}

pub trait RefinementApi: Send + Sync {
    fn refine(
        &self,
        image: &[u8],
        prompt: &str,
        options: &RefineOptions,
    ) -> Result<Vec<u8>, JobError>;
}

/// Rejects out-of-range options before any network traffic.
pub fn refine_image(
    api: &dyn RefinementApi,
    image: &[u8],
    prompt: &str,
    options: &RefineOptions,
) -> Result<Vec<u8>, JobError> {
    options.validate()?;
    api.refine(image, prompt, options)
}

pub struct StabilityRefiner {
    endpoint: String,
    api_key: String,
    output_format: String,
    http: HttpClient,
}

impl StabilityRefiner {
    pub fn new(config: &EngineConfig, api_key: impl Into<String>) -> Result<Self, JobError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(JobError::Configuration(
                "STABILITY_API_KEY environment variable not set".to_string(),
            ));
        }
        Ok(Self {
            endpoint: config.refine_endpoint.clone(),
            api_key,
            output_format: config.output_format.clone(),
            http: build_client(config.refinement_timeout())?,
        })
    }

    fn form(
        &self,
        image: &[u8],
        prompt: &str,
        options: &RefineOptions,
    ) -> Result<MultipartForm, JobError> {
        let part = MultipartPart::bytes(image.to_vec())
            .file_name("image.jpg")
            .mime_str("image/jpeg")
            .map_err(|err| JobError::Refinement(format!("invalid image part: {err}")))?;
        Ok(MultipartForm::new()
            .part("image", part)
            .text("prompt", prompt.to_string())
            .text("negative_prompt", options.negative_prompt.clone())
            .text("strength", options.strength.to_string())
            .text("steps", options.steps.to_string())
            .text("guidance_scale", options.guidance_scale.to_string())
            .text("mode", "image-to-image")
            .text("output_format", self.output_format.clone()))
    }
}

impl RefinementApi for StabilityRefiner {
    fn refine(
        &self,
        image: &[u8],
        prompt: &str,
        options: &RefineOptions,
    ) -> Result<Vec<u8>, JobError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("Accept", "image/*")
            .multipart(self.form(image, prompt, options)?)
            .send()
            .map_err(|err| {
                JobError::Refinement(format!("request failed ({}): {err}", self.endpoint))
            })?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default();
        let body = response
            .bytes()
            .map_err(|err| JobError::Refinement(format!("failed reading response: {err}")))?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            let detail = remote_error_message(&text)
                .unwrap_or_else(|| truncate_text(text.trim(), ERROR_BODY_MAX_CHARS));
            return Err(JobError::Refinement(format!(
                "remote returned {}: {detail}",
                status.as_u16()
            )));
        }
        if content_type.starts_with("image/") {
            return Ok(body.to_vec());
        }
        decode_json_image(&body)
    }
}

fn decode_json_image(body: &[u8]) -> Result<Vec<u8>, JobError> {
    let payload: Value = serde_json::from_slice(body)
        .map_err(|err| JobError::Refinement(format!("unexpected response body: {err}")))?;
    let encoded = payload
        .get("image")
        .and_then(Value::as_str)
        .ok_or_else(|| JobError::Refinement("response carried no image".to_string()))?;
    BASE64
        .decode(encoded)
        .map_err(|err| JobError::Refinement(format!("invalid base64 image: {err}")))
}

/// Pulls the human-readable message out of a structured error body.
pub fn remote_error_message(body: &str) -> Option<String> {
    let payload: Value = serde_json::from_str(body).ok()?;
    for key in ["message", "error"] {
        match payload.get(key) {
            Some(Value::String(message)) if !message.trim().is_empty() => {
                return Some(message.trim().to_string());
            }
            Some(Value::Object(inner)) => {
                if let Some(message) = inner.get("message").and_then(Value::as_str) {
                    return Some(message.trim().to_string());
                }
            }
            _ => {}
        }
    }
    let errors: Vec<&str> = payload
        .get("errors")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(Value::as_str)
        .collect();
    (!errors.is_empty()).then(|| errors.join("; "))
}
