use fluxdesk_contracts::config::EngineConfig;
use fluxdesk_contracts::errors::JobError;
use fluxdesk_contracts::request::GenerationRequest;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::generation::{GenerationApi, PollHandle, PollOutcome};
use crate::http::{build_client, response_json_or_error, transport_error};

/// HTTP client for the Flux submit/poll API, authenticated with `X-Key`.
pub struct FluxClient {
    endpoint: String,
    api_key: String,
    output_format: String,
    safety_tolerance: u8,
    raw: bool,
    http: HttpClient,
}

impl FluxClient {
    pub fn new(config: &EngineConfig, api_key: impl Into<String>) -> Result<Self, JobError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(JobError::Configuration(
                "FLUX_API_KEY environment variable not set".to_string(),
            ));
        }
        Ok(Self {
            endpoint: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            output_format: config.output_format.clone(),
            safety_tolerance: config.safety_tolerance,
            raw: config.raw,
            http: build_client(config.request_timeout())?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn submit_payload(&self, request: &GenerationRequest) -> Value {
        json!({
            "prompt": request.prompt(),
            "aspect_ratio": request.aspect_ratio().as_str(),
            "output_format": self.output_format,
            "quality": request.quality().as_str(),
            "safety_tolerance": self.safety_tolerance.to_string(),
            "raw": self.raw.to_string(),
        })
    }
}

impl GenerationApi for FluxClient {
    fn submit(&self, request: &GenerationRequest) -> Result<PollHandle, JobError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("x-key", &self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .json(&self.submit_payload(request))
            .send()
            .map_err(|err| transport_error(&format!("Flux request failed ({})", self.endpoint), err))?;
        let payload = response_json_or_error("Flux", response)?;
        parse_submit_response(&payload)
    }

    fn poll(&self, handle: &PollHandle) -> Result<PollOutcome, JobError> {
        let response = self
            .http
            .get(handle.as_str())
            .header("x-key", &self.api_key)
            .header(ACCEPT, "application/json")
            .send()
            .map_err(|err| transport_error(&format!("Flux poll failed ({handle})"), err))?;
        let payload = response_json_or_error("Flux poll", response)?;
        parse_poll_response(&payload)
    }
}

pub fn parse_submit_response(payload: &Value) -> Result<PollHandle, JobError> {
    payload
        .get("polling_url")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(PollHandle::new)
        .ok_or_else(|| JobError::Submission("No polling URL received from API".to_string()))
}

pub fn parse_poll_response(payload: &Value) -> Result<PollOutcome, JobError> {
    let raw_status = payload
        .get("status")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    let status = raw_status.to_ascii_lowercase().replace(' ', "");
    match status.as_str() {
        "ready" => {
            let sample = payload
                .get("result")
                .and_then(|result| result.get("sample"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| {
                    JobError::Submission("Flux ready response missing result.sample".to_string())
                })?;
            Ok(PollOutcome::Ready(sample.to_string()))
        }
        "requestmoderated" | "contentmoderated" => {
            Ok(PollOutcome::Moderated(raw_status.to_string()))
        }
        "error" | "failed" | "tasknotfound" => Ok(PollOutcome::Failed(format!(
            "status {raw_status}: {}",
            payload.get("details").cloned().unwrap_or(Value::Null)
        ))),
        _ => Ok(PollOutcome::Pending),
    }
}
