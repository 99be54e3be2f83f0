use std::time::Duration;

use fluxdesk_contracts::errors::{truncate_text, JobError};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::StatusCode;
use serde_json::Value;

pub(crate) const ERROR_BODY_MAX_CHARS: usize = 512;

pub(crate) fn build_client(timeout: Duration) -> Result<HttpClient, JobError> {
    HttpClient::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| JobError::Configuration(format!("failed to build HTTP client: {err}")))
}

/// Maps a failed `send()` onto the taxonomy: anything that happened on the
/// wire is transient, a request that could not even be built is not.
pub(crate) fn transport_error(context: &str, err: reqwest::Error) -> JobError {
    if err.is_builder() {
        return JobError::Configuration(format!("{context}: {err}"));
    }
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        return JobError::TransientNetwork(format!("{context}: {err}"));
    }
    JobError::Submission(format!("{context}: {err}"))
}

/// 5xx and 429 are worth retrying; other non-2xx statuses are final.
pub(crate) fn status_error(status: StatusCode, body: &str) -> JobError {
    let body = truncate_text(body.trim(), ERROR_BODY_MAX_CHARS);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return JobError::TransientNetwork(format!(
            "server returned {}: {body}",
            status.as_u16()
        ));
    }
    JobError::Http {
        status: status.as_u16(),
        body,
    }
}

pub(crate) fn response_json_or_error(context: &str, response: HttpResponse) -> Result<Value, JobError> {
    let status = response.status();
    let body = response
        .text()
        .map_err(|err| transport_error(&format!("{context} response body read failed"), err))?;
    if !status.is_success() {
        return Err(status_error(status, &body));
    }
    serde_json::from_str(&body).map_err(|err| {
        JobError::Submission(format!("{context} returned invalid JSON payload: {err}"))
    })
}
