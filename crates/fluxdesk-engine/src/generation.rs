//! Submit-and-poll protocol for the primary image API.
//!
//! A job moves `Submitted -> Polling -> {Ready | Moderated | TimedOut |
//! TransientFailed}`. [`run_generation`] drives that machine: it polls at a
//! fixed interval up to the attempt cap and, when the submission or a poll
//! round-trip fails transiently, restarts the whole sequence up to the same
//! cap.

use std::fmt;
use std::time::Duration;

use fluxdesk_contracts::config::EngineConfig;
use fluxdesk_contracts::errors::JobError;
use fluxdesk_contracts::request::GenerationRequest;

use crate::cancel::CancelToken;

/// Opaque reference to an in-progress remote job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollHandle(String);

impl PollHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PollHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Ready(String),
    Pending,
    Moderated(String),
    Failed(String),
}

pub trait GenerationApi: Send + Sync {
    /// One round-trip; fails with `JobError::Submission` when no poll handle
    /// comes back.
    fn submit(&self, request: &GenerationRequest) -> Result<PollHandle, JobError>;

    /// One round-trip per call.
    fn poll(&self, handle: &PollHandle) -> Result<PollOutcome, JobError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub max_attempts: u32,
    pub poll_interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for PollSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.attempts(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// Progress hooks for one job. Attempt numbers are 1-indexed.
///
/// `on_poll` ticks once per poll, and once per submission attempt that fails
/// before a poll handle exists, so a submit retry cycle still reports
/// `(1, total)` through `(total, total)`.
pub trait ProgressSink: Sync {
    fn on_poll(&self, attempt: u32, total: u32);

    fn on_retry(&self, _attempt: u32, _total: u32, _error: &JobError) {}
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_poll(&self, _attempt: u32, _total: u32) {}
}

/// Runs submit-and-poll to completion and returns the artifact URL.
///
/// Terminal outcomes: `Ok(url)`, `ContentPolicy` (immediate, no retry),
/// `Timeout` once the poll cap is used up, `Cancelled` when the token is set
/// at a loop boundary, or the last transient failure once every submission
/// attempt has failed.
pub fn run_generation(
    api: &dyn GenerationApi,
    request: &GenerationRequest,
    settings: &PollSettings,
    cancel: &CancelToken,
    progress: &dyn ProgressSink,
) -> Result<String, JobError> {
    let total = settings.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        cancel.check()?;
        let outcome = match api.submit(request) {
            Ok(handle) => poll_until_done(api, &handle, settings, cancel, progress),
            Err(err) => {
                progress.on_poll(attempt, total);
                Err(err)
            }
        };
        match outcome {
            Ok(url) => return Ok(url),
            Err(err) if err.is_retryable() && attempt < total => {
                tracing::warn!(attempt, total, error = %err, "generation attempt failed; retrying");
                progress.on_retry(attempt, total, &err);
                cancel.sleep(settings.poll_interval)?;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn poll_until_done(
    api: &dyn GenerationApi,
    handle: &PollHandle,
    settings: &PollSettings,
    cancel: &CancelToken,
    progress: &dyn ProgressSink,
) -> Result<String, JobError> {
    let total = settings.max_attempts.max(1);
    tracing::debug!(handle = %handle, "generation submitted");

    for attempt in 1..=total {
        cancel.check()?;
        progress.on_poll(attempt, total);
        match api.poll(handle)? {
            PollOutcome::Ready(url) => {
                tracing::info!(attempt, total, "generation ready");
                return Ok(url);
            }
            PollOutcome::Moderated(status) => return Err(JobError::ContentPolicy(status)),
            PollOutcome::Failed(detail) => return Err(JobError::RemoteFailed(detail)),
            PollOutcome::Pending => {}
        }
        if attempt < total {
            cancel.sleep(settings.poll_interval)?;
        }
    }
    Err(JobError::Timeout { attempts: total })
}
