use std::io;
use std::path::Path;

use thiserror::Error;

pub type JobResult<T> = Result<T, JobError>;

/// Failure taxonomy shared by every stage of a generation job.
///
/// `Display` output is the single human-readable message surfaced to the
/// caller when a job ends in this error.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Validation(String),

    #[error("a job is already running")]
    Busy,

    #[error("submission failed: {0}")]
    Submission(String),

    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("request failed ({status}): {body}")]
    Http { status: u16, body: String },

    #[error("content moderated as unsafe ({0})")]
    ContentPolicy(String),

    #[error("generation failed remotely: {0}")]
    RemoteFailed(String),

    #[error("image generation timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("history decrypt failed: {0}")]
    Decrypt(String),

    #[error("refinement failed: {0}")]
    Refinement(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("generation cancelled")]
    Cancelled,
}

impl JobError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn io_at(action: &str, path: &Path, source: io::Error) -> Self {
        Self::io(format!("failed to {action} {}", path.display()), source)
    }

    /// Whether the outer submit-and-poll loop should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Submission(_) | Self::TransientNetwork(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Message handed to the presentation layer's error callback.
    pub fn user_message(&self) -> String {
        format!("Error: {self}")
    }
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_submission_and_transport_errors_retry() {
        assert!(JobError::Submission("no polling url".to_string()).is_retryable());
        assert!(JobError::TransientNetwork("connect refused".to_string()).is_retryable());
        assert!(!JobError::ContentPolicy("Content Moderated".to_string()).is_retryable());
        assert!(!JobError::Timeout { attempts: 10 }.is_retryable());
        assert!(!JobError::Http {
            status: 401,
            body: "unauthorized".to_string()
        }
        .is_retryable());
        assert!(!JobError::Refinement("bad image".to_string()).is_retryable());
    }

    #[test]
    fn user_message_is_prefixed_once() {
        let err = JobError::Timeout { attempts: 10 };
        assert_eq!(
            err.user_message(),
            "Error: image generation timed out after 10 attempts"
        );
    }

    #[test]
    fn truncate_text_marks_cut_bodies() {
        assert_eq!(truncate_text("abc", 5), "abc");
        assert_eq!(truncate_text("abcdef", 3), "abc…");
    }
}
