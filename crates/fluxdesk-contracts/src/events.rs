use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::JobError;

/// Everything a job writes to `events.jsonl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobStarted,
    JobProgress,
    JobRetry,
    JobSucceeded,
    JobFailed,
    JobCancelled,
    BatchStarted,
    BatchItemFinished,
    BatchFinished,
    RefineStarted,
    RefineFinished,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JobStarted => "job_started",
            Self::JobProgress => "job_progress",
            Self::JobRetry => "job_retry",
            Self::JobSucceeded => "job_succeeded",
            Self::JobFailed => "job_failed",
            Self::JobCancelled => "job_cancelled",
            Self::BatchStarted => "batch_started",
            Self::BatchItemFinished => "batch_item_finished",
            Self::BatchFinished => "batch_finished",
            Self::RefineStarted => "refine_started",
            Self::RefineFinished => "refine_finished",
        }
    }
}

/// The shared `events.jsonl` file. Clones append through one lock, so
/// concurrent jobs and batch workers never interleave partial lines.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                path: path.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn append(&self, event: &Map<String, Value>) -> Result<(), JobError> {
        let path = &self.inner.path;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| JobError::io_at("create", parent, err))?;
        }
        let mut line = serde_json::to_string(event)
            .map_err(|err| JobError::Configuration(format!("event serialization failed: {err}")))?;
        line.push('\n');

        let _guard = self
            .inner
            .lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .map_err(|err| JobError::io_at("append to", path, err))
    }

    /// Parses every line; unparsable lines are skipped.
    pub fn read_all(&self) -> Result<Vec<Value>, JobError> {
        let raw = match fs::read_to_string(self.path()) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(JobError::io_at("read", self.path(), err)),
        };
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

/// Writer bound to one job.
///
/// Every line carries `type`, `job_id`, a per-job `seq` starting at 0 and
/// `ts`. Those keys always win over the payload. An object payload is
/// merged in; anything else lands under `data`. Without a log the writer is
/// silent.
#[derive(Debug)]
pub struct JobEvents {
    log: Option<EventLog>,
    job_id: String,
    seq: AtomicU64,
}

impl JobEvents {
    pub fn new(log: Option<EventLog>, job_id: impl Into<String>) -> Self {
        Self {
            log,
            job_id: job_id.into(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Builds and appends one event, returning it.
    pub fn emit(&self, kind: EventKind, payload: Value) -> Result<Option<Value>, JobError> {
        let Some(log) = &self.log else {
            return Ok(None);
        };
        let mut event = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => Map::from_iter([("data".to_string(), other)]),
        };
        event.insert("type".to_string(), Value::from(kind.as_str()));
        event.insert("job_id".to_string(), Value::from(self.job_id.as_str()));
        event.insert(
            "seq".to_string(),
            Value::from(self.seq.fetch_add(1, Ordering::SeqCst)),
        );
        event.insert("ts".to_string(), Value::from(now_utc_iso()));
        log.append(&event)?;
        Ok(Some(Value::Object(event)))
    }

    /// Like [`JobEvents::emit`] but never fails the job; write errors are
    /// logged and dropped.
    pub fn record(&self, kind: EventKind, payload: Value) {
        if let Err(err) = self.emit(kind, payload) {
            tracing::warn!(
                event_type = kind.as_str(),
                job_id = %self.job_id,
                error = %err,
                "failed to append job event"
            );
        }
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
