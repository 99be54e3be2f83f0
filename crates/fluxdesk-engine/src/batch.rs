//! Fan-out of one prompt list into concurrent generation runs.
//!
//! Every prompt gets its own worker. Results land in a slot indexed by the
//! prompt's position, so the output order always matches the input order no
//! matter which run finishes first.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use fluxdesk_contracts::errors::JobError;
use fluxdesk_contracts::request::{GenerationParams, GenerationRequest};

use crate::cancel::CancelToken;
use crate::generation::{run_generation, GenerationApi, PollSettings, ProgressSink};

pub type BatchOutcome = Result<String, JobError>;

pub trait BatchProgress: Sync {
    fn on_item_poll(&self, _index: usize, _attempt: u32, _total: u32) {}

    fn on_item_retry(&self, _index: usize, _attempt: u32, _total: u32, _error: &JobError) {}

    fn on_item_finished(&self, _index: usize, _outcome: &BatchOutcome) {}
}

pub struct NoBatchProgress;

impl BatchProgress for NoBatchProgress {}

struct ItemProgress<'a> {
    index: usize,
    inner: &'a dyn BatchProgress,
}

impl ProgressSink for ItemProgress<'_> {
    fn on_poll(&self, attempt: u32, total: u32) {
        self.inner.on_item_poll(self.index, attempt, total);
    }

    fn on_retry(&self, attempt: u32, total: u32, error: &JobError) {
        self.inner.on_item_retry(self.index, attempt, total, error);
    }
}

/// Runs one generation per prompt and returns the outcomes in input order.
///
/// `concurrency` caps the number of live workers; `None` starts one worker
/// per prompt. Prompts that fail validation are reported in their slot and
/// never submitted.
pub fn process_batch(
    api: &dyn GenerationApi,
    prompts: &[String],
    params: GenerationParams,
    settings: &PollSettings,
    concurrency: Option<usize>,
    cancel: &CancelToken,
    progress: &dyn BatchProgress,
) -> Vec<BatchOutcome> {
    if prompts.is_empty() {
        return Vec::new();
    }
    let workers = concurrency
        .filter(|limit| *limit > 0)
        .unwrap_or(prompts.len())
        .min(prompts.len());
    let slots: Mutex<Vec<Option<BatchOutcome>>> =
        Mutex::new((0..prompts.len()).map(|_| None).collect());
    let next = AtomicUsize::new(0);
    tracing::info!(items = prompts.len(), workers, "batch started");

    thread::scope(|scope| {
        for worker in 0..workers {
            let slots = &slots;
            let next = &next;
            let spawned = thread::Builder::new()
                .name(format!("fluxdesk-batch-{worker}"))
                .spawn_scoped(scope, move || loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(prompt) = prompts.get(index) else {
                        break;
                    };
                    let outcome = run_item(api, index, prompt, params, settings, cancel, progress);
                    progress.on_item_finished(index, &outcome);
                    if let Ok(mut guard) = slots.lock() {
                        guard[index] = Some(outcome);
                    }
                });
            if let Err(err) = spawned {
                tracing::error!(worker, error = %err, "failed to spawn batch worker");
            }
        }
    });

    let slots = slots.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
    slots
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| Err(JobError::Submission("batch item never ran".to_string())))
        })
        .collect()
}

fn run_item(
    api: &dyn GenerationApi,
    index: usize,
    prompt: &str,
    params: GenerationParams,
    settings: &PollSettings,
    cancel: &CancelToken,
    progress: &dyn BatchProgress,
) -> BatchOutcome {
    let request = GenerationRequest::new(prompt, params)?;
    let sink = ItemProgress {
        index,
        inner: progress,
    };
    let outcome = run_generation(api, &request, settings, cancel, &sink);
    match &outcome {
        Ok(_) => tracing::debug!(index, "batch item ready"),
        Err(err) => tracing::warn!(index, error = %err, "batch item failed"),
    }
    outcome
}
