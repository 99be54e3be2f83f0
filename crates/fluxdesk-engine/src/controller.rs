//! One user-initiated operation at a time, run off the caller's thread.
//!
//! [`JobController::start`] spawns a named worker per job. The worker
//! records history, drives generation, downloads the artifact into a temp
//! file, optionally refines it and reports exactly one terminal callback:
//! `on_success`, `on_batch_complete`, `on_error` or `on_cancelled`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use fluxdesk_contracts::cache::ImageCache;
use fluxdesk_contracts::config::EngineConfig;
use fluxdesk_contracts::errors::JobError;
use fluxdesk_contracts::events::{EventKind, EventLog, JobEvents};
use fluxdesk_contracts::history::HistoryRepository;
use fluxdesk_contracts::request::{validate_prompt, GenerationParams, GenerationRequest};
use serde_json::{json, Value};

use crate::artifacts::{cleanup_temp_file, ArtifactFetcher, TempArtifact};
use crate::batch::{process_batch, BatchOutcome, BatchProgress};
use crate::cancel::CancelToken;
use crate::generation::{run_generation, GenerationApi, PollSettings, ProgressSink};
use crate::refine::{refine_image, RefineOptions, RefinementApi};

pub const CANCEL_REQUESTED_STATUS: &str = "Cancellation requested...";

/// Presentation-layer hooks. Called from the job's worker thread.
pub trait JobObserver: Send + Sync {
    fn on_progress(&self, attempt: u32, total: u32);

    fn on_retry(&self, _attempt: u32, _total: u32, _message: &str) {}

    fn on_status(&self, _message: &str) {}

    fn on_success(&self, path: &Path);

    fn on_batch_progress(&self, _index: usize, _attempt: u32, _total: u32) {}

    fn on_batch_item(&self, _report: &BatchItemReport) {}

    fn on_batch_complete(&self, _reports: &[BatchItemReport]) {}

    fn on_error(&self, message: &str);

    fn on_cancelled(&self) {}
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchItemReport {
    pub index: usize,
    pub prompt: String,
    pub outcome: Result<PathBuf, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub refine: Option<RefineOptions>,
    pub use_cache: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            refine: None,
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum JobSpec {
    Single {
        request: GenerationRequest,
        options: GenerationOptions,
    },
    Batch {
        prompts: Vec<String>,
        params: GenerationParams,
        options: GenerationOptions,
    },
}

impl JobSpec {
    pub fn single(request: GenerationRequest) -> Self {
        Self::Single {
            request,
            options: GenerationOptions::default(),
        }
    }

    pub fn batch(prompts: Vec<String>, params: GenerationParams) -> Self {
        Self::Batch {
            prompts,
            params,
            options: GenerationOptions::default(),
        }
    }

    pub fn with_options(mut self, new_options: GenerationOptions) -> Self {
        match &mut self {
            Self::Single { options, .. } | Self::Batch { options, .. } => *options = new_options,
        }
        self
    }

    pub fn options(&self) -> &GenerationOptions {
        match self {
            Self::Single { options, .. } | Self::Batch { options, .. } => options,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Single { .. } => "single",
            Self::Batch { .. } => "batch",
        }
    }
}

/// Collaborators injected at construction; everything is shared, nothing is
/// looked up ambiently.
#[derive(Clone)]
pub struct JobServices {
    pub generation: Arc<dyn GenerationApi>,
    pub refinement: Option<Arc<dyn RefinementApi>>,
    pub fetcher: Arc<dyn ArtifactFetcher>,
    pub history: Arc<HistoryRepository>,
    pub cache: Option<Arc<Mutex<ImageCache>>>,
    pub events: Option<EventLog>,
}

struct ActiveJob {
    id: String,
    cancel: CancelToken,
    /// Set once the worker has started its terminal callback.
    settled: Arc<AtomicBool>,
    observer: Arc<dyn JobObserver>,
    handle: JoinHandle<()>,
}

pub struct JobController {
    services: JobServices,
    settings: PollSettings,
    batch_concurrency: Option<usize>,
    temp_dir: PathBuf,
    active: Mutex<Option<ActiveJob>>,
    artifacts: Arc<Mutex<Vec<PathBuf>>>,
}

impl JobController {
    pub fn new(services: JobServices, config: &EngineConfig, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            services,
            settings: PollSettings::from(config),
            batch_concurrency: config.batch_concurrency,
            temp_dir: temp_dir.into(),
            active: Mutex::new(None),
            artifacts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn history(&self) -> &Arc<HistoryRepository> {
        &self.services.history
    }

    /// Starts `spec` on a worker thread and returns its job id.
    pub fn start(&self, spec: JobSpec, observer: Arc<dyn JobObserver>) -> Result<String, JobError> {
        let mut active = self.lock_active();
        if let Some(job) = active.as_ref() {
            if !job.handle.is_finished() {
                return Err(JobError::Busy);
            }
        }
        if let Some(finished) = active.take() {
            join_worker(finished);
        }
        self.check_spec(&spec)?;

        let id = uuid::Uuid::new_v4().to_string();
        let cancel = CancelToken::new();
        let settled = Arc::new(AtomicBool::new(false));
        let runner = JobRunner {
            id: id.clone(),
            services: self.services.clone(),
            settings: self.settings,
            batch_concurrency: self.batch_concurrency,
            temp_dir: self.temp_dir.clone(),
            cancel: cancel.clone(),
            settled: Arc::clone(&settled),
            events: JobEvents::new(self.services.events.clone(), id.clone()),
            observer: Arc::clone(&observer),
            artifacts: Arc::clone(&self.artifacts),
        };
        let handle = thread::Builder::new()
            .name(format!("fluxdesk-job-{}", short_id(&id)))
            .spawn(move || runner.run(spec))
            .map_err(|err| JobError::io("failed to spawn job worker", err))?;
        tracing::info!(job_id = %id, "job started");

        *active = Some(ActiveJob {
            id: id.clone(),
            cancel,
            settled,
            observer,
            handle,
        });
        Ok(id)
    }

    /// Requests cancellation without waiting for the worker to stop.
    ///
    /// Returns false when no job is running or the running one has already
    /// reached its outcome. The observer is called after the lock is released.
    pub fn cancel(&self) -> bool {
        let (id, observer) = {
            let active = self.lock_active();
            let Some(job) = active
                .as_ref()
                .filter(|job| !job.handle.is_finished() && !job.settled.load(Ordering::SeqCst))
            else {
                return false;
            };
            job.cancel.cancel();
            (job.id.clone(), Arc::clone(&job.observer))
        };
        observer.on_status(CANCEL_REQUESTED_STATUS);
        tracing::info!(job_id = %id, "cancellation requested");
        true
    }

    pub fn is_active(&self) -> bool {
        self.lock_active()
            .as_ref()
            .is_some_and(|job| !job.handle.is_finished())
    }

    /// Blocks until the current job, if any, has finished.
    pub fn wait(&self) {
        let job = self.lock_active().take();
        if let Some(job) = job {
            join_worker(job);
        }
    }

    /// Cancels and joins the running job, then deletes every temp artifact
    /// still owned by this controller.
    pub fn shutdown(&self) {
        let job = self.lock_active().take();
        if let Some(job) = job {
            job.cancel.cancel();
            join_worker(job);
        }
        let paths: Vec<PathBuf> = self.lock_artifacts().drain(..).collect();
        for path in paths {
            cleanup_temp_file(&path);
        }
    }

    pub fn artifacts(&self) -> Vec<PathBuf> {
        self.lock_artifacts().clone()
    }

    /// Copies a reported artifact to `dest`. The temp file stays owned by
    /// the controller.
    pub fn save_artifact(&self, path: &Path, dest: &Path) -> Result<PathBuf, JobError> {
        if !self.lock_artifacts().iter().any(|known| known == path) {
            return Err(JobError::Validation(format!(
                "Unknown artifact: {}",
                path.display()
            )));
        }
        if let Some(parent) = dest.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| JobError::io_at("create", parent, err))?;
        }
        fs::copy(path, dest).map_err(|err| JobError::io_at("copy", path, err))?;
        tracing::info!(from = %path.display(), to = %dest.display(), "artifact saved");
        Ok(dest.to_path_buf())
    }

    /// Forgets and deletes one artifact.
    pub fn release_artifact(&self, path: &Path) -> bool {
        let mut artifacts = self.lock_artifacts();
        let before = artifacts.len();
        artifacts.retain(|known| known != path);
        let released = artifacts.len() != before;
        drop(artifacts);
        if released {
            cleanup_temp_file(path);
        }
        released
    }

    fn check_spec(&self, spec: &JobSpec) -> Result<(), JobError> {
        if let Some(options) = &spec.options().refine {
            if self.services.refinement.is_none() {
                return Err(JobError::Configuration(
                    "refinement requested but no refinement client is configured".to_string(),
                ));
            }
            options.validate()?;
        }
        if let JobSpec::Batch { prompts, .. } = spec {
            if prompts.is_empty() {
                return Err(JobError::Validation(
                    "Batch needs at least one prompt".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_artifacts(&self) -> MutexGuard<'_, Vec<PathBuf>> {
        self.artifacts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for JobController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join_worker(job: ActiveJob) {
    if job.handle.join().is_err() {
        tracing::error!(job_id = %job.id, "job worker panicked");
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

struct JobRunner {
    id: String,
    services: JobServices,
    settings: PollSettings,
    batch_concurrency: Option<usize>,
    temp_dir: PathBuf,
    cancel: CancelToken,
    settled: Arc<AtomicBool>,
    events: JobEvents,
    observer: Arc<dyn JobObserver>,
    artifacts: Arc<Mutex<Vec<PathBuf>>>,
}

impl JobRunner {
    fn run(self, spec: JobSpec) {
        self.event(
            EventKind::JobStarted,
            json!({
                "kind": spec.kind(),
                "refine": spec.options().refine.is_some(),
            }),
        );
        match spec {
            JobSpec::Single { request, options } => self.run_single(&request, &options),
            JobSpec::Batch {
                prompts,
                params,
                options,
            } => self.run_batch(&prompts, params, &options),
        }
    }

    fn run_single(&self, request: &GenerationRequest, options: &GenerationOptions) {
        self.record_prompt(request.prompt(), request.params());
        match self.generate_single(request, options) {
            Ok(artifact) => {
                let path = artifact.keep();
                self.track(&path);
                self.settle();
                self.event(
                    EventKind::JobSucceeded,
                    json!({ "path": path.to_string_lossy().to_string() }),
                );
                self.observer.on_success(&path);
            }
            Err(err) => self.finish_with_error(err),
        }
    }

    fn generate_single(
        &self,
        request: &GenerationRequest,
        options: &GenerationOptions,
    ) -> Result<TempArtifact, JobError> {
        let bytes = match self.cached_bytes(request, options) {
            Some(bytes) => bytes,
            None => {
                let url = run_generation(
                    self.services.generation.as_ref(),
                    request,
                    &self.settings,
                    &self.cancel,
                    &JobProgress { runner: self },
                )?;
                self.cancel.check()?;
                self.observer.on_status("Downloading image...");
                let bytes = self.services.fetcher.fetch(&url)?;
                if options.use_cache {
                    self.store_cached(request, &bytes);
                }
                bytes
            }
        };
        self.cancel.check()?;
        let artifact = TempArtifact::create(&self.temp_dir, short_id(&self.id), &bytes)?;
        if let Some(refine) = &options.refine {
            self.refine_into(&artifact, &bytes, request.prompt(), refine)?;
        }
        self.cancel.check()?;
        Ok(artifact)
    }

    fn run_batch(&self, prompts: &[String], params: GenerationParams, options: &GenerationOptions) {
        for prompt in prompts {
            if let Ok(prompt) = validate_prompt(prompt) {
                self.record_prompt(&prompt, params);
            }
        }
        self.event(EventKind::BatchStarted, json!({ "count": prompts.len() }));

        let outcomes = process_batch(
            self.services.generation.as_ref(),
            prompts,
            params,
            &self.settings,
            self.batch_concurrency,
            &self.cancel,
            &JobProgress { runner: self },
        );
        if self.cancel.is_cancelled() {
            self.finish_cancelled();
            return;
        }

        let mut staged: Vec<Result<TempArtifact, JobError>> = Vec::with_capacity(outcomes.len());
        for (index, (prompt, outcome)) in prompts.iter().zip(outcomes).enumerate() {
            staged.push(self.stage_batch_item(index, prompt, outcome, options));
            if self.cancel.is_cancelled() {
                // Dropping `staged` removes every file downloaded so far.
                self.finish_cancelled();
                return;
            }
        }

        let reports: Vec<BatchItemReport> = prompts
            .iter()
            .zip(staged)
            .enumerate()
            .map(|(index, (prompt, staged))| {
                let outcome = match staged {
                    Ok(artifact) => {
                        let path = artifact.keep();
                        self.track(&path);
                        Ok(path)
                    }
                    Err(err) => Err(err.user_message()),
                };
                BatchItemReport {
                    index,
                    prompt: prompt.clone(),
                    outcome,
                }
            })
            .collect();

        for report in &reports {
            self.event(
                EventKind::BatchItemFinished,
                json!({
                    "index": report.index,
                    "ok": report.outcome.is_ok(),
                    "path": report.outcome.as_ref().ok().map(|path| path.to_string_lossy().to_string()),
                    "error": report.outcome.as_ref().err(),
                }),
            );
            self.observer.on_batch_item(report);
        }
        let succeeded = reports.iter().filter(|report| report.outcome.is_ok()).count();
        self.event(
            EventKind::BatchFinished,
            json!({ "succeeded": succeeded, "failed": reports.len() - succeeded }),
        );
        self.settle();
        self.observer.on_batch_complete(&reports);
    }

    fn stage_batch_item(
        &self,
        index: usize,
        prompt: &str,
        outcome: BatchOutcome,
        options: &GenerationOptions,
    ) -> Result<TempArtifact, JobError> {
        let url = outcome?;
        self.cancel.check()?;
        let bytes = self.services.fetcher.fetch(&url)?;
        let tag = format!("{}_{index}", short_id(&self.id));
        let artifact = TempArtifact::create(&self.temp_dir, &tag, &bytes)?;
        if let Some(refine) = &options.refine {
            self.cancel.check()?;
            self.refine_into(&artifact, &bytes, prompt.trim(), refine)?;
        }
        Ok(artifact)
    }

    fn refine_into(
        &self,
        artifact: &TempArtifact,
        bytes: &[u8],
        prompt: &str,
        options: &RefineOptions,
    ) -> Result<(), JobError> {
        let refiner = self.services.refinement.as_ref().ok_or_else(|| {
            JobError::Configuration("no refinement client is configured".to_string())
        })?;
        self.cancel.check()?;
        self.observer.on_status("Refining image...");
        self.event(EventKind::RefineStarted, json!({ "strength": options.strength }));
        let refined = refine_image(refiner.as_ref(), bytes, prompt, options);
        self.event(EventKind::RefineFinished, json!({ "ok": refined.is_ok() }));
        artifact.replace_contents(&refined?)
    }

    fn cached_bytes(&self, request: &GenerationRequest, options: &GenerationOptions) -> Option<Vec<u8>> {
        if !options.use_cache {
            return None;
        }
        let cache = self.services.cache.as_ref()?;
        let path = cache.lock().ok()?.get(&request.fingerprint())?;
        match fs::read(&path) {
            Ok(bytes) => {
                tracing::info!(job_id = %self.id, path = %path.display(), "serving image from cache");
                self.observer.on_status("Loaded image from cache");
                Some(bytes)
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "cached image unreadable");
                None
            }
        }
    }

    fn store_cached(&self, request: &GenerationRequest, bytes: &[u8]) {
        let Some(cache) = self.services.cache.as_ref() else {
            return;
        };
        let Ok(mut cache) = cache.lock() else {
            return;
        };
        if let Err(err) = cache.put(&request.fingerprint(), bytes) {
            tracing::warn!(job_id = %self.id, error = %err, "failed to cache image");
        }
    }

    fn record_prompt(&self, prompt: &str, params: GenerationParams) {
        if let Err(err) = self.services.history.add_prompt(prompt, params) {
            tracing::warn!(job_id = %self.id, error = %err, "failed to record prompt history");
        }
    }

    fn settle(&self) {
        self.settled.store(true, Ordering::SeqCst);
    }

    fn finish_with_error(&self, err: JobError) {
        if err.is_cancelled() {
            self.finish_cancelled();
            return;
        }
        self.settle();
        tracing::warn!(job_id = %self.id, error = %err, "job failed");
        self.event(EventKind::JobFailed, json!({ "error": err.to_string() }));
        self.observer.on_error(&err.user_message());
    }

    fn finish_cancelled(&self) {
        self.settle();
        tracing::info!(job_id = %self.id, "job cancelled");
        self.event(EventKind::JobCancelled, json!({}));
        self.observer.on_cancelled();
    }

    fn track(&self, path: &Path) {
        if let Ok(mut artifacts) = self.artifacts.lock() {
            artifacts.push(path.to_path_buf());
        }
    }

    fn event(&self, kind: EventKind, payload: Value) {
        self.events.record(kind, payload);
    }
}

struct JobProgress<'a> {
    runner: &'a JobRunner,
}

impl ProgressSink for JobProgress<'_> {
    fn on_poll(&self, attempt: u32, total: u32) {
        self.runner
            .event(EventKind::JobProgress, json!({ "attempt": attempt, "total": total }));
        self.runner.observer.on_progress(attempt, total);
    }

    fn on_retry(&self, attempt: u32, total: u32, error: &JobError) {
        self.runner.event(
            EventKind::JobRetry,
            json!({ "attempt": attempt, "total": total, "error": error.to_string() }),
        );
        self.runner
            .observer
            .on_retry(attempt, total, &error.to_string());
    }
}

impl BatchProgress for JobProgress<'_> {
    fn on_item_poll(&self, index: usize, attempt: u32, total: u32) {
        self.runner.observer.on_batch_progress(index, attempt, total);
    }

    fn on_item_retry(&self, index: usize, attempt: u32, total: u32, error: &JobError) {
        self.runner.event(
            EventKind::JobRetry,
            json!({
                "index": index,
                "attempt": attempt,
                "total": total,
                "error": error.to_string(),
            }),
        );
    }
}
