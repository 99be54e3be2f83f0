use std::fs;
use std::io::{self, BufRead, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use fluxdesk_contracts::cache::ImageCache;
use fluxdesk_contracts::config::{AppPaths, Credentials, EngineConfig};
use fluxdesk_contracts::crypto::CryptoStore;
use fluxdesk_contracts::events::EventLog;
use fluxdesk_contracts::history::HistoryRepository;
use fluxdesk_contracts::request::{AspectRatio, GenerationParams, GenerationRequest, Quality};
use fluxdesk_engine::{
    BatchItemReport, FluxClient, GenerationOptions, HttpFetcher, JobController, JobObserver,
    JobServices, JobSpec, RefineOptions, StabilityRefiner,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CANCEL_COMMAND: &str = "cancel";
const RECENT_DEFAULT_LIMIT: usize = 10;

#[derive(Debug, Parser)]
#[command(name = "fluxdesk", version, about = "Flux image generation from the terminal")]
struct Cli {
    /// Application data directory (history, key, cache, events).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate one image.
    Generate(GenerateArgs),
    /// Generate one image per line of a prompt file.
    Batch(BatchArgs),
    #[command(subcommand)]
    History(HistoryCommand),
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Debug, Clone, Args)]
struct ParamArgs {
    #[arg(long, default_value = "1:1")]
    aspect_ratio: AspectRatio,
    #[arg(long, default_value = "standard")]
    quality: Quality,
}

impl ParamArgs {
    fn params(&self) -> GenerationParams {
        GenerationParams {
            aspect_ratio: self.aspect_ratio,
            quality: self.quality,
        }
    }
}

#[derive(Debug, Clone, Args)]
struct RefineArgs {
    /// Run the result through the refinement pass.
    #[arg(long)]
    refine: bool,
    #[arg(long, default_value_t = 0.35)]
    strength: f32,
    #[arg(long, default_value = "")]
    negative_prompt: String,
}

impl RefineArgs {
    fn options(&self) -> Option<RefineOptions> {
        self.refine.then(|| RefineOptions {
            strength: self.strength,
            negative_prompt: self.negative_prompt.clone(),
            ..RefineOptions::default()
        })
    }
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[command(flatten)]
    params: ParamArgs,
    #[command(flatten)]
    refine: RefineArgs,
    /// Skip the local image cache.
    #[arg(long)]
    no_cache: bool,
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct BatchArgs {
    /// Text file with one prompt per line.
    #[arg(long)]
    file: PathBuf,
    #[command(flatten)]
    params: ParamArgs,
    #[command(flatten)]
    refine: RefineArgs,
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    Recent {
        #[arg(long, default_value_t = RECENT_DEFAULT_LIMIT)]
        limit: usize,
    },
    Favorites,
    Templates,
    Favorite {
        #[arg(long)]
        prompt: String,
        #[command(flatten)]
        params: ParamArgs,
    },
    Unfavorite {
        #[arg(long)]
        prompt: String,
    },
    Template {
        #[arg(long)]
        name: String,
        #[arg(long)]
        prompt: String,
        #[command(flatten)]
        params: ParamArgs,
    },
    RemoveTemplate {
        #[arg(long)]
        name: String,
    },
    /// Remove one prompt by its position in the full history (0 = oldest).
    Remove {
        #[arg(long)]
        index: usize,
    },
    Clear,
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    Clear,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("fluxdesk error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let paths = AppPaths::resolve(cli.data_dir.clone())?;
    paths.ensure()?;
    let config = EngineConfig::load(Some(&paths.config_file()));

    match cli.command {
        Command::Generate(args) => run_generate(&paths, &config, args),
        Command::Batch(args) => run_batch(&paths, &config, args),
        Command::History(command) => {
            let history = open_history(&paths)?;
            run_history(&history, command)?;
            Ok(0)
        }
        Command::Cache(CacheCommand::Clear) => {
            let mut cache = ImageCache::open(paths.images_dir(), config.cache_capacity)?;
            let removed = cache.clear();
            println!("Removed {removed} cached image(s)");
            Ok(0)
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fluxdesk=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init();
}

fn open_history(paths: &AppPaths) -> Result<Arc<HistoryRepository>> {
    let crypto = CryptoStore::open(paths.key_file(), &paths.history_file())
        .with_context(|| format!("failed to open key {}", paths.key_file().display()))?;
    Ok(Arc::new(HistoryRepository::open(
        paths.history_file(),
        Arc::new(crypto),
    )))
}

fn build_controller(paths: &AppPaths, config: &EngineConfig) -> Result<JobController> {
    let credentials = Credentials::from_env()?;
    let generation = FluxClient::new(config, credentials.flux_api_key)?;
    let refinement = StabilityRefiner::new(config, credentials.refine_api_key)?;
    let fetcher = HttpFetcher::new(config.download_timeout())?;
    let cache = ImageCache::open(paths.images_dir(), config.cache_capacity)?;
    let services = JobServices {
        generation: Arc::new(generation),
        refinement: Some(Arc::new(refinement)),
        fetcher: Arc::new(fetcher),
        history: open_history(paths)?,
        cache: Some(Arc::new(Mutex::new(cache))),
        events: Some(EventLog::new(paths.events_file())),
    };
    Ok(JobController::new(services, config, paths.temp_dir()))
}

fn run_generate(paths: &AppPaths, config: &EngineConfig, args: GenerateArgs) -> Result<i32> {
    let controller = build_controller(paths, config)?;
    let request = GenerationRequest::new(&args.prompt, args.params.params())?;
    let spec = JobSpec::single(request).with_options(GenerationOptions {
        refine: args.refine.options(),
        use_cache: !args.no_cache,
    });

    let observer = Arc::new(TerminalObserver::default());
    controller.start(spec, observer.clone())?;
    wait_with_cancel(&controller);

    match observer.take_outcome() {
        Some(Outcome::Success(path)) => {
            let dest = args
                .out
                .unwrap_or_else(|| PathBuf::from(default_output_name(None)));
            controller.save_artifact(&path, &dest)?;
            println!("Saved {}{}", dest.display(), describe_dimensions(&dest));
            Ok(0)
        }
        Some(Outcome::Cancelled) => {
            println!("Generation cancelled");
            Ok(2)
        }
        Some(Outcome::Failed(message)) => {
            tracing::debug!(%message, "generation failed");
            Ok(1)
        }
        _ => Ok(1),
    }
}

fn run_batch(paths: &AppPaths, config: &EngineConfig, args: BatchArgs) -> Result<i32> {
    let raw = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let prompts = prompt_lines(&raw);
    if prompts.is_empty() {
        bail!("{} contains no prompts", args.file.display());
    }
    let controller = build_controller(paths, config)?;
    let spec = JobSpec::batch(prompts, args.params.params()).with_options(GenerationOptions {
        refine: args.refine.options(),
        use_cache: false,
    });

    let observer = Arc::new(TerminalObserver::default());
    controller.start(spec, observer.clone())?;
    wait_with_cancel(&controller);

    match observer.take_outcome() {
        Some(Outcome::Batch(reports)) => {
            fs::create_dir_all(&args.out_dir)
                .with_context(|| format!("failed to create {}", args.out_dir.display()))?;
            let mut failed = 0;
            for report in &reports {
                match &report.outcome {
                    Ok(path) => {
                        let dest = args
                            .out_dir
                            .join(default_output_name(Some(report.index)));
                        controller.save_artifact(path, &dest)?;
                        println!("[{}] saved {}", report.index, dest.display());
                    }
                    Err(_) => failed += 1,
                }
            }
            println!(
                "Batch finished: {} succeeded, {failed} failed",
                reports.len() - failed
            );
            Ok(if failed == 0 { 0 } else { 1 })
        }
        Some(Outcome::Cancelled) => {
            println!("Batch cancelled");
            Ok(2)
        }
        _ => Ok(1),
    }
}

fn run_history(history: &HistoryRepository, command: HistoryCommand) -> Result<()> {
    match command {
        HistoryCommand::Recent { limit } => {
            let offset = history.history_len().saturating_sub(limit);
            for (idx, record) in history.recent_prompts(limit).iter().enumerate() {
                println!(
                    "{:>4}  {}  {} {}  {}",
                    offset + idx,
                    record.timestamp,
                    record.params.aspect_ratio.as_str(),
                    record.params.quality.as_str(),
                    record.prompt
                );
            }
        }
        HistoryCommand::Favorites => {
            for record in history.favorites() {
                println!(
                    "{} {}  {}",
                    record.params.aspect_ratio.as_str(),
                    record.params.quality.as_str(),
                    record.prompt
                );
            }
        }
        HistoryCommand::Templates => {
            for template in history.templates() {
                println!("{}: {}", template.name, template.record.prompt);
            }
        }
        HistoryCommand::Favorite { prompt, params } => {
            let prompt = fluxdesk_contracts::request::validate_prompt(&prompt)?;
            if history.add_favorite(&prompt, params.params())? {
                println!("Added to favorites");
            } else {
                println!("Already a favorite");
            }
        }
        HistoryCommand::Unfavorite { prompt } => {
            if history.remove_favorite(prompt.trim())? {
                println!("Removed from favorites");
            } else {
                println!("Not a favorite");
            }
        }
        HistoryCommand::Template {
            name,
            prompt,
            params,
        } => {
            if name.trim().is_empty() {
                bail!("Template name cannot be empty");
            }
            let prompt = fluxdesk_contracts::request::validate_prompt(&prompt)?;
            history.add_template(&name, &prompt, params.params())?;
            println!("Saved template '{}'", name.trim());
        }
        HistoryCommand::RemoveTemplate { name } => {
            if history.remove_template(name.trim())? {
                println!("Removed template '{}'", name.trim());
            } else {
                println!("No template named '{}'", name.trim());
            }
        }
        HistoryCommand::Remove { index } => {
            if history.remove_prompt(index)? {
                println!("Removed prompt {index}");
            } else {
                println!("No prompt at index {index}");
            }
        }
        HistoryCommand::Clear => {
            history.clear_prompts()?;
            println!("History cleared");
        }
    }
    Ok(())
}

/// Reads command lines on a background thread and forwards each `cancel`.
///
/// The thread ends at end of input or on a read error. Stdin gets one
/// listener per process, shared by every wait.
struct CancelListener {
    commands: Mutex<mpsc::Receiver<()>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CancelListener {
    fn spawn<R: BufRead + Send + 'static>(input: R) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("fluxdesk-stdin".to_string())
            .spawn(move || {
                for line in input.lines() {
                    match line {
                        Ok(line) if is_cancel_command(&line) => {
                            if tx.send(()).is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    }
                }
            })?;
        Ok(Self {
            commands: Mutex::new(rx),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn stdin() -> Option<&'static Self> {
        static STDIN: OnceLock<Option<CancelListener>> = OnceLock::new();
        STDIN
            .get_or_init(|| match Self::spawn(io::BufReader::new(io::stdin())) {
                Ok(listener) => Some(listener),
                Err(err) => {
                    tracing::warn!(error = %err, "stdin listener unavailable; cancel disabled");
                    None
                }
            })
            .as_ref()
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<(), RecvTimeoutError> {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .recv_timeout(timeout)
    }

    /// Drops commands typed while no job was running.
    fn discard_pending(&self) {
        while self.recv_timeout(Duration::ZERO).is_ok() {}
    }

    /// Joins the reader. Only called after the channel disconnected, which
    /// means the reader has left its loop.
    fn reap(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = worker {
            let _ = handle.join();
        }
    }
}

/// Blocks until the job ends, turning a `cancel` line on stdin into a
/// cancellation request. End of input leaves the job running.
fn wait_with_cancel(controller: &JobController) {
    let listener = CancelListener::stdin();
    if let Some(listener) = listener {
        listener.discard_pending();
        println!("Type '{CANCEL_COMMAND}' and press Enter to stop.");
    }

    while controller.is_active() {
        let Some(listener) = listener else {
            thread::sleep(Duration::from_millis(100));
            continue;
        };
        match listener.recv_timeout(Duration::from_millis(100)) {
            Ok(()) => {
                controller.cancel();
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                listener.reap();
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
    controller.wait();
}

fn is_cancel_command(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case(CANCEL_COMMAND)
}

fn prompt_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_output_name(index: Option<usize>) -> String {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    match index {
        Some(index) => format!("flux_{stamp}_{index}.jpg"),
        None => format!("flux_{stamp}.jpg"),
    }
}

fn describe_dimensions(path: &Path) -> String {
    image::image_dimensions(path)
        .map(|(width, height)| format!(" ({width}x{height})"))
        .unwrap_or_default()
}

#[derive(Debug)]
enum Outcome {
    Success(PathBuf),
    Batch(Vec<BatchItemReport>),
    Failed(String),
    Cancelled,
}

/// Prints progress to stdout and errors to stderr; keeps the terminal
/// outcome for the command to act on once the job is done.
#[derive(Default)]
struct TerminalObserver {
    outcome: Mutex<Option<Outcome>>,
}

impl TerminalObserver {
    fn take_outcome(&self) -> Option<Outcome> {
        self.outcome.lock().ok().and_then(|mut outcome| outcome.take())
    }

    fn finish(&self, outcome: Outcome) {
        if let Ok(mut slot) = self.outcome.lock() {
            *slot = Some(outcome);
        }
    }

    fn line(&self, text: &str) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{text}");
        let _ = stdout.flush();
    }
}

impl JobObserver for TerminalObserver {
    fn on_progress(&self, attempt: u32, total: u32) {
        self.line(&format!("Progress: {attempt}/{total}"));
    }

    fn on_retry(&self, attempt: u32, total: u32, message: &str) {
        self.line(&format!("Retrying ({attempt}/{total}): {message}"));
    }

    fn on_status(&self, message: &str) {
        self.line(message);
    }

    fn on_success(&self, path: &Path) {
        self.line(&format!("Image ready{}", describe_dimensions(path)));
        self.finish(Outcome::Success(path.to_path_buf()));
    }

    fn on_batch_progress(&self, index: usize, attempt: u32, total: u32) {
        self.line(&format!("[{index}] Progress: {attempt}/{total}"));
    }

    fn on_batch_item(&self, report: &BatchItemReport) {
        match &report.outcome {
            Ok(_) => self.line(&format!("[{}] done: {}", report.index, report.prompt)),
            Err(message) => eprintln!("[{}] {message}", report.index),
        }
    }

    fn on_batch_complete(&self, reports: &[BatchItemReport]) {
        self.finish(Outcome::Batch(reports.to_vec()));
    }

    fn on_error(&self, message: &str) {
        eprintln!("{message}");
        self.finish(Outcome::Failed(message.to_string()));
    }

    fn on_cancelled(&self) {
        self.finish(Outcome::Cancelled);
    }
}
