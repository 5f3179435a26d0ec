use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use hymnflow::adapters::Adapters;
use hymnflow::store::{JobStateStore, MemoryStateStore, SqliteStateStore};
use hymnflow::worker::{BatchHandle, BatchResult};
use hymnflow::{load_config, Config, HymnflowError, JobProgressEvent, JobStatus, Orchestrator};

#[derive(Parser)]
#[command(name = "hymnflow", version, about = "Ingest hymn media and cache tracks for offline playback")]
struct Cli {
    /// Path to a JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured worker count
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload audio files and create catalog records
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Download tracks into the offline cache
    Download {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// List persisted download jobs
    Jobs,
    /// Continue a paused download
    Resume { id: String },
    /// Run a failed download again
    Retry { id: String },
    /// Remove a persisted download job
    Remove { id: String },
}

#[derive(Clone, Copy)]
enum Control {
    Resume,
    Retry,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        tracing::subscriber::set_global_default(registry.with(fmt::layer().json()))
    } else {
        tracing::subscriber::set_global_default(registry.with(fmt::layer()))
    };
    if let Err(e) = installed {
        eprintln!("Failed to install tracing subscriber: {}", e);
    }
    // The persistence layer logs through `log`.
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Failed to bridge log records: {}", e);
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn JobStateStore>, HymnflowError> {
    match config.database_path() {
        Some(path) => Ok(Arc::new(SqliteStateStore::open(&path)?)),
        None => {
            warn!("No home directory, job snapshots will not survive this run");
            Ok(Arc::new(MemoryStateStore::new()))
        }
    }
}

/// Starts the orchestrator and picks up downloads left by earlier runs.
async fn start(config: &Config, store: Arc<dyn JobStateStore>) -> Result<Orchestrator, HymnflowError> {
    Orchestrator::start_restored(config, Adapters::local(config)?, store).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, HymnflowError> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    if let Some(workers) = cli.workers {
        config.worker_count = workers;
    }
    let store = open_store(&config)?;

    match cli.command {
        Command::Jobs => {
            for job in store.list().await? {
                println!(
                    "{}  {:<16} {:>3}%  {}  {}",
                    job.id,
                    job.status.to_string(),
                    job.progress,
                    job.source.redacted(),
                    job.error.as_deref().unwrap_or("")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Remove { id } => {
            let orchestrator = start(&config, store).await?;
            let removed = orchestrator.remove(&id).await;
            orchestrator.shutdown().await;
            removed?;
            println!("Removed {}", id);
            Ok(ExitCode::SUCCESS)
        }
        Command::Resume { id } => {
            let orchestrator = start(&config, store).await?;
            run_job(orchestrator, id, Control::Resume).await
        }
        Command::Retry { id } => {
            let orchestrator = start(&config, store).await?;
            run_job(orchestrator, id, Control::Retry).await
        }
        Command::Ingest { files } => {
            let orchestrator = start(&config, store).await?;
            let handle = orchestrator.ingest(files).await?;
            run_batch(orchestrator, handle).await
        }
        Command::Download { urls } => {
            let orchestrator = start(&config, store).await?;
            let handle = orchestrator.download(urls).await?;
            run_batch(orchestrator, handle).await
        }
    }
}

fn interrupt_token() -> CancellationToken {
    let interrupted = CancellationToken::new();
    let token = interrupted.clone();
    if let Err(e) = ctrlc::set_handler(move || token.cancel()) {
        warn!("Failed to install Ctrl-C handler: {}", e);
    }
    interrupted
}

fn spawn_printer(orchestrator: &Orchestrator) -> JoinHandle<()> {
    let events = orchestrator.subscribe();
    tokio::spawn(forward_events(events, |event| {
        println!("[{:>3}%] {}  {}", event.progress, event.job_id, event.message)
    }))
}

/// Hands every event to `emit` until the channel closes. Skips past events
/// dropped while the receiver lagged.
async fn forward_events<F>(mut events: broadcast::Receiver<JobProgressEvent>, mut emit: F)
where
    F: FnMut(&JobProgressEvent),
{
    loop {
        match events.recv().await {
            Ok(event) => emit(&event),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Progress output fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Waits for the batch, printing progress, until it resolves or Ctrl-C.
async fn run_batch(orchestrator: Orchestrator, handle: BatchHandle) -> Result<ExitCode, HymnflowError> {
    let interrupted = interrupt_token();
    let printer = spawn_printer(&orchestrator);

    let result = tokio::select! {
        result = orchestrator.await_completion(&handle) => Some(result),
        _ = interrupted.cancelled() => None,
    };

    let code = match result {
        Some(result) => {
            print_summary(&result);
            if result.failed > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        None => {
            warn!("Interrupted, cancelling batch");
            let withdrawn = orchestrator.cancel_batch(&handle).await;
            info!(withdrawn, "Queued jobs withdrawn, running downloads will pause");
            ExitCode::from(130)
        }
    };

    orchestrator.shutdown().await;
    printer.abort();
    Ok(code)
}

/// Resumes or retries one job and waits until it settles or Ctrl-C.
async fn run_job(orchestrator: Orchestrator, id: String, control: Control) -> Result<ExitCode, HymnflowError> {
    let interrupted = interrupt_token();
    let events = orchestrator.subscribe();
    let printer = spawn_printer(&orchestrator);
    let requeued = match control {
        Control::Resume => orchestrator.resume(&id).await,
        Control::Retry => orchestrator.retry(&id).await,
    };
    if let Err(e) = requeued {
        orchestrator.shutdown().await;
        printer.abort();
        return Err(e.into());
    }

    let settled = tokio::select! {
        event = settle(&orchestrator, events, &id) => Some(event),
        _ = interrupted.cancelled() => None,
    };

    let code = match settled {
        Some(Some(event)) if event.status == JobStatus::Done => {
            println!("{} completed", id);
            ExitCode::SUCCESS
        }
        Some(Some(event)) if event.status == JobStatus::Paused => {
            println!("{} paused at {}%", id, event.progress);
            ExitCode::SUCCESS
        }
        Some(Some(event)) => {
            println!("{} failed: {}", id, event.error.as_deref().unwrap_or("unknown error"));
            ExitCode::FAILURE
        }
        Some(None) => {
            println!("{} was removed", id);
            ExitCode::FAILURE
        }
        None => {
            warn!("Interrupted, pausing");
            ExitCode::from(130)
        }
    };

    orchestrator.shutdown().await;
    printer.abort();
    Ok(code)
}

/// Final event of the job once it is done, failed or paused. `None` if it
/// was removed.
async fn settle(
    orchestrator: &Orchestrator,
    mut events: broadcast::Receiver<JobProgressEvent>,
    id: &str,
) -> Option<JobProgressEvent> {
    let is_settled = |status: JobStatus| status.is_terminal() || status == JobStatus::Paused;
    loop {
        match events.recv().await {
            Ok(event) if event.job_id == id => {
                if event.removed {
                    return None;
                }
                if is_settled(event.status) {
                    return Some(event);
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {
                let job = orchestrator.observe(id)?;
                if is_settled(job.status) {
                    return Some(JobProgressEvent::from_job(&job));
                }
            }
            Err(RecvError::Closed) => {
                return orchestrator.observe(id).map(|job| JobProgressEvent::from_job(&job));
            }
        }
    }
}

fn print_summary(result: &BatchResult) {
    println!(
        "{} succeeded, {} failed, {} cancelled",
        result.succeeded, result.failed, result.cancelled
    );
    for failure in &result.errors {
        println!("  {}: {}", failure.job_id, failure.message);
    }
}
