use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use serde::Deserialize;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use herald_chain::SimLedger;
use herald_core::time::now_ms;
use herald_core::{Announcement, AnnouncementType, HeraldError};
use herald_node::announce::DigestAnnouncer;
use herald_node::capacity::CapacityState;
use herald_node::service::{Pipeline, PipelineError};
use herald_store::persistence::{load_from_path, load_or_default, save_to_path};
use herald_store::{MemoryStore, Store, StoreError};

mod config;

use config::WorkerConfig;

const TICK_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a .toml or .env configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the batching and publication pipeline (default)
    Run,
    /// Print open batches and epoch capacity from a store snapshot
    Inspect {
        #[arg(long)]
        state: PathBuf,
    },
}

#[derive(Debug, thiserror::Error)]
enum WorkerError {
    #[error("config: {0}")]
    Config(#[from] ::config::ConfigError),
    #[error("invalid pipeline settings: {0}")]
    Settings(#[from] HeraldError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("pipeline: {0}")]
    Pipeline(#[from] PipelineError),
}

/// One NDJSON intake record.
#[derive(Debug, Deserialize)]
struct IngestLine {
    id: String,
    #[serde(rename = "type")]
    kind: AnnouncementType,
    #[serde(default)]
    payload: serde_json::Value,
}

fn parse_line(line: &str) -> Result<(AnnouncementType, Announcement), serde_json::Error> {
    let record: IngestLine = serde_json::from_str(line)?;
    Ok((record.kind, Announcement::new(record.id, record.payload)))
}

#[tokio::main]
async fn main() {
    let filter = std::env::var("HERALD_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => match WorkerConfig::new(cli.config) {
            Ok(cfg) => run(cfg).await,
            Err(err) => Err(err.into()),
        },
        Commands::Inspect { state } => inspect(&state).await,
    };
    if let Err(err) = result {
        error!("herald-worker failed: {err}");
        std::process::exit(1);
    }
}

async fn inspect(path: &Path) -> Result<(), WorkerError> {
    let store = load_from_path(path)?;
    let snapshot = store.snapshot();
    for key in snapshot.keys(now_ms()) {
        if !(key.starts_with("batchMetadata:") || key.starts_with("epochCapacity:")) {
            continue;
        }
        if let Some(value) = store.get(&key).await? {
            println!("{key} {value}");
        }
    }
    for (key, claim) in snapshot.locks() {
        println!("{key} locked_at={} expires_at={}", claim.acquired_at_ms, claim.expires_at_ms);
    }
    Ok(())
}

async fn run(cfg: WorkerConfig) -> Result<(), WorkerError> {
    let pipeline_config = cfg.pipeline_config()?;
    info!(
        environment = %pipeline_config.environment,
        provider = pipeline_config.provider_id.0,
        state = %cfg.state_path.display(),
        "starting herald worker"
    );

    if let Some(parent) = cfg.state_path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!("failed to create state dir {}: {err}", parent.display());
            }
        }
    }
    let store = Arc::new(load_or_default(&cfg.state_path)?);

    let ledger = SimLedger::new(cfg.sim_ledger_config());
    ledger.add_provider(
        pipeline_config.provider_id,
        u128::from(cfg.sim_provider_capacity),
    );

    let pipeline = Arc::new(Pipeline::new(
        pipeline_config,
        store.clone(),
        Arc::new(ledger.clone()),
        Arc::new(DigestAnnouncer::new()),
    )?);
    if pipeline.start().await? == CapacityState::Exhausted {
        warn!("capacity exhausted at startup; publication paused");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = flag::register(SIGTERM, Arc::clone(&shutdown));
    let _ = flag::register(SIGINT, Arc::clone(&shutdown));

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut handles = pipeline.spawn_workers(stop_rx.clone());
    if let Some(input) = cfg.input.clone() {
        handles.push(spawn_ingest(Arc::clone(&pipeline), input, stop_rx));
    }

    let mut last_snapshot = Instant::now();
    let mut last_block = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        if last_block.elapsed() >= cfg.block_interval {
            let number = ledger.produce_block();
            tracing::debug!(block = number, "produced block");
            last_block = Instant::now();
        }
        if last_snapshot.elapsed() >= cfg.snapshot_interval {
            persist(&cfg.state_path, &store);
            last_snapshot = Instant::now();
        }
        tokio::time::sleep(TICK_INTERVAL).await;
    }

    info!("shutting down");
    let _ = stop_tx.send(true);
    pipeline.shutdown();
    for handle in handles {
        if let Err(err) = handle.await {
            warn!("worker task ended abnormally: {err}");
        }
    }
    persist(&cfg.state_path, &store);
    Ok(())
}

fn persist(path: &Path, store: &MemoryStore) {
    match save_to_path(path, store) {
        Ok(()) => info!("saved store snapshot to {}", path.display()),
        Err(err) => warn!("failed to save store snapshot: {err}"),
    }
}

fn spawn_ingest(
    pipeline: Arc<Pipeline>,
    input: String,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if input == "-" {
            ingest(&pipeline, BufReader::new(tokio::io::stdin()), shutdown).await;
            return;
        }
        match tokio::fs::File::open(&input).await {
            Ok(file) => ingest(&pipeline, BufReader::new(file), shutdown).await,
            Err(err) => error!("failed to open input {input}: {err}"),
        }
    })
}

async fn ingest<R>(pipeline: &Pipeline, reader: R, mut shutdown: watch::Receiver<bool>)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut accepted = 0usize;
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown.changed() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!("input read failed: {err}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let (kind, announcement) = match parse_line(&line) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("skipping malformed announcement: {err}");
                continue;
            }
        };
        match pipeline.submit(kind, announcement) {
            Ok(true) => accepted += 1,
            Ok(false) => {}
            Err(err) => warn!(%kind, "submit failed: {err}"),
        }
    }
    info!(accepted, "input drained");
}
