//! streamwarden -- streaming anomaly detection over time-bucketed records.
//!
//! This crate provides the per-entity models, the model registry with its
//! memory budget and correlation tracking, the bucket orchestrator, and
//! crash-consistent checkpointing to SQLite.

pub mod config;
pub mod engine;
pub mod input;
pub mod maths;
pub mod model;
pub mod persist;
pub mod registry;
pub mod stats;
pub mod storage;

use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, BufReader};
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::engine::{JsonLinesWriter, Orchestrator, ResultSink};
use crate::persist::{StateSink, StoredSnapshot, SystemClock};
use crate::stats::EngineStats;
use crate::storage::SqliteStateStore;

/// Records buffered between the input reader and the engine.
const INPUT_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Input file; `None` or `-` reads standard input.
    pub input: Option<PathBuf>,
    /// Restore the newest snapshot before processing.
    pub restore: bool,
    /// Check and count records without modelling them.
    pub dry_run: bool,
}

/// Open the SQLite state store, creating its directory if needed.
pub fn open_state_store(config: &EngineConfig) -> Result<SqliteStateStore> {
    let path = &config.persistence.state_db;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating state directory {}", parent.display()))?;
    }
    SqliteStateStore::open(&path.to_string_lossy())
}

/// Run a job over newline-delimited JSON from a file or standard input,
/// writing results to standard output and checkpoints to the configured
/// SQLite database.
pub async fn run(config: EngineConfig, options: RunOptions) -> Result<EngineStats> {
    let store = Arc::new(open_state_store(&config)?);
    let keep = config.persistence.keep_snapshots;
    let output = Box::new(JsonLinesWriter::new(BufWriter::new(std::io::stdout())));

    let stats = match options.input.as_deref() {
        Some(path) if path.as_os_str() != "-" => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening input {}", path.display()))?;
            run_stream(config, BufReader::new(file), store.clone(), output, &options).await?
        }
        _ => {
            let stdin = BufReader::new(tokio::io::stdin());
            run_stream(config, stdin, store.clone(), output, &options).await?
        }
    };

    if keep > 0 {
        let removed = store.retain_latest(keep)?;
        if removed > 0 {
            tracing::debug!(removed, keep, "removed old snapshots");
        }
    }
    Ok(stats)
}

/// Run a job over `input`. The engine runs on a blocking thread and is fed
/// records in input order; the final checkpoint is written when the input
/// ends.
pub async fn run_stream<R>(
    config: EngineConfig,
    input: R,
    state: Arc<dyn StateSink>,
    output: Box<dyn ResultSink>,
    options: &RunOptions,
) -> Result<EngineStats>
where
    R: AsyncBufRead + Unpin,
{
    let (tx, mut rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
    let restore = options.restore;
    let dry_run = options.dry_run;

    let engine = tokio::task::spawn_blocking(move || -> Result<EngineStats> {
        let mut engine = Orchestrator::new(config, state, Arc::new(SystemClock), output);
        if restore {
            let status = engine.restore_state().context("restoring state")?;
            tracing::info!(?status, "restore finished");
        }
        while let Some(record) = rx.blocking_recv() {
            engine.handle(dry_run, &record)?;
        }
        engine.finalise()?;
        Ok(engine.stats().clone())
    });

    let bad_lines = input::forward_records(input, tx)
        .await
        .context("reading input")?;
    let stats = engine.await.context("engine task panicked")??;
    if bad_lines > 0 {
        tracing::warn!(bad_lines, "some input lines could not be parsed");
    }
    Ok(stats)
}

/// Stored snapshots, oldest first, without their documents.
pub fn list_snapshots(config: &EngineConfig) -> Result<Vec<StoredSnapshot>> {
    open_state_store(config)?.list()
}
