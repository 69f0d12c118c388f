//! Background persister: writes one snapshot at a time on tokio's blocking
//! pool.
//!
//! Writes run on the runtime the persister was created in. Created outside
//! any runtime (tests, embedding without tokio), it starts a small private
//! runtime on first use. Waiting blocks the calling thread, so the persister
//! must be driven from synchronous code such as a `spawn_blocking` task.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::sink::StateSink;
use super::snapshot::{EngineSnapshot, PersistCompletion};
use super::PersistError;

pub type CompletionQueue = Arc<Mutex<VecDeque<PersistCompletion>>>;

pub struct BackgroundPersister {
    sink: Arc<dyn StateSink>,
    handle: Option<Handle>,
    worker: Option<JoinHandle<Result<PersistCompletion, PersistError>>>,
    completions: CompletionQueue,
    /// Private runtime, dropped last.
    runtime: Option<Runtime>,
}

impl BackgroundPersister {
    pub fn new(sink: Arc<dyn StateSink>, completions: CompletionQueue) -> Self {
        Self {
            sink,
            handle: Handle::try_current().ok(),
            worker: None,
            completions,
            runtime: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    fn handle(&mut self) -> Result<Handle, PersistError> {
        if let Some(handle) = &self.handle {
            return Ok(handle.clone());
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .thread_name("streamwarden-persist")
            .build()?;
        debug!("started private persistence runtime");
        let handle = runtime.handle().clone();
        self.runtime = Some(runtime);
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Hand `snapshot` to a new blocking task. Returns `Ok(false)` without
    /// taking the snapshot any further if a write is still in flight.
    pub fn start(&mut self, snapshot: EngineSnapshot) -> Result<bool, PersistError> {
        if self.is_busy() {
            return Ok(false);
        }
        // Reap a finished worker so its failure is logged.
        if let Err(e) = self.wait_for_idle() {
            error!(error = %e, "previous background checkpoint failed");
        }

        let handle = self.handle()?;
        let sink = Arc::clone(&self.sink);
        let completions = Arc::clone(&self.completions);
        let worker = handle.spawn_blocking(move || {
            let result = snapshot.write_to(sink.as_ref());
            match &result {
                Ok(completion) => {
                    info!(
                        snapshot = %completion.snapshot_id,
                        entities = completion.entities,
                        "background checkpoint complete"
                    );
                    if let Ok(mut queue) = completions.lock() {
                        queue.push_back(completion.clone());
                    }
                }
                Err(e) => error!(error = %e, "background checkpoint failed"),
            }
            result
        });
        self.worker = Some(worker);
        Ok(true)
    }

    /// Block until the in-flight write, if any, has finished and return its
    /// failure.
    pub fn wait_for_idle(&mut self) -> Result<(), PersistError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let Some(handle) = self.handle.clone() else {
            return Ok(());
        };
        match handle.block_on(worker) {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(PersistError::WorkerPanicked),
        }
    }
}

impl Drop for BackgroundPersister {
    fn drop(&mut self) {
        if let Err(e) = self.wait_for_idle() {
            error!(error = %e, "background checkpoint failed during shutdown");
        }
    }
}
