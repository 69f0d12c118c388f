//! Checkpoint coordinator.
//!
//! Periodic checkpoints run on the background persister and never block the
//! caller: if the previous one is still being written the checkpoint is
//! skipped and the periodic interval grows by a fixed increment. The interval
//! never shrinks again. A final checkpoint waits for the persister and then
//! writes synchronously, so the sink is never used by two checkpoints at once.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::background::{BackgroundPersister, CompletionQueue};
use super::sink::StateSink;
use super::snapshot::{EngineSnapshot, PersistCompletion};

/// Source of wall-clock time in epoch seconds.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    Periodic,
    Final,
}

impl CheckpointReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointReason::Periodic => "periodic",
            CheckpointReason::Final => "final",
        }
    }
}

impl fmt::Display for CheckpointReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "periodic" => Ok(CheckpointReason::Periodic),
            "final" => Ok(CheckpointReason::Final),
            other => Err(format!("unknown checkpoint reason '{other}'")),
        }
    }
}

/// Whether a periodic checkpoint should be taken now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodicCheck {
    NotDue,
    Due,
    /// Due, but the persister is busy; the interval has grown.
    Deferred { interval_secs: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointOutcome {
    NotDue,
    Deferred { interval_secs: i64 },
    /// Handed to the background persister.
    Started,
    /// Written synchronously.
    Completed(PersistCompletion),
    Failed(String),
}

impl CheckpointOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, CheckpointOutcome::Failed(_))
    }
}

pub struct CheckpointCoordinator {
    sink: Arc<dyn StateSink>,
    clock: Arc<dyn Clock>,
    persister: BackgroundPersister,
    completions: CompletionQueue,
    /// `None` disables periodic checkpoints.
    interval: Option<i64>,
    increment: i64,
    last_checkpoint: Option<i64>,
}

impl CheckpointCoordinator {
    /// A non-positive `periodic_interval_secs` disables periodic checkpoints; any
    /// other value is raised to at least `increment_secs`.
    pub fn new(
        sink: Arc<dyn StateSink>,
        clock: Arc<dyn Clock>,
        periodic_interval_secs: i64,
        increment_secs: i64,
    ) -> Self {
        let increment = increment_secs.max(1);
        let interval = (periodic_interval_secs > 0).then(|| periodic_interval_secs.max(increment));
        let completions: CompletionQueue = Arc::default();
        Self {
            persister: BackgroundPersister::new(Arc::clone(&sink), Arc::clone(&completions)),
            sink,
            clock,
            completions,
            interval,
            increment,
            last_checkpoint: None,
        }
    }

    pub fn sink(&self) -> &Arc<dyn StateSink> {
        &self.sink
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn periodic_interval(&self) -> Option<i64> {
        self.interval
    }

    pub fn is_busy(&self) -> bool {
        self.persister.is_busy()
    }

    /// Start the periodic timer on the first record of the job.
    pub fn mark_first_data(&mut self) {
        if self.last_checkpoint.is_none() {
            self.last_checkpoint = Some(self.clock.now());
        }
    }

    pub fn check_periodic(&mut self) -> PeriodicCheck {
        let (Some(interval), Some(last)) = (self.interval, self.last_checkpoint) else {
            return PeriodicCheck::NotDue;
        };
        if self.clock.now() < last + interval {
            return PeriodicCheck::NotDue;
        }
        if self.persister.is_busy() {
            let grown = interval + self.increment;
            self.interval = Some(grown);
            warn!(
                interval_secs = grown,
                "previous checkpoint still in progress; increasing periodic interval"
            );
            return PeriodicCheck::Deferred {
                interval_secs: grown,
            };
        }
        PeriodicCheck::Due
    }

    pub fn checkpoint(&mut self, snapshot: EngineSnapshot) -> CheckpointOutcome {
        match snapshot.reason {
            CheckpointReason::Periodic => self.start_periodic(snapshot),
            CheckpointReason::Final => self.write_final(snapshot),
        }
    }

    fn start_periodic(&mut self, snapshot: EngineSnapshot) -> CheckpointOutcome {
        self.last_checkpoint = Some(self.clock.now());
        let description = snapshot.description();
        match self.persister.start(snapshot) {
            Ok(true) => {
                info!(%description, "background checkpoint started");
                CheckpointOutcome::Started
            }
            Ok(false) => CheckpointOutcome::Deferred {
                interval_secs: self.interval.unwrap_or(self.increment),
            },
            Err(e) => {
                error!(error = %e, "failed to start background checkpoint");
                CheckpointOutcome::Failed(e.to_string())
            }
        }
    }

    fn write_final(&mut self, snapshot: EngineSnapshot) -> CheckpointOutcome {
        if let Err(e) = self.persister.wait_for_idle() {
            error!(error = %e, "background checkpoint failed before final checkpoint");
        }
        match snapshot.write_to(self.sink.as_ref()) {
            Ok(completion) => {
                info!(
                    snapshot = %completion.snapshot_id,
                    entities = completion.entities,
                    "final checkpoint complete"
                );
                if let Ok(mut queue) = self.completions.lock() {
                    queue.push_back(completion.clone());
                }
                CheckpointOutcome::Completed(completion)
            }
            Err(e) => {
                error!(error = %e, "final checkpoint failed");
                CheckpointOutcome::Failed(e.to_string())
            }
        }
    }

    /// Block until the background persister is idle. Returns false if its
    /// last write failed.
    pub fn wait_for_idle(&mut self) -> bool {
        match self.persister.wait_for_idle() {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "background checkpoint failed");
                false
            }
        }
    }

    /// Completions not yet reported, oldest first.
    pub fn drain_completions(&self) -> Vec<PersistCompletion> {
        drain(&self.completions)
    }
}

fn drain(queue: &Mutex<VecDeque<PersistCompletion>>) -> Vec<PersistCompletion> {
    queue
        .lock()
        .map(|mut q| q.drain(..).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::results::{Normalizer, ResultsQueue};
    use crate::persist::sink::MemoryStateStore;
    use crate::registry::ModelRegistry;
    use std::time::Duration;

    fn snapshot(reason: CheckpointReason) -> EngineSnapshot {
        let registry = ModelRegistry::new(&EngineConfig::default());
        let (models, correlations, gatherer) = registry.snapshot_parts();
        EngineSnapshot {
            reason,
            created_at: 0,
            last_finalised: Some(600),
            latest_record_time: Some(550),
            last_results_time: Some(300),
            models,
            correlations,
            gatherer,
            results: ResultsQueue::default(),
            normalizer: Normalizer::new(0.0005),
            model_size: registry.model_size_stats(),
        }
    }

    fn coordinator(
        store: Arc<MemoryStateStore>,
        clock: Arc<ManualClock>,
    ) -> CheckpointCoordinator {
        CheckpointCoordinator::new(store, clock, 3600, 300)
    }

    #[test]
    fn test_interval_is_clamped_to_increment() {
        let c = CheckpointCoordinator::new(
            Arc::new(MemoryStateStore::new()),
            Arc::new(ManualClock::new(0)),
            10,
            300,
        );
        assert_eq!(c.periodic_interval(), Some(300));
        let disabled = CheckpointCoordinator::new(
            Arc::new(MemoryStateStore::new()),
            Arc::new(ManualClock::new(0)),
            0,
            300,
        );
        assert_eq!(disabled.periodic_interval(), None);
    }

    #[test]
    fn test_periodic_not_due_before_first_data() {
        let clock = Arc::new(ManualClock::new(0));
        let mut c = coordinator(Arc::new(MemoryStateStore::new()), Arc::clone(&clock));
        clock.advance(100_000);
        assert_eq!(c.check_periodic(), PeriodicCheck::NotDue);

        c.mark_first_data();
        clock.advance(3599);
        assert_eq!(c.check_periodic(), PeriodicCheck::NotDue);
        clock.advance(1);
        assert_eq!(c.check_periodic(), PeriodicCheck::Due);
    }

    #[test]
    fn test_busy_persister_grows_interval() {
        let store = Arc::new(MemoryStateStore::with_write_delay(Duration::from_millis(400)));
        let clock = Arc::new(ManualClock::new(0));
        let mut c = coordinator(Arc::clone(&store), Arc::clone(&clock));
        c.mark_first_data();

        clock.advance(3600);
        assert_eq!(c.check_periodic(), PeriodicCheck::Due);
        assert_eq!(
            c.checkpoint(snapshot(CheckpointReason::Periodic)),
            CheckpointOutcome::Started
        );
        assert!(c.is_busy());

        clock.advance(3600);
        assert_eq!(
            c.check_periodic(),
            PeriodicCheck::Deferred { interval_secs: 3900 }
        );
        clock.advance(300);
        assert_eq!(
            c.check_periodic(),
            PeriodicCheck::Deferred { interval_secs: 4200 }
        );

        assert!(c.wait_for_idle());
        assert_eq!(store.len(), 1);
        // The grown interval is kept once the persister is idle again.
        assert_eq!(c.periodic_interval(), Some(4200));
        assert_eq!(c.check_periodic(), PeriodicCheck::NotDue);
        let completions = c.drain_completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].reason, CheckpointReason::Periodic);
        assert!(c.drain_completions().is_empty());
    }

    #[test]
    fn test_final_checkpoint_waits_for_background_write() {
        let store = Arc::new(MemoryStateStore::with_write_delay(Duration::from_millis(200)));
        let clock = Arc::new(ManualClock::new(0));
        let mut c = coordinator(Arc::clone(&store), clock);
        c.mark_first_data();
        assert_eq!(
            c.checkpoint(snapshot(CheckpointReason::Periodic)),
            CheckpointOutcome::Started
        );
        let outcome = c.checkpoint(snapshot(CheckpointReason::Final));
        assert!(matches!(outcome, CheckpointOutcome::Completed(_)));
        let stored = store.list().unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].reason, CheckpointReason::Periodic);
        assert_eq!(stored[1].reason, CheckpointReason::Final);
        assert!(!c.is_busy());
    }

    #[test]
    fn test_failed_final_checkpoint_is_reported() {
        let store = Arc::new(MemoryStateStore::new());
        store.set_failing(true);
        let mut c = coordinator(Arc::clone(&store), Arc::new(ManualClock::new(0)));
        let outcome = c.checkpoint(snapshot(CheckpointReason::Final));
        assert!(outcome.is_failure());
        assert!(c.drain_completions().is_empty());
    }
}
