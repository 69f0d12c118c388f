//! Model state persistence: the state document format, snapshot capture,
//! sinks, the background persister and the checkpoint coordinator.

pub mod background;
pub mod coordinator;
pub mod sink;
pub mod snapshot;
pub mod state;
pub mod tags;

use thiserror::Error;

pub use background::BackgroundPersister;
pub use coordinator::{
    CheckpointCoordinator, CheckpointOutcome, CheckpointReason, Clock, ManualClock, PeriodicCheck,
    SystemClock,
};
pub use sink::{MemoryStateStore, StateSink, StoredSnapshot};
pub use snapshot::{EngineSnapshot, PersistCompletion};
pub use state::{StateInserter, StateNode, StateTraverser};
pub use tags::{StateTag, STATE_VERSION};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("state sink failed: {0}")]
    Sink(#[source] anyhow::Error),
    #[error("failed to start persistence runtime: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("background checkpoint task panicked")]
    WorkerPanicked,
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("expected state tag '{expected}' but found '{found}'")]
    UnexpectedTag {
        expected: &'static str,
        found: String,
    },
    #[error("state tag '{tag}' carries no value")]
    MissingValue { tag: String },
    #[error("state tag '{tag}' is not a level")]
    NotALevel { tag: String },
    #[error("invalid value '{value}' for state tag '{tag}'")]
    InvalidValue { tag: String, value: String },
    #[error("entity state is missing '{0}'")]
    MissingField(&'static str),
    #[error("corrupt state document: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("state source failed: {0}")]
    Source(#[source] anyhow::Error),
}

/// Non-fatal outcome of a restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStatus {
    /// Every entity in the document was restored.
    Restored { entities: usize },
    /// The source held nothing to restore.
    NoStateRecovered,
    /// The document was written by an incompatible version and was ignored.
    IncorrectVersion,
    /// Restoring stopped early because the memory budget was exhausted.
    MemoryLimitReached { entities: usize },
}

impl RestoreStatus {
    pub fn entities(&self) -> usize {
        match self {
            RestoreStatus::Restored { entities }
            | RestoreStatus::MemoryLimitReached { entities } => *entities,
            RestoreStatus::NoStateRecovered | RestoreStatus::IncorrectVersion => 0,
        }
    }
}
