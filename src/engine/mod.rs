//! The bucket orchestrator and its input and output plumbing.

pub mod control;
pub mod orchestrator;
pub mod results;

use thiserror::Error;

use crate::config::ConfigError;
use crate::persist::{PersistError, RestoreError};

pub use control::{ControlError, ControlMessage, TimeRange, CONTROL_FIELD};
pub use orchestrator::{Orchestrator, Record};
pub use results::{
    BucketResults, CollectingSink, JsonLinesWriter, Normalizer, OutputEvent, ResultSink,
    ResultsQueue,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to write results: {0}")]
    Output(#[from] std::io::Error),
    #[error("failed to encode results: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("restore failed: {0}")]
    Restore(#[from] RestoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("final checkpoint failed: {0}")]
    FinalCheckpoint(String),
}
