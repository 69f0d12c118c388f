//! The persistence clone: a by-value copy of everything a checkpoint writes.
//!
//! An [`EngineSnapshot`] shares nothing with the foreground engine, so it can
//! be moved to the background writer while ingestion carries on.

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::engine::results::{Normalizer, ResultsQueue};
use crate::model::Model;
use crate::registry::budget::ModelSizeStats;
use crate::registry::correlations::CorrelationTracker;
use crate::registry::gatherer::BucketGatherer;

use super::coordinator::CheckpointReason;
use super::sink::{StateSink, StoredSnapshot};
use super::state::StateInserter;
use super::tags::{StateTag, STATE_VERSION};
use super::PersistError;

/// Written as the document time when no bucket has been finalised yet.
pub const TIME_UNSET: i64 = i64::MIN;

/// Announces a successfully stored checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistCompletion {
    pub snapshot_id: String,
    pub reason: CheckpointReason,
    /// When the snapshot was taken, epoch seconds.
    pub timestamp: i64,
    pub description: String,
    pub entities: usize,
    pub latest_record_time: Option<i64>,
    pub last_results_time: Option<i64>,
    /// Model memory at snapshot time, bytes.
    pub memory: usize,
}

#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub reason: CheckpointReason,
    pub created_at: i64,
    /// End of the last finalised bucket.
    pub last_finalised: Option<i64>,
    pub latest_record_time: Option<i64>,
    pub last_results_time: Option<i64>,
    pub models: Vec<Model>,
    pub correlations: CorrelationTracker,
    pub gatherer: BucketGatherer,
    pub results: ResultsQueue,
    pub normalizer: Normalizer,
    pub model_size: ModelSizeStats,
}

impl EngineSnapshot {
    pub fn description(&self) -> String {
        let reason = match self.reason {
            CheckpointReason::Periodic => "periodic",
            CheckpointReason::Final => "final",
        };
        match self.last_finalised {
            Some(t) => format!("{reason} checkpoint at bucket end {t}"),
            None => format!("{reason} checkpoint before any finalised bucket"),
        }
    }

    /// Write the document: time, version, then everything else.
    pub fn persist(&self, inserter: &mut StateInserter) -> Result<(), PersistError> {
        inserter.insert_value(StateTag::Time, self.last_finalised.unwrap_or(TIME_UNSET));
        inserter.insert_value(StateTag::Version, STATE_VERSION);
        if let Some(t) = self.latest_record_time {
            inserter.insert_value(StateTag::LatestRecordTime, t);
        }
        if let Some(t) = self.last_results_time {
            inserter.insert_value(StateTag::LastResultsTime, t);
        }
        for model in &self.models {
            inserter.insert_level(StateTag::Entity, |level| model.persist(level))?;
        }
        inserter.insert_level(StateTag::Correlations, |level| self.correlations.persist(level))?;
        inserter.insert_json(StateTag::PendingBuckets, &self.gatherer)?;
        inserter.insert_json(StateTag::ResultsQueue, &self.results)?;
        inserter.insert_json(StateTag::Normalizer, &self.normalizer)?;
        Ok(())
    }

    pub fn to_document(&self) -> Result<String, PersistError> {
        let mut inserter = StateInserter::new();
        self.persist(&mut inserter)?;
        inserter.to_json()
    }

    /// Serialise and store the snapshot.
    pub fn write_to(&self, sink: &dyn StateSink) -> Result<PersistCompletion, PersistError> {
        let document = self.to_document()?;
        let stored = StoredSnapshot {
            id: Uuid::new_v4().to_string(),
            created_at: self.created_at,
            reason: self.reason,
            description: self.description(),
            entities: self.models.len(),
            document,
        };
        debug!(
            snapshot = %stored.id,
            bytes = stored.document.len(),
            entities = stored.entities,
            "writing snapshot"
        );
        sink.store(&stored).map_err(PersistError::Sink)?;
        Ok(PersistCompletion {
            snapshot_id: stored.id,
            reason: self.reason,
            timestamp: self.created_at,
            description: stored.description,
            entities: stored.entities,
            latest_record_time: self.latest_record_time,
            last_results_time: self.last_results_time,
            memory: self.model_size.model_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::persist::state::{parse_document, StateTraverser};
    use crate::persist::MemoryStateStore;
    use crate::registry::ModelRegistry;

    fn empty(last_finalised: Option<i64>) -> EngineSnapshot {
        let registry = ModelRegistry::new(&EngineConfig::default());
        let (models, correlations, gatherer) = registry.snapshot_parts();
        EngineSnapshot {
            reason: CheckpointReason::Final,
            created_at: 42,
            last_finalised,
            latest_record_time: None,
            last_results_time: None,
            models,
            correlations,
            gatherer,
            results: ResultsQueue::default(),
            normalizer: Normalizer::new(0.0),
            model_size: registry.model_size_stats(),
        }
    }

    #[test]
    fn test_document_starts_with_time_and_version() {
        let json = empty(Some(900)).to_document().unwrap();
        let nodes = parse_document(&json).unwrap();
        let mut t = StateTraverser::new(&nodes);
        assert_eq!(t.expect(StateTag::Time).unwrap().parse::<i64>().unwrap(), 900);
        assert_eq!(t.expect(StateTag::Version).unwrap().value().unwrap(), STATE_VERSION);

        let unset = empty(None).to_document().unwrap();
        let nodes = parse_document(&unset).unwrap();
        assert_eq!(nodes[0].parse::<i64>().unwrap(), TIME_UNSET);
    }

    #[test]
    fn test_write_to_sink() {
        let store = MemoryStateStore::new();
        let completion = empty(Some(300)).write_to(&store).unwrap();
        let stored = store.latest().unwrap().unwrap();
        assert_eq!(stored.id, completion.snapshot_id);
        assert_eq!(completion.timestamp, 42);
        assert!(stored.description.contains("final"));
    }
}
