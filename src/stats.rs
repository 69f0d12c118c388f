//! Engine counters.
//!
//! A plain struct owned by the orchestrator and passed by `&mut` to whatever
//! needs to record into it.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::events::ModelEvent;

/// Counters accumulated over the lifetime of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Records that passed time parsing and ordering checks.
    pub records_handled: u64,
    /// Records without a time field.
    pub records_no_time_field: u64,
    /// Records whose time field could not be parsed.
    pub time_conversion_errors: u64,
    /// Records older than the last finalised bucket.
    pub out_of_order_records: u64,
    /// Metric detectors skipped because the value field was missing.
    pub missing_field_values: u64,
    pub control_messages: u64,
    pub unknown_control_messages: u64,
    pub buckets_finalised: u64,
    /// Jumps in time too long to close bucket by bucket.
    pub gaps_skipped: u64,
    pub interim_results: u64,
    pub anomaly_records: u64,
    pub entities_created: u64,
    pub entities_recycled: u64,
    pub entities_pruned: u64,
    pub entities_removed: u64,
    pub creation_rejections: u64,
    pub trend_reinitialisations: u64,
    pub correlations_dropped: u64,
    pub checkpoints_started: u64,
    pub checkpoints_deferred: u64,
    pub checkpoints_failed: u64,
}

impl EngineStats {
    /// Update the model lifecycle counters for one event.
    pub fn record_event(&mut self, event: &ModelEvent) {
        match event {
            ModelEvent::EntityCreated { .. } => self.entities_created += 1,
            ModelEvent::EntityRecycled { .. } => self.entities_recycled += 1,
            ModelEvent::EntityPruned { .. } => self.entities_pruned += 1,
            ModelEvent::EntityRemoved { .. } => self.entities_removed += 1,
            ModelEvent::CreationRejected { .. } => self.creation_rejections += 1,
            ModelEvent::TrendReinitialised { .. } => self.trend_reinitialisations += 1,
            ModelEvent::CorrelationsDropped { count, .. } => {
                self.correlations_dropped += *count as u64
            }
        }
    }

    pub fn log_summary(&self) {
        info!(
            records = self.records_handled,
            no_time_field = self.records_no_time_field,
            time_errors = self.time_conversion_errors,
            out_of_order = self.out_of_order_records,
            buckets = self.buckets_finalised,
            gaps_skipped = self.gaps_skipped,
            anomalies = self.anomaly_records,
            entities_created = self.entities_created,
            rejected = self.creation_rejections,
            pruned = self.entities_pruned,
            checkpoints = self.checkpoints_started,
            "engine statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::key::EntityKey;

    #[test]
    fn test_record_event_counts() {
        let mut stats = EngineStats::default();
        let key = EntityKey::new(1, "a");
        stats.record_event(&ModelEvent::EntityCreated { key: key.clone() });
        stats.record_event(&ModelEvent::CreationRejected { key: key.clone() });
        stats.record_event(&ModelEvent::CreationRejected { key });
        assert_eq!(stats.entities_created, 1);
        assert_eq!(stats.creation_rejections, 2);
    }
}
