//! Tags of the persisted state document.
//!
//! Tag strings are part of the on-disk format. Renaming one breaks old
//! snapshots; bump [`STATE_VERSION`] when the layout changes.

use std::fmt;

/// Layout version written after the document time.
pub const STATE_VERSION: &str = "streamwarden/1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateTag {
    // Document root, in write order.
    /// End of the last finalised bucket, epoch seconds.
    Time,
    /// [`STATE_VERSION`] of the writer.
    Version,
    /// Level holding one entity model.
    Entity,
    /// Level holding the correlation tracker.
    Correlations,
    /// JSON of the recent results queue.
    ResultsQueue,
    /// JSON of the score normaliser.
    Normalizer,
    LatestRecordTime,
    LastResultsTime,
    /// JSON of bucket data gathered but not yet finalised.
    PendingBuckets,

    // Entity level.
    SearchKeyId,
    Partition,
    /// Registry slot of the entity; correlated pairs refer to it.
    Slot,
    FirstSeen,
    LastSeen,
    WindowBucketCount,
    Pruned,
    /// `counting`, `individual` or `population`.
    ModelKind,
    /// JSON of opaque upstream data attached to the entity.
    ExtraData,
    /// Counting models: events in the most recent bucket.
    BucketCount,
    /// Counting models: events since creation.
    TotalCount,
    /// Population models: level mapping an over-field value to its id.
    Attribute,
    AttributeName,
    AttributeId,
    /// Level holding one feature's prior, trend and controllers.
    FeatureModel,
    FeatureName,
    /// JSON of a prior.
    Prior,
    /// JSON of a trend.
    Trend,
    PriorController,
    TrendController,
    SampleCount,

    // Correlations level.
    CorrelationFeature,
    /// JSON of the k-most-correlated search structure.
    CorrelationStructure,
    /// Level holding one modelled pair.
    CorrelatePair,
    EntityA,
    EntityB,
    Coefficient,
    /// JSON of the pair's bivariate prior.
    JointPrior,
}

const ALL: &[StateTag] = &[
    StateTag::Time,
    StateTag::Version,
    StateTag::Entity,
    StateTag::Correlations,
    StateTag::ResultsQueue,
    StateTag::Normalizer,
    StateTag::LatestRecordTime,
    StateTag::LastResultsTime,
    StateTag::PendingBuckets,
    StateTag::SearchKeyId,
    StateTag::Partition,
    StateTag::Slot,
    StateTag::FirstSeen,
    StateTag::LastSeen,
    StateTag::WindowBucketCount,
    StateTag::Pruned,
    StateTag::ModelKind,
    StateTag::ExtraData,
    StateTag::BucketCount,
    StateTag::TotalCount,
    StateTag::Attribute,
    StateTag::AttributeName,
    StateTag::AttributeId,
    StateTag::FeatureModel,
    StateTag::FeatureName,
    StateTag::Prior,
    StateTag::Trend,
    StateTag::PriorController,
    StateTag::TrendController,
    StateTag::SampleCount,
    StateTag::CorrelationFeature,
    StateTag::CorrelationStructure,
    StateTag::CorrelatePair,
    StateTag::EntityA,
    StateTag::EntityB,
    StateTag::Coefficient,
    StateTag::JointPrior,
];

impl StateTag {
    pub fn as_str(self) -> &'static str {
        match self {
            StateTag::Time => "time",
            StateTag::Version => "version",
            StateTag::Entity => "entity",
            StateTag::Correlations => "correlations",
            StateTag::ResultsQueue => "results_queue",
            StateTag::Normalizer => "normalizer",
            StateTag::LatestRecordTime => "latest_record_time",
            StateTag::LastResultsTime => "last_results_time",
            StateTag::PendingBuckets => "pending_buckets",
            StateTag::SearchKeyId => "search_key_id",
            StateTag::Partition => "partition",
            StateTag::Slot => "slot",
            StateTag::FirstSeen => "first_seen",
            StateTag::LastSeen => "last_seen",
            StateTag::WindowBucketCount => "window_bucket_count",
            StateTag::Pruned => "pruned",
            StateTag::ModelKind => "model_kind",
            StateTag::ExtraData => "extra_data",
            StateTag::BucketCount => "bucket_count",
            StateTag::TotalCount => "total_count",
            StateTag::Attribute => "attribute",
            StateTag::AttributeName => "attribute_name",
            StateTag::AttributeId => "attribute_id",
            StateTag::FeatureModel => "feature_model",
            StateTag::FeatureName => "feature",
            StateTag::Prior => "prior",
            StateTag::Trend => "trend",
            StateTag::PriorController => "prior_controller",
            StateTag::TrendController => "trend_controller",
            StateTag::SampleCount => "sample_count",
            StateTag::CorrelationFeature => "correlation_feature",
            StateTag::CorrelationStructure => "correlation_structure",
            StateTag::CorrelatePair => "correlate_pair",
            StateTag::EntityA => "entity_a",
            StateTag::EntityB => "entity_b",
            StateTag::Coefficient => "coefficient",
            StateTag::JointPrior => "joint_prior",
        }
    }

    pub fn parse(s: &str) -> Option<StateTag> {
        ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for StateTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tag_strings_are_unique_and_parse_back() {
        let mut seen = HashSet::new();
        for tag in ALL {
            assert!(seen.insert(tag.as_str()), "duplicate tag {}", tag);
            assert_eq!(StateTag::parse(tag.as_str()), Some(*tag));
        }
        assert_eq!(StateTag::parse("nonsense"), None);
    }
}
