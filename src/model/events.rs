//! Model lifecycle events.
//!
//! Models and the registry push events into a buffer while they work; the
//! orchestrator drains it once per bucket and hands every event to a fixed,
//! ordered list of subscribers.

use tracing::{debug, info};

use crate::model::feature::Feature;
use crate::model::key::{EntityId, EntityKey};
use crate::stats::EngineStats;

#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    EntityCreated { key: EntityKey },
    /// A freed slot was handed to a new entity and its state reset.
    EntityRecycled { key: EntityKey },
    /// The entity's heavy state was swapped for placeholders after inactivity.
    EntityPruned { key: EntityKey },
    /// The entity was evicted by an upstream request.
    EntityRemoved { key: EntityKey },
    /// No model was created because the memory budget was exhausted.
    CreationRejected { key: EntityKey },
    /// A trend changed structure; the feature's prior was reset.
    TrendReinitialised { key: EntityKey, feature: Feature },
    /// Correlated pairs involving an entity were discarded.
    CorrelationsDropped {
        feature: Feature,
        entity: EntityId,
        count: usize,
    },
}

/// Receives every event, in order.
pub type Subscriber = fn(&ModelEvent, &mut EngineStats);

fn count_event(event: &ModelEvent, stats: &mut EngineStats) {
    stats.record_event(event);
}

fn log_event(event: &ModelEvent, _stats: &mut EngineStats) {
    match event {
        ModelEvent::EntityCreated { key } => debug!(entity = %key, "created model"),
        ModelEvent::EntityRecycled { key } => debug!(entity = %key, "recycled model slot"),
        ModelEvent::EntityPruned { key } => debug!(entity = %key, "pruned inactive model"),
        ModelEvent::EntityRemoved { key } => info!(entity = %key, "removed model"),
        ModelEvent::CreationRejected { key } => {
            debug!(entity = %key, "model not created: memory limit reached")
        }
        ModelEvent::TrendReinitialised { key, feature } => {
            info!(entity = %key, feature = %feature, "trend reinitialised, prior reset")
        }
        ModelEvent::CorrelationsDropped {
            feature,
            entity,
            count,
        } => debug!(feature = %feature, entity, count, "dropped correlated pairs"),
    }
}

/// The subscribers every event is delivered to.
pub const SUBSCRIBERS: &[Subscriber] = &[count_event, log_event];

/// Deliver `events` to each subscriber in turn.
pub fn dispatch(events: &[ModelEvent], stats: &mut EngineStats) {
    for event in events {
        for subscriber in SUBSCRIBERS {
            subscriber(event, stats);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_reaches_stats() {
        let mut stats = EngineStats::default();
        let events = vec![
            ModelEvent::EntityPruned {
                key: EntityKey::new(2, "p"),
            },
            ModelEvent::CorrelationsDropped {
                feature: Feature::IndividualCount,
                entity: 3,
                count: 4,
            },
        ];
        dispatch(&events, &mut stats);
        assert_eq!(stats.entities_pruned, 1);
        assert_eq!(stats.correlations_dropped, 4);
    }
}
