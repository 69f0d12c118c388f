//! Entity slot index and per-bucket data gathering.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::model::feature::EntityBucket;
use crate::model::key::{EntityId, EntityKey};

// ---------------------------------------------------------------------------
// Entity index
// ---------------------------------------------------------------------------

/// Bidirectional map between entity keys and dense slot ids. Freed slots are
/// handed out again, lowest first.
#[derive(Debug, Clone, Default)]
pub struct EntityIndex {
    by_key: HashMap<EntityKey, EntityId>,
    keys: Vec<Option<EntityKey>>,
    free: BTreeSet<EntityId>,
}

impl EntityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &EntityKey) -> Option<EntityId> {
        self.by_key.get(key).copied()
    }

    pub fn key(&self, id: EntityId) -> Option<&EntityKey> {
        self.keys.get(id as usize).and_then(Option::as_ref)
    }

    pub fn is_active(&self, id: EntityId) -> bool {
        self.key(id).is_some()
    }

    /// Give `key` a slot. The flag is true when the slot was freed earlier
    /// and its model must be reset before use.
    pub fn assign(&mut self, key: EntityKey) -> (EntityId, bool) {
        if let Some(id) = self.free.pop_first() {
            self.keys[id as usize] = Some(key.clone());
            self.by_key.insert(key, id);
            return (id, true);
        }
        let id = self.keys.len() as EntityId;
        self.keys.push(Some(key.clone()));
        self.by_key.insert(key, id);
        (id, false)
    }

    /// Place `key` at a specific slot, as recorded in persisted state.
    pub fn insert_at(&mut self, id: EntityId, key: EntityKey) {
        let index = id as usize;
        while self.keys.len() <= index {
            self.free.insert(self.keys.len() as EntityId);
            self.keys.push(None);
        }
        if let Some(old) = self.keys[index].take() {
            self.by_key.remove(&old);
        }
        self.free.remove(&id);
        self.keys[index] = Some(key.clone());
        self.by_key.insert(key, id);
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<EntityId> {
        let id = self.by_key.remove(key)?;
        self.keys[id as usize] = None;
        self.free.insert(id);
        Some(id)
    }

    pub fn active_count(&self) -> usize {
        self.by_key.len()
    }

    /// Number of slots ever allocated, active or free.
    pub fn slot_count(&self) -> usize {
        self.keys.len()
    }

    pub fn active_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.is_some())
            .map(|(i, _)| i as EntityId)
    }

    pub fn memory_usage(&self) -> usize {
        let key_bytes: usize = self.by_key.keys().map(|k| k.memory_usage()).sum();
        // Keys are held twice.
        2 * key_bytes
            + self.by_key.len() * std::mem::size_of::<EntityId>()
            + self.keys.len() * std::mem::size_of::<Option<EntityKey>>()
            + self.free.len() * std::mem::size_of::<EntityId>()
    }
}

// ---------------------------------------------------------------------------
// Bucket gatherer
// ---------------------------------------------------------------------------

/// Per-bucket, per-entity summaries of records not yet finalised.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketGatherer {
    bucket_length: i64,
    buckets: BTreeMap<i64, BTreeMap<EntityId, EntityBucket>>,
}

impl BucketGatherer {
    pub fn new(bucket_length: i64) -> Self {
        Self {
            bucket_length: bucket_length.max(1),
            buckets: BTreeMap::new(),
        }
    }

    pub fn bucket_length(&self) -> i64 {
        self.bucket_length
    }

    /// Start of the bucket containing `time`.
    pub fn bucket_start(&self, time: i64) -> i64 {
        time.div_euclid(self.bucket_length) * self.bucket_length
    }

    pub fn add(&mut self, time: i64, id: EntityId, value: Option<f64>, attribute: Option<&str>) {
        let start = self.bucket_start(time);
        self.buckets
            .entry(start)
            .or_default()
            .entry(id)
            .or_default()
            .add(value, attribute);
    }

    pub fn peek(&self, bucket_start: i64) -> Option<&BTreeMap<EntityId, EntityBucket>> {
        self.buckets.get(&bucket_start)
    }

    /// Remove and return the data of one bucket, dropping anything older.
    pub fn take(&mut self, bucket_start: i64) -> BTreeMap<EntityId, EntityBucket> {
        let data = self.buckets.remove(&bucket_start).unwrap_or_default();
        self.buckets.retain(|start, _| *start > bucket_start);
        data
    }

    /// Discard data for every bucket starting in `[start, end)`.
    pub fn reset(&mut self, start: i64, end: i64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|bucket, _| *bucket < start || *bucket >= end);
        before - self.buckets.len()
    }

    pub fn remove_entity(&mut self, id: EntityId) {
        for bucket in self.buckets.values_mut() {
            bucket.remove(&id);
        }
    }

    /// Records gathered for one entity in a bucket.
    pub fn entity_count(&self, bucket_start: i64, id: EntityId) -> u64 {
        self.peek(bucket_start)
            .and_then(|b| b.get(&id))
            .map_or(0, |e| e.summary.count)
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn memory_usage(&self) -> usize {
        self.buckets
            .values()
            .map(|b| {
                std::mem::size_of::<i64>()
                    + b.values()
                        .map(|e| std::mem::size_of::<EntityId>() + e.memory_usage())
                        .sum::<usize>()
            })
            .sum()
    }
}
