//! Bucket results, score normalisation and result sinks.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::model::AnomalyRecord;
use crate::persist::PersistCompletion;
use crate::registry::budget::ModelSizeStats;

use super::EngineError;

/// Records at or above this probability are not reported.
pub const RESULT_PROBABILITY_THRESHOLD: f64 = 0.05;

/// Number of finalised buckets kept in the results queue.
pub const RESULTS_QUEUE_CAPACITY: usize = 16;

/// Largest raw score; the log of the smallest representable probability.
const MAXIMUM_RAW_SCORE: f64 = 300.0;

/// Results for one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketResults {
    pub bucket_time: i64,
    pub bucket_span: i64,
    /// True for results computed from a partially gathered bucket.
    pub interim: bool,
    pub event_count: u64,
    /// Highest normalised record score in the bucket.
    pub anomaly_score: f64,
    pub records: Vec<AnomalyRecord>,
}

impl BucketResults {
    /// Keep the records worth reporting, most anomalous first.
    pub fn new(
        bucket_time: i64,
        bucket_span: i64,
        interim: bool,
        event_count: u64,
        mut records: Vec<AnomalyRecord>,
    ) -> Self {
        records.retain(|r| r.effective_probability() < RESULT_PROBABILITY_THRESHOLD);
        records.sort_by(|a, b| a.effective_probability().total_cmp(&b.effective_probability()));
        let anomaly_score = records
            .iter()
            .map(|r| r.normalized_score)
            .fold(0.0, f64::max);
        Self {
            bucket_time,
            bucket_span,
            interim,
            event_count,
            anomaly_score,
            records,
        }
    }
}

/// Recently finalised results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsQueue {
    capacity: usize,
    entries: VecDeque<BucketResults>,
}

impl Default for ResultsQueue {
    fn default() -> Self {
        Self::new(RESULTS_QUEUE_CAPACITY)
    }
}

impl ResultsQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, results: BucketResults) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(results);
    }

    pub fn latest(&self) -> Option<&BucketResults> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Maps raw probabilities onto a 0-100 score relative to a slowly decaying
/// maximum of the raw scores seen so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalizer {
    decay_rate: f64,
    max_raw_score: f64,
    buckets: u64,
}

impl Normalizer {
    pub fn new(decay_rate: f64) -> Self {
        Self {
            decay_rate,
            max_raw_score: 0.0,
            buckets: 0,
        }
    }

    pub fn raw_score(probability: f64) -> f64 {
        if probability <= 0.0 {
            return MAXIMUM_RAW_SCORE;
        }
        (-probability.log10()).clamp(0.0, MAXIMUM_RAW_SCORE)
    }

    /// Fill in `normalized_score` on every record. With `learn` the bucket's
    /// raw scores also update the running maximum.
    pub fn normalize(&mut self, records: &mut [AnomalyRecord], learn: bool) {
        if learn {
            self.max_raw_score *= (-self.decay_rate).exp();
            for record in records.iter() {
                let raw = Self::raw_score(record.effective_probability());
                self.max_raw_score = self.max_raw_score.max(raw);
            }
            self.buckets += 1;
        }
        for record in records.iter_mut() {
            let raw = Self::raw_score(record.effective_probability());
            record.normalized_score = if self.max_raw_score > 0.0 {
                (100.0 * raw / self.max_raw_score).clamp(0.0, 100.0)
            } else {
                0.0
            };
        }
    }

    pub fn max_raw_score(&self) -> f64 {
        self.max_raw_score
    }
}

/// Everything the engine writes to its output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    Bucket(BucketResults),
    /// Acknowledges a flush control message once everything before it has
    /// been processed.
    FlushAck {
        id: String,
        records_handled: u64,
        last_finalised_time: Option<i64>,
    },
    Persisted(PersistCompletion),
    ModelSize(ModelSizeStats),
}

pub trait ResultSink: Send {
    fn emit(&mut self, event: &OutputEvent) -> Result<(), EngineError>;

    fn flush(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Writes one JSON document per line.
pub struct JsonLinesWriter<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonLinesWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> ResultSink for JsonLinesWriter<W> {
    fn emit(&mut self, event: &OutputEvent) -> Result<(), EngineError> {
        serde_json::to_writer(&mut self.out, event)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), EngineError> {
        self.out.flush()?;
        Ok(())
    }
}

/// Keeps every event in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<OutputEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OutputEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn buckets(&self) -> Vec<BucketResults> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                OutputEvent::Bucket(b) => Some(b),
                _ => None,
            })
            .collect()
    }
}

impl ResultSink for CollectingSink {
    fn emit(&mut self, event: &OutputEvent) -> Result<(), EngineError> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::feature::Feature;

    fn record(probability: f64) -> AnomalyRecord {
        AnomalyRecord {
            search_key_id: 1,
            partition: "a".into(),
            over_value: None,
            feature: Feature::IndividualCount,
            bucket_time: 0,
            actual: 1.0,
            typical: 1.0,
            probability,
            correlated_probability: None,
            correlated_with: None,
            normalized_score: 0.0,
            slot: 0,
            residual: 0.0,
        }
    }

    #[test]
    fn test_normalizer_scales_to_running_max() {
        let mut n = Normalizer::new(0.0);
        let mut records = vec![record(1e-10), record(1e-5), record(0.5)];
        n.normalize(&mut records, true);
        assert!((records[0].normalized_score - 100.0).abs() < 1e-9);
        assert!((records[1].normalized_score - 50.0).abs() < 1e-9);
        assert!(records[2].normalized_score < 5.0);

        // Interim scoring does not move the maximum.
        let mut interim = vec![record(1e-20)];
        n.normalize(&mut interim, false);
        assert_eq!(interim[0].normalized_score, 100.0);
        assert!((n.max_raw_score() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_bucket_results_keep_anomalies_only() {
        let mut records = vec![record(0.5), record(1e-4), record(1e-8)];
        Normalizer::new(0.0).normalize(&mut records, true);
        let results = BucketResults::new(0, 300, false, 3, records);
        assert_eq!(results.records.len(), 2);
        assert_eq!(results.records[0].probability, 1e-8);
        assert!((results.anomaly_score - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_results_queue_is_bounded() {
        let mut queue = ResultsQueue::new(2);
        for t in 0..3 {
            queue.push(BucketResults::new(t, 1, false, 0, Vec::new()));
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.latest().unwrap().bucket_time, 2);
    }

    #[test]
    fn test_json_lines_output() {
        let mut writer = JsonLinesWriter::new(Vec::new());
        writer
            .emit(&OutputEvent::FlushAck {
                id: "f1".into(),
                records_handled: 3,
                last_finalised_time: Some(600),
            })
            .unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(text.lines().count(), 1);
        let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["type"], "flush_ack");
        assert_eq!(value["records_handled"], 3);
    }
}
