//! Bucket orchestrator.
//!
//! Owns the registry and drives time through buckets as records arrive.
//! Every record first closes the buckets that have fully elapsed, taking
//! into account the configured latency, and is then added to its entities'
//! gathered data. Between closing one bucket and opening the next the
//! periodic checkpoint is considered, so a snapshot never contains part of
//! a bucket.
//!
//! Control messages arrive on the same channel as data and are handled in
//! arrival order, which is what makes flush acknowledgements meaningful.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::model::events::{self, ModelEvent};
use crate::model::key::EntityKey;
use crate::model::Model;
use crate::persist::snapshot::TIME_UNSET;
use crate::persist::state::parse_document;
use crate::persist::{
    CheckpointCoordinator, CheckpointOutcome, CheckpointReason, Clock, EngineSnapshot,
    PeriodicCheck, RestoreError, RestoreStatus, StateSink, StateTag, StateTraverser,
    STATE_VERSION,
};
use crate::registry::ModelRegistry;
use crate::stats::EngineStats;

use super::control::{
    is_representable_time, parse_epoch_seconds, ControlMessage, TimeRange, CONTROL_FIELD,
};
use super::results::{BucketResults, Normalizer, OutputEvent, ResultSink, ResultsQueue};
use super::EngineError;

/// One input record: field name to raw value.
pub type Record = BTreeMap<String, String>;

pub struct Orchestrator {
    config: EngineConfig,
    registry: ModelRegistry,
    coordinator: CheckpointCoordinator,
    output: Box<dyn ResultSink>,
    stats: EngineStats,
    results: ResultsQueue,
    normalizer: Normalizer,
    /// End of the last finalised bucket; records before it are out of order.
    last_finalised: Option<i64>,
    latest_record_time: Option<i64>,
    last_results_time: Option<i64>,
    first_record_time: Option<i64>,
    /// Fast-forward over the gap before the first record after a restore.
    skip_sampling: bool,
    rejection_warned: Option<i64>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        sink: Arc<dyn StateSink>,
        clock: Arc<dyn Clock>,
        output: Box<dyn ResultSink>,
    ) -> Self {
        let coordinator = CheckpointCoordinator::new(
            sink,
            clock,
            config.persistence.periodic_interval_secs,
            config.persistence.interval_increment_secs,
        );
        Self {
            registry: ModelRegistry::new(&config),
            normalizer: Normalizer::new(config.model.decay_rate),
            coordinator,
            output,
            stats: EngineStats::default(),
            results: ResultsQueue::default(),
            last_finalised: None,
            latest_record_time: None,
            last_results_time: None,
            first_record_time: None,
            skip_sampling: false,
            rejection_warned: None,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ModelRegistry {
        &mut self.registry
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn results(&self) -> &ResultsQueue {
        &self.results
    }

    pub fn last_finalised(&self) -> Option<i64> {
        self.last_finalised
    }

    pub fn latest_record_time(&self) -> Option<i64> {
        self.latest_record_time
    }

    pub fn periodic_interval(&self) -> Option<i64> {
        self.coordinator.periodic_interval()
    }

    pub fn is_persisting(&self) -> bool {
        self.coordinator.is_busy()
    }

    fn bucket_length(&self) -> i64 {
        self.config.bucket.length_secs
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    /// Process one input record.
    ///
    /// Malformed and out-of-order records are counted and dropped; only a
    /// failure to write output is an error. A dry run checks and counts
    /// records without touching any model.
    pub fn handle(&mut self, is_dry_run: bool, record: &Record) -> Result<(), EngineError> {
        if let Some(control) = record.get(CONTROL_FIELD).filter(|c| !c.is_empty()) {
            return self.handle_control(control);
        }

        let time_field = &self.config.bucket.time_field;
        let Some(raw_time) = record.get(time_field) else {
            self.stats.records_no_time_field += 1;
            error!(field = %time_field, "record has no time field; dropped");
            return Ok(());
        };
        let Some(time) = parse_time(raw_time, self.config.bucket.time_format.as_deref()) else {
            self.stats.time_conversion_errors += 1;
            error!(value = %raw_time, "cannot parse record time; dropped");
            return Ok(());
        };
        if let Some(last) = self.last_finalised {
            if time < last {
                self.stats.out_of_order_records += 1;
                error!(time, last_finalised = last, "record is out of order; dropped");
                return Ok(());
            }
        }

        if is_dry_run {
            self.stats.records_handled += 1;
            return Ok(());
        }

        if self.first_record_time.is_none() {
            if self.skip_sampling {
                self.skip_sampling_to(time);
            }
            self.skip_sampling = false;
            self.first_record_time = Some(time);
            self.coordinator.mark_first_data();
        }

        self.output_bucket_results_until(time)?;
        self.add_to_models(time, record);

        self.stats.records_handled += 1;
        self.latest_record_time = Some(self.latest_record_time.map_or(time, |t| t.max(time)));
        Ok(())
    }

    fn add_to_models(&mut self, time: i64, record: &Record) {
        let mut keys = vec![EntityKey::simple_count()];
        let mut data: Vec<(Option<f64>, Option<String>)> = vec![(None, None)];

        for (i, detector) in self.config.detectors.iter().enumerate() {
            let value = match &detector.field_name {
                Some(field) if detector.function.is_metric() => {
                    match record
                        .get(field)
                        .and_then(|v| v.trim().parse::<f64>().ok())
                        .filter(|v| v.is_finite())
                    {
                        Some(v) => Some(v),
                        None => {
                            self.stats.missing_field_values += 1;
                            continue;
                        }
                    }
                }
                _ => None,
            };
            let attribute = match &detector.over_field {
                Some(field) => match record.get(field) {
                    Some(v) => Some(v.clone()),
                    None => {
                        self.stats.missing_field_values += 1;
                        continue;
                    }
                },
                None => None,
            };
            let partition = detector
                .partition_field
                .as_ref()
                .and_then(|f| record.get(f))
                .cloned()
                .unwrap_or_default();
            keys.push(EntityKey::new((i + 1) as u32, partition));
            data.push((value, attribute));
        }

        let resolutions = self.registry.resolve_all(&keys, time);
        for (resolution, (value, attribute)) in resolutions.into_iter().zip(data) {
            if let Some(id) = resolution.id() {
                self.registry.add_record(id, time, value, attribute.as_deref());
            }
        }
        let events = self.registry.take_events();
        self.publish(&events, time);
    }

    fn publish(&mut self, events: &[ModelEvent], time: i64) {
        let rejected = events
            .iter()
            .filter(|e| matches!(e, ModelEvent::CreationRejected { .. }))
            .count();
        if rejected > 0 {
            let bucket = floor_to(time, self.bucket_length());
            if self.rejection_warned != Some(bucket) {
                warn!(
                    bucket,
                    rejected,
                    usage = self.registry.budget().usage(),
                    "memory limit reached; new models are not being created"
                );
                self.rejection_warned = Some(bucket);
            }
        }
        events::dispatch(events, &mut self.stats);
    }

    // -----------------------------------------------------------------------
    // Buckets
    // -----------------------------------------------------------------------

    /// Finalise every bucket that ends at or before `time` minus the
    /// latency, checking for a periodic checkpoint after each one.
    ///
    /// A gap longer than `max_gap_buckets` closes only the buckets that may
    /// hold gathered data and skips the models over the rest.
    fn output_bucket_results_until(&mut self, time: i64) -> Result<(), EngineError> {
        let length = self.bucket_length();
        let latency = self.config.latency_secs();
        let mut last = *self
            .last_finalised
            .get_or_insert(floor_to(time, length) - latency);

        let due = (time - latency - last).div_euclid(length);
        let max_gap = self.config.bucket.max_gap_buckets;
        if max_gap > 0 && due > i64::try_from(max_gap).unwrap_or(i64::MAX) {
            let open = (self.config.bucket.latency_buckets as i64 + 1).min(due);
            warn!(
                from = last,
                to = time,
                buckets = due,
                max_gap,
                "time jumped further than max_gap_buckets; skipping empty buckets"
            );
            for _ in 0..open {
                self.output_results(last)?;
                last += length;
                self.last_finalised = Some(last);
            }
            self.skip_buckets(floor_to(time, length) - latency);
            self.stats.gaps_skipped += 1;
            return self.check_periodic_checkpoint();
        }

        while last
            .checked_add(length + latency)
            .is_some_and(|end| end <= time)
        {
            self.output_results(last)?;
            last += length;
            self.last_finalised = Some(last);
            self.check_periodic_checkpoint()?;
        }
        Ok(())
    }

    fn output_results(&mut self, bucket_start: i64) -> Result<(), EngineError> {
        let mut sample = self.registry.sample_bucket(bucket_start);
        self.publish(&sample.events, bucket_start);
        self.normalizer.normalize(&mut sample.records, true);
        let results = BucketResults::new(
            bucket_start,
            self.bucket_length(),
            false,
            sample.event_count,
            sample.records,
        );
        self.stats.buckets_finalised += 1;
        self.stats.anomaly_records += results.records.len() as u64;
        debug!(
            bucket = bucket_start,
            events = results.event_count,
            anomalies = results.records.len(),
            "finalised bucket"
        );
        self.output.emit(&OutputEvent::Bucket(results.clone()))?;
        self.results.push(results);
        self.last_results_time = Some(bucket_start);
        self.emit_completions()
    }

    /// Move the models over the downtime between the restored state and the
    /// first record without sampling the empty buckets in between.
    fn skip_sampling_to(&mut self, time: i64) {
        let Some(last) = self.last_finalised else {
            return;
        };
        let target = floor_to(time, self.bucket_length()) - self.config.latency_secs();
        if target <= last {
            return;
        }
        info!(from = last, to = target, "skipping sampling over downtime");
        self.results.clear();
        self.skip_buckets(target);
    }

    /// Make `target` the end of the last finalised bucket, discarding the
    /// data of the skipped buckets and shifting the models over them.
    fn skip_buckets(&mut self, target: i64) {
        let Some(last) = self.last_finalised.filter(|last| *last < target) else {
            return;
        };
        self.registry.reset_buckets(last, target);
        self.registry.skip_time(target - last);
        self.last_finalised = Some(target);
    }

    // -----------------------------------------------------------------------
    // Control messages
    // -----------------------------------------------------------------------

    fn handle_control(&mut self, message: &str) -> Result<(), EngineError> {
        self.stats.control_messages += 1;
        let parsed = match ControlMessage::parse(message) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.stats.unknown_control_messages += 1;
                warn!(error = %e, "ignoring control message");
                return Ok(());
            }
        };
        match parsed {
            ControlMessage::NoOp | ControlMessage::Ignore => Ok(()),
            ControlMessage::Flush { id } => self.acknowledge_flush(&id),
            ControlMessage::Interim { range } => self.interim_results(range),
            ControlMessage::ResetBuckets { range } => {
                self.reset_buckets(range);
                Ok(())
            }
            ControlMessage::AdvanceTime { time } => self.advance_time(time),
            ControlMessage::UpdateConfig { json } => {
                self.update_config(&json);
                Ok(())
            }
        }
    }

    /// Everything received before the flush has been processed by the time
    /// this runs; say so downstream.
    pub fn acknowledge_flush(&mut self, id: &str) -> Result<(), EngineError> {
        self.emit_completions()?;
        self.output.emit(&OutputEvent::FlushAck {
            id: id.to_string(),
            records_handled: self.stats.records_handled,
            last_finalised_time: self.last_finalised,
        })?;
        self.output.flush()?;
        debug!(id, records = self.stats.records_handled, "flush acknowledged");
        Ok(())
    }

    /// Score buckets that are still open without updating any model.
    /// Without a range, every bucket inside the latency window is scored.
    pub fn interim_results(&mut self, range: Option<TimeRange>) -> Result<(), EngineError> {
        let Some(last) = self.last_finalised else {
            warn!("interim results requested before any data; ignored");
            return Ok(());
        };
        let length = self.bucket_length();
        let (start, end) = match range {
            None => (
                last,
                last + (self.config.bucket.latency_buckets as i64 + 1) * length,
            ),
            Some(r) => {
                let start = floor_to(r.start, length);
                let end = r.end.map_or(start + length, |e| ceil_to(e, length));
                (start.max(last), end)
            }
        };

        let mut bucket = start;
        while bucket < end {
            let mut records = self.registry.score_bucket(bucket);
            self.normalizer.normalize(&mut records, false);
            let results = BucketResults::new(
                bucket,
                length,
                true,
                self.registry.event_count(bucket),
                records,
            );
            self.stats.interim_results += 1;
            self.output.emit(&OutputEvent::Bucket(results))?;
            bucket += length;
        }
        Ok(())
    }

    /// Discard gathered data for every bucket overlapping the range.
    pub fn reset_buckets(&mut self, range: TimeRange) {
        let length = self.bucket_length();
        let start = floor_to(range.start, length);
        let end = range
            .end
            .map_or(start + length, |e| ceil_to(e, length))
            .max(start + length);
        let cleared = self.registry.reset_buckets(start, end);
        info!(start, end, cleared, "reset buckets");
    }

    /// Close buckets up to `time` as though a record had arrived, then age
    /// every model to `time`.
    pub fn advance_time(&mut self, time: i64) -> Result<(), EngineError> {
        if self.last_finalised.is_none() {
            warn!(time, "advancing time before any data has been seen");
        }
        self.output_bucket_results_until(time)?;
        self.registry.time_now(time);
        debug!(time, "advanced time");
        Ok(())
    }

    /// Apply a runtime configuration update. Invalid updates change nothing.
    pub fn update_config(&mut self, json: &str) {
        match self.config.apply_update(json) {
            Ok(()) => {
                self.registry.apply_config(&self.config);
                info!(update = %json, "applied configuration update");
            }
            Err(e) => warn!(error = %e, "configuration update rejected"),
        }
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    fn check_periodic_checkpoint(&mut self) -> Result<(), EngineError> {
        match self.coordinator.check_periodic() {
            PeriodicCheck::NotDue => Ok(()),
            PeriodicCheck::Deferred { .. } => {
                self.stats.checkpoints_deferred += 1;
                Ok(())
            }
            PeriodicCheck::Due => self.checkpoint(CheckpointReason::Periodic).map(|_| ()),
        }
    }

    /// Prune, take a snapshot and hand it to the coordinator.
    pub fn checkpoint(&mut self, reason: CheckpointReason) -> Result<CheckpointOutcome, EngineError> {
        let snapshot = self.snapshot(reason);
        self.output
            .emit(&OutputEvent::ModelSize(snapshot.model_size.clone()))?;
        let outcome = self.coordinator.checkpoint(snapshot);
        match &outcome {
            CheckpointOutcome::Started | CheckpointOutcome::Completed(_) => {
                self.stats.checkpoints_started += 1
            }
            CheckpointOutcome::Deferred { .. } => self.stats.checkpoints_deferred += 1,
            CheckpointOutcome::Failed(_) => self.stats.checkpoints_failed += 1,
            CheckpointOutcome::NotDue => {}
        }
        self.emit_completions()?;
        Ok(outcome)
    }

    fn snapshot(&mut self, reason: CheckpointReason) -> EngineSnapshot {
        self.registry.prune();
        let events = self.registry.take_events();
        self.publish(&events, self.last_finalised.unwrap_or(0));
        let (models, correlations, gatherer) = self.registry.snapshot_parts();
        EngineSnapshot {
            reason,
            created_at: self.coordinator.now(),
            last_finalised: self.last_finalised,
            latest_record_time: self.latest_record_time,
            last_results_time: self.last_results_time,
            models,
            correlations,
            gatherer,
            results: self.results.clone(),
            normalizer: self.normalizer.clone(),
            model_size: self.registry.model_size_stats(),
        }
    }

    fn emit_completions(&mut self) -> Result<(), EngineError> {
        for completion in self.coordinator.drain_completions() {
            self.output.emit(&OutputEvent::Persisted(completion))?;
        }
        Ok(())
    }

    /// Wait for any background checkpoint and report its completion.
    pub fn wait_for_persistence(&mut self) -> Result<bool, EngineError> {
        let ok = self.coordinator.wait_for_idle();
        self.emit_completions()?;
        Ok(ok)
    }

    /// End of input: write the final checkpoint and flush output. A failed
    /// final checkpoint fails the job.
    pub fn finalise(&mut self) -> Result<(), EngineError> {
        let outcome = self.checkpoint(CheckpointReason::Final)?;
        self.output.flush()?;
        self.stats.log_summary();
        match outcome {
            CheckpointOutcome::Failed(reason) => Err(EngineError::FinalCheckpoint(reason)),
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Restore
    // -----------------------------------------------------------------------

    /// Restore from the newest snapshot in the sink.
    pub fn restore_state(&mut self) -> Result<RestoreStatus, EngineError> {
        let latest = self
            .coordinator
            .sink()
            .latest()
            .map_err(RestoreError::Source)?;
        let Some(stored) = latest else {
            info!("no stored state; starting with empty models");
            return Ok(RestoreStatus::NoStateRecovered);
        };
        info!(snapshot = %stored.id, description = %stored.description, "restoring state");
        self.restore_document(&stored.document)
    }

    /// Restore from a serialized state document. On error nothing is changed.
    pub fn restore_document(&mut self, document: &str) -> Result<RestoreStatus, EngineError> {
        let nodes = parse_document(document)?;
        if nodes.is_empty() {
            info!("stored state is empty");
            return Ok(RestoreStatus::NoStateRecovered);
        }
        let mut traverser = StateTraverser::new(&nodes);
        let time = traverser
            .expect(StateTag::Time)?
            .parse::<i64>()?;
        if time != TIME_UNSET && !is_representable_time(time) {
            return Err(RestoreError::InvalidValue {
                tag: StateTag::Time.to_string(),
                value: time.to_string(),
            }
            .into());
        }
        let version = traverser.expect(StateTag::Version)?.value()?;
        if version != STATE_VERSION {
            warn!(
                found = version,
                expected = STATE_VERSION,
                "stored state has an incompatible version; ignored"
            );
            return Ok(RestoreStatus::IncorrectVersion);
        }

        let mut registry = ModelRegistry::new(&self.config);
        registry.set_memory_limit(self.registry.budget().limit());
        let mut results = ResultsQueue::default();
        let mut normalizer = self.normalizer.clone();
        let mut latest_record_time = None;
        let mut last_results_time = None;
        let mut entities = 0;
        let mut limit_reached = false;

        for node in traverser {
            match node.tag() {
                Some(StateTag::Entity) => {
                    if limit_reached {
                        continue;
                    }
                    let model = Model::restore(node.level()?)?;
                    if registry.restore_model(model) {
                        entities += 1;
                    } else {
                        warn!(entities, "memory limit reached while restoring models");
                        limit_reached = true;
                    }
                }
                Some(StateTag::Correlations) => registry.restore_correlations(node.level()?)?,
                Some(StateTag::PendingBuckets) => registry.restore_gatherer(node.json()?),
                Some(StateTag::ResultsQueue) => results = node.json()?,
                Some(StateTag::Normalizer) => normalizer = node.json()?,
                Some(StateTag::LatestRecordTime) => latest_record_time = Some(node.parse()?),
                Some(StateTag::LastResultsTime) => last_results_time = Some(node.parse()?),
                _ => debug!(tag = ?node.tag(), "skipping unexpected state node"),
            }
        }
        registry.finish_restore();

        let last_finalised = (time != TIME_UNSET).then(|| ceil_to(time, self.bucket_length()));
        if let Some(end) = last_finalised {
            registry.align_to(end);
        }

        self.registry = registry;
        self.results = results;
        self.normalizer = normalizer;
        self.last_finalised = last_finalised;
        self.latest_record_time = latest_record_time;
        self.last_results_time = last_results_time;
        self.skip_sampling = self.config.bucket.ignore_downtime;

        info!(
            entities,
            last_finalised = ?last_finalised,
            limit_reached,
            "restored state"
        );
        Ok(if limit_reached {
            RestoreStatus::MemoryLimitReached { entities }
        } else {
            RestoreStatus::Restored { entities }
        })
    }
}

/// Parse a record time: epoch seconds by default, or per a chrono format.
/// Times outside the calendar range are rejected.
pub fn parse_time(value: &str, format: Option<&str>) -> Option<i64> {
    let value = value.trim();
    match format {
        None => parse_epoch_seconds(value),
        Some(format) => DateTime::parse_from_str(value, format)
            .map(|dt| dt.timestamp())
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(value, format)
                    .ok()
                    .map(|dt| dt.and_utc().timestamp())
            }),
    }
}

fn floor_to(time: i64, length: i64) -> i64 {
    time.div_euclid(length) * length
}

fn ceil_to(time: i64, length: i64) -> i64 {
    let floor = floor_to(time, length);
    if floor == time {
        floor
    } else {
        floor + length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DetectorConfig, DetectorFunction};
    use crate::engine::results::CollectingSink;
    use crate::persist::{ManualClock, MemoryStateStore, StateInserter};

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.bucket.length_secs = 100;
        config.persistence.periodic_interval_secs = 0;
        config.detectors = vec![DetectorConfig {
            function: DetectorFunction::Count,
            field_name: None,
            over_field: None,
            partition_field: Some("host".into()),
        }];
        config
    }

    fn engine(config: EngineConfig) -> (Orchestrator, CollectingSink) {
        let sink = CollectingSink::new();
        let engine = Orchestrator::new(
            config,
            Arc::new(MemoryStateStore::new()),
            Arc::new(ManualClock::new(0)),
            Box::new(sink.clone()),
        );
        (engine, sink)
    }

    fn record(fields: &[(&str, &str)]) -> Record {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("1700000000", None), Some(1_700_000_000));
        assert_eq!(parse_time(" 12.9 ", None), Some(12));
        assert_eq!(parse_time("soon", None), None);
        assert_eq!(
            parse_time("2023-11-14 22:13:20", Some("%Y-%m-%d %H:%M:%S")),
            Some(1_700_000_000)
        );
        assert_eq!(
            parse_time("2023-11-14T23:13:20+01:00", Some("%Y-%m-%dT%H:%M:%S%:z")),
            Some(1_700_000_000)
        );
    }

    #[test]
    fn test_bucket_rounding() {
        assert_eq!(floor_to(250, 100), 200);
        assert_eq!(floor_to(-1, 100), -100);
        assert_eq!(ceil_to(250, 100), 300);
        assert_eq!(ceil_to(300, 100), 300);
    }

    #[test]
    fn test_malformed_records_are_counted() {
        let (mut engine, sink) = engine(config());
        engine.handle(false, &record(&[("host", "a")])).unwrap();
        engine.handle(false, &record(&[("_time", "x"), ("host", "a")])).unwrap();
        engine.handle(false, &record(&[("_time", "500"), ("host", "a")])).unwrap();
        engine.handle(false, &record(&[("_time", "350"), ("host", "a")])).unwrap();

        let stats = engine.stats();
        assert_eq!(stats.records_no_time_field, 1);
        assert_eq!(stats.time_conversion_errors, 1);
        assert_eq!(stats.out_of_order_records, 1);
        assert_eq!(stats.records_handled, 1);
        assert!(sink.buckets().is_empty());
    }

    #[test]
    fn test_times_outside_calendar_are_dropped() {
        let (mut engine, sink) = engine(config());
        engine.handle(false, &record(&[("_time", "-1e30"), ("host", "a")])).unwrap();
        assert_eq!(engine.last_finalised(), None);

        engine.handle(false, &record(&[("_time", "100"), ("host", "a")])).unwrap();
        for time in ["1e30", "9223372036854775807", "-9223372036854775808", "NaN"] {
            engine.handle(false, &record(&[("_time", time), ("host", "a")])).unwrap();
        }
        engine.handle(false, &record(&[(".", "t1e30")])).unwrap();
        engine.handle(false, &record(&[(".", "t9223372036854775807")])).unwrap();

        let stats = engine.stats();
        assert_eq!(stats.time_conversion_errors, 5);
        assert_eq!(stats.unknown_control_messages, 2);
        assert_eq!(stats.records_handled, 1);
        assert_eq!(engine.last_finalised(), Some(100));
        assert!(sink.buckets().is_empty());
    }

    #[test]
    fn test_restore_rejects_time_outside_calendar() {
        let (mut engine, _sink) = engine(config());
        let mut inserter = StateInserter::new();
        inserter.insert_value(StateTag::Time, i64::MAX - 1);
        inserter.insert_value(StateTag::Version, STATE_VERSION);
        let document = inserter.to_json().unwrap();
        assert!(matches!(
            engine.restore_document(&document),
            Err(EngineError::Restore(RestoreError::InvalidValue { .. }))
        ));
        assert_eq!(engine.last_finalised(), None);
    }

    #[test]
    fn test_long_gap_closes_only_buckets_with_data() {
        let mut cfg = config();
        cfg.bucket.max_gap_buckets = 10;
        let (mut engine, sink) = engine(cfg);
        engine.handle(false, &record(&[("_time", "100"), ("host", "a")])).unwrap();
        engine.handle(false, &record(&[("_time", "550"), ("host", "a")])).unwrap();
        assert_eq!(sink.buckets().len(), 4);
        assert_eq!(engine.stats().gaps_skipped, 0);

        engine.handle(false, &record(&[("_time", "100050"), ("host", "a")])).unwrap();
        let buckets = sink.buckets();
        let times: Vec<i64> = buckets.iter().map(|b| b.bucket_time).collect();
        assert_eq!(times, vec![100, 200, 300, 400, 500]);
        assert_eq!(buckets[4].event_count, 1);
        assert_eq!(engine.last_finalised(), Some(100_000));
        assert_eq!(engine.stats().gaps_skipped, 1);

        engine.handle(false, &record(&[(".", "t100100")])).unwrap();
        let buckets = sink.buckets();
        assert_eq!(buckets.len(), 6);
        assert_eq!(buckets[5].bucket_time, 100_000);
        assert_eq!(buckets[5].event_count, 1);

        // The last second of the calendar.
        engine.handle(false, &record(&[(".", "t253402300799")])).unwrap();
        assert_eq!(engine.stats().gaps_skipped, 2);
        assert_eq!(engine.last_finalised(), Some(253_402_300_700));
        assert_eq!(sink.buckets().len(), 7);
    }

    #[test]
    fn test_idle_entity_slot_goes_to_new_entity() {
        let mut cfg = config();
        cfg.model.prune_window_buckets = 1;
        cfg.model.eviction_window_buckets = 1;
        let (mut engine, _sink) = engine(cfg);
        let quiet = EntityKey::new(1, "quiet");
        engine.handle(false, &record(&[("_time", "100"), ("host", "quiet")])).unwrap();
        for time in ["150", "200", "300", "400"] {
            engine.handle(false, &record(&[("_time", time), ("host", "busy")])).unwrap();
        }
        let slot = engine.registry().lookup(&quiet).unwrap();

        engine.handle(false, &record(&[("_time", "500"), ("host", "new")])).unwrap();
        assert_eq!(engine.registry().lookup(&quiet), None);
        assert_eq!(engine.registry().lookup(&EntityKey::new(1, "new")), Some(slot));
        assert_eq!(engine.stats().entities_removed, 1);
        assert_eq!(engine.stats().entities_recycled, 1);
        // Simple count, busy and new.
        assert_eq!(engine.registry().active_entities(), 3);
    }

    #[test]
    fn test_latency_delays_bucket_closure() {
        let mut cfg = config();
        cfg.bucket.latency_buckets = 1;
        let (mut engine, sink) = engine(cfg);
        engine.handle(false, &record(&[("_time", "200"), ("host", "a")])).unwrap();
        assert_eq!(engine.last_finalised(), Some(100));

        // Late but inside the latency window.
        engine.handle(false, &record(&[("_time", "150"), ("host", "a")])).unwrap();
        engine.handle(false, &record(&[("_time", "299"), ("host", "a")])).unwrap();
        assert!(sink.buckets().is_empty());

        engine.handle(false, &record(&[("_time", "300"), ("host", "a")])).unwrap();
        let buckets = sink.buckets();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].bucket_time, 100);
        assert_eq!(buckets[0].event_count, 1);
        assert_eq!(engine.stats().out_of_order_records, 0);
    }

    #[test]
    fn test_dry_run_touches_no_model() {
        let (mut engine, sink) = engine(config());
        engine.handle(true, &record(&[("_time", "100"), ("host", "a")])).unwrap();
        assert_eq!(engine.stats().records_handled, 1);
        assert_eq!(engine.registry().active_entities(), 0);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_unknown_control_message_is_ignored() {
        let (mut engine, sink) = engine(config());
        engine.handle(false, &record(&[(".", "z")])).unwrap();
        engine.handle(false, &record(&[(".", " ")])).unwrap();
        engine.handle(false, &record(&[(".", "..")])).unwrap();
        assert_eq!(engine.stats().control_messages, 3);
        assert_eq!(engine.stats().unknown_control_messages, 1);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_interim_results_do_not_learn() {
        let (mut engine, sink) = engine(config());
        engine.handle(false, &record(&[(".", "i")])).unwrap();
        assert!(sink.events().is_empty());

        engine.handle(false, &record(&[("_time", "100"), ("host", "a")])).unwrap();
        engine.handle(false, &record(&[("_time", "120"), ("host", "a")])).unwrap();
        let before = engine.registry().checksum();
        engine.handle(false, &record(&[(".", "i")])).unwrap();

        let buckets = sink.buckets();
        assert_eq!(buckets.len(), 1);
        assert!(buckets[0].interim);
        assert_eq!(buckets[0].bucket_time, 100);
        assert_eq!(buckets[0].event_count, 2);
        assert_eq!(engine.registry().checksum(), before);
        assert_eq!(engine.stats().interim_results, 1);
    }

    #[test]
    fn test_reset_buckets_discards_gathered_data() {
        let (mut engine, sink) = engine(config());
        engine.handle(false, &record(&[("_time", "100"), ("host", "a")])).unwrap();
        engine.handle(false, &record(&[("_time", "150"), ("host", "a")])).unwrap();
        engine.handle(false, &record(&[(".", "r150 160")])).unwrap();
        engine.handle(false, &record(&[(".", "t200")])).unwrap();

        let buckets = sink.buckets();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].event_count, 0);
    }

    #[test]
    fn test_advance_time_closes_buckets() {
        let (mut engine, sink) = engine(config());
        engine.handle(false, &record(&[("_time", "100"), ("host", "a")])).unwrap();
        engine.handle(false, &record(&[(".", "t450")])).unwrap();
        let times: Vec<i64> = sink.buckets().iter().map(|b| b.bucket_time).collect();
        assert_eq!(times, vec![100, 200, 300]);
        assert_eq!(engine.last_finalised(), Some(400));
    }

    #[test]
    fn test_config_update_is_all_or_nothing() {
        let (mut engine, _sink) = engine(config());
        engine.handle(false, &record(&[(".", "u{\"prune_window_buckets\": 5}")])).unwrap();
        assert_eq!(engine.config().model.prune_window_buckets, 5);

        engine
            .handle(
                false,
                &record(&[(".", "u{\"prune_window_buckets\": 9, \"colour\": \"red\"}")]),
            )
            .unwrap();
        assert_eq!(engine.config().model.prune_window_buckets, 5);
    }

    #[test]
    fn test_missing_metric_value_skips_detector_only() {
        let mut cfg = config();
        cfg.detectors.push(DetectorConfig {
            function: DetectorFunction::Mean,
            field_name: Some("latency".into()),
            over_field: None,
            partition_field: None,
        });
        let (mut engine, _sink) = engine(cfg);
        engine.handle(false, &record(&[("_time", "100"), ("host", "a")])).unwrap();
        engine
            .handle(false, &record(&[("_time", "110"), ("host", "a"), ("latency", "3.5")]))
            .unwrap();
        assert_eq!(engine.stats().missing_field_values, 1);
        assert_eq!(engine.stats().records_handled, 2);
        // Simple count, host=a and the mean detector.
        assert_eq!(engine.registry().active_entities(), 3);
    }
}
