//! Per-entity models.
//!
//! A [`Model`] owns everything learnt about one entity: first and last seen
//! times, and per feature a prior, a trend and two decay rate controllers.
//! Counting models only track event counts; individual models hold one set of
//! feature models; population models hold one set per over-field value.

pub mod decay;
pub mod events;
pub mod feature;
pub mod key;

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::EngineConfig;
use crate::maths::{
    ConstantPrior, ConstantTrend, GaussianPrior, Prior, PriorState, SeasonalTrend, Trend,
    TrendState,
};
use crate::persist::{PersistError, RestoreError, StateInserter, StateTag, StateTraverser};

use self::decay::DecayRateController;
use self::events::ModelEvent;
use self::feature::{EntityBucket, Feature};
use self::key::{EntityId, EntityKey};

/// New entities decay faster for this long after they are first seen.
pub const DERATE_WINDOW_SECS: i64 = 3 * 7 * 86_400;

/// Model parameters shared by every entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub bucket_length: i64,
    pub decay_rate: f64,
    pub learn_rate: f64,
    pub control_decay_rate: bool,
    pub initial_decay_rate_multiplier: f64,
    pub seasonal_period: i64,
}

impl ModelParams {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            bucket_length: config.bucket.length_secs,
            decay_rate: config.model.decay_rate,
            learn_rate: config.model.learn_rate,
            control_decay_rate: config.model.control_decay_rate,
            initial_decay_rate_multiplier: config.model.initial_decay_rate_multiplier,
            seasonal_period: config.model.seasonal_period_secs,
        }
    }

    pub fn new_prior(&self) -> Box<dyn Prior> {
        Box::new(GaussianPrior::new(self.decay_rate))
    }

    pub fn new_trend(&self) -> Box<dyn Trend> {
        Box::new(SeasonalTrend::new(
            self.bucket_length,
            self.seasonal_period,
            self.decay_rate,
        ))
    }
}

impl Default for ModelParams {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Which kind of model an entity gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Counting,
    Individual,
    Population,
}

impl ModelKind {
    fn as_str(self) -> &'static str {
        match self {
            ModelKind::Counting => "counting",
            ModelKind::Individual => "individual",
            ModelKind::Population => "population",
        }
    }
}

/// A scored observation of one feature in one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub search_key_id: u32,
    pub partition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub over_value: Option<String>,
    pub feature: Feature,
    pub bucket_time: i64,
    pub actual: f64,
    pub typical: f64,
    pub probability: f64,
    /// Probability after accounting for the most correlated partner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlated_probability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlated_with: Option<String>,
    #[serde(default)]
    pub normalized_score: f64,
    #[serde(skip)]
    pub slot: EntityId,
    #[serde(skip)]
    pub residual: f64,
}

impl AnomalyRecord {
    pub fn effective_probability(&self) -> f64 {
        self.correlated_probability.unwrap_or(self.probability)
    }
}

/// What sampling one bucket produced.
#[derive(Debug, Default)]
pub struct SampleOutput {
    pub records: Vec<AnomalyRecord>,
    pub events: Vec<ModelEvent>,
    /// Individual features whose trend reinitialised this bucket.
    pub reinitialised: Vec<(Feature, EntityId)>,
}

// ---------------------------------------------------------------------------
// Feature models
// ---------------------------------------------------------------------------

struct Scored {
    probability: f64,
    typical: f64,
    residual: f64,
}

/// Prior, trend and decay controllers of one feature.
#[derive(Debug, Clone)]
pub struct FeatureModel {
    pub prior: Box<dyn Prior>,
    pub trend: Box<dyn Trend>,
    pub prior_controller: DecayRateController,
    pub trend_controller: DecayRateController,
    pub sample_count: u64,
}

impl FeatureModel {
    pub fn new(params: &ModelParams) -> Self {
        Self {
            prior: params.new_prior(),
            trend: params.new_trend(),
            prior_controller: DecayRateController::default(),
            trend_controller: DecayRateController::default(),
            sample_count: 0,
        }
    }

    /// Tiny stand-in used once the entity has been pruned.
    pub fn placeholder() -> Self {
        Self {
            prior: Box::new(ConstantPrior),
            trend: Box::new(ConstantTrend),
            prior_controller: DecayRateController::default(),
            trend_controller: DecayRateController::default(),
            sample_count: 0,
        }
    }

    fn score(&self, time: i64, value: f64) -> Scored {
        let residual = self.trend.detrend(time, value);
        let mean = self.prior.marginal_likelihood_mean();
        let scale = self.trend.scale(time);
        let adjusted = mean + (residual - mean) / scale.sqrt();
        Scored {
            probability: self.prior.probability_of_less_likely(adjusted),
            typical: value - residual + mean,
            residual,
        }
    }

    /// Learn from `value`. Returns true when the trend reinitialised.
    fn learn(&mut self, time: i64, value: f64, interval: f64, params: &ModelParams) -> bool {
        self.trend.propagate_forwards_to(time);
        let reinitialised = self.trend.add_point(time, value, params.learn_rate);
        if reinitialised {
            self.prior = params.new_prior();
            self.trend.set_decay_rate(params.decay_rate);
            self.prior_controller.reset();
            self.trend_controller.reset();
            self.sample_count = 0;
        }

        let sample = self.trend.detrend(time, value);
        self.prior.add_samples(&[sample], &[params.learn_rate]);
        self.prior.propagate_forwards_by_time(interval);

        if params.control_decay_rate {
            let prediction = self.prior.marginal_likelihood_mean();
            let factor =
                self.prior_controller
                    .multiplier(prediction, sample - prediction, params.learn_rate);
            let rate = self.prior.decay_rate() * factor;
            self.prior.set_decay_rate(rate);

            let prediction = self.trend.predict(time);
            let factor =
                self.trend_controller
                    .multiplier(prediction, value - prediction, params.learn_rate);
            let rate = self.trend.decay_rate() * factor;
            self.trend.set_decay_rate(rate);
        }

        self.sample_count += 1;
        reinitialised
    }

    fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.prior.memory_usage() + self.trend.memory_usage()
    }

    fn persist(&self, inserter: &mut StateInserter) -> Result<(), PersistError> {
        inserter.insert_json(StateTag::Prior, &self.prior.state())?;
        inserter.insert_json(StateTag::Trend, &self.trend.state())?;
        inserter.insert_json(StateTag::PriorController, &self.prior_controller)?;
        inserter.insert_json(StateTag::TrendController, &self.trend_controller)?;
        inserter.insert_value(StateTag::SampleCount, self.sample_count);
        Ok(())
    }
}

/// One persisted feature model level.
struct RestoredFeature {
    feature: Feature,
    attribute: Option<u32>,
    model: Option<FeatureModel>,
}

fn restore_feature(level: StateTraverser<'_>) -> Result<RestoredFeature, RestoreError> {
    let mut feature = None;
    let mut attribute = None;
    let mut prior = None;
    let mut trend = None;
    let mut prior_controller = DecayRateController::default();
    let mut trend_controller = DecayRateController::default();
    let mut sample_count = 0;

    for node in level {
        match node.tag() {
            Some(StateTag::FeatureName) => feature = Some(node.parse::<Feature>()?),
            Some(StateTag::AttributeId) => attribute = Some(node.parse::<u32>()?),
            Some(StateTag::Prior) => prior = Some(node.json::<PriorState>()?.into_prior()),
            Some(StateTag::Trend) => trend = Some(node.json::<TrendState>()?.into_trend()),
            Some(StateTag::PriorController) => prior_controller = node.json()?,
            Some(StateTag::TrendController) => trend_controller = node.json()?,
            Some(StateTag::SampleCount) => sample_count = node.parse()?,
            _ => {}
        }
    }

    let feature = feature.ok_or(RestoreError::MissingField("feature"))?;
    let model = match (prior, trend) {
        (Some(prior), Some(trend)) => Some(FeatureModel {
            prior,
            trend,
            prior_controller,
            trend_controller,
            sample_count,
        }),
        (None, None) => None,
        _ => return Err(RestoreError::MissingField("prior or trend")),
    };
    Ok(RestoredFeature {
        feature,
        attribute,
        model,
    })
}

// ---------------------------------------------------------------------------
// Entity models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ModelState {
    Counting {
        bucket_count: u64,
        total_count: u64,
    },
    Individual {
        features: BTreeMap<Feature, FeatureModel>,
    },
    Population {
        /// Over-field value to attribute id.
        attributes: BTreeMap<String, u32>,
        features: BTreeMap<Feature, BTreeMap<u32, FeatureModel>>,
    },
}

impl ModelState {
    fn new(kind: ModelKind, features: &[Feature], params: &ModelParams) -> Self {
        match kind {
            ModelKind::Counting => ModelState::Counting {
                bucket_count: 0,
                total_count: 0,
            },
            ModelKind::Individual => ModelState::Individual {
                features: features
                    .iter()
                    .map(|f| (*f, FeatureModel::new(params)))
                    .collect(),
            },
            ModelKind::Population => ModelState::Population {
                attributes: BTreeMap::new(),
                features: features.iter().map(|f| (*f, BTreeMap::new())).collect(),
            },
        }
    }

    fn kind(&self) -> ModelKind {
        match self {
            ModelState::Counting { .. } => ModelKind::Counting,
            ModelState::Individual { .. } => ModelKind::Individual,
            ModelState::Population { .. } => ModelKind::Population,
        }
    }

    fn features(&self) -> Vec<Feature> {
        match self {
            ModelState::Counting { .. } => Vec::new(),
            ModelState::Individual { features } => features.keys().copied().collect(),
            ModelState::Population { features, .. } => features.keys().copied().collect(),
        }
    }

    fn feature_models_mut(&mut self) -> Box<dyn Iterator<Item = &mut FeatureModel> + '_> {
        match self {
            ModelState::Counting { .. } => Box::new(std::iter::empty()),
            ModelState::Individual { features } => Box::new(features.values_mut()),
            ModelState::Population { features, .. } => {
                Box::new(features.values_mut().flat_map(|m| m.values_mut()))
            }
        }
    }
}

/// Everything learnt about one entity.
#[derive(Debug, Clone)]
pub struct Model {
    key: EntityKey,
    slot: EntityId,
    first_seen: Option<i64>,
    last_seen: Option<i64>,
    /// Decayed number of buckets in which the entity had data.
    window_bucket_count: f64,
    pruned: bool,
    /// Opaque data attached by upstream components.
    extra: BTreeMap<String, String>,
    state: ModelState,
}

impl Model {
    pub fn new(
        key: EntityKey,
        slot: EntityId,
        kind: ModelKind,
        features: &[Feature],
        params: &ModelParams,
    ) -> Self {
        Self {
            key,
            slot,
            first_seen: None,
            last_seen: None,
            window_bucket_count: 0.0,
            pruned: false,
            extra: BTreeMap::new(),
            state: ModelState::new(kind, features, params),
        }
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn slot(&self) -> EntityId {
        self.slot
    }

    pub fn kind(&self) -> ModelKind {
        self.state.kind()
    }

    pub fn state(&self) -> &ModelState {
        &self.state
    }

    pub fn features(&self) -> Vec<Feature> {
        self.state.features()
    }

    pub fn first_seen(&self) -> Option<i64> {
        self.first_seen
    }

    pub fn last_seen(&self) -> Option<i64> {
        self.last_seen
    }

    pub fn is_pruned(&self) -> bool {
        self.pruned
    }

    pub fn window_bucket_count(&self) -> f64 {
        self.window_bucket_count
    }

    pub fn extra(&self) -> &BTreeMap<String, String> {
        &self.extra
    }

    pub fn set_extra(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.extra.insert(name.into(), value.into());
    }

    /// Whole buckets between the last bucket with data and `now`.
    pub fn buckets_since_last_event(&self, now: i64, bucket_length: i64) -> Option<i64> {
        self.last_seen.map(|last| (now - last) / bucket_length.max(1))
    }

    /// Decay interval for a sample at `time`: new entities forget faster.
    fn decay_interval(&self, time: i64, params: &ModelParams) -> f64 {
        let derate = self
            .first_seen
            .map(|first| (1.0 - (time - first) as f64 / DERATE_WINDOW_SECS as f64).max(0.0))
            .unwrap_or(1.0);
        1.0 + (params.initial_decay_rate_multiplier - 1.0) * derate
    }

    fn record(
        &self,
        feature: Feature,
        over_value: Option<&str>,
        bucket_time: i64,
        actual: f64,
        scored: &Scored,
    ) -> AnomalyRecord {
        AnomalyRecord {
            search_key_id: self.key.search_key_id,
            partition: self.key.partition.clone(),
            over_value: over_value.map(str::to_string),
            feature,
            bucket_time,
            actual,
            typical: scored.typical,
            probability: scored.probability,
            correlated_probability: None,
            correlated_with: None,
            normalized_score: 0.0,
            slot: self.slot,
            residual: scored.residual,
        }
    }

    /// Score `data` for the bucket starting at `bucket_start`, then learn
    /// from it. Absent data counts as zero for count features of an entity
    /// that has been seen before; metric features skip absent buckets.
    pub fn sample(
        &mut self,
        bucket_start: i64,
        data: Option<&EntityBucket>,
        params: &ModelParams,
        out: &mut SampleOutput,
    ) {
        let has_data = data.is_some_and(|d| d.summary.count > 0);
        if !has_data && (self.pruned || self.first_seen.is_none()) {
            return;
        }
        if has_data {
            if self.pruned {
                self.revive(params);
            }
            self.first_seen.get_or_insert(bucket_start);
            self.last_seen = Some(bucket_start);
            self.window_bucket_count =
                self.window_bucket_count * (-params.decay_rate).exp() + 1.0;
        }

        let time = bucket_start + params.bucket_length / 2;
        let interval = self.decay_interval(time, params);
        let mut pending = Vec::new();
        let mut reinitialised = Vec::new();

        match &mut self.state {
            ModelState::Counting {
                bucket_count,
                total_count,
            } => {
                let count = data.map_or(0, |d| d.summary.count);
                *bucket_count = count;
                *total_count += count;
            }
            ModelState::Individual { features } => {
                for (feature, model) in features.iter_mut() {
                    let value = match data {
                        Some(d) => feature.value(&d.summary),
                        None if feature.is_count() => Some(0.0),
                        None => None,
                    };
                    let Some(value) = value else { continue };
                    let scored = model.score(time, value);
                    if model.learn(time, value, interval, params) {
                        reinitialised.push(*feature);
                    }
                    pending.push((*feature, None, value, scored));
                }
            }
            ModelState::Population {
                attributes,
                features,
            } => {
                let Some(data) = data else { return };
                for (name, summary) in &data.attributes {
                    let next_id = attributes.len() as u32;
                    let id = *attributes.entry(name.clone()).or_insert(next_id);
                    for (feature, models) in features.iter_mut() {
                        let Some(value) = feature.value(summary) else {
                            continue;
                        };
                        let model = models
                            .entry(id)
                            .or_insert_with(|| FeatureModel::new(params));
                        let scored = model.score(time, value);
                        if model.learn(time, value, interval, params) {
                            out.events.push(ModelEvent::TrendReinitialised {
                                key: self.key.clone(),
                                feature: *feature,
                            });
                        }
                        pending.push((*feature, Some(name.as_str()), value, scored));
                    }
                }
            }
        }

        for (feature, over, value, scored) in &pending {
            let record = self.record(*feature, *over, bucket_start, *value, scored);
            out.records.push(record);
        }
        for feature in reinitialised {
            out.events.push(ModelEvent::TrendReinitialised {
                key: self.key.clone(),
                feature,
            });
            out.reinitialised.push((feature, self.slot));
        }
    }

    /// Score `data` without learning from it.
    pub fn score(
        &self,
        bucket_start: i64,
        data: Option<&EntityBucket>,
        params: &ModelParams,
    ) -> Vec<AnomalyRecord> {
        let has_data = data.is_some_and(|d| d.summary.count > 0);
        if !has_data && (self.pruned || self.first_seen.is_none()) {
            return Vec::new();
        }
        let time = bucket_start + params.bucket_length / 2;
        let mut records = Vec::new();
        match &self.state {
            ModelState::Counting { .. } => {}
            ModelState::Individual { features } => {
                for (feature, model) in features {
                    let value = match data {
                        Some(d) => feature.value(&d.summary),
                        None if feature.is_count() => Some(0.0),
                        None => None,
                    };
                    if let Some(value) = value {
                        let scored = model.score(time, value);
                        records.push(self.record(*feature, None, bucket_start, value, &scored));
                    }
                }
            }
            ModelState::Population {
                attributes,
                features,
            } => {
                let Some(data) = data else {
                    return records;
                };
                for (name, summary) in &data.attributes {
                    let Some(id) = attributes.get(name) else {
                        continue;
                    };
                    for (feature, models) in features {
                        if let (Some(model), Some(value)) = (models.get(id), feature.value(summary))
                        {
                            let scored = model.score(time, value);
                            records.push(self.record(
                                *feature,
                                Some(name),
                                bucket_start,
                                value,
                                &scored,
                            ));
                        }
                    }
                }
            }
        }
        records
    }

    /// Age every trend up to `time`.
    pub fn time_now(&mut self, time: i64) {
        for model in self.state.feature_models_mut() {
            model.trend.propagate_forwards_to(time);
        }
    }

    /// Shift stored times forward by `gap` seconds so the gap is not
    /// modelled as missing data.
    pub fn skip_time(&mut self, gap: i64) {
        if let Some(last) = self.last_seen.as_mut() {
            *last += gap;
        }
        for model in self.state.feature_models_mut() {
            model.trend.skip_time(gap);
        }
    }

    /// Swap heavy state for placeholders. Returns false if already pruned.
    pub fn prune(&mut self) -> bool {
        if self.pruned {
            return false;
        }
        for model in self.state.feature_models_mut() {
            *model = FeatureModel::placeholder();
        }
        self.pruned = true;
        true
    }

    fn revive(&mut self, params: &ModelParams) {
        match &mut self.state {
            ModelState::Counting { .. } => {}
            ModelState::Individual { features } => {
                for model in features.values_mut() {
                    *model = FeatureModel::new(params);
                }
            }
            ModelState::Population { features, .. } => {
                for models in features.values_mut() {
                    models.clear();
                }
            }
        }
        self.pruned = false;
    }

    /// Reset to a brand new model for `key`, keeping kind and features.
    pub fn recycle(&mut self, key: EntityKey, params: &ModelParams) {
        let kind = self.kind();
        let features = self.state.features();
        *self = Model::new(key, self.slot, kind, &features, params);
    }

    pub fn memory_usage(&self) -> usize {
        let mut total = std::mem::size_of::<Self>() + self.key.partition.len();
        total += self
            .extra
            .iter()
            .map(|(k, v)| k.len() + v.len() + 2 * std::mem::size_of::<String>())
            .sum::<usize>();
        match &self.state {
            ModelState::Counting { .. } => {}
            ModelState::Individual { features } => {
                total += features
                    .values()
                    .map(|m| std::mem::size_of::<Feature>() + m.memory_usage())
                    .sum::<usize>();
            }
            ModelState::Population {
                attributes,
                features,
            } => {
                total += attributes
                    .keys()
                    .map(|k| k.len() + std::mem::size_of::<(String, u32)>())
                    .sum::<usize>();
                for models in features.values() {
                    total += std::mem::size_of::<Feature>();
                    total += models
                        .values()
                        .map(|m| std::mem::size_of::<u32>() + m.memory_usage())
                        .sum::<usize>();
                }
            }
        }
        total
    }

    /// Hash of the persisted form of this model.
    pub fn checksum(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        let mut inserter = StateInserter::new();
        match self.persist(&mut inserter).and_then(|_| inserter.to_json()) {
            Ok(json) => json.hash(&mut hasher),
            Err(e) => {
                warn!(entity = %self.key, error = %e, "failed to encode model for checksum");
                format!("{self:?}").hash(&mut hasher);
            }
        }
        hasher.finish()
    }

    pub fn persist(&self, inserter: &mut StateInserter) -> Result<(), PersistError> {
        inserter.insert_value(StateTag::SearchKeyId, self.key.search_key_id);
        inserter.insert_value(StateTag::Partition, &self.key.partition);
        inserter.insert_value(StateTag::Slot, self.slot);
        if let Some(first) = self.first_seen {
            inserter.insert_value(StateTag::FirstSeen, first);
        }
        if let Some(last) = self.last_seen {
            inserter.insert_value(StateTag::LastSeen, last);
        }
        inserter.insert_value(StateTag::WindowBucketCount, self.window_bucket_count);
        inserter.insert_value(StateTag::Pruned, self.pruned);
        if !self.extra.is_empty() {
            inserter.insert_json(StateTag::ExtraData, &self.extra)?;
        }
        inserter.insert_value(StateTag::ModelKind, self.kind().as_str());

        match &self.state {
            ModelState::Counting {
                bucket_count,
                total_count,
            } => {
                inserter.insert_value(StateTag::BucketCount, bucket_count);
                inserter.insert_value(StateTag::TotalCount, total_count);
            }
            ModelState::Individual { features } => {
                for (feature, model) in features {
                    inserter.insert_level(StateTag::FeatureModel, |level| {
                        level.insert_value(StateTag::FeatureName, feature);
                        model.persist(level)
                    })?;
                }
            }
            ModelState::Population {
                attributes,
                features,
            } => {
                for (name, id) in attributes {
                    inserter.insert_level(StateTag::Attribute, |level| {
                        level.insert_value(StateTag::AttributeName, name);
                        level.insert_value(StateTag::AttributeId, id);
                        Ok(())
                    })?;
                }
                for (feature, models) in features {
                    // Written even when empty so the feature set survives.
                    inserter.insert_level(StateTag::FeatureModel, |level| {
                        level.insert_value(StateTag::FeatureName, feature);
                        Ok(())
                    })?;
                    for (id, model) in models {
                        inserter.insert_level(StateTag::FeatureModel, |level| {
                            level.insert_value(StateTag::FeatureName, feature);
                            level.insert_value(StateTag::AttributeId, id);
                            model.persist(level)
                        })?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn restore(level: StateTraverser<'_>) -> Result<Model, RestoreError> {
        let mut search_key_id = None;
        let mut partition = None;
        let mut slot = None;
        let mut first_seen = None;
        let mut last_seen = None;
        let mut window_bucket_count = 0.0;
        let mut pruned = false;
        let mut extra = BTreeMap::new();
        let mut kind = None;
        let mut bucket_count = 0;
        let mut total_count = 0;
        let mut attributes = BTreeMap::new();
        let mut individual = BTreeMap::new();
        let mut population: BTreeMap<Feature, BTreeMap<u32, FeatureModel>> = BTreeMap::new();

        for node in level {
            match node.tag() {
                Some(StateTag::SearchKeyId) => search_key_id = Some(node.parse::<u32>()?),
                Some(StateTag::Partition) => partition = Some(node.value()?.to_string()),
                Some(StateTag::Slot) => slot = Some(node.parse::<EntityId>()?),
                Some(StateTag::FirstSeen) => first_seen = Some(node.parse::<i64>()?),
                Some(StateTag::LastSeen) => last_seen = Some(node.parse::<i64>()?),
                Some(StateTag::WindowBucketCount) => window_bucket_count = node.parse()?,
                Some(StateTag::Pruned) => pruned = node.parse()?,
                Some(StateTag::ExtraData) => extra = node.json()?,
                Some(StateTag::ModelKind) => {
                    kind = Some(match node.value()? {
                        "counting" => ModelKind::Counting,
                        "individual" => ModelKind::Individual,
                        "population" => ModelKind::Population,
                        other => {
                            return Err(RestoreError::InvalidValue {
                                tag: node.tag.clone(),
                                value: other.to_string(),
                            })
                        }
                    })
                }
                Some(StateTag::BucketCount) => bucket_count = node.parse()?,
                Some(StateTag::TotalCount) => total_count = node.parse()?,
                Some(StateTag::Attribute) => {
                    let mut inner = node.level()?;
                    let name = inner.expect(StateTag::AttributeName)?.value()?.to_string();
                    let id = inner.expect(StateTag::AttributeId)?.parse::<u32>()?;
                    attributes.insert(name, id);
                }
                Some(StateTag::FeatureModel) => {
                    let restored = restore_feature(node.level()?)?;
                    match (restored.attribute, restored.model) {
                        (None, Some(model)) => {
                            individual.insert(restored.feature, model);
                        }
                        (None, None) => {
                            population.entry(restored.feature).or_default();
                        }
                        (Some(id), Some(model)) => {
                            population
                                .entry(restored.feature)
                                .or_default()
                                .insert(id, model);
                        }
                        (Some(_), None) => {
                            return Err(RestoreError::MissingField("prior or trend"));
                        }
                    }
                }
                _ => {}
            }
        }

        let key = EntityKey::new(
            search_key_id.ok_or(RestoreError::MissingField("search_key_id"))?,
            partition.ok_or(RestoreError::MissingField("partition"))?,
        );
        let state = match kind.ok_or(RestoreError::MissingField("model_kind"))? {
            ModelKind::Counting => ModelState::Counting {
                bucket_count,
                total_count,
            },
            ModelKind::Individual => ModelState::Individual {
                features: individual,
            },
            ModelKind::Population => ModelState::Population {
                attributes,
                features: population,
            },
        };
        Ok(Model {
            key,
            slot: slot.ok_or(RestoreError::MissingField("slot"))?,
            first_seen,
            last_seen,
            window_bucket_count,
            pruned,
            extra,
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUCKET: i64 = 300;

    fn params() -> ModelParams {
        ModelParams {
            bucket_length: BUCKET,
            ..ModelParams::default()
        }
    }

    fn bucket(count: u64, values: &[f64]) -> EntityBucket {
        let mut b = EntityBucket::default();
        for i in 0..count as usize {
            b.add(values.get(i).copied(), None);
        }
        b
    }

    fn individual(features: &[Feature]) -> Model {
        Model::new(EntityKey::new(1, "host-a"), 0, ModelKind::Individual, features, &params())
    }

    fn round_trip(model: &Model) -> Model {
        let mut inserter = StateInserter::new();
        model.persist(&mut inserter).unwrap();
        let nodes = crate::persist::state::parse_document(&inserter.to_json().unwrap()).unwrap();
        Model::restore(StateTraverser::new(&nodes)).unwrap()
    }

    #[test]
    fn test_count_spike_is_improbable() {
        let p = params();
        let mut model = individual(&[Feature::IndividualCount]);
        let mut out = SampleOutput::default();
        for i in 0..200 {
            let n = 10 + (i % 3);
            model.sample(i * BUCKET, Some(&bucket(n as u64, &[])), &p, &mut out);
        }
        let spike = model.score(200 * BUCKET, Some(&bucket(200, &[])), &p);
        assert_eq!(spike.len(), 1);
        assert!(spike[0].probability < 1e-6, "p = {}", spike[0].probability);
        let normal = model.score(200 * BUCKET, Some(&bucket(11, &[])), &p);
        assert!(normal[0].probability > 0.1);
    }

    #[test]
    fn test_missing_count_is_zero_and_missing_metric_is_skipped() {
        let p = params();
        let mut model = individual(&[Feature::IndividualCount, Feature::IndividualMean]);
        let mut out = SampleOutput::default();
        model.sample(0, Some(&bucket(2, &[1.0, 3.0])), &p, &mut out);
        assert_eq!(out.records.len(), 2);

        let mut out = SampleOutput::default();
        model.sample(BUCKET, None, &p, &mut out);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].feature, Feature::IndividualCount);
        assert_eq!(out.records[0].actual, 0.0);
        assert_eq!(model.last_seen(), Some(0));
    }

    #[test]
    fn test_unseen_entity_is_not_sampled() {
        let mut model = individual(&[Feature::IndividualCount]);
        let mut out = SampleOutput::default();
        model.sample(0, None, &params(), &mut out);
        assert!(out.records.is_empty());
        assert_eq!(model.first_seen(), None);
    }

    #[test]
    fn test_prune_is_idempotent_and_revives() {
        let p = params();
        let mut model = individual(&[Feature::IndividualCount]);
        let mut out = SampleOutput::default();
        model.sample(0, Some(&bucket(3, &[])), &p, &mut out);
        let before = model.memory_usage();

        assert!(model.prune());
        let pruned = model.checksum();
        assert!(model.memory_usage() < before);
        assert!(!model.prune());
        assert_eq!(model.checksum(), pruned);

        // Pruned and silent: nothing happens.
        model.sample(BUCKET, None, &p, &mut out);
        assert_eq!(model.checksum(), pruned);

        model.sample(2 * BUCKET, Some(&bucket(1, &[])), &p, &mut out);
        assert!(!model.is_pruned());
        assert_eq!(model.memory_usage(), before);
    }

    #[test]
    fn test_recycle_resets() {
        let p = params();
        let mut model = individual(&[Feature::IndividualSum]);
        let mut out = SampleOutput::default();
        model.sample(0, Some(&bucket(1, &[5.0])), &p, &mut out);
        model.set_extra("owner", "upstream");
        model.recycle(EntityKey::new(1, "host-b"), &p);
        assert_eq!(model.key().partition, "host-b");
        assert_eq!(model.first_seen(), None);
        assert!(model.extra().is_empty());
        assert_eq!(model.kind(), ModelKind::Individual);
        let fresh = Model::new(
            EntityKey::new(1, "host-b"),
            0,
            ModelKind::Individual,
            &[Feature::IndividualSum],
            &p,
        );
        assert_eq!(model.checksum(), fresh.checksum());
    }

    #[test]
    fn test_population_round_trip() {
        let p = params();
        let mut model = Model::new(
            EntityKey::new(2, ""),
            4,
            ModelKind::Population,
            &[Feature::PopulationCount],
            &p,
        );
        let mut out = SampleOutput::default();
        for i in 0..5 {
            let mut b = EntityBucket::default();
            b.add(None, Some("10.0.0.1"));
            b.add(None, Some("10.0.0.2"));
            b.add(None, Some("10.0.0.2"));
            model.sample(i * BUCKET, Some(&b), &p, &mut out);
        }
        assert!(out.records.iter().any(|r| r.over_value.as_deref() == Some("10.0.0.2")));
        let restored = round_trip(&model);
        assert_eq!(restored.checksum(), model.checksum());
        assert_eq!(restored.slot(), 4);
    }

    #[test]
    fn test_individual_round_trip_preserves_scores() {
        let p = params();
        let mut model = individual(&[Feature::IndividualMean]);
        model.set_extra("note", "x");
        let mut out = SampleOutput::default();
        for i in 0..50 {
            let v = 100.0 + (i % 7) as f64 * 0.37;
            model.sample(i * BUCKET, Some(&bucket(1, &[v])), &p, &mut out);
        }
        let restored = round_trip(&model);
        assert_eq!(restored.checksum(), model.checksum());
        let probe = bucket(1, &[120.0]);
        assert_eq!(
            restored.score(50 * BUCKET, Some(&probe), &p),
            model.score(50 * BUCKET, Some(&probe), &p)
        );
    }

    #[test]
    fn test_counting_model_tracks_counts() {
        let p = params();
        let mut model = Model::new(EntityKey::simple_count(), 0, ModelKind::Counting, &[], &p);
        let mut out = SampleOutput::default();
        model.sample(0, Some(&bucket(4, &[])), &p, &mut out);
        model.sample(BUCKET, Some(&bucket(2, &[])), &p, &mut out);
        assert!(out.records.is_empty());
        match model.state() {
            ModelState::Counting {
                bucket_count,
                total_count,
            } => {
                assert_eq!(*bucket_count, 2);
                assert_eq!(*total_count, 6);
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(round_trip(&model).checksum(), model.checksum());
    }

    #[test]
    fn test_skip_time_moves_last_seen() {
        let p = params();
        let mut model = individual(&[Feature::IndividualCount]);
        let mut out = SampleOutput::default();
        model.sample(0, Some(&bucket(1, &[])), &p, &mut out);
        model.skip_time(10 * BUCKET);
        assert_eq!(model.last_seen(), Some(10 * BUCKET));
        assert_eq!(model.buckets_since_last_event(12 * BUCKET, BUCKET), Some(2));
    }
}
