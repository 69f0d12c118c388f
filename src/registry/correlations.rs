//! Correlated pair tracking.
//!
//! Per feature, a [`KMostCorrelated`] search proposes candidate pairs and the
//! tracker keeps joint priors for the strongest of them, bounded by a cap
//! proportional to the number of entities and by the memory budget.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CorrelationConfig;
use crate::maths::{BivariatePrior, KMostCorrelated};
use crate::model::feature::Feature;
use crate::model::key::EntityId;
use crate::persist::{PersistError, RestoreError, StateInserter, StateTag, StateTraverser};

/// Hard cap on modelled pairs per feature.
pub const MAXIMUM_CORRELATIONS: usize = 5000;

/// Joint samples needed before a pair corrects probabilities.
pub const MINIMUM_CORRELATE_PRIOR_SAMPLE_COUNT: f64 = 24.0;

/// Candidates requested from the search, relative to the pair cap.
const CANDIDATE_HEADROOM: f64 = 1.2;

/// Pairs are added this many at a time while memory allows.
const PAIR_CHUNK_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationParams {
    pub enabled: bool,
    pub max_correlations: usize,
    pub models_overhead: f64,
    pub min_significant_correlation: f64,
    pub decay_rate: f64,
}

impl CorrelationParams {
    pub fn from_config(config: &CorrelationConfig, decay_rate: f64) -> Self {
        Self {
            enabled: config.enabled,
            max_correlations: config.max_correlations.min(MAXIMUM_CORRELATIONS),
            models_overhead: config.models_overhead,
            min_significant_correlation: config.min_significant_correlation,
            decay_rate,
        }
    }

    fn search_k(&self) -> usize {
        (CANDIDATE_HEADROOM * self.max_correlations as f64).ceil() as usize
    }
}

/// Joint model of one pair of entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatePair {
    pub entities: (EntityId, EntityId),
    pub coefficient: f64,
    pub joint: BivariatePrior,
}

/// What a refresh changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub added: usize,
    pub removed: usize,
    /// Candidates that were not modelled because memory ran out.
    pub rejected: usize,
}

/// Memory allowance handed to a refresh.
#[derive(Debug, Clone, Copy)]
pub struct PairAllowance {
    pub allocations_allowed: bool,
    pub no_limit: bool,
    /// Bytes still available under the limit.
    pub remaining_bytes: usize,
}

impl PairAllowance {
    pub fn unlimited() -> Self {
        Self {
            allocations_allowed: true,
            no_limit: true,
            remaining_bytes: usize::MAX,
        }
    }
}

#[derive(Debug, Clone)]
struct FeatureCorrelations {
    search: KMostCorrelated,
    pairs: BTreeMap<(EntityId, EntityId), CorrelatePair>,
}

#[derive(Debug, Clone)]
pub struct CorrelationTracker {
    params: CorrelationParams,
    features: BTreeMap<Feature, FeatureCorrelations>,
}

fn pair_bytes() -> usize {
    std::mem::size_of::<CorrelatePair>() + std::mem::size_of::<(EntityId, EntityId)>()
}

impl CorrelationTracker {
    pub fn new(params: CorrelationParams) -> Self {
        Self {
            params,
            features: BTreeMap::new(),
        }
    }

    pub fn params(&self) -> &CorrelationParams {
        &self.params
    }

    pub fn set_params(&mut self, params: CorrelationParams) {
        let k = params.search_k();
        for state in self.features.values_mut() {
            state.search.set_k(k);
        }
        self.params = params;
    }

    fn feature_mut(&mut self, feature: Feature) -> &mut FeatureCorrelations {
        let k = self.params.search_k();
        let decay = self.params.decay_rate;
        self.features
            .entry(feature)
            .or_insert_with(|| FeatureCorrelations {
                search: KMostCorrelated::new(k, decay, feature as u64),
                pairs: BTreeMap::new(),
            })
    }

    /// Offer this bucket's residual of an entity to the search.
    pub fn add_residual(&mut self, feature: Feature, id: EntityId, residual: f64) {
        if self.params.enabled {
            self.feature_mut(feature).search.add(id, residual);
        }
    }

    /// Close the bucket in every feature's search.
    pub fn capture(&mut self) {
        for state in self.features.values_mut() {
            state.search.capture();
        }
    }

    /// Probability of `residual` for entity `id` given its most correlated
    /// partner with a residual this bucket.
    pub fn correct(
        &self,
        feature: Feature,
        id: EntityId,
        residual: f64,
        residuals: &BTreeMap<EntityId, f64>,
    ) -> Option<(f64, EntityId)> {
        let state = self.features.get(&feature)?;
        let threshold = self.params.min_significant_correlation;
        state
            .pairs
            .values()
            .filter(|p| p.entities.0 == id || p.entities.1 == id)
            .filter(|p| p.coefficient.abs() >= threshold)
            .filter(|p| p.joint.number_samples() >= MINIMUM_CORRELATE_PRIOR_SAMPLE_COUNT)
            .filter_map(|p| {
                let (a, b) = p.entities;
                let (partner, joint) = if a == id {
                    (b, p.joint.clone())
                } else {
                    (a, p.joint.swapped())
                };
                let y = *residuals.get(&partner)?;
                Some((p.coefficient.abs(), joint.conditional_probability(residual, y)?, partner))
            })
            .max_by(|x, y| x.0.total_cmp(&y.0))
            .map(|(_, probability, partner)| (probability, partner))
    }

    /// Update the joint priors of pairs whose members both have residuals.
    pub fn learn(&mut self, feature: Feature, residuals: &BTreeMap<EntityId, f64>) {
        let Some(state) = self.features.get_mut(&feature) else {
            return;
        };
        for pair in state.pairs.values_mut() {
            let (a, b) = pair.entities;
            if let (Some(&x), Some(&y)) = (residuals.get(&a), residuals.get(&b)) {
                pair.joint.add_sample(x, y, 1.0);
            }
            pair.joint.propagate_forwards_by_time(1.0);
        }
    }

    /// Re-select the modelled pairs of every feature whose search ranking
    /// changed.
    pub fn refresh(&mut self, number_entities: usize, allowance: PairAllowance) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        if !self.params.enabled {
            return summary;
        }
        let max_pairs = ((self.params.models_overhead * number_entities as f64) as usize)
            .min(self.params.max_correlations);
        let cutoff = 0.5 * self.params.min_significant_correlation;
        let decay = self.params.decay_rate;
        let mut remaining = allowance.remaining_bytes;

        for (feature, state) in self.features.iter_mut() {
            if !state.search.changed() {
                continue;
            }
            state.search.mark_refreshed();

            let wanted = (CANDIDATE_HEADROOM * max_pairs as f64).ceil() as usize;
            let candidates: Vec<_> = state
                .search
                .most_correlated(wanted)
                .into_iter()
                .take_while(|p| p.coefficient.abs() >= cutoff)
                .collect();

            if candidates.is_empty() {
                summary.removed += state.pairs.len();
                state.pairs.clear();
                continue;
            }

            let rank: BTreeMap<(EntityId, EntityId), (usize, f64)> = candidates
                .iter()
                .enumerate()
                .map(|(i, p)| (p.pair, (i, p.coefficient)))
                .collect();

            let before = state.pairs.len();
            state.pairs.retain(|key, _| rank.contains_key(key));
            for (key, pair) in state.pairs.iter_mut() {
                pair.coefficient = rank[key].1;
            }
            if state.pairs.len() > max_pairs {
                let mut by_rank: Vec<_> = state.pairs.keys().map(|k| (rank[k].0, *k)).collect();
                by_rank.sort_unstable();
                for (_, key) in by_rank.into_iter().skip(max_pairs) {
                    state.pairs.remove(&key);
                }
            }
            summary.removed += before - state.pairs.len();

            let missing: Vec<_> = candidates
                .iter()
                .filter(|p| !state.pairs.contains_key(&p.pair))
                .collect();
            if !allowance.allocations_allowed {
                summary.rejected += missing.len().min(max_pairs.saturating_sub(state.pairs.len()));
                continue;
            }

            let mut next = missing.iter();
            'chunks: while state.pairs.len() < max_pairs {
                if !allowance.no_limit && remaining < pair_bytes() {
                    break;
                }
                for _ in 0..PAIR_CHUNK_SIZE {
                    if state.pairs.len() >= max_pairs {
                        break 'chunks;
                    }
                    let Some(candidate) = next.next() else {
                        break 'chunks;
                    };
                    state.pairs.insert(
                        candidate.pair,
                        CorrelatePair {
                            entities: candidate.pair,
                            coefficient: candidate.coefficient,
                            joint: BivariatePrior::new(decay),
                        },
                    );
                    summary.added += 1;
                    remaining = remaining.saturating_sub(pair_bytes());
                }
            }
            let unplaced = next.count();
            summary.rejected += unplaced.min(max_pairs.saturating_sub(state.pairs.len()));
            debug!(
                feature = %feature,
                pairs = state.pairs.len(),
                max_pairs,
                "refreshed correlated pairs"
            );
        }
        summary
    }

    /// Forget every pair involving `id`. Returns pairs dropped per feature.
    pub fn remove_entity(&mut self, id: EntityId) -> Vec<(Feature, usize)> {
        let features: Vec<Feature> = self.features.keys().copied().collect();
        features
            .into_iter()
            .map(|f| (f, self.remove_entity_for_feature(f, id)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    pub fn remove_entity_for_feature(&mut self, feature: Feature, id: EntityId) -> usize {
        let Some(state) = self.features.get_mut(&feature) else {
            return 0;
        };
        let before = state.pairs.len();
        state
            .pairs
            .retain(|(a, b), _| *a != id && *b != id);
        state.search.remove_variables(&[id]);
        before - state.pairs.len()
    }

    /// Drop pairs referring to entities for which `keep` is false.
    pub fn retain_entities(&mut self, keep: impl Fn(EntityId) -> bool) {
        for state in self.features.values_mut() {
            let gone: Vec<EntityId> = state
                .pairs
                .keys()
                .flat_map(|(a, b)| [*a, *b])
                .filter(|id| !keep(*id))
                .collect();
            state.pairs.retain(|(a, b), _| keep(*a) && keep(*b));
            if !gone.is_empty() {
                state.search.remove_variables(&gone);
            }
        }
    }

    pub fn number_correlations(&self) -> usize {
        self.features.values().map(|s| s.pairs.len()).sum()
    }

    pub fn pairs(&self, feature: Feature) -> Vec<&CorrelatePair> {
        self.features
            .get(&feature)
            .map(|s| s.pairs.values().collect())
            .unwrap_or_default()
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self
                .features
                .values()
                .map(|s| s.search.memory_usage() + s.pairs.len() * pair_bytes())
                .sum::<usize>()
    }

    pub fn persist(&self, inserter: &mut StateInserter) -> Result<(), PersistError> {
        for (feature, state) in &self.features {
            inserter.insert_level(StateTag::CorrelationFeature, |level| {
                level.insert_value(StateTag::FeatureName, feature);
                level.insert_json(StateTag::CorrelationStructure, &state.search)?;
                for pair in state.pairs.values() {
                    level.insert_level(StateTag::CorrelatePair, |p| {
                        p.insert_value(StateTag::EntityA, pair.entities.0);
                        p.insert_value(StateTag::EntityB, pair.entities.1);
                        p.insert_value(StateTag::Coefficient, pair.coefficient);
                        p.insert_json(StateTag::JointPrior, &pair.joint)
                    })?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Replace the tracked state with that persisted in `level`.
    pub fn restore(&mut self, level: StateTraverser<'_>) -> Result<(), RestoreError> {
        self.features.clear();
        for node in level {
            if node.tag() != Some(StateTag::CorrelationFeature) {
                continue;
            }
            let mut feature = None;
            let mut search = None;
            let mut pairs = BTreeMap::new();
            for child in node.level()? {
                match child.tag() {
                    Some(StateTag::FeatureName) => feature = Some(child.parse::<Feature>()?),
                    Some(StateTag::CorrelationStructure) => {
                        search = Some(child.json::<KMostCorrelated>()?)
                    }
                    Some(StateTag::CorrelatePair) => {
                        let mut p = child.level()?;
                        let a = p.expect(StateTag::EntityA)?.parse::<EntityId>()?;
                        let b = p.expect(StateTag::EntityB)?.parse::<EntityId>()?;
                        let coefficient = p.expect(StateTag::Coefficient)?.parse::<f64>()?;
                        let joint = p.expect(StateTag::JointPrior)?.json::<BivariatePrior>()?;
                        pairs.insert(
                            (a, b),
                            CorrelatePair {
                                entities: (a, b),
                                coefficient,
                                joint,
                            },
                        );
                    }
                    _ => {}
                }
            }
            let feature = feature.ok_or(RestoreError::MissingField("feature"))?;
            let search = search.ok_or(RestoreError::MissingField("correlation_structure"))?;
            self.features
                .insert(feature, FeatureCorrelations { search, pairs });
        }
        Ok(())
    }
}
