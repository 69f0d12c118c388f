//! Trend decomposition.
//!
//! A trend tracks the level of a feature and, once the data shows it, a
//! periodic component. Values are detrended before they reach the prior.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Largest number of phase slots a seasonal component is split into.
pub const MAXIMUM_SEASONAL_SLOTS: usize = 24;

/// A seasonal component is adopted once it removes at least this fraction of
/// the squared deviation around the level.
pub const SEASONAL_VARIANCE_REDUCTION: f64 = 0.5;

pub trait Trend: fmt::Debug + Send {
    /// Remove the predicted periodic component from `value`.
    fn detrend(&self, time: i64, value: f64) -> f64;

    /// Predicted value at `time`.
    fn predict(&self, time: i64) -> f64;

    /// Learn from one point. Returns true when the decomposition changed
    /// structure and downstream state built on the old residuals is stale.
    fn add_point(&mut self, time: i64, value: f64, weight: f64) -> bool;

    /// Age the accumulated evidence up to `time`.
    fn propagate_forwards_to(&mut self, time: i64);

    /// Ratio of the residual variance at `time` to the average residual
    /// variance.
    fn scale(&self, time: i64) -> f64;

    fn mean(&self) -> f64;

    fn decay_rate(&self) -> f64;
    fn set_decay_rate(&mut self, rate: f64);

    /// Shift every stored time forward by `gap` seconds.
    fn skip_time(&mut self, gap: i64);

    fn memory_usage(&self) -> usize;

    fn box_clone(&self) -> Box<dyn Trend>;

    fn state(&self) -> TrendState;
}

impl Clone for Box<dyn Trend> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrendState {
    Seasonal(SeasonalTrend),
    Constant,
}

impl TrendState {
    pub fn into_trend(self) -> Box<dyn Trend> {
        match self {
            TrendState::Seasonal(t) => Box::new(t),
            TrendState::Constant => Box::new(ConstantTrend),
        }
    }
}

// ---------------------------------------------------------------------------
// Seasonal trend
// ---------------------------------------------------------------------------

/// Level plus an optional periodic component split into phase slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonalTrend {
    bucket_length: i64,
    period: i64,
    decay_rate: f64,
    first_time: Option<i64>,
    propagated_to: Option<i64>,
    level: f64,
    level_weight: f64,
    slot_means: Vec<f64>,
    slot_weights: Vec<f64>,
    slot_m2: Vec<f64>,
    /// Squared deviations around the level and around the slot means, over
    /// the same points, used to decide whether the period is real.
    level_m2: f64,
    seasonal_m2: f64,
    seasonal: bool,
}

impl SeasonalTrend {
    pub fn new(bucket_length: i64, period: i64, decay_rate: f64) -> Self {
        let slots = if bucket_length > 0 && period >= 2 * bucket_length {
            ((period / bucket_length) as usize).min(MAXIMUM_SEASONAL_SLOTS)
        } else {
            1
        };
        Self {
            bucket_length: bucket_length.max(1),
            period: period.max(1),
            decay_rate,
            first_time: None,
            propagated_to: None,
            level: 0.0,
            level_weight: 0.0,
            slot_means: vec![0.0; slots],
            slot_weights: vec![0.0; slots],
            slot_m2: vec![0.0; slots],
            level_m2: 0.0,
            seasonal_m2: 0.0,
            seasonal: false,
        }
    }

    pub fn is_seasonal(&self) -> bool {
        self.seasonal
    }

    fn slot(&self, time: i64) -> usize {
        let slots = self.slot_means.len() as i64;
        (time.rem_euclid(self.period) * slots / self.period) as usize
    }

    fn component(&self, time: i64) -> f64 {
        if !self.seasonal {
            return 0.0;
        }
        let slot = self.slot(time);
        if self.slot_weights[slot] > 0.0 {
            self.slot_means[slot] - self.level
        } else {
            0.0
        }
    }

    fn can_test(&self, time: i64) -> bool {
        self.slot_means.len() > 1
            && self
                .first_time
                .is_some_and(|first| time - first >= 2 * self.period)
    }
}

impl Trend for SeasonalTrend {
    fn detrend(&self, time: i64, value: f64) -> f64 {
        value - self.component(time)
    }

    fn predict(&self, time: i64) -> f64 {
        self.level + self.component(time)
    }

    fn add_point(&mut self, time: i64, value: f64, weight: f64) -> bool {
        if !value.is_finite() || weight <= 0.0 {
            return false;
        }
        self.first_time.get_or_insert(time);
        let slot = self.slot(time);

        if self.slot_weights[slot] > 0.0 && self.level_weight > 0.0 {
            self.level_m2 += weight * (value - self.level).powi(2);
            self.seasonal_m2 += weight * (value - self.slot_means[slot]).powi(2);
        }

        self.level_weight += weight;
        self.level += weight * (value - self.level) / self.level_weight;

        let slot_weight = self.slot_weights[slot] + weight;
        let delta = value - self.slot_means[slot];
        self.slot_means[slot] += weight * delta / slot_weight;
        self.slot_m2[slot] += weight * delta * (value - self.slot_means[slot]);
        self.slot_weights[slot] = slot_weight;

        if !self.seasonal
            && self.can_test(time)
            && self.level_m2 > f64::EPSILON
            && self.seasonal_m2 < SEASONAL_VARIANCE_REDUCTION * self.level_m2
        {
            self.seasonal = true;
            return true;
        }
        false
    }

    fn propagate_forwards_to(&mut self, time: i64) {
        let from = *self.propagated_to.get_or_insert(time);
        if time <= from {
            return;
        }
        let buckets = (time - from) as f64 / self.bucket_length as f64;
        let factor = (-self.decay_rate * buckets).exp();
        self.level_weight *= factor;
        for (w, m2) in self.slot_weights.iter_mut().zip(self.slot_m2.iter_mut()) {
            *w *= factor;
            *m2 *= factor;
        }
        self.level_m2 *= factor;
        self.seasonal_m2 *= factor;
        self.propagated_to = Some(time);
    }

    fn scale(&self, time: i64) -> f64 {
        if !self.seasonal {
            return 1.0;
        }
        let slot = self.slot(time);
        let total_weight: f64 = self.slot_weights.iter().sum();
        let total_m2: f64 = self.slot_m2.iter().sum();
        if self.slot_weights[slot] <= 0.0 || total_weight <= 0.0 || total_m2 <= 0.0 {
            return 1.0;
        }
        let local = self.slot_m2[slot] / self.slot_weights[slot];
        let average = total_m2 / total_weight;
        (local / average).clamp(0.2, 5.0)
    }

    fn mean(&self) -> f64 {
        self.level
    }

    fn decay_rate(&self) -> f64 {
        self.decay_rate
    }

    fn set_decay_rate(&mut self, rate: f64) {
        self.decay_rate = rate;
    }

    fn skip_time(&mut self, gap: i64) {
        if let Some(first) = self.first_time.as_mut() {
            *first += gap;
        }
        if let Some(to) = self.propagated_to.as_mut() {
            *to += gap;
        }
    }

    fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + 3 * self.slot_means.len() * std::mem::size_of::<f64>()
    }

    fn box_clone(&self) -> Box<dyn Trend> {
        Box::new(self.clone())
    }

    fn state(&self) -> TrendState {
        TrendState::Seasonal(self.clone())
    }
}

// ---------------------------------------------------------------------------
// Placeholder
// ---------------------------------------------------------------------------

/// Identity trend held by pruned models.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstantTrend;

impl Trend for ConstantTrend {
    fn detrend(&self, _time: i64, value: f64) -> f64 {
        value
    }

    fn predict(&self, _time: i64) -> f64 {
        0.0
    }

    fn add_point(&mut self, _time: i64, _value: f64, _weight: f64) -> bool {
        false
    }

    fn propagate_forwards_to(&mut self, _time: i64) {}

    fn scale(&self, _time: i64) -> f64 {
        1.0
    }

    fn mean(&self) -> f64 {
        0.0
    }

    fn decay_rate(&self) -> f64 {
        0.0
    }

    fn set_decay_rate(&mut self, _rate: f64) {}

    fn skip_time(&mut self, _gap: i64) {}

    fn memory_usage(&self) -> usize {
        0
    }

    fn box_clone(&self) -> Box<dyn Trend> {
        Box::new(ConstantTrend)
    }

    fn state(&self) -> TrendState {
        TrendState::Constant
    }
}
