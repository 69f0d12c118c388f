//! Joint distribution of two correlated entities' residuals.

use serde::{Deserialize, Serialize};

use super::two_sided_tail;

/// Effective samples needed before conditional probabilities are offered.
pub const MINIMUM_JOINT_WEIGHT: f64 = 10.0;

/// Bivariate normal with exponentially forgotten moments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BivariatePrior {
    decay_rate: f64,
    weight: f64,
    mean_x: f64,
    mean_y: f64,
    cxx: f64,
    cyy: f64,
    cxy: f64,
}

impl BivariatePrior {
    pub fn new(decay_rate: f64) -> Self {
        Self {
            decay_rate,
            weight: 0.0,
            mean_x: 0.0,
            mean_y: 0.0,
            cxx: 0.0,
            cyy: 0.0,
            cxy: 0.0,
        }
    }

    pub fn add_sample(&mut self, x: f64, y: f64, weight: f64) {
        if !(x.is_finite() && y.is_finite()) || weight <= 0.0 {
            return;
        }
        let total = self.weight + weight;
        let dx = x - self.mean_x;
        let dy = y - self.mean_y;
        self.mean_x += weight * dx / total;
        self.mean_y += weight * dy / total;
        self.cxx += weight * dx * (x - self.mean_x);
        self.cyy += weight * dy * (y - self.mean_y);
        self.cxy += weight * dx * (y - self.mean_y);
        self.weight = total;
    }

    pub fn propagate_forwards_by_time(&mut self, time: f64) {
        if time <= 0.0 {
            return;
        }
        let factor = (-self.decay_rate * time).exp();
        self.weight *= factor;
        self.cxx *= factor;
        self.cyy *= factor;
        self.cxy *= factor;
    }

    pub fn set_decay_rate(&mut self, rate: f64) {
        self.decay_rate = rate;
    }

    pub fn number_samples(&self) -> f64 {
        self.weight
    }

    pub fn correlation(&self) -> f64 {
        let denom = (self.cxx * self.cyy).sqrt();
        if denom <= f64::EPSILON {
            0.0
        } else {
            (self.cxy / denom).clamp(-1.0, 1.0)
        }
    }

    /// Probability of `x` at least this unusual given the partner took `y`.
    pub fn conditional_probability(&self, x: f64, y: f64) -> Option<f64> {
        if self.weight < MINIMUM_JOINT_WEIGHT || self.cyy <= f64::EPSILON {
            return None;
        }
        let slope = self.cxy / self.cyy;
        let mean = self.mean_x + slope * (y - self.mean_y);
        let floor = 1e-6 + 1e-4 * self.mean_x * self.mean_x;
        let variance = ((self.cxx - slope * self.cxy) / self.weight).max(floor);
        Some(two_sided_tail((x - mean) / variance.sqrt()))
    }

    /// The same distribution with the roles of the two variables exchanged.
    pub fn swapped(&self) -> BivariatePrior {
        BivariatePrior {
            decay_rate: self.decay_rate,
            weight: self.weight,
            mean_x: self.mean_y,
            mean_y: self.mean_x,
            cxx: self.cyy,
            cyy: self.cxx,
            cxy: self.cxy,
        }
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}
