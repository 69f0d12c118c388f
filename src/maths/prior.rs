//! Univariate residual distributions.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::two_sided_tail;

/// Samples of effective weight needed before a prior scores anything.
pub const MINIMUM_INFORMATIVE_WEIGHT: f64 = 2.0;

/// A distribution over one feature's detrended values.
pub trait Prior: fmt::Debug + Send {
    fn add_samples(&mut self, samples: &[f64], weights: &[f64]);

    /// Age the accumulated evidence by `time` buckets.
    fn propagate_forwards_by_time(&mut self, time: f64);

    fn decay_rate(&self) -> f64;
    fn set_decay_rate(&mut self, rate: f64);

    fn marginal_likelihood_mean(&self) -> f64;
    fn marginal_likelihood_variance(&self) -> f64;

    /// Effective number of samples after decay.
    fn number_samples(&self) -> f64;

    fn is_non_informative(&self) -> bool {
        self.number_samples() < MINIMUM_INFORMATIVE_WEIGHT
    }

    /// Probability of seeing a value at least as unusual as `value`.
    fn probability_of_less_likely(&self, value: f64) -> f64;

    fn memory_usage(&self) -> usize;

    fn box_clone(&self) -> Box<dyn Prior>;

    /// Serializable form of this prior.
    fn state(&self) -> PriorState;
}

impl Clone for Box<dyn Prior> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Persisted form of every prior implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PriorState {
    Gaussian(GaussianPrior),
    Constant,
}

impl PriorState {
    pub fn into_prior(self) -> Box<dyn Prior> {
        match self {
            PriorState::Gaussian(p) => Box::new(p),
            PriorState::Constant => Box::new(ConstantPrior),
        }
    }
}

/// Normal distribution with exponentially forgotten moments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianPrior {
    decay_rate: f64,
    weight: f64,
    mean: f64,
    /// Weighted sum of squared deviations from `mean`.
    m2: f64,
}

impl GaussianPrior {
    pub fn new(decay_rate: f64) -> Self {
        Self {
            decay_rate,
            weight: 0.0,
            mean: 0.0,
            m2: 0.0,
        }
    }

    fn variance(&self) -> f64 {
        let floor = 1e-6 + 1e-4 * self.mean * self.mean;
        if self.weight <= 0.0 {
            return floor;
        }
        (self.m2 / self.weight).max(floor)
    }
}

impl Prior for GaussianPrior {
    fn add_samples(&mut self, samples: &[f64], weights: &[f64]) {
        for (&x, &w) in samples.iter().zip(weights) {
            if !x.is_finite() || w <= 0.0 {
                continue;
            }
            let total = self.weight + w;
            let delta = x - self.mean;
            self.mean += w * delta / total;
            self.m2 += w * delta * (x - self.mean);
            self.weight = total;
        }
    }

    fn propagate_forwards_by_time(&mut self, time: f64) {
        if time <= 0.0 {
            return;
        }
        let factor = (-self.decay_rate * time).exp();
        self.weight *= factor;
        self.m2 *= factor;
    }

    fn decay_rate(&self) -> f64 {
        self.decay_rate
    }

    fn set_decay_rate(&mut self, rate: f64) {
        self.decay_rate = rate;
    }

    fn marginal_likelihood_mean(&self) -> f64 {
        self.mean
    }

    fn marginal_likelihood_variance(&self) -> f64 {
        // Predictive variance includes the uncertainty in the mean.
        let n = self.weight.max(1.0);
        self.variance() * (1.0 + 1.0 / n)
    }

    fn number_samples(&self) -> f64 {
        self.weight
    }

    fn probability_of_less_likely(&self, value: f64) -> f64 {
        if self.is_non_informative() {
            return 1.0;
        }
        let sd = self.marginal_likelihood_variance().sqrt();
        two_sided_tail((value - self.mean) / sd)
    }

    fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
    }

    fn box_clone(&self) -> Box<dyn Prior> {
        Box::new(self.clone())
    }

    fn state(&self) -> PriorState {
        PriorState::Gaussian(self.clone())
    }
}

/// Placeholder held by pruned models. It learns nothing and finds nothing
/// unusual.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstantPrior;

impl Prior for ConstantPrior {
    fn add_samples(&mut self, _samples: &[f64], _weights: &[f64]) {}

    fn propagate_forwards_by_time(&mut self, _time: f64) {}

    fn decay_rate(&self) -> f64 {
        0.0
    }

    fn set_decay_rate(&mut self, _rate: f64) {}

    fn marginal_likelihood_mean(&self) -> f64 {
        0.0
    }

    fn marginal_likelihood_variance(&self) -> f64 {
        0.0
    }

    fn number_samples(&self) -> f64 {
        0.0
    }

    fn probability_of_less_likely(&self, _value: f64) -> f64 {
        1.0
    }

    fn memory_usage(&self) -> usize {
        0
    }

    fn box_clone(&self) -> Box<dyn Prior> {
        Box::new(ConstantPrior)
    }

    fn state(&self) -> PriorState {
        PriorState::Constant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trained(values: &[f64]) -> GaussianPrior {
        let mut prior = GaussianPrior::new(0.0);
        let weights = vec![1.0; values.len()];
        prior.add_samples(values, &weights);
        prior
    }

    #[test]
    fn test_moments() {
        let prior = trained(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!((prior.marginal_likelihood_mean() - 3.0).abs() < 1e-12);
        assert!((prior.variance() - 2.0).abs() < 1e-12);
        assert_eq!(prior.number_samples(), 5.0);
    }

    #[test]
    fn test_non_informative_scores_nothing() {
        let prior = trained(&[10.0]);
        assert!(prior.is_non_informative());
        assert_eq!(prior.probability_of_less_likely(1e9), 1.0);
    }

    #[test]
    fn test_outlier_is_improbable() {
        let values: Vec<f64> = (0..50).map(|i| 10.0 + (i % 5) as f64 * 0.1).collect();
        let prior = trained(&values);
        assert!(prior.probability_of_less_likely(10.2) > 0.5);
        assert!(prior.probability_of_less_likely(50.0) < 1e-6);
    }

    #[test]
    fn test_decay_shrinks_weight() {
        let mut prior = trained(&[1.0, 2.0, 3.0]);
        prior.set_decay_rate(0.5);
        prior.propagate_forwards_by_time(2.0);
        assert!((prior.number_samples() - 3.0 * (-1.0f64).exp()).abs() < 1e-12);
        assert!((prior.marginal_likelihood_mean() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_state_round_trip() {
        let prior = trained(&[0.1, 0.7, 1.3]);
        let json = serde_json::to_string(&prior.state()).unwrap();
        let restored: PriorState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, prior.state());
        assert_eq!(restored.into_prior().number_samples(), 3.0);
    }
}
