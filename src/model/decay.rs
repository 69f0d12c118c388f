//! Decay rate control.
//!
//! Compares short and long run averages of squared prediction residuals. A
//! model that keeps being surprised forgets faster; one that predicts well
//! drifts back to its base rate.

use serde::{Deserialize, Serialize};

const SHORT_RATE: f64 = 0.3;
const LONG_RATE: f64 = 0.03;
const WARM_UP_SAMPLES: u64 = 5;
const SURPRISE_RATIO: f64 = 2.0;
const CALM_RATIO: f64 = 1.2;
const STEP: f64 = 1.5;
const MAXIMUM_MULTIPLIER: f64 = 8.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayRateController {
    short_error: f64,
    long_error: f64,
    samples: u64,
    /// Product of every factor handed out so far.
    multiplier: f64,
}

impl Default for DecayRateController {
    fn default() -> Self {
        Self {
            short_error: 0.0,
            long_error: 0.0,
            samples: 0,
            multiplier: 1.0,
        }
    }
}

impl DecayRateController {
    /// Factor to apply to the current decay rate after seeing `residual`.
    pub fn multiplier(&mut self, prediction: f64, residual: f64, learn_rate: f64) -> f64 {
        let scale = prediction.abs().max(1.0);
        let error = (residual / scale).powi(2);
        if !error.is_finite() {
            return 1.0;
        }
        let learn = learn_rate.clamp(0.0, 1.0);
        if self.samples == 0 {
            self.short_error = error;
            self.long_error = error;
        } else {
            self.short_error += SHORT_RATE * learn * (error - self.short_error);
            self.long_error += LONG_RATE * learn * (error - self.long_error);
        }
        self.samples += 1;
        if self.samples < WARM_UP_SAMPLES || self.long_error <= f64::EPSILON {
            return 1.0;
        }

        let ratio = self.short_error / self.long_error;
        let target = if ratio > SURPRISE_RATIO {
            (self.multiplier * STEP).min(MAXIMUM_MULTIPLIER)
        } else if ratio < CALM_RATIO {
            (self.multiplier / STEP).max(1.0)
        } else {
            self.multiplier
        };
        let factor = target / self.multiplier;
        self.multiplier = target;
        factor
    }

    pub fn cumulative_multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steady_residuals_leave_rate_alone() {
        let mut c = DecayRateController::default();
        for _ in 0..50 {
            assert_eq!(c.multiplier(10.0, 1.0, 1.0), 1.0);
        }
        assert_eq!(c.cumulative_multiplier(), 1.0);
    }

    #[test]
    fn test_surprise_speeds_up_then_recovers() {
        let mut c = DecayRateController::default();
        for _ in 0..20 {
            c.multiplier(10.0, 0.5, 1.0);
        }
        let mut grew = 1.0;
        for _ in 0..5 {
            grew *= c.multiplier(10.0, 20.0, 1.0);
        }
        assert!(grew > 1.0);
        assert!(c.cumulative_multiplier() <= MAXIMUM_MULTIPLIER);
        for _ in 0..500 {
            c.multiplier(10.0, 0.5, 1.0);
        }
        assert_eq!(c.cumulative_multiplier(), 1.0);
    }
}
