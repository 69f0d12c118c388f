//! Memory budget for model state.
//!
//! The [`ResourceMonitor`] holds the configured limit and the last measured
//! usage and answers whether more models may be allocated. The
//! [`MemoryUsageEstimator`] keeps measuring cheap by fitting usage against
//! entity and correlation counts.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Fraction of the limit below which a reduced prune window is restored.
const PRUNE_RELAX_FRACTION: f64 = 0.5;

/// Prune windows never shrink below this many buckets.
const MINIMUM_PRUNE_WINDOW: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    Ok,
    /// Usage is close to the limit; inactive models are pruned early.
    SoftLimit,
    /// New models are being refused.
    HardLimit,
}

/// Snapshot of model memory use, emitted with results and checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSizeStats {
    pub model_bytes: usize,
    pub memory_limit: Option<usize>,
    pub total_entities: usize,
    pub pruned_entities: usize,
    pub total_correlations: usize,
    pub allocation_failures: u64,
    pub memory_status: MemoryStatus,
    pub bucket_time: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ResourceMonitor {
    limit: Option<usize>,
    usage: usize,
    peak: usize,
    allocation_failures: u64,
    last_failure_time: Option<i64>,
    prune_window: Option<u64>,
}

impl ResourceMonitor {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            usage: 0,
            peak: 0,
            allocation_failures: 0,
            last_failure_time: None,
            prune_window: None,
        }
    }

    pub fn have_no_limit(&self) -> bool {
        self.limit.is_none()
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    pub fn allocations_allowed(&self) -> bool {
        self.limit.map_or(true, |limit| self.usage < limit)
    }

    /// Bytes that may still be allocated.
    pub fn allocation_limit(&self) -> usize {
        self.limit
            .map_or(usize::MAX, |limit| limit.saturating_sub(self.usage))
    }

    pub fn usage(&self) -> usize {
        self.usage
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Replace the measured usage.
    pub fn force_refresh(&mut self, usage: usize) {
        self.usage = usage;
        self.peak = self.peak.max(usage);
    }

    pub fn accept_allocation_failure(&mut self, time: i64) {
        if self.allocation_failures == 0 {
            warn!(
                usage = self.usage,
                limit = ?self.limit,
                "memory limit reached, new entities will not be modelled"
            );
        }
        self.allocation_failures += 1;
        self.last_failure_time = Some(time);
    }

    pub fn allocation_failures(&self) -> u64 {
        self.allocation_failures
    }

    pub fn last_failure_time(&self) -> Option<i64> {
        self.last_failure_time
    }

    pub fn status(&self) -> MemoryStatus {
        match self.limit {
            None => MemoryStatus::Ok,
            Some(limit) if self.usage >= limit => MemoryStatus::HardLimit,
            Some(_) if self.prune_window.is_some() => MemoryStatus::SoftLimit,
            Some(_) => MemoryStatus::Ok,
        }
    }

    /// The prune window to apply now, if usage calls for more aggressive
    /// pruning than `default_window`. Halves on every call made while at the
    /// limit and returns to the default once usage has fallen well below it.
    pub fn prune_if_required(&mut self, default_window: u64) -> Option<u64> {
        let limit = self.limit?;
        if self.usage >= limit {
            let current = self.prune_window.unwrap_or(default_window);
            let next = (current / 2).max(MINIMUM_PRUNE_WINDOW).min(default_window);
            if self.prune_window != Some(next) {
                info!(window = next, usage = self.usage, limit, "shrinking prune window");
            }
            self.prune_window = Some(next);
            return Some(next);
        }
        if self.prune_window.is_some() && (self.usage as f64) < PRUNE_RELAX_FRACTION * limit as f64
        {
            info!(window = default_window, "restoring default prune window");
            self.prune_window = None;
        }
        self.prune_window
    }
}

// ---------------------------------------------------------------------------
// Memory usage estimation
// ---------------------------------------------------------------------------

const MAXIMUM_SAMPLES: usize = 10;
const MINIMUM_SAMPLES_FOR_REGRESSION: usize = 3;
const MAXIMUM_ESTIMATES_BETWEEN_MEASUREMENTS: u32 = 10;
const INVALIDATION_TOLERANCE: f64 = 0.1;

/// Entity and correlation counts used as predictors.
pub type Predictors = [usize; 2];

/// Fits measured usage against [`Predictors`].
#[derive(Debug, Clone, Default)]
pub struct MemoryUsageEstimator {
    samples: VecDeque<(Predictors, usize)>,
    estimates_since_measurement: u32,
}

impl MemoryUsageEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Estimated usage, or `None` when an exact measurement is due.
    pub fn estimate(&mut self, predictors: Predictors) -> Option<usize> {
        if self.estimates_since_measurement >= MAXIMUM_ESTIMATES_BETWEEN_MEASUREMENTS {
            return None;
        }
        let estimate = self.lookup(predictors)?;
        self.estimates_since_measurement += 1;
        Some(estimate)
    }

    fn lookup(&self, predictors: Predictors) -> Option<usize> {
        if let Some((_, usage)) = self.samples.iter().find(|(p, _)| *p == predictors) {
            return Some(*usage);
        }
        if self.samples.len() < MINIMUM_SAMPLES_FOR_REGRESSION {
            return None;
        }
        self.regress(predictors)
    }

    /// Record an exact measurement.
    pub fn add_value(&mut self, predictors: Predictors, usage: usize) {
        if let Some(predicted) = self.lookup(predictors) {
            let error = (predicted as f64 - usage as f64).abs();
            if error > INVALIDATION_TOLERANCE * usage.max(1) as f64 {
                self.samples.clear();
            }
        }
        self.samples.retain(|(p, _)| *p != predictors);
        if self.samples.len() == MAXIMUM_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back((predictors, usage));
        self.estimates_since_measurement = 0;
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn regress(&self, predictors: Predictors) -> Option<usize> {
        let n = self.samples.len() as f64;
        let mean = |f: &dyn Fn(&(Predictors, usize)) -> f64| {
            self.samples.iter().map(f).sum::<f64>() / n
        };
        let mx1 = mean(&|s| s.0[0] as f64);
        let mx2 = mean(&|s| s.0[1] as f64);
        let my = mean(&|s| s.1 as f64);

        let (mut s11, mut s22, mut s12, mut s1y, mut s2y) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for (p, y) in &self.samples {
            let d1 = p[0] as f64 - mx1;
            let d2 = p[1] as f64 - mx2;
            let dy = *y as f64 - my;
            s11 += d1 * d1;
            s22 += d2 * d2;
            s12 += d1 * d2;
            s1y += d1 * dy;
            s2y += d2 * dy;
        }

        let x1 = predictors[0] as f64 - mx1;
        let x2 = predictors[1] as f64 - mx2;
        let det = s11 * s22 - s12 * s12;
        let estimate = if det.abs() > 1e-9 * (s11 * s22).max(1.0) {
            let b1 = (s1y * s22 - s2y * s12) / det;
            let b2 = (s2y * s11 - s1y * s12) / det;
            my + b1 * x1 + b2 * x2
        } else if s11 > 0.0 && x2 == 0.0 {
            my + s1y / s11 * x1
        } else if s22 > 0.0 && x1 == 0.0 {
            my + s2y / s22 * x2
        } else {
            return None;
        };
        (estimate.is_finite() && estimate >= 0.0).then(|| estimate.round() as usize)
    }
}
