//! Statistical building blocks used by the per-entity models.
//!
//! Nothing in here knows about entities, buckets or persistence beyond
//! `serde`: the model layer drives these through the [`Prior`] and [`Trend`]
//! traits and the bivariate and correlation structures.

pub mod correlation;
pub mod joint;
pub mod prior;
pub mod trend;

pub use correlation::{CorrelatedPair, KMostCorrelated};
pub use joint::BivariatePrior;
pub use prior::{ConstantPrior, GaussianPrior, Prior, PriorState};
pub use trend::{ConstantTrend, SeasonalTrend, Trend, TrendState};

/// Smallest probability ever reported.
pub const MINIMUM_PROBABILITY: f64 = 1e-300;

/// Complementary error function.
///
/// Numerical Recipes `erfcc`, fractional error below 1.2e-7 everywhere.
pub fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    let ans = t * poly.exp();
    if x >= 0.0 {
        ans
    } else {
        2.0 - ans
    }
}

/// Probability of a standard normal deviate at least as far from zero as `z`.
pub fn two_sided_tail(z: f64) -> f64 {
    if !z.is_finite() {
        return MINIMUM_PROBABILITY;
    }
    erfc(z.abs() / std::f64::consts::SQRT_2).clamp(MINIMUM_PROBABILITY, 1.0)
}
