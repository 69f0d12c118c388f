//! Modelled features and the bucket summaries they are computed from.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DetectorFunction;

/// A statistic derived from one bucket of an entity's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    IndividualCount,
    IndividualMean,
    IndividualSum,
    IndividualMin,
    IndividualMax,
    PopulationCount,
    PopulationMean,
    PopulationSum,
    PopulationMin,
    PopulationMax,
}

impl Feature {
    pub fn for_function(function: DetectorFunction, population: bool) -> Self {
        use DetectorFunction::*;
        match (function, population) {
            (Count, false) => Feature::IndividualCount,
            (Mean, false) => Feature::IndividualMean,
            (Sum, false) => Feature::IndividualSum,
            (Min, false) => Feature::IndividualMin,
            (Max, false) => Feature::IndividualMax,
            (Count, true) => Feature::PopulationCount,
            (Mean, true) => Feature::PopulationMean,
            (Sum, true) => Feature::PopulationSum,
            (Min, true) => Feature::PopulationMin,
            (Max, true) => Feature::PopulationMax,
        }
    }

    pub fn is_population(self) -> bool {
        matches!(
            self,
            Feature::PopulationCount
                | Feature::PopulationMean
                | Feature::PopulationSum
                | Feature::PopulationMin
                | Feature::PopulationMax
        )
    }

    pub fn is_count(self) -> bool {
        matches!(self, Feature::IndividualCount | Feature::PopulationCount)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Feature::IndividualCount => "individual_count",
            Feature::IndividualMean => "individual_mean",
            Feature::IndividualSum => "individual_sum",
            Feature::IndividualMin => "individual_min",
            Feature::IndividualMax => "individual_max",
            Feature::PopulationCount => "population_count",
            Feature::PopulationMean => "population_mean",
            Feature::PopulationSum => "population_sum",
            Feature::PopulationMin => "population_min",
            Feature::PopulationMax => "population_max",
        }
    }

    /// Value of this feature for one bucket summary, if it has one.
    pub fn value(self, summary: &BucketSummary) -> Option<f64> {
        if self.is_count() {
            return Some(summary.count as f64);
        }
        let metric = summary.metric.as_ref()?;
        match self {
            Feature::IndividualMean | Feature::PopulationMean => {
                Some(metric.sum / metric.count as f64)
            }
            Feature::IndividualSum | Feature::PopulationSum => Some(metric.sum),
            Feature::IndividualMin | Feature::PopulationMin => Some(metric.min),
            Feature::IndividualMax | Feature::PopulationMax => Some(metric.max),
            Feature::IndividualCount | Feature::PopulationCount => None,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown feature '{0}'")]
pub struct UnknownFeature(pub String);

impl FromStr for Feature {
    type Err = UnknownFeature;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let all = [
            Feature::IndividualCount,
            Feature::IndividualMean,
            Feature::IndividualSum,
            Feature::IndividualMin,
            Feature::IndividualMax,
            Feature::PopulationCount,
            Feature::PopulationMean,
            Feature::PopulationSum,
            Feature::PopulationMin,
            Feature::PopulationMax,
        ];
        all.into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| UnknownFeature(s.to_string()))
    }
}

/// Running summary of metric values within a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl MetricSummary {
    pub fn new(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    pub fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }
}

/// Everything gathered for one entity (or one attribute of a population
/// entity) in one bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketSummary {
    pub count: u64,
    pub metric: Option<MetricSummary>,
}

impl BucketSummary {
    pub fn add(&mut self, value: Option<f64>) {
        self.count += 1;
        if let Some(v) = value {
            match &mut self.metric {
                Some(m) => m.add(v),
                None => self.metric = Some(MetricSummary::new(v)),
            }
        }
    }
}

/// One entity's data for one bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityBucket {
    pub summary: BucketSummary,
    /// Per over-field value, for population entities.
    pub attributes: BTreeMap<String, BucketSummary>,
}

impl EntityBucket {
    pub fn add(&mut self, value: Option<f64>, attribute: Option<&str>) {
        self.summary.add(value);
        if let Some(name) = attribute {
            self.attributes.entry(name.to_string()).or_default().add(value);
        }
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self
                .attributes
                .keys()
                .map(|k| k.len() + std::mem::size_of::<BucketSummary>())
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_values() {
        let mut bucket = BucketSummary::default();
        bucket.add(Some(2.0));
        bucket.add(Some(6.0));
        assert_eq!(Feature::IndividualCount.value(&bucket), Some(2.0));
        assert_eq!(Feature::IndividualMean.value(&bucket), Some(4.0));
        assert_eq!(Feature::IndividualMin.value(&bucket), Some(2.0));
        assert_eq!(Feature::PopulationMax.value(&bucket), Some(6.0));

        let empty = BucketSummary::default();
        assert_eq!(Feature::IndividualCount.value(&empty), Some(0.0));
        assert_eq!(Feature::IndividualSum.value(&empty), None);
    }

    #[test]
    fn test_feature_parse() {
        assert_eq!("population_sum".parse::<Feature>(), Ok(Feature::PopulationSum));
        assert!("nope".parse::<Feature>().is_err());
    }

    #[test]
    fn test_entity_bucket_attributes() {
        let mut b = EntityBucket::default();
        b.add(None, Some("a"));
        b.add(None, Some("a"));
        b.add(None, Some("b"));
        assert_eq!(b.summary.count, 3);
        assert_eq!(b.attributes["a"].count, 2);
    }
}
