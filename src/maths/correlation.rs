//! Online search for the most correlated pairs among many variables.
//!
//! Every bucket each variable contributes at most one value. Candidate pairs
//! accumulate decayed moments; pairs are proposed exhaustively while the
//! variable set is small and at random once it is not. The structure keeps a
//! bounded candidate set and reports when its ranking changes.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::joint::BivariatePrior;

pub type VariableId = u32;

/// Candidate pairs are enumerated exhaustively up to this many.
pub const MAXIMUM_EXHAUSTIVE_PAIRS: usize = 2000;

/// Effective shared samples before a pair's coefficient is trusted.
pub const MINIMUM_PAIR_WEIGHT: f64 = 10.0;

/// A ranked pair as reported by [`KMostCorrelated::most_correlated`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelatedPair {
    pub pair: (VariableId, VariableId),
    pub coefficient: f64,
    /// Arrival order, used to break ties deterministically.
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Candidate {
    pair: (VariableId, VariableId),
    sequence: u64,
    moments: BivariatePrior,
}

impl Candidate {
    fn is_mature(&self) -> bool {
        self.moments.number_samples() >= MINIMUM_PAIR_WEIGHT
    }

    fn rank_score(&self) -> f64 {
        if self.is_mature() {
            self.moments.correlation().abs()
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMostCorrelated {
    k: usize,
    capacity: usize,
    decay_rate: f64,
    seed: u64,
    captures: u64,
    next_sequence: u64,
    /// Sorted by pair.
    candidates: Vec<Candidate>,
    #[serde(skip)]
    current: BTreeMap<VariableId, f64>,
    last_top: Vec<(VariableId, VariableId)>,
    changed: bool,
}

impl KMostCorrelated {
    pub fn new(k: usize, decay_rate: f64, seed: u64) -> Self {
        Self {
            k,
            capacity: 2 * k + 16,
            decay_rate,
            seed,
            captures: 0,
            next_sequence: 0,
            candidates: Vec::new(),
            current: BTreeMap::new(),
            last_top: Vec::new(),
            changed: false,
        }
    }

    /// Record `variable`'s value for the current bucket.
    pub fn add(&mut self, variable: VariableId, value: f64) {
        if value.is_finite() {
            self.current.insert(variable, value);
        }
    }

    /// Fold the current bucket's values into the candidate moments.
    pub fn capture(&mut self) {
        let current = std::mem::take(&mut self.current);

        for candidate in &mut self.candidates {
            let (a, b) = candidate.pair;
            if let (Some(&x), Some(&y)) = (current.get(&a), current.get(&b)) {
                candidate.moments.add_sample(x, y, 1.0);
            }
            candidate.moments.propagate_forwards_by_time(1.0);
        }

        let present: Vec<VariableId> = current.keys().copied().collect();
        self.propose(&present);
        self.evict();
        self.captures += 1;

        let top: Vec<_> = self
            .most_correlated(self.k)
            .into_iter()
            .map(|p| p.pair)
            .collect();
        if top != self.last_top {
            self.last_top = top;
            self.changed = true;
        }
    }

    fn propose(&mut self, present: &[VariableId]) {
        let n = present.len();
        if n < 2 {
            return;
        }
        let total = n * (n - 1) / 2;
        if total <= MAXIMUM_EXHAUSTIVE_PAIRS {
            for i in 0..n {
                for j in (i + 1)..n {
                    self.insert_candidate((present[i], present[j]));
                }
            }
            return;
        }
        let mut rng = StdRng::seed_from_u64(self.seed ^ self.captures.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let proposals = (self.capacity / 4).clamp(1, 1000);
        for _ in 0..proposals {
            let i = rng.gen_range(0..n);
            let j = rng.gen_range(0..n);
            if i != j {
                let (a, b) = (present[i.min(j)], present[i.max(j)]);
                self.insert_candidate((a, b));
            }
        }
    }

    fn insert_candidate(&mut self, pair: (VariableId, VariableId)) {
        if let Err(pos) = self.candidates.binary_search_by_key(&pair, |c| c.pair) {
            self.candidates.insert(
                pos,
                Candidate {
                    pair,
                    sequence: self.next_sequence,
                    moments: BivariatePrior::new(self.decay_rate),
                },
            );
            self.next_sequence += 1;
        }
    }

    fn evict(&mut self) {
        if self.candidates.len() <= self.capacity {
            return;
        }
        let mut order: Vec<(f64, u64, (VariableId, VariableId))> = self
            .candidates
            .iter()
            .map(|c| (c.rank_score(), c.sequence, c.pair))
            .collect();
        // Weakest first; among equals the newest goes first.
        order.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(Ordering::Equal)
                .then(b.1.cmp(&a.1))
        });
        let excess = self.candidates.len() - self.capacity;
        let mut doomed: Vec<_> = order.into_iter().take(excess).map(|(_, _, p)| p).collect();
        doomed.sort_unstable();
        self.candidates
            .retain(|c| doomed.binary_search(&c.pair).is_err());
    }

    /// Up to `n` mature pairs by decreasing absolute correlation, ties in
    /// arrival order.
    pub fn most_correlated(&self, n: usize) -> Vec<CorrelatedPair> {
        let mut pairs: Vec<CorrelatedPair> = self
            .candidates
            .iter()
            .filter(|c| c.is_mature())
            .map(|c| CorrelatedPair {
                pair: c.pair,
                coefficient: c.moments.correlation(),
                sequence: c.sequence,
            })
            .collect();
        pairs.sort_by(|a, b| {
            b.coefficient
                .abs()
                .partial_cmp(&a.coefficient.abs())
                .unwrap_or(Ordering::Equal)
                .then(a.sequence.cmp(&b.sequence))
        });
        pairs.truncate(n);
        pairs
    }

    /// Forget every pair involving one of `variables`.
    pub fn remove_variables(&mut self, variables: &[VariableId]) {
        let before = self.candidates.len();
        self.candidates
            .retain(|c| !variables.contains(&c.pair.0) && !variables.contains(&c.pair.1));
        for v in variables {
            self.current.remove(v);
        }
        if self.candidates.len() != before {
            self.last_top
                .retain(|(a, b)| !variables.contains(a) && !variables.contains(b));
            self.changed = true;
        }
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn mark_refreshed(&mut self) {
        self.changed = false;
    }

    pub fn set_k(&mut self, k: usize) {
        self.k = k;
        self.capacity = 2 * k + 16;
    }

    pub fn number_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.candidates.len() * std::mem::size_of::<Candidate>()
            + self.last_top.len() * std::mem::size_of::<(VariableId, VariableId)>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(i: u32) -> f64 {
        ((i * 7919) % 13) as f64
    }

    fn feed(structure: &mut KMostCorrelated, buckets: u32) {
        for i in 0..buckets {
            let x = (i % 5) as f64;
            structure.add(0, x);
            structure.add(1, 3.0 * x + 2.0);
            structure.add(2, noise(i));
            structure.capture();
        }
    }

    #[test]
    fn test_finds_correlated_pair() {
        let mut structure = KMostCorrelated::new(3, 0.001, 7);
        feed(&mut structure, 30);
        let top = structure.most_correlated(1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].pair, (0, 1));
        assert!((top[0].coefficient - 1.0).abs() < 1e-6);
        assert!(structure.changed());
    }

    #[test]
    fn test_changed_clears_when_ranking_is_stable() {
        let mut structure = KMostCorrelated::new(1, 0.001, 7);
        feed(&mut structure, 30);
        structure.mark_refreshed();
        structure.add(0, 1.0);
        structure.add(1, 5.0);
        structure.add(2, noise(30));
        structure.capture();
        assert_eq!(structure.most_correlated(1)[0].pair, (0, 1));
        assert!(!structure.changed());
    }

    #[test]
    fn test_remove_variables() {
        let mut structure = KMostCorrelated::new(3, 0.001, 7);
        feed(&mut structure, 30);
        structure.mark_refreshed();
        structure.remove_variables(&[1]);
        assert!(structure.changed());
        assert!(structure
            .most_correlated(10)
            .iter()
            .all(|p| p.pair.0 != 1 && p.pair.1 != 1));
    }

    #[test]
    fn test_capacity_is_bounded() {
        let mut structure = KMostCorrelated::new(2, 0.001, 1);
        for i in 0..5 {
            for v in 0..80u32 {
                structure.add(v, ((v * 31 + i) % 17) as f64);
            }
            structure.capture();
        }
        assert!(structure.number_candidates() <= 2 * 2 + 16);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut structure = KMostCorrelated::new(3, 0.001, 7);
        feed(&mut structure, 12);
        let json = serde_json::to_string(&structure).unwrap();
        let restored: KMostCorrelated = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, structure);
    }
}
