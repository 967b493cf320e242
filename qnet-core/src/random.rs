//! Random source and the sampling primitives built on it.
//!
//! Every stochastic decision in the kernel goes through [`RandomSource::raw`]
//! so a run is reproducible from its seed. The helpers here (inverse-CDF
//! sampling, Durstenfeld shuffle, reservoir sampling) consume exactly one
//! raw draw per elementary choice.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Stream of uniform variates in `[0, 1)`.
pub trait RandomSource {
    fn raw(&mut self) -> f64;
}

/// Seeded ChaCha8 generator used for reproducible runs.
#[derive(Debug, Clone)]
pub struct DeterministicRng {
    rng: ChaCha8Rng,
    seed: u64,
}

impl DeterministicRng {
    /// Creates deterministic RNG from seed value.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            seed,
        }
    }

    /// Returns the seed used for this RNG.
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl RandomSource for DeterministicRng {
    fn raw(&mut self) -> f64 {
        // 53 high bits give an exact double in [0, 1).
        (self.rng.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }
}

/// Replays a fixed list of variates, cycling when exhausted.
///
/// Used by tests that need bit-exact control over each decision.
#[derive(Debug, Clone)]
pub struct SequenceRandom {
    values: Vec<f64>,
    cursor: usize,
}

impl SequenceRandom {
    pub fn new(values: Vec<f64>) -> Self {
        assert!(!values.is_empty(), "SequenceRandom needs at least one value");
        Self { values, cursor: 0 }
    }

    /// Number of values handed out so far.
    pub fn consumed(&self) -> usize {
        self.cursor
    }
}

impl RandomSource for SequenceRandom {
    fn raw(&mut self) -> f64 {
        let value = self.values[self.cursor % self.values.len()];
        self.cursor += 1;
        value
    }
}

/// Uniform index in `0..len`. Returns 0 for an empty range.
pub fn uniform_index(rng: &mut dyn RandomSource, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    ((rng.raw() * len as f64) as usize).min(len - 1)
}

/// Samples an index from a probability vector by inverse CDF.
///
/// Zero-probability entries are never returned. Returns `None` when every
/// entry is zero.
pub fn sample_index(rng: &mut dyn RandomSource, probabilities: &[f64]) -> Option<usize> {
    let total: f64 = probabilities.iter().sum();
    if total <= 0.0 {
        return None;
    }
    let target = rng.raw() * total;
    let mut cumulative = 0.0;
    let mut last_positive = None;
    for (i, p) in probabilities.iter().enumerate() {
        if *p <= 0.0 {
            continue;
        }
        cumulative += p;
        last_positive = Some(i);
        if target < cumulative {
            return Some(i);
        }
    }
    // Rounding can leave target == total.
    last_positive
}

/// In-place Durstenfeld shuffle.
pub fn shuffle<T>(rng: &mut dyn RandomSource, items: &mut [T]) {
    for i in (1..items.len()).rev() {
        let j = uniform_index(rng, i + 1);
        items.swap(i, j);
    }
}

/// Picks `k` items uniformly without replacement (Algorithm R).
///
/// Selected items keep their reservoir order; callers that need an unbiased
/// order shuffle the result.
pub fn reservoir_sample<T: Clone>(rng: &mut dyn RandomSource, items: &[T], k: usize) -> Vec<T> {
    if k >= items.len() {
        return items.to_vec();
    }
    let mut reservoir: Vec<T> = items[..k].to_vec();
    for (i, item) in items.iter().enumerate().skip(k) {
        let j = uniform_index(rng, i + 1);
        if j < k {
            reservoir[j] = item.clone();
        }
    }
    reservoir
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_rng_reproducibility() {
        let mut rng1 = DeterministicRng::from_seed(12345);
        let mut rng2 = DeterministicRng::from_seed(12345);

        let values1: Vec<f64> = (0..10).map(|_| rng1.raw()).collect();
        let values2: Vec<f64> = (0..10).map(|_| rng2.raw()).collect();

        assert_eq!(values1, values2);
        assert!(values1.iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn test_sample_index_skips_zero_probabilities() {
        let mut rng = SequenceRandom::new(vec![0.0, 0.49, 0.5, 0.99]);
        let probabilities = [0.0, 0.5, 0.0, 0.5];

        let picks: Vec<_> = (0..4)
            .map(|_| sample_index(&mut rng, &probabilities).unwrap())
            .collect();
        assert_eq!(picks, vec![1, 1, 3, 3]);
    }

    #[test]
    fn test_sample_index_all_zero_is_none() {
        let mut rng = SequenceRandom::new(vec![0.3]);
        assert_eq!(sample_index(&mut rng, &[0.0, 0.0]), None);
    }

    #[test]
    fn test_shuffle_is_a_permutation() {
        let mut rng = DeterministicRng::from_seed(42);
        let mut data: Vec<u32> = (0..20).collect();
        shuffle(&mut rng, &mut data);

        let mut sorted = data.clone();
        sorted.sort();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
        assert_ne!(data, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_reservoir_sample_size_and_membership() {
        let mut rng = DeterministicRng::from_seed(7);
        let items: Vec<u32> = (0..50).collect();
        let picked = reservoir_sample(&mut rng, &items, 5);

        assert_eq!(picked.len(), 5);
        assert!(picked.iter().all(|p| items.contains(p)));

        let mut unique = picked.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 5);
    }

    #[test]
    fn test_reservoir_sample_keeps_everything_when_k_large() {
        let mut rng = SequenceRandom::new(vec![0.5]);
        assert_eq!(reservoir_sample(&mut rng, &[1, 2, 3], 5), vec![1, 2, 3]);
        assert_eq!(rng.consumed(), 0);
    }
}
