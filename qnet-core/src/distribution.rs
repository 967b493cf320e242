//! Service, interarrival and timing strategies.
//!
//! Every variate is produced by inverse-CDF transforms of `raw()` draws.

use std::fmt;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::random::{sample_index, RandomSource};

/// Tolerance used when checking that probability vectors sum to one.
pub const PROBABILITY_TOLERANCE: f64 = 1e-9;

/// Pluggable delay generator.
///
/// `population` is the number of jobs resident at the calling station,
/// used by load-dependent strategies and ignored by the others.
pub trait ServiceStrategy: Send + Sync {
    fn wait(&self, rng: &mut dyn RandomSource, population: usize) -> f64;

    /// Mean delay, used by policies that rank servers by expected time.
    fn expect(&self, population: usize) -> f64;
}

/// Built-in delay distributions.
#[derive(Clone)]
pub enum Distribution {
    Deterministic(f64),
    Exponential { rate: f64 },
    Uniform { min: f64, max: f64 },
    Erlang { phases: u32, rate: f64 },
    HyperExponential { p: f64, rate1: f64, rate2: f64 },
    Empirical { values: Vec<f64>, probabilities: Vec<f64> },
    /// Distribution selected by resident population; each entry applies from
    /// its population threshold upwards.
    LoadDependent(Vec<(usize, Distribution)>),
    Custom(Arc<dyn ServiceStrategy>),
}

impl fmt::Debug for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribution::Deterministic(v) => write!(f, "Deterministic({v})"),
            Distribution::Exponential { rate } => write!(f, "Exponential(rate={rate})"),
            Distribution::Uniform { min, max } => write!(f, "Uniform({min}, {max})"),
            Distribution::Erlang { phases, rate } => write!(f, "Erlang({phases}, {rate})"),
            Distribution::HyperExponential { p, rate1, rate2 } => {
                write!(f, "HyperExponential({p}, {rate1}, {rate2})")
            }
            Distribution::Empirical { values, .. } => write!(f, "Empirical({} points)", values.len()),
            Distribution::LoadDependent(ranges) => write!(f, "LoadDependent({} ranges)", ranges.len()),
            Distribution::Custom(_) => write!(f, "Custom"),
        }
    }
}

impl Distribution {
    /// Exponential distribution with the given mean.
    pub fn exponential_mean(mean: f64) -> Self {
        Distribution::Exponential { rate: 1.0 / mean }
    }

    /// Checks parameters for validity.
    ///
    /// # Errors
    ///
    /// - `ConfigError::InvalidDistribution` - Non-positive rates or inverted bounds
    /// - `ConfigError::InvalidProbabilities` - Empirical weights not summing to one
    /// - `ConfigError::LoadDependentTable` - Empty, unsorted or uncovered population ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::InvalidDistribution { reason });
        match self {
            Distribution::Deterministic(v) if *v < 0.0 || !v.is_finite() => {
                invalid(format!("deterministic delay {v} must be finite and non-negative"))
            }
            Distribution::Exponential { rate } | Distribution::Erlang { rate, .. }
                if *rate <= 0.0 || !rate.is_finite() =>
            {
                invalid(format!("rate {rate} must be positive"))
            }
            Distribution::Erlang { phases: 0, .. } => invalid("Erlang needs at least one phase".into()),
            Distribution::Uniform { min, max } if min < &0.0 || max < min => {
                invalid(format!("uniform bounds [{min}, {max}] are invalid"))
            }
            Distribution::HyperExponential { p, rate1, rate2 } => {
                if !(0.0..=1.0).contains(p) || *rate1 <= 0.0 || *rate2 <= 0.0 {
                    return invalid(format!("hyper-exponential ({p}, {rate1}, {rate2}) is invalid"));
                }
                Ok(())
            }
            Distribution::Empirical { values, probabilities } => {
                if values.is_empty() || values.len() != probabilities.len() {
                    return invalid("empirical values and probabilities must align".into());
                }
                if values.iter().any(|v| *v < 0.0) {
                    return invalid("empirical values must be non-negative".into());
                }
                check_probabilities("empirical distribution", probabilities)
            }
            Distribution::LoadDependent(ranges) => {
                let sorted = ranges.windows(2).all(|w| w[0].0 < w[1].0);
                if ranges.is_empty() || !sorted || ranges[0].0 > 1 {
                    return Err(ConfigError::LoadDependentTable {
                        context: "service distribution".into(),
                    });
                }
                ranges.iter().try_for_each(|(_, d)| d.validate())
            }
            _ => Ok(()),
        }
    }

    fn select_range(ranges: &[(usize, Distribution)], population: usize) -> &Distribution {
        let idx = ranges
            .partition_point(|(from, _)| *from <= population)
            .saturating_sub(1);
        &ranges[idx].1
    }
}

impl ServiceStrategy for Distribution {
    fn wait(&self, rng: &mut dyn RandomSource, population: usize) -> f64 {
        match self {
            Distribution::Deterministic(v) => *v,
            Distribution::Exponential { rate } => -(1.0 - rng.raw()).ln() / rate,
            Distribution::Uniform { min, max } => min + rng.raw() * (max - min),
            Distribution::Erlang { phases, rate } => {
                let product: f64 = (0..*phases).map(|_| 1.0 - rng.raw()).product();
                -product.ln() / rate
            }
            Distribution::HyperExponential { p, rate1, rate2 } => {
                let rate = if rng.raw() < *p { rate1 } else { rate2 };
                -(1.0 - rng.raw()).ln() / rate
            }
            Distribution::Empirical { values, probabilities } => {
                sample_index(rng, probabilities).map_or(0.0, |i| values[i])
            }
            Distribution::LoadDependent(ranges) => {
                Self::select_range(ranges, population).wait(rng, population)
            }
            Distribution::Custom(strategy) => strategy.wait(rng, population),
        }
    }

    fn expect(&self, population: usize) -> f64 {
        match self {
            Distribution::Deterministic(v) => *v,
            Distribution::Exponential { rate } => 1.0 / rate,
            Distribution::Uniform { min, max } => (min + max) / 2.0,
            Distribution::Erlang { phases, rate } => *phases as f64 / rate,
            Distribution::HyperExponential { p, rate1, rate2 } => p / rate1 + (1.0 - p) / rate2,
            Distribution::Empirical { values, probabilities } => {
                values.iter().zip(probabilities).map(|(v, p)| v * p).sum()
            }
            Distribution::LoadDependent(ranges) => {
                Self::select_range(ranges, population).expect(population)
            }
            Distribution::Custom(strategy) => strategy.expect(population),
        }
    }
}

/// Checks that a probability vector is non-negative and sums to one.
///
/// # Errors
///
/// - `ConfigError::InvalidProbabilities` - If the vector is invalid
pub fn check_probabilities(context: &str, probabilities: &[f64]) -> Result<(), ConfigError> {
    let sum: f64 = probabilities.iter().sum();
    if probabilities.iter().any(|p| *p < 0.0) || (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
        return Err(ConfigError::InvalidProbabilities {
            context: context.to_string(),
            sum,
        });
    }
    Ok(())
}

/// Builds a Zipf popularity vector over `items` ranks with exponent `alpha`.
pub fn zipf(items: usize, alpha: f64) -> Vec<f64> {
    let weights: Vec<f64> = (1..=items).map(|k| 1.0 / (k as f64).powf(alpha)).collect();
    let total: f64 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::SequenceRandom;

    #[test]
    fn test_exponential_inverse_cdf() {
        let mut rng = SequenceRandom::new(vec![0.5]);
        let d = Distribution::Exponential { rate: 2.0 };
        let expected = -(0.5f64).ln() / 2.0;
        assert!((d.wait(&mut rng, 1) - expected).abs() < 1e-12);
        assert_eq!(d.expect(1), 0.5);
    }

    #[test]
    fn test_load_dependent_selects_by_population() {
        let d = Distribution::LoadDependent(vec![
            (1, Distribution::Deterministic(1.0)),
            (3, Distribution::Deterministic(5.0)),
        ]);
        let mut rng = SequenceRandom::new(vec![0.1]);
        assert_eq!(d.wait(&mut rng, 1), 1.0);
        assert_eq!(d.wait(&mut rng, 2), 1.0);
        assert_eq!(d.wait(&mut rng, 3), 5.0);
        assert_eq!(d.expect(10), 5.0);
        assert!(d.validate().is_ok());
    }

    #[test]
    fn test_load_dependent_must_cover_first_job() {
        let d = Distribution::LoadDependent(vec![(2, Distribution::Deterministic(1.0))]);
        assert!(matches!(d.validate(), Err(ConfigError::LoadDependentTable { .. })));
    }

    #[test]
    fn test_empirical_probabilities_checked() {
        let d = Distribution::Empirical {
            values: vec![1.0, 2.0],
            probabilities: vec![0.5, 0.6],
        };
        assert!(matches!(d.validate(), Err(ConfigError::InvalidProbabilities { .. })));
    }

    #[test]
    fn test_zipf_is_normalized_and_decreasing() {
        let p = zipf(5, 1.0);
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(p.windows(2).all(|w| w[0] > w[1]));
    }
}
