//! Sampling module
//!
//! Sample-size derivation for large file populations and uniform random
//! selection without replacement.
//!
//! The statistical mode solves Cochran's formula with the finite population
//! correction, using the maximum-variance assumption `p = q = 0.5`:
//!
//! ```text
//! n = ceil(Z²·p·q·N / (N·E² + Z²·p·q))
//! ```
//!
//! The result is floored at `min(30, N)`.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Z-scores for the supported confidence levels
pub const Z_SCORES: [(f64, f64); 3] = [(0.90, 1.645), (0.95, 1.96), (0.99, 2.576)];

/// Smallest sample drawn unless the population itself is smaller
pub const MIN_SAMPLE_SIZE: usize = 30;

/// Default confidence level
pub const DEFAULT_CONFIDENCE: f64 = 0.95;

/// Default margin of error
pub const DEFAULT_MARGIN_OF_ERROR: f64 = 0.05;

const PQ: f64 = 0.25;

/// Sampling error types
#[derive(Debug, Error, PartialEq)]
pub enum SamplingError {
    #[error("Confidence level must be between 0 and 1, got {0}")]
    InvalidConfidence(f64),

    #[error("Margin of error must be between 0 and 1, got {0}")]
    InvalidMargin(f64),

    #[error("Population size must be positive")]
    EmptyPopulation,

    #[error("Unsupported confidence level: {0}. Supported values are: 0.90, 0.95, 0.99")]
    UnsupportedConfidence(f64),

    #[error("Sample size must be positive")]
    EmptySample,

    #[error("Random sample size must be at least 1")]
    InvalidRandomN,
}

pub type Result<T> = std::result::Result<T, SamplingError>;

/// Validated inputs for the statistical sample size
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParameters {
    confidence_level: f64,
    margin_of_error: f64,
    population_size: usize,
}

impl SamplingParameters {
    pub fn new(confidence_level: f64, margin_of_error: f64, population_size: usize) -> Result<Self> {
        if !(confidence_level > 0.0 && confidence_level < 1.0) {
            return Err(SamplingError::InvalidConfidence(confidence_level));
        }
        if !(margin_of_error > 0.0 && margin_of_error < 1.0) {
            return Err(SamplingError::InvalidMargin(margin_of_error));
        }
        if population_size < 1 {
            return Err(SamplingError::EmptyPopulation);
        }

        Ok(Self {
            confidence_level,
            margin_of_error,
            population_size,
        })
    }

    pub fn confidence_level(&self) -> f64 {
        self.confidence_level
    }

    pub fn margin_of_error(&self) -> f64 {
        self.margin_of_error
    }

    pub fn population_size(&self) -> usize {
        self.population_size
    }
}

/// Stateless sampling calculator
pub struct SamplingCalculator;

impl SamplingCalculator {
    /// Look up the Z-score for a confidence level (no interpolation)
    pub fn z_score(confidence_level: f64) -> Result<f64> {
        Z_SCORES
            .iter()
            .find(|(level, _)| (level - confidence_level).abs() < 1e-9)
            .map(|(_, z)| *z)
            .ok_or(SamplingError::UnsupportedConfidence(confidence_level))
    }

    /// Required sample size for the given parameters
    pub fn sample_size(params: &SamplingParameters) -> Result<usize> {
        let z = Self::z_score(params.confidence_level)?;
        let n = params.population_size as f64;
        let z2pq = z * z * PQ;

        let numerator = z2pq * n;
        let denominator = n * params.margin_of_error.powi(2) + z2pq;
        let size = (numerator / denominator).ceil() as usize;

        Ok(size.max(MIN_SAMPLE_SIZE.min(params.population_size)))
    }

    /// Uniform selection of `n` items without replacement
    ///
    /// When `n` covers the whole population, the population is returned
    /// unchanged (input order). Otherwise the order of the selection is
    /// unspecified.
    pub fn select_random<T, R>(population: &[T], n: usize, rng: &mut R) -> Vec<T>
    where
        T: Clone,
        R: Rng + ?Sized,
    {
        if n >= population.len() {
            return population.to_vec();
        }
        population.choose_multiple(rng, n).cloned().collect()
    }

    /// Margin of error achieved by a sample, for reporting only
    pub fn estimate_margin_of_error(
        sample_size: usize,
        population_size: usize,
        confidence_level: f64,
    ) -> Result<f64> {
        let z = Self::z_score(confidence_level)?;
        if sample_size == 0 {
            return Err(SamplingError::EmptySample);
        }

        let n = sample_size as f64;
        let standard_error = (PQ / n).sqrt();
        let correction = if population_size > 1 {
            let big_n = population_size as f64;
            ((big_n - n).max(0.0) / (big_n - 1.0)).sqrt()
        } else {
            0.0
        };

        Ok(z * standard_error * correction)
    }
}

/// How the file population is reduced before analysis
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SamplingMode {
    /// Analyse every file
    #[default]
    None,
    /// Derive the sample size from confidence and margin of error
    Statistical {
        confidence_level: f64,
        margin_of_error: f64,
    },
    /// Draw a fixed number of files (capped at the population)
    RandomN { size: usize },
}

impl SamplingMode {
    /// Method name as stored in run metadata
    pub fn method_name(&self) -> &'static str {
        match self {
            SamplingMode::None => "none",
            SamplingMode::Statistical { .. } => "statistical",
            SamplingMode::RandomN { .. } => "random_n",
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, SamplingMode::None)
    }

    /// Validate mode parameters without a population
    pub fn validate(&self) -> Result<()> {
        match *self {
            SamplingMode::None => Ok(()),
            SamplingMode::Statistical {
                confidence_level,
                margin_of_error,
            } => {
                SamplingParameters::new(confidence_level, margin_of_error, 1)?;
                SamplingCalculator::z_score(confidence_level).map(|_| ())
            }
            SamplingMode::RandomN { size } => {
                if size == 0 {
                    Err(SamplingError::InvalidRandomN)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Reduce `population` according to the mode
    pub fn apply<T, R>(&self, population: &[T], rng: &mut R) -> Result<SamplingOutcome<T>>
    where
        T: Clone,
        R: Rng + ?Sized,
    {
        let total = population.len();
        let mut outcome = SamplingOutcome {
            selected: Vec::new(),
            population_size: total,
            sample_size: None,
            random_n_size: None,
            estimated_margin_of_error: None,
        };

        if total == 0 {
            return Ok(outcome);
        }

        match *self {
            SamplingMode::None => {
                outcome.selected = population.to_vec();
            }
            SamplingMode::Statistical {
                confidence_level,
                margin_of_error,
            } => {
                let params = SamplingParameters::new(confidence_level, margin_of_error, total)?;
                let n = SamplingCalculator::sample_size(&params)?;
                outcome.selected = SamplingCalculator::select_random(population, n, rng);
                outcome.sample_size = Some(outcome.selected.len());
                outcome.estimated_margin_of_error = Some(
                    SamplingCalculator::estimate_margin_of_error(
                        outcome.selected.len(),
                        total,
                        confidence_level,
                    )?,
                );
            }
            SamplingMode::RandomN { size } => {
                if size == 0 {
                    return Err(SamplingError::InvalidRandomN);
                }
                let n = size.min(total);
                outcome.selected = SamplingCalculator::select_random(population, n, rng);
                outcome.random_n_size = Some(n);
            }
        }

        Ok(outcome)
    }
}

/// Result of applying a [`SamplingMode`]
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingOutcome<T> {
    pub selected: Vec<T>,
    pub population_size: usize,
    /// Statistical mode only
    pub sample_size: Option<usize>,
    /// Random-N mode only, after capping
    pub random_n_size: Option<usize>,
    pub estimated_margin_of_error: Option<f64>,
}

/// RNG for sampling: seeded for reproducible runs, entropy otherwise
pub fn sampling_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn params(conf: f64, margin: f64, pop: usize) -> SamplingParameters {
        SamplingParameters::new(conf, margin, pop).unwrap()
    }

    #[test]
    fn test_parameter_validation() {
        assert!(SamplingParameters::new(0.95, 0.05, 1).is_ok());
        assert_eq!(
            SamplingParameters::new(1.0, 0.05, 10),
            Err(SamplingError::InvalidConfidence(1.0))
        );
        assert_eq!(
            SamplingParameters::new(0.0, 0.05, 10),
            Err(SamplingError::InvalidConfidence(0.0))
        );
        assert_eq!(
            SamplingParameters::new(0.95, 0.0, 10),
            Err(SamplingError::InvalidMargin(0.0))
        );
        assert_eq!(
            SamplingParameters::new(0.95, 1.5, 10),
            Err(SamplingError::InvalidMargin(1.5))
        );
        assert_eq!(
            SamplingParameters::new(0.95, 0.05, 0),
            Err(SamplingError::EmptyPopulation)
        );
    }

    #[test]
    fn test_z_scores() {
        assert_eq!(SamplingCalculator::z_score(0.90).unwrap(), 1.645);
        assert_eq!(SamplingCalculator::z_score(0.95).unwrap(), 1.96);
        assert_eq!(SamplingCalculator::z_score(0.99).unwrap(), 2.576);

        let err = SamplingCalculator::z_score(0.97).unwrap_err();
        assert_eq!(err, SamplingError::UnsupportedConfidence(0.97));
        assert!(err.to_string().contains("0.90, 0.95, 0.99"));
    }

    #[test]
    fn test_sample_size_reference_value() {
        // 500 files at 95% / 5%
        let n = SamplingCalculator::sample_size(&params(0.95, 0.05, 500)).unwrap();
        assert_eq!(n, 218);

        let exact = (1.96f64.powi(2) * 0.25 * 500.0) / (500.0 * 0.0025 + 1.96f64.powi(2) * 0.25);
        assert_eq!(n, exact.ceil() as usize);
    }

    #[test]
    fn test_sample_size_minimum_floor() {
        // Formula gives fewer than 30 for loose margins
        let n = SamplingCalculator::sample_size(&params(0.90, 0.5, 1000)).unwrap();
        assert_eq!(n, 30);

        // Small populations cap the floor
        let n = SamplingCalculator::sample_size(&params(0.90, 0.5, 12)).unwrap();
        assert!(n <= 12);
        let n = SamplingCalculator::sample_size(&params(0.95, 0.05, 1)).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_sample_size_monotonic_in_population() {
        let mut last = 0;
        for pop in (1..5000).step_by(37) {
            let n = SamplingCalculator::sample_size(&params(0.95, 0.05, pop)).unwrap();
            assert!(n >= last, "population {pop}: {n} < {last}");
            assert!(n <= pop);
            last = n;
        }
    }

    #[test]
    fn test_sample_size_monotonic_in_margin() {
        let mut last = 0;
        for margin in [0.5, 0.3, 0.2, 0.1, 0.05, 0.03, 0.01] {
            let n = SamplingCalculator::sample_size(&params(0.99, margin, 10_000)).unwrap();
            assert!(n >= last);
            last = n;
        }
    }

    #[test]
    fn test_select_random_full_population() {
        let pop: Vec<u32> = (0..20).collect();
        let mut rng = sampling_rng(Some(7));

        let all = SamplingCalculator::select_random(&pop, 20, &mut rng);
        assert_eq!(all, pop);

        let more = SamplingCalculator::select_random(&pop, 100, &mut rng);
        assert_eq!(more.len(), 20);
        let unique: HashSet<_> = more.iter().collect();
        assert_eq!(unique.len(), 20);
    }

    #[test]
    fn test_select_random_subset() {
        let pop: Vec<u32> = (0..500).collect();
        let mut rng = sampling_rng(Some(42));

        let picked = SamplingCalculator::select_random(&pop, 218, &mut rng);
        assert_eq!(picked.len(), 218);
        let unique: HashSet<_> = picked.iter().copied().collect();
        assert_eq!(unique.len(), 218);
        assert!(picked.iter().all(|v| pop.contains(v)));
    }

    #[test]
    fn test_seeded_selection_reproducible() {
        let pop: Vec<u32> = (0..1000).collect();
        let a = SamplingCalculator::select_random(&pop, 50, &mut sampling_rng(Some(3)));
        let b = SamplingCalculator::select_random(&pop, 50, &mut sampling_rng(Some(3)));
        assert_eq!(a, b);
    }

    #[test]
    fn test_estimate_margin_of_error() {
        let e = SamplingCalculator::estimate_margin_of_error(218, 500, 0.95).unwrap();
        assert!(e > 0.0 && e <= 0.05, "estimated margin {e}");

        // Census has no sampling error
        let e = SamplingCalculator::estimate_margin_of_error(500, 500, 0.95).unwrap();
        assert_eq!(e, 0.0);

        assert_eq!(
            SamplingCalculator::estimate_margin_of_error(0, 500, 0.95),
            Err(SamplingError::EmptySample)
        );
        assert!(SamplingCalculator::estimate_margin_of_error(1, 1, 0.95).is_ok());
    }

    #[test]
    fn test_mode_apply_statistical() {
        let pop: Vec<u32> = (0..500).collect();
        let mode = SamplingMode::Statistical {
            confidence_level: 0.95,
            margin_of_error: 0.05,
        };

        let outcome = mode.apply(&pop, &mut sampling_rng(Some(1))).unwrap();
        assert_eq!(outcome.population_size, 500);
        assert_eq!(outcome.sample_size, Some(218));
        assert_eq!(outcome.selected.len(), 218);
        assert!(outcome.estimated_margin_of_error.is_some());
        assert_eq!(outcome.random_n_size, None);
    }

    #[test]
    fn test_mode_apply_random_n_capped() {
        let pop: Vec<u32> = (0..10).collect();
        let outcome = SamplingMode::RandomN { size: 25 }
            .apply(&pop, &mut sampling_rng(None))
            .unwrap();
        assert_eq!(outcome.random_n_size, Some(10));
        assert_eq!(outcome.selected.len(), 10);

        let outcome = SamplingMode::RandomN { size: 4 }
            .apply(&pop, &mut sampling_rng(None))
            .unwrap();
        assert_eq!(outcome.selected.len(), 4);
    }

    #[test]
    fn test_mode_apply_empty_population() {
        let pop: Vec<u32> = Vec::new();
        let outcome = SamplingMode::Statistical {
            confidence_level: 0.95,
            margin_of_error: 0.05,
        }
        .apply(&pop, &mut sampling_rng(None))
        .unwrap();
        assert!(outcome.selected.is_empty());
        assert_eq!(outcome.population_size, 0);
    }

    #[test]
    fn test_mode_validate() {
        assert!(SamplingMode::None.validate().is_ok());
        assert_eq!(
            SamplingMode::RandomN { size: 0 }.validate(),
            Err(SamplingError::InvalidRandomN)
        );
        assert_eq!(
            SamplingMode::Statistical {
                confidence_level: 0.8,
                margin_of_error: 0.05
            }
            .validate(),
            Err(SamplingError::UnsupportedConfidence(0.8))
        );
        assert_eq!(SamplingMode::None.method_name(), "none");
        assert_eq!(SamplingMode::RandomN { size: 3 }.method_name(), "random_n");
    }
}
