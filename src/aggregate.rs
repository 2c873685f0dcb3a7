//! Peptide-to-protein aggregation: per-run likelihood of a protein's abundance

use crate::consensus::FeatureMatrix;
use crate::model::{NoisePrior, Observation, ObservationModel};
use crate::posterior::Grid;
use crate::protein::ProteinGroup;
use crate::stats;
use std::f64::consts::PI;

/// Log-spaced noise levels with their prior weights
#[derive(Debug, Clone, PartialEq)]
pub struct SigmaGrid {
    pub sigmas: Vec<f64>,
    /// Normalized log prior weight of each level
    pub ln_prior: Vec<f64>,
}

impl SigmaGrid {
    pub const POINTS: usize = 24;
    const RANGE_FACTOR: f64 = 30.0;
    const BOUNDS: (f64, f64) = (0.005, 10.0);

    pub fn from_prior(prior: &NoisePrior) -> Self {
        let s0 = prior.variance.sqrt();
        let lo = (s0 / Self::RANGE_FACTOR).max(Self::BOUNDS.0);
        let hi = (s0 * Self::RANGE_FACTOR).min(Self::BOUNDS.1).max(2.0 * lo);

        let (ln_lo, ln_hi) = (lo.ln(), hi.ln());
        let sigmas: Vec<f64> = (0..Self::POINTS)
            .map(|k| (ln_lo + (ln_hi - ln_lo) * k as f64 / (Self::POINTS - 1) as f64).exp())
            .collect();

        // Uniform spacing in ln(sigma), so the Jacobian is folded into the density
        let raw: Vec<f64> = sigmas
            .iter()
            .map(|&s| prior.ln_density_log_sigma(s))
            .collect();
        let norm = stats::log_sum_exp(&raw);
        let ln_prior = raw.iter().map(|w| w - norm).collect();

        SigmaGrid { sigmas, ln_prior }
    }

    pub fn len(&self) -> usize {
        self.sigmas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sigmas.is_empty()
    }
}

/// The evidence a protein has in every run, centered on feature reference levels
#[derive(Debug, Clone)]
pub struct ProteinLikelihood {
    pub protein: String,
    pub is_decoy: bool,
    pub peptides: Vec<String>,
    /// Per run: observed deviations `y - m` of the protein's features
    pub deviations: Vec<Vec<f64>>,
    /// Per run: reference levels `m` of the features that were not quantified
    pub missing_levels: Vec<Vec<f64>>,
}

impl ProteinLikelihood {
    pub fn build(group: &ProteinGroup, matrix: &FeatureMatrix) -> Self {
        let n_runs = matrix.experiment.num_runs();
        let mut deviations = vec![Vec::new(); n_runs];
        let mut missing_levels = vec![Vec::new(); n_runs];

        for &f in &group.features {
            let feature = &matrix.features[f];
            let Some(reference) = feature.mean_level() else {
                continue;
            };
            for (r, level) in feature.levels.iter().enumerate() {
                match level {
                    Some(y) => deviations[r].push(y - reference),
                    None => missing_levels[r].push(reference),
                }
            }
        }

        ProteinLikelihood {
            protein: group.protein.clone(),
            is_decoy: group.is_decoy,
            peptides: group.peptides(matrix),
            deviations,
            missing_levels,
        }
    }

    pub fn num_runs(&self) -> usize {
        self.deviations.len()
    }

    pub fn observed(&self) -> usize {
        self.deviations.iter().map(Vec::len).sum()
    }

    /// Mean deviation in a run, `None` without observations
    pub fn run_estimate(&self, run: usize) -> Option<f64> {
        let d = &self.deviations[run];
        (!d.is_empty()).then(|| stats::mean(d))
    }

    /// Gaussian terms of the observed features on the abundance grid
    pub fn observation_terms(&self, run: usize, sigma: f64, grid: &Grid) -> Vec<f64> {
        let d = &self.deviations[run];
        if d.is_empty() {
            return vec![0.0; grid.len];
        }
        // Sum of normal log densities reduces to sufficient statistics
        let n = d.len() as f64;
        let s1: f64 = d.iter().sum();
        let s2: f64 = d.iter().map(|x| x * x).sum();
        let constant = -n * sigma.ln() - 0.5 * n * (2.0 * PI).ln();
        let inv = 1.0 / (2.0 * sigma * sigma);

        grid.values()
            .map(|a| constant - (s2 - 2.0 * a * s1 + n * a * a) * inv)
            .collect()
    }

    /// Detection-curve terms of the missing features on the abundance grid
    pub fn censoring_terms<M: ObservationModel>(&self, run: usize, curve: &M, grid: &Grid) -> Vec<f64> {
        let missing = &self.missing_levels[run];
        grid.values()
            .map(|a| {
                missing
                    .iter()
                    .map(|m| curve.ln_likelihood(Observation::Missing, m + a, 1.0))
                    .sum::<f64>()
            })
            .collect()
    }

    /// Full log likelihood of the run abundance on the grid for one noise
    /// level, given the run's precomputed [`censoring_terms`](Self::censoring_terms)
    pub fn ln_run_likelihood(&self, run: usize, sigma: f64, censoring: &[f64], grid: &Grid) -> Vec<f64> {
        let mut terms = self.observation_terms(run, sigma, grid);
        for (t, c) in terms.iter_mut().zip(censoring) {
            *t += c;
        }
        terms
    }
}
