//! Missing-value and noise model fitting
//!
//! A precursor at true log2 level `x` goes unquantified with probability
//!
//! ```text
//! P(missing | x) = pi + (1 - pi) * (1 - logistic((x - mu) / s))
//! ```
//!
//! and, when quantified, is observed as `y ~ Normal(x, sigma^2)`. The curve is
//! fitted per run by binomial maximum likelihood, falling back to a pooled
//! curve when a run carries too little evidence. Noise levels get a
//! scaled-inverse-chi-squared prior estimated from per-protein residual
//! variances.

use crate::consensus::FeatureMatrix;
use crate::optimize::NelderMead;
use crate::protein::ProteinGroup;
use crate::{stats, EpqError, EpqResult, MissingValuePrior, QuantConfig};

/// Minimum outcomes (observed + missing) for a dedicated per-run curve
pub const MIN_RUN_OBSERVATIONS: usize = 50;
/// Minimum count of each outcome kind for a dedicated per-run curve
pub const MIN_OUTCOME_COUNT: usize = 5;
/// Upper bound on the noise prior degrees of freedom
pub const MAX_PRIOR_DF: f64 = 100.0;

const MIN_INFORMATIVE_PROTEINS: usize = 3;
const DEFAULT_NOISE_VARIANCE: f64 = 0.25;
const MIN_PROBABILITY: f64 = 1e-12;
const TAU2_FLOOR: f64 = 0.0025;
const OMEGA2_RANGE: (f64, f64) = (0.25, 16.0);
const SCALE_RANGE: (f64, f64) = (0.05, 20.0);

/// Outcome of one feature in one run
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    Observed(f64),
    Missing,
}

/// Likelihood of a single observation given the feature's true level
pub trait ObservationModel: Send + Sync {
    /// Probability that a feature at true level `level` is not quantified
    fn p_missing(&self, level: f64) -> f64;

    fn ln_likelihood(&self, obs: Observation, level: f64, sigma: f64) -> f64 {
        match obs {
            Observation::Observed(y) => stats::normal_ln_pdf(y, level, sigma),
            Observation::Missing => self.p_missing(level).max(MIN_PROBABILITY).ln(),
        }
    }
}

/// Estimates an [`ObservationModel`] from `(level, missing)` outcomes
pub trait ModelFitter {
    type Model: ObservationModel + Clone;

    /// `None` when the data cannot support a fit
    fn fit(&self, outcomes: &[(f64, bool)]) -> Option<Self::Model>;

    /// Curve used when even the pooled fit fails
    fn fallback(&self, observed_levels: &[f64]) -> EpqResult<Self::Model>;
}

/// Logistic left-censoring with a level-independent random miss rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogisticCensoring {
    pub mu: f64,
    pub scale: f64,
    pub pi: f64,
}

impl ObservationModel for LogisticCensoring {
    fn p_missing(&self, level: f64) -> f64 {
        self.pi + (1.0 - self.pi) * (1.0 - stats::logistic((level - self.mu) / self.scale))
    }
}

pub struct LogisticFitter {
    regime: MissingValuePrior,
    optimizer: NelderMead,
}

impl LogisticFitter {
    pub fn new(regime: MissingValuePrior) -> Self {
        Self {
            regime,
            optimizer: NelderMead::default().max_iter(2000).tolerance(1e-9),
        }
    }

    /// Upper bound on the random miss rate
    pub fn max_pi(&self) -> f64 {
        match self.regime {
            MissingValuePrior::Default => 0.5,
            MissingValuePrior::Dia => 0.05,
        }
    }

    fn default_pi(&self) -> f64 {
        match self.regime {
            MissingValuePrior::Default => 0.1,
            MissingValuePrior::Dia => 0.01,
        }
    }
}

fn negative_log_likelihood(curve: &LogisticCensoring, outcomes: &[(f64, bool)]) -> f64 {
    outcomes
        .iter()
        .map(|&(level, missing)| {
            let p = curve
                .p_missing(level)
                .clamp(MIN_PROBABILITY, 1.0 - MIN_PROBABILITY);
            if missing {
                -p.ln()
            } else {
                -(1.0 - p).ln()
            }
        })
        .sum()
}

impl ModelFitter for LogisticFitter {
    type Model = LogisticCensoring;

    fn fit(&self, outcomes: &[(f64, bool)]) -> Option<LogisticCensoring> {
        let n_missing = outcomes.iter().filter(|o| o.1).count();
        if n_missing == 0 || n_missing == outcomes.len() {
            return None;
        }

        let levels: Vec<f64> = outcomes.iter().map(|o| o.0).collect();
        let lo = levels.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = levels.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let start_mu = stats::quantile(&levels, 0.1)?;
        let max_pi = self.max_pi();

        // Parameters: mu, ln(scale), pi
        let objective = |p: &[f64]| {
            let scale = p[1].exp();
            if !(0.0..=max_pi).contains(&p[2])
                || scale < SCALE_RANGE.0
                || scale > SCALE_RANGE.1
                || p[0] < lo - 10.0
                || p[0] > hi + 10.0
            {
                return f64::INFINITY;
            }
            let curve = LogisticCensoring {
                mu: p[0],
                scale,
                pi: p[2],
            };
            negative_log_likelihood(&curve, outcomes)
        };

        let min = self
            .optimizer
            .minimize(objective, &[start_mu, 0.0, 0.25 * max_pi]);

        if !min.converged || !min.value.is_finite() {
            return None;
        }
        Some(LogisticCensoring {
            mu: min.point[0],
            scale: min.point[1].exp(),
            pi: min.point[2],
        })
    }

    fn fallback(&self, observed_levels: &[f64]) -> EpqResult<LogisticCensoring> {
        let mu = stats::quantile(observed_levels, 0.05).ok_or_else(|| {
            EpqError::ModelFit("no observed intensities to anchor the detection curve".to_string())
        })?;
        Ok(LogisticCensoring {
            mu,
            scale: 1.0,
            pi: self.default_pi(),
        })
    }
}

/// Scaled-inverse-chi-squared prior on the per-protein noise variance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoisePrior {
    /// Prior scale s0^2
    pub variance: f64,
    /// Prior degrees of freedom d0
    pub df: f64,
}

impl NoisePrior {
    /// Unnormalized log density of `ln sigma` (prior on sigma^2 times the Jacobian)
    pub fn ln_density_log_sigma(&self, sigma: f64) -> f64 {
        let s2 = sigma * sigma;
        -0.5 * self.df * s2.ln() - 0.5 * self.df * self.variance / s2
    }

    /// Moment-match a prior to `(variance, df)` pairs on the log scale
    pub fn fit(samples: &[(f64, f64)]) -> NoisePrior {
        let informative: Vec<(f64, f64)> = samples
            .iter()
            .copied()
            .filter(|&(s2, df)| s2 > 1e-12 && s2.is_finite() && df >= 1.0)
            .collect();

        if informative.len() < MIN_INFORMATIVE_PROTEINS {
            let total_df: f64 = informative.iter().map(|s| s.1).sum();
            if total_df < 1.0 {
                log::warn!(
                    "No residual variance available, using default noise variance {}",
                    DEFAULT_NOISE_VARIANCE
                );
                return NoisePrior {
                    variance: DEFAULT_NOISE_VARIANCE,
                    df: 1.0,
                };
            }
            let pooled = informative.iter().map(|(s2, df)| s2 * df).sum::<f64>() / total_df;
            log::warn!(
                "Only {} informative proteins, using pooled noise variance {:.4}",
                informative.len(),
                pooled
            );
            return NoisePrior {
                variance: pooled,
                df: total_df.min(MAX_PRIOR_DF),
            };
        }

        let n = informative.len() as f64;
        let e: Vec<f64> = informative
            .iter()
            .map(|&(s2, df)| s2.ln() - stats::digamma(0.5 * df) + (0.5 * df).ln())
            .collect();
        let emean = stats::mean(&e);
        let evar = e.iter().map(|x| (x - emean).powi(2)).sum::<f64>() / (n - 1.0)
            - informative
                .iter()
                .map(|&(_, df)| stats::trigamma(0.5 * df))
                .sum::<f64>()
                / n;

        let df = if evar > 0.0 {
            (2.0 * stats::trigamma_inverse(evar)).min(MAX_PRIOR_DF)
        } else {
            MAX_PRIOR_DF
        };
        let variance = (emean + stats::digamma(0.5 * df) - (0.5 * df).ln()).exp();

        NoisePrior { variance, df }
    }
}

/// Residual variance and degrees of freedom of a protein's two-way
/// (feature + run) decomposition of its observed values
pub fn residual_variance(group: &ProteinGroup, matrix: &FeatureMatrix) -> Option<(f64, f64)> {
    const SWEEPS: usize = 10;
    let n_runs = matrix.experiment.num_runs();
    let rows: Vec<&[Option<f64>]> = group
        .features
        .iter()
        .map(|&f| matrix.features[f].levels.as_slice())
        .filter(|l| l.iter().flatten().count() > 0)
        .collect();

    let n_obs: usize = rows.iter().map(|l| l.iter().flatten().count()).sum();
    let runs_used = (0..n_runs)
        .filter(|&r| rows.iter().any(|l| l[r].is_some()))
        .count();
    let df = n_obs as f64 - rows.len() as f64 - runs_used as f64 + 1.0;
    if df < 1.0 {
        return None;
    }

    let mut feature_effect = vec![0.0; rows.len()];
    let mut run_effect = vec![0.0; n_runs];
    for _ in 0..SWEEPS {
        for (j, levels) in rows.iter().enumerate() {
            let d: Vec<f64> = levels
                .iter()
                .enumerate()
                .filter_map(|(r, l)| l.map(|y| y - run_effect[r]))
                .collect();
            feature_effect[j] = stats::mean(&d);
        }
        for (r, effect) in run_effect.iter_mut().enumerate() {
            let d: Vec<f64> = rows
                .iter()
                .enumerate()
                .filter_map(|(j, l)| l[r].map(|y| y - feature_effect[j]))
                .collect();
            *effect = if d.is_empty() { 0.0 } else { stats::mean(&d) };
        }
    }

    let rss: f64 = rows
        .iter()
        .enumerate()
        .flat_map(|(j, levels)| {
            let fe = feature_effect[j];
            let re = &run_effect;
            levels
                .iter()
                .enumerate()
                .filter_map(move |(r, l)| l.map(|y| (y - fe - re[r]).powi(2)))
        })
        .sum();

    Some((rss / df, df))
}

/// Run-level abundance estimates of a protein: per run the mean deviation of
/// its observed features from their reference levels
pub fn run_estimates(group: &ProteinGroup, matrix: &FeatureMatrix) -> Vec<Option<(f64, usize)>> {
    let n_runs = matrix.experiment.num_runs();
    let mut sums = vec![(0.0, 0usize); n_runs];
    for &f in &group.features {
        let feature = &matrix.features[f];
        let Some(reference) = feature.mean_level() else {
            continue;
        };
        for (r, level) in feature.levels.iter().enumerate() {
            if let Some(y) = level {
                sums[r].0 += y - reference;
                sums[r].1 += 1;
            }
        }
    }
    sums.into_iter()
        .map(|(s, n)| if n > 0 { Some((s / n as f64, n)) } else { None })
        .collect()
}

/// Everything fitted once per dataset and shared read-only by all workers
#[derive(Debug, Clone)]
pub struct FittedModel<M: ObservationModel = LogisticCensoring> {
    pub run_curves: Vec<M>,
    /// Whether each run fell back to the pooled curve
    pub run_fallback: Vec<bool>,
    pub global: M,
    pub noise: NoisePrior,
    /// Variance of run abundances around their group mean
    pub tau2: f64,
    /// Prior variance of group means
    pub omega2: f64,
}

impl<M: ObservationModel> FittedModel<M> {
    pub fn curve(&self, run: usize) -> &M {
        &self.run_curves[run]
    }
}

fn detection_outcomes(matrix: &FeatureMatrix) -> Vec<Vec<(f64, bool)>> {
    let mut per_run = vec![Vec::new(); matrix.experiment.num_runs()];
    for f in &matrix.features {
        let Some(reference) = f.mean_level() else {
            continue;
        };
        for (r, level) in f.levels.iter().enumerate() {
            per_run[r].push((reference, level.is_none()));
        }
    }
    per_run
}

/// Fit the detection curves with the given fitter
pub fn fit_detection<F: ModelFitter>(
    matrix: &FeatureMatrix,
    fitter: &F,
) -> EpqResult<(Vec<F::Model>, Vec<bool>, F::Model)> {
    let per_run = detection_outcomes(matrix);
    let pooled: Vec<(f64, bool)> = per_run.iter().flatten().copied().collect();

    let global = match fitter.fit(&pooled) {
        Some(curve) => curve,
        None => {
            log::warn!("Pooled detection curve fit failed, using the regime default");
            let observed: Vec<f64> = matrix
                .features
                .iter()
                .flat_map(|f| f.observed_levels())
                .collect();
            fitter.fallback(&observed)?
        }
    };

    let mut curves = Vec::with_capacity(per_run.len());
    let mut fallback = Vec::with_capacity(per_run.len());
    for (r, outcomes) in per_run.iter().enumerate() {
        let missing = outcomes.iter().filter(|o| o.1).count();
        let enough = outcomes.len() >= MIN_RUN_OBSERVATIONS
            && missing >= MIN_OUTCOME_COUNT
            && outcomes.len() - missing >= MIN_OUTCOME_COUNT;

        match enough.then(|| fitter.fit(outcomes)).flatten() {
            Some(curve) => {
                curves.push(curve);
                fallback.push(false);
            }
            None => {
                log::info!(
                    "Run {} uses the pooled detection curve ({} outcomes, {} missing)",
                    matrix.experiment.runs[r],
                    outcomes.len(),
                    missing
                );
                curves.push(global.clone());
                fallback.push(true);
            }
        }
    }

    Ok((curves, fallback, global))
}

/// Within-condition variance of run estimates beyond the measurement noise,
/// and the spread of condition means
fn fit_run_variances(groups: &[ProteinGroup], matrix: &FeatureMatrix, noise: &NoisePrior) -> (f64, f64) {
    let experiment = &matrix.experiment;
    let mut excess = Vec::new();
    let mut squared_means = Vec::new();

    for group in groups {
        let estimates = run_estimates(group, matrix);
        let (s2, _) = residual_variance(group, matrix).unwrap_or((noise.variance, 0.0));

        let mut within = Vec::new();
        let mut measurement = Vec::new();
        for c in 0..experiment.conditions.len() {
            let values: Vec<(f64, usize)> = experiment
                .runs_in(c)
                .filter_map(|r| estimates[r])
                .collect();
            if values.is_empty() {
                continue;
            }
            let means: Vec<f64> = values.iter().map(|v| v.0).collect();
            squared_means.push(stats::mean(&means).powi(2));
            if values.len() >= 2 {
                within.push(stats::variance(&means));
                measurement.extend(values.iter().map(|&(_, n)| s2 / n as f64));
            }
        }

        if !within.is_empty() {
            excess.push(stats::mean(&within) - stats::mean(&measurement));
        }
    }

    let tau2 = stats::median(&excess).unwrap_or(0.0).max(TAU2_FLOOR);
    let omega2 = stats::mean(&squared_means);
    let omega2 = if omega2.is_finite() {
        omega2.clamp(OMEGA2_RANGE.0, OMEGA2_RANGE.1)
    } else {
        OMEGA2_RANGE.0
    };
    (tau2, omega2)
}

/// Fit the complete model from the retained proteins (targets and decoys)
pub fn fit_model(
    matrix: &FeatureMatrix,
    groups: &[ProteinGroup],
    config: &QuantConfig,
) -> EpqResult<FittedModel> {
    let fitter = LogisticFitter::new(config.missing_value_prior);
    let (run_curves, run_fallback, global) = fit_detection(matrix, &fitter)?;
    log::info!(
        "Detection curve: mu={:.3} s={:.3} pi={:.4}",
        global.mu,
        global.scale,
        global.pi
    );

    let samples: Vec<(f64, f64)> = groups
        .iter()
        .filter_map(|g| residual_variance(g, matrix))
        .collect();
    let noise = NoisePrior::fit(&samples);
    log::info!(
        "Noise prior: s0^2={:.4} d0={:.2} from {} proteins",
        noise.variance,
        noise.df,
        samples.len()
    );

    let (tau2, omega2) = fit_run_variances(groups, matrix, &noise);
    log::info!("Run variance tau^2={:.4}, group prior omega^2={:.4}", tau2, omega2);

    Ok(FittedModel {
        run_curves,
        run_fallback,
        global,
        noise,
        tau2,
        omega2,
    })
}
