//! Posterior inference on protein abundance, group means and fold changes
//!
//! Inference for a protein moves through distinct stages, each consuming the
//! previous one:
//!
//! [`ProteinLikelihood`] -> [`GroupPosteriors`] -> [`FoldChange`] -> [`Scored`]
//!
//! A failure at any stage is reported as a [`FailureReason`] and the protein
//! leaves the pipeline.

use crate::aggregate::{ProteinLikelihood, SigmaGrid};
use crate::input::Experiment;
use crate::model::{FittedModel, ObservationModel};
use crate::protein::{Diagnostic, DiagnosticStatus};
use crate::stats;

/// Regular grid on the log2 scale
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid {
    pub min: f64,
    pub step: f64,
    pub len: usize,
}

impl Grid {
    /// Run and group abundances relative to the feature references
    pub const ABUNDANCE: Grid = Grid {
        min: -16.0,
        step: 0.05,
        len: 641,
    };

    /// Differences of two abundance grid points; `len` is `2 * ABUNDANCE.len - 1`
    pub const FOLD_CHANGE: Grid = Grid {
        min: -32.0,
        step: 0.05,
        len: 1281,
    };

    #[inline]
    pub fn value(&self, i: usize) -> f64 {
        self.min + i as f64 * self.step
    }

    pub fn values(&self) -> impl Iterator<Item = f64> {
        let grid = *self;
        (0..grid.len).map(move |i| grid.value(i))
    }

    pub fn nearest(&self, x: f64) -> usize {
        let i = ((x - self.min) / self.step).round();
        i.clamp(0.0, (self.len - 1) as f64) as usize
    }
}

/// A normalized discrete distribution on a [`Grid`]
#[derive(Debug, Clone, PartialEq)]
pub struct Posterior {
    pub grid: Grid,
    pub probs: Vec<f64>,
}

impl Posterior {
    /// Normalize unnormalized log weights; `None` if they carry no finite mass
    pub fn from_ln_weights(grid: Grid, ln_weights: &[f64]) -> Option<Self> {
        let norm = stats::log_sum_exp(ln_weights);
        if !norm.is_finite() {
            return None;
        }
        Some(Posterior {
            grid,
            probs: ln_weights.iter().map(|w| (w - norm).exp()).collect(),
        })
    }

    pub fn from_probs(grid: Grid, mut probs: Vec<f64>) -> Option<Self> {
        let total: f64 = probs.iter().sum();
        if !total.is_finite() || total <= 0.0 {
            return None;
        }
        probs.iter_mut().for_each(|p| *p /= total);
        Some(Posterior { grid, probs })
    }

    /// Student-t distribution discretized by integrating over each grid bin
    pub fn student_t(grid: Grid, location: f64, scale: f64, df: f64) -> Self {
        let h = 0.5 * grid.step;
        let probs: Vec<f64> = grid
            .values()
            .map(|v| {
                stats::student_t_cdf((v + h - location) / scale, df)
                    - stats::student_t_cdf((v - h - location) / scale, df)
            })
            .collect();

        Posterior::from_probs(grid, probs).unwrap_or_else(|| {
            let mut probs = vec![0.0; grid.len];
            probs[grid.nearest(location)] = 1.0;
            Posterior { grid, probs }
        })
    }

    /// Weighted mixture of posteriors sharing a grid
    pub fn mixture<'a, I>(grid: Grid, components: I) -> Option<Self>
    where
        I: IntoIterator<Item = (f64, &'a [f64])>,
    {
        let mut probs = vec![0.0; grid.len];
        for (w, component) in components {
            for (p, c) in probs.iter_mut().zip(component) {
                *p += w * c;
            }
        }
        Posterior::from_probs(grid, probs)
    }

    pub fn mean(&self) -> f64 {
        self.probs
            .iter()
            .enumerate()
            .map(|(i, p)| p * self.grid.value(i))
            .sum()
    }

    /// `P(X > t)`, each grid point covering an interval of one step
    pub fn prob_above(&self, t: f64) -> f64 {
        let h = 0.5 * self.grid.step;
        self.probs
            .iter()
            .enumerate()
            .map(|(i, p)| p * ((self.grid.value(i) + h - t) / self.grid.step).clamp(0.0, 1.0))
            .sum()
    }

    /// `P(X < t)`, each grid point covering an interval of one step
    pub fn prob_below(&self, t: f64) -> f64 {
        let h = 0.5 * self.grid.step;
        self.probs
            .iter()
            .enumerate()
            .map(|(i, p)| p * ((t - self.grid.value(i) + h) / self.grid.step).clamp(0.0, 1.0))
            .sum()
    }
}

/// Why inference for a protein stopped
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FailureReason {
    #[error("non-finite model evidence")]
    NonFiniteEvidence,

    #[error("degenerate variance in {0}")]
    DegenerateVariance(String),

    #[error("fewer than two quantified runs in condition {0}")]
    TooFewRuns(String),

    #[error("fewer than two paired samples between {0} and {1}")]
    TooFewPairs(String, String),
}

/// Location-scale Student-t sampling distribution of a t-test estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StudentT {
    pub location: f64,
    pub scale: f64,
    pub df: f64,
}

impl StudentT {
    pub fn cdf(&self, x: f64) -> f64 {
        stats::student_t_cdf((x - self.location) / self.scale, self.df)
    }
}

/// Produces group posteriors from a protein's likelihood
pub trait InferenceEngine: Sync {
    fn experiment(&self) -> &Experiment;

    fn group_posteriors(&self, likelihood: ProteinLikelihood) -> Result<GroupPosteriors, FailureReason>;
}

#[derive(Debug, Clone)]
enum Difference {
    /// Per noise level: mixture weight and the conditional group posteriors
    Mixture(Vec<(f64, Vec<Posterior>)>),
    /// Run-level estimates for a t-test
    TTest {
        estimates: Vec<Option<f64>>,
        paired: bool,
    },
}

/// Group posteriors computed
#[derive(Debug, Clone)]
pub struct GroupPosteriors {
    pub likelihood: ProteinLikelihood,
    /// Per run; `None` where a run carries no usable evidence
    pub run_posteriors: Vec<Option<Posterior>>,
    /// Per condition
    pub groups: Vec<Posterior>,
    difference: Difference,
}

/// One comparison's fold-change posterior
#[derive(Debug, Clone)]
pub struct ComparisonPosterior {
    pub pair: (usize, usize),
    pub posterior: Posterior,
    /// Exact sampling distribution when it is known in closed form
    pub sampling: Option<StudentT>,
}

/// Fold-change posteriors computed
#[derive(Debug, Clone)]
pub struct FoldChange {
    pub likelihood: ProteinLikelihood,
    pub run_posteriors: Vec<Option<Posterior>>,
    pub groups: Vec<Posterior>,
    pub comparisons: Vec<ComparisonPosterior>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComparisonScore {
    pub log2_fold_change: f64,
    pub pep: f64,
}

/// Error probabilities derived; the terminal stage
#[derive(Debug, Clone)]
pub struct Scored {
    pub likelihood: ProteinLikelihood,
    pub run_posteriors: Vec<Option<Posterior>>,
    pub groups: Vec<Posterior>,
    pub comparisons: Vec<ComparisonPosterior>,
    /// Parallel to `comparisons`
    pub scores: Vec<ComparisonScore>,
}

impl Scored {
    pub fn protein(&self) -> &str {
        &self.likelihood.protein
    }

    pub fn is_decoy(&self) -> bool {
        self.likelihood.is_decoy
    }

    /// Posterior mean abundance per condition
    pub fn abundances(&self) -> Vec<f64> {
        self.groups.iter().map(Posterior::mean).collect()
    }
}

/// Distribution of `b - a` for independent `a`, `b` on the abundance grid
fn cross_correlate(a: &Posterior, b: &Posterior) -> Vec<f64> {
    const MIN_MASS: f64 = 1e-12;
    let n = a.grid.len;
    let support = |p: &Posterior| -> Vec<(usize, f64)> {
        p.probs
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, v)| v > MIN_MASS)
            .collect()
    };
    let (sa, sb) = (support(a), support(b));

    let mut out = vec![0.0; 2 * n - 1];
    for &(i, pa) in &sa {
        for &(j, pb) in &sb {
            out[j + n - 1 - i] += pa * pb;
        }
    }
    out
}

fn welch(a: &[f64], b: &[f64]) -> Option<StudentT> {
    let (na, nb) = (a.len() as f64, b.len() as f64);
    let (va, vb) = (stats::variance(a) / na, stats::variance(b) / nb);
    let se2 = va + vb;
    if se2.is_nan() || se2 <= 0.0 {
        return None;
    }
    let df = se2 * se2 / (va * va / (na - 1.0) + vb * vb / (nb - 1.0));
    Some(StudentT {
        location: stats::mean(b) - stats::mean(a),
        scale: se2.sqrt(),
        df,
    })
}

fn one_sample(values: &[f64]) -> Option<StudentT> {
    let n = values.len() as f64;
    let scale = (stats::variance(values) / n).sqrt();
    if scale.is_nan() || scale <= 0.0 {
        return None;
    }
    Some(StudentT {
        location: stats::mean(values),
        scale,
        df: n - 1.0,
    })
}

impl GroupPosteriors {
    /// Compute the fold-change posterior for every comparison of the experiment
    pub fn fold_change(self, experiment: &Experiment) -> Result<FoldChange, FailureReason> {
        let mut comparisons = Vec::new();

        for pair in experiment.comparisons() {
            let (i, j) = pair;
            let comparison = match &self.difference {
                Difference::Mixture(components) => {
                    let correlated: Vec<(f64, Vec<f64>)> = components
                        .iter()
                        .filter(|(w, _)| *w > 1e-12)
                        .map(|(w, groups)| (*w, cross_correlate(&groups[i], &groups[j])))
                        .collect();
                    let posterior = Posterior::mixture(
                        Grid::FOLD_CHANGE,
                        correlated.iter().map(|(w, p)| (*w, p.as_slice())),
                    )
                    .ok_or(FailureReason::NonFiniteEvidence)?;
                    ComparisonPosterior {
                        pair,
                        posterior,
                        sampling: None,
                    }
                }
                Difference::TTest { estimates, paired } => {
                    let label = experiment.comparison_label(pair);
                    let sampling = (if *paired {
                        let diffs = paired_differences(experiment, estimates, pair);
                        if diffs.len() < 2 {
                            return Err(FailureReason::TooFewPairs(
                                experiment.conditions[i].clone(),
                                experiment.conditions[j].clone(),
                            ));
                        }
                        one_sample(&diffs)
                    } else {
                        let values = |c: usize| -> Vec<f64> {
                            experiment.runs_in(c).filter_map(|r| estimates[r]).collect()
                        };
                        welch(&values(i), &values(j))
                    })
                    .ok_or(FailureReason::DegenerateVariance(label))?;

                    ComparisonPosterior {
                        pair,
                        posterior: Posterior::student_t(
                            Grid::FOLD_CHANGE,
                            sampling.location,
                            sampling.scale,
                            sampling.df,
                        ),
                        sampling: Some(sampling),
                    }
                }
            };
            comparisons.push(comparison);
        }

        Ok(FoldChange {
            likelihood: self.likelihood,
            run_posteriors: self.run_posteriors,
            groups: self.groups,
            comparisons,
        })
    }
}

/// Differences `j - i` of run estimates sharing a sample label
fn paired_differences(
    experiment: &Experiment,
    estimates: &[Option<f64>],
    (i, j): (usize, usize),
) -> Vec<f64> {
    let mut diffs = Vec::new();
    for ri in experiment.runs_in(i) {
        let (Some(label), Some(a)) = (&experiment.run_sample[ri], estimates[ri]) else {
            continue;
        };
        let partner = experiment
            .runs_in(j)
            .find(|&rj| experiment.run_sample[rj].as_ref() == Some(label));
        if let Some(b) = partner.and_then(|rj| estimates[rj]) {
            diffs.push(b - a);
        }
    }
    diffs
}

/// Posterior error probability of a change beyond `threshold` in the
/// direction of the point estimate
pub fn posterior_error_probability(comparison: &ComparisonPosterior, estimate: f64, threshold: f64) -> f64 {
    let pep = match (comparison.sampling, estimate >= 0.0) {
        (Some(t), true) => t.cdf(threshold),
        (Some(t), false) => 1.0 - t.cdf(-threshold),
        (None, true) => 1.0 - comparison.posterior.prob_above(threshold),
        (None, false) => 1.0 - comparison.posterior.prob_below(-threshold),
    };
    pep.clamp(0.0, 1.0)
}

impl FoldChange {
    pub fn score(self, threshold: f64) -> Scored {
        let scores = self
            .comparisons
            .iter()
            .map(|c| {
                let log2_fold_change = match c.sampling {
                    Some(t) => t.location,
                    None => c.posterior.mean(),
                };
                ComparisonScore {
                    log2_fold_change,
                    pep: posterior_error_probability(c, log2_fold_change, threshold),
                }
            })
            .collect();

        Scored {
            likelihood: self.likelihood,
            run_posteriors: self.run_posteriors,
            groups: self.groups,
            comparisons: self.comparisons,
            scores,
        }
    }
}

/// Drive one protein through every stage
pub fn infer<E: InferenceEngine + ?Sized>(
    engine: &E,
    likelihood: ProteinLikelihood,
    threshold: f64,
) -> Result<Scored, Diagnostic> {
    let protein = likelihood.protein.clone();
    engine
        .group_posteriors(likelihood)
        .and_then(|g| g.fold_change(engine.experiment()))
        .map(|f| f.score(threshold))
        .map_err(|reason| Diagnostic {
            protein,
            status: DiagnosticStatus::Failed,
            reason: reason.to_string(),
        })
}

/// Convolve `exp(ln_f)` with a normalized kernel centered on its middle element
fn convolve_ln(ln_f: &[f64], kernel: &[f64]) -> Vec<f64> {
    let max = ln_f.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() || kernel.len() == 1 {
        return ln_f.to_vec();
    }
    let f: Vec<f64> = ln_f.iter().map(|v| (v - max).exp()).collect();
    let half = kernel.len() / 2;
    let n = f.len();

    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half).min(n - 1);
            let s: f64 = (lo..=hi).map(|x| kernel[x + half - i] * f[x]).sum();
            s.ln() + max
        })
        .collect()
}

fn gaussian_kernel(variance: f64, step: f64) -> Vec<f64> {
    let sd = variance.sqrt();
    let half = (6.0 * sd / step).ceil() as usize;
    if half == 0 {
        return vec![1.0];
    }
    let raw: Vec<f64> = (0..=2 * half)
        .map(|k| {
            let z = (k as f64 - half as f64) * step / sd;
            (-0.5 * z * z).exp()
        })
        .collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|w| w / total).collect()
}

/// Hierarchical grid inference: run abundance `a_r ~ N(g_c, tau^2)`,
/// group mean `g_c ~ N(0, omega^2)`, noise integrated over a sigma grid
pub struct BayesianEngine<'a, M: ObservationModel> {
    model: &'a FittedModel<M>,
    experiment: &'a Experiment,
    sigma_grid: SigmaGrid,
    kernel: Vec<f64>,
    ln_group_prior: Vec<f64>,
}

impl<'a, M: ObservationModel> BayesianEngine<'a, M> {
    pub fn new(model: &'a FittedModel<M>, experiment: &'a Experiment) -> Self {
        let grid = Grid::ABUNDANCE;
        let omega = model.omega2.sqrt();
        BayesianEngine {
            model,
            experiment,
            sigma_grid: SigmaGrid::from_prior(&model.noise),
            kernel: gaussian_kernel(model.tau2, grid.step),
            ln_group_prior: grid
                .values()
                .map(|g| stats::normal_ln_pdf(g, 0.0, omega))
                .collect(),
        }
    }
}

struct SigmaComponent {
    ln_evidence: f64,
    groups: Vec<Posterior>,
    runs: Vec<Option<Posterior>>,
}

impl<M: ObservationModel> BayesianEngine<'_, M> {
    fn component(&self, likelihood: &ProteinLikelihood, sigma: f64, censoring: &[Vec<f64>]) -> Option<SigmaComponent> {
        let grid = Grid::ABUNDANCE;
        let n_conditions = self.experiment.conditions.len();

        let run_lik: Vec<Vec<f64>> = (0..likelihood.num_runs())
            .map(|r| likelihood.ln_run_likelihood(r, sigma, &censoring[r], &grid))
            .collect();
        // Marginal likelihood of the group mean contributed by each run
        let marginals: Vec<Vec<f64>> = run_lik.iter().map(|l| convolve_ln(l, &self.kernel)).collect();

        let mut ln_evidence = 0.0;
        let mut groups = Vec::with_capacity(n_conditions);
        let mut ln_groups = Vec::with_capacity(n_conditions);
        for c in 0..n_conditions {
            let mut ln_g = self.ln_group_prior.clone();
            for r in self.experiment.runs_in(c) {
                for (g, m) in ln_g.iter_mut().zip(&marginals[r]) {
                    *g += m;
                }
            }
            ln_evidence += stats::log_sum_exp(&ln_g) + grid.step.ln();
            groups.push(Posterior::from_ln_weights(grid, &ln_g)?);
            ln_groups.push(ln_g);
        }

        // Run posterior: own likelihood times the group mean informed by the other runs
        let runs = (0..likelihood.num_runs())
            .map(|r| {
                let c = self.experiment.run_condition[r];
                let cavity: Vec<f64> = ln_groups[c]
                    .iter()
                    .zip(&marginals[r])
                    .map(|(g, m)| if m.is_finite() { g - m } else { f64::NEG_INFINITY })
                    .collect();
                let ln_post: Vec<f64> = convolve_ln(&cavity, &self.kernel)
                    .iter()
                    .zip(&run_lik[r])
                    .map(|(a, b)| a + b)
                    .collect();
                Posterior::from_ln_weights(grid, &ln_post)
            })
            .collect();

        Some(SigmaComponent {
            ln_evidence,
            groups,
            runs,
        })
    }
}

impl<M: ObservationModel> InferenceEngine for BayesianEngine<'_, M> {
    fn experiment(&self) -> &Experiment {
        self.experiment
    }

    fn group_posteriors(&self, likelihood: ProteinLikelihood) -> Result<GroupPosteriors, FailureReason> {
        let grid = Grid::ABUNDANCE;
        let censoring: Vec<Vec<f64>> = (0..likelihood.num_runs())
            .map(|r| likelihood.censoring_terms(r, self.model.curve(r), &grid))
            .collect();

        let mut components = Vec::with_capacity(self.sigma_grid.len());
        let mut ln_weights = Vec::with_capacity(self.sigma_grid.len());
        for (sigma, ln_prior) in self.sigma_grid.sigmas.iter().zip(&self.sigma_grid.ln_prior) {
            if let Some(component) = self.component(&likelihood, *sigma, &censoring) {
                if component.ln_evidence.is_finite() {
                    ln_weights.push(ln_prior + component.ln_evidence);
                    components.push(component);
                }
            }
        }

        let norm = stats::log_sum_exp(&ln_weights);
        if components.is_empty() || !norm.is_finite() {
            return Err(FailureReason::NonFiniteEvidence);
        }
        let weights: Vec<f64> = ln_weights.iter().map(|w| (w - norm).exp()).collect();

        let groups = (0..self.experiment.conditions.len())
            .map(|c| {
                Posterior::mixture(
                    grid,
                    weights
                        .iter()
                        .zip(&components)
                        .map(|(w, comp)| (*w, comp.groups[c].probs.as_slice())),
                )
                .ok_or(FailureReason::NonFiniteEvidence)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let run_posteriors = (0..likelihood.num_runs())
            .map(|r| {
                Posterior::mixture(
                    grid,
                    weights.iter().zip(&components).filter_map(|(w, comp)| {
                        comp.runs[r].as_ref().map(|p| (*w, p.probs.as_slice()))
                    }),
                )
            })
            .collect();

        let difference = Difference::Mixture(
            weights
                .into_iter()
                .zip(components)
                .map(|(w, comp)| (w, comp.groups))
                .collect(),
        );

        Ok(GroupPosteriors {
            likelihood,
            run_posteriors,
            groups,
            difference,
        })
    }
}

/// Classical fallback: t statistics on run-level estimates
pub struct TTestEngine<'a> {
    experiment: &'a Experiment,
    paired: bool,
}

impl<'a> TTestEngine<'a> {
    pub fn new(experiment: &'a Experiment, paired: bool) -> Self {
        TTestEngine { experiment, paired }
    }
}

impl InferenceEngine for TTestEngine<'_> {
    fn experiment(&self) -> &Experiment {
        self.experiment
    }

    fn group_posteriors(&self, likelihood: ProteinLikelihood) -> Result<GroupPosteriors, FailureReason> {
        let grid = Grid::ABUNDANCE;
        let estimates: Vec<Option<f64>> = (0..likelihood.num_runs())
            .map(|r| likelihood.run_estimate(r))
            .collect();

        let mut groups = Vec::new();
        for (c, condition) in self.experiment.conditions.iter().enumerate() {
            let values: Vec<f64> = self.experiment.runs_in(c).filter_map(|r| estimates[r]).collect();
            if values.len() < 2 {
                return Err(FailureReason::TooFewRuns(condition.clone()));
            }
            let t = one_sample(&values)
                .ok_or_else(|| FailureReason::DegenerateVariance(condition.clone()))?;
            groups.push(Posterior::student_t(grid, t.location, t.scale, t.df));
        }

        let run_posteriors = likelihood
            .deviations
            .iter()
            .map(|d| {
                (d.len() >= 2)
                    .then(|| one_sample(d))
                    .flatten()
                    .map(|t| Posterior::student_t(grid, t.location, t.scale, t.df))
            })
            .collect();

        Ok(GroupPosteriors {
            likelihood,
            run_posteriors,
            groups,
            difference: Difference::TTest {
                estimates,
                paired: self.paired,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LogisticCensoring, NoisePrior};

    fn experiment(labels: &[(&str, &str, Option<&str>)]) -> Experiment {
        let entries: Vec<_> = labels
            .iter()
            .map(|(r, c, s)| (r.to_string(), c.to_string(), s.map(str::to_string)))
            .collect();
        Experiment::new(&entries).unwrap()
    }

    fn two_by_three() -> Experiment {
        experiment(&[
            ("a1", "A", Some("s1")),
            ("a2", "A", Some("s2")),
            ("a3", "A", Some("s3")),
            ("b1", "B", Some("s1")),
            ("b2", "B", Some("s2")),
            ("b3", "B", Some("s3")),
        ])
    }

    fn model(n_runs: usize) -> FittedModel {
        let curve = LogisticCensoring {
            mu: 10.0,
            scale: 1.0,
            pi: 0.05,
        };
        FittedModel {
            run_curves: vec![curve; n_runs],
            run_fallback: vec![false; n_runs],
            global: curve,
            noise: NoisePrior {
                variance: 0.01,
                df: 10.0,
            },
            tau2: 0.0025,
            omega2: 1.0,
        }
    }

    /// Three features; condition B shifted by `shift`
    fn likelihood(shift: f64) -> ProteinLikelihood {
        let noise = [0.05, -0.08, 0.02, -0.03, 0.07, -0.01, 0.04, -0.06, 0.0];
        let mut deviations = Vec::new();
        for r in 0..6 {
            let offset = if r < 3 { -0.5 * shift } else { 0.5 * shift };
            deviations.push((0..3).map(|j| offset + noise[(r + j * 2) % 9]).collect());
        }
        ProteinLikelihood {
            protein: "P1".into(),
            is_decoy: false,
            peptides: vec!["AK".into(), "CK".into(), "DK".into()],
            deviations,
            missing_levels: vec![Vec::new(); 6],
        }
    }

    #[test]
    fn test_grid() {
        let g = Grid::ABUNDANCE;
        assert_eq!(g.value(0), -16.0);
        assert!((g.value(g.len - 1) - 16.0).abs() < 1e-9);
        assert_eq!(g.nearest(0.0), 320);
        assert_eq!(g.nearest(100.0), 640);

        let fc = Grid::FOLD_CHANGE;
        assert_eq!(fc.len, 2 * g.len - 1);
        assert!((fc.value(0) - (g.value(0) - g.value(g.len - 1))).abs() < 1e-9);
        assert!((fc.value(fc.len - 1) - 32.0).abs() < 1e-9);
    }

    #[test]
    fn test_tail_probabilities_use_bin_intervals() {
        let mut probs = vec![0.0; Grid::ABUNDANCE.len];
        probs[Grid::ABUNDANCE.nearest(0.0)] = 1.0;
        let p = Posterior::from_probs(Grid::ABUNDANCE, probs).unwrap();
        assert!((p.prob_above(0.0) - 0.5).abs() < 1e-12);
        assert!((p.prob_below(0.0) - 0.5).abs() < 1e-12);
        assert_eq!(p.prob_above(1.0), 0.0);
        assert!(p.mean().abs() < 1e-12);
    }

    #[test]
    fn test_cross_correlation_of_point_masses() {
        let point = |x: f64| {
            let mut probs = vec![0.0; Grid::ABUNDANCE.len];
            probs[Grid::ABUNDANCE.nearest(x)] = 1.0;
            Posterior::from_probs(Grid::ABUNDANCE, probs).unwrap()
        };
        let d = cross_correlate(&point(-0.5), &point(1.0));
        assert_eq!(d.len(), Grid::FOLD_CHANGE.len);
        let fc = Posterior::from_probs(Grid::FOLD_CHANGE, d).unwrap();
        assert!((fc.mean() - 1.5).abs() < 1e-9);

        // Group means far apart in an unbalanced design stay on the grid
        let wide = Posterior::from_probs(Grid::FOLD_CHANGE, cross_correlate(&point(-10.0), &point(2.0))).unwrap();
        assert!((wide.mean() - 12.0).abs() < 1e-9);
        assert_eq!(wide.prob_above(10.0), 1.0);
    }

    #[test]
    fn test_gaussian_kernel() {
        assert_eq!(gaussian_kernel(0.0, 0.05), vec![1.0]);
        let k = gaussian_kernel(0.01, 0.05);
        assert_eq!(k.len() % 2, 1);
        assert!(k.len() >= 25);
        assert!((k.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert_eq!(k[k.len() / 2], k.iter().copied().fold(0.0, f64::max));
    }

    #[test]
    fn test_bayesian_detects_shift() {
        let exp = two_by_three();
        let model = model(6);
        let engine = BayesianEngine::new(&model, &exp);

        let changed = infer(&engine, likelihood(1.0), 0.5).unwrap();
        let fc = changed.scores[0].log2_fold_change;
        assert!((fc - 1.0).abs() < 0.15, "fold change {}", fc);
        assert!(changed.scores[0].pep < 0.01);
        assert!(changed.run_posteriors.iter().all(Option::is_some));

        let flat = infer(&engine, likelihood(0.0), 0.5).unwrap();
        assert!(flat.scores[0].log2_fold_change.abs() < 0.15);
        assert!(flat.scores[0].pep > 0.99);
    }

    #[test]
    fn test_pep_increases_with_threshold() {
        let exp = two_by_three();
        let model = model(6);
        let engine = BayesianEngine::new(&model, &exp);

        let pep_at = |t: f64| infer(&engine, likelihood(1.0), t).unwrap().scores[0].pep;
        let (p0, p1, p10) = (pep_at(0.0), pep_at(1.0), pep_at(10.0));
        assert!(p0 <= p1);
        assert!(p1 <= p10);
        assert!(p0 < 0.01);
        assert!(p10 > 0.999);
    }

    #[test]
    fn test_censoring_pulls_abundance_down() {
        let exp = two_by_three();
        let model = model(6);
        let engine = BayesianEngine::new(&model, &exp);

        // Same observations, but condition B also misses a low-level feature
        let mut lik = likelihood(0.0);
        let observed = infer(&engine, lik.clone(), 1.0).unwrap();
        for r in 3..6 {
            lik.missing_levels[r].push(9.0);
        }
        let censored = infer(&engine, lik, 1.0).unwrap();
        assert!(censored.abundances()[1] < observed.abundances()[1]);
    }

    #[test]
    fn test_ttest_engine() {
        let exp = two_by_three();
        let engine = TTestEngine::new(&exp, false);

        let scored = infer(&engine, likelihood(1.0), 0.0).unwrap();
        let t = scored.comparisons[0].sampling.unwrap();
        assert!((t.location - 1.0).abs() < 0.1);
        assert!(scored.scores[0].pep < 0.01);
        assert!((scored.comparisons[0].posterior.mean() - t.location).abs() < 0.05);

        let paired = TTestEngine::new(&exp, true);
        let scored = infer(&paired, likelihood(1.0), 0.0).unwrap();
        assert_eq!(scored.comparisons[0].sampling.unwrap().df, 2.0);
    }

    #[test]
    fn test_ttest_failures() {
        let exp = two_by_three();
        let engine = TTestEngine::new(&exp, false);

        let mut lik = likelihood(1.0);
        lik.deviations[0].clear();
        lik.deviations[1].clear();
        let err = infer(&engine, lik, 1.0).unwrap_err();
        assert_eq!(err.status, DiagnosticStatus::Failed);
        assert_eq!(err.reason, FailureReason::TooFewRuns("A".into()).to_string());

        let mut lik = likelihood(0.0);
        for d in lik.deviations.iter_mut() {
            d.iter_mut().for_each(|x| *x = 0.25);
        }
        assert!(infer(&engine, lik, 1.0).is_err());

        let unpaired = experiment(&[("a1", "A", None), ("a2", "A", None), ("b1", "B", None), ("b2", "B", None)]);
        let engine = TTestEngine::new(&unpaired, true);
        let mut lik = likelihood(1.0);
        lik.deviations.truncate(4);
        lik.missing_levels.truncate(4);
        let err = infer(&engine, lik, 1.0).unwrap_err();
        assert!(err.reason.contains("paired"));
    }

    #[test]
    fn test_student_t_discretization() {
        let p = Posterior::student_t(Grid::ABUNDANCE, 0.3, 0.2, 5.0);
        assert!((p.probs.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((p.mean() - 0.3).abs() < 1e-3);

        let narrow = Posterior::student_t(Grid::ABUNDANCE, 0.3, 1e-9, 5.0);
        assert_eq!(narrow.probs[Grid::ABUNDANCE.nearest(0.3)], 1.0);
    }
}
