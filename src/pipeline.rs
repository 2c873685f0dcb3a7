//! End-to-end quantification: normalization, fitting, inference, calibration

use crate::aggregate::ProteinLikelihood;
use crate::consensus::{build_features, FeatureMatrix};
use crate::fdr::{calibrate, Candidate, QValues};
use crate::input::{read_evidence, read_run_mapping, Evidence};
use crate::model::{fit_model, FittedModel};
use crate::output::{
    comparison_path, sibling_path, write_diagnostics, write_fold_change_posteriors,
    write_group_posteriors, write_protein_posteriors, write_results, write_spectrum_quants,
    ResultRow,
};
use crate::posterior::{infer, BayesianEngine, InferenceEngine, Scored, TTestEngine};
use crate::protein::{filter_min_samples, group_proteins, Diagnostic};
use crate::utils::{log_progress, validate_file_readable, Timer};
use crate::{EpqError, EpqResult, OutputOptions, QuantConfig};
use rayon::prelude::*;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

const PROGRESS_INTERVAL: usize = 1000;

/// Results of one condition pair
#[derive(Debug, Clone)]
pub struct ComparisonResult {
    pub pair: (usize, usize),
    pub label: String,
    /// Target proteins, most confident first
    pub rows: Vec<ResultRow>,
    pub q_values: QValues,
}

/// Everything a quantification run produces
#[derive(Debug, Clone)]
pub struct QuantOutput {
    pub matrix: FeatureMatrix,
    pub model: FittedModel,
    /// Successfully scored proteins (targets and decoys), sorted by identifier
    pub scored: Vec<Scored>,
    pub comparisons: Vec<ComparisonResult>,
    /// Excluded and failed proteins, sorted by identifier
    pub diagnostics: Vec<Diagnostic>,
}

/// Validate quantification parameters
pub fn validate_config(config: &QuantConfig) -> EpqResult<()> {
    if !(0.0..=10.0).contains(&config.fold_change_eval) {
        return Err(EpqError::InvalidConfig(format!(
            "fold_change_eval must be between 0 and 10, got {}",
            config.fold_change_eval
        )));
    }

    if config.min_samples < 1 {
        return Err(EpqError::InvalidConfig(
            "min_samples must be at least 1".to_string(),
        ));
    }

    if config.min_decoys < 1 {
        return Err(EpqError::InvalidConfig(
            "min_decoys must be at least 1".to_string(),
        ));
    }

    if config.decoy_prefix.is_empty() {
        return Err(EpqError::InvalidConfig(
            "decoy_prefix must not be empty".to_string(),
        ));
    }

    if config.paired_ttest && !config.use_ttest {
        return Err(EpqError::InvalidConfig(
            "paired_ttest requires use_ttest".to_string(),
        ));
    }

    Ok(())
}

fn build_pool(num_threads: usize) -> EpqResult<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build()
        .map_err(|e| EpqError::InvalidConfig(format!("cannot start thread pool: {}", e)))
}

/// Runs that use the pooled detection curve, with their observed and missing counts
fn pooled_curve_runs(matrix: &FeatureMatrix, model: &FittedModel) -> Vec<(String, usize, usize)> {
    matrix
        .experiment
        .runs
        .iter()
        .zip(matrix.run_coverage())
        .zip(&model.run_fallback)
        .filter(|(_, &fallback)| fallback)
        .map(|((run, (observed, missing)), _)| (run.clone(), observed, missing))
        .collect()
}

/// Calibrate one comparison and assemble its target result rows
fn compare(scored: &[Scored], index: usize, label: String, pair: (usize, usize), min_decoys: usize) -> ComparisonResult {
    let candidates: Vec<Candidate> = scored
        .iter()
        .map(|s| Candidate {
            protein: s.protein(),
            is_decoy: s.is_decoy(),
            pep: s.scores[index].pep,
        })
        .collect();
    let q_values = calibrate(&candidates, min_decoys);

    let mut rows: Vec<ResultRow> = scored
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.is_decoy())
        .map(|(i, s)| ResultRow {
            protein: s.protein().to_string(),
            q_value: q_values.get(i),
            pep: s.scores[index].pep,
            log2_fold_change: s.scores[index].log2_fold_change,
            num_peptides: s.likelihood.peptides.len(),
            abundances: s.abundances(),
            peptides: s.likelihood.peptides.clone(),
        })
        .collect();
    rows.sort_by(|a, b| a.pep.total_cmp(&b.pep).then_with(|| a.protein.cmp(&b.protein)));

    log::info!(
        "{}: {} target proteins, {} at q <= 0.05",
        label,
        rows.len(),
        q_values.passing(&candidates, 0.05)
    );

    ComparisonResult {
        pair,
        label,
        rows,
        q_values,
    }
}

/// Run every stage on normalized evidence
pub fn quantify(evidence: &Evidence, config: &QuantConfig) -> EpqResult<QuantOutput> {
    validate_config(config)?;

    let matrix = {
        let _timer = Timer::new("Building precursor features");
        let matrix = build_features(evidence)?;
        if config.normalize_intensities {
            matrix.normalized()
        } else {
            matrix
        }
    };
    let experiment = &matrix.experiment;

    let groups = group_proteins(&matrix, config);
    let (retained, mut diagnostics) = filter_min_samples(groups, &matrix, config.min_samples);
    if retained.is_empty() {
        log::warn!("No protein passed the minimum-samples filter");
    }

    let model = {
        let _timer = Timer::new("Fitting missing-value and noise model");
        fit_model(&matrix, &retained, config)?
    };
    let pooled = pooled_curve_runs(&matrix, &model);
    for (run, observed, missing) in &pooled {
        log::debug!(
            "Run {} ({} observed, {} missing) uses the pooled detection curve",
            run,
            observed,
            missing
        );
    }
    if !pooled.is_empty() {
        log::info!(
            "{} of {} runs use the pooled detection curve",
            pooled.len(),
            experiment.num_runs()
        );
    }

    let likelihoods: Vec<ProteinLikelihood> = retained
        .iter()
        .map(|g| ProteinLikelihood::build(g, &matrix))
        .collect();

    let engine: Box<dyn InferenceEngine + '_> = if config.use_ttest {
        Box::new(TTestEngine::new(experiment, config.paired_ttest))
    } else {
        Box::new(BayesianEngine::new(&model, experiment))
    };

    let pool = build_pool(config.num_threads)?;
    let total = likelihoods.len();
    let done = AtomicUsize::new(0);
    let outcomes: Vec<Result<Scored, Diagnostic>> = {
        let _timer = Timer::new("Protein inference");
        pool.install(|| {
            likelihoods
                .into_par_iter()
                .map(|likelihood| {
                    let outcome = infer(engine.as_ref(), likelihood, config.fold_change_eval);
                    let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                    if n % PROGRESS_INTERVAL == 0 || n == total {
                        log_progress(n, total, "Proteins inferred");
                    }
                    outcome
                })
                .collect()
        })
    };

    let mut scored = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        match outcome {
            Ok(s) => scored.push(s),
            Err(d) => {
                log::debug!("{} failed: {}", d.protein, d.reason);
                diagnostics.push(d);
            }
        }
    }
    scored.sort_by(|a, b| a.protein().cmp(b.protein()));
    diagnostics.sort_by(|a, b| a.protein.cmp(&b.protein));

    let comparisons = experiment
        .comparisons()
        .into_iter()
        .enumerate()
        .map(|(k, pair)| {
            compare(&scored, k, experiment.comparison_label(pair), pair, config.min_decoys)
        })
        .collect();

    drop(engine);
    Ok(QuantOutput {
        matrix,
        model,
        scored,
        comparisons,
        diagnostics,
    })
}

/// Write the result tables of a finished run next to `output_path`
pub fn write_outputs(result: &QuantOutput, output_path: &Path, options: &OutputOptions) -> EpqResult<()> {
    let experiment = &result.matrix.experiment;
    let n = result.comparisons.len();

    for comparison in &result.comparisons {
        let path = comparison_path(output_path, &comparison.label, n);
        write_results(&comparison.rows, &experiment.conditions, &path)?;
        log::info!("Protein results for {} written to {:?}", comparison.label, path);
    }

    write_diagnostics(&result.diagnostics, &sibling_path(output_path, "diagnostics"))?;

    if options.spectrum_quants {
        write_spectrum_quants(&result.matrix, &sibling_path(output_path, "spectrum_quants"))?;
    }
    if options.protein_posteriors {
        write_protein_posteriors(
            &result.scored,
            experiment,
            &sibling_path(output_path, "protein_posteriors"),
        )?;
    }
    if options.group_posteriors {
        write_group_posteriors(
            &result.scored,
            experiment,
            &sibling_path(output_path, "group_posteriors"),
        )?;
    }
    if options.fold_change_posteriors {
        write_fold_change_posteriors(
            &result.scored,
            experiment,
            &sibling_path(output_path, "fold_change_posteriors"),
        )?;
    }
    Ok(())
}

/// Read, quantify and write in one call
pub fn run_pipeline(
    input_path: &Path,
    mapping_path: Option<&Path>,
    output_path: &Path,
    config: &QuantConfig,
    options: &OutputOptions,
) -> EpqResult<QuantOutput> {
    validate_config(config)?;
    validate_file_readable(input_path)?;

    let mappings = match mapping_path {
        Some(p) => {
            validate_file_readable(p)?;
            Some(read_run_mapping(p)?)
        }
        None => None,
    };

    let evidence = {
        let _timer = Timer::new("Reading evidence");
        read_evidence(input_path, mappings.as_deref(), config)?
    };

    let result = quantify(&evidence, config)?;

    let _timer = Timer::new("Writing results");
    write_outputs(&result, output_path, options)?;
    Ok(result)
}
