//! Tab-separated result tables

use crate::consensus::FeatureMatrix;
use crate::input::Experiment;
use crate::posterior::{Posterior, Scored};
use crate::protein::Diagnostic;
use crate::utils::create_output;
use crate::EpqResult;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One line of a protein result table
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub protein: String,
    /// `None` when q-values could not be calibrated
    pub q_value: Option<f64>,
    pub pep: f64,
    pub log2_fold_change: f64,
    pub num_peptides: usize,
    /// Posterior mean log2 abundance per condition, relative to the feature references
    pub abundances: Vec<f64>,
    pub peptides: Vec<String>,
}

fn format_optional(value: Option<f64>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| format!("{:.6}", v))
}

/// Path next to `base` with `tag` inserted before the extension(s):
/// `proteins.tsv` -> `proteins.diagnostics.tsv`
pub fn sibling_path(base: &Path, tag: &str) -> PathBuf {
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let new_name = match name.split_once('.') {
        Some((stem, ext)) => format!("{}.{}.{}", stem, tag, ext),
        None => format!("{}.{}", name, tag),
    };
    base.with_file_name(new_name)
}

/// Result file of one comparison; the label only appears with several comparisons
pub fn comparison_path(base: &Path, label: &str, num_comparisons: usize) -> PathBuf {
    if num_comparisons <= 1 {
        base.to_path_buf()
    } else {
        sibling_path(base, label)
    }
}

/// Write the protein result table of one comparison
pub fn write_results(rows: &[ResultRow], conditions: &[String], output_path: &Path) -> EpqResult<()> {
    let mut writer = create_output(output_path)?;

    write!(
        writer,
        "protein\tq_value\tposterior_error_prob\tlog2_fold_change\tnum_peptides"
    )?;
    for c in conditions {
        write!(writer, "\t{}", c)?;
    }
    writeln!(writer, "\tpeptides")?;

    for row in rows {
        write!(
            writer,
            "{}\t{}\t{:.6}\t{:.4}\t{}",
            row.protein,
            format_optional(row.q_value),
            row.pep,
            row.log2_fold_change,
            row.num_peptides
        )?;
        for a in &row.abundances {
            write!(writer, "\t{:.4}", a)?;
        }
        writeln!(writer, "\t{}", row.peptides.join(";"))?;
    }

    writer.finish()?;
    Ok(())
}

/// Consensus precursor quantifications after normalization (linear scale)
pub fn write_spectrum_quants(matrix: &FeatureMatrix, output_path: &Path) -> EpqResult<()> {
    let mut writer = create_output(output_path)?;

    write!(writer, "peptide\tcharge\tproteins\tsearch_score")?;
    for run in &matrix.experiment.runs {
        write!(writer, "\t{}", run)?;
    }
    writeln!(writer)?;

    for f in &matrix.features {
        write!(
            writer,
            "{}\t{}\t{}\t{}",
            f.peptide,
            f.charge,
            f.proteins.join(";"),
            f.search_score
        )?;
        for level in &f.levels {
            match level {
                Some(l) => write!(writer, "\t{:.2}", l.exp2())?,
                None => write!(writer, "\tNA")?,
            }
        }
        writeln!(writer)?;
    }

    writer.finish()?;
    Ok(())
}

fn write_posterior_header(writer: &mut dyn Write, key: &str, posterior: Option<&Posterior>) -> EpqResult<()> {
    write!(writer, "protein\t{}", key)?;
    if let Some(p) = posterior {
        for v in p.grid.values() {
            write!(writer, "\t{:.2}", v)?;
        }
    }
    writeln!(writer)?;
    Ok(())
}

fn write_posterior_row(writer: &mut dyn Write, protein: &str, key: &str, posterior: &Posterior) -> EpqResult<()> {
    write!(writer, "{}\t{}", protein, key)?;
    for p in &posterior.probs {
        write!(writer, "\t{:.4e}", p)?;
    }
    writeln!(writer)?;
    Ok(())
}

/// Per-run protein abundance posteriors
pub fn write_protein_posteriors(scored: &[Scored], experiment: &Experiment, output_path: &Path) -> EpqResult<()> {
    let mut writer = create_output(output_path)?;
    let first = scored
        .iter()
        .flat_map(|s| s.run_posteriors.iter().flatten())
        .next();
    write_posterior_header(&mut writer, "run", first)?;

    for s in scored {
        for (r, posterior) in s.run_posteriors.iter().enumerate() {
            if let Some(p) = posterior {
                write_posterior_row(&mut writer, s.protein(), &experiment.runs[r], p)?;
            }
        }
    }
    writer.finish()?;
    Ok(())
}

/// Per-condition group mean posteriors
pub fn write_group_posteriors(scored: &[Scored], experiment: &Experiment, output_path: &Path) -> EpqResult<()> {
    let mut writer = create_output(output_path)?;
    let first = scored.iter().flat_map(|s| s.groups.first()).next();
    write_posterior_header(&mut writer, "condition", first)?;

    for s in scored {
        for (c, posterior) in s.groups.iter().enumerate() {
            write_posterior_row(&mut writer, s.protein(), &experiment.conditions[c], posterior)?;
        }
    }
    writer.finish()?;
    Ok(())
}

/// Fold-change posteriors of every comparison
pub fn write_fold_change_posteriors(scored: &[Scored], experiment: &Experiment, output_path: &Path) -> EpqResult<()> {
    let mut writer = create_output(output_path)?;
    let first = scored
        .iter()
        .flat_map(|s| s.comparisons.first())
        .map(|c| &c.posterior)
        .next();
    write_posterior_header(&mut writer, "comparison", first)?;

    for s in scored {
        for c in &s.comparisons {
            write_posterior_row(
                &mut writer,
                s.protein(),
                &experiment.comparison_label(c.pair),
                &c.posterior,
            )?;
        }
    }
    writer.finish()?;
    Ok(())
}

/// Excluded and failed proteins with their reasons
pub fn write_diagnostics(diagnostics: &[Diagnostic], output_path: &Path) -> EpqResult<()> {
    let mut writer = create_output(output_path)?;
    writeln!(writer, "protein\tstatus\treason")?;
    for d in diagnostics {
        writeln!(writer, "{}\t{}\t{}", d.protein, d.status, d.reason)?;
    }
    writer.finish()?;
    Ok(())
}
