//! # epq - Error-Propagating Protein Quantification
//!
//! Protein-level differential expression from peptide/spectrum
//! identifications. Uncertainty is carried from the spectrum level through
//! peptide aggregation into protein, group and fold-change posteriors, and
//! missing values enter the model as censored observations instead of being
//! dropped.
//!
//! The stages run strictly in order:
//!
//! 1. [`input`] normalizes vendor evidence tables into [`QuantRecord`]s
//! 2. [`consensus`] and [`protein`] build features and protein groups
//! 3. [`model`] fits the missing-value and noise model
//! 4. [`aggregate`] and [`posterior`] run per-protein inference
//! 5. [`fdr`] turns posterior error probabilities into q-values
//!
//! [`pipeline::run_pipeline`] drives all of them.

pub mod aggregate;
pub mod consensus;
pub mod fdr;
pub mod input;
pub mod model;
pub mod optimize;
pub mod output;
pub mod pipeline;
pub mod posterior;
pub mod protein;
pub mod stats;
pub mod utils;

use serde::{Deserialize, Serialize};

/// One row of the canonical quantification table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantRecord {
    pub run: String,
    pub condition: String,
    pub charge: u8,
    pub search_score: f64,
    /// Raw (linear) precursor intensity; `None` marks a missing value
    pub intensity: Option<f64>,
    pub peptide: String,
    pub proteins: Vec<String>,
}

impl QuantRecord {
    pub fn new(
        run: String,
        condition: String,
        charge: u8,
        search_score: f64,
        intensity: Option<f64>,
        peptide: String,
        proteins: Vec<String>,
    ) -> Self {
        Self {
            run,
            condition,
            charge,
            search_score,
            intensity: intensity.filter(|x| x.is_finite() && *x > 0.0),
            peptide,
            proteins,
        }
    }
}

/// Associates a run with its treatment condition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunMapping {
    pub run: String,
    pub condition: String,
    pub sample: Option<String>,
    pub fraction: Option<String>,
}

impl RunMapping {
    pub fn new(run: String, condition: String) -> Self {
        Self {
            run,
            condition,
            sample: None,
            fraction: None,
        }
    }

    /// Name the run is quantified under; fractions collapse onto their sample
    pub fn quant_run(&self) -> &str {
        match (&self.sample, &self.fraction) {
            (Some(sample), Some(_)) => sample,
            _ => &self.run,
        }
    }
}

/// Supported evidence table layouts
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    #[default]
    Triqler,
    Diann,
    Maxquant,
}

impl std::fmt::Display for InputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputFormat::Triqler => write!(f, "triqler"),
            InputFormat::Diann => write!(f, "diann"),
            InputFormat::Maxquant => write!(f, "maxquant"),
        }
    }
}

/// Missing-value regime used when fitting the detection curve
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum MissingValuePrior {
    /// Data-dependent acquisition: random precursor selection plus censoring
    #[default]
    Default,
    /// Data-independent acquisition: missingness is almost entirely censoring
    #[value(name = "DIA", alias = "dia")]
    Dia,
}

/// How peptides matching several proteins are handled
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum SharedPeptides {
    /// Assign to the candidate protein with the most peptides
    #[default]
    Razor,
    /// Drop peptides with more than one candidate protein
    Discard,
}

/// Configuration parameters for quantification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantConfig {
    pub input_format: InputFormat,
    /// log2 fold change the differential-expression claim is evaluated at
    pub fold_change_eval: f64,
    pub decoy_prefix: String,
    /// Minimum number of observed peptide quantifications per protein
    pub min_samples: usize,
    pub missing_value_prior: MissingValuePrior,
    /// Worker threads, 0 = all available cores
    pub num_threads: usize,
    pub use_ttest: bool,
    pub paired_ttest: bool,
    pub normalize_intensities: bool,
    pub shared_peptides: SharedPeptides,
    /// Smallest decoy population q-values are estimated from
    pub min_decoys: usize,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            input_format: InputFormat::Triqler,
            fold_change_eval: 1.0,
            decoy_prefix: "decoy_".to_string(),
            min_samples: 2,
            missing_value_prior: MissingValuePrior::Default,
            num_threads: 0,
            use_ttest: false,
            paired_ttest: false,
            normalize_intensities: true,
            shared_peptides: SharedPeptides::Razor,
            min_decoys: 3,
        }
    }
}

impl QuantConfig {
    pub fn is_decoy(&self, protein: &str) -> bool {
        protein.starts_with(&self.decoy_prefix)
    }
}

/// Which optional tables are requested
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OutputOptions {
    pub spectrum_quants: bool,
    pub protein_posteriors: bool,
    pub group_posteriors: bool,
    pub fold_change_posteriors: bool,
}

/// Error types for the epq library
#[derive(Debug, thiserror::Error)]
pub enum EpqError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Missing column '{column}' in {format} input")]
    MissingColumn { format: InputFormat, column: String },

    #[error("Runs without a condition mapping: {}", .0.join(", "))]
    UnmappedRuns(Vec<String>),

    #[error("Malformed run mapping: {0}")]
    MalformedMapping(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("No usable rows: {0}")]
    EmptyInput(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Model fit failed: {0}")]
    ModelFit(String),
}

pub type EpqResult<T> = Result<T, EpqError>;
