//! CLI binary for epq - protein quantification with error propagation

use clap::Parser;
use env_logger::Env;
use std::path::PathBuf;
use epq_rs::{
    pipeline::{run_pipeline, validate_config},
    utils::{get_num_cpus, Timer},
    EpqError, EpqResult, InputFormat, MissingValuePrior, OutputOptions, QuantConfig,
    SharedPeptides,
};

#[derive(Parser)]
#[command(name = "epq")]
#[command(about = "Protein quantification with error propagation from spectrum to fold change")]
#[command(long_about = "
epq quantifies proteins from peptide-level evidence and tests them for
differential expression between conditions. Uncertainty is propagated from
the spectrum level through peptide aggregation into protein, group and
fold-change posteriors, and missing values are modelled as censored
observations.

Steps:
1. Normalize the evidence table into canonical quantification records
2. Fit the missing-value detection curve and the noise prior
3. Aggregate peptides into per-protein likelihoods
4. Infer posteriors and posterior error probabilities per protein
5. Calibrate q-values with decoy proteins

For DIA-NN and MaxQuant input a run mapping file is required: a headerless
tab-separated file with columns run, condition and optionally sample and
fraction.

One result table is written per pair of conditions. With more than one
comparison the comparison label is inserted into the output file name.
")]
struct Args {
    /// Path to the evidence table
    #[arg(value_name = "IN_FILE")]
    input: PathBuf,

    /// Path to the protein result table
    #[arg(long, value_name = "FILE", default_value = "proteins.tsv")]
    out_file: PathBuf,

    /// Evidence table layout
    #[arg(long, value_enum, default_value_t = InputFormat::Triqler)]
    input_format: InputFormat,

    /// Run to condition mapping file
    #[arg(long, value_name = "FILE")]
    mapping: Option<PathBuf>,

    /// log2 fold change threshold for the differential expression claim
    #[arg(long, default_value_t = 1.0)]
    fold_change_eval: f64,

    /// Protein identifier prefix marking decoys
    #[arg(long, default_value = "decoy_")]
    decoy_pattern: String,

    /// Minimum number of observed peptide quantifications per protein
    #[arg(long, default_value_t = 2)]
    min_samples: usize,

    /// Missing-value regime of the acquisition
    #[arg(long, value_enum, default_value_t = MissingValuePrior::Default)]
    missing_value_prior: MissingValuePrior,

    /// Shared peptide policy
    #[arg(long, value_enum, default_value_t = SharedPeptides::Razor)]
    shared_peptides: SharedPeptides,

    /// Minimum number of decoy proteins needed to report q-values
    #[arg(long, default_value_t = 3)]
    min_decoys: usize,

    /// Use a t-test on run-level estimates instead of Bayesian inference
    #[arg(long)]
    ttest: bool,

    /// Pair runs by sample label in the t-test
    #[arg(long, requires = "ttest")]
    paired_ttest: bool,

    /// Skip per-run median normalization
    #[arg(long)]
    no_normalize: bool,

    /// Write consensus precursor quantifications
    #[arg(long)]
    write_spectrum_quants: bool,

    /// Write per-run protein posteriors
    #[arg(long)]
    write_protein_posteriors: bool,

    /// Write per-condition group posteriors
    #[arg(long)]
    write_group_posteriors: bool,

    /// Write fold-change posteriors
    #[arg(long)]
    write_fold_change_posteriors: bool,

    /// Number of threads to use for protein inference
    #[arg(long, default_value_t = get_num_cpus())]
    num_threads: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Force overwrite of output file if it exists
    #[arg(short, long)]
    force: bool,
}

fn run() -> EpqResult<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else {
        "warn"
    };

    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    log::info!("Starting epq quantification");
    log::info!("Input: {:?} ({})", args.input, args.input_format);
    log::info!("Output: {:?}", args.out_file);
    log::info!("Number of threads: {}", args.num_threads);

    if args.out_file.exists() && !args.force {
        return Err(EpqError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("Output file {:?} already exists. Use --force to overwrite.", args.out_file),
        )));
    }

    let config = QuantConfig {
        input_format: args.input_format,
        fold_change_eval: args.fold_change_eval,
        decoy_prefix: args.decoy_pattern,
        min_samples: args.min_samples,
        missing_value_prior: args.missing_value_prior,
        num_threads: args.num_threads,
        use_ttest: args.ttest,
        paired_ttest: args.paired_ttest,
        normalize_intensities: !args.no_normalize,
        shared_peptides: args.shared_peptides,
        min_decoys: args.min_decoys,
    };
    validate_config(&config)?;
    log::info!(
        "Configuration: fold_change_eval={}, min_samples={}, missing_value_prior={:?}, ttest={}",
        config.fold_change_eval,
        config.min_samples,
        config.missing_value_prior,
        config.use_ttest
    );

    let options = OutputOptions {
        spectrum_quants: args.write_spectrum_quants,
        protein_posteriors: args.write_protein_posteriors,
        group_posteriors: args.write_group_posteriors,
        fold_change_posteriors: args.write_fold_change_posteriors,
    };

    let _timer = Timer::new("Quantification");
    let result = run_pipeline(
        &args.input,
        args.mapping.as_deref(),
        &args.out_file,
        &config,
        &options,
    )?;

    log::info!("Quantification summary:");
    log::info!("  Proteins scored: {}", result.scored.len());
    log::info!("  Proteins excluded or failed: {}", result.diagnostics.len());
    for comparison in &result.comparisons {
        if comparison.q_values.is_available() {
            let passing = comparison
                .rows
                .iter()
                .filter(|r| r.q_value.is_some_and(|q| q <= 0.05))
                .count();
            log::info!("  {}: {} proteins at q <= 0.05", comparison.label, passing);
        } else {
            log::warn!(
                "  {}: too few decoys, q-values reported as NA",
                comparison.label
            );
        }
    }

    Ok(())
}

/// Handle application errors and provide user-friendly messages
fn handle_error(error: EpqError) -> ! {
    match error {
        EpqError::FileNotFound(path) => {
            eprintln!("Error: File not found: {}", path);
            eprintln!("Please check that the file exists and is readable.");
        }
        EpqError::MissingColumn { format, column } => {
            eprintln!("Error: Column '{}' not found in the {} input.", column, format);
            eprintln!("Please check --input-format against the header of the evidence table.");
        }
        EpqError::UnmappedRuns(runs) => {
            eprintln!("Error: Runs without a condition: {}", runs.join(", "));
            eprintln!("Please add every run to the mapping file.");
        }
        EpqError::MalformedMapping(msg) => {
            eprintln!("Error: Malformed run mapping: {}", msg);
            eprintln!("Expected tab-separated columns: run, condition, [sample], [fraction].");
        }
        EpqError::InvalidRecord(msg) => {
            eprintln!("Error: Invalid evidence record: {}", msg);
            eprintln!("Please check that your evidence table is properly formatted.");
        }
        EpqError::EmptyInput(msg) => {
            eprintln!("Error: No usable data: {}", msg);
            eprintln!("Please check that the evidence table contains quantified precursors.");
        }
        EpqError::InvalidConfig(msg) => {
            eprintln!("Error: Invalid configuration: {}", msg);
            eprintln!("Please check your command line parameters.");
        }
        EpqError::ModelFit(msg) => {
            eprintln!("Error: Model fitting failed: {}", msg);
            eprintln!("The evidence table may not contain enough observed intensities.");
        }
        EpqError::Io(ref e) => {
            eprintln!("Error: I/O error: {}", e);
            eprintln!("Please check file permissions and disk space.");
        }
        EpqError::Csv(ref e) => {
            eprintln!("Error: Table parsing error: {}", e);
            eprintln!("Please check that the input is tab-separated.");
        }
    }
    std::process::exit(1);
}

fn main() {
    if let Err(e) = run() {
        handle_error(e);
    }
}
