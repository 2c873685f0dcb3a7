//! CLI binary for epq_convert - normalize vendor evidence tables into the canonical layout

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::Env;
use epq_rs::{
    input::{read_evidence, read_run_mapping, write_canonical},
    utils::{validate_file_readable, Timer},
    InputFormat, QuantConfig,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "epq_convert")]
#[command(about = "Convert DIA-NN, MaxQuant or triqler evidence into the canonical epq table")]
#[command(long_about = "
epq_convert reads an evidence table in one of the supported layouts, applies
the run mapping and writes the canonical tab-separated table with columns
run, condition, charge, searchScore, intensity, peptide and proteins.

Contaminants are dropped, decoys receive the decoy prefix and missing or
non-positive intensities are written as empty cells. Fractions of the same
sample are merged under the sample name.
")]
struct Args {
    /// Path to the evidence table
    #[arg(value_name = "IN_FILE")]
    input: PathBuf,

    /// Path to the canonical output table
    #[arg(value_name = "OUT_FILE")]
    output: PathBuf,

    /// Evidence table layout
    #[arg(long, value_enum, default_value_t = InputFormat::Diann)]
    input_format: InputFormat,

    /// Run to condition mapping file
    #[arg(long, value_name = "FILE")]
    mapping: Option<PathBuf>,

    /// Protein identifier prefix marking decoys
    #[arg(long, default_value = "decoy_")]
    decoy_pattern: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Force overwrite of output file if it exists
    #[arg(short, long)]
    force: bool,
}

fn run() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    if args.output.exists() && !args.force {
        bail!(
            "Output file {:?} already exists. Use --force to overwrite.",
            args.output
        );
    }

    validate_file_readable(&args.input)
        .with_context(|| format!("cannot read evidence table {:?}", args.input))?;

    let mappings = match &args.mapping {
        Some(path) => Some(
            read_run_mapping(path)
                .with_context(|| format!("failed to read run mapping {:?}", path))?,
        ),
        None => None,
    };

    let config = QuantConfig {
        input_format: args.input_format,
        decoy_prefix: args.decoy_pattern,
        ..QuantConfig::default()
    };

    let _timer = Timer::new("Conversion");
    let evidence = read_evidence(&args.input, mappings.as_deref(), &config)
        .with_context(|| format!("failed to normalize {:?}", args.input))?;
    write_canonical(&evidence.records, &args.output)
        .with_context(|| format!("failed to write {:?}", args.output))?;

    log::info!(
        "Wrote {} records for {} runs to {:?}",
        evidence.records.len(),
        evidence.experiment.num_runs(),
        args.output
    );
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_format_parsing() {
        let args = Args::parse_from([
            "epq_convert",
            "report.tsv",
            "out.tsv",
            "--input-format",
            "maxquant",
            "--mapping",
            "runs.tsv",
        ]);
        assert_eq!(args.input_format, InputFormat::Maxquant);
        assert_eq!(args.mapping, Some(PathBuf::from("runs.tsv")));
        assert!(Args::try_parse_from(["epq_convert", "a", "b", "--input-format", "mzml"]).is_err());
    }
}
