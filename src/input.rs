//! Evidence table normalization into the canonical quantification table

use crate::{
    utils::{create_output, open_maybe_gzipped}, EpqError, EpqResult, InputFormat, QuantConfig, QuantRecord,
    RunMapping,
};
use std::collections::{BTreeSet, HashMap};
use std::io::{BufRead, Write};
use std::path::Path;

/// Header of the canonical table
pub const CANONICAL_HEADER: [&str; 7] = [
    "run",
    "condition",
    "charge",
    "searchScore",
    "intensity",
    "peptide",
    "proteins",
];

/// Runs and conditions of an experiment, in a fixed order
#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    pub runs: Vec<String>,
    pub conditions: Vec<String>,
    pub run_condition: Vec<usize>,
    pub run_sample: Vec<Option<String>>,
    index: HashMap<String, usize>,
}

impl Experiment {
    /// Build from `(run, condition, sample)` triples. Condition order follows
    /// first appearance; runs are ordered by condition, then by appearance.
    pub fn new(entries: &[(String, String, Option<String>)]) -> EpqResult<Self> {
        let mut conditions: Vec<String> = Vec::new();
        let mut seen: HashMap<&str, &str> = HashMap::new();

        for (run, condition, _) in entries {
            if let Some(existing) = seen.get(run.as_str()) {
                if *existing != condition.as_str() {
                    return Err(EpqError::MalformedMapping(format!(
                        "run '{}' is assigned to conditions '{}' and '{}'",
                        run, existing, condition
                    )));
                }
                continue;
            }
            seen.insert(run, condition);
            if !conditions.contains(condition) {
                conditions.push(condition.clone());
            }
        }

        if conditions.len() < 2 {
            return Err(EpqError::InvalidConfig(format!(
                "at least two conditions are required, found {}",
                conditions.len()
            )));
        }

        let mut runs = Vec::new();
        let mut run_condition = Vec::new();
        let mut run_sample = Vec::new();
        for (c, condition) in conditions.iter().enumerate() {
            let mut added = BTreeSet::new();
            for (run, cond, sample) in entries {
                if cond == condition && added.insert(run.clone()) {
                    runs.push(run.clone());
                    run_condition.push(c);
                    run_sample.push(sample.clone());
                }
            }
        }

        let index = runs
            .iter()
            .enumerate()
            .map(|(i, r)| (r.clone(), i))
            .collect();

        Ok(Experiment {
            runs,
            conditions,
            run_condition,
            run_sample,
            index,
        })
    }

    pub fn run_index(&self, run: &str) -> Option<usize> {
        self.index.get(run).copied()
    }

    pub fn num_runs(&self) -> usize {
        self.runs.len()
    }

    pub fn runs_in(&self, condition: usize) -> impl Iterator<Item = usize> + '_ {
        self.run_condition
            .iter()
            .enumerate()
            .filter(move |(_, &c)| c == condition)
            .map(|(r, _)| r)
    }

    /// All condition pairs `(i, j)` with `i < j`; fold change is `j` over `i`
    pub fn comparisons(&self) -> Vec<(usize, usize)> {
        let n = self.conditions.len();
        (0..n)
            .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
            .collect()
    }

    pub fn comparison_label(&self, (i, j): (usize, usize)) -> String {
        format!("{}_vs_{}", self.conditions[j], self.conditions[i])
    }
}

/// Canonical records together with the experimental design they reference
#[derive(Debug, Clone)]
pub struct Evidence {
    pub records: Vec<QuantRecord>,
    pub experiment: Experiment,
}

/// Parse a headerless run mapping file: `run condition [sample] [fraction]`
pub fn read_run_mapping<P: AsRef<Path>>(path: P) -> EpqResult<Vec<RunMapping>> {
    let reader = open_maybe_gzipped(&path)?;
    let mut mappings = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim_end();
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        if fields.len() < 2 || fields[0].is_empty() || fields[1].is_empty() {
            return Err(EpqError::MalformedMapping(format!(
                "line {}: expected at least run and condition columns, got '{}'",
                line_no + 1,
                line
            )));
        }

        let optional = |i: usize| {
            fields
                .get(i)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
        };

        mappings.push(RunMapping {
            run: fields[0].to_string(),
            condition: fields[1].to_string(),
            sample: optional(2),
            fraction: optional(3),
        });
    }

    if mappings.is_empty() {
        return Err(EpqError::MalformedMapping(format!(
            "no entries in {}",
            path.as_ref().display()
        )));
    }
    Ok(mappings)
}

/// Column indices for one of the supported evidence layouts
#[derive(Debug, Clone)]
pub struct ColumnIndices {
    pub run: usize,
    pub condition: Option<usize>,
    pub charge: usize,
    pub score: usize,
    /// DIA-NN only reports q-values; those are transformed to -log10(q)
    pub score_is_q_value: bool,
    pub intensity: usize,
    pub peptide: usize,
    pub proteins: usize,
    pub decoy: Option<usize>,
    pub reverse: Option<usize>,
    pub contaminant: Option<usize>,
}

impl ColumnIndices {
    pub fn from_header(header: &csv::StringRecord, format: InputFormat) -> EpqResult<Self> {
        let find = |name: &str| header.iter().position(|col| col.trim() == name);
        let require = |name: &str| {
            find(name).ok_or_else(|| EpqError::MissingColumn {
                format,
                column: name.to_string(),
            })
        };

        match format {
            InputFormat::Triqler => Ok(ColumnIndices {
                run: require("run")?,
                condition: Some(require("condition")?),
                charge: require("charge")?,
                score: require("searchScore")?,
                score_is_q_value: false,
                intensity: require("intensity")?,
                peptide: require("peptide")?,
                proteins: require("proteins")?,
                decoy: None,
                reverse: None,
                contaminant: None,
            }),
            InputFormat::Diann => {
                let peptide = find("Modified.Sequence")
                    .or_else(|| find("Stripped.Sequence"))
                    .ok_or_else(|| EpqError::MissingColumn {
                        format,
                        column: "Modified.Sequence".to_string(),
                    })?;
                let (score, score_is_q_value) = match find("CScore") {
                    Some(i) => (i, false),
                    None => (require("Q.Value")?, true),
                };
                Ok(ColumnIndices {
                    run: require("Run")?,
                    condition: None,
                    charge: require("Precursor.Charge")?,
                    score,
                    score_is_q_value,
                    intensity: require("Precursor.Quantity")?,
                    peptide,
                    proteins: require("Protein.Ids")?,
                    decoy: find("Decoy"),
                    reverse: None,
                    contaminant: None,
                })
            }
            InputFormat::Maxquant => Ok(ColumnIndices {
                run: require("Raw file")?,
                condition: None,
                charge: require("Charge")?,
                score: require("Score")?,
                score_is_q_value: false,
                intensity: require("Intensity")?,
                peptide: require("Modified sequence")?,
                proteins: require("Proteins")?,
                decoy: None,
                reverse: find("Reverse"),
                contaminant: find("Potential contaminant"),
            }),
        }
    }
}

/// Parse an intensity cell; empty, non-numeric, zero and negative values are missing
fn parse_intensity(field: &str) -> Option<f64> {
    field
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|x| x.is_finite() && *x > 0.0)
}

fn split_proteins(field: &str) -> impl Iterator<Item = &str> {
    field
        .split(|c| c == ';' || c == '\t')
        .map(str::trim)
        .filter(|p| !p.is_empty())
}

fn with_decoy_prefix(protein: &str, prefix: &str) -> String {
    let stripped = protein.strip_prefix("REV__").unwrap_or(protein);
    if stripped.starts_with(prefix) {
        stripped.to_string()
    } else {
        format!("{}{}", prefix, stripped)
    }
}

/// Parse one evidence row. `Ok(None)` means the row is intentionally skipped.
fn parse_row(
    record: &csv::StringRecord,
    idx: &ColumnIndices,
    config: &QuantConfig,
) -> EpqResult<Option<QuantRecord>> {
    let field = |i: usize| record.get(i).unwrap_or("").trim();

    if let Some(c) = idx.contaminant {
        if field(c) == "+" {
            return Ok(None);
        }
    }

    let run = field(idx.run).to_string();
    let peptide = field(idx.peptide).to_string();
    if run.is_empty() || peptide.is_empty() {
        return Ok(None);
    }

    let charge = field(idx.charge)
        .parse::<f64>()
        .ok()
        .filter(|c| *c >= 0.0 && *c <= u8::MAX as f64)
        .map(|c| c as u8)
        .ok_or_else(|| {
            EpqError::InvalidRecord(format!("invalid charge '{}'", field(idx.charge)))
        })?;

    let raw_score = field(idx.score);
    let search_score = match raw_score.parse::<f64>() {
        Ok(q) if idx.score_is_q_value => -(q.max(f64::MIN_POSITIVE)).log10(),
        Ok(s) if s.is_finite() => s,
        _ => {
            return Err(EpqError::InvalidRecord(format!(
                "invalid search score '{}'",
                raw_score
            )))
        }
    };

    // The triqler protein field may span all trailing columns
    let protein_field = if idx.condition.is_some() {
        record
            .iter()
            .skip(idx.proteins)
            .collect::<Vec<_>>()
            .join("\t")
    } else {
        field(idx.proteins).to_string()
    };

    let is_decoy_row = idx
        .decoy
        .map(|i| field(i).parse::<f64>().map(|d| d != 0.0).unwrap_or(false))
        .unwrap_or(false)
        || idx.reverse.map(|i| field(i) == "+").unwrap_or(false);

    let mut proteins: Vec<String> = split_proteins(&protein_field)
        .map(|p| {
            if is_decoy_row {
                with_decoy_prefix(p, &config.decoy_prefix)
            } else {
                p.to_string()
            }
        })
        .collect();
    proteins.dedup();
    if proteins.is_empty() {
        return Ok(None);
    }

    let condition = idx
        .condition
        .map(|i| field(i).to_string())
        .unwrap_or_default();

    Ok(Some(QuantRecord::new(
        run,
        condition,
        charge,
        search_score,
        parse_intensity(field(idx.intensity)),
        peptide,
        proteins,
    )))
}

/// Read raw evidence rows without applying any run mapping
pub fn read_evidence_rows<P: AsRef<Path>>(
    path: P,
    config: &QuantConfig,
) -> EpqResult<Vec<QuantRecord>> {
    let reader = open_maybe_gzipped(&path)?;
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .quoting(false)
        .from_reader(reader);

    let header = csv_reader.headers()?.clone();
    let idx = ColumnIndices::from_header(&header, config.input_format)?;

    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for (i, result) in csv_reader.records().enumerate() {
        let record = result?;
        match parse_row(&record, &idx, config) {
            Ok(Some(row)) => rows.push(row),
            Ok(None) => skipped += 1,
            Err(e) => {
                log::warn!("Skipping row {}: {}", i + 2, e);
                skipped += 1;
            }
        }
    }

    if skipped > 0 {
        log::info!("Skipped {} unusable rows in {:?}", skipped, path.as_ref());
    }
    Ok(rows)
}

/// Apply a run mapping, validating that every run is covered
pub fn apply_run_mapping(
    rows: Vec<QuantRecord>,
    mappings: &[RunMapping],
) -> EpqResult<Vec<QuantRecord>> {
    let mut by_run: HashMap<&str, &RunMapping> = HashMap::new();
    for m in mappings {
        if let Some(prev) = by_run.insert(&m.run, m) {
            if prev.condition != m.condition {
                return Err(EpqError::MalformedMapping(format!(
                    "run '{}' is assigned to conditions '{}' and '{}'",
                    m.run, prev.condition, m.condition
                )));
            }
        }
    }

    // Fractions of one sample must agree on the condition
    let mut sample_condition: HashMap<&str, &str> = HashMap::new();
    for m in mappings {
        let quant_run = m.quant_run();
        match sample_condition.get(quant_run) {
            Some(c) if *c != m.condition => {
                return Err(EpqError::MalformedMapping(format!(
                    "sample '{}' has fractions in conditions '{}' and '{}'",
                    quant_run, c, m.condition
                )))
            }
            _ => {
                sample_condition.insert(quant_run, &m.condition);
            }
        }
    }

    let unmapped: BTreeSet<String> = rows
        .iter()
        .filter(|r| !by_run.contains_key(r.run.as_str()))
        .map(|r| r.run.clone())
        .collect();
    if !unmapped.is_empty() {
        return Err(EpqError::UnmappedRuns(unmapped.into_iter().collect()));
    }

    Ok(rows
        .into_iter()
        .map(|mut r| {
            let m = by_run[r.run.as_str()];
            r.condition = m.condition.clone();
            r.run = m.quant_run().to_string();
            r
        })
        .collect())
}

/// Build the experiment from the runs that actually occur in the evidence.
/// With a mapping, condition order follows the mapping file.
fn experiment_for(records: &[QuantRecord], mappings: Option<&[RunMapping]>) -> EpqResult<Experiment> {
    let present: BTreeSet<&str> = records.iter().map(|r| r.run.as_str()).collect();

    let entries: Vec<(String, String, Option<String>)> = match mappings {
        Some(mappings) => {
            let mut entries = Vec::new();
            for m in mappings {
                let run = m.quant_run();
                if present.contains(run) {
                    entries.push((run.to_string(), m.condition.clone(), m.sample.clone()));
                } else {
                    log::debug!("Mapped run '{}' has no evidence rows", m.run);
                }
            }
            entries
        }
        None => records
            .iter()
            .map(|r| (r.run.clone(), r.condition.clone(), None))
            .collect(),
    };

    Experiment::new(&entries)
}

/// Read an evidence table and normalize it into canonical records.
///
/// DIA-NN and MaxQuant tables carry no condition column, so a mapping is
/// required for them. For triqler tables a mapping, when given, overrides the
/// in-table conditions.
pub fn read_evidence<P: AsRef<Path>>(
    path: P,
    mappings: Option<&[RunMapping]>,
    config: &QuantConfig,
) -> EpqResult<Evidence> {
    let rows = read_evidence_rows(&path, config)?;

    let records = match (mappings, config.input_format) {
        (Some(m), _) => apply_run_mapping(rows, m)?,
        (None, InputFormat::Triqler) => {
            if let Some(r) = rows.iter().find(|r| r.condition.is_empty()) {
                return Err(EpqError::UnmappedRuns(vec![r.run.clone()]));
            }
            rows
        }
        (None, format) => {
            return Err(EpqError::InvalidConfig(format!(
                "a run mapping file is required for {} input",
                format
            )))
        }
    };

    if records.is_empty() {
        return Err(EpqError::EmptyInput(format!(
            "no usable rows in {}",
            path.as_ref().display()
        )));
    }

    let experiment = experiment_for(&records, mappings)?;
    log::info!(
        "Read {} records over {} runs and {} conditions",
        records.len(),
        experiment.num_runs(),
        experiment.conditions.len()
    );

    Ok(Evidence {
        records,
        experiment,
    })
}

/// Write records in the canonical (triqler) layout
pub fn write_canonical<P: AsRef<Path>>(records: &[QuantRecord], path: P) -> EpqResult<()> {
    let mut writer = create_output(path)?;
    writeln!(writer, "{}", CANONICAL_HEADER.join("\t"))?;
    for r in records {
        let intensity = r.intensity.map(|i| i.to_string()).unwrap_or_default();
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            r.run,
            r.condition,
            r.charge,
            r.search_score,
            intensity,
            r.peptide,
            r.proteins.join("\t")
        )?;
    }
    writer.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn config(format: InputFormat) -> QuantConfig {
        QuantConfig {
            input_format: format,
            ..QuantConfig::default()
        }
    }

    fn mapping_file(lines: &[&str]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        for l in lines {
            writeln!(f, "{}", l).unwrap();
        }
        f
    }

    #[test]
    fn test_read_triqler() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "run\tcondition\tcharge\tsearchScore\tintensity\tpeptide\tproteins").unwrap();
        writeln!(f, "r1\tA\t2\t3.5\t1000\tPEPTIDEK\tP1\tP2").unwrap();
        writeln!(f, "r2\tB\t2\t2.5\t0\tPEPTIDEK\tP1").unwrap();
        writeln!(f, "r2\tB\t3\t2.0\tNaN\tOTHERK\tP3;P4").unwrap();

        let ev = read_evidence(f.path(), None, &config(InputFormat::Triqler)).unwrap();
        assert_eq!(ev.records.len(), 3);
        assert_eq!(ev.records[0].proteins, vec!["P1", "P2"]);
        assert_eq!(ev.records[0].intensity, Some(1000.0));
        assert_eq!(ev.records[1].intensity, None);
        assert_eq!(ev.records[2].intensity, None);
        assert_eq!(ev.records[2].proteins, vec!["P3", "P4"]);
        assert_eq!(ev.experiment.conditions, vec!["A", "B"]);
        assert_eq!(ev.experiment.runs, vec!["r1", "r2"]);
    }

    #[test]
    fn test_missing_column_is_config_error() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "run\tcondition\tcharge\tintensity\tpeptide\tproteins").unwrap();
        writeln!(f, "r1\tA\t2\t1000\tPEPTIDEK\tP1").unwrap();

        let err = read_evidence(f.path(), None, &config(InputFormat::Triqler)).unwrap_err();
        match err {
            EpqError::MissingColumn { column, .. } => assert_eq!(column, "searchScore"),
            e => panic!("unexpected error {:?}", e),
        }
    }

    #[test]
    fn test_read_maxquant_with_mapping() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "Raw file\tModified sequence\tCharge\tScore\tIntensity\tProteins\tReverse\tPotential contaminant").unwrap();
        writeln!(f, "run1\t_PEPK_\t2\t100\t5e6\tP1\t\t").unwrap();
        writeln!(f, "run2\t_PEPK_\t2\t90\t\tP1\t\t").unwrap();
        writeln!(f, "run2\t_DECK_\t2\t10\t1e5\tREV__P9\t+\t").unwrap();
        writeln!(f, "run1\t_KRTK_\t2\t50\t1e5\tCON__K1\t\t+").unwrap();

        let m = mapping_file(&["run1\tctrl", "run2\ttreated"]);
        let mappings = read_run_mapping(m.path()).unwrap();
        let ev = read_evidence(f.path(), Some(&mappings), &config(InputFormat::Maxquant)).unwrap();

        assert_eq!(ev.records.len(), 3);
        assert_eq!(ev.records[0].condition, "ctrl");
        assert_eq!(ev.records[1].intensity, None);
        assert_eq!(ev.records[2].proteins, vec!["decoy_P9"]);
    }

    #[test]
    fn test_read_diann_q_value_score() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "Run\tProtein.Ids\tStripped.Sequence\tPrecursor.Charge\tPrecursor.Quantity\tQ.Value").unwrap();
        writeln!(f, "a\tP1;P2\tPEPK\t2\t1200.5\t0.001").unwrap();
        writeln!(f, "b\tP1;P2\tPEPK\t2\t1100.0\t0.01").unwrap();

        let m = mapping_file(&["a\tX", "b\tY"]);
        let mappings = read_run_mapping(m.path()).unwrap();
        let ev = read_evidence(f.path(), Some(&mappings), &config(InputFormat::Diann)).unwrap();
        assert!((ev.records[0].search_score - 3.0).abs() < 1e-9);
        assert_eq!(ev.records[0].proteins, vec!["P1", "P2"]);
    }

    #[test]
    fn test_no_usable_rows_is_rejected() {
        let header = "run\tcondition\tcharge\tsearchScore\tintensity\tpeptide\tproteins";

        let mut header_only = NamedTempFile::new().unwrap();
        writeln!(header_only, "{}", header).unwrap();
        let err = read_evidence(header_only.path(), None, &config(InputFormat::Triqler)).unwrap_err();
        assert!(matches!(err, EpqError::EmptyInput(_)), "{:?}", err);

        let mut unparseable = NamedTempFile::new().unwrap();
        writeln!(unparseable, "{}", header).unwrap();
        writeln!(unparseable, "r1\tA\tcharge\t3.5\t1000\tPEPTIDEK\tP1").unwrap();
        writeln!(unparseable, "r2\tB\t2\tscore\t1000\tPEPTIDEK\tP1").unwrap();
        writeln!(unparseable, "r2\tB\t2\t3.5\t1000\t\tP1").unwrap();
        let err = read_evidence(unparseable.path(), None, &config(InputFormat::Triqler)).unwrap_err();
        assert!(matches!(err, EpqError::EmptyInput(_)), "{:?}", err);
    }

    #[test]
    fn test_all_intensities_missing_is_rejected() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "run\tcondition\tcharge\tsearchScore\tintensity\tpeptide\tproteins").unwrap();
        writeln!(f, "r1\tA\t2\t3.5\t0\tPEPTIDEK\tP1").unwrap();
        writeln!(f, "r2\tB\t2\t3.1\t\tPEPTIDEK\tP1").unwrap();
        writeln!(f, "r2\tB\t3\t2.0\t-5\tOTHERK\tP2").unwrap();

        // Rows survive normalization with missing markers, but no feature has a value
        let ev = read_evidence(f.path(), None, &config(InputFormat::Triqler)).unwrap();
        assert_eq!(ev.records.len(), 3);
        assert!(ev.records.iter().all(|r| r.intensity.is_none()));

        let err = crate::consensus::build_features(&ev).unwrap_err();
        assert!(matches!(err, EpqError::EmptyInput(_)), "{:?}", err);
    }

    #[test]
    fn test_unmapped_run_is_config_error() {
        let rows = vec![
            QuantRecord::new("r1".into(), String::new(), 2, 1.0, Some(1.0), "A".into(), vec!["P".into()]),
            QuantRecord::new("r9".into(), String::new(), 2, 1.0, Some(1.0), "A".into(), vec!["P".into()]),
        ];
        let mappings = vec![RunMapping::new("r1".into(), "A".into())];
        match apply_run_mapping(rows, &mappings).unwrap_err() {
            EpqError::UnmappedRuns(runs) => assert_eq!(runs, vec!["r9".to_string()]),
            e => panic!("unexpected error {:?}", e),
        }
    }

    #[test]
    fn test_mapping_required_for_vendor_formats() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "Run\tProtein.Ids\tStripped.Sequence\tPrecursor.Charge\tPrecursor.Quantity\tCScore").unwrap();
        writeln!(f, "a\tP1\tPEPK\t2\t1200.5\t0.9").unwrap();
        assert!(matches!(
            read_evidence(f.path(), None, &config(InputFormat::Diann)),
            Err(EpqError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_malformed_mapping() {
        let m = mapping_file(&["only_one_column"]);
        assert!(matches!(
            read_run_mapping(m.path()),
            Err(EpqError::MalformedMapping(_))
        ));

        let conflicting = vec![
            RunMapping::new("r1".into(), "A".into()),
            RunMapping::new("r1".into(), "B".into()),
        ];
        assert!(matches!(
            apply_run_mapping(Vec::new(), &conflicting),
            Err(EpqError::MalformedMapping(_))
        ));
    }

    #[test]
    fn test_fractions_collapse_to_sample() {
        let m = mapping_file(&[
            "# run\tcondition\tsample\tfraction",
            "f1\tA\ts1\t1",
            "f2\tA\ts1\t2",
            "f3\tB\ts2\t1",
        ]);
        let mappings = read_run_mapping(m.path()).unwrap();
        assert_eq!(mappings.len(), 3);

        let rows = ["f1", "f2", "f3"]
            .iter()
            .map(|r| {
                QuantRecord::new(r.to_string(), String::new(), 2, 1.0, Some(10.0), "PEPK".into(), vec!["P".into()])
            })
            .collect();
        let mapped = apply_run_mapping(rows, &mappings).unwrap();
        assert_eq!(mapped[0].run, "s1");
        assert_eq!(mapped[1].run, "s1");
        assert_eq!(mapped[2].run, "s2");

        let exp = experiment_for(&mapped, Some(&mappings)).unwrap();
        assert_eq!(exp.runs, vec!["s1", "s2"]);
    }

    #[test]
    fn test_single_condition_rejected() {
        let entries = vec![
            ("r1".to_string(), "A".to_string(), None),
            ("r2".to_string(), "A".to_string(), None),
        ];
        assert!(matches!(
            Experiment::new(&entries),
            Err(EpqError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_experiment_comparisons() {
        let entries = vec![
            ("r1".to_string(), "A".to_string(), None),
            ("r2".to_string(), "B".to_string(), None),
            ("r3".to_string(), "C".to_string(), None),
            ("r4".to_string(), "A".to_string(), None),
        ];
        let exp = Experiment::new(&entries).unwrap();
        assert_eq!(exp.runs, vec!["r1", "r4", "r2", "r3"]);
        assert_eq!(exp.comparisons(), vec![(0, 1), (0, 2), (1, 2)]);
        assert_eq!(exp.comparison_label((0, 1)), "B_vs_A");
        assert_eq!(exp.runs_in(0).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_canonical_round_trip() {
        let records = vec![
            QuantRecord::new("r1".into(), "A".into(), 2, 1.5, Some(100.0), "PEPK".into(), vec!["P1".into(), "P2".into()]),
            QuantRecord::new("r2".into(), "B".into(), 3, 0.5, None, "PEPK".into(), vec!["P1".into()]),
        ];
        let out = NamedTempFile::new().unwrap();
        write_canonical(&records, out.path()).unwrap();

        let ev = read_evidence(out.path(), None, &config(InputFormat::Triqler)).unwrap();
        assert_eq!(ev.records, records);
    }
}
