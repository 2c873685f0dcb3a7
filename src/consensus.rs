//! Spectrum-level consensus: one log2 quantification per precursor and run

use crate::input::{Evidence, Experiment};
use crate::{stats, EpqError, EpqResult};
use std::collections::HashMap;

/// A precursor (peptide + charge) quantified across all runs
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub peptide: String,
    pub charge: u8,
    pub proteins: Vec<String>,
    /// Best search score over all runs
    pub search_score: f64,
    /// log2 intensity per run, `None` where the precursor was not quantified
    pub levels: Vec<Option<f64>>,
}

impl Feature {
    pub fn observed(&self) -> usize {
        self.levels.iter().filter(|l| l.is_some()).count()
    }

    pub fn observed_levels(&self) -> impl Iterator<Item = f64> + '_ {
        self.levels.iter().filter_map(|l| *l)
    }

    /// Mean observed log2 level, the reference the feature is centered on
    pub fn mean_level(&self) -> Option<f64> {
        let n = self.observed();
        if n == 0 {
            None
        } else {
            Some(self.observed_levels().sum::<f64>() / n as f64)
        }
    }
}

/// All features of an experiment
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    pub experiment: Experiment,
    pub features: Vec<Feature>,
    /// Per-run log2 shift removed by normalization
    pub run_shifts: Vec<f64>,
}

#[derive(Clone, Copy)]
struct Best {
    score: f64,
    intensity: f64,
}

/// Collapse records into features, keeping per run the best-scoring record
/// that carries an intensity.
pub fn build_features(evidence: &Evidence) -> EpqResult<FeatureMatrix> {
    let experiment = evidence.experiment.clone();
    let n_runs = experiment.num_runs();

    struct Acc {
        proteins: Vec<String>,
        score: f64,
        best: Vec<Option<Best>>,
    }

    let mut table: HashMap<(&str, u8), Acc> = HashMap::new();
    for record in &evidence.records {
        let run = experiment.run_index(&record.run).ok_or_else(|| {
            EpqError::UnmappedRuns(vec![record.run.clone()])
        })?;

        let acc = table
            .entry((record.peptide.as_str(), record.charge))
            .or_insert_with(|| Acc {
                proteins: Vec::new(),
                score: f64::NEG_INFINITY,
                best: vec![None; n_runs],
            });

        for p in &record.proteins {
            if !acc.proteins.contains(p) {
                acc.proteins.push(p.clone());
            }
        }
        acc.score = acc.score.max(record.search_score);

        if let Some(intensity) = record.intensity {
            let replace = match acc.best[run] {
                Some(b) => record.search_score > b.score,
                None => true,
            };
            if replace {
                acc.best[run] = Some(Best {
                    score: record.search_score,
                    intensity,
                });
            }
        }
    }

    let mut features: Vec<Feature> = table
        .into_iter()
        .map(|((peptide, charge), mut acc)| {
            acc.proteins.sort();
            Feature {
                peptide: peptide.to_string(),
                charge,
                proteins: acc.proteins,
                search_score: acc.score,
                levels: acc
                    .best
                    .iter()
                    .map(|b| b.map(|b| b.intensity.log2()))
                    .collect(),
            }
        })
        .filter(|f| f.observed() > 0)
        .collect();

    features.sort_by(|a, b| {
        a.peptide
            .cmp(&b.peptide)
            .then(a.charge.cmp(&b.charge))
    });

    if features.is_empty() {
        return Err(EpqError::EmptyInput(
            "no precursor has a quantified intensity".to_string(),
        ));
    }

    log::info!(
        "Built {} precursor features from {} records",
        features.len(),
        evidence.records.len()
    );

    Ok(FeatureMatrix {
        experiment,
        features,
        run_shifts: vec![0.0; n_runs],
    })
}

impl FeatureMatrix {
    /// Median-center every run against the per-feature mean level. Only
    /// features seen in at least two runs inform the shift.
    pub fn normalized(&self) -> FeatureMatrix {
        const PASSES: usize = 2;
        let n_runs = self.experiment.num_runs();
        let mut features = self.features.clone();
        let mut run_shifts = self.run_shifts.clone();

        for _ in 0..PASSES {
            let mut deviations: Vec<Vec<f64>> = vec![Vec::new(); n_runs];
            for f in features.iter().filter(|f| f.observed() >= 2) {
                let Some(mean) = f.mean_level() else { continue };
                for (r, level) in f.levels.iter().enumerate() {
                    if let Some(l) = level {
                        deviations[r].push(l - mean);
                    }
                }
            }

            let shifts: Vec<f64> = deviations
                .iter()
                .map(|d| stats::median(d).unwrap_or(0.0))
                .collect();

            for f in features.iter_mut() {
                for (level, shift) in f.levels.iter_mut().zip(&shifts) {
                    if let Some(l) = level {
                        *l -= shift;
                    }
                }
            }
            for (total, shift) in run_shifts.iter_mut().zip(&shifts) {
                *total += shift;
            }
        }

        for (run, shift) in self.experiment.runs.iter().zip(&run_shifts) {
            log::debug!("Run {} normalization shift {:.3} log2", run, shift);
        }

        FeatureMatrix {
            experiment: self.experiment.clone(),
            features,
            run_shifts,
        }
    }

    /// Observed and missing value counts per run
    pub fn run_coverage(&self) -> Vec<(usize, usize)> {
        let mut coverage = vec![(0, 0); self.experiment.num_runs()];
        for f in &self.features {
            for (r, level) in f.levels.iter().enumerate() {
                match level {
                    Some(_) => coverage[r].0 += 1,
                    None => coverage[r].1 += 1,
                }
            }
        }
        coverage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QuantRecord;

    fn record(run: &str, cond: &str, score: f64, intensity: Option<f64>, peptide: &str) -> QuantRecord {
        QuantRecord::new(
            run.into(),
            cond.into(),
            2,
            score,
            intensity,
            peptide.into(),
            vec!["P1".into()],
        )
    }

    fn evidence(records: Vec<QuantRecord>) -> Evidence {
        let entries: Vec<_> = records
            .iter()
            .map(|r| (r.run.clone(), r.condition.clone(), None))
            .collect();
        Evidence {
            experiment: Experiment::new(&entries).unwrap(),
            records,
        }
    }

    #[test]
    fn test_best_scoring_record_wins() {
        let ev = evidence(vec![
            record("r1", "A", 1.0, Some(16.0), "PEPK"),
            record("r1", "A", 5.0, Some(64.0), "PEPK"),
            record("r1", "A", 9.0, None, "PEPK"),
            record("r2", "B", 1.0, None, "PEPK"),
        ]);
        let m = build_features(&ev).unwrap();
        assert_eq!(m.features.len(), 1);
        let f = &m.features[0];
        assert_eq!(f.levels, vec![Some(6.0), None]);
        assert_eq!(f.search_score, 9.0);
        assert_eq!(f.observed(), 1);
    }

    #[test]
    fn test_unquantified_features_dropped() {
        let ev = evidence(vec![
            record("r1", "A", 1.0, Some(16.0), "PEPK"),
            record("r2", "B", 1.0, None, "NOQUANTK"),
        ]);
        let m = build_features(&ev).unwrap();
        assert_eq!(m.features.len(), 1);
        assert_eq!(m.run_coverage(), vec![(1, 0), (0, 1)]);
    }

    #[test]
    fn test_normalization_removes_run_offset() {
        // Run r2 is uniformly twice as intense
        let mut records = Vec::new();
        for (i, pep) in ["AK", "CK", "DK", "EK"].iter().enumerate() {
            let base = 2f64.powi(10 + i as i32);
            records.push(record("r1", "A", 1.0, Some(base), pep));
            records.push(record("r2", "B", 1.0, Some(2.0 * base), pep));
        }
        let m = build_features(&evidence(records)).unwrap().normalized();

        assert!((m.run_shifts[1] - m.run_shifts[0] - 1.0).abs() < 1e-9);
        for f in &m.features {
            let l: Vec<f64> = f.observed_levels().collect();
            assert!((l[0] - l[1]).abs() < 1e-9);
        }
    }
}
