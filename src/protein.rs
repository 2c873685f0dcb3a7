//! Protein grouping, shared-peptide resolution and the minimum-evidence filter

use crate::consensus::FeatureMatrix;
use crate::{QuantConfig, SharedPeptides};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Peptide features assigned to one protein identifier
#[derive(Debug, Clone, PartialEq)]
pub struct ProteinGroup {
    pub protein: String,
    pub is_decoy: bool,
    /// Indices into `FeatureMatrix::features`
    pub features: Vec<usize>,
}

impl ProteinGroup {
    /// Distinct peptide sequences, sorted
    pub fn peptides(&self, matrix: &FeatureMatrix) -> Vec<String> {
        self.features
            .iter()
            .map(|&f| matrix.features[f].peptide.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Number of observed (feature, run) quantifications
    pub fn observed_count(&self, matrix: &FeatureMatrix) -> usize {
        self.features
            .iter()
            .map(|&f| matrix.features[f].observed())
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticStatus {
    /// Removed before inference
    Excluded,
    /// Inference was attempted but produced no usable posterior
    Failed,
}

impl fmt::Display for DiagnosticStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticStatus::Excluded => write!(f, "excluded"),
            DiagnosticStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One entry of the diagnostic report
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub protein: String,
    pub status: DiagnosticStatus,
    pub reason: String,
}

/// Group features by protein, resolving shared peptides per the configured policy.
/// Groups are returned sorted by identifier.
pub fn group_proteins(matrix: &FeatureMatrix, config: &QuantConfig) -> Vec<ProteinGroup> {
    // Peptide support per candidate protein, used for razor assignment
    let mut support: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for f in &matrix.features {
        for p in &f.proteins {
            support.entry(p).or_default().insert(&f.peptide);
        }
    }

    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    let mut discarded = 0usize;

    for (i, f) in matrix.features.iter().enumerate() {
        let owner = match (f.proteins.as_slice(), config.shared_peptides) {
            ([], _) => None,
            ([single], _) => Some(single.as_str()),
            (_, SharedPeptides::Discard) => None,
            (candidates, SharedPeptides::Razor) => {
                // Candidates are sorted, so ties resolve to the first identifier
                let mut best: Option<(&str, usize)> = None;
                for p in candidates {
                    let n = support.get(p.as_str()).map_or(0, |s| s.len());
                    if best.map_or(true, |(_, m)| n > m) {
                        best = Some((p, n));
                    }
                }
                best.map(|(p, _)| p)
            }
        };

        match owner {
            Some(p) => groups.entry(p).or_default().push(i),
            None => discarded += 1,
        }
    }

    if discarded > 0 {
        log::info!("Discarded {} shared precursor features", discarded);
    }

    groups
        .into_iter()
        .map(|(protein, features)| ProteinGroup {
            protein: protein.to_string(),
            is_decoy: config.is_decoy(protein),
            features,
        })
        .collect()
}

/// Keep proteins with at least `min_samples` observed quantifications
pub fn filter_min_samples(
    groups: Vec<ProteinGroup>,
    matrix: &FeatureMatrix,
    min_samples: usize,
) -> (Vec<ProteinGroup>, Vec<Diagnostic>) {
    let mut retained = Vec::with_capacity(groups.len());
    let mut excluded = Vec::new();

    for group in groups {
        let observed = group.observed_count(matrix);
        if observed >= min_samples {
            retained.push(group);
        } else {
            excluded.push(Diagnostic {
                reason: format!(
                    "{} observed quantifications, at least {} required",
                    observed, min_samples
                ),
                protein: group.protein,
                status: DiagnosticStatus::Excluded,
            });
        }
    }

    log::info!(
        "{} proteins retained, {} excluded by the minimum-samples filter",
        retained.len(),
        excluded.len()
    );
    (retained, excluded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::Feature;
    use crate::input::Experiment;

    fn feature(peptide: &str, proteins: &[&str], levels: Vec<Option<f64>>) -> Feature {
        Feature {
            peptide: peptide.to_string(),
            charge: 2,
            proteins: proteins.iter().map(|p| p.to_string()).collect(),
            search_score: 1.0,
            levels,
        }
    }

    fn matrix(features: Vec<Feature>) -> FeatureMatrix {
        let entries = vec![
            ("r1".to_string(), "A".to_string(), None),
            ("r2".to_string(), "A".to_string(), None),
            ("r3".to_string(), "B".to_string(), None),
        ];
        FeatureMatrix {
            experiment: Experiment::new(&entries).unwrap(),
            features,
            run_shifts: vec![0.0; 3],
        }
    }

    #[test]
    fn test_razor_assignment() {
        let all = vec![Some(1.0); 3];
        let m = matrix(vec![
            feature("AK", &["P1"], all.clone()),
            feature("CK", &["P1"], all.clone()),
            feature("DK", &["P1", "P2"], all.clone()),
            feature("EK", &["P2"], all.clone()),
            feature("FK", &["P3", "P4"], all.clone()),
        ]);
        let groups = group_proteins(&m, &QuantConfig::default());
        let ids: Vec<&str> = groups.iter().map(|g| g.protein.as_str()).collect();
        assert_eq!(ids, vec!["P1", "P2", "P3"]);
        assert_eq!(groups[0].features, vec![0, 1, 2]);
        assert_eq!(groups[1].features, vec![3]);
        // P3 and P4 tie on support
        assert_eq!(groups[2].features, vec![4]);
    }

    #[test]
    fn test_discard_shared() {
        let all = vec![Some(1.0); 3];
        let m = matrix(vec![
            feature("AK", &["P1"], all.clone()),
            feature("DK", &["P1", "P2"], all.clone()),
        ]);
        let config = QuantConfig {
            shared_peptides: SharedPeptides::Discard,
            ..QuantConfig::default()
        };
        let groups = group_proteins(&m, &config);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].features, vec![0]);
    }

    #[test]
    fn test_decoy_flag() {
        let m = matrix(vec![feature("AK", &["decoy_P1"], vec![Some(1.0); 3])]);
        let groups = group_proteins(&m, &QuantConfig::default());
        assert!(groups[0].is_decoy);
    }

    #[test]
    fn test_min_samples_boundary() {
        // P1 has 3 observations, P2 has 2
        let m = matrix(vec![
            feature("AK", &["P1"], vec![Some(1.0), Some(1.0), Some(1.0)]),
            feature("CK", &["P2"], vec![Some(1.0), None, Some(1.0)]),
        ]);
        let groups = group_proteins(&m, &QuantConfig::default());

        let (kept, excluded) = filter_min_samples(groups.clone(), &m, 3);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].protein, "P1");
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].protein, "P2");
        assert_eq!(excluded[0].status, DiagnosticStatus::Excluded);

        let (kept, excluded) = filter_min_samples(groups, &m, 2);
        assert_eq!(kept.len(), 2);
        assert!(excluded.is_empty());
    }

    #[test]
    fn test_peptides_are_distinct() {
        let mut charged = feature("AK", &["P1"], vec![Some(1.0); 3]);
        charged.charge = 3;
        let m = matrix(vec![feature("AK", &["P1"], vec![Some(1.0); 3]), charged]);
        let groups = group_proteins(&m, &QuantConfig::default());
        assert_eq!(groups[0].peptides(&m), vec!["AK"]);
        assert_eq!(groups[0].observed_count(&m), 6);
    }
}
