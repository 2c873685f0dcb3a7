//! Decoy-based q-value calibration of posterior error probabilities

/// A protein entering calibration for one comparison
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate<'a> {
    pub protein: &'a str,
    pub is_decoy: bool,
    pub pep: f64,
}

/// Outcome of calibrating one comparison
#[derive(Debug, Clone, PartialEq)]
pub enum QValues {
    /// q-value per candidate, in input order
    Available(Vec<f64>),
    /// Too few decoys to estimate the false discovery rate
    Unavailable { decoys: usize, required: usize },
}

impl QValues {
    pub fn get(&self, index: usize) -> Option<f64> {
        match self {
            QValues::Available(q) => q.get(index).copied(),
            QValues::Unavailable { .. } => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, QValues::Available(_))
    }

    /// Targets with q-value at or below `threshold`
    pub fn passing(&self, candidates: &[Candidate], threshold: f64) -> usize {
        match self {
            QValues::Available(q) => candidates
                .iter()
                .zip(q)
                .filter(|(c, q)| !c.is_decoy && **q <= threshold)
                .count(),
            QValues::Unavailable { .. } => 0,
        }
    }
}

/// Assign q-values from decoy counts.
///
/// # Invariants
/// * q-values are non-decreasing in PEP
/// * candidates with equal PEP receive the same q-value
pub fn calibrate(candidates: &[Candidate], min_decoys: usize) -> QValues {
    let decoys = candidates.iter().filter(|c| c.is_decoy).count();
    if decoys < min_decoys {
        log::warn!(
            "Only {} decoy proteins, at least {} are needed for q-values",
            decoys,
            min_decoys
        );
        return QValues::Unavailable {
            decoys,
            required: min_decoys,
        };
    }

    // Most confident first; identifiers break ties for a stable order
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| {
        candidates[a]
            .pep
            .total_cmp(&candidates[b].pep)
            .then_with(|| candidates[a].protein.cmp(candidates[b].protein))
    });

    let mut fdr = vec![0.0; candidates.len()];
    let (mut n_decoy, mut n_target) = (0usize, 0usize);
    let mut start = 0;
    while start < order.len() {
        let pep = candidates[order[start]].pep;
        let mut end = start;
        while end < order.len() && candidates[order[end]].pep == pep {
            match candidates[order[end]].is_decoy {
                true => n_decoy += 1,
                false => n_target += 1,
            }
            end += 1;
        }

        let value = if n_target == 0 {
            1.0
        } else {
            (n_decoy as f64 / n_target as f64).min(1.0)
        };
        for &i in &order[start..end] {
            fdr[i] = value;
        }
        start = end;
    }

    // Cumulative minimum from the least confident end
    let mut q_min = 1.0f64;
    let mut q = vec![0.0; candidates.len()];
    for &i in order.iter().rev() {
        q_min = q_min.min(fdr[i]);
        q[i] = q_min;
    }

    QValues::Available(q)
}
