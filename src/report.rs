//! Point estimates derived from the final posterior: per-cell calls, donor
//! counts and read-weighted genotype summaries.

use std::collections::BTreeMap;

use ndarray::Array2;
use serde::Serialize;

use crate::counts::AlleleCounts;
use crate::hypothesis::Hypothesis;
use crate::restart::DemuxResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Call {
    Donor(usize),
    Doublet,
    Unassigned,
}

/// Derived calls for one cell.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CellAssignment {
    pub cell_id: String,
    pub call: Call,
    pub best: Hypothesis,
    pub best_prob: f64,
    pub second: Option<Hypothesis>,
    pub second_prob: f64,
    /// best_prob - second_prob
    pub margin: f64,
    /// total mass on all doublet hypotheses
    pub doublet_prob: f64,
    pub best_singlet: usize,
    pub best_singlet_prob: f64,
    pub best_doublet: Option<(usize, usize)>,
    /// best doublet expected log-lik minus best singlet expected log-lik
    pub doublet_log_lik_ratio: Option<f64>,
    pub n_covered: usize,
}

/// Display names: supplied names first, `donor{d}` for the rest.
pub fn donor_names(supplied: &[String], n_donors: usize) -> Vec<String> {
    (0..n_donors)
        .map(|d| supplied.get(d).cloned().unwrap_or_else(|| format!("donor{}", d)))
        .collect()
}

pub fn hypothesis_label(hypothesis: Hypothesis, names: &[String]) -> String {
    match hypothesis {
        Hypothesis::Singlet(d) => names[d].clone(),
        Hypothesis::Doublet(i, j) => format!("{},{}", names[i], names[j]),
        Hypothesis::Unassigned => "unassigned".to_string(),
    }
}

pub fn call_label(call: Call, names: &[String]) -> String {
    match call {
        Call::Donor(d) => names[d].clone(),
        Call::Doublet => "doublet".to_string(),
        Call::Unassigned => "unassigned".to_string(),
    }
}

fn argmax(values: impl Iterator<Item = (usize, f64)>) -> Option<(usize, f64)> {
    values.fold(None, |best, (i, v)| match best {
        Some((_, bv)) if bv >= v => best,
        _ => Some((i, v)),
    })
}

/// Per-cell calls with the given minimum singlet/doublet probability.
pub fn assign_cells(result: &DemuxResult, counts: &AlleleCounts, min_call_prob: f64) -> Vec<CellAssignment> {
    let hypotheses = &result.hypotheses;
    let n_donors = hypotheses.n_donors();
    let posterior = &result.posterior;

    (0..posterior.nrows())
        .map(|cell| {
            let row = posterior.row(cell);
            let mut order: Vec<usize> = (0..row.len()).collect();
            order.sort_by(|&a, &b| row[b].total_cmp(&row[a]).then(a.cmp(&b)));
            let best = order[0];
            let second = order.get(1).copied();
            let second_prob = second.map_or(0.0, |h| row[h]);

            let doublet_prob: f64 = hypotheses.doublet_columns().map(|h| row[h]).sum();
            let (best_singlet, best_singlet_prob) =
                argmax((0..n_donors).map(|d| (d, row[hypotheses.singlet_index(d)]))).unwrap_or((0, 0.0));
            let best_doublet_column = argmax(hypotheses.doublet_columns().map(|h| (h, row[h])));
            let best_doublet = best_doublet_column.map(|(h, _)| match hypotheses.get(h) {
                Hypothesis::Doublet(i, j) => (i, j),
                _ => unreachable!("doublet columns hold doublet hypotheses"),
            });

            let ll = result.log_lik.row(cell);
            let doublet_log_lik_ratio = if hypotheses.has_doublets() {
                let best_singlet_ll = (0..n_donors).map(|d| ll[d]).fold(f64::NEG_INFINITY, f64::max);
                let best_doublet_ll = hypotheses.doublet_columns().map(|h| ll[h]).fold(f64::NEG_INFINITY, f64::max);
                Some(best_doublet_ll - best_singlet_ll)
            } else {
                None
            };

            let call = if best_singlet_prob >= min_call_prob {
                Call::Donor(best_singlet)
            } else if hypotheses.has_doublets() && doublet_prob >= min_call_prob {
                Call::Doublet
            } else {
                Call::Unassigned
            };

            CellAssignment {
                cell_id: result.cell_ids[cell].clone(),
                call,
                best: hypotheses.get(best),
                best_prob: row[best],
                second: second.map(|h| hypotheses.get(h)),
                second_prob,
                margin: row[best] - second_prob,
                doublet_prob,
                best_singlet,
                best_singlet_prob,
                best_doublet,
                doublet_log_lik_ratio,
                n_covered: counts.n_covered(cell),
            }
        })
        .collect()
}

/// Number of cells per call label: every donor, then `doublet` and `unassigned`.
pub fn call_counts(calls: &[CellAssignment], n_donors: usize) -> Vec<(Call, usize)> {
    let mut tally: BTreeMap<usize, usize> = BTreeMap::new();
    let mut doublets = 0;
    let mut unassigned = 0;
    for c in calls {
        match c.call {
            Call::Donor(d) => *tally.entry(d).or_default() += 1,
            Call::Doublet => doublets += 1,
            Call::Unassigned => unassigned += 1,
        }
    }
    let mut out: Vec<(Call, usize)> = (0..n_donors)
        .map(|d| (Call::Donor(d), tally.get(&d).copied().unwrap_or(0)))
        .collect();
    out.push((Call::Doublet, doublets));
    out.push((Call::Unassigned, unassigned));
    out
}

/// Posterior-weighted (alt, total) reads per donor and SNP from singlet mass.
pub fn weighted_reads(result: &DemuxResult, counts: &AlleleCounts) -> (Array2<f64>, Array2<f64>) {
    let n_donors = result.hypotheses.n_donors();
    let mut alt = Array2::zeros((n_donors, counts.n_snps()));
    let mut depth = Array2::zeros((n_donors, counts.n_snps()));
    for cell in 0..counts.n_cells() {
        for d in 0..n_donors {
            let w = result.posterior[[cell, result.hypotheses.singlet_index(d)]];
            if w == 0.0 {
                continue;
            }
            for e in counts.cell_entries(cell) {
                alt[[d, e.snp]] += w * e.alt_count as f64;
                depth[[d, e.snp]] += w * e.depth() as f64;
            }
        }
    }
    (alt, depth)
}
