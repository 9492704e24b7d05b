//! Log-likelihood of a cell's allele counts under each hypothesis.
//!
//! Every covered (cell, SNP) entry gets a table of log-likelihoods, one per
//! alt-fraction category. A category is an unordered pair of genotype
//! states whose alt fraction is the mean of the two states' fractions; a
//! singlet of genotype g uses the pair (g, g). Pair evidence is therefore a
//! lookup into the same table as singlet evidence.

use serde::Serialize;
use statrs::function::beta::ln_beta;
use statrs::function::factorial::ln_binomial;

use crate::config::{LikelihoodModel, UnassignedPolicy};
use crate::counts::{AlleleCounts, SnpCount};
use crate::genotype::{DonorGenotype, N_GENOTYPES};
use crate::hypothesis::{Hypothesis, HypothesisSet};

/// Alt-fraction categories: (0,0), (0,1), (0,2), (1,1), (1,2), (2,2).
pub const N_CATEGORIES: usize = 6;

/// Category of a singlet genotype state.
pub const SINGLET_CATEGORY: [usize; N_GENOTYPES] = [0, 3, 5];

/// Category of a doublet made of genotype states (gi, gj).
pub const PAIR_CATEGORY: [[usize; N_GENOTYPES]; N_GENOTYPES] = [[0, 1, 2], [1, 3, 4], [2, 4, 5]];

/// Expected alt-read fraction of each genotype state.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct AlleleFractions {
    pub theta: [f64; N_GENOTYPES],
}

impl AlleleFractions {
    /// Symmetric error model: `e`, 0.5 and `1 - e`.
    pub fn from_error_rate(error_rate: f64) -> Self {
        AlleleFractions {
            theta: [error_rate, 0.5, 1.0 - error_rate],
        }
    }

    /// Mean miscall rate of the two homozygous states.
    pub fn error_rate(&self) -> f64 {
        (self.theta[0] + 1.0 - self.theta[2]) / 2.0
    }

    pub fn categories(&self) -> [f64; N_CATEGORIES] {
        let mut fractions = [0.0; N_CATEGORIES];
        for gi in 0..N_GENOTYPES {
            for gj in gi..N_GENOTYPES {
                fractions[PAIR_CATEGORY[gi][gj]] = (self.theta[gi] + self.theta[gj]) / 2.0;
            }
        }
        fractions
    }
}

/// Log-probability of `alt` alt reads out of `depth` at alt fraction `f`.
pub fn log_lik(alt: u32, depth: u32, f: f64, model: LikelihoodModel) -> f64 {
    let reference = (depth - alt) as f64;
    let alt_f = alt as f64;
    let coefficient = ln_binomial(depth as u64, alt as u64);
    match model {
        LikelihoodModel::Binomial => coefficient + alt_f * f.ln() + reference * (1.0 - f).ln(),
        LikelihoodModel::BetaBinomial { concentration } => {
            let a = f * concentration;
            let b = (1.0 - f) * concentration;
            coefficient + ln_beta(alt_f + a, reference + b) - ln_beta(a, b)
        }
    }
}

/// Precomputed per-entry log-likelihood tables over one count matrix.
#[derive(Clone, Debug)]
pub struct LikelihoodEngine<'a> {
    counts: &'a AlleleCounts,
    model: LikelihoodModel,
    fractions: AlleleFractions,
    tables: Vec<[f64; N_CATEGORIES]>,
    background: Vec<f64>,
}

impl<'a> LikelihoodEngine<'a> {
    pub fn new(
        counts: &'a AlleleCounts,
        model: LikelihoodModel,
        policy: UnassignedPolicy,
        fractions: AlleleFractions,
    ) -> Self {
        let tables = build_tables(counts.entries(), model, &fractions);
        let background = match policy {
            UnassignedPolicy::Flat => counts
                .entries()
                .iter()
                .map(|e| -((e.depth() as f64) + 1.0).ln())
                .collect(),
            UnassignedPolicy::Background => {
                let totals = counts.snp_totals();
                counts
                    .entries()
                    .iter()
                    .map(|e| {
                        let (alt, depth) = totals[e.snp];
                        let pooled = (alt as f64 + 1.0) / (depth as f64 + 2.0);
                        log_lik(e.alt_count, e.depth(), pooled, LikelihoodModel::Binomial)
                    })
                    .collect()
            }
            UnassignedPolicy::Disabled => Vec::new(),
        };
        LikelihoodEngine {
            counts,
            model,
            fractions,
            tables,
            background,
        }
    }

    /// Same engine with the category tables rebuilt for other allele fractions.
    pub fn with_fractions(&self, fractions: AlleleFractions) -> Self {
        LikelihoodEngine {
            counts: self.counts,
            model: self.model,
            fractions,
            tables: build_tables(self.counts.entries(), self.model, &fractions),
            background: self.background.clone(),
        }
    }

    pub fn fractions(&self) -> AlleleFractions {
        self.fractions
    }

    /// Category log-likelihoods of the entry at `index` in `counts.entries()`.
    #[inline]
    pub fn table(&self, index: usize) -> &[f64; N_CATEGORIES] {
        &self.tables[index]
    }

    /// E_q[log p(counts | donor)] for one cell.
    pub fn singlet_log_lik(&self, cell: usize, genotypes: &DonorGenotype, donor: usize) -> f64 {
        let range = self.counts.cell_range(cell);
        let entries = self.counts.cell_entries(cell);
        entries
            .iter()
            .zip(&self.tables[range])
            .map(|(e, table)| {
                let q = genotypes.get(donor, e.snp);
                (0..N_GENOTYPES)
                    .map(|g| q[g] * table[SINGLET_CATEGORY[g]])
                    .sum::<f64>()
            })
            .sum()
    }

    /// E_q[log p(counts | donors i and j share the droplet)] for one cell.
    pub fn doublet_log_lik(
        &self,
        cell: usize,
        genotypes: &DonorGenotype,
        i: usize,
        j: usize,
    ) -> f64 {
        let range = self.counts.cell_range(cell);
        let entries = self.counts.cell_entries(cell);
        entries
            .iter()
            .zip(&self.tables[range])
            .map(|(e, table)| pair_expectation(table, &genotypes.get(i, e.snp), &genotypes.get(j, e.snp)))
            .sum()
    }

    /// Log-likelihood of the cell under the unassigned (no-signal) model.
    pub fn background_log_lik(&self, cell: usize) -> f64 {
        if self.background.is_empty() {
            return 0.0;
        }
        self.background[self.counts.cell_range(cell)].iter().sum()
    }

    /// Expected log-likelihood of every hypothesis for one cell, in column order.
    pub fn cell_log_liks(
        &self,
        cell: usize,
        genotypes: &DonorGenotype,
        hypotheses: &HypothesisSet,
        out: &mut [f64],
    ) {
        for (col, hypothesis) in hypotheses.iter().enumerate() {
            out[col] = match hypothesis {
                Hypothesis::Singlet(d) => self.singlet_log_lik(cell, genotypes, d),
                Hypothesis::Doublet(i, j) => self.doublet_log_lik(cell, genotypes, i, j),
                Hypothesis::Unassigned => self.background_log_lik(cell),
            };
        }
    }
}

/// sum_{gi, gj} qi(gi) qj(gj) table[category(gi, gj)]
#[inline]
pub fn pair_expectation(
    table: &[f64; N_CATEGORIES],
    qi: &[f64; N_GENOTYPES],
    qj: &[f64; N_GENOTYPES],
) -> f64 {
    let mut total = 0.0;
    for gi in 0..N_GENOTYPES {
        if qi[gi] == 0.0 {
            continue;
        }
        let mut inner = 0.0;
        for gj in 0..N_GENOTYPES {
            if qj[gj] != 0.0 {
                inner += qj[gj] * table[PAIR_CATEGORY[gi][gj]];
            }
        }
        total += qi[gi] * inner;
    }
    total
}

fn build_tables(entries: &[SnpCount], model: LikelihoodModel, fractions: &AlleleFractions) -> Vec<[f64; N_CATEGORIES]> {
    let fractions = fractions.categories();
    entries
        .iter()
        .map(|e| {
            let mut table = [0.0; N_CATEGORIES];
            for (k, f) in fractions.iter().enumerate() {
                table[k] = log_lik(e.alt_count, e.depth(), *f, model);
            }
            table
        })
        .collect()
}
