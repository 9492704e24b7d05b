//! Variational EM over cell assignments and donor genotypes.
//!
//! One restart is a small state machine:
//!
//! ```text
//! Initializing -> EStep -> (Converged | Stalled | MStep)
//!                   ^                                |
//!                   +--------------------------------+
//! ```
//!
//! The ELBO is evaluated right after each E-step, where it has a closed
//! form, so the snapshot returned on termination always carries a posterior
//! and an ELBO that belong to its genotypes and proportions.
//!
//! When donor genotypes are learned, the unassigned hypothesis is held out
//! (the core phase) until the singlet/doublet fit has converged, and only
//! then gets its prior weight. The core-phase ELBO trace is kept apart from
//! the trace of the full model.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::{DemuxConfig, UnassignedPolicy};
use crate::counts::AlleleCounts;
use crate::error::{DemuxError, RestartError, Result};
use crate::genotype::{DonorGenotype, GenotypeModel, N_GENOTYPES};
use crate::hypothesis::HypothesisSet;
use crate::likelihood::{AlleleFractions, LikelihoodEngine, PAIR_CATEGORY, SINGLET_CATEGORY};
use crate::mixing::{xlogy, MixingPrior, MixingProportions};

const MIN_ERROR_RATE: f64 = 1e-4;
const MAX_ERROR_RATE: f64 = 0.25;
const MIN_HET_FRACTION: f64 = 0.25;
const MAX_HET_FRACTION: f64 = 0.75;

/// Pseudo-reads pulling each learned alt fraction towards its starting value.
const FRACTION_PSEUDO_READS: f64 = 2.0;

/// Relative ELBO drop reported as a regression.
const REGRESSION_TOLERANCE: f64 = 1e-8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum EmState {
    Initializing,
    EStep,
    MStep,
    Converged,
    Stalled,
}

/// Terminal state of a restart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Converged,
    /// Hit the iteration cap before the ELBO settled
    Stalled,
}

/// How a restart seeds its first genotype estimate.
#[derive(Clone, Debug)]
pub enum Initialization {
    /// Random per-cell donor weights drawn from the seed
    Random { seed: u64 },
    /// Explicit cells x donors assignment weights (rows need not be normalised)
    Assignment(Array2<f64>),
}

#[derive(Clone, Debug, Serialize)]
pub struct EmSettings {
    pub max_iter: usize,
    pub min_iter: usize,
    pub tolerance: f64,
    pub learn_error_rate: bool,
    pub learn_allele_fractions: bool,
}

impl From<&DemuxConfig> for EmSettings {
    fn from(config: &DemuxConfig) -> Self {
        EmSettings {
            max_iter: config.max_iter,
            min_iter: config.min_iter,
            tolerance: config.tolerance,
            learn_error_rate: config.learn_error_rate,
            learn_allele_fractions: config.learn_allele_fractions,
        }
    }
}

/// Everything a restart owns and rewrites.
#[derive(Clone, Debug)]
pub struct ModelState {
    pub genotypes: DonorGenotype,
    /// cells x hypotheses, rows sum to one
    pub posterior: Array2<f64>,
    /// cells x hypotheses expected log-likelihood from the last E-step
    pub log_lik: Array2<f64>,
    pub mixing: MixingProportions,
    pub fractions: AlleleFractions,
    pub elbo: f64,
}

#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub restart: usize,
    pub status: RunStatus,
    /// E-steps over both phases
    pub iterations: usize,
    /// ELBO of the full model, one value per E-step
    pub elbo_trace: Vec<f64>,
    /// ELBO while the unassigned hypothesis was held out; empty if it never was
    pub core_trace: Vec<f64>,
    pub state: ModelState,
}

impl RunOutcome {
    pub fn elbo(&self) -> f64 {
        self.state.elbo
    }
}

/// Read-only inputs shared by all restarts of one run.
#[derive(Clone, Debug)]
pub struct InferenceProblem<'a> {
    counts: &'a AlleleCounts,
    genotype_model: GenotypeModel,
    hypotheses: HypothesisSet,
    prior: MixingPrior,
    settings: EmSettings,
    likelihood: LikelihoodEngine<'a>,
    covered: Vec<usize>,
}

impl<'a> InferenceProblem<'a> {
    pub fn new(counts: &'a AlleleCounts, genotype_model: GenotypeModel, config: &DemuxConfig) -> Result<Self> {
        if genotype_model.n_snps() != counts.n_snps() {
            return Err(DemuxError::input_shape(format!(
                "genotypes cover {} SNPs but the count matrices have {}",
                genotype_model.n_snps(),
                counts.n_snps()
            )));
        }
        let n_donors = genotype_model.n_donors();
        if n_donors == 0 {
            return Err(DemuxError::input_shape("at least one donor is required"));
        }
        let hypotheses = HypothesisSet::new(
            n_donors,
            config.detect_doublets,
            config.unassigned != UnassignedPolicy::Disabled,
        );
        let prior = MixingPrior::from_config(config, &hypotheses);
        let likelihood = LikelihoodEngine::new(
            counts,
            config.likelihood,
            config.unassigned,
            AlleleFractions::from_error_rate(config.error_rate),
        );
        let covered = (0..counts.n_cells()).filter(|&c| counts.n_covered(c) > 0).collect();
        Ok(InferenceProblem {
            counts,
            genotype_model,
            hypotheses,
            prior,
            settings: EmSettings::from(config),
            likelihood,
            covered,
        })
    }

    pub fn hypotheses(&self) -> &HypothesisSet {
        &self.hypotheses
    }

    pub fn n_donors(&self) -> usize {
        self.hypotheses.n_donors()
    }

    /// Whether any restart would differ from another: with every donor's
    /// genotypes fixed the starting point is ignored.
    pub fn has_free_donors(&self) -> bool {
        self.genotype_model.n_free() > 0
    }

    /// Run one restart to a terminal state.
    pub fn run(
        &self,
        restart: usize,
        init: &Initialization,
        cancel: Option<&AtomicBool>,
    ) -> std::result::Result<RunOutcome, RestartError> {
        let mut em = VariationalEm::new(self, restart, cancel);
        em.initialize(init);
        loop {
            match em.state {
                EmState::EStep => em.e_step()?,
                EmState::MStep => em.m_step(),
                EmState::Converged | EmState::Stalled => break,
                EmState::Initializing => unreachable!("initialize leaves the Initializing state"),
            }
        }
        Ok(em.finish())
    }
}

struct VariationalEm<'p, 'a> {
    problem: &'p InferenceProblem<'a>,
    restart: usize,
    cancel: Option<&'p AtomicBool>,
    state: EmState,
    likelihood: Cow<'p, LikelihoodEngine<'a>>,
    genotypes: DonorGenotype,
    /// mixing prior in force; lacks the unassigned pseudo-count in the core phase
    prior: MixingPrior,
    mixing: MixingProportions,
    posterior: Array2<f64>,
    log_lik: Array2<f64>,
    /// unassigned hypothesis still held out
    core_phase: bool,
    core_trace: Vec<f64>,
    trace: Vec<f64>,
    iterations: usize,
}

impl<'p, 'a> VariationalEm<'p, 'a> {
    fn new(problem: &'p InferenceProblem<'a>, restart: usize, cancel: Option<&'p AtomicBool>) -> Self {
        let n_cells = problem.counts.n_cells();
        let n_hyp = problem.hypotheses.len();
        let core_phase = problem.has_free_donors() && problem.hypotheses.unassigned_index().is_some();
        let prior = if core_phase {
            problem.prior.without_unassigned()
        } else {
            problem.prior.clone()
        };
        VariationalEm {
            problem,
            restart,
            cancel,
            state: EmState::Initializing,
            likelihood: Cow::Borrowed(&problem.likelihood),
            genotypes: problem.genotype_model.initial().clone(),
            mixing: MixingProportions::initial(&problem.hypotheses, &prior),
            prior,
            posterior: Array2::from_elem((n_cells, n_hyp), 1.0 / n_hyp as f64),
            log_lik: Array2::zeros((n_cells, n_hyp)),
            core_phase,
            core_trace: Vec::new(),
            trace: Vec::new(),
            iterations: 0,
        }
    }

    fn initialize(&mut self, init: &Initialization) {
        debug_assert_eq!(self.state, EmState::Initializing);
        if self.problem.has_free_donors() {
            let weights = self.initial_weights(init);
            self.update_genotypes(&weights);
        }
        self.state = EmState::EStep;
    }

    /// Cells x hypotheses weights with mass on singlet columns only.
    fn initial_weights(&self, init: &Initialization) -> Array2<f64> {
        let n_cells = self.problem.counts.n_cells();
        let n_donors = self.problem.n_donors();
        let mut weights = Array2::zeros((n_cells, self.problem.hypotheses.len()));
        match init {
            Initialization::Random { seed } => {
                let mut rng = StdRng::seed_from_u64(*seed);
                for c in 0..n_cells {
                    for d in 0..n_donors {
                        weights[[c, d]] = rng.gen::<f64>();
                    }
                }
            }
            Initialization::Assignment(given) => {
                for ((c, d), w) in given.indexed_iter() {
                    if c < n_cells && d < n_donors {
                        weights[[c, d]] = w.max(0.0);
                    }
                }
            }
        }
        for mut row in weights.axis_iter_mut(Axis(0)) {
            let total: f64 = row.sum();
            if total > 0.0 {
                row.mapv_inplace(|w| w / total);
            }
        }
        weights
    }

    fn check_cancel(&self) -> std::result::Result<(), RestartError> {
        match self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(RestartError::Cancelled {
                restart: self.restart,
                iteration: self.iterations,
            }),
            _ => Ok(()),
        }
    }

    fn e_step(&mut self) -> std::result::Result<(), RestartError> {
        self.check_cancel()?;
        let problem = self.problem;
        let hypotheses = &problem.hypotheses;
        let log_w = self.mixing.log_weights(hypotheses);
        let likelihood = self.likelihood.as_ref();
        let genotypes = &self.genotypes;

        let rows: Vec<(Vec<f64>, Vec<f64>, f64)> = problem
            .covered
            .par_iter()
            .map(|&cell| {
                let mut ll = vec![0.0; hypotheses.len()];
                likelihood.cell_log_liks(cell, genotypes, hypotheses, &mut ll);
                let joint: Vec<f64> = ll.iter().zip(&log_w).map(|(a, b)| a + b).collect();
                let lse = log_sum_exp(&joint);
                let post = joint.iter().map(|x| (x - lse).exp()).collect();
                (ll, post, lse)
            })
            .collect();

        let mut evidence = 0.0;
        for (&cell, (ll, post, lse)) in problem.covered.iter().zip(rows) {
            if !lse.is_finite() {
                return Err(RestartError::NumericInstability {
                    restart: self.restart,
                    iteration: self.iterations,
                    quantity: "log-likelihood",
                });
            }
            for (h, (l, p)) in ll.into_iter().zip(post).enumerate() {
                self.log_lik[[cell, h]] = l;
                self.posterior[[cell, h]] = p;
            }
            evidence += lse;
        }

        let elbo = evidence + self.genotype_term() + self.mixing.pseudo_count_term(&self.prior);
        if !elbo.is_finite() {
            return Err(RestartError::NumericInstability {
                restart: self.restart,
                iteration: self.iterations,
                quantity: "ELBO",
            });
        }
        if let Some(&previous) = self.trace.last() {
            if elbo < previous - REGRESSION_TOLERANCE * previous.abs().max(1.0) {
                warn!(
                    "restart {}: ELBO decreased from {:.6} to {:.6} at iteration {}",
                    self.restart,
                    previous,
                    elbo,
                    self.iterations
                );
            }
        }
        self.trace.push(elbo);
        self.iterations += 1;
        debug!("restart {} iteration {}: ELBO {:.6}", self.restart, self.iterations, elbo);

        self.state = match self.next_state() {
            EmState::Converged | EmState::Stalled if self.core_phase => {
                self.release_unassigned();
                EmState::EStep
            }
            next => next,
        };
        Ok(())
    }

    /// E-steps allowed in the current phase, counted from the first one.
    /// The core phase gets half of `max_iter`; the full model always gets
    /// at least one E-step so the returned posterior covers every column.
    fn budget(&self) -> usize {
        let max_iter = self.problem.settings.max_iter;
        if self.core_phase {
            (max_iter / 2).max(1)
        } else {
            max_iter.max(self.core_trace.len() + 1)
        }
    }

    fn next_state(&self) -> EmState {
        let settings = &self.problem.settings;
        let n = self.trace.len();
        if n >= 2 && n >= settings.min_iter {
            let previous = self.trace[n - 2];
            let improvement = self.trace[n - 1] - previous;
            if improvement.abs() <= settings.tolerance * previous.abs() {
                return EmState::Converged;
            }
        }
        if self.iterations >= self.budget() {
            EmState::Stalled
        } else {
            EmState::MStep
        }
    }

    /// End of the core phase: give the unassigned hypothesis its prior mean
    /// weight, taken proportionally from singlets and doublets.
    fn release_unassigned(&mut self) {
        let prior = self.problem.prior.clone();
        let total = prior.singlet + prior.doublet + prior.unassigned;
        let upsilon = prior.unassigned / total;
        self.mixing.doublet_rate *= 1.0 - upsilon;
        self.mixing.unassigned_rate = upsilon;
        self.prior = prior;
        self.core_phase = false;
        self.core_trace = std::mem::take(&mut self.trace);
        debug!(
            "restart {}: core phase done after {} iterations, releasing the unassigned hypothesis",
            self.restart,
            self.core_trace.len()
        );
    }

    fn m_step(&mut self) {
        let problem = self.problem;
        let masses = self.masses();
        self.mixing = self.mixing.update(&masses, &problem.hypotheses, &self.prior);
        if problem.has_free_donors() {
            let posterior = self.posterior.clone();
            self.update_genotypes(&posterior);
        }
        if problem.settings.learn_allele_fractions || problem.settings.learn_error_rate {
            self.update_fractions();
        }
        self.state = EmState::EStep;
    }

    /// Posterior mass of each hypothesis over covered cells.
    fn masses(&self) -> Vec<f64> {
        let mut masses = vec![0.0; self.problem.hypotheses.len()];
        for &cell in &self.problem.covered {
            for (h, p) in self.posterior.row(cell).iter().enumerate() {
                masses[h] += p;
            }
        }
        masses
    }

    /// Coordinate update of each free donor's genotypes given the cell weights,
    /// one donor at a time so pair terms see the partner's latest estimate.
    fn update_genotypes(&mut self, weights: &Array2<f64>) {
        let problem = self.problem;
        let counts = problem.counts;
        let hypotheses = &problem.hypotheses;
        let model = &problem.genotype_model;
        let n_snps = counts.n_snps();

        for donor in 0..model.n_donors() {
            if model.is_frozen(donor) {
                continue;
            }
            let partners: Vec<(usize, usize)> = (0..hypotheses.n_donors())
                .filter(|&j| j != donor)
                .filter_map(|j| hypotheses.doublet_index(donor, j).map(|col| (j, col)))
                .collect();

            let mut evidence = vec![[0.0; N_GENOTYPES]; n_snps];
            for &cell in &problem.covered {
                let singlet_weight = weights[[cell, hypotheses.singlet_index(donor)]];
                let pair_weights: Vec<(usize, f64)> = partners
                    .iter()
                    .map(|&(j, col)| (j, weights[[cell, col]]))
                    .filter(|(_, w)| *w > 0.0)
                    .collect();
                if singlet_weight == 0.0 && pair_weights.is_empty() {
                    continue;
                }
                for (index, entry) in counts.cell_range(cell).zip(counts.cell_entries(cell)) {
                    let table = self.likelihood.table(index);
                    let slot = &mut evidence[entry.snp];
                    for g in 0..N_GENOTYPES {
                        slot[g] += singlet_weight * table[SINGLET_CATEGORY[g]];
                    }
                    for &(j, w) in &pair_weights {
                        let qj = self.genotypes.get(j, entry.snp);
                        for g in 0..N_GENOTYPES {
                            let mut expected = 0.0;
                            for gj in 0..N_GENOTYPES {
                                if qj[gj] != 0.0 {
                                    expected += qj[gj] * table[PAIR_CATEGORY[g][gj]];
                                }
                            }
                            slot[g] += w * expected;
                        }
                    }
                }
            }

            for (snp, ev) in evidence.iter().enumerate() {
                let prior = model.prior().get(donor, snp);
                let mut log_q = [f64::NEG_INFINITY; N_GENOTYPES];
                for g in 0..N_GENOTYPES {
                    if prior[g] > 0.0 {
                        log_q[g] = prior[g].ln() + ev[g];
                    }
                }
                let lse = log_sum_exp(&log_q);
                self.genotypes.set(donor, snp, log_q.map(|x| (x - lse).exp()));
            }
        }
    }

    /// Generalised M-step for the allele fractions.
    ///
    /// Posterior-weighted singlet reads give each genotype state's alt
    /// fraction, or with only `learn_error_rate` one shared miscall rate
    /// from the homozygous states. The candidate is kept only if the
    /// expected log-likelihood does not drop.
    fn update_fractions(&mut self) {
        let counts = self.problem.counts;
        let hypotheses = &self.problem.hypotheses;
        let mut alt = [0.0; N_GENOTYPES];
        let mut depth = [0.0; N_GENOTYPES];
        for &cell in &self.problem.covered {
            for entry in counts.cell_entries(cell) {
                for d in 0..hypotheses.n_donors() {
                    let w = self.posterior[[cell, hypotheses.singlet_index(d)]];
                    if w == 0.0 {
                        continue;
                    }
                    let q = self.genotypes.get(d, entry.snp);
                    for g in 0..N_GENOTYPES {
                        alt[g] += w * q[g] * entry.alt_count as f64;
                        depth[g] += w * q[g] * entry.depth() as f64;
                    }
                }
            }
        }
        let current = self.likelihood.fractions();
        let candidate = if self.problem.settings.learn_allele_fractions {
            let start = self.problem.likelihood.fractions().theta;
            let theta =
                |g: usize| (alt[g] + FRACTION_PSEUDO_READS * start[g]) / (depth[g] + FRACTION_PSEUDO_READS);
            AlleleFractions {
                theta: [
                    theta(0).clamp(MIN_ERROR_RATE, MAX_ERROR_RATE),
                    theta(1).clamp(MIN_HET_FRACTION, MAX_HET_FRACTION),
                    theta(2).clamp(1.0 - MAX_ERROR_RATE, 1.0 - MIN_ERROR_RATE),
                ],
            }
        } else {
            let errors = 1.0 + alt[0] + (depth[2] - alt[2]);
            let reads = 2.0 + depth[0] + depth[2];
            let e = (errors / reads).clamp(MIN_ERROR_RATE, MAX_ERROR_RATE);
            AlleleFractions {
                theta: [e, current.theta[1], 1.0 - e],
            }
        };
        if candidate == current {
            return;
        }
        let proposed = self.likelihood.with_fractions(candidate);
        let current_term = self.expected_data_term(self.likelihood.as_ref());
        let proposed_term = self.expected_data_term(&proposed);
        if proposed_term >= current_term {
            debug!(
                "restart {}: allele fractions {:?} -> {:?}",
                self.restart, current.theta, candidate.theta
            );
            self.likelihood = Cow::Owned(proposed);
        }
    }

    /// sum_c sum_h r_ch E_q[log p(counts_c | h)] under a given likelihood engine.
    fn expected_data_term(&self, likelihood: &LikelihoodEngine<'_>) -> f64 {
        let hypotheses = &self.problem.hypotheses;
        let genotypes = &self.genotypes;
        let posterior = &self.posterior;
        let per_cell: Vec<f64> = self
            .problem
            .covered
            .par_iter()
            .map(|&cell| {
                let mut ll = vec![0.0; hypotheses.len()];
                likelihood.cell_log_liks(cell, genotypes, hypotheses, &mut ll);
                ll.iter()
                    .zip(posterior.row(cell).iter())
                    .map(|(l, r)| if *r == 0.0 { 0.0 } else { r * l })
                    .sum()
            })
            .collect();
        per_cell.iter().sum()
    }

    /// sum over free donors of E_q[ln prior(G)] - E_q[ln q(G)].
    fn genotype_term(&self) -> f64 {
        let model = &self.problem.genotype_model;
        let mut total = 0.0;
        for donor in 0..model.n_donors() {
            if model.is_frozen(donor) {
                continue;
            }
            for snp in 0..model.n_snps() {
                let q = self.genotypes.get(donor, snp);
                let prior = model.prior().get(donor, snp);
                for g in 0..N_GENOTYPES {
                    total += xlogy(q[g], prior[g]) - xlogy(q[g], q[g]);
                }
            }
        }
        total
    }

    fn finish(self) -> RunOutcome {
        let status = match self.state {
            EmState::Converged => RunStatus::Converged,
            _ => RunStatus::Stalled,
        };
        if status == RunStatus::Stalled {
            warn!(
                "restart {} did not converge within {} iterations",
                self.restart, self.iterations
            );
        }
        let elbo = self.trace.last().copied().unwrap_or(f64::NEG_INFINITY);
        RunOutcome {
            restart: self.restart,
            status,
            iterations: self.iterations,
            state: ModelState {
                genotypes: self.genotypes,
                posterior: self.posterior,
                log_lik: self.log_lik,
                mixing: self.mixing,
                fractions: self.likelihood.fractions(),
                elbo,
            },
            elbo_trace: self.trace,
            core_trace: self.core_trace,
        }
    }
}

/// log(sum(exp(x))) without overflow; -inf for an empty or all -inf input.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Check every posterior row sums to one within `tolerance`.
pub fn posterior_is_normalized(posterior: &Array2<f64>, tolerance: f64) -> bool {
    posterior
        .axis_iter(Axis(0))
        .all(|row| (row.sum() - 1.0).abs() <= tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn two_donor_counts() -> (AlleleCounts, DonorGenotype) {
        // donor 0 is 0/0 at even SNPs and 1/1 at odd ones, donor 1 the reverse
        let n_snps = 20;
        let mut g = DonorGenotype::uniform(2, n_snps);
        for s in 0..n_snps {
            let (a, b) = if s % 2 == 0 { (0, 2) } else { (2, 0) };
            let mut da = [0.0; 3];
            da[a] = 1.0;
            let mut db = [0.0; 3];
            db[b] = 1.0;
            g.set(0, s, da);
            g.set(1, s, db);
        }
        let mut r = Array2::<u32>::zeros((4, n_snps));
        let mut a = Array2::<u32>::zeros((4, n_snps));
        for s in 0..n_snps {
            let donor0_alt = s % 2 == 1;
            // cells 0, 1 from donor 0; cell 2 from donor 1; cell 3 uncovered
            for c in 0..2 {
                if donor0_alt {
                    a[[c, s]] = 8;
                } else {
                    r[[c, s]] = 8;
                }
            }
            if donor0_alt {
                r[[2, s]] = 8;
            } else {
                a[[2, s]] = 8;
            }
        }
        (AlleleCounts::from_dense(&r, &a).unwrap(), g)
    }

    #[test]
    fn known_genotypes_assign_cells() {
        let (counts, g) = two_donor_counts();
        let model = GenotypeModel::with_supplied(2, &g, false, 0.0).unwrap();
        let config = DemuxConfig::with_donors(2);
        let problem = InferenceProblem::new(&counts, model, &config).unwrap();
        let outcome = problem.run(0, &Initialization::Random { seed: 1 }, None).unwrap();
        let post = &outcome.state.posterior;
        assert!(post[[0, 0]] > 0.99);
        assert!(post[[1, 0]] > 0.99);
        assert!(post[[2, 1]] > 0.99);
        assert!(posterior_is_normalized(post, 1e-9));
        // uncovered cell stays uniform
        for h in 0..problem.hypotheses().len() {
            assert_abs_diff_eq!(post[[3, h]], 1.0 / 4.0, epsilon = 1e-12);
        }
        assert_eq!(outcome.state.genotypes, g);
    }

    #[test]
    fn elbo_never_decreases_genotype_free() {
        let (counts, _) = two_donor_counts();
        let config = DemuxConfig {
            max_iter: 50,
            min_iter: 50,
            tolerance: 0.0,
            ..DemuxConfig::with_donors(2)
        };
        let problem = InferenceProblem::new(&counts, GenotypeModel::free(2, counts.n_snps()), &config).unwrap();
        let outcome = problem.run(0, &Initialization::Random { seed: 7 }, None).unwrap();
        assert_eq!(outcome.iterations, 50);
        assert_eq!(outcome.core_trace.len() + outcome.elbo_trace.len(), 50);
        for trace in [&outcome.core_trace, &outcome.elbo_trace] {
            for w in trace.windows(2) {
                assert!(w[1] >= w[0] - 1e-8 * w[0].abs(), "{} -> {}", w[0], w[1]);
            }
        }
        assert!(outcome.state.genotypes.max_normalization_error() < 1e-9);
    }

    #[test]
    fn unassigned_waits_for_informative_genotypes() {
        let (counts, _) = two_donor_counts();
        let config = DemuxConfig::with_donors(2);
        let problem = InferenceProblem::new(&counts, GenotypeModel::free(2, counts.n_snps()), &config).unwrap();
        let unassigned = problem.hypotheses().unassigned_index().unwrap();
        let outcome = problem.run(0, &Initialization::Random { seed: 3 }, None).unwrap();
        assert!(!outcome.core_trace.is_empty());
        assert!(!outcome.elbo_trace.is_empty());

        let post = &outcome.state.posterior;
        assert!(posterior_is_normalized(post, 1e-9));
        for cell in 0..3 {
            assert!(post[[cell, unassigned]] < 0.01, "cell {} unassigned {}", cell, post[[cell, unassigned]]);
        }
        let best = |cell: usize| if post[[cell, 0]] > post[[cell, 1]] { 0 } else { 1 };
        assert_eq!(best(0), best(1));
        assert_ne!(best(0), best(2));
        assert!(outcome.state.mixing.unassigned_rate > 0.0);
        assert!(outcome.state.mixing.unassigned_rate < 0.05);
    }

    #[test]
    fn known_genotypes_skip_the_core_phase() {
        let (counts, g) = two_donor_counts();
        let model = GenotypeModel::with_supplied(2, &g, false, 0.0).unwrap();
        let problem = InferenceProblem::new(&counts, model, &DemuxConfig::with_donors(2)).unwrap();
        assert!(!problem.has_free_donors());
        let outcome = problem.run(0, &Initialization::Random { seed: 1 }, None).unwrap();
        assert!(outcome.core_trace.is_empty());
        assert_eq!(outcome.iterations, outcome.elbo_trace.len());
    }

    #[test]
    fn learned_allele_fractions_track_het_imbalance() {
        // donor 0 is 0/1 everywhere with 3 alt reads in 10, donor 1 is 0/0
        let n_snps = 20;
        let mut g = DonorGenotype::uniform(2, n_snps);
        for s in 0..n_snps {
            g.set(0, s, [0.0, 1.0, 0.0]);
            g.set(1, s, [1.0, 0.0, 0.0]);
        }
        let mut r = Array2::<u32>::zeros((7, n_snps));
        let mut a = Array2::<u32>::zeros((7, n_snps));
        for s in 0..n_snps {
            for c in 0..4 {
                r[[c, s]] = 7;
                a[[c, s]] = 3;
            }
            for c in 4..7 {
                r[[c, s]] = 10;
            }
        }
        let counts = AlleleCounts::from_dense(&r, &a).unwrap();
        let model = GenotypeModel::with_supplied(2, &g, false, 0.0).unwrap();
        let config = DemuxConfig {
            learn_allele_fractions: true,
            detect_doublets: false,
            unassigned: UnassignedPolicy::Disabled,
            ..DemuxConfig::with_donors(2)
        };
        let problem = InferenceProblem::new(&counts, model, &config).unwrap();
        let outcome = problem.run(0, &Initialization::Random { seed: 0 }, None).unwrap();
        let theta = outcome.state.fractions.theta;
        // (240 + 2 * 0.5) / (800 + 2)
        assert_abs_diff_eq!(theta[1], 241.0 / 802.0, epsilon = 1e-3);
        assert_abs_diff_eq!(theta[0], MIN_ERROR_RATE, epsilon = 1e-12);
        // no 1/1 evidence keeps the starting value
        assert_abs_diff_eq!(theta[2], 0.99, epsilon = 1e-12);
        for w in outcome.elbo_trace.windows(2) {
            assert!(w[1] >= w[0] - 1e-8 * w[0].abs());
        }
    }

    #[test]
    fn learned_error_rate_keeps_elbo_monotone() {
        let (counts, _) = two_donor_counts();
        let config = DemuxConfig {
            learn_error_rate: true,
            error_rate: 0.1,
            max_iter: 30,
            ..DemuxConfig::with_donors(2)
        };
        let problem = InferenceProblem::new(&counts, GenotypeModel::free(2, counts.n_snps()), &config).unwrap();
        let outcome = problem.run(0, &Initialization::Random { seed: 3 }, None).unwrap();
        for w in outcome.elbo_trace.windows(2) {
            assert!(w[1] >= w[0] - 1e-8 * w[0].abs());
        }
        // clean data drives the error rate down
        assert!(outcome.state.fractions.error_rate() < 0.1);
        assert_eq!(outcome.state.fractions.theta[1], 0.5);
    }

    #[test]
    fn cancelled_restart_reports_error() {
        let (counts, g) = two_donor_counts();
        let model = GenotypeModel::with_supplied(2, &g, false, 0.0).unwrap();
        let problem = InferenceProblem::new(&counts, model, &DemuxConfig::with_donors(2)).unwrap();
        let flag = AtomicBool::new(true);
        let err = problem
            .run(4, &Initialization::Random { seed: 0 }, Some(&flag))
            .unwrap_err();
        assert_eq!(err, RestartError::Cancelled { restart: 4, iteration: 0 });
    }

    #[test]
    fn shape_mismatch_fails_fast() {
        let (counts, _) = two_donor_counts();
        let model = GenotypeModel::free(2, 3);
        assert!(matches!(
            InferenceProblem::new(&counts, model, &DemuxConfig::with_donors(2)),
            Err(DemuxError::InputShape { .. })
        ));
    }

    #[test]
    fn log_sum_exp_is_stable() {
        assert_abs_diff_eq!(log_sum_exp(&[-1000.0, -1000.0]), -1000.0 + 2f64.ln(), epsilon = 1e-9);
        assert_eq!(log_sum_exp(&[]), f64::NEG_INFINITY);
        assert!(posterior_is_normalized(&array![[0.25, 0.75], [1.0, 0.0]], 1e-12));
    }
}
