//! Restart/selection controller.
//!
//! Runs the EM engine from independently seeded starts in parallel and keeps
//! the restart with the highest final ELBO. A restart that fails is dropped
//! from selection without touching the others.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use indicatif::ProgressBar;
use log::{info, warn};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::{DemuxConfig, UnassignedPolicy};
use crate::counts::{AlleleCounts, DataDiagnostics};
use crate::em::{InferenceProblem, Initialization, RunOutcome, RunStatus};
use crate::error::{DemuxError, RestartError, Result};
use crate::genotype::{DonorGenotype, GenotypeModel};
use crate::hypothesis::HypothesisSet;
use crate::likelihood::AlleleFractions;
use crate::mixing::MixingProportions;

/// One restart's starting point and optional cancellation flag.
#[derive(Clone, Debug)]
pub struct RestartPlan {
    pub init: Initialization,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl RestartPlan {
    pub fn random(seed: u64) -> Self {
        RestartPlan {
            init: Initialization::Random { seed },
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Warmup,
    Main,
}

/// Outcome of one restart, kept for diagnostics whether or not it won.
#[derive(Clone, Debug, Serialize)]
pub struct RestartSummary {
    pub stage: Stage,
    pub index: usize,
    pub seed: Option<u64>,
    pub elbo: Option<f64>,
    pub status: Option<RunStatus>,
    pub iterations: usize,
    pub error: Option<String>,
}

/// Winner of a batch of restarts plus the record of every restart.
#[derive(Debug)]
pub struct Selection {
    pub best: RunOutcome,
    pub summaries: Vec<RestartSummary>,
}

/// Result handed to the report and output layers.
#[derive(Clone, Debug)]
pub struct DemuxResult {
    pub cell_ids: Vec<String>,
    pub snp_ids: Vec<String>,
    pub hypotheses: HypothesisSet,
    /// cells x hypotheses
    pub posterior: Array2<f64>,
    /// cells x hypotheses expected log-likelihood
    pub log_lik: Array2<f64>,
    pub genotypes: DonorGenotype,
    pub n_supplied: usize,
    pub mixing: MixingProportions,
    pub fractions: AlleleFractions,
    pub elbo: f64,
    pub iterations: usize,
    pub elbo_trace: Vec<f64>,
    /// ELBO trace before the unassigned hypothesis was released
    pub core_trace: Vec<f64>,
    pub status: RunStatus,
    pub best_restart: usize,
    pub restarts: Vec<RestartSummary>,
    pub diagnostics: DataDiagnostics,
}

/// Sub-seeds for `n` restarts derived from one top-level seed.
pub fn restart_seeds(seed: u64, n: usize) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.gen::<u64>()).collect()
}

/// Donor count and genotype model implied by the config and supplied genotypes.
pub fn resolve_genotype_model(
    counts: &AlleleCounts,
    supplied: Option<&DonorGenotype>,
    config: &DemuxConfig,
) -> Result<GenotypeModel> {
    match supplied {
        Some(genotypes) => {
            if genotypes.n_snps() != counts.n_snps() {
                return Err(DemuxError::input_shape(format!(
                    "donor genotypes cover {} SNPs but the count matrices have {}",
                    genotypes.n_snps(),
                    counts.n_snps()
                )));
            }
            let n_supplied = genotypes.n_donors();
            let mut n_donors = config.n_donors.unwrap_or(n_supplied);
            if n_donors < n_supplied {
                warn!(
                    "{} donors requested but {} have genotypes; using {}",
                    n_donors, n_supplied, n_supplied
                );
                n_donors = n_supplied;
            }
            GenotypeModel::with_supplied(
                n_donors,
                genotypes,
                config.learn_known_genotypes,
                config.genotype_prior_blend,
            )
        }
        None => {
            let n_donors = config.n_donors.ok_or_else(|| {
                DemuxError::input_shape("the number of donors is required when no genotypes are supplied")
            })?;
            Ok(GenotypeModel::free(n_donors, counts.n_snps()))
        }
    }
}

/// Run a batch of restarts, in parallel, and select the best by ELBO.
///
/// Ties go to the lowest restart index. Fails only if every restart failed.
pub fn run_plans(
    problem: &InferenceProblem<'_>,
    plans: &[RestartPlan],
    threads: Option<usize>,
    stage: Stage,
) -> Result<Selection> {
    let progress_bar = Arc::new(ProgressBar::new(plans.len() as u64));
    let run_all = || -> Vec<std::result::Result<RunOutcome, RestartError>> {
        plans
            .par_iter()
            .enumerate()
            .map(|(restart, plan)| {
                let outcome = problem.run(restart, &plan.init, plan.cancel.as_deref());
                progress_bar.inc(1);
                outcome
            })
            .collect()
    };
    let outcomes = match threads {
        Some(n) => rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .map_err(|e| DemuxError::config(format!("cannot build thread pool: {}", e)))?
            .install(run_all),
        None => run_all(),
    };
    progress_bar.finish_and_clear();

    let mut summaries = Vec::with_capacity(plans.len());
    let mut failures = Vec::new();
    let mut best: Option<RunOutcome> = None;
    for ((index, outcome), plan) in outcomes.into_iter().enumerate().zip(plans) {
        let seed = match plan.init {
            Initialization::Random { seed } => Some(seed),
            Initialization::Assignment(_) => None,
        };
        match outcome {
            Ok(run) => {
                info!(
                    "restart {}: {:?} after {} iterations, ELBO {:.4}",
                    index,
                    run.status,
                    run.iterations,
                    run.elbo()
                );
                summaries.push(RestartSummary {
                    stage,
                    index,
                    seed,
                    elbo: Some(run.elbo()),
                    status: Some(run.status),
                    iterations: run.iterations,
                    error: None,
                });
                let better = best.as_ref().map_or(true, |b| run.elbo() > b.elbo());
                if better {
                    best = Some(run);
                }
            }
            Err(e) => {
                warn!("{}", e);
                summaries.push(RestartSummary {
                    stage,
                    index,
                    seed,
                    elbo: None,
                    status: None,
                    iterations: 0,
                    error: Some(e.to_string()),
                });
                failures.push(e);
            }
        }
    }
    match best {
        Some(best) => Ok(Selection { best, summaries }),
        None => Err(DemuxError::AllRestartsFailed { failures }),
    }
}

/// Full demultiplexing run: validation, optional warm-up, restarts, selection.
pub fn demultiplex(
    counts: &AlleleCounts,
    supplied: Option<&DonorGenotype>,
    config: &DemuxConfig,
) -> Result<DemuxResult> {
    config.validate()?;
    let genotype_model = resolve_genotype_model(counts, supplied, config)?;
    let n_supplied = supplied.map_or(0, |g| g.n_donors());
    let n_donors = genotype_model.n_donors();

    let diagnostics = counts.diagnostics();
    if !diagnostics.empty_cells.is_empty() {
        warn!(
            "{} cells have no reads at any SNP and will get a uniform posterior",
            diagnostics.empty_cells.len()
        );
    }
    if !diagnostics.empty_snps.is_empty() {
        warn!("{} SNPs have no reads in any cell", diagnostics.empty_snps.len());
    }
    info!(
        "{} cells, {} SNPs, {} covered entries, {} donors ({} with genotypes)",
        diagnostics.n_cells, diagnostics.n_snps, diagnostics.n_entries, n_donors, n_supplied
    );

    let seeds = restart_seeds(config.seed, config.n_restarts);
    let warm_up = config.extra_donors > 0 && genotype_model.n_free() > 0;

    let (selection, mut restarts) = if warm_up {
        let start = warm_start(counts, &genotype_model, n_supplied, config, &seeds)?;
        let problem = InferenceProblem::new(counts, genotype_model, config)?;
        let plan = RestartPlan {
            init: Initialization::Assignment(start.assignment),
            cancel: None,
        };
        info!("running the main stage from the warm-up assignment");
        let selection = run_plans(&problem, &[plan], config.threads, Stage::Main)?;
        (selection, start.summaries)
    } else {
        let problem = InferenceProblem::new(counts, genotype_model, config)?;
        let plans: Vec<RestartPlan> = if problem.has_free_donors() {
            seeds.iter().map(|&s| RestartPlan::random(s)).collect()
        } else {
            info!("all donor genotypes are fixed, a single run replaces the restarts");
            vec![RestartPlan::random(seeds[0])]
        };
        info!("running {} restarts", plans.len());
        (run_plans(&problem, &plans, config.threads, Stage::Main)?, Vec::new())
    };

    let Selection { best, summaries } = selection;
    restarts.extend(summaries);
    info!(
        "selected restart {} ({:?}, ELBO {:.4})",
        best.restart,
        best.status,
        best.elbo()
    );
    let hypotheses = HypothesisSet::new(
        n_donors,
        config.detect_doublets,
        config.unassigned != UnassignedPolicy::Disabled,
    );
    let state = best.state;
    Ok(DemuxResult {
        cell_ids: counts.cell_ids().to_vec(),
        snp_ids: counts.snp_ids().to_vec(),
        hypotheses,
        posterior: state.posterior,
        log_lik: state.log_lik,
        genotypes: state.genotypes,
        n_supplied,
        mixing: state.mixing,
        fractions: state.fractions,
        elbo: state.elbo,
        iterations: best.iterations,
        elbo_trace: best.elbo_trace,
        core_trace: best.core_trace,
        status: best.status,
        best_restart: best.restart,
        restarts,
        diagnostics,
    })
}

struct WarmStart {
    assignment: Array2<f64>,
    summaries: Vec<RestartSummary>,
}

/// Over-clustering stage: fit `N + extra` donors without doublets for a few
/// iterations, then keep the N heaviest donors' assignment columns.
fn warm_start(
    counts: &AlleleCounts,
    model: &GenotypeModel,
    n_supplied: usize,
    config: &DemuxConfig,
    seeds: &[u64],
) -> Result<WarmStart> {
    let n_donors = model.n_donors();
    let warmup_config = DemuxConfig {
        n_donors: Some(n_donors + config.extra_donors),
        detect_doublets: false,
        max_iter: config.warmup_iter,
        min_iter: config.min_iter.min(config.warmup_iter),
        ..config.clone()
    };
    let problem = InferenceProblem::new(counts, model.with_extra_donors(config.extra_donors), &warmup_config)?;
    let plans: Vec<RestartPlan> = seeds.iter().map(|&s| RestartPlan::random(s)).collect();
    info!(
        "warm-up: {} restarts with {} donors for at most {} iterations",
        plans.len(),
        problem.n_donors(),
        config.warmup_iter
    );
    let Selection { best, summaries } = run_plans(&problem, &plans, config.threads, Stage::Warmup)?;

    let kept = rank_donors(&best.state.posterior, problem.n_donors(), n_supplied, n_donors);
    info!("warm-up kept donor columns {:?}", kept);
    let posterior = &best.state.posterior;
    let mut assignment = Array2::zeros((posterior.nrows(), n_donors));
    for (new, &old) in kept.iter().enumerate() {
        assignment.column_mut(new).assign(&posterior.column(old));
    }
    Ok(WarmStart { assignment, summaries })
}

/// Supplied donors keep their columns; the free donors are ranked by
/// posterior mass and the heaviest fill the remaining slots.
fn rank_donors(posterior: &Array2<f64>, n_fitted: usize, n_supplied: usize, n_keep: usize) -> Vec<usize> {
    let mass = posterior.sum_axis(Axis(0));
    let mut free: Vec<usize> = (n_supplied..n_fitted).collect();
    free.sort_by(|&a, &b| mass[b].total_cmp(&mass[a]).then(a.cmp(&b)));
    let mut kept: Vec<usize> = (0..n_supplied).collect();
    kept.extend(free.into_iter().take(n_keep - n_supplied));
    kept
}
