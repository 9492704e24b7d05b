use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use approx::assert_abs_diff_eq;
use ndarray::{Array2, Array3};

use poolsplit::em::posterior_is_normalized;
use poolsplit::genotype::N_GENOTYPES;
use poolsplit::report::{assign_cells, Call};
use poolsplit::restart::Stage;
use poolsplit::simulate::{simulate_pool, SimulationConfig};
use poolsplit::{
    demultiplex, run_plans, AlleleCounts, DemuxConfig, DonorGenotype, GenotypeModel, Hypothesis,
    InferenceProblem, Initialization, RestartPlan, UnassignedPolicy,
};

const N_SNPS: usize = 50;
const DEPTH: u32 = 30;

/// Donor d carries (snp + d) mod 3 alt copies, so any two donors differ at every SNP.
fn genotype_state(donor: usize, snp: usize) -> usize {
    (snp + donor) % 3
}

fn known_genotypes(n_donors: usize) -> DonorGenotype {
    let mut probs = Array3::zeros((n_donors, N_SNPS, N_GENOTYPES));
    for d in 0..n_donors {
        for s in 0..N_SNPS {
            probs[[d, s, genotype_state(d, s)]] = 1.0;
        }
    }
    DonorGenotype::from_probs(probs).unwrap()
}

/// Alt reads at DEPTH for a droplet made of the given donors in equal parts.
fn droplet_alt(donors: &[usize], snp: usize) -> u32 {
    let copies: usize = donors.iter().map(|&d| genotype_state(d, snp)).sum();
    let fraction = copies as f64 / (2.0 * donors.len() as f64);
    (fraction * DEPTH as f64).round() as u32
}

/// Cells listed by the donors in their droplet; an empty list is an uncovered cell.
fn pool(cells: &[Vec<usize>]) -> AlleleCounts {
    let mut triplets = Vec::new();
    for (c, donors) in cells.iter().enumerate() {
        if donors.is_empty() {
            continue;
        }
        for s in 0..N_SNPS {
            let alt = droplet_alt(donors, s);
            triplets.push((c, s, DEPTH - alt, alt));
        }
    }
    AlleleCounts::from_triplets(
        (0..cells.len()).map(|c| format!("cell{}", c)).collect(),
        (0..N_SNPS).map(|s| format!("snp{}", s)).collect(),
        triplets,
    )
    .unwrap()
}

fn two_donor_cells() -> Vec<Vec<usize>> {
    let mut cells = Vec::new();
    for _ in 0..15 {
        cells.push(vec![0]);
        cells.push(vec![1]);
    }
    cells
}

fn simulated(seed: u64) -> poolsplit::simulate::Simulation {
    simulate_pool(&SimulationConfig {
        n_donors: 3,
        n_cells: 90,
        n_snps: 200,
        coverage: 0.5,
        mean_depth: 5.0,
        seed,
        ..SimulationConfig::default()
    })
    .unwrap()
}

fn quick_config(n_donors: usize) -> DemuxConfig {
    DemuxConfig {
        n_restarts: 4,
        max_iter: 100,
        seed: 11,
        ..DemuxConfig::with_donors(n_donors)
    }
}

#[test]
fn posteriors_and_genotypes_are_normalized() {
    let sim = simulated(1);
    let result = demultiplex(&sim.counts, None, &quick_config(3)).unwrap();
    assert!(posterior_is_normalized(&result.posterior, 1e-9));
    assert!(result.genotypes.max_normalization_error() < 1e-9);
    assert_abs_diff_eq!(result.mixing.donors.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
}

#[test]
fn elbo_is_monotone_in_every_restart() {
    let sim = simulated(2);
    let config = DemuxConfig {
        max_iter: 60,
        learn_error_rate: true,
        ..quick_config(3)
    };
    let problem =
        InferenceProblem::new(&sim.counts, GenotypeModel::free(3, sim.counts.n_snps()), &config).unwrap();
    for seed in 0..3 {
        let run = problem.run(seed as usize, &Initialization::Random { seed }, None).unwrap();
        for trace in [&run.core_trace, &run.elbo_trace] {
            for pair in trace.windows(2) {
                assert!(
                    pair[1] >= pair[0] - 1e-8 * pair[0].abs(),
                    "ELBO dropped from {} to {}",
                    pair[0],
                    pair[1]
                );
            }
        }
    }
}

#[test]
fn known_genotypes_stay_frozen() {
    let genotypes = known_genotypes(2);
    let counts = pool(&two_donor_cells());
    let result = demultiplex(&counts, Some(&genotypes), &DemuxConfig::default()).unwrap();
    assert_eq!(result.genotypes, genotypes);
    assert_eq!(result.n_supplied, 2);
    // restarts would all compute the same run
    assert_eq!(result.restarts.len(), 1);
    assert!(result.core_trace.is_empty());
}

#[test]
fn same_seed_same_answer() {
    let sim = simulated(3);
    let config = quick_config(3);
    let a = demultiplex(&sim.counts, None, &config).unwrap();
    let b = demultiplex(&sim.counts, None, &config).unwrap();
    assert_eq!(a.posterior, b.posterior);
    assert_eq!(a.elbo_trace, b.elbo_trace);
    assert_eq!(a.best_restart, b.best_restart);
}

#[test]
fn injected_doublet_is_detected() {
    let mut cells = two_donor_cells();
    cells.push(vec![0, 1]);
    let doublet_cell = cells.len() - 1;
    let counts = pool(&cells);
    let result = demultiplex(&counts, Some(&known_genotypes(2)), &DemuxConfig::default()).unwrap();

    let pair = result.hypotheses.doublet_index(0, 1).unwrap();
    let row = result.posterior.row(doublet_cell);
    assert!(row[pair] > 0.9, "doublet posterior {}", row[pair]);
    assert!(row[pair] > row[0] && row[pair] > row[1]);

    let calls = assign_cells(&result, &counts, 0.9);
    assert_eq!(calls[doublet_cell].call, Call::Doublet);
    assert_eq!(calls[doublet_cell].best, Hypothesis::Doublet(0, 1));
    assert!(calls[doublet_cell].doublet_log_lik_ratio.unwrap() > 0.0);
}

#[test]
fn clean_singlet_is_confident() {
    let counts = pool(&two_donor_cells());
    let result = demultiplex(&counts, Some(&known_genotypes(2)), &DemuxConfig::default()).unwrap();
    for cell in 0..counts.n_cells() {
        let donor = cell % 2;
        assert!(result.posterior[[cell, donor]] > 0.95);
    }
}

#[test]
fn uncovered_cell_is_uniform() {
    let mut cells = two_donor_cells();
    cells.push(Vec::new());
    let empty = cells.len() - 1;
    let counts = pool(&cells);
    let result = demultiplex(&counts, Some(&known_genotypes(2)), &DemuxConfig::default()).unwrap();
    let n_hyp = result.hypotheses.len();
    assert_eq!(n_hyp, 4);
    for h in 0..n_hyp {
        assert_abs_diff_eq!(result.posterior[[empty, h]], 1.0 / n_hyp as f64, epsilon = 1e-12);
    }
    assert_eq!(result.diagnostics.empty_cells, vec![empty]);
}

#[test]
fn best_restart_wins_selection() {
    let cells = two_donor_cells();
    let counts = pool(&cells);
    let config = DemuxConfig {
        detect_doublets: false,
        ..DemuxConfig::with_donors(2)
    };
    let problem = InferenceProblem::new(&counts, GenotypeModel::free(2, N_SNPS), &config).unwrap();

    // equal weights keep both donors identical: a symmetric, worse optimum
    let mut plans: Vec<RestartPlan> = (0..4)
        .map(|_| RestartPlan {
            init: Initialization::Assignment(Array2::ones((cells.len(), 2))),
            cancel: None,
        })
        .collect();
    let mut truth = Array2::zeros((cells.len(), 2));
    for (c, donors) in cells.iter().enumerate() {
        truth[[c, donors[0]]] = 1.0;
    }
    plans.push(RestartPlan {
        init: Initialization::Assignment(truth),
        cancel: None,
    });

    let selection = run_plans(&problem, &plans, None, Stage::Main).unwrap();
    assert_eq!(selection.best.restart, 4);
    let worse = selection.summaries[0].elbo.unwrap();
    assert!(selection.best.elbo() > worse + 1.0);
    for summary in &selection.summaries[..4] {
        assert!(summary.elbo.unwrap() < selection.best.elbo());
    }
}

#[test]
fn cancelled_restart_does_not_affect_others() {
    let counts = pool(&two_donor_cells());
    let config = DemuxConfig::with_donors(2);
    let problem = InferenceProblem::new(&counts, GenotypeModel::free(2, N_SNPS), &config).unwrap();
    let flag = Arc::new(AtomicBool::new(true));
    let plans = vec![
        RestartPlan::random(1),
        RestartPlan::random(2).with_cancel(flag),
        RestartPlan::random(3),
    ];
    let selection = run_plans(&problem, &plans, Some(2), Stage::Main).unwrap();
    assert_ne!(selection.best.restart, 1);
    assert!(selection.summaries[1].error.is_some());
    assert!(selection.summaries[0].error.is_none());
    assert!(selection.summaries[2].elbo.is_some());
}

#[test]
fn genotype_free_recovers_simulated_donors() {
    let sim = simulated(4);
    let result = demultiplex(&sim.counts, None, &quick_config(3)).unwrap();
    let calls = assign_cells(&result, &sim.counts, 0.9);

    // majority vote maps each true donor onto an inferred one
    let mut votes = [[0usize; 3]; 3];
    for (label, call) in sim.labels.iter().zip(&calls) {
        if let (Hypothesis::Singlet(truth), Call::Donor(inferred)) = (label, call.call) {
            votes[*truth][inferred] += 1;
        }
    }
    let correct: usize = votes.iter().map(|row| row.iter().max().copied().unwrap_or(0)).sum();
    assert!(correct as f64 >= 0.85 * sim.labels.len() as f64, "{} of {} correct", correct, sim.labels.len());
}

#[test]
fn default_policy_recovers_donor_shares_and_unassigned_rate() {
    let sim = simulate_pool(&SimulationConfig {
        n_donors: 3,
        n_cells: 150,
        n_snps: 200,
        coverage: 0.5,
        mean_depth: 5.0,
        seed: 6,
        ..SimulationConfig::default()
    })
    .unwrap();
    let config = quick_config(3);
    assert_eq!(config.unassigned, UnassignedPolicy::Flat);
    let result = demultiplex(&sim.counts, None, &config).unwrap();
    let calls = assign_cells(&result, &sim.counts, 0.9);

    let mut votes = [[0usize; 3]; 3];
    let mut truth_sizes = [0usize; 3];
    for (label, call) in sim.labels.iter().zip(&calls) {
        if let Hypothesis::Singlet(truth) = label {
            truth_sizes[*truth] += 1;
            if let Call::Donor(inferred) = call.call {
                votes[*truth][inferred] += 1;
            }
        }
    }
    let mapping: Vec<usize> = votes
        .iter()
        .map(|row| (0..3).max_by_key(|&d| row[d]).unwrap())
        .collect();
    let mut distinct = mapping.clone();
    distinct.sort_unstable();
    distinct.dedup();
    assert_eq!(distinct.len(), 3, "donors merged: {:?}", votes);

    for truth in 0..3 {
        let called = calls.iter().filter(|c| c.call == Call::Donor(mapping[truth])).count();
        let expected = truth_sizes[truth] as f64;
        assert!(
            (called as f64 - expected).abs() <= 0.1 * expected + 2.0,
            "donor {}: {} called, {} true",
            truth,
            called,
            expected
        );
    }
    let unassigned = calls.iter().filter(|c| c.call == Call::Unassigned).count();
    assert!(unassigned as f64 <= 0.05 * calls.len() as f64, "{} unassigned calls", unassigned);
    // prior mean is 0.01
    assert!(result.mixing.unassigned_rate < 0.03, "unassigned rate {}", result.mixing.unassigned_rate);
    assert!(!result.core_trace.is_empty());
}

#[test]
fn warm_up_and_partial_genotypes() {
    let sim = simulated(5);
    let supplied = sim.genotypes.truncate_donors(1);
    let config = DemuxConfig {
        extra_donors: 1,
        ..quick_config(3)
    };
    let result = demultiplex(&sim.counts, Some(&supplied), &config).unwrap();
    assert_eq!(result.hypotheses.n_donors(), 3);
    assert_eq!(result.genotypes.truncate_donors(1), supplied);
    assert!(result.restarts.iter().any(|r| r.stage == Stage::Warmup));
    assert_eq!(result.restarts.iter().filter(|r| r.stage == Stage::Main).count(), 1);
    assert!(posterior_is_normalized(&result.posterior, 1e-9));
}
