//! Donor demultiplexing of pooled single-cell data from allele read counts.
//!
//! Cells are assigned to donors, donor pairs (doublets) or "unassigned" by
//! variational EM over a mixture of binomial or beta-binomial allele count
//! models, with or without known donor genotypes.

pub mod config;
pub mod counts;
pub mod donor_vcf;
pub mod em;
pub mod error;
pub mod genotype;
pub mod hypothesis;
pub mod likelihood;
pub mod mixing;
pub mod mtx;
pub mod output;
pub mod report;
pub mod restart;
pub mod simulate;

pub use config::{DemuxConfig, LikelihoodModel, UnassignedPolicy};
pub use counts::AlleleCounts;
pub use em::{InferenceProblem, Initialization, RunStatus};
pub use error::{DemuxError, RestartError, Result};
pub use genotype::{DonorGenotype, GenotypeModel};
pub use hypothesis::{Hypothesis, HypothesisSet};
pub use likelihood::AlleleFractions;
pub use restart::{demultiplex, run_plans, DemuxResult, RestartPlan, Stage};
