use serde::{Deserialize, Serialize};

use crate::error::{DemuxError, Result};

/// Read-count model for the alt allele at one SNP given the genotype state.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum LikelihoodModel {
    Binomial,
    /// Beta-binomial with mean equal to the genotype's alt fraction.
    /// Smaller concentration absorbs more over-dispersion.
    BetaBinomial { concentration: f64 },
}

/// Likelihood given to the "unassigned" hypothesis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnassignedPolicy {
    /// Alt count uniform on `0..=depth`, i.e. no allelic signal at all
    Flat,
    /// Binomial at the pooled alt fraction of the SNP across all cells
    Background,
    /// No unassigned hypothesis
    Disabled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DemuxConfig {
    pub n_donors: Option<usize>,
    pub seed: u64,
    pub n_restarts: usize,
    pub threads: Option<usize>,
    pub max_iter: usize,
    pub min_iter: usize,
    /// relative ELBO improvement below which a restart is converged
    pub tolerance: f64,
    pub error_rate: f64,
    pub learn_error_rate: bool,
    /// learn one alt fraction per genotype state instead of a shared error rate
    pub learn_allele_fractions: bool,
    pub likelihood: LikelihoodModel,
    pub unassigned: UnassignedPolicy,
    pub detect_doublets: bool,
    pub doublet_prior: f64,
    pub unassigned_prior: f64,
    pub rate_prior_strength: f64,
    pub donor_pseudo_count: f64,
    pub learn_known_genotypes: bool,
    pub genotype_prior_blend: f64,
    pub extra_donors: usize,
    pub warmup_iter: usize,
    pub min_call_prob: f64,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            n_donors: None,
            seed: 0,
            n_restarts: 10,
            threads: None,
            max_iter: 200,
            min_iter: 5,
            tolerance: 1e-6,
            error_rate: 0.01,
            learn_error_rate: false,
            learn_allele_fractions: false,
            likelihood: LikelihoodModel::Binomial,
            unassigned: UnassignedPolicy::Flat,
            detect_doublets: true,
            doublet_prior: 0.05,
            unassigned_prior: 0.01,
            rate_prior_strength: 10.0,
            donor_pseudo_count: 1.0,
            learn_known_genotypes: false,
            genotype_prior_blend: 0.01,
            extra_donors: 0,
            warmup_iter: 10,
            min_call_prob: 0.9,
        }
    }
}

impl DemuxConfig {
    pub fn with_donors(n_donors: usize) -> Self {
        Self {
            n_donors: Some(n_donors),
            ..Self::default()
        }
    }

    /// Check value ranges. Shape checks against the data happen in the controller.
    pub fn validate(&self) -> Result<()> {
        if let Some(0) = self.n_donors {
            return Err(DemuxError::config("n_donors must be at least 1"));
        }
        if self.n_restarts == 0 {
            return Err(DemuxError::config("n_restarts must be at least 1"));
        }
        if self.max_iter == 0 {
            return Err(DemuxError::config("max_iter must be at least 1"));
        }
        if self.min_iter > self.max_iter {
            return Err(DemuxError::config(format!(
                "min_iter ({}) exceeds max_iter ({})",
                self.min_iter, self.max_iter
            )));
        }
        if !(self.tolerance >= 0.0 && self.tolerance.is_finite()) {
            return Err(DemuxError::config("tolerance must be a finite non-negative number"));
        }
        if !(self.error_rate > 0.0 && self.error_rate < 0.5) {
            return Err(DemuxError::config(format!(
                "error_rate must lie in (0, 0.5), got {}",
                self.error_rate
            )));
        }
        if let LikelihoodModel::BetaBinomial { concentration } = self.likelihood {
            if !(concentration > 0.0 && concentration.is_finite()) {
                return Err(DemuxError::config("beta-binomial concentration must be positive"));
            }
        }
        let rates = [
            ("doublet_prior", self.doublet_prior),
            ("unassigned_prior", self.unassigned_prior),
        ];
        for (name, value) in rates {
            if !(value > 0.0 && value < 1.0) {
                return Err(DemuxError::config(format!("{} must lie in (0, 1), got {}", name, value)));
            }
        }
        if self.doublet_prior + self.unassigned_prior >= 1.0 {
            return Err(DemuxError::config("doublet_prior + unassigned_prior must be below 1"));
        }
        if !(self.rate_prior_strength > 0.0) || !(self.donor_pseudo_count > 0.0) {
            return Err(DemuxError::config("prior pseudo-counts must be positive"));
        }
        if !(0.0..=1.0).contains(&self.genotype_prior_blend) {
            return Err(DemuxError::config("genotype_prior_blend must lie in [0, 1]"));
        }
        if !(self.min_call_prob > 0.0 && self.min_call_prob <= 1.0) {
            return Err(DemuxError::config("min_call_prob must lie in (0, 1]"));
        }
        if self.extra_donors > 0 && self.warmup_iter == 0 {
            return Err(DemuxError::config("warmup_iter must be at least 1 with extra_donors"));
        }
        if let Some(0) = self.threads {
            return Err(DemuxError::config("threads must be at least 1"));
        }
        Ok(())
    }
}
