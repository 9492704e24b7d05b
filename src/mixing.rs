//! Mixing proportions and hypothesis prior weights.
//!
//! Weights are parameterised as
//!
//! ```text
//! w(singlet d)    = (1 - rho - upsilon) * pi_d
//! w(doublet i,j)  = rho * pi_i * pi_j / Z(pi),   Z(pi) = sum_{k<l} pi_k pi_l
//! w(unassigned)   = upsilon
//! ```
//!
//! so a single doublet rate is shared by all pairs and split by the product
//! of the donors' proportions.

use serde::Serialize;

use crate::config::DemuxConfig;
use crate::hypothesis::{Hypothesis, HypothesisSet};

/// `x * ln(y)` with the convention `0 * ln(0) = 0`.
#[inline]
pub fn xlogy(x: f64, y: f64) -> f64 {
    if x == 0.0 {
        0.0
    } else {
        x * y.ln()
    }
}

/// Dirichlet pseudo-counts on donor proportions and on the
/// (singlet, doublet, unassigned) split.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MixingPrior {
    pub donor: f64,
    pub singlet: f64,
    pub doublet: f64,
    pub unassigned: f64,
}

impl MixingPrior {
    pub fn from_config(config: &DemuxConfig, hypotheses: &HypothesisSet) -> Self {
        let strength = config.rate_prior_strength;
        let doublet = if hypotheses.has_doublets() {
            strength * config.doublet_prior
        } else {
            0.0
        };
        let unassigned = if hypotheses.unassigned_index().is_some() {
            strength * config.unassigned_prior
        } else {
            0.0
        };
        MixingPrior {
            donor: config.donor_pseudo_count,
            singlet: strength - doublet - unassigned,
            doublet,
            unassigned,
        }
    }

    /// Same prior with no pseudo-count on the unassigned hypothesis, which
    /// pins its rate at zero.
    pub fn without_unassigned(&self) -> Self {
        MixingPrior {
            unassigned: 0.0,
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MixingProportions {
    pub donors: Vec<f64>,
    pub doublet_rate: f64,
    pub unassigned_rate: f64,
}

impl MixingProportions {
    /// Uniform donors, rates at their prior means.
    pub fn initial(hypotheses: &HypothesisSet, prior: &MixingPrior) -> Self {
        let n = hypotheses.n_donors();
        let total = prior.singlet + prior.doublet + prior.unassigned;
        MixingProportions {
            donors: vec![1.0 / n as f64; n],
            doublet_rate: prior.doublet / total,
            unassigned_rate: prior.unassigned / total,
        }
    }

    pub fn singlet_rate(&self) -> f64 {
        1.0 - self.doublet_rate - self.unassigned_rate
    }

    fn pair_normalizer(&self, hypotheses: &HypothesisSet) -> f64 {
        hypotheses
            .pairs()
            .iter()
            .map(|&(i, j)| self.donors[i] * self.donors[j])
            .sum()
    }

    /// Log prior weight of every hypothesis, in column order.
    pub fn log_weights(&self, hypotheses: &HypothesisSet) -> Vec<f64> {
        let ln_singlet = self.singlet_rate().ln();
        let ln_pair = if hypotheses.has_doublets() {
            self.doublet_rate.ln() - self.pair_normalizer(hypotheses).ln()
        } else {
            f64::NEG_INFINITY
        };
        hypotheses
            .iter()
            .map(|h| match h {
                Hypothesis::Singlet(d) => ln_singlet + self.donors[d].ln(),
                Hypothesis::Doublet(i, j) => ln_pair + self.donors[i].ln() + self.donors[j].ln(),
                Hypothesis::Unassigned => self.unassigned_rate.ln(),
            })
            .collect()
    }

    /// `sum_h mass_h ln w_h` plus the Dirichlet pseudo-count terms.
    pub fn objective(&self, masses: &[f64], hypotheses: &HypothesisSet, prior: &MixingPrior) -> f64 {
        let log_w = self.log_weights(hypotheses);
        let data: f64 = masses
            .iter()
            .zip(&log_w)
            .map(|(&m, &lw)| if m == 0.0 { 0.0 } else { m * lw })
            .sum();
        data + self.pseudo_count_term(prior)
    }

    /// Unnormalised log Dirichlet density of the current proportions.
    pub fn pseudo_count_term(&self, prior: &MixingPrior) -> f64 {
        let donors: f64 = self.donors.iter().map(|&p| xlogy(prior.donor, p)).sum();
        donors
            + xlogy(prior.singlet, self.singlet_rate())
            + xlogy(prior.doublet, self.doublet_rate)
            + xlogy(prior.unassigned, self.unassigned_rate)
    }

    /// M-step given the posterior mass of each hypothesis summed over cells.
    ///
    /// The singlet/doublet/unassigned split has a closed form. The donor
    /// proportions are proposed from the mass each donor takes part in and
    /// kept only if they do not lower the objective, since the pair
    /// normaliser couples them.
    pub fn update(&self, masses: &[f64], hypotheses: &HypothesisSet, prior: &MixingPrior) -> Self {
        let singlet_mass: f64 = (0..hypotheses.n_donors()).map(|d| masses[d]).sum();
        let doublet_mass: f64 = hypotheses.doublet_columns().map(|c| masses[c]).sum();
        let unassigned_mass = hypotheses.unassigned_index().map_or(0.0, |c| masses[c]);

        let denom = singlet_mass
            + doublet_mass
            + unassigned_mass
            + prior.singlet
            + prior.doublet
            + prior.unassigned;
        let doublet_rate = (doublet_mass + prior.doublet) / denom;
        let unassigned_rate = (unassigned_mass + prior.unassigned) / denom;

        let mut involvement: Vec<f64> = (0..hypotheses.n_donors())
            .map(|d| masses[d] + prior.donor)
            .collect();
        for (k, &(i, j)) in hypotheses.pairs().iter().enumerate() {
            let m = masses[hypotheses.pair_column(k)];
            involvement[i] += m;
            involvement[j] += m;
        }
        let total: f64 = involvement.iter().sum();
        let proposed: Vec<f64> = involvement.iter().map(|x| x / total).collect();

        let with_old_donors = MixingProportions {
            donors: self.donors.clone(),
            doublet_rate,
            unassigned_rate,
        };
        let with_new_donors = MixingProportions {
            donors: proposed,
            doublet_rate,
            unassigned_rate,
        };
        if with_new_donors.objective(masses, hypotheses, prior)
            >= with_old_donors.objective(masses, hypotheses, prior)
        {
            with_new_donors
        } else {
            with_old_donors
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn setup(n: usize) -> (HypothesisSet, MixingPrior) {
        let set = HypothesisSet::new(n, true, true);
        let prior = MixingPrior::from_config(&DemuxConfig::with_donors(n), &set);
        (set, prior)
    }

    fn weight_sum(mix: &MixingProportions, set: &HypothesisSet) -> f64 {
        mix.log_weights(set).iter().map(|lw| lw.exp()).sum()
    }

    #[test]
    fn weights_sum_to_one() {
        let (set, prior) = setup(4);
        let mut mix = MixingProportions::initial(&set, &prior);
        assert_abs_diff_eq!(weight_sum(&mix, &set), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(mix.doublet_rate, 0.05, epsilon = 1e-12);
        mix.donors = vec![0.1, 0.2, 0.3, 0.4];
        assert_abs_diff_eq!(weight_sum(&mix, &set), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn held_out_unassigned_has_zero_weight() {
        let (set, prior) = setup(3);
        let held_out = prior.without_unassigned();
        let mix = MixingProportions::initial(&set, &held_out);
        assert_eq!(mix.unassigned_rate, 0.0);
        let unassigned = set.unassigned_index().unwrap();
        assert_eq!(mix.log_weights(&set)[unassigned], f64::NEG_INFINITY);
        assert_abs_diff_eq!(weight_sum(&mix, &set), 1.0, epsilon = 1e-12);

        let mut masses = vec![10.0; set.len()];
        masses[unassigned] = 0.0;
        let updated = mix.update(&masses, &set, &held_out);
        assert_eq!(updated.unassigned_rate, 0.0);
        assert!(updated.objective(&masses, &set, &held_out).is_finite());
        assert!(updated.pseudo_count_term(&held_out).is_finite());
    }

    #[test]
    fn update_tracks_masses_and_never_lowers_objective() {
        let (set, prior) = setup(3);
        let mix = MixingProportions::initial(&set, &prior);
        // 60 cells on donor 0, 30 on donor 1, 5 on pair (0,1), 5 unassigned
        let mut masses = vec![0.0; set.len()];
        masses[0] = 60.0;
        masses[1] = 30.0;
        masses[set.doublet_index(0, 1).unwrap()] = 5.0;
        masses[set.unassigned_index().unwrap()] = 5.0;
        let updated = mix.update(&masses, &set, &prior);
        assert!(updated.donors[0] > updated.donors[1]);
        assert!(updated.donors[1] > updated.donors[2]);
        assert_abs_diff_eq!(updated.donors.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(updated.doublet_rate, (5.0 + 0.5) / 110.0, epsilon = 1e-12);
        assert!(
            updated.objective(&masses, &set, &prior) >= mix.objective(&masses, &set, &prior)
        );
    }

    #[test]
    fn no_doublets_means_zero_rate() {
        let set = HypothesisSet::new(2, false, false);
        let prior = MixingPrior::from_config(&DemuxConfig::with_donors(2), &set);
        let mix = MixingProportions::initial(&set, &prior);
        assert_eq!(mix.doublet_rate, 0.0);
        assert_eq!(mix.unassigned_rate, 0.0);
        let updated = mix.update(&[3.0, 1.0], &set, &prior);
        assert_abs_diff_eq!(updated.donors[0], 4.0 / 6.0, epsilon = 1e-12);
        assert!(updated.objective(&[3.0, 1.0], &set, &prior).is_finite());
    }
}
