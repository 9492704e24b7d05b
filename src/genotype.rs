//! Per-donor, per-SNP genotype distributions over {0, 1, 2} alt copies.

use ndarray::{s, Array3, ArrayView1};

use crate::error::{DemuxError, Result};

/// Number of genotype states: 0, 1 or 2 copies of the alt allele.
pub const N_GENOTYPES: usize = 3;

const UNIFORM: [f64; N_GENOTYPES] = [1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0];

/// Genotype probabilities, shape donors x SNPs x 3. Every (donor, SNP) slice sums to 1.
#[derive(Clone, Debug, PartialEq)]
pub struct DonorGenotype {
    probs: Array3<f64>,
}

impl DonorGenotype {
    pub fn uniform(n_donors: usize, n_snps: usize) -> Self {
        let mut probs = Array3::zeros((n_donors, n_snps, N_GENOTYPES));
        for mut row in probs.lanes_mut(ndarray::Axis(2)) {
            row.assign(&ArrayView1::from(&UNIFORM));
        }
        DonorGenotype { probs }
    }

    /// Validate and normalise an externally supplied probability tensor.
    ///
    /// Slices summing to zero (missing genotype) become uniform.
    pub fn from_probs(mut probs: Array3<f64>) -> Result<Self> {
        if probs.dim().2 != N_GENOTYPES {
            return Err(DemuxError::input_shape(format!(
                "genotype tensor must have {} states, got {}",
                N_GENOTYPES,
                probs.dim().2
            )));
        }
        for mut row in probs.lanes_mut(ndarray::Axis(2)) {
            if row.iter().any(|p| !p.is_finite() || *p < 0.0) {
                return Err(DemuxError::input_shape(
                    "genotype probabilities must be finite and non-negative",
                ));
            }
            let total: f64 = row.sum();
            if total > 0.0 {
                row.mapv_inplace(|p| p / total);
            } else {
                row.assign(&ArrayView1::from(&UNIFORM));
            }
        }
        Ok(DonorGenotype { probs })
    }

    pub fn n_donors(&self) -> usize {
        self.probs.dim().0
    }

    pub fn n_snps(&self) -> usize {
        self.probs.dim().1
    }

    pub fn probs(&self) -> &Array3<f64> {
        &self.probs
    }

    #[inline]
    pub fn get(&self, donor: usize, snp: usize) -> [f64; N_GENOTYPES] {
        [
            self.probs[[donor, snp, 0]],
            self.probs[[donor, snp, 1]],
            self.probs[[donor, snp, 2]],
        ]
    }

    pub fn set(&mut self, donor: usize, snp: usize, dist: [f64; N_GENOTYPES]) {
        for (g, p) in dist.iter().enumerate() {
            self.probs[[donor, snp, g]] = *p;
        }
    }

    /// Most probable genotype state.
    pub fn argmax(&self, donor: usize, snp: usize) -> usize {
        let dist = self.get(donor, snp);
        (0..N_GENOTYPES)
            .fold(0, |best, g| if dist[g] > dist[best] { g } else { best })
    }

    /// Expected number of alt copies.
    pub fn dosage(&self, donor: usize, snp: usize) -> f64 {
        let dist = self.get(donor, snp);
        dist[1] + 2.0 * dist[2]
    }

    /// Largest deviation of any (donor, SNP) slice from summing to one.
    pub fn max_normalization_error(&self) -> f64 {
        self.probs
            .lanes(ndarray::Axis(2))
            .into_iter()
            .map(|row| (row.sum() - 1.0).abs())
            .fold(0.0, f64::max)
    }

    /// Copy of the first `n_donors` donors.
    pub fn truncate_donors(&self, n_donors: usize) -> Self {
        DonorGenotype {
            probs: self.probs.slice(s![..n_donors, .., ..]).to_owned(),
        }
    }

    /// Keep only the given SNPs, in the given order.
    pub fn select_snps(&self, keep: &[usize]) -> Self {
        let mut probs = Array3::zeros((self.n_donors(), keep.len(), N_GENOTYPES));
        for d in 0..self.n_donors() {
            for (new, &old) in keep.iter().enumerate() {
                probs
                    .slice_mut(s![d, new, ..])
                    .assign(&self.probs.slice(s![d, old, ..]));
            }
        }
        DonorGenotype { probs }
    }
}

/// Prior over genotypes and which donors are re-estimated.
///
/// Supplied donors come first; donors beyond the supplied ones are
/// genotype-free with a symmetric prior.
#[derive(Clone, Debug)]
pub struct GenotypeModel {
    prior: DonorGenotype,
    initial: DonorGenotype,
    frozen: Vec<bool>,
}

impl GenotypeModel {
    /// All donors free, symmetric prior.
    pub fn free(n_donors: usize, n_snps: usize) -> Self {
        GenotypeModel {
            prior: DonorGenotype::uniform(n_donors, n_snps),
            initial: DonorGenotype::uniform(n_donors, n_snps),
            frozen: vec![false; n_donors],
        }
    }

    /// Supplied genotypes for the first donors, free donors for the rest.
    ///
    /// With `learn_supplied` the supplied values, blended with the symmetric
    /// prior by `blend`, act as a prior; otherwise they are frozen.
    pub fn with_supplied(
        n_donors: usize,
        supplied: &DonorGenotype,
        learn_supplied: bool,
        blend: f64,
    ) -> Result<Self> {
        let n_supplied = supplied.n_donors();
        if n_supplied > n_donors {
            return Err(DemuxError::input_shape(format!(
                "{} donors supplied but only {} requested",
                n_supplied, n_donors
            )));
        }
        let n_snps = supplied.n_snps();
        let mut model = Self::free(n_donors, n_snps);
        for d in 0..n_supplied {
            for snp in 0..n_snps {
                let dist = supplied.get(d, snp);
                if learn_supplied {
                    let blended = dist.map(|p| (1.0 - blend) * p + blend / N_GENOTYPES as f64);
                    model.prior.set(d, snp, blended);
                    model.initial.set(d, snp, blended);
                } else {
                    model.prior.set(d, snp, dist);
                    model.initial.set(d, snp, dist);
                }
            }
            model.frozen[d] = !learn_supplied;
        }
        Ok(model)
    }

    /// Append free donors (used by the over-clustering warm-up).
    pub fn with_extra_donors(&self, extra: usize) -> Self {
        let n = self.n_donors() + extra;
        let mut model = Self::free(n, self.n_snps());
        for d in 0..self.n_donors() {
            for snp in 0..self.n_snps() {
                model.prior.set(d, snp, self.prior.get(d, snp));
                model.initial.set(d, snp, self.initial.get(d, snp));
            }
            model.frozen[d] = self.frozen[d];
        }
        model
    }

    pub fn n_donors(&self) -> usize {
        self.frozen.len()
    }

    pub fn n_snps(&self) -> usize {
        self.prior.n_snps()
    }

    pub fn is_frozen(&self, donor: usize) -> bool {
        self.frozen[donor]
    }

    pub fn n_free(&self) -> usize {
        self.frozen.iter().filter(|f| !**f).count()
    }

    pub fn prior(&self) -> &DonorGenotype {
        &self.prior
    }

    /// Starting genotypes: supplied values for supplied donors, prior otherwise.
    pub fn initial(&self) -> &DonorGenotype {
        &self.initial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn from_probs_normalises_and_fills_missing() {
        let mut t = Array3::zeros((1, 2, 3));
        t[[0, 0, 1]] = 2.0;
        t[[0, 0, 2]] = 2.0;
        let g = DonorGenotype::from_probs(t).unwrap();
        assert_eq!(g.get(0, 0), [0.0, 0.5, 0.5]);
        assert_abs_diff_eq!(g.get(0, 1)[0], 1.0 / 3.0);
        assert!(g.max_normalization_error() < 1e-12);
        assert_abs_diff_eq!(g.dosage(0, 0), 1.5);
        assert_eq!(g.argmax(0, 0), 1);
    }

    #[test]
    fn from_probs_rejects_wrong_states() {
        assert!(DonorGenotype::from_probs(Array3::zeros((1, 2, 2))).is_err());
        let mut t = Array3::zeros((1, 1, 3));
        t[[0, 0, 0]] = -1.0;
        assert!(DonorGenotype::from_probs(t).is_err());
    }

    #[test]
    fn supplied_donors_frozen_unless_learned() {
        let mut t = Array3::zeros((1, 2, 3));
        t[[0, 0, 0]] = 1.0;
        t[[0, 1, 2]] = 1.0;
        let supplied = DonorGenotype::from_probs(t).unwrap();

        let model = GenotypeModel::with_supplied(3, &supplied, false, 0.1).unwrap();
        assert!(model.is_frozen(0));
        assert!(!model.is_frozen(1));
        assert_eq!(model.n_free(), 2);
        assert_eq!(model.initial().get(0, 1), [0.0, 0.0, 1.0]);

        let learned = GenotypeModel::with_supplied(3, &supplied, true, 0.3).unwrap();
        assert!(!learned.is_frozen(0));
        assert_abs_diff_eq!(learned.prior().get(0, 0)[0], 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(learned.prior().get(0, 0)[1], 0.1, epsilon = 1e-12);

        let wider = model.with_extra_donors(2);
        assert_eq!(wider.n_donors(), 5);
        assert!(wider.is_frozen(0));
        assert!(GenotypeModel::with_supplied(0, &supplied, false, 0.0).is_err());
    }

    #[test]
    fn select_and_truncate() {
        let mut g = DonorGenotype::uniform(2, 3);
        g.set(1, 2, [0.0, 0.0, 1.0]);
        let sub = g.select_snps(&[2]);
        assert_eq!(sub.n_snps(), 1);
        assert_eq!(sub.get(1, 0), [0.0, 0.0, 1.0]);
        assert_eq!(g.truncate_donors(1).n_donors(), 1);
    }
}
