//! The enumerated hypothesis set: singlets, unordered donor pairs, unassigned.
//!
//! Built once from the donor count; every per-hypothesis quantity is a plain
//! column index into a cell x hypothesis table.

use std::fmt;

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Hypothesis {
    Singlet(usize),
    /// Unordered pair, always stored with `i < j`
    Doublet(usize, usize),
    Unassigned,
}

impl fmt::Display for Hypothesis {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Hypothesis::Singlet(d) => write!(f, "donor{}", d),
            Hypothesis::Doublet(i, j) => write!(f, "donor{},donor{}", i, j),
            Hypothesis::Unassigned => write!(f, "unassigned"),
        }
    }
}

/// Column layout: `0..n_donors` singlets, then pairs in (0,1), (0,2), ..., (n-2,n-1)
/// order, then the optional unassigned column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HypothesisSet {
    n_donors: usize,
    hypotheses: Vec<Hypothesis>,
    pairs: Vec<(usize, usize)>,
    unassigned: Option<usize>,
}

impl HypothesisSet {
    pub fn new(n_donors: usize, with_doublets: bool, with_unassigned: bool) -> Self {
        let mut hypotheses: Vec<Hypothesis> = (0..n_donors).map(Hypothesis::Singlet).collect();
        let mut pairs = Vec::new();
        if with_doublets {
            for i in 0..n_donors {
                for j in (i + 1)..n_donors {
                    pairs.push((i, j));
                    hypotheses.push(Hypothesis::Doublet(i, j));
                }
            }
        }
        let unassigned = if with_unassigned {
            hypotheses.push(Hypothesis::Unassigned);
            Some(hypotheses.len() - 1)
        } else {
            None
        };
        HypothesisSet {
            n_donors,
            hypotheses,
            pairs,
            unassigned,
        }
    }

    pub fn len(&self) -> usize {
        self.hypotheses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hypotheses.is_empty()
    }

    pub fn n_donors(&self) -> usize {
        self.n_donors
    }

    pub fn has_doublets(&self) -> bool {
        !self.pairs.is_empty()
    }

    pub fn get(&self, index: usize) -> Hypothesis {
        self.hypotheses[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = Hypothesis> + '_ {
        self.hypotheses.iter().copied()
    }

    /// Donor pairs in column order.
    pub fn pairs(&self) -> &[(usize, usize)] {
        &self.pairs
    }

    #[inline]
    pub fn singlet_index(&self, donor: usize) -> usize {
        donor
    }

    /// Column of the k-th pair.
    #[inline]
    pub fn pair_column(&self, k: usize) -> usize {
        self.n_donors + k
    }

    /// Column range of all doublet hypotheses.
    pub fn doublet_columns(&self) -> std::ops::Range<usize> {
        self.n_donors..self.n_donors + self.pairs.len()
    }

    /// Column of the pair {a, b}, in either order.
    pub fn doublet_index(&self, a: usize, b: usize) -> Option<usize> {
        if a == b || a >= self.n_donors || b >= self.n_donors || self.pairs.is_empty() {
            return None;
        }
        let (i, j) = if a < b { (a, b) } else { (b, a) };
        // pairs before row i: sum_{r<i} (n - 1 - r)
        let before = i * (2 * self.n_donors - i - 1) / 2;
        Some(self.n_donors + before + (j - i - 1))
    }

    pub fn unassigned_index(&self) -> Option<usize> {
        self.unassigned
    }
}
