//! Sparse cell x SNP allele read counts.
//!
//! Only entries with at least one read are stored; a missing entry means
//! "no coverage", which the likelihood skips rather than scores as zero.

use std::collections::BTreeMap;

use ndarray::Array2;
use serde::Serialize;

use crate::error::{DemuxError, Result};

/// Reads observed for one cell at one SNP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnpCount {
    pub snp: usize,
    pub ref_count: u32,
    pub alt_count: u32,
}

impl SnpCount {
    /// Total reads; `from_triplets` rejects entries whose depth overflows.
    pub fn depth(&self) -> u32 {
        self.ref_count.saturating_add(self.alt_count)
    }
}

/// Row-compressed (per cell) ref/alt count matrices sharing one sparsity pattern.
#[derive(Clone, Debug)]
pub struct AlleleCounts {
    cell_ids: Vec<String>,
    snp_ids: Vec<String>,
    /// `entries[indptr[c]..indptr[c + 1]]` are the covered SNPs of cell c, sorted by snp
    indptr: Vec<usize>,
    entries: Vec<SnpCount>,
}

/// Coverage facts reported before inference.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DataDiagnostics {
    pub n_cells: usize,
    pub n_snps: usize,
    pub n_entries: usize,
    /// cells without any read; they get a uniform posterior
    pub empty_cells: Vec<usize>,
    /// SNPs without any read in any cell
    pub empty_snps: Vec<usize>,
}

impl AlleleCounts {
    /// Build from `(cell, snp, ref_count, alt_count)` triplets.
    ///
    /// Duplicated (cell, snp) pairs are summed and zero-depth entries dropped.
    pub fn from_triplets<I>(cell_ids: Vec<String>, snp_ids: Vec<String>, triplets: I) -> Result<Self>
    where
        I: IntoIterator<Item = (usize, usize, u32, u32)>,
    {
        let n_cells = cell_ids.len();
        let n_snps = snp_ids.len();
        let mut rows: Vec<BTreeMap<usize, (u32, u32)>> = vec![BTreeMap::new(); n_cells];
        for (cell, snp, ref_count, alt_count) in triplets {
            if cell >= n_cells || snp >= n_snps {
                return Err(DemuxError::input_shape(format!(
                    "count entry ({}, {}) outside of {} cells x {} SNPs",
                    cell, snp, n_cells, n_snps
                )));
            }
            let slot = rows[cell].entry(snp).or_insert((0, 0));
            let summed = slot
                .0
                .checked_add(ref_count)
                .zip(slot.1.checked_add(alt_count))
                .filter(|(r, a)| r.checked_add(*a).is_some());
            match summed {
                Some(total) => *slot = total,
                None => {
                    return Err(DemuxError::input_shape(format!(
                        "read count at cell {} SNP {} overflows a 32-bit depth",
                        cell, snp
                    )))
                }
            }
        }

        let mut indptr = Vec::with_capacity(n_cells + 1);
        let mut entries = Vec::new();
        indptr.push(0);
        for row in rows {
            for (snp, (ref_count, alt_count)) in row {
                if ref_count > 0 || alt_count > 0 {
                    entries.push(SnpCount {
                        snp,
                        ref_count,
                        alt_count,
                    });
                }
            }
            indptr.push(entries.len());
        }

        Ok(AlleleCounts {
            cell_ids,
            snp_ids,
            indptr,
            entries,
        })
    }

    /// Build from two equally shaped dense cell x SNP matrices.
    pub fn from_dense(ref_counts: &Array2<u32>, alt_counts: &Array2<u32>) -> Result<Self> {
        if ref_counts.dim() != alt_counts.dim() {
            return Err(DemuxError::input_shape(format!(
                "ref matrix is {:?} but alt matrix is {:?}",
                ref_counts.dim(),
                alt_counts.dim()
            )));
        }
        let (n_cells, n_snps) = ref_counts.dim();
        let cell_ids = (0..n_cells).map(|c| format!("cell{}", c)).collect();
        let snp_ids = (0..n_snps).map(|s| format!("snp{}", s)).collect();
        let triplets = ref_counts
            .indexed_iter()
            .map(|((c, s), &r)| (c, s, r, alt_counts[[c, s]]));
        Self::from_triplets(cell_ids, snp_ids, triplets)
    }

    pub fn n_cells(&self) -> usize {
        self.cell_ids.len()
    }

    pub fn n_snps(&self) -> usize {
        self.snp_ids.len()
    }

    pub fn n_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    pub fn snp_ids(&self) -> &[String] {
        &self.snp_ids
    }

    /// Index range of a cell's entries inside `entries()`.
    pub fn cell_range(&self, cell: usize) -> std::ops::Range<usize> {
        self.indptr[cell]..self.indptr[cell + 1]
    }

    pub fn cell_entries(&self, cell: usize) -> &[SnpCount] {
        &self.entries[self.cell_range(cell)]
    }

    pub fn entries(&self) -> &[SnpCount] {
        &self.entries
    }

    /// Number of SNPs with at least one read in the cell.
    pub fn n_covered(&self, cell: usize) -> usize {
        self.indptr[cell + 1] - self.indptr[cell]
    }

    /// (alt reads, total reads) summed over cells, per SNP
    pub fn snp_totals(&self) -> Vec<(u64, u64)> {
        let mut totals = vec![(0u64, 0u64); self.n_snps()];
        for e in &self.entries {
            totals[e.snp].0 += e.alt_count as u64;
            totals[e.snp].1 += e.depth() as u64;
        }
        totals
    }

    pub fn diagnostics(&self) -> DataDiagnostics {
        let empty_cells = (0..self.n_cells()).filter(|&c| self.n_covered(c) == 0).collect();
        let empty_snps = self
            .snp_totals()
            .iter()
            .enumerate()
            .filter(|(_, (_, depth))| *depth == 0)
            .map(|(s, _)| s)
            .collect();
        DataDiagnostics {
            n_cells: self.n_cells(),
            n_snps: self.n_snps(),
            n_entries: self.n_entries(),
            empty_cells,
            empty_snps,
        }
    }

    /// Keep only the given SNP columns, in the given order.
    pub fn select_snps(&self, keep: &[usize]) -> Result<Self> {
        let mut new_index = vec![None; self.n_snps()];
        for (new, &old) in keep.iter().enumerate() {
            if old >= self.n_snps() {
                return Err(DemuxError::input_shape(format!(
                    "SNP index {} out of range ({} SNPs)",
                    old,
                    self.n_snps()
                )));
            }
            new_index[old] = Some(new);
        }
        let snp_ids = keep.iter().map(|&s| self.snp_ids[s].clone()).collect();
        let triplets = (0..self.n_cells()).flat_map(|c| {
            let new_index = &new_index;
            self.cell_entries(c)
                .iter()
                .filter_map(move |e| new_index[e.snp].map(|s| (c, s, e.ref_count, e.alt_count)))
        });
        Self::from_triplets(self.cell_ids.clone(), snp_ids, triplets.collect::<Vec<_>>())
    }
}
