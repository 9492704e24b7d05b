//! cellSNP-style MatrixMarket count files.
//!
//! `AD` and `DP` are SNP x cell coordinate matrices with 1-based indices;
//! the reference count of an entry is `DP - AD`. Files ending in `.gz` are
//! read and written through flate2.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{info, warn};

use crate::counts::AlleleCounts;
use crate::donor_vcf;
use crate::error::{DemuxError, Result};

pub const AD_FILE: &str = "cellSNP.tag.AD.mtx";
pub const DP_FILE: &str = "cellSNP.tag.DP.mtx";
pub const SAMPLES_FILE: &str = "cellSNP.samples.tsv";
pub const SITES_FILES: [&str; 2] = ["cellSNP.base.vcf.gz", "cellSNP.base.vcf"];

fn is_gz(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "gz")
}

/// Buffered reader, transparently decompressing `.gz` files.
pub fn reader(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    if is_gz(path) {
        Ok(Box::new(BufReader::with_capacity(128 * 1024, MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::with_capacity(128 * 1024, file)))
    }
}

/// Buffered output file, gzip-compressed when the path ends in `.gz`.
///
/// Call [`OutputFile::finish`] when done; it flushes the buffer and writes
/// the gzip trailer, reporting any error that dropping the writer would hide.
pub enum OutputFile {
    Plain(BufWriter<File>),
    Gz(BufWriter<GzEncoder<File>>),
}

impl OutputFile {
    pub fn finish(self) -> Result<()> {
        match self {
            OutputFile::Plain(mut out) => out.flush()?,
            OutputFile::Gz(out) => {
                let encoder = out.into_inner().map_err(|e| e.into_error())?;
                encoder.finish()?;
            }
        }
        Ok(())
    }
}

impl Write for OutputFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputFile::Plain(out) => out.write(buf),
            OutputFile::Gz(out) => out.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputFile::Plain(out) => out.flush(),
            OutputFile::Gz(out) => out.flush(),
        }
    }
}

pub fn writer(path: &Path) -> Result<OutputFile> {
    let file = File::create(path)?;
    if is_gz(path) {
        Ok(OutputFile::Gz(BufWriter::new(GzEncoder::new(file, Compression::default()))))
    } else {
        Ok(OutputFile::Plain(BufWriter::new(file)))
    }
}

/// Sparse integer matrix in coordinate form, 0-based.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoordinateMatrix {
    pub n_rows: usize,
    pub n_cols: usize,
    pub entries: Vec<(usize, usize, u32)>,
}

pub fn read_mtx(path: &Path) -> Result<CoordinateMatrix> {
    let mut shape: Option<(usize, usize, usize)> = None;
    let mut entries = Vec::new();
    for (i, line) in reader(path)?.lines().enumerate() {
        let line = line?;
        let line_no = i + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('%') {
            continue;
        }
        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        if tokens.len() != 3 {
            return Err(DemuxError::parse(path, line_no, format!("expected 3 fields, got {}", tokens.len())));
        }
        let parse = |t: &str| -> Result<usize> {
            t.parse::<usize>()
                .map_err(|_| DemuxError::parse(path, line_no, format!("not a non-negative integer: {}", t)))
        };
        match shape {
            None => shape = Some((parse(tokens[0])?, parse(tokens[1])?, parse(tokens[2])?)),
            Some((n_rows, n_cols, _)) => {
                let row = parse(tokens[0])?;
                let col = parse(tokens[1])?;
                if row == 0 || col == 0 || row > n_rows || col > n_cols {
                    return Err(DemuxError::parse(
                        path,
                        line_no,
                        format!("index ({}, {}) outside a {} x {} matrix", row, col, n_rows, n_cols),
                    ));
                }
                let value = tokens[2]
                    .parse::<u32>()
                    .map_err(|_| DemuxError::parse(path, line_no, format!("bad count: {}", tokens[2])))?;
                entries.push((row - 1, col - 1, value));
            }
        }
    }
    let (n_rows, n_cols, n_entries) =
        shape.ok_or_else(|| DemuxError::parse(path, 0, "missing MatrixMarket size line"))?;
    if entries.len() != n_entries {
        warn!(
            "{}: header declares {} entries but {} were read",
            path.display(),
            n_entries,
            entries.len()
        );
    }
    Ok(CoordinateMatrix {
        n_rows,
        n_cols,
        entries,
    })
}

pub fn write_mtx(path: &Path, matrix: &CoordinateMatrix) -> Result<()> {
    let mut out = writer(path)?;
    writeln!(out, "%%MatrixMarket matrix coordinate integer general")?;
    writeln!(out, "%")?;
    writeln!(out, "{}\t{}\t{}", matrix.n_rows, matrix.n_cols, matrix.entries.len())?;
    for &(row, col, value) in &matrix.entries {
        writeln!(out, "{}\t{}\t{}", row + 1, col + 1, value)?;
    }
    out.finish()
}

/// Non-empty lines of a text file, one identifier per line.
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for line in reader(path)?.lines() {
        let line = line?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            out.push(trimmed.to_string());
        }
    }
    Ok(out)
}

/// Join SNP x cell `AD` and `DP` matrices into per-cell ref/alt counts.
pub fn counts_from_ad_dp(
    ad: &CoordinateMatrix,
    dp: &CoordinateMatrix,
    cell_ids: Vec<String>,
    snp_ids: Vec<String>,
) -> Result<AlleleCounts> {
    if (ad.n_rows, ad.n_cols) != (dp.n_rows, dp.n_cols) {
        return Err(DemuxError::input_shape(format!(
            "AD is {} x {} but DP is {} x {}",
            ad.n_rows, ad.n_cols, dp.n_rows, dp.n_cols
        )));
    }
    if cell_ids.len() != dp.n_cols || snp_ids.len() != dp.n_rows {
        return Err(DemuxError::input_shape(format!(
            "{} cell ids and {} SNP ids for a {} x {} count matrix",
            cell_ids.len(),
            snp_ids.len(),
            dp.n_rows,
            dp.n_cols
        )));
    }
    let mut alt: HashMap<(usize, usize), u32> = HashMap::with_capacity(ad.entries.len());
    for &(snp, cell, value) in &ad.entries {
        *alt.entry((snp, cell)).or_default() += value;
    }
    let mut triplets = Vec::with_capacity(dp.entries.len());
    for &(snp, cell, depth) in &dp.entries {
        let alt_count = alt.remove(&(snp, cell)).unwrap_or(0);
        if alt_count > depth {
            return Err(DemuxError::input_shape(format!(
                "AD ({}) exceeds DP ({}) at SNP {} cell {}",
                alt_count,
                depth,
                snp + 1,
                cell + 1
            )));
        }
        triplets.push((cell, snp, depth - alt_count, alt_count));
    }
    if let Some((&(snp, cell), _)) = alt.iter().find(|(_, v)| **v > 0) {
        return Err(DemuxError::input_shape(format!(
            "AD has reads at SNP {} cell {} where DP has none",
            snp + 1,
            cell + 1
        )));
    }
    AlleleCounts::from_triplets(cell_ids, snp_ids, triplets)
}

fn sites_file(dir: &Path) -> Option<PathBuf> {
    SITES_FILES.iter().map(|f| dir.join(f)).find(|p| p.exists())
}

/// Load explicit AD/DP files; SNP ids come from `sites` if given.
pub fn load_counts(ad_path: &Path, dp_path: &Path, barcodes: &Path, sites: Option<&Path>) -> Result<AlleleCounts> {
    let ad = read_mtx(ad_path)?;
    let dp = read_mtx(dp_path)?;
    let cell_ids = read_lines(barcodes)?;
    let snp_ids = match sites {
        Some(path) => donor_vcf::read_site_ids(path)?,
        None => (0..dp.n_rows).map(|s| format!("snp{}", s)).collect(),
    };
    let counts = counts_from_ad_dp(&ad, &dp, cell_ids, snp_ids)?;
    info!(
        "loaded {} cells x {} SNPs ({} covered entries) from {}",
        counts.n_cells(),
        counts.n_snps(),
        counts.n_entries(),
        dp_path.display()
    );
    Ok(counts)
}

/// Load a cellSNP output directory.
pub fn load_cellsnp_dir(dir: &Path) -> Result<AlleleCounts> {
    let sites = sites_file(dir);
    if sites.is_none() {
        warn!("no cellSNP.base.vcf in {}; SNPs are identified by index", dir.display());
    }
    load_counts(&dir.join(AD_FILE), &dir.join(DP_FILE), &dir.join(SAMPLES_FILE), sites.as_deref())
}

/// Write counts as a cellSNP-style directory (AD, DP and barcodes).
pub fn write_cellsnp_dir(dir: &Path, counts: &AlleleCounts) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut ad = Vec::new();
    let mut dp = Vec::with_capacity(counts.n_entries());
    for cell in 0..counts.n_cells() {
        for e in counts.cell_entries(cell) {
            if e.alt_count > 0 {
                ad.push((e.snp, cell, e.alt_count));
            }
            dp.push((e.snp, cell, e.depth()));
        }
    }
    // MatrixMarket readers expect column-major order
    ad.sort_unstable_by_key(|&(snp, cell, _)| (cell, snp));
    dp.sort_unstable_by_key(|&(snp, cell, _)| (cell, snp));
    let shape = |entries| CoordinateMatrix {
        n_rows: counts.n_snps(),
        n_cols: counts.n_cells(),
        entries,
    };
    write_mtx(&dir.join(AD_FILE), &shape(ad))?;
    write_mtx(&dir.join(DP_FILE), &shape(dp))?;
    let mut out = writer(&dir.join(SAMPLES_FILE))?;
    for id in counts.cell_ids() {
        writeln!(out, "{}", id)?;
    }
    out.finish()
}
