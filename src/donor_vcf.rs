//! Donor genotypes and SNP identifiers from VCF/BCF files.

use std::path::Path;
use std::str::FromStr;

use log::{info, warn};
use ndarray::Array3;
use rust_htslib::bcf::record::Numeric;
use rust_htslib::bcf::{self, Read};

use crate::counts::AlleleCounts;
use crate::error::{DemuxError, Result};
use crate::genotype::{DonorGenotype, N_GENOTYPES};

const UNIFORM: [f64; N_GENOTYPES] = [1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0];

/// FORMAT field the donor genotypes are read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenotypeTag {
    /// hard calls, e.g. `0/1`
    GT,
    /// genotype probabilities
    GP,
    /// phred-scaled genotype likelihoods
    PL,
}

impl FromStr for GenotypeTag {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GT" => Ok(GenotypeTag::GT),
            "GP" => Ok(GenotypeTag::GP),
            "PL" => Ok(GenotypeTag::PL),
            other => Err(format!("unsupported genotype tag {}, expected GT, GP or PL", other)),
        }
    }
}

/// Genotypes of the donors in a VCF, with the sample and site names.
#[derive(Clone, Debug)]
pub struct DonorGenotypes {
    pub donor_names: Vec<String>,
    pub snp_ids: Vec<String>,
    pub genotypes: DonorGenotype,
}

/// `chrom_pos_ref_alt` with a 1-based position; `alt` is `.` for monomorphic sites.
pub fn site_id(record: &bcf::Record) -> Result<String> {
    let rid = record
        .rid()
        .ok_or_else(|| DemuxError::input_shape(format!("VCF record at {} has no contig", record.pos() + 1)))?;
    let chrom = String::from_utf8_lossy(record.header().rid2name(rid)?).to_string();
    let alleles = record.alleles();
    let reference = alleles.first().map_or(".".into(), |a| String::from_utf8_lossy(a).to_string());
    let alt = alleles.get(1).map_or(".".into(), |a| String::from_utf8_lossy(a).to_string());
    Ok(format!("{}_{}_{}_{}", chrom, record.pos() + 1, reference, alt))
}

/// Identifier used to match sites across files: contig without a `chr` prefix.
pub fn match_key(id: &str) -> &str {
    id.strip_prefix("chr").unwrap_or(id)
}

/// Site identifiers of every record, in file order.
pub fn read_site_ids(path: &Path) -> Result<Vec<String>> {
    let mut reader = bcf::Reader::from_path(path)?;
    let mut ids = Vec::new();
    for record in reader.records() {
        ids.push(site_id(&record?)?);
    }
    Ok(ids)
}

fn from_gt(alleles: &[bcf::record::GenotypeAllele]) -> [f64; N_GENOTYPES] {
    let indices: Option<Vec<u32>> = alleles.iter().map(|a| a.index()).collect();
    match indices {
        Some(indices) if !indices.is_empty() => {
            let alt_copies = indices.iter().filter(|&&i| i > 0).count();
            // haploid calls count as homozygous
            let dosage = if indices.len() == 1 { 2 * alt_copies } else { alt_copies.min(2) };
            let mut dist = [0.0; N_GENOTYPES];
            dist[dosage] = 1.0;
            dist
        }
        _ => UNIFORM,
    }
}

fn from_gp(values: &[f32]) -> [f64; N_GENOTYPES] {
    if values.len() < N_GENOTYPES || values[..N_GENOTYPES].iter().any(|v| v.is_missing() || v.is_nan()) {
        return UNIFORM;
    }
    [values[0] as f64, values[1] as f64, values[2] as f64]
}

fn from_pl(values: &[i32]) -> [f64; N_GENOTYPES] {
    if values.len() < N_GENOTYPES || values[..N_GENOTYPES].iter().any(|v| v.is_missing()) {
        return UNIFORM;
    }
    let mut dist = [0.0; N_GENOTYPES];
    for g in 0..N_GENOTYPES {
        dist[g] = 10f64.powf(-(values[g] as f64) / 10.0);
    }
    dist
}

/// Read donor genotypes from `tag`. Multi-allelic records are skipped.
pub fn read_donor_genotypes(path: &Path, tag: GenotypeTag) -> Result<DonorGenotypes> {
    let mut reader = bcf::Reader::from_path(path)?;
    let donor_names: Vec<String> = reader
        .header()
        .samples()
        .iter()
        .map(|s| String::from_utf8_lossy(s).to_string())
        .collect();
    let n_donors = donor_names.len();
    if n_donors == 0 {
        return Err(DemuxError::input_shape(format!("{} has no samples", path.display())));
    }

    let mut snp_ids = Vec::new();
    let mut sites: Vec<Vec<[f64; N_GENOTYPES]>> = Vec::new();
    let mut skipped = 0usize;
    for record in reader.records() {
        let record = record?;
        if record.alleles().len() > 2 {
            skipped += 1;
            continue;
        }
        let mut row = Vec::with_capacity(n_donors);
        match tag {
            GenotypeTag::GT => {
                let genotypes = record.genotypes()?;
                for i in 0..n_donors {
                    row.push(from_gt(&genotypes.get(i)));
                }
            }
            GenotypeTag::GP => {
                let values = record.format(b"GP").float()?;
                for i in 0..n_donors {
                    row.push(from_gp(values[i]));
                }
            }
            GenotypeTag::PL => {
                let values = record.format(b"PL").integer()?;
                for i in 0..n_donors {
                    row.push(from_pl(values[i]));
                }
            }
        }
        snp_ids.push(site_id(&record)?);
        sites.push(row);
    }
    if skipped > 0 {
        warn!("{}: skipped {} multi-allelic records", path.display(), skipped);
    }

    let mut probs = Array3::zeros((n_donors, sites.len(), N_GENOTYPES));
    for (s, row) in sites.iter().enumerate() {
        for (d, dist) in row.iter().enumerate() {
            for g in 0..N_GENOTYPES {
                probs[[d, s, g]] = dist[g];
            }
        }
    }
    info!(
        "read {:?} genotypes of {} donors at {} sites from {}",
        tag,
        n_donors,
        snp_ids.len(),
        path.display()
    );
    Ok(DonorGenotypes {
        donor_names,
        snp_ids,
        genotypes: DonorGenotype::from_probs(probs)?,
    })
}

/// Restrict counts and donor genotypes to the SNPs both contain, in count order.
pub fn match_snps(counts: &AlleleCounts, donors: &DonorGenotypes) -> Result<(AlleleCounts, DonorGenotype)> {
    let donor_index: std::collections::HashMap<&str, usize> = donors
        .snp_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (match_key(id), i))
        .collect();
    let mut keep_counts = Vec::new();
    let mut keep_donors = Vec::new();
    for (s, id) in counts.snp_ids().iter().enumerate() {
        if let Some(&d) = donor_index.get(match_key(id)) {
            keep_counts.push(s);
            keep_donors.push(d);
        }
    }
    if keep_counts.is_empty() {
        return Err(DemuxError::input_shape(
            "no SNP is shared by the count matrices and the donor genotypes",
        ));
    }
    info!(
        "{} of {} count SNPs and {} donor SNPs are shared",
        keep_counts.len(),
        counts.n_snps(),
        donors.snp_ids.len()
    );
    Ok((counts.select_snps(&keep_counts)?, donors.genotypes.select_snps(&keep_donors)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Write;

    const HEADER: &str = "##fileformat=VCFv4.2\n\
##contig=<ID=chr1,length=1000>\n\
##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n\
##FORMAT=<ID=PL,Number=G,Type=Integer,Description=\"Phred-scaled likelihoods\">\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tdonorA\tdonorB\n";

    fn write_vcf(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".vcf").tempfile().unwrap();
        file.write_all(HEADER.as_bytes()).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    const BODY: &str = "chr1\t10\t.\tA\tG\t.\tPASS\t.\tGT:PL\t0/0:0,30,60\t1/1:60,30,0\n\
chr1\t20\t.\tC\tT\t.\tPASS\t.\tGT:PL\t0|1:30,0,30\t./.:.\n\
chr1\t30\t.\tC\tT,G\t.\tPASS\t.\tGT:PL\t0/1:0,0,0,0,0,0\t0/0:0,0,0,0,0,0\n";

    #[test]
    fn reads_gt_and_skips_multiallelic() {
        let file = write_vcf(BODY);
        let donors = read_donor_genotypes(file.path(), GenotypeTag::GT).unwrap();
        assert_eq!(donors.donor_names, vec!["donorA", "donorB"]);
        assert_eq!(donors.snp_ids, vec!["chr1_10_A_G", "chr1_20_C_T"]);
        let g = &donors.genotypes;
        assert_eq!(g.get(0, 0), [1.0, 0.0, 0.0]);
        assert_eq!(g.get(1, 0), [0.0, 0.0, 1.0]);
        assert_eq!(g.get(0, 1), [0.0, 1.0, 0.0]);
        assert_abs_diff_eq!(g.get(1, 1)[0], 1.0 / 3.0);
    }

    #[test]
    fn reads_pl_as_probabilities() {
        let file = write_vcf(BODY);
        let donors = read_donor_genotypes(file.path(), GenotypeTag::PL).unwrap();
        let dist = donors.genotypes.get(0, 0);
        assert!(dist[0] > 0.99);
        assert_abs_diff_eq!(dist[1] / dist[0], 1e-3, epsilon = 1e-9);
        assert_abs_diff_eq!(donors.genotypes.get(1, 1)[2], 1.0 / 3.0);
        assert_eq!(read_site_ids(file.path()).unwrap().len(), 3);
    }

    #[test]
    fn matching_ignores_chr_prefix() {
        let file = write_vcf(BODY);
        let donors = read_donor_genotypes(file.path(), GenotypeTag::GT).unwrap();
        let counts = AlleleCounts::from_triplets(
            vec!["c0".into()],
            vec!["1_20_C_T".into(), "1_99_A_C".into()],
            vec![(0, 0, 3, 2), (0, 1, 1, 1)],
        )
        .unwrap();
        let (counts, genotypes) = match_snps(&counts, &donors).unwrap();
        assert_eq!(counts.n_snps(), 1);
        assert_eq!(genotypes.n_snps(), 1);
        assert_eq!(genotypes.get(0, 0), [0.0, 1.0, 0.0]);
        assert_eq!("GP".parse::<GenotypeTag>(), Ok(GenotypeTag::GP));
        assert!("AD".parse::<GenotypeTag>().is_err());
    }
}
