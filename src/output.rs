//! Result tables written to the output directory.

use std::io::{self, Write};
use std::path::Path;

use log::info;
use serde::Serialize;

use crate::config::DemuxConfig;
use crate::counts::{AlleleCounts, DataDiagnostics};
use crate::em::RunStatus;
use crate::hypothesis::Hypothesis;
use crate::mtx::{writer, OutputFile};
use crate::report::{self, CellAssignment};
use crate::restart::{DemuxResult, RestartSummary};
use crate::error::Result;

pub const DONOR_IDS: &str = "donor_ids.tsv";
pub const SUMMARY: &str = "summary.tsv";
pub const PROB_SINGLET: &str = "prob_singlet.tsv.gz";
pub const PROB_DOUBLET: &str = "prob_doublet.tsv.gz";
pub const DONOR_GENOTYPES: &str = "donor_genotypes.tsv.gz";
pub const DIAGNOSTICS: &str = "diagnostics.json";

const GENOTYPE_LABELS: [&str; 3] = ["0/0", "0/1", "1/1"];

fn tsv(path: &Path) -> Result<csv::Writer<OutputFile>> {
    Ok(csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer(path)?))
}

/// Flush a table and finish its file, gzip trailer included.
fn close(wtr: csv::Writer<OutputFile>) -> Result<()> {
    let out = wtr
        .into_inner()
        .map_err(|e| io::Error::new(e.error().kind(), e.to_string()))?;
    out.finish()
}

fn fmt_prob(p: f64) -> String {
    format!("{:.4e}", p)
}

#[derive(Serialize)]
struct Diagnostics<'a> {
    elbo: f64,
    status: RunStatus,
    iterations: usize,
    best_restart: usize,
    elbo_trace: &'a [f64],
    core_elbo_trace: &'a [f64],
    restarts: &'a [RestartSummary],
    hypotheses: Vec<String>,
    donor_proportions: Vec<(String, f64)>,
    doublet_rate: f64,
    unassigned_rate: f64,
    error_rate: f64,
    allele_fractions: [f64; 3],
    data: &'a DataDiagnostics,
    config: &'a DemuxConfig,
}

/// Write every result table into `dir`.
pub fn write_results(
    dir: &Path,
    result: &DemuxResult,
    counts: &AlleleCounts,
    donor_names: &[String],
    config: &DemuxConfig,
) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let calls = report::assign_cells(result, counts, config.min_call_prob);
    write_donor_ids(&dir.join(DONOR_IDS), &calls, donor_names)?;
    write_summary(&dir.join(SUMMARY), &calls, donor_names)?;
    write_probabilities(&dir.join(PROB_SINGLET), &dir.join(PROB_DOUBLET), result, donor_names)?;
    write_genotypes(&dir.join(DONOR_GENOTYPES), result, counts, donor_names)?;
    write_diagnostics(&dir.join(DIAGNOSTICS), result, donor_names, config)?;
    info!("results written to {}", dir.display());
    Ok(())
}

pub fn write_donor_ids(path: &Path, calls: &[CellAssignment], donor_names: &[String]) -> Result<()> {
    let mut wtr = tsv(path)?;
    wtr.write_record([
        "cell",
        "donor_id",
        "prob_max",
        "prob_doublet",
        "n_vars",
        "best_singlet",
        "best_doublet",
        "doublet_logLikRatio",
        "best_hypothesis",
        "second_hypothesis",
        "margin",
    ])?;
    for c in calls {
        let best_doublet = c
            .best_doublet
            .map_or("NA".to_string(), |(i, j)| report::hypothesis_label(Hypothesis::Doublet(i, j), donor_names));
        let ratio = c.doublet_log_lik_ratio.map_or("NA".to_string(), |r| format!("{:.3}", r));
        let second = c
            .second
            .map_or("NA".to_string(), |h| report::hypothesis_label(h, donor_names));
        wtr.write_record([
            c.cell_id.clone(),
            report::call_label(c.call, donor_names),
            fmt_prob(c.best_singlet_prob),
            fmt_prob(c.doublet_prob),
            c.n_covered.to_string(),
            donor_names[c.best_singlet].clone(),
            best_doublet,
            ratio,
            report::hypothesis_label(c.best, donor_names),
            second,
            fmt_prob(c.margin),
        ])?;
    }
    close(wtr)
}

pub fn write_summary(path: &Path, calls: &[CellAssignment], donor_names: &[String]) -> Result<()> {
    let mut wtr = tsv(path)?;
    wtr.write_record(["Var1", "Freq"])?;
    for (call, n) in report::call_counts(calls, donor_names.len()) {
        wtr.write_record([report::call_label(call, donor_names), n.to_string()])?;
    }
    close(wtr)
}

pub fn write_probabilities(
    singlet_path: &Path,
    doublet_path: &Path,
    result: &DemuxResult,
    donor_names: &[String],
) -> Result<()> {
    let hypotheses = &result.hypotheses;
    let mut singlet = tsv(singlet_path)?;
    let mut header = vec!["cell".to_string()];
    header.extend(donor_names.iter().cloned());
    singlet.write_record(&header)?;

    let mut doublet = tsv(doublet_path)?;
    let mut header = vec!["cell".to_string()];
    header.extend(
        hypotheses
            .doublet_columns()
            .map(|h| report::hypothesis_label(hypotheses.get(h), donor_names)),
    );
    doublet.write_record(&header)?;

    for (cell, id) in result.cell_ids.iter().enumerate() {
        let row = result.posterior.row(cell);
        let mut record = vec![id.clone()];
        record.extend((0..hypotheses.n_donors()).map(|d| fmt_prob(row[hypotheses.singlet_index(d)])));
        singlet.write_record(&record)?;

        let mut record = vec![id.clone()];
        record.extend(hypotheses.doublet_columns().map(|h| fmt_prob(row[h])));
        doublet.write_record(&record)?;
    }
    close(singlet)?;
    close(doublet)
}

pub fn write_genotypes(path: &Path, result: &DemuxResult, counts: &AlleleCounts, donor_names: &[String]) -> Result<()> {
    let (alt, depth) = report::weighted_reads(result, counts);
    let genotypes = &result.genotypes;
    let mut wtr = tsv(path)?;
    wtr.write_record([
        "snp",
        "donor",
        "GT",
        "p_0/0",
        "p_0/1",
        "p_1/1",
        "dosage",
        "alt_reads",
        "total_reads",
    ])?;
    for snp in 0..genotypes.n_snps() {
        for (d, name) in donor_names.iter().enumerate() {
            let dist = genotypes.get(d, snp);
            wtr.write_record([
                result.snp_ids[snp].clone(),
                name.clone(),
                GENOTYPE_LABELS[genotypes.argmax(d, snp)].to_string(),
                fmt_prob(dist[0]),
                fmt_prob(dist[1]),
                fmt_prob(dist[2]),
                format!("{:.3}", genotypes.dosage(d, snp)),
                format!("{:.2}", alt[[d, snp]]),
                format!("{:.2}", depth[[d, snp]]),
            ])?;
        }
    }
    close(wtr)
}

pub fn write_diagnostics(path: &Path, result: &DemuxResult, donor_names: &[String], config: &DemuxConfig) -> Result<()> {
    let diagnostics = Diagnostics {
        elbo: result.elbo,
        status: result.status,
        iterations: result.iterations,
        best_restart: result.best_restart,
        elbo_trace: &result.elbo_trace,
        core_elbo_trace: &result.core_trace,
        restarts: &result.restarts,
        hypotheses: result
            .hypotheses
            .iter()
            .map(|h| report::hypothesis_label(h, donor_names))
            .collect(),
        donor_proportions: donor_names
            .iter()
            .cloned()
            .zip(result.mixing.donors.iter().copied())
            .collect(),
        doublet_rate: result.mixing.doublet_rate,
        unassigned_rate: result.mixing.unassigned_rate,
        error_rate: result.fractions.error_rate(),
        allele_fractions: result.fractions.theta,
        data: &result.diagnostics,
        config,
    };
    let mut out = writer(path)?;
    serde_json::to_writer_pretty(&mut out, &diagnostics)?;
    writeln!(out)?;
    out.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DemuxConfig;
    use crate::restart::demultiplex;
    use crate::simulate::{simulate_pool, SimulationConfig};
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn writes_all_tables() {
        let sim = simulate_pool(&SimulationConfig {
            n_donors: 2,
            n_cells: 20,
            n_snps: 40,
            seed: 5,
            ..SimulationConfig::default()
        })
        .unwrap();
        let config = DemuxConfig {
            n_restarts: 2,
            max_iter: 20,
            ..DemuxConfig::with_donors(2)
        };
        let result = demultiplex(&sim.counts, None, &config).unwrap();
        let names = report::donor_names(&[], 2);
        let dir = tempfile::tempdir().unwrap();
        write_results(dir.path(), &result, &sim.counts, &names, &config).unwrap();

        let ids = std::fs::read_to_string(dir.path().join(DONOR_IDS)).unwrap();
        assert_eq!(ids.lines().count(), 21);
        assert!(ids.starts_with("cell\tdonor_id\tprob_max"));

        let summary = std::fs::read_to_string(dir.path().join(SUMMARY)).unwrap();
        let total: usize = summary
            .lines()
            .skip(1)
            .map(|l| l.split('\t').nth(1).unwrap().parse::<usize>().unwrap())
            .sum();
        assert_eq!(total, 20);

        let mut text = String::new();
        GzDecoder::new(std::fs::File::open(dir.path().join(PROB_DOUBLET)).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text.lines().next().unwrap(), "cell\tdonor0,donor1");

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(DIAGNOSTICS)).unwrap()).unwrap();
        assert_eq!(json["restarts"].as_array().unwrap().len(), 2);
        assert!(json["elbo"].as_f64().unwrap().is_finite());
    }
}
