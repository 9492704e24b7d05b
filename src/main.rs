use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::info;

use poolsplit::donor_vcf::{self, GenotypeTag};
use poolsplit::simulate::{self, SimulationConfig};
use poolsplit::{mtx, output, report};
use poolsplit::{demultiplex, DemuxConfig, LikelihoodModel, UnassignedPolicy};

#[derive(Debug, Parser)]
#[clap(name = "poolsplit")]
#[clap(about = "Assign pooled single cells to donors from allele read counts.", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Demultiplex cells into donors, doublets and unassigned
    #[clap(arg_required_else_help = true)]
    Demux {
        /// cellSNP output directory (AD/DP matrices, samples, base VCF)
        #[clap(short, long, value_parser, required_unless_present = "ad_file")]
        cell_data: Option<PathBuf>,

        /// AD matrix, used with --dp-file and --barcodes instead of --cell-data
        #[clap(long, value_parser, requires_all = ["dp_file", "barcodes"])]
        ad_file: Option<PathBuf>,

        /// DP matrix
        #[clap(long, value_parser)]
        dp_file: Option<PathBuf>,

        /// cell barcodes, one per line
        #[clap(long, value_parser)]
        barcodes: Option<PathBuf>,

        /// sites VCF naming the SNP rows of --ad-file/--dp-file
        #[clap(long, value_parser)]
        sites: Option<PathBuf>,

        /// donor genotype VCF/BCF
        #[clap(short, long, value_parser)]
        donor_file: Option<PathBuf>,

        /// FORMAT tag to read donor genotypes from: GT, GP or PL
        #[clap(short = 't', long, value_parser, default_value = "GT")]
        geno_tag: GenotypeTag,

        /// number of donors; defaults to the samples in --donor-file
        #[clap(short = 'N', long, value_parser)]
        n_donor: Option<usize>,

        /// output directory
        #[clap(short, long, value_parser, required = true)]
        out_dir: PathBuf,

        /// top-level random seed
        #[clap(long, value_parser, default_value_t = 0)]
        seed: u64,

        /// number of EM restarts
        #[clap(long, value_parser, default_value_t = 10)]
        n_init: usize,

        /// worker threads (default: all cores)
        #[clap(short = 'p', long, value_parser)]
        threads: Option<usize>,

        #[clap(long, value_parser, default_value_t = 200)]
        max_iter: usize,

        #[clap(long, value_parser, default_value_t = 5)]
        min_iter: usize,

        /// relative ELBO change counted as converged
        #[clap(long, value_parser, default_value_t = 1e-6)]
        tolerance: f64,

        /// sequencing error rate
        #[clap(long, value_parser, default_value_t = 0.01)]
        error_rate: f64,

        /// re-estimate the error rate
        #[clap(long, action)]
        learn_error_rate: bool,

        /// learn the alt fraction of each genotype state (absorbs allelic imbalance)
        #[clap(long, action)]
        learn_allele_fractions: bool,

        /// beta-binomial concentration; binomial if unset
        #[clap(long, value_parser)]
        concentration: Option<f64>,

        /// unassigned model: flat, background or disabled
        #[clap(long, value_parser = parse_unassigned, default_value = "flat")]
        unassigned: UnassignedPolicy,

        /// do not model doublets
        #[clap(long, action)]
        no_doublet: bool,

        /// prior doublet rate
        #[clap(long, value_parser, default_value_t = 0.05)]
        doublet_prior: f64,

        /// prior unassigned rate
        #[clap(long, value_parser, default_value_t = 0.01)]
        unassigned_prior: f64,

        /// pseudo-count mass of the rate prior
        #[clap(long, value_parser, default_value_t = 10.0)]
        rate_prior_strength: f64,

        /// Dirichlet pseudo-count per donor
        #[clap(long, value_parser, default_value_t = 1.0)]
        donor_pseudo_count: f64,

        /// treat supplied genotypes as a prior instead of fixed values
        #[clap(long, action)]
        force_learn_gt: bool,

        /// weight of the symmetric prior blended into supplied genotypes
        #[clap(long, value_parser, default_value_t = 0.01)]
        genotype_prior_blend: f64,

        /// extra donors for the over-clustering warm-up
        #[clap(long, value_parser, default_value_t = 0)]
        extra_donor: usize,

        /// iterations of the warm-up stage
        #[clap(long, value_parser, default_value_t = 10)]
        warmup_iter: usize,

        /// minimum probability for a donor or doublet call
        #[clap(long, value_parser, default_value_t = 0.9)]
        min_call_prob: f64,
    },

    /// Simulate a pooled dataset with known labels
    #[clap(arg_required_else_help = true)]
    Simulate {
        /// output directory
        #[clap(short, long, value_parser, required = true)]
        out_dir: PathBuf,

        #[clap(short = 'N', long, value_parser, default_value_t = 4)]
        n_donor: usize,

        #[clap(long, value_parser, default_value_t = 200)]
        n_cells: usize,

        #[clap(long, value_parser, default_value_t = 300)]
        n_snps: usize,

        #[clap(long, value_parser, default_value_t = 0.05)]
        doublet_rate: f64,

        /// fraction of SNPs covered per cell
        #[clap(long, value_parser, default_value_t = 0.3)]
        coverage: f64,

        /// mean reads per covered SNP
        #[clap(long, value_parser, default_value_t = 4.0)]
        mean_depth: f64,

        #[clap(long, value_parser, default_value_t = 0.01)]
        error_rate: f64,

        #[clap(long, value_parser, default_value_t = 0)]
        seed: u64,
    },
}

fn parse_unassigned(s: &str) -> Result<UnassignedPolicy, String> {
    match s.to_ascii_lowercase().as_str() {
        "flat" => Ok(UnassignedPolicy::Flat),
        "background" => Ok(UnassignedPolicy::Background),
        "disabled" | "none" => Ok(UnassignedPolicy::Disabled),
        other => Err(format!("unknown unassigned policy {}", other)),
    }
}

struct CountInputs<'a> {
    cell_data: Option<&'a Path>,
    ad_file: Option<&'a Path>,
    dp_file: Option<&'a Path>,
    barcodes: Option<&'a Path>,
    sites: Option<&'a Path>,
}

fn load_counts(inputs: &CountInputs) -> Result<poolsplit::AlleleCounts, Box<dyn Error>> {
    if let Some(dir) = inputs.cell_data {
        return Ok(mtx::load_cellsnp_dir(dir)?);
    }
    match (inputs.ad_file, inputs.dp_file, inputs.barcodes) {
        (Some(ad), Some(dp), Some(barcodes)) => Ok(mtx::load_counts(ad, dp, barcodes, inputs.sites)?),
        _ => Err("either --cell-data or --ad-file, --dp-file and --barcodes are required".into()),
    }
}

fn start_demux(
    inputs: &CountInputs,
    donor_file: Option<&Path>,
    geno_tag: GenotypeTag,
    out_dir: &Path,
    config: &DemuxConfig,
) -> Result<(), Box<dyn Error>> {
    let counts = load_counts(inputs)?;
    let (counts, supplied, supplied_names) = match donor_file {
        Some(path) => {
            let donors = donor_vcf::read_donor_genotypes(path, geno_tag)?;
            let (counts, genotypes) = donor_vcf::match_snps(&counts, &donors)?;
            (counts, Some(genotypes), donors.donor_names)
        }
        None => (counts, None, Vec::new()),
    };

    let result = demultiplex(&counts, supplied.as_ref(), config)?;
    let names = report::donor_names(&supplied_names, result.hypotheses.n_donors());
    output::write_results(out_dir, &result, &counts, &names, config)?;
    info!(
        "{:?} at restart {} with ELBO {:.4}, doublet rate {:.4}",
        result.status, result.best_restart, result.elbo, result.mixing.doublet_rate
    );
    Ok(())
}

fn start_simulate(out_dir: &Path, config: &SimulationConfig) -> Result<(), Box<dyn Error>> {
    config.validate()?;
    let sim = simulate::simulate_pool(config)?;
    simulate::write_simulation(out_dir, &sim)?;
    info!(
        "simulated {} cells x {} SNPs ({} covered entries) into {}",
        sim.counts.n_cells(),
        sim.counts.n_snps(),
        sim.counts.n_entries(),
        out_dir.display()
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Cli::parse();
    match args.command {
        Commands::Demux {
            cell_data,
            ad_file,
            dp_file,
            barcodes,
            sites,
            donor_file,
            geno_tag,
            n_donor,
            out_dir,
            seed,
            n_init,
            threads,
            max_iter,
            min_iter,
            tolerance,
            error_rate,
            learn_error_rate,
            learn_allele_fractions,
            concentration,
            unassigned,
            no_doublet,
            doublet_prior,
            unassigned_prior,
            rate_prior_strength,
            donor_pseudo_count,
            force_learn_gt,
            genotype_prior_blend,
            extra_donor,
            warmup_iter,
            min_call_prob,
        } => {
            let config = DemuxConfig {
                n_donors: n_donor,
                seed,
                n_restarts: n_init,
                threads,
                max_iter,
                min_iter,
                tolerance,
                error_rate,
                learn_error_rate,
                learn_allele_fractions,
                likelihood: concentration.map_or(LikelihoodModel::Binomial, |c| LikelihoodModel::BetaBinomial {
                    concentration: c,
                }),
                unassigned,
                detect_doublets: !no_doublet,
                doublet_prior,
                unassigned_prior,
                rate_prior_strength,
                donor_pseudo_count,
                learn_known_genotypes: force_learn_gt,
                genotype_prior_blend,
                extra_donors: extra_donor,
                warmup_iter,
                min_call_prob,
            };
            let inputs = CountInputs {
                cell_data: cell_data.as_deref(),
                ad_file: ad_file.as_deref(),
                dp_file: dp_file.as_deref(),
                barcodes: barcodes.as_deref(),
                sites: sites.as_deref(),
            };
            start_demux(&inputs, donor_file.as_deref(), geno_tag, &out_dir, &config)?;
        }

        Commands::Simulate {
            out_dir,
            n_donor,
            n_cells,
            n_snps,
            doublet_rate,
            coverage,
            mean_depth,
            error_rate,
            seed,
        } => {
            let config = SimulationConfig {
                n_donors: n_donor,
                n_cells,
                n_snps,
                doublet_rate,
                coverage,
                mean_depth,
                error_rate,
                seed,
                ..SimulationConfig::default()
            };
            start_simulate(&out_dir, &config)?;
        }
    }
    Ok(())
}
