#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::error::Error;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

use trd_cea::ceac::{CeacMethod, compute_ceac, compute_frontier};
use trd_cea::data::inputs::{AnalysisInputs, load_analysis_inputs};
use trd_cea::export::{GridSummary, Headline, OutputWriter, RunManifest};
use trd_cea::grid::{Jurisdiction, build_grid};
use trd_cea::incremental::{efficiency_frontier, incremental_summary};
use trd_cea::nmb::{NmbAnalysis, TieBreak, compute_nmb};
use trd_cea::progress::{AnalysisProgressObserver, AnalysisStage};
use trd_cea::vbp::{price_probability_curve, threshold_price_curve, vbp_curves};
use trd_cea::voi::evpi::{EvpiPoint, compute_evpi, population_scale};
use trd_cea::voi::evppi::{
    EvppiMethod, ParameterGroup, ParameterTable, VarianceShare, default_variance_shares,
    legacy_evppi, regression_evppi, ungrouped_parameters,
};
use trd_cea::voi::evsi::{
    EnbsAnalysis, EvsiConfig, optimal_sample_size, raw_estimates, resample_evsi, smooth_evsi,
    smoothing_grid,
};

type CliResult<T> = Result<T, Box<dyn Error>>;

/// Argument combinations clap cannot reject on its own.
#[derive(thiserror::Error, Debug, PartialEq)]
enum CliError {
    #[error("--lambda-min, --lambda-max and --lambda-step must be given together")]
    PartialLambdaGrid,
    #[error("--sample-sizes is required")]
    MissingSampleSizes,
    #[error("--group requires --parameters")]
    GroupsWithoutParameters,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum JurisdictionCli {
    Au,
    Nz,
}

impl From<JurisdictionCli> for Jurisdiction {
    fn from(value: JurisdictionCli) -> Self {
        match value {
            JurisdictionCli::Au => Jurisdiction::Au,
            JurisdictionCli::Nz => Jurisdiction::Nz,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum TieBreakCli {
    Legacy,
    Declared,
}

impl From<TieBreakCli> for TieBreak {
    fn from(value: TieBreakCli) -> Self {
        match value {
            TieBreakCli::Legacy => TieBreak::Legacy,
            TieBreakCli::Declared => TieBreak::Declared,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum CeacMethodCli {
    VersusBase,
    Optimal,
    Legacy,
}

#[derive(Args)]
pub struct InputArgs {
    /// Long-format PSA draws with draw,strategy,cost,effect[,perspective] columns (.csv or .tsv)
    #[arg(long, value_name = "PATH")]
    pub psa: PathBuf,

    /// Strategy configuration (base, perspectives, strategies, prices, labels)
    #[arg(long = "strategies-yaml", value_name = "PATH")]
    pub strategies_yaml: PathBuf,

    /// Cost perspective; matched ignoring case, underscores and hyphens
    #[arg(long, default_value = "health_system")]
    pub perspective: String,

    /// Strategy that wins ties and whose list price drives the price analyses
    #[arg(long, value_name = "STRATEGY")]
    pub focal: Option<String>,

    #[arg(long, value_enum, default_value_t = TieBreakCli::Declared)]
    pub tie_break: TieBreakCli,

    /// Directory for output tables (created if missing)
    #[arg(long, default_value = "results")]
    pub outdir: PathBuf,
}

#[derive(Args)]
pub struct LambdaArgs {
    /// Single willingness-to-pay value
    #[arg(long, conflicts_with_all = ["lambda_min", "lambda_max", "lambda_step"])]
    pub lambda: Option<f64>,

    #[arg(long, value_name = "WTP")]
    pub lambda_min: Option<f64>,

    #[arg(long, value_name = "WTP")]
    pub lambda_max: Option<f64>,

    #[arg(long, value_name = "WTP")]
    pub lambda_step: Option<f64>,

    /// Selects the default willingness-to-pay grid and names output files
    #[arg(long, value_enum, default_value_t = JurisdictionCli::Au)]
    pub jurisdiction: JurisdictionCli,
}

impl LambdaArgs {
    fn grid(&self) -> CliResult<Vec<f64>> {
        match (self.lambda_min, self.lambda_max, self.lambda_step) {
            (Some(min), Some(max), Some(step)) => Ok(build_grid(min, max, step, true)?),
            (None, None, None) => Ok(match self.lambda {
                Some(lambda) => vec![lambda],
                None => Jurisdiction::from(self.jurisdiction).default_lambda_grid(),
            }),
            _ => Err(CliError::PartialLambdaGrid.into()),
        }
    }
}

#[derive(Args)]
pub struct PriceArgs {
    #[arg(long, default_value = "0")]
    pub price_min: f64,

    #[arg(long, default_value = "10000")]
    pub price_max: f64,

    #[arg(long, default_value = "100")]
    pub price_step: f64,
}

impl PriceArgs {
    fn grid(&self) -> CliResult<Vec<f64>> {
        Ok(build_grid(self.price_min, self.price_max, self.price_step, true)?)
    }
}

#[derive(Args)]
pub struct PopulationArgs {
    /// Annual number of patients who would receive the decision
    #[arg(long, default_value = "1")]
    pub population: f64,

    /// Years over which the decision applies
    #[arg(long, default_value = "1")]
    pub horizon: f64,
}

#[derive(Args)]
pub struct CeacArgs {
    #[arg(long, value_enum, default_value_t = CeacMethodCli::VersusBase)]
    pub ceac_method: CeacMethodCli,

    /// Reference willingness-to-pay for the legacy constant-probability curve (and for EVSI in `run`)
    #[arg(long, default_value = "50000")]
    pub reference_lambda: f64,
}

#[derive(Args)]
pub struct VoiArgs {
    #[command(flatten)]
    pub population: PopulationArgs,

    /// Sampled parameter values (draw column plus one column per parameter)
    #[arg(long, value_name = "PATH")]
    pub parameters: Option<PathBuf>,

    /// Parameter group for regression EVPPI, as NAME=param_a,param_b (repeatable)
    #[arg(long = "group", value_name = "NAME=PARAMS")]
    pub groups: Vec<ParameterGroup>,

    /// Variance share for the legacy EVPPI heuristic, as NAME=proportion (repeatable)
    #[arg(long = "share", value_name = "NAME=PROPORTION", value_parser = parse_share)]
    pub shares: Vec<VarianceShare>,
}

#[derive(Args)]
pub struct EvsiArgs {
    /// Candidate trial sample sizes, comma separated
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub sample_sizes: Vec<usize>,

    #[arg(long, default_value = "100")]
    pub simulations: usize,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Willingness-to-pay at which EVSI is evaluated
    #[arg(long, default_value = "50000")]
    pub wtp: f64,

    #[arg(long, default_value = "0")]
    pub cost_per_patient: f64,

    #[command(flatten)]
    pub population: PopulationArgs,

    /// Smooth the EVSI curve with a Gaussian process before choosing the sample size
    #[arg(long)]
    pub smooth: bool,

    /// Number of integer sample sizes the smoothed curve is evaluated on
    #[arg(long, default_value = "100")]
    pub smooth_points: usize,
}

#[derive(Parser)]
#[command(
    name = "trd-cea",
    about = "Cost-effectiveness, acceptability and value-of-information analyses of PSA draws",
    long_about = "Reads probabilistic sensitivity analysis draws for a set of treatment \
                  strategies and writes net monetary benefit, ICER, acceptability, \
                  value-based pricing and value-of-information tables."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Net monetary benefit per willingness-to-pay
    #[command(about = "Expected NMB and optimal-strategy shares (outputs: nmb_expected.csv, optimal_share.csv)")]
    Nmb {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        lambdas: LambdaArgs,
    },

    /// Incremental cost-effectiveness ratios and the efficiency frontier
    #[command(about = "ICERs and dominance (outputs: incremental.csv)")]
    Icer {
        #[command(flatten)]
        input: InputArgs,
    },

    /// Acceptability curves and frontier
    #[command(about = "CEAC and CEAF (outputs: ceac_*.csv, ceaf_*.csv)")]
    Ceac {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        lambdas: LambdaArgs,
        #[command(flatten)]
        ceac: CeacArgs,
    },

    /// Value-based pricing
    #[command(about = "Threshold prices (outputs: vbp_curves.csv, threshold_prices.csv, price_probability.csv)")]
    Vbp {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        lambdas: LambdaArgs,
        #[command(flatten)]
        prices: PriceArgs,
    },

    /// Expected value of perfect (and partial perfect) information
    #[command(about = "EVPI and EVPPI (outputs: evpi_*.csv, evppi_*.csv)")]
    Voi {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        lambdas: LambdaArgs,
        #[command(flatten)]
        voi: VoiArgs,
    },

    /// Expected value of sample information and optimal trial size
    #[command(about = "EVSI and ENBS (outputs: evsi.csv, enbs.csv)")]
    Evsi {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        evsi: EvsiArgs,
    },

    /// Every analysis in one pass, plus summary.toml
    #[command(about = "Run all analyses (outputs: every table and summary.toml)")]
    Run {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        lambdas: LambdaArgs,
        #[command(flatten)]
        ceac: CeacArgs,
        #[command(flatten)]
        prices: PriceArgs,
        #[command(flatten)]
        voi: VoiArgs,
        /// Candidate trial sample sizes; EVSI is skipped when omitted
        #[arg(long, value_delimiter = ',', num_args = 1..)]
        sample_sizes: Vec<usize>,
        #[arg(long, default_value = "100")]
        simulations: usize,
        #[arg(long, default_value = "42")]
        seed: u64,
        #[arg(long, default_value = "0")]
        cost_per_patient: f64,
    },

    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Nmb { input, lambdas }) => run_nmb(&input, &lambdas),
        Some(Commands::Icer { input }) => run_icer(&input),
        Some(Commands::Ceac {
            input,
            lambdas,
            ceac,
        }) => run_ceac(&input, &lambdas, &ceac),
        Some(Commands::Vbp {
            input,
            lambdas,
            prices,
        }) => run_vbp(&input, &lambdas, &prices),
        Some(Commands::Voi {
            input,
            lambdas,
            voi,
        }) => run_voi(&input, &lambdas, &voi),
        Some(Commands::Evsi { input, evsi }) => run_evsi(&input, &evsi),
        Some(Commands::Run {
            input,
            lambdas,
            ceac,
            prices,
            voi,
            sample_sizes,
            simulations,
            seed,
            cost_per_patient,
        }) => run_all(RunArgs {
            input: &input,
            lambdas: &lambdas,
            ceac: &ceac,
            prices: &prices,
            voi: &voi,
            sample_sizes,
            simulations,
            seed,
            cost_per_patient,
        }),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn parse_share(text: &str) -> Result<VarianceShare, String> {
    let (group, value) = text
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=proportion, found '{text}'"))?;
    let proportion: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("'{value}' is not a number"))?;
    Ok(VarianceShare {
        group: group.trim().to_string(),
        proportion,
    })
}

fn load(input: &InputArgs, lambdas: Option<&LambdaArgs>) -> CliResult<AnalysisInputs> {
    println!("Loading PSA draws from: {}", input.psa.display());
    let grid = lambdas.map(LambdaArgs::grid).transpose()?;
    let inputs = load_analysis_inputs(
        &input.psa,
        &input.strategies_yaml,
        &input.perspective,
        input.focal.as_deref(),
        grid,
    )?;
    println!(
        "Perspective '{}': {} draws, strategies [{}], base '{}'",
        inputs.perspective,
        inputs.table.n_draws(),
        inputs.table.strategies().join(", "),
        inputs.base()
    );
    Ok(inputs)
}

fn print_written(paths: &[PathBuf]) {
    for path in paths {
        println!("Wrote {}", path.display());
    }
}

fn file_names(paths: &[PathBuf]) -> Vec<String> {
    paths
        .iter()
        .filter_map(|p| p.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .collect()
}

fn nmb_tables(
    inputs: &AnalysisInputs,
    writer: &OutputWriter<'_>,
    policy: TieBreak,
) -> CliResult<(NmbAnalysis, Vec<PathBuf>)> {
    let analysis = compute_nmb(&inputs.table, &inputs.lambdas, inputs.focal.as_deref(), policy)?;
    let last = inputs.lambdas.len() - 1;
    let best = &analysis.strategies()[analysis.expected_best(last)];
    println!(
        "Highest expected NMB at lambda = {}: {}",
        inputs.lambdas[last],
        inputs.label(best)
    );
    let written = writer.write_nmb(&analysis)?;
    Ok((analysis, written))
}

fn icer_table(inputs: &AnalysisInputs, writer: &OutputWriter<'_>) -> CliResult<PathBuf> {
    let summary = incremental_summary(&inputs.table, inputs.base())?;
    let frontier = efficiency_frontier(&inputs.table);
    for row in summary.iter().filter(|row| row.strategy != inputs.base()) {
        println!(
            "{}: delta cost {:.2}, delta effect {:.4}, ICER {:.2}",
            inputs.label(&row.strategy),
            row.delta_cost,
            row.delta_effect,
            row.icer
        );
    }
    Ok(writer.write_incremental(&summary, &frontier)?)
}

fn ceac_tables(
    inputs: &AnalysisInputs,
    writer: &OutputWriter<'_>,
    jurisdiction: Jurisdiction,
    args: &CeacArgs,
    policy: TieBreak,
) -> CliResult<Vec<PathBuf>> {
    let method = match args.ceac_method {
        CeacMethodCli::VersusBase => CeacMethod::VersusBase,
        CeacMethodCli::Optimal => CeacMethod::Optimal,
        CeacMethodCli::Legacy => CeacMethod::LegacyConstant {
            reference_lambda: args.reference_lambda,
        },
    };
    let curves = compute_ceac(
        &inputs.table,
        &inputs.lambdas,
        inputs.base(),
        method,
        inputs.focal.as_deref(),
        policy,
    )?;
    let frontier = compute_frontier(&inputs.table, &inputs.lambdas, inputs.table.strategies())?;
    Ok(vec![
        writer.write_ceac(jurisdiction, &inputs.perspective, &curves)?,
        writer.write_ceaf(jurisdiction, &inputs.perspective, &frontier)?,
    ])
}

fn vbp_tables(
    inputs: &AnalysisInputs,
    writer: &OutputWriter<'_>,
    prices: &PriceArgs,
    policy: TieBreak,
) -> CliResult<Vec<PathBuf>> {
    let curves = vbp_curves(&inputs.table, inputs.base(), &inputs.lambdas, &inputs.config.prices)?;
    let mut written = vec![writer.write_vbp_curves(&curves)?];
    if inputs.table.adjustment().is_none() {
        println!("No priced focal strategy given; skipping threshold and price-probability curves.");
        return Ok(written);
    }
    let mut progress = BarProgress::default();
    let thresholds = threshold_price_curve(
        &inputs.table,
        &inputs.lambdas,
        (prices.price_min, prices.price_max),
        &mut progress,
    )?;
    written.push(writer.write_threshold_prices(&thresholds)?);
    let price_grid = prices.grid()?;
    let probabilities =
        price_probability_curve(&inputs.table, &inputs.lambdas, &price_grid, policy)?;
    written.push(writer.write_price_probability(&probabilities)?);
    Ok(written)
}

fn voi_tables(
    inputs: &AnalysisInputs,
    writer: &OutputWriter<'_>,
    jurisdiction: Jurisdiction,
    args: &VoiArgs,
) -> CliResult<(Vec<EvpiPoint>, Vec<PathBuf>)> {
    if args.parameters.is_none() && !args.groups.is_empty() {
        return Err(CliError::GroupsWithoutParameters.into());
    }
    let scale = population_scale(args.population.population, args.population.horizon)?;
    let evpi = compute_evpi(&inputs.table, &inputs.lambdas, scale)?;
    let mut written = vec![writer.write_evpi(jurisdiction, &inputs.perspective, &evpi)?];

    match inputs.focal.as_deref() {
        Some(focal) => {
            let shares = if args.shares.is_empty() {
                default_variance_shares()
            } else {
                args.shares.clone()
            };
            let points = legacy_evppi(&inputs.table, &inputs.lambdas, inputs.base(), focal, &shares)?;
            written.push(writer.write_evppi(EvppiMethod::Legacy, &points)?);
        }
        None => println!("No focal strategy given; skipping the legacy EVPPI heuristic."),
    }

    if let Some(path) = &args.parameters {
        let parameters = ParameterTable::read(path)?;
        let ungrouped = ungrouped_parameters(&parameters, &args.groups);
        if !ungrouped.is_empty() {
            log::warn!(
                "Parameters not assigned to any --group are ignored: {}",
                ungrouped.join(", ")
            );
        }
        let points = regression_evppi(&inputs.table, &inputs.lambdas, &parameters, &args.groups)?;
        written.push(writer.write_evppi(EvppiMethod::Regression, &points)?);
    }
    Ok((evpi, written))
}

struct EvsiRequest<'a> {
    sample_sizes: &'a [usize],
    simulations: usize,
    seed: u64,
    wtp: f64,
    cost_per_patient: f64,
    population: &'a PopulationArgs,
    smooth_points: Option<usize>,
}

fn evsi_tables(
    inputs: &AnalysisInputs,
    writer: &OutputWriter<'_>,
    request: &EvsiRequest<'_>,
) -> CliResult<(EnbsAnalysis, Vec<PathBuf>)> {
    let config = EvsiConfig {
        sample_sizes: request.sample_sizes.to_vec(),
        simulations: request.simulations,
        seed: request.seed,
        lambda: request.wtp,
    };
    let mut progress = BarProgress::default();
    let summaries = resample_evsi(&inputs.table, &config, &mut progress)?;
    let curve = match request.smooth_points {
        Some(points) => smooth_evsi(
            &summaries,
            request.simulations,
            &smoothing_grid(&summaries, points),
        )?,
        None => raw_estimates(&summaries),
    };
    let scale = population_scale(request.population.population, request.population.horizon)?;
    let enbs = optimal_sample_size(&curve, scale, request.cost_per_patient)?;
    println!(
        "Optimal trial size: {} (ENBS {:.2})",
        enbs.optimal_sample_size, enbs.optimal_enbs
    );
    let written = vec![writer.write_evsi(&summaries)?, writer.write_enbs(&enbs)?];
    Ok((enbs, written))
}

fn run_nmb(input: &InputArgs, lambdas: &LambdaArgs) -> CliResult<()> {
    let inputs = load(input, Some(lambdas))?;
    let writer = OutputWriter::new(&input.outdir, &inputs.config)?;
    let (_, written) = nmb_tables(&inputs, &writer, input.tie_break.into())?;
    print_written(&written);
    Ok(())
}

fn run_icer(input: &InputArgs) -> CliResult<()> {
    let inputs = load(input, None)?;
    let writer = OutputWriter::new(&input.outdir, &inputs.config)?;
    print_written(&[icer_table(&inputs, &writer)?]);
    Ok(())
}

fn run_ceac(input: &InputArgs, lambdas: &LambdaArgs, ceac: &CeacArgs) -> CliResult<()> {
    let inputs = load(input, Some(lambdas))?;
    let writer = OutputWriter::new(&input.outdir, &inputs.config)?;
    let written = ceac_tables(
        &inputs,
        &writer,
        lambdas.jurisdiction.into(),
        ceac,
        input.tie_break.into(),
    )?;
    print_written(&written);
    Ok(())
}

fn run_vbp(input: &InputArgs, lambdas: &LambdaArgs, prices: &PriceArgs) -> CliResult<()> {
    let inputs = load(input, Some(lambdas))?;
    let writer = OutputWriter::new(&input.outdir, &inputs.config)?;
    print_written(&vbp_tables(&inputs, &writer, prices, input.tie_break.into())?);
    Ok(())
}

fn run_voi(input: &InputArgs, lambdas: &LambdaArgs, voi: &VoiArgs) -> CliResult<()> {
    let inputs = load(input, Some(lambdas))?;
    let writer = OutputWriter::new(&input.outdir, &inputs.config)?;
    let (_, written) = voi_tables(&inputs, &writer, lambdas.jurisdiction.into(), voi)?;
    print_written(&written);
    Ok(())
}

fn run_evsi(input: &InputArgs, evsi: &EvsiArgs) -> CliResult<()> {
    if evsi.sample_sizes.is_empty() {
        return Err(CliError::MissingSampleSizes.into());
    }
    let inputs = load(input, None)?;
    let writer = OutputWriter::new(&input.outdir, &inputs.config)?;
    let request = EvsiRequest {
        sample_sizes: &evsi.sample_sizes,
        simulations: evsi.simulations,
        seed: evsi.seed,
        wtp: evsi.wtp,
        cost_per_patient: evsi.cost_per_patient,
        population: &evsi.population,
        smooth_points: evsi.smooth.then_some(evsi.smooth_points),
    };
    let (_, written) = evsi_tables(&inputs, &writer, &request)?;
    print_written(&written);
    Ok(())
}

struct RunArgs<'a> {
    input: &'a InputArgs,
    lambdas: &'a LambdaArgs,
    ceac: &'a CeacArgs,
    prices: &'a PriceArgs,
    voi: &'a VoiArgs,
    sample_sizes: Vec<usize>,
    simulations: usize,
    seed: u64,
    cost_per_patient: f64,
}

fn run_all(args: RunArgs<'_>) -> CliResult<()> {
    let inputs = load(args.input, Some(args.lambdas))?;
    let writer = OutputWriter::new(&args.input.outdir, &inputs.config)?;
    let jurisdiction: Jurisdiction = args.lambdas.jurisdiction.into();
    let policy: TieBreak = args.input.tie_break.into();

    let mut written = Vec::new();
    let (analysis, paths) = nmb_tables(&inputs, &writer, policy)?;
    written.extend(paths);
    written.push(icer_table(&inputs, &writer)?);
    written.extend(ceac_tables(&inputs, &writer, jurisdiction, args.ceac, policy)?);
    written.extend(vbp_tables(&inputs, &writer, args.prices, policy)?);
    let (evpi, paths) = voi_tables(&inputs, &writer, jurisdiction, args.voi)?;
    written.extend(paths);

    let mut optimal_sample_size = None;
    if args.sample_sizes.is_empty() {
        println!("No --sample-sizes given; skipping EVSI.");
    } else {
        let request = EvsiRequest {
            sample_sizes: &args.sample_sizes,
            simulations: args.simulations,
            seed: args.seed,
            wtp: args.ceac.reference_lambda,
            cost_per_patient: args.cost_per_patient,
            population: &args.voi.population,
            smooth_points: None,
        };
        let (enbs, paths) = evsi_tables(&inputs, &writer, &request)?;
        optimal_sample_size = Some(enbs.optimal_sample_size);
        written.extend(paths);
    }

    let last = inputs.lambdas.len() - 1;
    let (peak_evpi_wtp, peak_evpi) = evpi
        .iter()
        .map(|p| (p.wtp, p.evpi))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap_or((f64::NAN, f64::NAN));
    let manifest = RunManifest {
        version: env!("CARGO_PKG_VERSION").to_string(),
        perspective: inputs.perspective.clone(),
        jurisdiction,
        base: inputs.base().to_string(),
        focal: inputs.focal.clone(),
        tie_break: policy,
        seed: (!args.sample_sizes.is_empty()).then_some(args.seed),
        strategies: inputs.table.strategies().to_vec(),
        outputs: file_names(&written),
        lambda_grid: GridSummary::from_lambdas(&inputs.lambdas),
        headline: Headline {
            optimal_at_max_lambda: analysis.strategies()[analysis.expected_best(last)].clone(),
            peak_evpi,
            peak_evpi_wtp,
            optimal_sample_size,
        },
    };
    written.push(writer.write_manifest(&manifest)?);
    print_written(&written);
    println!("All outputs are in {}", display_dir(writer.dir()));
    Ok(())
}

fn display_dir(dir: &Path) -> String {
    dir.canonicalize()
        .unwrap_or_else(|_| dir.to_path_buf())
        .display()
        .to_string()
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) =
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
    {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

/// Draws one progress bar per analysis stage on stderr.
#[derive(Default)]
struct BarProgress {
    bar: Option<ProgressBar>,
}

impl AnalysisProgressObserver for BarProgress {
    fn on_stage_start(&mut self, stage: AnalysisStage, total_steps: usize) {
        self.bar = Some(create_progress_bar(total_steps as u64, stage.describe()));
    }

    fn on_stage_advance(&mut self, _stage: AnalysisStage, completed_steps: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(completed_steps as u64);
        }
    }

    fn on_stage_finish(&mut self, stage: AnalysisStage) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!("{stage} complete"));
        }
    }
}

/// Format seconds into a human-readable duration like "2.4 hours ago"
fn format_duration_ago(seconds: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;

    if seconds < MINUTE {
        format!("{seconds} seconds ago")
    } else if seconds < HOUR {
        format!("{:.1} minutes ago", seconds as f64 / MINUTE as f64)
    } else if seconds < DAY {
        format!("{:.1} hours ago", seconds as f64 / HOUR as f64)
    } else {
        format!("{:.1} days ago", seconds as f64 / DAY as f64)
    }
}

fn print_version_info() {
    let build_timestamp: u64 = env!("TRD_CEA_BUILD_TIMESTAMP").parse().unwrap_or(0);
    println!("trd-cea {}", env!("CARGO_PKG_VERSION"));

    if build_timestamp > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if now > build_timestamp {
            println!("Built: {}", format_duration_ago(now - build_timestamp));
        } else {
            println!("Built: just now");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lambda_args(min: Option<f64>, max: Option<f64>, step: Option<f64>) -> LambdaArgs {
        LambdaArgs {
            lambda: None,
            lambda_min: min,
            lambda_max: max,
            lambda_step: step,
            jurisdiction: JurisdictionCli::Nz,
        }
    }

    #[test]
    fn partial_lambda_triple_is_a_typed_usage_error() {
        let err = lambda_args(Some(0.0), Some(1000.0), None).grid().unwrap_err();
        assert_eq!(err.downcast_ref::<CliError>(), Some(&CliError::PartialLambdaGrid));
        assert_eq!(
            err.to_string(),
            "--lambda-min, --lambda-max and --lambda-step must be given together"
        );
    }

    #[test]
    fn lambda_grid_defaults_to_the_jurisdiction() {
        let grid = lambda_args(None, None, None).grid().expect("grid");
        assert_eq!(grid, Jurisdiction::Nz.default_lambda_grid());
        let stepped = lambda_args(Some(0.0), Some(1000.0), Some(500.0)).grid().expect("grid");
        assert_eq!(stepped, vec![0.0, 500.0, 1000.0]);
    }

    #[test]
    fn oversized_lambda_grid_is_reported_not_allocated() {
        let err = lambda_args(Some(0.0), Some(1e12), Some(1e-6)).grid().unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{err}");
    }
}
