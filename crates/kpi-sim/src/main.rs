//! kpi-sim - Synthetic KPI generator and detection benchmark
//!
//! Usage:
//!   kpi-sim generate --days 14 --anomalies spike:3,dip:2 --output kpis.csv
//!   kpi-sim bench --policy and --anomalies dip:4,drift:2
//!   kpi-sim list

use clap::{Args, Parser, Subcommand, ValueEnum};
use kpi_core::{EngineConfig, VotePolicy};
use kpi_sim::{SimulatedDataset, SimulationEngine, SyntheticConfig, bench, scenarios};
use std::error::Error;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "kpi-sim")]
#[command(about = "Synthetic KPI data with ground-truth anomaly injection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a long-format KPI table
    Generate {
        #[command(flatten)]
        dataset: DatasetArgs,

        /// CSV destination (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write injected ground truth as JSON
        #[arg(long)]
        truth: Option<PathBuf>,
    },

    /// List available anomaly scenarios
    List,

    /// Run the detection engine on generated data and score it
    Bench {
        #[command(flatten)]
        dataset: DatasetArgs,

        /// Voting policy (overrides the config file)
        #[arg(short, long)]
        policy: Option<PolicyArg>,

        /// Engine configuration JSON
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Also print the full anomaly report
        #[arg(long)]
        report: bool,
    },
}

#[derive(Args)]
struct DatasetArgs {
    #[arg(long, default_value = "3")]
    sites: usize,

    /// KPIs to generate (comma-separated, default: all ten)
    #[arg(long)]
    kpis: Option<String>,

    #[arg(short, long, default_value = "14")]
    days: usize,

    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Noise as a fraction of each KPI's daily swing
    #[arg(long, default_value = "0.1")]
    noise: f64,

    /// Anomalies to inject as name[:count] (comma-separated)
    #[arg(short, long)]
    anomalies: Option<String>,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    Or,
    And,
    Weighted,
}

impl From<PolicyArg> for VotePolicy {
    fn from(p: PolicyArg) -> Self {
        match p {
            PolicyArg::Or => VotePolicy::Or,
            PolicyArg::And => VotePolicy::And,
            PolicyArg::Weighted => VotePolicy::Weighted,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Generate {
            dataset,
            output,
            truth,
        } => run_generate(&dataset, output, truth),
        Commands::List => {
            run_list();
            Ok(())
        }
        Commands::Bench {
            dataset,
            policy,
            config,
            report,
        } => run_bench(&dataset, policy, config, report),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "kpi-sim failed");
            ExitCode::FAILURE
        }
    }
}

fn simulate(args: &DatasetArgs) -> Result<SimulatedDataset, Box<dyn Error>> {
    let mut config = SyntheticConfig {
        sites: args.sites,
        days: args.days,
        seed: args.seed,
        noise: args.noise,
        ..SyntheticConfig::default()
    };
    if let Some(kpis) = &args.kpis {
        config.kpis = split_list(kpis).map(str::to_string).collect();
    }

    let mut sim = SimulationEngine::new(config)?;
    if let Some(anomalies) = &args.anomalies {
        for entry in split_list(anomalies) {
            let (name, count) = parse_anomaly(entry)?;
            sim.schedule_random(name, count)?;
        }
    }
    Ok(sim.run()?)
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// `spike` or `spike:3`
fn parse_anomaly(entry: &str) -> Result<(&str, usize), Box<dyn Error>> {
    match entry.split_once(':') {
        Some((name, count)) => {
            let count = count
                .trim()
                .parse::<usize>()
                .map_err(|_| format!("bad anomaly count in '{entry}'"))?;
            Ok((name.trim(), count))
        }
        None => Ok((entry, 1)),
    }
}

fn run_generate(
    args: &DatasetArgs,
    output: Option<PathBuf>,
    truth: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let dataset = simulate(args)?;

    match &output {
        Some(path) => dataset.write_csv(BufWriter::new(File::create(path)?))?,
        None => dataset.write_csv(io::stdout().lock())?,
    }
    if let Some(path) = &truth {
        let file = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(file, &dataset.ground_truth)?;
    }

    info!(
        points = dataset.point_count(),
        anomalies = dataset.ground_truth.len(),
        output = %output.as_ref().map_or("stdout".into(), |p| p.display().to_string()),
        "Generation complete."
    );
    Ok(())
}

fn run_list() {
    println!("Available anomaly scenarios:");
    for (name, description) in scenarios::list_scenarios() {
        println!("  {name:10} {description}");
    }
    println!("\nUsage: kpi-sim generate --anomalies <NAME[:COUNT]>,...");
}

fn run_bench(
    args: &DatasetArgs,
    policy: Option<PolicyArg>,
    config: Option<PathBuf>,
    print_report: bool,
) -> Result<(), Box<dyn Error>> {
    let mut engine_config = match &config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(policy) = policy {
        engine_config = engine_config.with_policy(policy.into());
    }
    // Fresh data every run; a persistent cache would only replay it.
    engine_config.cache.path = None;

    let dataset = simulate(args)?;
    let (result, report) = bench::run(&dataset, engine_config)?;

    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, &result)?;
    writeln!(out)?;
    if print_report {
        serde_json::to_writer_pretty(&mut out, &report)?;
        writeln!(out)?;
    }
    Ok(())
}
