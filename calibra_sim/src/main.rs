//! Calibra CLI
//!
//! Run, resume and re-aggregate adaptive ensemble calibrations.

use anyhow::{Context, Result};
use calibra_core::{storage, CalibrationConfig};
use calibra_sim::dispatch;
use calibra_sim::models::build_model;
use calibra_sim::{run_worker_chunk, CalibrationRunner, ChunkPayload, RunReport};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Adaptive ensemble calibration driver
#[derive(Parser, Debug)]
#[command(name = "calibra-sim")]
#[command(about = "Calibrate a stochastic model against observed data", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run (or resume) a calibration
    Run {
        #[command(flatten)]
        target: Target,

        /// Continue from the checkpoint and existing shards
        #[arg(long)]
        resume: bool,

        /// JSON report on stdout
        #[arg(long)]
        json: bool,
    },

    /// Run one chunk of tasks (used by the process and remote backends)
    #[command(hide = true)]
    Worker {
        /// Chunk payload file
        #[arg(long)]
        payload: PathBuf,
    },

    /// Re-consolidate the shards of an existing output directory
    Aggregate {
        #[command(flatten)]
        target: Target,

        /// JSON report on stdout
        #[arg(long)]
        json: bool,
    },

    /// Check the configuration and the host resources without running
    Validate {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Args, Debug)]
struct Target {
    /// Configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Output directory (overrides the configuration)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Remove a lock left behind by a crashed run
    #[arg(long)]
    force_unlock: bool,
}

impl Target {
    fn load(&self, resume: bool) -> Result<CalibrationConfig> {
        let mut config = CalibrationConfig::load(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;
        if let Some(dir) = &self.output {
            config.output.dir = dir.clone();
        }
        config.resume |= resume;
        Ok(config)
    }

    fn runner(&self, resume: bool) -> Result<CalibrationRunner> {
        Ok(CalibrationRunner::new(self.load(resume)?)?.with_force_unlock(self.force_unlock))
    }
}

fn main() {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries worker outcomes and --json reports
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: tracing subscriber already installed");
    }

    if let Err(e) = execute(cli.command) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn execute(command: Command) -> Result<()> {
    match command {
        Command::Run { target, resume, json } => {
            info!("Calibra v{}", env!("CARGO_PKG_VERSION"));
            let report = target.runner(resume)?.run()?;
            print_report(&report, json)
        }
        Command::Worker { payload } => worker(&payload),
        Command::Aggregate { target, json } => {
            let report = target.runner(false)?.aggregate()?;
            print_report(&report, json)
        }
        Command::Validate { config } => validate(&config),
    }
}

fn worker(payload_path: &Path) -> Result<()> {
    let bytes = storage::read_all(payload_path)
        .with_context(|| format!("reading payload {}", payload_path.display()))?;
    let payload: ChunkPayload = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing payload {}", payload_path.display()))?;

    let outcomes = run_worker_chunk(&payload)?;
    if payload.outcome_path.is_none() {
        println!("{}", serde_json::to_string(&outcomes)?);
    }
    Ok(())
}

fn validate(path: &Path) -> Result<()> {
    let config = CalibrationConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
    build_model(&config.model)?;
    let warnings = dispatch::preflight(&config.backend)?;

    info!(
        "{} is valid: {} estimated parameters, model '{}', {} backend, ceiling {} sims",
        path.display(),
        config.estimated_names().len(),
        config.model.name,
        config.backend.executor.name(),
        config.max_simulations()
    );
    if !warnings.is_empty() {
        warn!("{} pre-flight warning(s)", warnings.len());
    }
    Ok(())
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if let Some(summary) = &report.summary {
        info!(
            "{} run: {} batches, {}/{} sims succeeded in {:.1}s ({:?})",
            summary.mode,
            summary.batches,
            summary.total_sims_successful,
            summary.total_sims_run,
            summary.runtime_secs,
            summary.termination
        );
    }
    info!(
        "Table: {} rows ({} valid) -> {}",
        report.rows,
        report.valid_rows,
        report.consolidated_path.display()
    );
    if let Some(best) = report.best_sim_id {
        info!("Best model: sim {}", best);
    }
    info!(
        "Best subset: {} sims (tier '{}')",
        report.subset_size, report.subset_tier
    );
    if report.converged {
        info!("✅ Converged");
    } else {
        warn!("Not converged");
    }
    Ok(())
}
