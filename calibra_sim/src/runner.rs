//! Calibration runner - wires a configuration into a complete run.
//!
//! `lock → preflight → scheduler → aggregate → weight → export → cleanup`
//!
//! The runner owns the advisory lock for the whole run. Out-of-process
//! workers never take it; they only write shards.

use crate::dispatch::{self, ChunkPayload, Dispatcher};
use crate::error::{Result, RunError};
use crate::exporter::{self, RunReport};
use crate::models::{build_model, WeightedLikelihood};
use crate::scheduler::{Assessment, BatchScheduler, ConvergenceMonitor, RunSummary};
use calibra_core::aggregate::read_consolidated;
use calibra_core::config::ConvergenceConfig;
use calibra_core::convergence::{self, ConvergenceDiagnostics};
use calibra_core::priors::ConfigPriorSampler;
use calibra_core::shard::ShardStore;
use calibra_core::state::EssSnapshot;
use calibra_core::{storage, Aggregator, CalibrationConfig, ConsolidatedTable, RunLock, RunState};
use calibra_core::{SimulationWorker, TaskOutcome, TaskWorker};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name of the resolved configuration handed to out-of-process workers.
pub const RESOLVED_CONFIG_FILE: &str = "resolved_config.json";

/// Builds the worker for a configuration with the reference collaborators.
pub fn build_worker(config: &CalibrationConfig) -> Result<Arc<SimulationWorker>> {
    let model = build_model(&config.model)?;
    let priors = Arc::new(ConfigPriorSampler::new(config.parameters.clone()));
    debug!("Worker: model={}, likelihood=weighted", model.name());
    Ok(Arc::new(SimulationWorker::new(
        config,
        model,
        Arc::new(WeightedLikelihood),
        priors,
    )))
}

/// Runs one calibration from configuration to final report.
pub struct CalibrationRunner {
    config: CalibrationConfig,
    program: PathBuf,
    force_unlock: bool,
}

impl CalibrationRunner {
    /// Creates a runner; relative output paths are made absolute so that
    /// workers started elsewhere find the same directory.
    pub fn new(mut config: CalibrationConfig) -> Result<Self> {
        if config.output.dir.is_relative() {
            config.output.dir = std::env::current_dir()?.join(&config.output.dir);
        }
        let program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("calibra-sim"));
        Ok(Self {
            config,
            program,
            force_unlock: false,
        })
    }

    /// Worker executable for out-of-process backends.
    pub fn with_program(mut self, program: PathBuf) -> Self {
        self.program = program;
        self
    }

    /// Removes a stale lock before acquiring.
    pub fn with_force_unlock(mut self, force: bool) -> Self {
        self.force_unlock = force;
        self
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Runs the configured backend.
    pub fn run(&self) -> Result<RunReport> {
        let _lock = self.lock()?;
        let warnings = dispatch::preflight(&self.config.backend)?;
        let config_path = self.write_resolved_config()?;
        let dispatcher = dispatch::build_dispatcher(&self.config, &self.program)?;
        self.run_locked(dispatcher, config_path, warnings)
    }

    /// Runs with a caller-supplied dispatcher.
    pub fn run_with(&self, dispatcher: Box<dyn Dispatcher>) -> Result<RunReport> {
        let _lock = self.lock()?;
        let config_path = self.write_resolved_config()?;
        self.run_locked(dispatcher, config_path, Vec::new())
    }

    /// Re-consolidates whatever shards are on disk, without running anything.
    pub fn aggregate(&self) -> Result<RunReport> {
        let _lock = self.lock()?;
        let report = self.finish(None, Vec::new(), true)?;
        report.write_to_dir(&self.config.output.dir)?;
        Ok(report)
    }

    fn lock(&self) -> Result<RunLock> {
        if self.force_unlock {
            RunLock::force_release(&self.config.output.dir)?;
        }
        Ok(RunLock::acquire(&self.config.output.dir)?)
    }

    fn write_resolved_config(&self) -> Result<PathBuf> {
        let path = self.config.output.dir.join(RESOLVED_CONFIG_FILE);
        storage::write_json_atomic(&path, &self.config)?;
        Ok(path)
    }

    fn run_locked(
        &self,
        dispatcher: Box<dyn Dispatcher>,
        config_path: PathBuf,
        warnings: Vec<String>,
    ) -> Result<RunReport> {
        info!(
            "Calibrating {} parameters with '{}' on {} backend, output {}",
            self.config.estimated_names().len(),
            self.config.model.name,
            dispatcher.name(),
            self.config.output.dir.display()
        );

        if !self.config.resume {
            self.ensure_no_stale_shards()?;
        }

        let worker = build_worker(&self.config)?;
        let scheduler =
            BatchScheduler::new(&self.config, dispatcher, worker).with_config_path(config_path);
        let mut monitor = ShardConvergenceMonitor::new(&self.config);
        let summary = scheduler.run(&mut monitor)?;

        let report = self.finish(Some(summary), warnings, self.config.resume)?;
        report.write_to_dir(&self.config.output.dir)?;
        Ok(report)
    }

    /// A fresh run must not pick up shards it did not write.
    fn ensure_no_stale_shards(&self) -> Result<()> {
        let shards = ShardStore::new(&self.config.output.dir, self.config.output.compression);
        let count = shards.entries()?.len();
        if count > 0 {
            return Err(RunError::StaleShards {
                dir: shards.dir().to_path_buf(),
                count,
            });
        }
        Ok(())
    }

    /// Aggregates, weights, exports and cleans up.
    ///
    /// With `keep_previous`, rows of an existing consolidated table survive.
    fn finish(
        &self,
        summary: Option<RunSummary>,
        warnings: Vec<String>,
        keep_previous: bool,
    ) -> Result<RunReport> {
        let output = &self.config.output;
        let aggregator = Aggregator::from_config(&self.config);
        let shards = ShardStore::new(&output.dir, output.compression);
        let consolidated = self.config.consolidated_path();

        let mut table = aggregator.combine(&shards.shard_paths()?);
        if keep_previous {
            merge_previous(&mut table, &consolidated);
            aggregator.annotate(&mut table);
        }
        if table.is_empty() {
            warn!("No results to consolidate in {}", output.dir.display());
        }

        let diagnostics = convergence::analyze(
            &mut table,
            &self.config.estimated_names(),
            &self.config.convergence,
        );
        log_diagnostics(&diagnostics);
        exporter::write_diagnostics(&output.dir, &diagnostics)?;

        let removed = aggregator.finalize(
            &table,
            &shards,
            &consolidated,
            output.format,
            output.compression,
            output.keep_shards,
        )?;

        Ok(RunReport {
            summary,
            consolidated_path: consolidated,
            rows: table.len(),
            valid_rows: table.valid_count(),
            shards_removed: removed,
            best_sim_id: table.best_model().map(|r| r.sim_id),
            converged: diagnostics.is_converged(&self.config.convergence),
            subset_tier: diagnostics.subset.tier_name.clone(),
            subset_size: diagnostics.subset.size,
            warnings,
        })
    }
}

/// Carries over rows of an earlier consolidated table that no longer have
/// shards, so a resumed run does not lose finalized results.
fn merge_previous(table: &mut ConsolidatedTable, path: &Path) {
    if !path.exists() {
        return;
    }
    let previous = match read_consolidated(path) {
        Ok(previous) => previous,
        Err(e) => {
            warn!("Ignoring previous table: {}", e);
            return;
        }
    };
    if table.rows.is_empty() {
        table.parameter_names = previous.parameter_names.clone();
    } else if table.parameter_names != previous.parameter_names {
        warn!("Previous table {} has different parameters; ignoring it", path.display());
        return;
    }

    let present: BTreeSet<u64> = table.rows.iter().map(|r| r.sim_id).collect();
    let before = table.rows.len();
    table
        .rows
        .extend(previous.rows.into_iter().filter(|r| !present.contains(&r.sim_id)));
    table.rows.sort_by_key(|r| r.sim_id);
    if table.rows.len() > before {
        info!("Carried over {} rows from {}", table.rows.len() - before, path.display());
    }
}

fn log_diagnostics(diagnostics: &ConvergenceDiagnostics) {
    info!(
        "Rows: {} total, {} valid, {} outliers, {} retained",
        diagnostics.n_rows, diagnostics.n_valid, diagnostics.n_outliers, diagnostics.n_retained
    );
    info!(
        "Parameter ESS: min {:.1}, {:.0}% at target {}",
        diagnostics.parameter_ess.min_ess,
        diagnostics.parameter_ess.fraction_meeting_target * 100.0,
        diagnostics.parameter_ess.target
    );
    info!(
        "Best subset: {} sims, tier '{}' (ESS {:.1}, agreement {:.3}, CV {:.3})",
        diagnostics.subset.size,
        diagnostics.subset.tier_name,
        diagnostics.subset.metrics.ess,
        diagnostics.subset.metrics.agreement,
        diagnostics.subset.metrics.cv
    );
}

// ============================================================================
// IN-LOOP CONVERGENCE
// ============================================================================

/// Judges convergence from the shards currently on disk.
pub struct ShardConvergenceMonitor {
    aggregator: Aggregator,
    shards: ShardStore,
    estimated: Vec<String>,
    convergence: ConvergenceConfig,
}

impl ShardConvergenceMonitor {
    pub fn new(config: &CalibrationConfig) -> Self {
        Self {
            aggregator: Aggregator::from_config(config),
            shards: ShardStore::new(&config.output.dir, config.output.compression),
            estimated: config.estimated_names(),
            convergence: config.convergence.clone(),
        }
    }
}

impl ConvergenceMonitor for ShardConvergenceMonitor {
    fn assess(&mut self, state: &RunState) -> Result<Assessment> {
        let mut table = self.aggregator.combine(&self.shards.shard_paths()?);
        let diagnostics = convergence::analyze(&mut table, &self.estimated, &self.convergence);
        Ok(Assessment {
            snapshot: EssSnapshot {
                batch_number: state.batch_number,
                total_sims_successful: state.total_sims_successful,
                min_parameter_ess: diagnostics.parameter_ess.min_ess,
                fraction_meeting_target: diagnostics.parameter_ess.fraction_meeting_target,
            },
            converged: diagnostics.is_converged(&self.convergence),
        })
    }
}

// ============================================================================
// WORKER SUBCOMMAND
// ============================================================================

/// Runs one chunk in this process (the `worker` subcommand).
///
/// Outcomes go to `payload.outcome_path` when set; they are always
/// returned so the caller can print them.
pub fn run_worker_chunk(payload: &ChunkPayload) -> Result<Vec<TaskOutcome>> {
    let config = CalibrationConfig::load(&payload.config_path)?;
    let worker = build_worker(&config)?;
    debug!("Worker chunk: {} tasks", payload.tasks.len());

    let outcomes: Vec<TaskOutcome> = payload
        .tasks
        .iter()
        .map(|task| {
            if task.iteration_count != worker.iteration_count() {
                let reason = format!(
                    "payload asks for {} iterations, configuration has {}",
                    task.iteration_count,
                    worker.iteration_count()
                );
                warn!("sim {}: {}", task.sim_id, reason);
                return TaskOutcome::failed(task.sim_id, reason);
            }
            worker.run_task(task.sim_id)
        })
        .collect();

    if let Some(path) = &payload.outcome_path {
        storage::write_json_atomic(path, &outcomes)?;
    }
    Ok(outcomes)
}
