//! The "WORKER" - one calibration trial, start to shard
//!
//! A task is identified by its `sim_id` alone. Everything else (seeds,
//! parameters, output path) is derived from it, which is what lets the
//! same task run unchanged on a pool thread, in a child process or on a
//! remote node.
//!
//! # Seeds
//!
//! `seed_sim = sim_id` drives the prior draw. Iteration `i` (1-based) of
//! task `s` with `K` iterations per task uses
//! `seed_iter = (s − 1)·K + i`, so seeds never repeat within a run.

use crate::config::CalibrationConfig;
use crate::error::{CalibError, Result};
use crate::shard::{IterationRecord, ResultShard, ShardStore, SimulationResult, TimeSeriesShard};
use crate::stats;
use calibra_env::{
    EnvError, LikelihoodConfig, LikelihoodModel, PriorSampler, SimulationModel, TimeSeries,
};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Seed of iteration `iteration_index` (1-based) of task `sim_id`.
pub fn seed_for_iteration(sim_id: u64, iteration_count: u32, iteration_index: u32) -> u64 {
    sim_id.saturating_sub(1) * u64::from(iteration_count) + u64::from(iteration_index)
}

/// Result of one task as reported back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub sim_id: u64,

    /// Shard written and at least one finite iteration
    pub success: bool,

    pub likelihood: Option<f64>,
    pub shard_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn failed(sim_id: u64, reason: impl std::fmt::Display) -> Self {
        Self {
            sim_id,
            success: false,
            likelihood: None,
            shard_path: None,
            error: Some(reason.to_string()),
        }
    }
}

/// Anything that can run a task by id.
///
/// Implementations must be safe to call from many threads at once.
pub trait TaskWorker: Send + Sync {
    fn run_task(&self, sim_id: u64) -> TaskOutcome;
}

thread_local! {
    static THREAD_PINNED: Cell<bool> = Cell::new(false);
}

static UNSUPPORTED_WARNED: AtomicBool = AtomicBool::new(false);

/// Runs tasks against a model, a likelihood and a prior.
pub struct SimulationWorker {
    model: Arc<dyn SimulationModel>,
    likelihood: Arc<dyn LikelihoodModel>,
    priors: Arc<dyn PriorSampler>,
    observed: TimeSeries,
    likelihood_config: LikelihoodConfig,
    iteration_count: u32,
    release_every: u32,
    write_timeseries: bool,
    shards: ShardStore,
}

impl SimulationWorker {
    pub fn new(
        config: &CalibrationConfig,
        model: Arc<dyn SimulationModel>,
        likelihood: Arc<dyn LikelihoodModel>,
        priors: Arc<dyn PriorSampler>,
    ) -> Self {
        Self {
            model,
            likelihood,
            priors,
            observed: config.observed.clone(),
            likelihood_config: config.likelihood.clone(),
            iteration_count: config.iteration_count,
            release_every: config.release_every.max(1),
            write_timeseries: config.output.write_timeseries,
            shards: ShardStore::new(&config.output.dir, config.output.compression),
        }
    }

    pub fn shards(&self) -> &ShardStore {
        &self.shards
    }

    pub fn iteration_count(&self) -> u32 {
        self.iteration_count
    }

    /// Runs one task and writes its shard.
    ///
    /// Only a failed prior draw or a failed shard write is an error;
    /// iteration failures are recorded as non-finite iterations.
    pub fn run(&self, sim_id: u64) -> Result<ResultShard> {
        self.pin_thread();

        let params = self.priors.sample(sim_id).map_err(|e| CalibError::Task {
            sim_id,
            reason: e.to_string(),
        })?;

        let mut iterations = Vec::with_capacity(self.iteration_count as usize);
        let mut last_series: Option<(u64, TimeSeries)> = None;

        for index in 1..=self.iteration_count {
            let seed_iter = seed_for_iteration(sim_id, self.iteration_count, index);
            let likelihood = match self.model.simulate(&params, seed_iter) {
                Ok(series) => {
                    let ll = self
                        .likelihood
                        .log_likelihood(&self.observed, &series, &self.likelihood_config);
                    if ll.is_finite() {
                        last_series = Some((seed_iter, series));
                        Some(ll)
                    } else {
                        None
                    }
                }
                Err(e) => {
                    debug!("sim {} iteration {} failed: {}", sim_id, index, e);
                    None
                }
            };

            iterations.push(IterationRecord {
                sim_id,
                iteration_index: index,
                seed_sim: sim_id,
                seed_iter,
                likelihood,
                parameters: params.values.clone(),
            });

            if index % self.release_every == 0 {
                self.model.release_resources();
            }
        }
        self.model.release_resources();

        let shard = ResultShard {
            sim_id,
            seed_sim: sim_id,
            iteration_count: self.iteration_count,
            parameter_names: params.names.clone(),
            result: collapse(sim_id, &iterations, &params.values),
            iterations,
        };
        self.shards.write(&shard)?;

        if self.write_timeseries {
            if let Some((seed_iter, series)) = last_series {
                self.shards.write_timeseries(&TimeSeriesShard {
                    sim_id,
                    seed_iter,
                    series,
                })?;
            }
        }
        Ok(shard)
    }

    /// Asks the model to run single-threaded, once per OS thread.
    fn pin_thread(&self) {
        if THREAD_PINNED.with(|flag| flag.replace(true)) {
            return;
        }
        match self.model.configure_threads(1) {
            Ok(()) => {}
            Err(EnvError::Unsupported(msg)) => {
                if !UNSUPPORTED_WARNED.swap(true, Ordering::Relaxed) {
                    warn!("Model '{}' cannot limit its threads: {}", self.model.name(), msg);
                }
            }
            Err(e) => warn!("Model '{}' thread configuration failed: {}", self.model.name(), e),
        }
    }
}

impl TaskWorker for SimulationWorker {
    fn run_task(&self, sim_id: u64) -> TaskOutcome {
        match self.run(sim_id) {
            Ok(shard) => {
                let likelihood = shard.result.likelihood;
                TaskOutcome {
                    sim_id,
                    success: likelihood.is_some(),
                    likelihood,
                    shard_path: Some(self.shards.shard_path(sim_id)),
                    error: likelihood
                        .is_none()
                        .then(|| "no finite iteration".to_string()),
                }
            }
            Err(e) => {
                warn!("sim {} failed: {}", sim_id, e);
                TaskOutcome::failed(sim_id, e)
            }
        }
    }
}

/// Collapses iteration records into one result.
fn collapse(sim_id: u64, iterations: &[IterationRecord], sampled: &[f64]) -> SimulationResult {
    let finite: Vec<&IterationRecord> = iterations
        .iter()
        .filter(|it| it.likelihood.is_some())
        .collect();
    let likelihoods: Vec<f64> = finite.iter().filter_map(|it| it.likelihood).collect();

    let parameters = if finite.is_empty() {
        sampled.to_vec()
    } else {
        (0..sampled.len())
            .map(|j| finite.iter().map(|it| it.parameters[j]).sum::<f64>() / finite.len() as f64)
            .collect()
    };

    let likelihood = stats::log_mean_exp(&likelihoods);
    SimulationResult {
        sim_id,
        likelihood: likelihood.is_finite().then_some(likelihood),
        parameters,
        finite_iterations: finite.len() as u32,
        total_iterations: iterations.len() as u32,
    }
}
