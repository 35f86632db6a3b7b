//! Dispatch backends - run a batch of tasks, get one outcome per task back.
//!
//! Every backend honours the same contract: outcomes come back in payload
//! order, exactly one per payload, whatever happened to the task. A task
//! that could not run is reported as a failed `TaskOutcome`, never dropped.
//!
//! | backend      | where tasks run                          | failure granularity |
//! |--------------|------------------------------------------|---------------------|
//! | `sequential` | calling thread                           | task                |
//! | `local_pool` | rayon pool in this process               | task                |
//! | `process`    | `calibra-sim worker` children            | chunk               |
//! | `remote`     | cluster jobs via `ClusterClient`         | chunk (job)         |

mod pool;
mod process;
mod remote;
mod sequential;

pub use pool::LocalPoolDispatcher;
pub use process::ProcessPoolDispatcher;
pub use remote::RemoteDispatcher;
pub use sequential::SequentialDispatcher;

use calibra_core::config::{BackendConfig, Executor};
use calibra_core::{CalibrationConfig, TaskOutcome, TaskWorker};
use calibra_env::{CommandCluster, EnvError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use thiserror::Error;
use tracing::{info, warn};

/// Hard ceiling on parallel workers.
pub const MAX_WORKERS: usize = 1024;
/// Wall-clock budget above which a run is refused.
pub const MAX_WALL_CLOCK_SECS: u64 = 7 * 24 * 3600;
/// Wall-clock budget above which a run is flagged.
pub const LONG_WALL_CLOCK_SECS: u64 = 48 * 3600;
/// Share of physical memory above which a run is flagged.
pub const MEMORY_WARN_FRACTION: f64 = 0.8;

// ============================================================================
// PAYLOADS
// ============================================================================

/// One task, fully described.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub sim_id: u64,

    /// Must match the resolved configuration; the task fails otherwise
    pub iteration_count: u32,

    /// Resolved configuration every worker loads
    pub config_path: PathBuf,
}

/// A chunk of tasks handed to an out-of-process worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub config_path: PathBuf,
    pub tasks: Vec<TaskPayload>,

    /// Where to write outcomes (stdout when absent)
    #[serde(default)]
    pub outcome_path: Option<PathBuf>,
}

impl ChunkPayload {
    pub fn new(tasks: &[TaskPayload]) -> Self {
        Self {
            config_path: tasks.first().map(|t| t.config_path.clone()).unwrap_or_default(),
            tasks: tasks.to_vec(),
            outcome_path: None,
        }
    }

    pub fn with_outcome_path(mut self, path: PathBuf) -> Self {
        self.outcome_path = Some(path);
        self
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Resource request refused before anything ran
    #[error("Pre-flight check failed: {0}")]
    Preflight(String),

    /// Backend could not be set up
    #[error("Backend setup failed: {0}")]
    Setup(String),

    #[error(transparent)]
    Cluster(#[from] EnvError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ============================================================================
// DISPATCHER TRAIT
// ============================================================================

/// Runs batches of tasks.
pub trait Dispatcher: Send + Sync {
    /// Runs every payload and returns one outcome per payload, in order.
    ///
    /// `worker` is used by in-process backends; out-of-process backends
    /// rebuild their worker from `TaskPayload::config_path`.
    fn execute(
        &self,
        payloads: &[TaskPayload],
        worker: Arc<dyn TaskWorker>,
    ) -> Result<Vec<TaskOutcome>, DispatchError>;

    fn name(&self) -> &str;
}

/// Builds the backend selected by the configuration.
///
/// `program` is the worker executable for out-of-process backends when the
/// configuration does not name one.
pub fn build_dispatcher(
    config: &CalibrationConfig,
    program: &Path,
) -> Result<Box<dyn Dispatcher>, DispatchError> {
    let backend = &config.backend;
    let staging = config.output.dir.join("staging");

    Ok(match &backend.executor {
        Executor::Sequential => Box::new(SequentialDispatcher::new(backend.progress_every)),
        Executor::LocalPool { workers, distribution } => Box::new(LocalPoolDispatcher::new(
            *workers,
            *distribution,
            backend.progress_every,
        )?),
        Executor::ProcessPool { workers, program: configured } => Box::new(ProcessPoolDispatcher::new(
            configured.clone().unwrap_or_else(|| program.to_path_buf()),
            *workers,
            staging,
        )),
        Executor::Remote {
            submit_command,
            status_command,
            chunk_size,
            poll_interval_secs,
            staging_dir,
            program: configured,
        } => {
            let mut client = CommandCluster::new(submit_command.clone());
            if let Some(status) = status_command {
                client = client.with_status_command(status.clone());
            }
            Box::new(
                RemoteDispatcher::new(
                    Arc::new(client),
                    configured.clone().unwrap_or_else(|| program.to_path_buf()),
                    staging_dir.clone().unwrap_or(staging),
                )
                .with_chunk_size(*chunk_size)
                .with_poll_interval(Duration::from_secs(*poll_interval_secs))
                .with_wall_clock(Duration::from_secs(backend.wall_clock_secs))
                .with_memory_mb(backend.memory_per_task_mb),
            )
        }
    })
}

// ============================================================================
// PRE-FLIGHT
// ============================================================================

/// What the host offers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostResources {
    pub logical_cpus: usize,
    pub total_memory_mb: u64,
}

impl HostResources {
    pub fn detect() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu();
        Self {
            logical_cpus: system.cpus().len().max(1),
            total_memory_mb: system.total_memory() / (1024 * 1024),
        }
    }
}

/// Checks a backend request against this host.
///
/// Returns warnings for requests that will probably hurt; refuses requests
/// that cannot work.
pub fn preflight(backend: &BackendConfig) -> Result<Vec<String>, DispatchError> {
    preflight_with(backend, HostResources::detect())
}

pub fn preflight_with(
    backend: &BackendConfig,
    host: HostResources,
) -> Result<Vec<String>, DispatchError> {
    let workers = backend.executor.workers();
    let mut warnings = Vec::new();

    if workers == 0 {
        return Err(DispatchError::Preflight("workers must be at least 1".into()));
    }
    if workers > MAX_WORKERS {
        return Err(DispatchError::Preflight(format!(
            "{} workers requested, at most {} allowed",
            workers, MAX_WORKERS
        )));
    }
    if backend.wall_clock_secs > MAX_WALL_CLOCK_SECS {
        return Err(DispatchError::Preflight(format!(
            "wall clock {}s exceeds the 7-day limit",
            backend.wall_clock_secs
        )));
    }

    // Remote jobs use cluster memory, not ours
    let local = !matches!(backend.executor, Executor::Remote { .. });
    if local {
        let requested_mb = workers as u64 * backend.memory_per_task_mb;
        if host.total_memory_mb > 0 {
            if requested_mb > host.total_memory_mb {
                return Err(DispatchError::Preflight(format!(
                    "{} MiB requested ({} × {} MiB), host has {} MiB",
                    requested_mb, workers, backend.memory_per_task_mb, host.total_memory_mb
                )));
            }
            if requested_mb as f64 > MEMORY_WARN_FRACTION * host.total_memory_mb as f64 {
                warnings.push(format!(
                    "{} MiB requested is above {:.0}% of the host's {} MiB",
                    requested_mb,
                    MEMORY_WARN_FRACTION * 100.0,
                    host.total_memory_mb
                ));
            }
        }
        if workers > host.logical_cpus {
            warnings.push(format!(
                "{} workers exceed the {} logical CPUs",
                workers, host.logical_cpus
            ));
        }
    }
    if backend.wall_clock_secs > LONG_WALL_CLOCK_SECS {
        warnings.push(format!(
            "wall clock {}h is above 48h",
            backend.wall_clock_secs / 3600
        ));
    }

    for warning in &warnings {
        warn!("Pre-flight: {}", warning);
    }
    Ok(warnings)
}

// ============================================================================
// SHARED HELPERS
// ============================================================================

/// Completion counter that logs every `every` tasks.
pub(crate) struct Progress {
    every: usize,
    total: usize,
    done: AtomicUsize,
    started: Instant,
}

impl Progress {
    pub(crate) fn new(every: usize, total: usize) -> Self {
        Self {
            every,
            total,
            done: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    pub(crate) fn tick(&self) {
        self.advance(1);
    }

    pub(crate) fn advance(&self, n: usize) {
        let before = self.done.fetch_add(n, Ordering::Relaxed);
        if self.every == 0 {
            return;
        }
        let after = before + n;
        if after / self.every > before / self.every || after == self.total {
            info!(
                "  progress: {}/{} tasks ({:.1}s)",
                after,
                self.total,
                self.started.elapsed().as_secs_f64()
            );
        }
    }
}

/// Reorders outcomes to match `payloads`, filling gaps with failures.
pub(crate) fn align_outcomes(payloads: &[TaskPayload], outcomes: Vec<TaskOutcome>) -> Vec<TaskOutcome> {
    let mut by_id: HashMap<u64, TaskOutcome> =
        outcomes.into_iter().map(|o| (o.sim_id, o)).collect();
    payloads
        .iter()
        .map(|p| {
            by_id
                .remove(&p.sim_id)
                .unwrap_or_else(|| TaskOutcome::failed(p.sim_id, "no outcome reported"))
        })
        .collect()
}

/// Splits `items` into at most `parts` contiguous, near-equal chunks.
pub(crate) fn contiguous_chunks<T>(items: &[T], parts: usize) -> Vec<&[T]> {
    if items.is_empty() {
        return Vec::new();
    }
    let size = items.len().div_ceil(parts.max(1));
    items.chunks(size).collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Succeeds with likelihood `-sim_id`; fails ids divisible by `fail_every`.
    pub struct FakeWorker {
        pub fail_every: u64,
        pub calls: AtomicUsize,
    }

    impl FakeWorker {
        pub fn new(fail_every: u64) -> Self {
            Self {
                fail_every,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TaskWorker for FakeWorker {
        fn run_task(&self, sim_id: u64) -> TaskOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_every > 0 && sim_id % self.fail_every == 0 {
                return TaskOutcome::failed(sim_id, "scripted failure");
            }
            TaskOutcome {
                sim_id,
                success: true,
                likelihood: Some(-(sim_id as f64)),
                shard_path: None,
                error: None,
            }
        }
    }

    pub fn payloads(ids: impl IntoIterator<Item = u64>) -> Vec<TaskPayload> {
        ids.into_iter()
            .map(|sim_id| TaskPayload {
                sim_id,
                iteration_count: 1,
                config_path: PathBuf::from("resolved_config.json"),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(executor: Executor) -> BackendConfig {
        BackendConfig {
            executor,
            ..Default::default()
        }
    }

    fn host() -> HostResources {
        HostResources {
            logical_cpus: 8,
            total_memory_mb: 16_384,
        }
    }

    fn pool(workers: usize) -> Executor {
        Executor::LocalPool {
            workers,
            distribution: Default::default(),
        }
    }

    #[test]
    fn test_preflight_hard_errors() {
        assert!(preflight_with(&backend(pool(0)), host()).is_err());
        assert!(preflight_with(&backend(pool(MAX_WORKERS + 1)), host()).is_err());

        let mut too_long = backend(pool(2));
        too_long.wall_clock_secs = MAX_WALL_CLOCK_SECS + 1;
        assert!(preflight_with(&too_long, host()).is_err());

        let mut too_big = backend(pool(8));
        too_big.memory_per_task_mb = 4_096;
        assert!(preflight_with(&too_big, host()).is_err());
    }

    #[test]
    fn test_preflight_warnings() {
        assert!(preflight_with(&backend(pool(4)), host()).unwrap().is_empty());

        let warnings = preflight_with(&backend(pool(16)), host()).unwrap();
        assert!(warnings.iter().any(|w| w.contains("logical CPUs")));

        let mut heavy = backend(pool(4));
        heavy.memory_per_task_mb = 3_600;
        let warnings = preflight_with(&heavy, host()).unwrap();
        assert!(warnings.iter().any(|w| w.contains("above 80%")));

        let mut long = backend(Executor::Sequential);
        long.wall_clock_secs = 72 * 3600;
        let warnings = preflight_with(&long, host()).unwrap();
        assert!(warnings.iter().any(|w| w.contains("48h")));
    }

    #[test]
    fn test_align_outcomes_fills_gaps() {
        let payloads = test_support::payloads([3, 1, 2]);
        let outcomes = vec![
            TaskOutcome::failed(2, "x"),
            TaskOutcome::failed(3, "y"),
        ];
        let aligned = align_outcomes(&payloads, outcomes);
        let ids: Vec<u64> = aligned.iter().map(|o| o.sim_id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(aligned[1].error.as_deref(), Some("no outcome reported"));
    }

    #[test]
    fn test_contiguous_chunks() {
        let items: Vec<u32> = (0..10).collect();
        let chunks = contiguous_chunks(&items, 3);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], &[0, 1, 2, 3]);
        assert_eq!(chunks.concat(), items);
        assert!(contiguous_chunks::<u32>(&[], 4).is_empty());
    }
}
