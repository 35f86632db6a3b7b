//! The "SCHEDULER" - decides how many simulations run next.
//!
//! Two strategies:
//! - **Fixed**: run sims `1..=N` (minus whatever already has a shard when
//!   resuming) in batches of `batch_size`
//! - **Auto**: `CALIBRATION → PREDICTIVE → FINE_TUNING(1..5) → CONVERGED`,
//!   one batch at a time, until the convergence monitor is satisfied or
//!   the simulation ceiling is reached
//!
//! The loop is synchronous: a batch is fully dispatched and collected
//! before the next decision, and the checkpoint is saved exactly once per
//! batch.

use crate::dispatch::{Dispatcher, TaskPayload};
use crate::error::Result;
use calibra_core::aggregate::read_consolidated;
use calibra_core::config::{AutoStrategy, FixedStrategy};
use calibra_core::shard::{read_shard, ShardStore};
use calibra_core::state::{EssSnapshot, FINE_TUNING_TIERS};
use calibra_core::{CalibrationConfig, Mode, Phase, RunState, StateStore, Strategy, TaskOutcome, TaskWorker};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// CONVERGENCE MONITOR
// ============================================================================

/// Result of one convergence assessment.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub snapshot: EssSnapshot,
    pub converged: bool,
}

/// Judges convergence after each auto-mode batch.
pub trait ConvergenceMonitor {
    fn assess(&mut self, state: &RunState) -> Result<Assessment>;
}

// ============================================================================
// SUMMARY
// ============================================================================

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Convergence criteria met
    Converged,
    /// Simulation ceiling exhausted without convergence
    CeilingReached,
    /// Batch cap reached without convergence
    MaxBatches,
    /// Fixed-mode target completed
    TargetReached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: Mode,
    pub batches: u64,
    pub total_sims_run: u64,
    pub total_sims_successful: u64,
    pub converged: bool,
    pub termination: TerminationReason,
    pub runtime_secs: f64,
}

// ============================================================================
// DECISION FUNCTION
// ============================================================================

/// Phase and size of the next auto-mode batch. Size 0 means stop.
pub fn decide_batch(state: &RunState, auto: &AutoStrategy, ess_target: f64) -> (Phase, u64) {
    if state.converged || state.phase == Phase::Converged {
        return (Phase::Converged, 0);
    }
    if state.batch_number >= auto.max_batches || state.total_sims_run >= auto.max_simulations {
        return (state.phase, 0);
    }

    match state.phase {
        Phase::Calibration if state.phase_batch_count < auto.calibration_batches => {
            (Phase::Calibration, auto.calibration_batch_size)
        }
        Phase::Calibration | Phase::Predictive => predictive(state, auto, ess_target),
        Phase::FineTuning(tier) => {
            let tier = if state.phase_batch_count >= auto.batches_per_tier {
                (tier + 1).min(FINE_TUNING_TIERS)
            } else {
                tier
            };
            (Phase::FineTuning(tier), fine_tuning_size(auto, tier))
        }
        Phase::Converged => (Phase::Converged, 0),
    }
}

fn predictive(state: &RunState, auto: &AutoStrategy, ess_target: f64) -> (Phase, u64) {
    let fraction = state.latest_ess().map_or(0.0, |s| s.fraction_meeting_target);
    let unreserved = auto
        .max_simulations
        .saturating_sub(auto.fine_tuning_reserve)
        .saturating_sub(state.total_sims_run);

    if fraction >= auto.predictive_exit_fraction || unreserved == 0 {
        return (Phase::FineTuning(1), fine_tuning_size(auto, 1));
    }

    let size = project_batch_size(state, ess_target)
        .unwrap_or(auto.max_batch_size as f64)
        .clamp(auto.min_batch_size as f64, auto.max_batch_size as f64) as u64;
    (Phase::Predictive, size.min(unreserved))
}

/// Sims needed to close the ESS gap, from ESS per successful sim so far
/// and the mean success rate.
fn project_batch_size(state: &RunState, ess_target: f64) -> Option<f64> {
    let snapshot = state.latest_ess()?;
    if snapshot.total_sims_successful == 0 || !snapshot.min_parameter_ess.is_finite() {
        return None;
    }
    let ess_per_success = snapshot.min_parameter_ess / snapshot.total_sims_successful as f64;
    if ess_per_success <= 0.0 {
        return None;
    }
    let missing = (ess_target - snapshot.min_parameter_ess).max(0.0);
    let success_rate = state.mean_success_rate().max(0.01);
    Some((missing / ess_per_success / success_rate).ceil())
}

fn fine_tuning_size(auto: &AutoStrategy, tier: u8) -> u64 {
    let idx = usize::from(tier.max(1)) - 1;
    auto.fine_tuning_schedule
        .get(idx)
        .or(auto.fine_tuning_schedule.last())
        .copied()
        .unwrap_or(auto.min_batch_size)
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// Drives batches through a dispatcher and keeps the checkpoint current.
pub struct BatchScheduler {
    config: CalibrationConfig,
    dispatcher: Box<dyn Dispatcher>,
    worker: Arc<dyn TaskWorker>,
    store: StateStore,
    shards: ShardStore,
    config_path: PathBuf,
    resume: bool,
}

impl BatchScheduler {
    pub fn new(
        config: &CalibrationConfig,
        dispatcher: Box<dyn Dispatcher>,
        worker: Arc<dyn TaskWorker>,
    ) -> Self {
        Self {
            store: StateStore::new(config.state_path())
                .with_low_disk_warning(config.output.low_disk_warning_mb),
            shards: ShardStore::new(&config.output.dir, config.output.compression),
            config_path: config.output.dir.join("resolved_config.json"),
            resume: config.resume,
            config: config.clone(),
            dispatcher,
            worker,
        }
    }

    /// Configuration file out-of-process workers load.
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = path;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Runs until the strategy says stop.
    pub fn run(&self, monitor: &mut dyn ConvergenceMonitor) -> Result<RunSummary> {
        let started = Instant::now();
        let (state, termination) = match &self.config.strategy {
            Strategy::Fixed(fixed) => self.run_fixed(fixed)?,
            Strategy::Auto(auto) => self.run_auto(auto, monitor)?,
        };

        let summary = RunSummary {
            run_id: state.run_id,
            mode: state.mode,
            batches: state.batch_number,
            total_sims_run: state.total_sims_run,
            total_sims_successful: state.total_sims_successful,
            converged: state.converged,
            termination,
            runtime_secs: started.elapsed().as_secs_f64(),
        };
        match termination {
            TerminationReason::Converged | TerminationReason::TargetReached => info!(
                "Run finished ({:?}): {} sims in {} batches",
                termination, summary.total_sims_run, summary.batches
            ),
            _ => warn!(
                "Run stopped without convergence ({:?}): {} sims in {} batches",
                termination, summary.total_sims_run, summary.batches
            ),
        }
        Ok(summary)
    }

    /// Restores a checkpoint of the given mode, or starts fresh.
    fn restore(&self, mode: Mode) -> Option<RunState> {
        if !self.resume {
            return None;
        }
        let state = self.store.load()?;
        if state.mode != mode {
            warn!("Checkpoint is a {} run, this is a {} run; starting fresh", state.mode, mode);
            return None;
        }
        Some(state)
    }

    fn run_fixed(&self, fixed: &FixedStrategy) -> Result<(RunState, TerminationReason)> {
        let target = fixed.n_simulations;
        let mut state = match self.restore(Mode::Fixed) {
            Some(state) if state.fixed_target == Some(target) => state,
            Some(state) => {
                warn!(
                    "Checkpoint target {:?} differs from {}; starting fresh",
                    state.fixed_target, target
                );
                RunState::new_fixed(target)
            }
            None => RunState::new_fixed(target),
        };

        let (completed, successful) = if self.resume {
            self.completed_in(target)?
        } else {
            (BTreeSet::new(), 0)
        };
        let pending: Vec<u64> = (1..=target).filter(|id| !completed.contains(id)).collect();
        if self.resume {
            // Counters follow what is on disk; tasks without a shard run again
            state.total_sims_run = completed.len() as u64;
            state.total_sims_successful = successful;
        }
        if !completed.is_empty() {
            info!(
                "Resuming: {} of {} sims already completed",
                completed.len(),
                target
            );
        }

        let batch_size = fixed
            .batch_size
            .filter(|s| *s > 0)
            .unwrap_or(pending.len().max(1) as u64) as usize;

        let mut done = target - pending.len() as u64;
        for batch in pending.chunks(batch_size) {
            let outcomes = self.dispatch(batch.iter().copied())?;
            let successes = outcomes.iter().filter(|o| o.success).count() as u64;
            state.record_batch(batch.len() as u64, successes);
            self.store.save(&mut state)?;
            done += batch.len() as u64;
            info!(
                "Batch {}: {}/{} succeeded ({} of {} sims)",
                state.batch_number,
                successes,
                batch.len(),
                done,
                target
            );
        }

        if pending.is_empty() {
            self.store.save(&mut state)?;
        }
        Ok((state, TerminationReason::TargetReached))
    }

    fn run_auto(
        &self,
        auto: &AutoStrategy,
        monitor: &mut dyn ConvergenceMonitor,
    ) -> Result<(RunState, TerminationReason)> {
        let mut state = self.restore(Mode::Auto).unwrap_or_else(RunState::new_auto);
        let ceiling = auto.max_simulations;
        let target = self.config.convergence.parameter_ess_target;

        while !state.is_terminal(ceiling) {
            let (phase, size) = decide_batch(&state, auto, target);
            state.enter_phase(phase);
            if size == 0 {
                break;
            }

            let size = size.min(ceiling - state.total_sims_run);
            let start = state.next_sim_id();
            debug!("Batch {} ({}): sims {}..{}", state.batch_number + 1, phase, start, start + size);

            let outcomes = self.dispatch(start..start + size)?;
            let successes = outcomes.iter().filter(|o| o.success).count() as u64;
            state.record_batch(size, successes);
            info!(
                "Batch {} [{}]: {}/{} succeeded, {} / {} sims",
                state.batch_number, state.phase, successes, size, state.total_sims_run, ceiling
            );

            if state.total_sims_run < ceiling {
                let assessment = monitor.assess(&state)?;
                debug!(
                    "ESS: min {:.1}, {:.0}% of parameters at target",
                    assessment.snapshot.min_parameter_ess,
                    assessment.snapshot.fraction_meeting_target * 100.0
                );
                state.ess_history.push(assessment.snapshot);
                if assessment.converged && state.batch_number >= auto.min_batches {
                    state.converged = true;
                    state.enter_phase(Phase::Converged);
                }
            }
            self.store.save(&mut state)?;
        }

        let termination = if state.converged {
            TerminationReason::Converged
        } else if state.total_sims_run >= ceiling {
            TerminationReason::CeilingReached
        } else {
            TerminationReason::MaxBatches
        };
        Ok((state, termination))
    }

    /// Ids in `1..=target` with a shard or a row in an earlier consolidated
    /// table, and how many of them have a finite likelihood.
    fn completed_in(&self, target: u64) -> Result<(BTreeSet<u64>, u64)> {
        let mut completed = BTreeSet::new();
        let mut successful = 0;

        for (sim_id, row_finite) in self.finalized_rows() {
            if sim_id <= target && completed.insert(sim_id) && row_finite {
                successful += 1;
            }
        }
        for (sim_id, path) in self.shards.entries()? {
            if sim_id > target || !completed.insert(sim_id) {
                continue;
            }
            // Unreadable shards count as attempted but not successful
            if read_shard(&path).map_or(false, |s| s.result.likelihood.is_some()) {
                successful += 1;
            }
        }
        Ok((completed, successful))
    }

    /// `(sim_id, is_finite)` of rows already folded into a consolidated
    /// table by an earlier pass.
    fn finalized_rows(&self) -> Vec<(u64, bool)> {
        let path = self.config.consolidated_path();
        if !path.exists() {
            return Vec::new();
        }
        match read_consolidated(&path) {
            Ok(table) => table.rows.iter().map(|r| (r.sim_id, r.is_finite)).collect(),
            Err(e) => {
                warn!("Cannot read {} for resume: {}", path.display(), e);
                Vec::new()
            }
        }
    }

    fn dispatch(&self, ids: impl Iterator<Item = u64>) -> Result<Vec<TaskOutcome>> {
        let payloads: Vec<TaskPayload> = ids
            .map(|sim_id| TaskPayload {
                sim_id,
                iteration_count: self.config.iteration_count,
                config_path: self.config_path.clone(),
            })
            .collect();
        Ok(self.dispatcher.execute(&payloads, self.worker.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::SequentialDispatcher;
    use calibra_core::config::{ParameterSpec, Prior};
    use calibra_core::shard::{IterationRecord, ResultShard, SimulationResult};
    use calibra_env::TimeSeries;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Writes a shard per task; fails every `fail_every`-th id.
    struct ShardingWorker {
        shards: ShardStore,
        fail_every: u64,
        seen: Mutex<Vec<u64>>,
    }

    impl TaskWorker for ShardingWorker {
        fn run_task(&self, sim_id: u64) -> TaskOutcome {
            self.seen.lock().unwrap().push(sim_id);
            if self.fail_every > 0 && sim_id % self.fail_every == 0 {
                return TaskOutcome::failed(sim_id, "scripted");
            }
            let l = -(sim_id as f64);
            let shard = ResultShard {
                sim_id,
                seed_sim: sim_id,
                iteration_count: 1,
                parameter_names: vec!["r".into()],
                iterations: vec![IterationRecord {
                    sim_id,
                    iteration_index: 1,
                    seed_sim: sim_id,
                    seed_iter: sim_id,
                    likelihood: Some(l),
                    parameters: vec![0.5],
                }],
                result: SimulationResult {
                    sim_id,
                    likelihood: Some(l),
                    parameters: vec![0.5],
                    finite_iterations: 1,
                    total_iterations: 1,
                },
            };
            let path = self.shards.write(&shard).unwrap();
            TaskOutcome {
                sim_id,
                success: true,
                likelihood: Some(l),
                shard_path: Some(path),
                error: None,
            }
        }
    }

    struct NeverConverges {
        calls: AtomicUsize,
    }

    impl ConvergenceMonitor for NeverConverges {
        fn assess(&mut self, state: &RunState) -> Result<Assessment> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Assessment {
                snapshot: EssSnapshot {
                    batch_number: state.batch_number,
                    total_sims_successful: state.total_sims_successful,
                    min_parameter_ess: f64::NAN,
                    fraction_meeting_target: 0.0,
                },
                converged: false,
            })
        }
    }

    struct AlwaysConverges;

    impl ConvergenceMonitor for AlwaysConverges {
        fn assess(&mut self, state: &RunState) -> Result<Assessment> {
            Ok(Assessment {
                snapshot: EssSnapshot {
                    batch_number: state.batch_number,
                    total_sims_successful: state.total_sims_successful,
                    min_parameter_ess: 1e6,
                    fraction_meeting_target: 1.0,
                },
                converged: true,
            })
        }
    }

    fn config(dir: &std::path::Path, strategy: Strategy) -> CalibrationConfig {
        let params = vec![ParameterSpec {
            name: "r".into(),
            prior: Prior::Uniform { low: 0.0, high: 1.0 },
            estimate: true,
            fixed_value: None,
        }];
        let mut config =
            CalibrationConfig::with_defaults(params, TimeSeries::from_values(vec![1.0])).unwrap();
        config.output.dir = dir.to_path_buf();
        config.strategy = strategy;
        config
    }

    fn small_auto() -> AutoStrategy {
        AutoStrategy {
            min_batches: 3,
            max_batches: 50,
            max_simulations: 30,
            calibration_batches: 1,
            calibration_batch_size: 10,
            min_batch_size: 5,
            max_batch_size: 10,
            fine_tuning_schedule: vec![200, 100, 50, 25, 10],
            batches_per_tier: 1,
            fine_tuning_reserve: 5,
            predictive_exit_fraction: 0.8,
        }
    }

    fn scheduler(config: &CalibrationConfig, fail_every: u64) -> (BatchScheduler, Arc<ShardingWorker>) {
        let worker = Arc::new(ShardingWorker {
            shards: ShardStore::new(&config.output.dir, config.output.compression),
            fail_every,
            seen: Mutex::new(Vec::new()),
        });
        let scheduler =
            BatchScheduler::new(config, Box::new(SequentialDispatcher::new(0)), worker.clone());
        (scheduler, worker)
    }

    fn snapshot(ess: f64, successful: u64, fraction: f64) -> EssSnapshot {
        EssSnapshot {
            batch_number: 1,
            total_sims_successful: successful,
            min_parameter_ess: ess,
            fraction_meeting_target: fraction,
        }
    }

    #[test]
    fn test_decide_calibration_then_predictive() {
        let auto = AutoStrategy::default();
        let mut state = RunState::new_auto();
        assert_eq!(decide_batch(&state, &auto, 200.0), (Phase::Calibration, 1000));

        state.record_batch(1000, 1000);
        state.ess_history.push(snapshot(50.0, 1000, 0.0));
        // 150 ESS missing at 0.05 ESS per sim -> 3000, clamped to 2000
        assert_eq!(decide_batch(&state, &auto, 200.0), (Phase::Predictive, 2000));

        state.ess_history.push(snapshot(100.0, 1000, 0.0));
        // 100 missing at 0.1 per sim -> 1000
        assert_eq!(decide_batch(&state, &auto, 200.0), (Phase::Predictive, 1000));
    }

    #[test]
    fn test_predictive_exits_on_fraction_or_budget() {
        let auto = AutoStrategy::default();
        let mut state = RunState::new_auto();
        state.enter_phase(Phase::Predictive);
        state.record_batch(1000, 1000);

        state.ess_history.push(snapshot(150.0, 1000, 0.8));
        assert_eq!(decide_batch(&state, &auto, 200.0), (Phase::FineTuning(1), 200));

        state.ess_history.push(snapshot(150.0, 1000, 0.1));
        state.total_sims_run = auto.max_simulations - auto.fine_tuning_reserve;
        assert_eq!(decide_batch(&state, &auto, 200.0), (Phase::FineTuning(1), 200));
    }

    #[test]
    fn test_predictive_keeps_reserve() {
        let auto = AutoStrategy::default();
        let mut state = RunState::new_auto();
        state.enter_phase(Phase::Predictive);
        state.total_sims_run = auto.max_simulations - auto.fine_tuning_reserve - 40;
        state.total_sims_successful = state.total_sims_run;
        let (phase, size) = decide_batch(&state, &auto, 200.0);
        assert_eq!(phase, Phase::Predictive);
        assert_eq!(size, 40);
    }

    #[test]
    fn test_fine_tuning_walks_schedule_and_repeats_last_tier() {
        let auto = AutoStrategy::default();
        let mut state = RunState::new_auto();
        state.enter_phase(Phase::FineTuning(1));

        let mut sizes = Vec::new();
        for _ in 0..7 {
            let (phase, size) = decide_batch(&state, &auto, 200.0);
            state.enter_phase(phase);
            state.record_batch(size, size);
            sizes.push(size);
        }
        assert_eq!(sizes, vec![200, 100, 50, 25, 10, 10, 10]);
        assert_eq!(state.phase, Phase::FineTuning(5));
    }

    #[test]
    fn test_decide_stops_when_converged_or_out_of_batches() {
        let auto = AutoStrategy::default();
        let mut state = RunState::new_auto();
        state.converged = true;
        assert_eq!(decide_batch(&state, &auto, 200.0), (Phase::Converged, 0));

        let mut state = RunState::new_auto();
        state.batch_number = auto.max_batches;
        assert_eq!(decide_batch(&state, &auto, 200.0).1, 0);
    }

    #[test]
    fn test_auto_loop_stops_at_ceiling_without_convergence() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), Strategy::Auto(small_auto()));
        let (scheduler, worker) = scheduler(&config, 0);
        let mut monitor = NeverConverges {
            calls: AtomicUsize::new(0),
        };

        let summary = scheduler.run(&mut monitor).unwrap();

        assert_eq!(summary.total_sims_run, 30);
        assert!(!summary.converged);
        assert_eq!(summary.termination, TerminationReason::CeilingReached);
        assert_eq!(summary.batches, 4);
        // No assessment after the ceiling batch
        assert_eq!(monitor.calls.load(Ordering::SeqCst), 3);

        let seen = worker.seen.lock().unwrap().clone();
        assert_eq!(seen, (1..=30).collect::<Vec<_>>());

        let state = StateStore::new(config.state_path()).load().unwrap();
        assert_eq!(state.batch_size_history, vec![10, 10, 5, 5]);
        assert_eq!(state.phase, Phase::FineTuning(1));
        assert_eq!(state.ess_history.len(), 3);
    }

    #[test]
    fn test_convergence_waits_for_min_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut auto = small_auto();
        auto.max_simulations = 1_000;
        let config = config(dir.path(), Strategy::Auto(auto));
        let (scheduler, _) = scheduler(&config, 0);

        let summary = scheduler.run(&mut AlwaysConverges).unwrap();

        assert!(summary.converged);
        assert_eq!(summary.termination, TerminationReason::Converged);
        assert_eq!(summary.batches, 3);
        let state = StateStore::new(config.state_path()).load().unwrap();
        assert_eq!(state.phase, Phase::Converged);
    }

    #[test]
    fn test_fixed_mode_counts_failures() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = Strategy::Fixed(FixedStrategy {
            n_simulations: 10,
            batch_size: Some(4),
        });
        let config = config(dir.path(), strategy);
        let (scheduler, _) = scheduler(&config, 5);

        let summary = scheduler.run(&mut AlwaysConverges).unwrap();

        assert_eq!(summary.termination, TerminationReason::TargetReached);
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.total_sims_run, 10);
        assert_eq!(summary.total_sims_successful, 8);
    }

    #[test]
    fn test_fixed_mode_resume_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = Strategy::Fixed(FixedStrategy {
            n_simulations: 10,
            batch_size: Some(4),
        });
        let config = config(dir.path(), strategy);

        // A previous attempt finished sims 1..=4 and crashed before saving
        let (first, _) = scheduler(&config, 0);
        for sim_id in 1..=4 {
            first.worker.run_task(sim_id);
        }

        let (resumed, worker) = scheduler(&config, 0);
        let summary = resumed.with_resume(true).run(&mut AlwaysConverges).unwrap();
        assert_eq!(*worker.seen.lock().unwrap(), (5..=10).collect::<Vec<_>>());
        assert_eq!(summary.total_sims_run, 10);
        assert_eq!(summary.total_sims_successful, 10);

        // Nothing left to do the second time
        let (again, worker) = scheduler(&config, 0);
        let summary = again.with_resume(true).run(&mut AlwaysConverges).unwrap();
        assert!(worker.seen.lock().unwrap().is_empty());
        assert_eq!(summary.total_sims_run, 10);
        assert_eq!(summary.batches, 2);
    }

    #[test]
    fn test_fixed_resume_after_failures_stays_within_target() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = Strategy::Fixed(FixedStrategy {
            n_simulations: 10,
            batch_size: Some(4),
        });
        let config = config(dir.path(), strategy);

        // Ids 5 and 10 fail without writing a shard
        let (first, _) = scheduler(&config, 5);
        let summary = first.run(&mut AlwaysConverges).unwrap();
        assert_eq!(summary.total_sims_run, 10);
        assert_eq!(summary.total_sims_successful, 8);

        for _ in 0..2 {
            let (resumed, worker) = scheduler(&config, 5);
            let summary = resumed.with_resume(true).run(&mut AlwaysConverges).unwrap();
            assert_eq!(*worker.seen.lock().unwrap(), vec![5, 10]);
            assert_eq!(summary.total_sims_run, 10);
            assert_eq!(summary.total_sims_successful, 8);

            let state = StateStore::new(config.state_path()).load().unwrap();
            assert!(state.total_sims_run <= 10);
        }
    }

    #[test]
    fn test_checkpoint_of_other_mode_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), Strategy::Auto(small_auto()));
        let mut fixed = RunState::new_fixed(99);
        fixed.record_batch(99, 99);
        StateStore::new(config.state_path()).save(&mut fixed).unwrap();

        let (scheduler, worker) = scheduler(&config, 0);
        let summary = scheduler
            .with_resume(true)
            .run(&mut NeverConverges { calls: AtomicUsize::new(0) })
            .unwrap();
        assert_eq!(summary.mode, Mode::Auto);
        assert_eq!(worker.seen.lock().unwrap()[0], 1);
    }
}
