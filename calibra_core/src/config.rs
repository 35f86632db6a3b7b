//! Calibration configuration.
//!
//! Configuration arrives as a JSON document deserialised into `RawConfig`,
//! where every section is optional. `CalibrationConfig::merge_defaults`
//! turns it into the fully populated, strongly typed `CalibrationConfig`
//! that is threaded explicitly through every component, and `validate`
//! rejects anything the engine cannot run with.

use crate::aggregate::{AggregationMode, TableFormat};
use crate::convergence::{ConvergenceTier, EssMethod};
use crate::error::{CalibError, Result};
use crate::storage::{self, Compression};
use calibra_env::{LikelihoodComponent, LikelihoodConfig, TimeSeries};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

// =============================================================================
// STRATEGY
// =============================================================================

/// How many simulations to run and how to batch them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Strategy {
    /// A single target count set up front.
    Fixed(FixedStrategy),
    /// Phase-driven adaptive batching until convergence or the ceiling.
    Auto(AutoStrategy),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedStrategy {
    /// Target number of simulations
    pub n_simulations: u64,

    /// Simulations per batch (all pending in one batch when absent)
    #[serde(default)]
    pub batch_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoStrategy {
    /// Convergence is never declared before this many batches
    pub min_batches: u64,

    /// Hard cap on the number of batches
    pub max_batches: u64,

    /// Simulation ceiling
    pub max_simulations: u64,

    /// Batches spent in the calibration phase
    pub calibration_batches: u64,

    /// Batch size during calibration
    pub calibration_batch_size: u64,

    /// Lower clamp for projected predictive batches
    pub min_batch_size: u64,

    /// Upper clamp for projected predictive batches
    pub max_batch_size: u64,

    /// Descending batch sizes for fine-tuning tiers 1..=5
    pub fine_tuning_schedule: Vec<u64>,

    /// Batches run at each fine-tuning tier before stepping down
    pub batches_per_tier: u64,

    /// Simulations held back from the predictive phase for fine-tuning
    pub fine_tuning_reserve: u64,

    /// Fraction of parameters meeting the ESS target that ends the
    /// predictive phase
    pub predictive_exit_fraction: f64,
}

impl Default for AutoStrategy {
    fn default() -> Self {
        Self {
            min_batches: 3,
            max_batches: 50,
            max_simulations: 10_000,
            calibration_batches: 1,
            calibration_batch_size: 1_000,
            min_batch_size: 100,
            max_batch_size: 2_000,
            fine_tuning_schedule: vec![200, 100, 50, 25, 10],
            batches_per_tier: 1,
            fine_tuning_reserve: 250,
            predictive_exit_fraction: 0.8,
        }
    }
}

impl Strategy {
    /// The simulation ceiling implied by the strategy.
    pub fn max_simulations(&self) -> u64 {
        match self {
            Strategy::Fixed(f) => f.n_simulations,
            Strategy::Auto(a) => a.max_simulations,
        }
    }
}

// =============================================================================
// PARAMETERS
// =============================================================================

/// Prior distribution of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dist", rename_all = "snake_case")]
pub enum Prior {
    Uniform { low: f64, high: f64 },
    Normal { mean: f64, sd: f64 },
    LogNormal { mu: f64, sigma: f64 },
    Fixed { value: f64 },
}

impl Prior {
    /// Value used when the parameter is held fixed.
    pub fn center(&self) -> f64 {
        match self {
            Prior::Uniform { low, high } => 0.5 * (low + high),
            Prior::Normal { mean, .. } => *mean,
            Prior::LogNormal { mu, .. } => mu.exp(),
            Prior::Fixed { value } => *value,
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        let ok = match self {
            Prior::Uniform { low, high } => low.is_finite() && high.is_finite() && low < high,
            Prior::Normal { mean, sd } => mean.is_finite() && sd.is_finite() && *sd > 0.0,
            Prior::LogNormal { mu, sigma } => mu.is_finite() && sigma.is_finite() && *sigma > 0.0,
            Prior::Fixed { value } => value.is_finite(),
        };
        if ok {
            Ok(())
        } else {
            Err(CalibError::config(format!("parameters.{}: invalid prior {:?}", name, self)))
        }
    }
}

/// One model parameter: either sampled from its prior or held fixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub prior: Prior,

    /// Sample this parameter (true) or hold it at `fixed_value`/the prior center
    #[serde(default = "default_true")]
    pub estimate: bool,

    #[serde(default)]
    pub fixed_value: Option<f64>,
}

impl ParameterSpec {
    /// True when the parameter is drawn per task.
    pub fn is_estimated(&self) -> bool {
        self.estimate && !matches!(self.prior, Prior::Fixed { .. })
    }

    /// Value used when the parameter is not estimated.
    pub fn held_value(&self) -> f64 {
        self.fixed_value.unwrap_or_else(|| self.prior.center())
    }
}

fn default_true() -> bool {
    true
}

/// Which simulation model to run and its static settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,

    #[serde(default)]
    pub settings: BTreeMap<String, f64>,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            name: "logistic".to_string(),
            settings: BTreeMap::new(),
        }
    }
}

impl ModelSpec {
    /// Reads a numeric setting with a default.
    pub fn setting(&self, key: &str, default: f64) -> f64 {
        self.settings.get(key).copied().unwrap_or(default)
    }
}

// =============================================================================
// CONVERGENCE
// =============================================================================

/// Convergence targets and weighting knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Per-parameter ESS target
    pub parameter_ess_target: f64,

    /// Fraction of parameters that must meet the ESS target
    pub required_fraction: f64,

    pub ess_method: EssMethod,

    /// Subset tiers, searched in the given order
    pub tiers: Vec<ConvergenceTier>,

    pub min_subset_size: usize,
    pub max_subset_size: usize,
    pub subset_size_step: usize,

    /// Size of the top-likelihood subset used when no tier converges
    pub fallback_subset_size: usize,

    /// Tukey fence multiplier
    pub outlier_multiplier: f64,

    /// ΔAIC cap for `weight_retained`
    pub retained_cap: f64,

    /// ΔAIC cap for `weight_best` and subset metrics
    pub best_cap: f64,

    /// ESS targeted by tempered weighting (defaults to the parameter target)
    pub tempered_target_ess: Option<f64>,

    /// Floor applied to tempered weights before normalisation
    pub weight_floor: f64,

    /// Also require a converged best subset before stopping
    pub require_subset_convergence: bool,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            parameter_ess_target: 200.0,
            required_fraction: 1.0,
            ess_method: EssMethod::DesignEffect,
            tiers: vec![
                ConvergenceTier::new("strict", 500.0, 0.6, 1.0),
                ConvergenceTier::new("standard", 200.0, 0.5, 1.5),
                ConvergenceTier::new("relaxed", 100.0, 0.4, 2.0),
            ],
            min_subset_size: 50,
            max_subset_size: 2_000,
            subset_size_step: 50,
            fallback_subset_size: 200,
            outlier_multiplier: 1.5,
            retained_cap: 50.0,
            best_cap: 10.0,
            tempered_target_ess: None,
            weight_floor: 1e-300,
            require_subset_convergence: false,
        }
    }
}

impl ConvergenceConfig {
    /// Effective tempered ESS target.
    pub fn tempered_target(&self) -> f64 {
        self.tempered_target_ess.unwrap_or(self.parameter_ess_target)
    }
}

// =============================================================================
// BACKEND
// =============================================================================

/// How tasks are split across local pool threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    /// Contiguous chunks, one per worker
    Static,
    /// Per-task work stealing
    #[default]
    Dynamic,
}

/// Execution backend.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Executor {
    #[default]
    Sequential,
    LocalPool {
        workers: usize,
        #[serde(default)]
        distribution: Distribution,
    },
    ProcessPool {
        workers: usize,
        /// Worker executable (defaults to the running binary)
        #[serde(default)]
        program: Option<PathBuf>,
    },
    Remote {
        /// Submit command template (see `calibra_env::CommandCluster`)
        submit_command: Vec<String>,
        #[serde(default)]
        status_command: Option<Vec<String>>,
        #[serde(default = "default_chunk_size")]
        chunk_size: usize,
        #[serde(default = "default_poll_interval")]
        poll_interval_secs: u64,
        /// Shared directory for payloads and outcomes (defaults to `<output>/staging`)
        #[serde(default)]
        staging_dir: Option<PathBuf>,
        /// Worker executable on the compute nodes
        #[serde(default)]
        program: Option<PathBuf>,
    },
}

fn default_chunk_size() -> usize {
    50
}

fn default_poll_interval() -> u64 {
    10
}

impl Executor {
    /// Degree of parallelism requested.
    pub fn workers(&self) -> usize {
        match self {
            Executor::Sequential => 1,
            Executor::LocalPool { workers, .. } | Executor::ProcessPool { workers, .. } => *workers,
            Executor::Remote { .. } => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Executor::Sequential => "sequential",
            Executor::LocalPool { .. } => "local_pool",
            Executor::ProcessPool { .. } => "process_pool",
            Executor::Remote { .. } => "remote",
        }
    }
}

/// Backend selection and resource parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub executor: Executor,
    pub memory_per_task_mb: u64,
    pub wall_clock_secs: u64,

    /// Log progress every N completed tasks (0 = silent)
    pub progress_every: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            executor: Executor::Sequential,
            memory_per_task_mb: 512,
            wall_clock_secs: 24 * 3600,
            progress_every: 100,
        }
    }
}

// =============================================================================
// OUTPUT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub format: TableFormat,
    pub compression: Compression,
    pub aggregation: AggregationMode,

    /// Keep per-task shards after consolidation
    pub keep_shards: bool,

    /// Also persist one simulated series per task
    pub write_timeseries: bool,

    pub low_disk_warning_mb: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("calibra_output"),
            format: TableFormat::Csv,
            compression: Compression::None,
            aggregation: AggregationMode::Streaming,
            keep_shards: false,
            write_timeseries: false,
            low_disk_warning_mb: 1024,
        }
    }
}

// =============================================================================
// RAW + MERGED CONFIG
// =============================================================================

/// Configuration as written by the user; every section may be omitted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub strategy: Option<Strategy>,
    pub iteration_count: Option<u32>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    pub model: Option<ModelSpec>,
    pub likelihood: Option<LikelihoodConfig>,
    pub observed: Option<TimeSeries>,
    pub observed_path: Option<PathBuf>,
    pub convergence: Option<ConvergenceConfig>,
    pub backend: Option<BackendConfig>,
    pub output: Option<OutputConfig>,
    pub release_every: Option<u32>,
    pub resume: Option<bool>,
}

/// Fully merged and validated calibration configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub strategy: Strategy,
    pub iteration_count: u32,
    pub parameters: Vec<ParameterSpec>,
    pub model: ModelSpec,
    pub likelihood: LikelihoodConfig,
    pub observed: TimeSeries,
    pub convergence: ConvergenceConfig,
    pub backend: BackendConfig,
    pub output: OutputConfig,

    /// Release model resources every N iterations
    pub release_every: u32,

    pub resume: bool,
}

impl CalibrationConfig {
    /// Loads, merges and validates a configuration file.
    ///
    /// Relative paths inside the file resolve against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| CalibError::config(format!("cannot read {}: {}", path.display(), e)))?;
        let raw: RawConfig = serde_json::from_slice(&bytes)
            .map_err(|e| CalibError::config(format!("{}: {}", path.display(), e)))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let config = Self::merge_defaults(raw, base_dir)?;
        config.validate()?;
        Ok(config)
    }

    /// Fills every omitted section with its documented default.
    ///
    /// Fails only when something without a sensible default is missing
    /// (parameters, observed data) or the observed file cannot be read.
    pub fn merge_defaults(raw: RawConfig, base_dir: &Path) -> Result<Self> {
        if raw.parameters.is_empty() {
            return Err(CalibError::config("parameters: at least one parameter is required"));
        }

        let observed = match (raw.observed, raw.observed_path) {
            (Some(series), None) => series,
            (None, Some(rel)) => {
                let path = resolve(base_dir, &rel);
                let bytes = storage::read_all(&path).map_err(|e| {
                    CalibError::config(format!("observed_path {}: {}", path.display(), e))
                })?;
                serde_json::from_slice(&bytes).map_err(|e| {
                    CalibError::config(format!("observed_path {}: {}", path.display(), e))
                })?
            }
            (Some(_), Some(_)) => {
                return Err(CalibError::config("set only one of observed and observed_path"))
            }
            (None, None) => return Err(CalibError::config("observed: observed data is required")),
        };

        let mut output = raw.output.unwrap_or_default();
        output.dir = resolve(base_dir, &output.dir);

        let mut backend = raw.backend.unwrap_or_default();
        if let Executor::Remote { staging_dir: Some(dir), .. } = &mut backend.executor {
            *dir = resolve(base_dir, dir);
        }

        Ok(Self {
            strategy: raw.strategy.unwrap_or(Strategy::Auto(AutoStrategy::default())),
            iteration_count: raw.iteration_count.unwrap_or(1),
            parameters: raw.parameters,
            model: raw.model.unwrap_or_default(),
            likelihood: raw.likelihood.unwrap_or_default(),
            observed,
            convergence: raw.convergence.unwrap_or_default(),
            backend,
            output,
            release_every: raw.release_every.unwrap_or(10),
            resume: raw.resume.unwrap_or(false),
        })
    }

    /// Checks every control value; the error names the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.iteration_count == 0 {
            return Err(CalibError::config("iteration_count must be at least 1"));
        }
        if self.release_every == 0 {
            return Err(CalibError::config("release_every must be at least 1"));
        }

        self.validate_strategy()?;

        let mut names = HashSet::new();
        for spec in &self.parameters {
            if spec.name.is_empty() {
                return Err(CalibError::config("parameters: empty parameter name"));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(CalibError::config(format!("parameters: duplicate name {}", spec.name)));
            }
            spec.prior.validate(&spec.name)?;
        }
        if !self.parameters.iter().any(ParameterSpec::is_estimated) {
            return Err(CalibError::config("parameters: at least one parameter must be estimated"));
        }

        if self.observed.is_empty() || !self.observed.is_well_formed() {
            return Err(CalibError::config("observed: series must be non-empty with finite values"));
        }

        if self.likelihood.enabled_components().next().is_none() {
            return Err(CalibError::config("likelihood: no enabled component"));
        }
        for c in self.likelihood.enabled_components() {
            if !(c.weight.is_finite() && c.weight >= 0.0) {
                return Err(CalibError::config(format!("likelihood: invalid weight {}", c.weight)));
            }
            if !(c.sigma.is_finite() && c.sigma > 0.0) {
                return Err(CalibError::config(format!("likelihood: invalid sigma {}", c.sigma)));
            }
        }

        self.validate_convergence()?;

        if self.backend.executor.workers() == 0 {
            return Err(CalibError::config("backend.executor.workers must be at least 1"));
        }
        if let Executor::Remote { submit_command, chunk_size, .. } = &self.backend.executor {
            if submit_command.is_empty() {
                return Err(CalibError::config("backend.executor.submit_command is empty"));
            }
            if *chunk_size == 0 {
                return Err(CalibError::config("backend.executor.chunk_size must be at least 1"));
            }
        }
        Ok(())
    }

    fn validate_strategy(&self) -> Result<()> {
        match &self.strategy {
            Strategy::Fixed(f) => {
                if f.n_simulations == 0 {
                    return Err(CalibError::config("strategy.n_simulations must be at least 1"));
                }
                if f.batch_size == Some(0) {
                    return Err(CalibError::config("strategy.batch_size must be at least 1"));
                }
            }
            Strategy::Auto(a) => {
                if a.max_simulations == 0 {
                    return Err(CalibError::config("strategy.max_simulations must be at least 1"));
                }
                if a.max_batches == 0 || a.min_batches > a.max_batches {
                    return Err(CalibError::config(format!(
                        "strategy: min_batches ({}) must not exceed max_batches ({})",
                        a.min_batches, a.max_batches
                    )));
                }
                if a.calibration_batch_size == 0 {
                    return Err(CalibError::config("strategy.calibration_batch_size must be at least 1"));
                }
                if a.min_batch_size == 0 || a.min_batch_size > a.max_batch_size {
                    return Err(CalibError::config("strategy: need 0 < min_batch_size <= max_batch_size"));
                }
                if a.fine_tuning_schedule.len() != 5 {
                    return Err(CalibError::config("strategy.fine_tuning_schedule must have 5 tiers"));
                }
                if a.fine_tuning_schedule.iter().any(|&s| s == 0)
                    || a.fine_tuning_schedule.windows(2).any(|w| w[1] > w[0])
                {
                    return Err(CalibError::config(
                        "strategy.fine_tuning_schedule must be positive and non-increasing",
                    ));
                }
                if a.batches_per_tier == 0 {
                    return Err(CalibError::config("strategy.batches_per_tier must be at least 1"));
                }
                if !(a.predictive_exit_fraction > 0.0 && a.predictive_exit_fraction <= 1.0) {
                    return Err(CalibError::config("strategy.predictive_exit_fraction must be in (0, 1]"));
                }
            }
        }
        Ok(())
    }

    fn validate_convergence(&self) -> Result<()> {
        let c = &self.convergence;
        if !(c.parameter_ess_target.is_finite() && c.parameter_ess_target > 0.0) {
            return Err(CalibError::config("convergence.parameter_ess_target must be positive"));
        }
        if !(c.required_fraction > 0.0 && c.required_fraction <= 1.0) {
            return Err(CalibError::config("convergence.required_fraction must be in (0, 1]"));
        }
        if c.tiers.is_empty() {
            return Err(CalibError::config("convergence.tiers must not be empty"));
        }
        let mut names = HashSet::new();
        for tier in &c.tiers {
            if !names.insert(tier.name.as_str()) {
                return Err(CalibError::config(format!("convergence.tiers: duplicate {}", tier.name)));
            }
        }
        if c.min_subset_size < 2 || c.min_subset_size > c.max_subset_size {
            return Err(CalibError::config(
                "convergence: need 2 <= min_subset_size <= max_subset_size",
            ));
        }
        if c.subset_size_step == 0 || c.fallback_subset_size == 0 {
            return Err(CalibError::config("convergence: subset sizes must be at least 1"));
        }
        if !(c.outlier_multiplier > 0.0) || !(c.retained_cap > 0.0) || !(c.best_cap > 0.0) {
            return Err(CalibError::config(
                "convergence: outlier_multiplier and caps must be positive",
            ));
        }
        if !(c.tempered_target() > 0.0) {
            return Err(CalibError::config("convergence.tempered_target_ess must be positive"));
        }
        Ok(())
    }

    /// Names of the estimated parameters, in declaration order.
    pub fn estimated_names(&self) -> Vec<String> {
        self.parameters
            .iter()
            .filter(|p| p.is_estimated())
            .map(|p| p.name.clone())
            .collect()
    }

    /// Simulation ceiling.
    pub fn max_simulations(&self) -> u64 {
        self.strategy.max_simulations()
    }

    /// Path of the run-state checkpoint.
    pub fn state_path(&self) -> PathBuf {
        self.output.dir.join("run_state.json")
    }

    /// Path of the consolidated result table.
    pub fn consolidated_path(&self) -> PathBuf {
        self.output.dir.join(format!(
            "consolidated.{}{}",
            self.output.format.extension(),
            self.output.compression.suffix()
        ))
    }
}

impl CalibrationConfig {
    /// Minimal config for embedding: one Gaussian component, the given
    /// parameters and observed series, everything else defaulted.
    pub fn with_defaults(parameters: Vec<ParameterSpec>, observed: TimeSeries) -> Result<Self> {
        let raw = RawConfig {
            parameters,
            observed: Some(observed),
            likelihood: Some(LikelihoodConfig {
                components: vec![LikelihoodComponent::gaussian(1.0)],
                failure_sentinel: -1e10,
            }),
            ..Default::default()
        };
        Self::merge_defaults(raw, Path::new("."))
    }
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "parameters": [
                {"name": "r", "prior": {"dist": "uniform", "low": 0.1, "high": 0.9}},
                {"name": "k", "prior": {"dist": "fixed", "value": 100.0}}
            ],
            "observed": {"times": [0, 1, 2], "values": [1.0, 2.0, 4.0]}
        }"#
    }

    #[test]
    fn test_merge_defaults_fills_sections() {
        let raw: RawConfig = serde_json::from_str(minimal_json()).unwrap();
        let config = CalibrationConfig::merge_defaults(raw, Path::new("/work")).unwrap();
        config.validate().unwrap();

        assert!(matches!(config.strategy, Strategy::Auto(_)));
        assert_eq!(config.iteration_count, 1);
        assert_eq!(config.release_every, 10);
        assert_eq!(config.output.dir, PathBuf::from("/work/calibra_output"));
        assert_eq!(config.estimated_names(), vec!["r".to_string()]);
        assert_eq!(config.convergence.tempered_target(), 200.0);
    }

    #[test]
    fn test_partial_sections_keep_field_defaults() {
        let json = r#"{
            "strategy": {"mode": "auto", "max_simulations": 500},
            "parameters": [{"name": "r", "prior": {"dist": "normal", "mean": 0.0, "sd": 1.0}}],
            "observed": {"times": [0], "values": [1.0]},
            "backend": {"executor": {"type": "local_pool", "workers": 4}}
        }"#;
        let raw: RawConfig = serde_json::from_str(json).unwrap();
        let config = CalibrationConfig::merge_defaults(raw, Path::new(".")).unwrap();
        config.validate().unwrap();

        match &config.strategy {
            Strategy::Auto(a) => {
                assert_eq!(a.max_simulations, 500);
                assert_eq!(a.fine_tuning_reserve, 250);
                assert_eq!(a.fine_tuning_schedule.len(), 5);
            }
            other => panic!("unexpected strategy {:?}", other),
        }
        assert_eq!(config.backend.executor.workers(), 4);
        assert_eq!(config.backend.executor, Executor::LocalPool { workers: 4, distribution: Distribution::Dynamic });
    }

    #[test]
    fn test_missing_parameters_is_fatal() {
        let raw: RawConfig = serde_json::from_str(r#"{"observed": {"times": [0], "values": [1]}}"#).unwrap();
        let err = CalibrationConfig::merge_defaults(raw, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("parameters"));
    }

    #[test]
    fn test_invalid_control_values_rejected() {
        let raw: RawConfig = serde_json::from_str(minimal_json()).unwrap();
        let mut config = CalibrationConfig::merge_defaults(raw, Path::new(".")).unwrap();

        config.iteration_count = 0;
        assert!(config.validate().is_err());
        config.iteration_count = 2;

        config.strategy = Strategy::Auto(AutoStrategy {
            fine_tuning_schedule: vec![10, 20, 5, 5, 1],
            ..AutoStrategy::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("fine_tuning_schedule"));
    }

    #[test]
    fn test_only_fixed_parameters_rejected() {
        let observed = TimeSeries::from_values(vec![1.0]);
        let config = CalibrationConfig::with_defaults(
            vec![ParameterSpec {
                name: "k".into(),
                prior: Prior::Uniform { low: 0.0, high: 1.0 },
                estimate: false,
                fixed_value: None,
            }],
            observed,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_top_level_field_rejected() {
        let json = r#"{"parameters": [], "bogus": 1}"#;
        assert!(serde_json::from_str::<RawConfig>(json).is_err());
    }

    #[test]
    fn test_observed_path_resolves_relative_to_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("obs.json"),
            r#"{"times": [0, 1], "values": [3.0, 5.0]}"#,
        )
        .unwrap();
        let config_path = dir.path().join("calib.json");
        std::fs::write(
            &config_path,
            r#"{
                "strategy": {"mode": "fixed", "n_simulations": 10},
                "parameters": [{"name": "r", "prior": {"dist": "uniform", "low": 0, "high": 1}}],
                "observed_path": "obs.json"
            }"#,
        )
        .unwrap();

        let config = CalibrationConfig::load(&config_path).unwrap();
        assert_eq!(config.observed.values, vec![3.0, 5.0]);
        assert_eq!(config.max_simulations(), 10);
        assert!(config.consolidated_path().ends_with("consolidated.csv"));
    }
}
