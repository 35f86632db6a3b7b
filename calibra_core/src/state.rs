//! Run-state checkpoints.
//!
//! `RunState` is mutated once per completed batch and persisted right away
//! through `StateStore::save`, which never leaves a partially written file
//! behind. `StateStore::load` is deliberately forgiving: a checkpoint that
//! fails validation is reported and dropped so the caller starts fresh.

use crate::error::{CalibError, Result};
use crate::storage::{self, Compression};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Current checkpoint schema.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Calibration strategy of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Fixed,
    Auto,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Fixed => write!(f, "fixed"),
            Mode::Auto => write!(f, "auto"),
        }
    }
}

/// Scheduler phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Phase {
    #[default]
    Calibration,
    Predictive,
    /// Fine-tuning tier 1..=5
    FineTuning(u8),
    Converged,
}

/// Number of fine-tuning tiers.
pub const FINE_TUNING_TIERS: u8 = 5;

impl Phase {
    pub fn name(&self) -> String {
        match self {
            Phase::Calibration => "calibration".to_string(),
            Phase::Predictive => "predictive".to_string(),
            Phase::FineTuning(tier) => format!("fine_tuning_tier_{}", tier),
            Phase::Converged => "converged".to_string(),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "calibration" => Ok(Phase::Calibration),
            "predictive" => Ok(Phase::Predictive),
            "converged" => Ok(Phase::Converged),
            other => {
                let tier = other
                    .strip_prefix("fine_tuning_tier_")
                    .and_then(|t| t.parse::<u8>().ok())
                    .filter(|t| (1..=FINE_TUNING_TIERS).contains(t))
                    .ok_or_else(|| format!("Unknown phase: {}", other))?;
                Ok(Phase::FineTuning(tier))
            }
        }
    }
}

impl TryFrom<String> for Phase {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Phase> for String {
    fn from(phase: Phase) -> Self {
        phase.name()
    }
}

/// One ESS assessment taken after a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EssSnapshot {
    pub batch_number: u64,
    pub total_sims_successful: u64,

    /// Smallest per-parameter ESS (NaN when it could not be computed)
    #[serde(with = "nan_as_null")]
    pub min_parameter_ess: f64,

    pub fraction_meeting_target: f64,
}

/// Persistent state of a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    #[serde(default = "Uuid::new_v4")]
    pub run_id: Uuid,

    pub mode: Mode,

    #[serde(default)]
    pub phase: Phase,

    pub batch_number: u64,
    pub total_sims_run: u64,
    pub total_sims_successful: u64,

    #[serde(default)]
    pub batch_success_rate_history: Vec<f64>,

    #[serde(default)]
    pub batch_size_history: Vec<u64>,

    /// Batches completed in the current phase
    #[serde(default)]
    pub phase_batch_count: u64,

    /// Target count (fixed mode only)
    #[serde(default)]
    pub fixed_target: Option<u64>,

    #[serde(default)]
    pub converged: bool,

    #[serde(default)]
    pub ess_history: Vec<EssSnapshot>,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_schema_version() -> u32 {
    STATE_SCHEMA_VERSION
}

impl RunState {
    /// Fresh fixed-mode state.
    pub fn new_fixed(target: u64) -> Self {
        Self {
            fixed_target: Some(target),
            ..Self::new(Mode::Fixed)
        }
    }

    /// Fresh auto-mode state.
    pub fn new_auto() -> Self {
        Self::new(Mode::Auto)
    }

    fn new(mode: Mode) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            run_id: Uuid::new_v4(),
            mode,
            phase: Phase::Calibration,
            batch_number: 0,
            total_sims_run: 0,
            total_sims_successful: 0,
            batch_success_rate_history: Vec::new(),
            batch_size_history: Vec::new(),
            phase_batch_count: 0,
            fixed_target: None,
            converged: false,
            ess_history: Vec::new(),
            updated_at: None,
        }
    }

    /// Switches phase; the phase-local batch counter restarts on change.
    ///
    /// Returns true when the phase actually changed.
    pub fn enter_phase(&mut self, phase: Phase) -> bool {
        if self.phase == phase {
            return false;
        }
        info!("Phase transition: {} -> {}", self.phase, phase);
        self.phase = phase;
        self.phase_batch_count = 0;
        true
    }

    /// Records a completed batch of `size` dispatched tasks.
    pub fn record_batch(&mut self, size: u64, successes: u64) {
        let successes = successes.min(size);
        self.batch_number += 1;
        self.phase_batch_count += 1;
        self.total_sims_run += size;
        self.total_sims_successful += successes;
        self.batch_size_history.push(size);
        self.batch_success_rate_history.push(if size == 0 {
            0.0
        } else {
            successes as f64 / size as f64
        });
    }

    /// First `sim_id` of the next contiguous batch.
    pub fn next_sim_id(&self) -> u64 {
        self.total_sims_run + 1
    }

    /// Mean batch success rate (1.0 before any batch).
    pub fn mean_success_rate(&self) -> f64 {
        if self.batch_success_rate_history.is_empty() {
            return 1.0;
        }
        self.batch_success_rate_history.iter().sum::<f64>()
            / self.batch_success_rate_history.len() as f64
    }

    /// Latest ESS assessment, if any.
    pub fn latest_ess(&self) -> Option<&EssSnapshot> {
        self.ess_history.last()
    }

    /// True once no further batch may run.
    pub fn is_terminal(&self, max_simulations: u64) -> bool {
        self.converged || self.total_sims_run >= max_simulations
    }

    fn check_invariants(&self) -> std::result::Result<(), String> {
        if self.total_sims_successful > self.total_sims_run {
            return Err(format!(
                "total_sims_successful ({}) exceeds total_sims_run ({})",
                self.total_sims_successful, self.total_sims_run
            ));
        }
        if self.batch_success_rate_history.iter().any(|r| !(0.0..=1.0).contains(r)) {
            return Err("batch_success_rate_history holds a rate outside [0, 1]".to_string());
        }
        if self.mode == Mode::Fixed && self.phase != Phase::Calibration && self.phase != Phase::Converged {
            return Err(format!("fixed-mode run cannot be in phase {}", self.phase));
        }
        Ok(())
    }
}

// =============================================================================
// STATE STORE
// =============================================================================

/// Required checkpoint fields and the JSON type they must have.
const REQUIRED_COUNTS: [&str; 3] = ["batch_number", "total_sims_run", "total_sims_successful"];

/// Optional count fields that must be non-negative integers when present.
const OPTIONAL_COUNTS: [&str; 2] = ["phase_batch_count", "schema_version"];

/// Atomic, validating persistence of `RunState`.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    low_disk_warning_mb: u64,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            low_disk_warning_mb: 1024,
        }
    }

    pub fn with_low_disk_warning(mut self, mb: u64) -> Self {
        self.low_disk_warning_mb = mb;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persists `state` atomically, stamping `updated_at`.
    pub fn save(&self, state: &mut RunState) -> Result<()> {
        state.updated_at = Some(Utc::now());
        storage::check_disk_space(&self.path, self.low_disk_warning_mb);
        let bytes = serde_json::to_vec_pretty(state)?;
        storage::atomic_write_bytes(&self.path, &bytes, Compression::None)?;
        Ok(())
    }

    /// Loads and validates the checkpoint.
    ///
    /// Returns `None` (after logging a warning) when the file is missing,
    /// unreadable or invalid; the caller starts a fresh run.
    pub fn load(&self) -> Option<RunState> {
        if !self.path.exists() {
            info!("No checkpoint at {}", self.path.display());
            return None;
        }
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) => {
                warn!("Checkpoint {} unreadable ({}); starting fresh", self.path.display(), e);
                return None;
            }
        };
        match parse_checkpoint(&bytes) {
            Ok(state) => {
                info!(
                    "Restored checkpoint: batch={} sims_run={} phase={}",
                    state.batch_number, state.total_sims_run, state.phase
                );
                Some(state)
            }
            Err(reason) => {
                warn!("Checkpoint {} invalid ({}); starting fresh", self.path.display(), reason);
                None
            }
        }
    }
}

/// Validates raw checkpoint bytes and fills optional-field defaults.
pub fn parse_checkpoint(bytes: &[u8]) -> std::result::Result<RunState, String> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| format!("not JSON: {}", e))?;
    let obj = value.as_object().ok_or("checkpoint is not a JSON object")?;

    match obj.get("mode").and_then(Value::as_str) {
        Some("fixed") | Some("auto") => {}
        Some(other) => return Err(format!("mode must be fixed or auto, got {}", other)),
        None => return Err("missing field mode".to_string()),
    }
    for field in REQUIRED_COUNTS {
        match obj.get(field) {
            Some(v) if v.as_u64().is_some() => {}
            Some(v) => return Err(format!("{} must be a non-negative integer, got {}", field, v)),
            None => return Err(format!("missing field {}", field)),
        }
    }
    for field in OPTIONAL_COUNTS {
        if let Some(v) = obj.get(field) {
            if v.as_u64().is_none() {
                return Err(format!("{} must be a non-negative integer, got {}", field, v));
            }
        }
    }
    if let Some(target) = obj.get("fixed_target") {
        if !target.is_null() && target.as_u64().is_none() {
            return Err(format!("fixed_target must be a non-negative integer, got {}", target));
        }
    }

    let state: RunState = serde_json::from_value(value).map_err(|e| e.to_string())?;
    state.check_invariants()?;
    Ok(state)
}

// =============================================================================
// RUN LOCK
// =============================================================================

/// Advisory lock on an output directory.
///
/// Two runs writing the same checkpoint would corrupt each other's
/// progress. The lock is a `create_new` marker file removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub const FILE_NAME: &'static str = ".calibra.lock";

    /// Acquires the lock for `output_dir`.
    pub fn acquire(output_dir: &Path) -> Result<Self> {
        fs::create_dir_all(output_dir)?;
        let path = output_dir.join(Self::FILE_NAME);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let payload = serde_json::json!({
                    "pid": std::process::id(),
                    "acquired_at": Utc::now().to_rfc3339(),
                });
                let _ = writeln!(file, "{}", payload);
                let _ = file.sync_all();
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(CalibError::Lock(path)),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes a stale lock left behind by a crashed run.
    pub fn force_release(output_dir: &Path) -> Result<bool> {
        let path = output_dir.join(Self::FILE_NAME);
        match fs::remove_file(&path) {
            Ok(()) => {
                warn!("Removed stale lock {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Serialises non-finite floats as `null` (JSON has no NaN).
pub(crate) mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> RunState {
        let mut state = RunState::new_auto();
        state.record_batch(100, 97);
        state.enter_phase(Phase::Predictive);
        state.record_batch(50, 50);
        state.ess_history.push(EssSnapshot {
            batch_number: 2,
            total_sims_successful: 147,
            min_parameter_ess: 42.5,
            fraction_meeting_target: 0.5,
        });
        state
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("run_state.json"));

        let mut state = sample_state();
        store.save(&mut state).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded, state);
        assert_eq!(loaded.phase, Phase::Predictive);
        assert_eq!(loaded.phase_batch_count, 1);
    }

    #[test]
    fn test_missing_optional_fields_get_defaults() {
        let json = br#"{"mode": "auto", "batch_number": 3, "total_sims_run": 300, "total_sims_successful": 290}"#;
        let state = parse_checkpoint(json).unwrap();

        assert_eq!(state.phase_batch_count, 0);
        assert_eq!(state.phase, Phase::Calibration);
        assert!(state.batch_success_rate_history.is_empty());
        assert!(state.ess_history.is_empty());
        assert!(!state.converged);
        assert_eq!(state.schema_version, STATE_SCHEMA_VERSION);
    }

    #[test]
    fn test_invalid_checkpoints_rejected() {
        let cases: [&[u8]; 6] = [
            b"not json",
            br#"{"mode": "turbo", "batch_number": 1, "total_sims_run": 1, "total_sims_successful": 1}"#,
            br#"{"mode": "auto", "batch_number": -1, "total_sims_run": 1, "total_sims_successful": 1}"#,
            br#"{"mode": "auto", "batch_number": 1, "total_sims_successful": 1}"#,
            br#"{"mode": "auto", "batch_number": 1, "total_sims_run": 1, "total_sims_successful": 5}"#,
            br#"{"mode": "auto", "batch_number": 1, "total_sims_run": 1, "total_sims_successful": 1, "phase": "warp"}"#,
        ];
        for case in cases {
            assert!(parse_checkpoint(case).is_err(), "accepted {}", String::from_utf8_lossy(case));
        }
    }

    #[test]
    fn test_load_invalid_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_state.json");
        fs::write(&path, b"{\"mode\": \"auto\"}").unwrap();

        assert!(StateStore::new(&path).load().is_none());
    }

    #[test]
    fn test_phase_transition_resets_counter() {
        let mut state = RunState::new_auto();
        state.record_batch(10, 10);
        state.record_batch(10, 10);
        assert_eq!(state.phase_batch_count, 2);

        assert!(!state.enter_phase(Phase::Calibration));
        assert_eq!(state.phase_batch_count, 2);

        assert!(state.enter_phase(Phase::FineTuning(1)));
        assert_eq!(state.phase_batch_count, 0);
        assert_eq!(state.next_sim_id(), 21);
    }

    #[test]
    fn test_phase_names_parse() {
        for phase in [Phase::Calibration, Phase::Predictive, Phase::FineTuning(3), Phase::Converged] {
            assert_eq!(phase.name().parse::<Phase>().unwrap(), phase);
        }
        assert!("fine_tuning_tier_6".parse::<Phase>().is_err());
    }

    #[test]
    fn test_nan_ess_survives_round_trip() {
        let mut state = RunState::new_auto();
        state.ess_history.push(EssSnapshot {
            batch_number: 1,
            total_sims_successful: 1,
            min_parameter_ess: f64::NAN,
            fraction_meeting_target: 0.0,
        });
        let bytes = serde_json::to_vec(&state).unwrap();
        let loaded = parse_checkpoint(&bytes).unwrap();
        assert!(loaded.ess_history[0].min_parameter_ess.is_nan());
    }

    #[test]
    fn test_run_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RunLock::acquire(dir.path()).unwrap();
        assert!(matches!(RunLock::acquire(dir.path()), Err(CalibError::Lock(_))));

        drop(lock);
        let again = RunLock::acquire(dir.path()).unwrap();
        std::mem::forget(again);
        assert!(RunLock::force_release(dir.path()).unwrap());
        assert!(!RunLock::force_release(dir.path()).unwrap());
    }
}
