//! Calibra Core - Adaptive Ensemble Calibration Engine
//!
//! Everything the batch scheduler needs between "run one trial" and "should
//! we stop?":
//! 1. **State Store**: atomic, validated, resumable run checkpoints
//! 2. **Simulation Worker**: sample → simulate → score → collapse → shard
//! 3. **Result Aggregator**: shards → one annotated consolidated table
//! 4. **Convergence & Weighting**: ESS metrics, best-subset search and three
//!    tiers of importance weights

pub mod config;
pub mod error;
pub mod storage;
pub mod state;
pub mod priors;
pub mod shard;
pub mod worker;
pub mod stats;
pub mod weighting;
pub mod aggregate;
pub mod convergence;

// Re-export key types for convenience
pub use aggregate::{AggregationMode, Aggregator, ConsolidatedRow, ConsolidatedTable};
pub use config::{CalibrationConfig, Strategy};
pub use convergence::{ConvergenceTier, EssMethod, SubsetSelectionResult};
pub use error::CalibError;
pub use state::{Mode, Phase, RunLock, RunState, StateStore};
pub use worker::{SimulationWorker, TaskOutcome, TaskWorker};
