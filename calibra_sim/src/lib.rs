//! Calibra batch driver
//!
//! Runs an adaptive ensemble calibration end to end:
//! - **Scheduler**: decides how many simulations the next batch runs
//! - **Dispatch**: runs a batch sequentially, on a thread pool, in child
//!   processes or as cluster jobs
//! - **Runner**: lock, pre-flight, batches, aggregation, weighting, export
//! - **Models**: reference logistic and SIR models plus a weighted
//!   Gaussian/Poisson likelihood
//!
//! # Control loop
//!
//! ```text
//!   ┌────────────┐  payloads   ┌────────────┐  run_task   ┌──────────┐
//!   │ Scheduler  │────────────►│ Dispatcher │────────────►│  Worker  │
//!   └─────▲──────┘             └────────────┘             └────┬─────┘
//!         │ converged?                                         │ shards
//!   ┌─────┴──────┐   table     ┌────────────┐                  ▼
//!   │ Convergence│◄────────────│ Aggregator │◄──────────── shards/
//!   └────────────┘             └────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use calibra_core::CalibrationConfig;
//! use calibra_sim::CalibrationRunner;
//!
//! let config = CalibrationConfig::load("calibration.json".as_ref())?;
//! let report = CalibrationRunner::new(config)?.run()?;
//! println!("best sim: {:?}", report.best_sim_id);
//! ```

pub mod dispatch;
pub mod error;
pub mod exporter;
pub mod models;
pub mod runner;
pub mod scheduler;

pub use dispatch::{build_dispatcher, ChunkPayload, DispatchError, Dispatcher, TaskPayload};
pub use error::RunError;
pub use exporter::RunReport;
pub use runner::{run_worker_chunk, CalibrationRunner, ShardConvergenceMonitor};
pub use scheduler::{BatchScheduler, ConvergenceMonitor, RunSummary, TerminationReason};
