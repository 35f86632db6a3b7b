//! Calibra Environment Abstraction Layer
//!
//! This crate defines the narrow interfaces through which the calibration
//! engine talks to everything it does not own:
//! - **Simulation models** (`simulate(parameters, seed) -> series`)
//! - **Likelihood functions** (`observed × estimated -> log-likelihood`)
//! - **Prior samplers** (`seed -> parameter vector`)
//! - **Cluster schedulers** (`submit(job)`, `status(job)`)
//!
//! # Determinism
//!
//! Every collaborator receives its entropy as an explicit 64-bit seed. A
//! model that is deterministic for a fixed `(parameters, seed)` pair makes
//! every trial of a calibration run reproducible from its `sim_id`.
//!
//! # Example
//!
//! ```ignore
//! use calibra_env::{LikelihoodConfig, LikelihoodModel, ParameterVector, SimulationModel, TimeSeries};
//!
//! fn score<M: SimulationModel, L: LikelihoodModel>(
//!     model: &M,
//!     likelihood: &L,
//!     params: &ParameterVector,
//!     observed: &TimeSeries,
//!     config: &LikelihoodConfig,
//! ) -> f64 {
//!     match model.simulate(params, 17) {
//!         Ok(series) => likelihood.log_likelihood(observed, &series, config),
//!         Err(_) => f64::NAN,
//!     }
//! }
//! ```

mod model;
mod cluster;
mod types;
mod error;
mod command_cluster;
pub mod threading;

pub use model::{
    ComponentKind, LikelihoodComponent, LikelihoodConfig, LikelihoodModel, PriorSampler,
    SimulationModel,
};
pub use cluster::{ClusterClient, JobSpec, JobHandle, JobStatus};
pub use types::{JobId, ParameterVector, TimeSeries};
pub use error::EnvError;
pub use command_cluster::CommandCluster;
