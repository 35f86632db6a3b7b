//! Error types for the Calibra environment abstraction.

use thiserror::Error;

/// Errors raised by external collaborators.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The simulation model failed for one `(parameters, seed)` pair
    #[error("Simulation failed: {0}")]
    SimulationFailed(String),
    
    /// Drawing a parameter vector from the priors failed
    #[error("Parameter sampling failed: {0}")]
    SamplingFailed(String),
    
    /// The collaborator does not support the requested capability
    #[error("Unsupported: {0}")]
    Unsupported(String),
    
    /// Job submission or status query against a cluster scheduler failed
    #[error("Cluster error: {0}")]
    ClusterError(String),
    
    /// A job outlived its wall-clock budget
    #[error("Timeout after {0}s")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a simulation error.
    pub fn simulation(msg: impl Into<String>) -> Self {
        Self::SimulationFailed(msg.into())
    }
    
    /// Creates a sampling error.
    pub fn sampling(msg: impl Into<String>) -> Self {
        Self::SamplingFailed(msg.into())
    }
    
    /// Creates a cluster error.
    pub fn cluster(msg: impl std::fmt::Display) -> Self {
        Self::ClusterError(msg.to_string())
    }
}
