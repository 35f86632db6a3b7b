//! Collaborator traits for simulation, scoring and prior sampling.

use crate::error::EnvError;
use crate::types::{ParameterVector, TimeSeries};
use serde::{Deserialize, Serialize};

/// The simulation collaborator.
///
/// Maps a parameter vector and a seed to one simulated time series. The
/// engine treats the model as opaque; it only relies on:
///
/// - **Determinism**: a fixed `(parameters, seed)` pair always produces the
///   same series.
/// - **Independence**: calls never observe each other.
///
/// # Native resources
///
/// Models that wrap an external engine tend to accumulate unmanaged state
/// across thousands of invocations. The worker calls `release_resources`
/// periodically and at the end of every task so such handles get dropped.
pub trait SimulationModel: Send + Sync {
    /// Runs one stochastic simulation.
    fn simulate(&self, params: &ParameterVector, seed: u64) -> Result<TimeSeries, EnvError>;
    
    /// Releases any native or cached state held by the model.
    fn release_resources(&self) {}
    
    /// Restricts any internal numeric thread pool to `threads` threads.
    ///
    /// Returns `EnvError::Unsupported` when the model cannot control its
    /// threading; the caller logs this and carries on.
    fn configure_threads(&self, _threads: usize) -> Result<(), EnvError> {
        Ok(())
    }
    
    /// Returns the model name (for logging).
    fn name(&self) -> &str;
}

/// Kind of likelihood component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Gaussian observation error with fixed standard deviation
    Gaussian,
    /// Poisson counts around the simulated mean
    Poisson,
}

/// One toggleable, weighted term of a composite likelihood.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LikelihoodComponent {
    pub kind: ComponentKind,
    
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    
    #[serde(default = "default_weight")]
    pub weight: f64,
    
    /// Observation noise for Gaussian components
    #[serde(default = "default_sigma")]
    pub sigma: f64,
}

fn default_enabled() -> bool {
    true
}

fn default_weight() -> f64 {
    1.0
}

fn default_sigma() -> f64 {
    1.0
}

impl LikelihoodComponent {
    pub fn gaussian(sigma: f64) -> Self {
        Self {
            kind: ComponentKind::Gaussian,
            enabled: true,
            weight: 1.0,
            sigma,
        }
    }
    
    pub fn poisson() -> Self {
        Self {
            kind: ComponentKind::Poisson,
            enabled: true,
            weight: 1.0,
            sigma: default_sigma(),
        }
    }
}

/// Likelihood settings handed to the likelihood collaborator on every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LikelihoodConfig {
    pub components: Vec<LikelihoodComponent>,
    
    /// Value a likelihood implementation reports for a failed evaluation.
    /// Rows carrying it are excluded from every statistic.
    pub failure_sentinel: f64,
}

impl Default for LikelihoodConfig {
    fn default() -> Self {
        Self {
            components: vec![LikelihoodComponent::gaussian(1.0)],
            failure_sentinel: -1e10,
        }
    }
}

impl LikelihoodConfig {
    /// Components that are switched on.
    pub fn enabled_components(&self) -> impl Iterator<Item = &LikelihoodComponent> {
        self.components.iter().filter(|c| c.enabled)
    }
}

/// The likelihood collaborator.
///
/// Scores an estimated series against observed data. Failures are reported
/// as a non-finite value rather than an error: one failed score only ever
/// invalidates one iteration.
pub trait LikelihoodModel: Send + Sync {
    /// Returns the log-likelihood of `estimated` given `observed`.
    fn log_likelihood(
        &self,
        observed: &TimeSeries,
        estimated: &TimeSeries,
        config: &LikelihoodConfig,
    ) -> f64;
    
    /// Returns the name of this likelihood (for logging).
    fn name(&self) -> &str;
}

/// The prior-sampling collaborator.
///
/// Draws one full parameter vector (estimated and fixed parameters) from a
/// seed. Must be deterministic in the seed.
pub trait PriorSampler: Send + Sync {
    /// Samples a parameter vector.
    fn sample(&self, seed: u64) -> Result<ParameterVector, EnvError>;
    
    /// Names of the parameters that are estimated (not held fixed).
    fn estimated_names(&self) -> Vec<String>;
}
