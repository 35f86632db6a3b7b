//! Common value types shared between the engine and its collaborators.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An ordered, named parameter vector.
///
/// Names and values are kept in parallel so the vector can be written as a
/// flat row (one column per parameter) without a lookup table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParameterVector {
    pub names: Vec<String>,
    pub values: Vec<f64>,
}

impl ParameterVector {
    /// Creates an empty parameter vector.
    pub fn new() -> Self {
        Self::default()
    }
    
    /// Builds a vector from `(name, value)` pairs, preserving order.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut vector = Self::new();
        for (name, value) in pairs {
            vector.push(name, value);
        }
        vector
    }
    
    /// Appends a parameter.
    pub fn push(&mut self, name: impl Into<String>, value: f64) {
        self.names.push(name.into());
        self.values.push(value);
    }
    
    /// Looks up a parameter by name.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| self.values[idx])
    }
    
    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.values.len()
    }
    
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
    
    /// Iterates `(name, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.names.iter().map(String::as_str).zip(self.values.iter().copied())
    }
    
    /// Returns a copy with the same names and new values.
    ///
    /// Returns `None` when the value count does not match.
    pub fn with_values(&self, values: Vec<f64>) -> Option<Self> {
        if values.len() != self.names.len() {
            return None;
        }
        Some(Self {
            names: self.names.clone(),
            values,
        })
    }
}

/// A univariate time series sampled at explicit times.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeSeries {
    pub times: Vec<f64>,
    pub values: Vec<f64>,
}

impl TimeSeries {
    /// Creates a series from parallel time/value vectors.
    pub fn new(times: Vec<f64>, values: Vec<f64>) -> Self {
        Self { times, values }
    }
    
    /// Creates a series sampled at `0, 1, 2, ...`.
    pub fn from_values(values: Vec<f64>) -> Self {
        let times = (0..values.len()).map(|t| t as f64).collect();
        Self { times, values }
    }
    
    pub fn len(&self) -> usize {
        self.values.len()
    }
    
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
    
    /// True when times and values line up and every value is finite.
    pub fn is_well_formed(&self) -> bool {
        self.times.len() == self.values.len() && self.values.iter().all(|v| v.is_finite())
    }
}

/// Unique identifier for a job submitted to a cluster scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Creates a new random JobId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
    
    /// Creates a deterministic JobId from a batch number and chunk index.
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }
    
    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First 8 chars are enough to tell jobs apart in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}
