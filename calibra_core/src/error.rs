//! Error types for the calibration engine.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the calibration engine.
///
/// Everything here is fatal for the operation that raised it. Recoverable
/// conditions (a bad checkpoint, a failed iteration, too few valid rows)
/// never surface as a `CalibError`; they are logged and degraded instead.
#[derive(Debug, Error)]
pub enum CalibError {
    /// Missing or invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),
    
    /// Another run holds the output directory
    #[error("Output directory is locked by another run: {0}")]
    Lock(PathBuf),
    
    /// An output needed for final reporting is missing or unreadable
    #[error("Missing output {path}: {reason}")]
    MissingOutput { path: PathBuf, reason: String },
    
    /// Parameter sampling failed for one task
    #[error("Task {sim_id} failed: {reason}")]
    Task { sim_id: u64, reason: String },
    
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl CalibError {
    /// Creates a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    
    /// Creates a missing-output error.
    pub fn missing(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::MissingOutput {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CalibError>;
