//! Error type of the calibration driver.

use crate::dispatch::DispatchError;
use calibra_core::CalibError;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors of a calibration run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Calib(#[from] CalibError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A fresh run found shards left by an earlier one
    #[error("{count} shard(s) from an earlier run in {}; pass --resume to continue it or remove them", dir.display())]
    StaleShards { dir: PathBuf, count: usize },

    /// Unknown model or bad model settings
    #[error("Invalid model configuration: {0}")]
    Model(String),
}

pub type Result<T> = std::result::Result<T, RunError>;
