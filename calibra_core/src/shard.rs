//! Per-task result shards.
//!
//! One shard per `sim_id` holds every iteration record of the task plus
//! the collapsed result. Shards are written atomically, so a shard that
//! exists is complete; resuming a fixed-mode run treats the set of shard
//! files as the set of completed tasks.

use crate::error::{CalibError, Result};
use crate::storage::{self, Compression};
use calibra_env::TimeSeries;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// One stochastic draw of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub sim_id: u64,

    /// 1-based iteration index
    pub iteration_index: u32,

    pub seed_sim: u64,
    pub seed_iter: u64,

    /// `None` when the simulation or the likelihood failed
    pub likelihood: Option<f64>,

    /// Parameter values used for this iteration
    pub parameters: Vec<f64>,
}

/// Collapsed record of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub sim_id: u64,

    /// Log-mean-exp of the finite iteration likelihoods
    pub likelihood: Option<f64>,

    /// Mean parameter vector over finite iterations
    pub parameters: Vec<f64>,

    pub finite_iterations: u32,
    pub total_iterations: u32,
}

/// Everything persisted for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultShard {
    pub sim_id: u64,
    pub seed_sim: u64,
    pub iteration_count: u32,
    pub parameter_names: Vec<String>,
    pub iterations: Vec<IterationRecord>,
    pub result: SimulationResult,
}

/// Simulated series kept for downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesShard {
    pub sim_id: u64,
    pub seed_iter: u64,
    pub series: TimeSeries,
}

/// Location and codec of result shards.
#[derive(Debug, Clone)]
pub struct ShardStore {
    dir: PathBuf,
    timeseries_dir: PathBuf,
    compression: Compression,
}

impl ShardStore {
    /// Shards live in `<output>/shards`, series in `<output>/timeseries`.
    pub fn new(output_dir: &Path, compression: Compression) -> Self {
        Self {
            dir: output_dir.join("shards"),
            timeseries_dir: output_dir.join("timeseries"),
            compression,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn shard_path(&self, sim_id: u64) -> PathBuf {
        self.dir
            .join(format!("sim_{:08}.json{}", sim_id, self.compression.suffix()))
    }

    pub fn timeseries_path(&self, sim_id: u64) -> PathBuf {
        self.timeseries_dir
            .join(format!("sim_{:08}.json{}", sim_id, self.compression.suffix()))
    }

    /// Writes a result shard atomically and returns its path.
    pub fn write(&self, shard: &ResultShard) -> Result<PathBuf> {
        let path = self.shard_path(shard.sim_id);
        let bytes = serde_json::to_vec(shard)?;
        storage::atomic_write_bytes(&path, &bytes, self.compression)?;
        Ok(path)
    }

    /// Writes a time-series shard atomically.
    pub fn write_timeseries(&self, shard: &TimeSeriesShard) -> Result<PathBuf> {
        let path = self.timeseries_path(shard.sim_id);
        let bytes = serde_json::to_vec(shard)?;
        storage::atomic_write_bytes(&path, &bytes, self.compression)?;
        Ok(path)
    }

    /// `sim_id`s with a shard on disk, in either compression.
    pub fn completed_ids(&self) -> Result<BTreeSet<u64>> {
        Ok(self.entries()?.into_iter().map(|(id, _)| id).collect())
    }

    /// All shard paths, sorted by `sim_id`.
    pub fn shard_paths(&self) -> Result<Vec<PathBuf>> {
        Ok(self.entries()?.into_iter().map(|(_, p)| p).collect())
    }

    /// `(sim_id, path)` pairs, sorted by `sim_id`.
    pub fn entries(&self) -> Result<Vec<(u64, PathBuf)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut shards = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if let Some(id) = path.file_name().and_then(|n| n.to_str()).and_then(parse_shard_name) {
                shards.push((id, path));
            }
        }
        shards.sort_by_key(|(id, _)| *id);
        shards.dedup_by_key(|(id, _)| *id);
        Ok(shards)
    }

    /// Deletes the given shards; missing files are ignored.
    pub fn remove(&self, paths: &[PathBuf]) -> usize {
        let mut removed = 0;
        for path in paths {
            match fs::remove_file(path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not delete shard {}: {}", path.display(), e),
            }
        }
        removed
    }
}

/// Reads one shard.
pub fn read_shard(path: &Path) -> Result<ResultShard> {
    let bytes = storage::read_all(path)?;
    serde_json::from_slice(&bytes).map_err(CalibError::from)
}

/// Extracts the `sim_id` from `sim_00000042.json[.gz]`.
fn parse_shard_name(name: &str) -> Option<u64> {
    let stem = name
        .strip_suffix(".json.gz")
        .or_else(|| name.strip_suffix(".json"))?;
    stem.strip_prefix("sim_")?.parse().ok()
}
