//! JSON exporter for run artifacts.
//!
//! Writes the diagnostics, the best-subset selection and the run report
//! next to the consolidated table. Every file is replaced atomically.

use crate::error::Result;
use crate::scheduler::RunSummary;
use calibra_core::convergence::{ConvergenceDiagnostics, SubsetSelectionResult};
use calibra_core::storage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DIAGNOSTICS_FILE: &str = "convergence_diagnostics.json";
pub const SUBSET_FILE: &str = "subset_selection.json";
pub const SUMMARY_FILE: &str = "run_summary.json";

/// Final report of a run (or of an aggregate-only pass).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Absent for aggregate-only passes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,

    pub consolidated_path: PathBuf,
    pub rows: usize,
    pub valid_rows: usize,
    pub shards_removed: usize,

    /// Highest-likelihood simulation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_sim_id: Option<u64>,

    /// Convergence judged on the final table
    pub converged: bool,

    pub subset_tier: String,
    pub subset_size: usize,

    /// Pre-flight warnings raised before the first batch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl RunReport {
    /// Writes `run_summary.json` into `dir`.
    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(SUMMARY_FILE);
        storage::write_json_atomic(&path, self)?;
        Ok(path)
    }
}

/// Writes `convergence_diagnostics.json` and `subset_selection.json`.
pub fn write_diagnostics(dir: &Path, diagnostics: &ConvergenceDiagnostics) -> Result<()> {
    storage::write_json_atomic(&dir.join(DIAGNOSTICS_FILE), diagnostics)?;
    write_subset(dir, &diagnostics.subset)
}

pub fn write_subset(dir: &Path, subset: &SubsetSelectionResult) -> Result<()> {
    storage::write_json_atomic(&dir.join(SUBSET_FILE), subset)?;
    Ok(())
}
