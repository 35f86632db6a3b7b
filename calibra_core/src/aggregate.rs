//! The "AGGREGATE" stage - shards to one annotated table
//!
//! Reads every result shard, keeps one row per `sim_id`, flags finite,
//! valid, outlier, retained and best-model rows, and persists the result
//! as a single CSV or JSON-lines table. Shards are only deleted after the
//! table has been written successfully.

use crate::config::CalibrationConfig;
use crate::error::{CalibError, Result};
use crate::shard::{self, ResultShard, ShardStore};
use crate::stats;
use crate::storage::{self, Compression};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ============================================================================
// TABLE TYPES
// ============================================================================

/// On-disk layout of the consolidated table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableFormat {
    #[default]
    Csv,
    Jsonl,
}

impl TableFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TableFormat::Csv => "csv",
            TableFormat::Jsonl => "jsonl",
        }
    }
}

/// How shards are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    /// One shard in memory at a time; iteration records dropped on read
    #[default]
    Streaming,
    /// Load every shard, then merge
    Concatenate,
}

/// One completed simulation, annotated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedRow {
    pub sim_id: u64,

    /// Collapsed log-likelihood (NaN when no iteration was finite)
    #[serde(with = "crate::state::nan_as_null")]
    pub likelihood: f64,

    pub parameters: Vec<f64>,
    pub finite_iterations: u32,
    pub total_iterations: u32,

    pub is_finite: bool,
    pub is_valid: bool,
    pub is_outlier: bool,
    pub is_retained: bool,
    pub is_best_subset: bool,
    pub is_best_model: bool,

    pub weight_all: f64,
    pub weight_retained: f64,
    pub weight_best: f64,
}

impl ConsolidatedRow {
    /// Unannotated row built from a shard's collapsed result.
    pub fn from_shard(shard: &ResultShard) -> Self {
        Self {
            sim_id: shard.sim_id,
            likelihood: shard.result.likelihood.unwrap_or(f64::NAN),
            parameters: shard.result.parameters.clone(),
            finite_iterations: shard.result.finite_iterations,
            total_iterations: shard.result.total_iterations,
            is_finite: false,
            is_valid: false,
            is_outlier: false,
            is_retained: false,
            is_best_subset: false,
            is_best_model: false,
            weight_all: 0.0,
            weight_retained: 0.0,
            weight_best: 0.0,
        }
    }
}

/// All rows of a run, sorted by `sim_id`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsolidatedTable {
    pub parameter_names: Vec<String>,
    pub rows: Vec<ConsolidatedRow>,
}

impl ConsolidatedTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn valid_count(&self) -> usize {
        self.rows.iter().filter(|r| r.is_valid).count()
    }

    /// Index of a parameter column.
    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.parameter_names.iter().position(|n| n == name)
    }

    pub fn best_model(&self) -> Option<&ConsolidatedRow> {
        self.rows.iter().find(|r| r.is_best_model)
    }
}

// ============================================================================
// AGGREGATOR
// ============================================================================

/// Combines shards and annotates the resulting rows.
#[derive(Debug, Clone)]
pub struct Aggregator {
    mode: AggregationMode,
    failure_sentinel: f64,
    outlier_multiplier: f64,
    low_disk_warning_mb: u64,
}

impl Aggregator {
    pub fn new(mode: AggregationMode) -> Self {
        Self {
            mode,
            failure_sentinel: -1e10,
            outlier_multiplier: 1.5,
            low_disk_warning_mb: 1024,
        }
    }

    pub fn from_config(config: &CalibrationConfig) -> Self {
        Self::new(config.output.aggregation)
            .with_sentinel(config.likelihood.failure_sentinel)
            .with_outlier_multiplier(config.convergence.outlier_multiplier)
            .with_low_disk_warning(config.output.low_disk_warning_mb)
    }

    pub fn with_sentinel(mut self, sentinel: f64) -> Self {
        self.failure_sentinel = sentinel;
        self
    }

    pub fn with_outlier_multiplier(mut self, k: f64) -> Self {
        self.outlier_multiplier = k;
        self
    }

    pub fn with_low_disk_warning(mut self, mb: u64) -> Self {
        self.low_disk_warning_mb = mb;
        self
    }

    /// Reads the given shards into an annotated table.
    ///
    /// Unreadable shards and shards whose parameter names disagree with the
    /// first readable one are skipped with a warning.
    pub fn combine(&self, paths: &[PathBuf]) -> ConsolidatedTable {
        let mut table = match self.mode {
            AggregationMode::Streaming => {
                let mut table = ConsolidatedTable::default();
                for path in paths {
                    if let Some(shard) = read_or_warn(path) {
                        push_shard(&mut table, &shard, path);
                    }
                }
                table
            }
            AggregationMode::Concatenate => {
                let shards: Vec<(ResultShard, &PathBuf)> = paths
                    .iter()
                    .filter_map(|p| read_or_warn(p).map(|s| (s, p)))
                    .collect();
                let mut table = ConsolidatedTable::default();
                for (shard, path) in &shards {
                    push_shard(&mut table, shard, path);
                }
                table
            }
        };

        table.rows.sort_by_key(|r| r.sim_id);
        table.rows.dedup_by_key(|r| r.sim_id);
        self.annotate(&mut table);

        debug!(
            "Combined {} of {} shards ({:?}), {} valid",
            table.len(),
            paths.len(),
            self.mode,
            table.valid_count()
        );
        table
    }

    /// Sets the finite, valid, outlier, retained and best-model flags.
    pub fn annotate(&self, table: &mut ConsolidatedTable) {
        for row in &mut table.rows {
            row.is_finite = row.likelihood.is_finite();
            row.is_valid = row.is_finite && row.likelihood != self.failure_sentinel;
        }

        let valid: Vec<f64> = table
            .rows
            .iter()
            .filter(|r| r.is_valid)
            .map(|r| r.likelihood)
            .collect();
        let (lo, hi) = if valid.len() >= 2 {
            stats::tukey_fences(&valid, self.outlier_multiplier)
        } else {
            (f64::NEG_INFINITY, f64::INFINITY)
        };

        let mut best: Option<(usize, f64)> = None;
        for (i, row) in table.rows.iter_mut().enumerate() {
            row.is_outlier = row.is_valid && (row.likelihood < lo || row.likelihood > hi);
            row.is_retained = row.is_finite && !row.is_outlier;
            row.is_best_model = false;
            // Rows are sorted by sim_id, so strict > keeps the lowest id on ties
            if row.is_valid && best.map_or(true, |(_, l)| row.likelihood > l) {
                best = Some((i, row.likelihood));
            }
        }
        if let Some((i, _)) = best {
            table.rows[i].is_best_model = true;
        }
    }

    /// Writes the table with a disk-space check first.
    pub fn write(
        &self,
        table: &ConsolidatedTable,
        path: &Path,
        format: TableFormat,
        compression: Compression,
    ) -> Result<()> {
        storage::check_disk_space(path, self.low_disk_warning_mb);
        write_consolidated(table, path, format, compression)
    }

    /// Writes the table, then deletes the shards it was built from.
    ///
    /// Returns the number of shards deleted. Nothing is deleted when the
    /// write fails or `keep_shards` is set. Shards without a row in the
    /// table (unreadable, mismatched parameters) stay on disk.
    pub fn finalize(
        &self,
        table: &ConsolidatedTable,
        store: &ShardStore,
        path: &Path,
        format: TableFormat,
        compression: Compression,
        keep_shards: bool,
    ) -> Result<usize> {
        let entries = store.entries()?;
        self.write(table, path, format, compression)?;
        info!("Consolidated {} rows into {}", table.len(), path.display());

        if keep_shards {
            return Ok(0);
        }
        let in_table: BTreeSet<u64> = table.rows.iter().map(|r| r.sim_id).collect();
        let (consolidated, skipped): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|(id, _)| in_table.contains(id));
        for (_, shard) in &skipped {
            warn!("Keeping {}: not part of the consolidated table", shard.display());
        }
        let shard_paths: Vec<PathBuf> = consolidated.into_iter().map(|(_, p)| p).collect();
        let removed = store.remove(&shard_paths);
        debug!("Deleted {} shards", removed);
        Ok(removed)
    }
}

fn read_or_warn(path: &Path) -> Option<ResultShard> {
    match shard::read_shard(path) {
        Ok(shard) => Some(shard),
        Err(e) => {
            warn!("Skipping unreadable shard {}: {}", path.display(), e);
            None
        }
    }
}

fn push_shard(table: &mut ConsolidatedTable, shard: &ResultShard, path: &Path) {
    if table.rows.is_empty() && table.parameter_names.is_empty() {
        table.parameter_names = shard.parameter_names.clone();
    } else if table.parameter_names != shard.parameter_names {
        warn!(
            "Skipping shard {}: parameters {:?} differ from {:?}",
            path.display(),
            shard.parameter_names,
            table.parameter_names
        );
        return;
    }
    table.rows.push(ConsolidatedRow::from_shard(shard));
}

// ============================================================================
// PERSISTENCE
// ============================================================================

const LEADING_COLUMNS: [&str; 2] = ["sim_id", "likelihood"];
const TRAILING_COLUMNS: [&str; 11] = [
    "finite_iterations",
    "total_iterations",
    "is_finite",
    "is_valid",
    "is_outlier",
    "is_retained",
    "is_best_subset",
    "is_best_model",
    "weight_all",
    "weight_retained",
    "weight_best",
];

/// First line of a JSON-lines table.
#[derive(Debug, Serialize, Deserialize)]
struct JsonlHeader {
    parameter_names: Vec<String>,
}

/// Atomically writes the table.
pub fn write_consolidated(
    table: &ConsolidatedTable,
    path: &Path,
    format: TableFormat,
    compression: Compression,
) -> Result<()> {
    let bytes = match format {
        TableFormat::Csv => csv_bytes(table)?,
        TableFormat::Jsonl => jsonl_bytes(table)?,
    };
    storage::atomic_write_bytes(path, &bytes, compression)?;
    Ok(())
}

fn csv_bytes(table: &ConsolidatedTable) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    let header: Vec<&str> = LEADING_COLUMNS
        .iter()
        .copied()
        .chain(table.parameter_names.iter().map(String::as_str))
        .chain(TRAILING_COLUMNS.iter().copied())
        .collect();
    writer.write_record(&header)?;

    for row in &table.rows {
        let mut record = vec![row.sim_id.to_string(), row.likelihood.to_string()];
        record.extend(row.parameters.iter().map(|v| v.to_string()));
        record.extend([
            row.finite_iterations.to_string(),
            row.total_iterations.to_string(),
            row.is_finite.to_string(),
            row.is_valid.to_string(),
            row.is_outlier.to_string(),
            row.is_retained.to_string(),
            row.is_best_subset.to_string(),
            row.is_best_model.to_string(),
            row.weight_all.to_string(),
            row.weight_retained.to_string(),
            row.weight_best.to_string(),
        ]);
        writer.write_record(&record)?;
    }

    writer
        .into_inner()
        .map_err(|e| CalibError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
}

fn jsonl_bytes(table: &ConsolidatedTable) -> Result<Vec<u8>> {
    let mut out = serde_json::to_vec(&JsonlHeader {
        parameter_names: table.parameter_names.clone(),
    })?;
    out.push(b'\n');
    for row in &table.rows {
        serde_json::to_writer(&mut out, row)?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Reads a consolidated table; any failure is fatal.
pub fn read_consolidated(path: &Path) -> Result<ConsolidatedTable> {
    let reader = storage::open_reader(path).map_err(|e| CalibError::missing(path, e))?;
    let is_jsonl = path
        .to_str()
        .map_or(false, |p| p.ends_with(".jsonl") || p.ends_with(".jsonl.gz"));

    let parsed = if is_jsonl {
        parse_jsonl(reader)
    } else {
        parse_csv(reader)
    };
    parsed.map_err(|reason| CalibError::missing(path, reason))
}

fn parse_jsonl(reader: Box<dyn BufRead>) -> std::result::Result<ConsolidatedTable, String> {
    let mut lines = reader.lines();
    let header: JsonlHeader = match lines.next() {
        Some(line) => serde_json::from_str(&line.map_err(|e| e.to_string())?)
            .map_err(|e| format!("bad header: {}", e))?,
        None => return Err("empty table".into()),
    };

    let mut rows = Vec::new();
    for (n, line) in lines.enumerate() {
        let line = line.map_err(|e| e.to_string())?;
        if line.trim().is_empty() {
            continue;
        }
        let row: ConsolidatedRow =
            serde_json::from_str(&line).map_err(|e| format!("row {}: {}", n + 1, e))?;
        rows.push(row);
    }
    Ok(ConsolidatedTable {
        parameter_names: header.parameter_names,
        rows,
    })
}

fn parse_csv(reader: Box<dyn BufRead>) -> std::result::Result<ConsolidatedTable, String> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let header = csv_reader.headers().map_err(|e| e.to_string())?.clone();
    let fixed = LEADING_COLUMNS.len() + TRAILING_COLUMNS.len();
    if header.len() < fixed {
        return Err(format!("expected at least {} columns, found {}", fixed, header.len()));
    }
    let n_params = header.len() - fixed;
    let parameter_names: Vec<String> = header
        .iter()
        .skip(LEADING_COLUMNS.len())
        .take(n_params)
        .map(str::to_string)
        .collect();

    let mut rows = Vec::new();
    for (n, record) in csv_reader.records().enumerate() {
        let record = record.map_err(|e| e.to_string())?;
        let field = |i: usize| record.get(i).unwrap_or("");
        let row_err = |col: usize| format!("row {}: bad value in column {}", n + 1, col);

        let num = |i: usize| field(i).parse::<f64>().map_err(|_| row_err(i));
        let int = |i: usize| field(i).parse::<u64>().map_err(|_| row_err(i));
        let flag = |i: usize| field(i).parse::<bool>().map_err(|_| row_err(i));

        let t = LEADING_COLUMNS.len() + n_params;
        rows.push(ConsolidatedRow {
            sim_id: int(0)?,
            likelihood: num(1)?,
            parameters: (2..t).map(|i| num(i)).collect::<std::result::Result<_, _>>()?,
            finite_iterations: int(t)? as u32,
            total_iterations: int(t + 1)? as u32,
            is_finite: flag(t + 2)?,
            is_valid: flag(t + 3)?,
            is_outlier: flag(t + 4)?,
            is_retained: flag(t + 5)?,
            is_best_subset: flag(t + 6)?,
            is_best_model: flag(t + 7)?,
            weight_all: num(t + 8)?,
            weight_retained: num(t + 9)?,
            weight_best: num(t + 10)?,
        });
    }
    Ok(ConsolidatedTable {
        parameter_names,
        rows,
    })
}
