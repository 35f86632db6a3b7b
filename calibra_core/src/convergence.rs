//! The "CONVERGENCE" Engine - ESS, best-subset search and weights
//!
//! Works on an annotated `ConsolidatedTable`:
//! 1. **Tempered weights** over valid rows (`weight_all`)
//! 2. **Akaike weights** over retained rows (`weight_retained`)
//! 3. **Best-subset search** over the configured tiers, in the order given
//! 4. **Akaike weights** over the chosen subset (`weight_best`)
//! 5. **Parameter ESS** of every estimated parameter under `weight_all`
//!
//! Degenerate inputs (fewer than two valid rows) produce NaN metrics and a
//! warning, never a panic.

use crate::aggregate::{ConsolidatedRow, ConsolidatedTable};
use crate::config::ConvergenceConfig;
use crate::stats;
use crate::weighting;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Tier name reported when no tier was satisfied.
pub const FALLBACK_TIER: &str = "fallback";

// ============================================================================
// TYPES
// ============================================================================

/// How per-parameter ESS is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EssMethod {
    /// Variance of the weighted mean relative to a plain sample of the same
    /// spread
    #[default]
    DesignEffect,
    /// `exp(H(w))` of the normalised weights
    Perplexity,
}

/// Named bundle of subset targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceTier {
    pub name: String,
    pub target_subset_ess: f64,
    pub target_agreement: f64,
    pub target_cv: f64,
}

impl ConvergenceTier {
    pub fn new(name: impl Into<String>, ess: f64, agreement: f64, cv: f64) -> Self {
        Self {
            name: name.into(),
            target_subset_ess: ess,
            target_agreement: agreement,
            target_cv: cv,
        }
    }

    /// NaN metrics never satisfy a tier.
    pub fn is_met_by(&self, metrics: &SubsetMetrics) -> bool {
        metrics.ess >= self.target_subset_ess
            && metrics.agreement >= self.target_agreement
            && metrics.cv <= self.target_cv
    }
}

/// Weight diagnostics of a subset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubsetMetrics {
    #[serde(with = "crate::state::nan_as_null")]
    pub ess: f64,
    #[serde(with = "crate::state::nan_as_null")]
    pub agreement: f64,
    #[serde(with = "crate::state::nan_as_null")]
    pub cv: f64,
}

impl SubsetMetrics {
    pub fn nan() -> Self {
        Self {
            ess: f64::NAN,
            agreement: f64::NAN,
            cv: f64::NAN,
        }
    }

    pub fn from_weights(weights: &[f64]) -> Self {
        if weights.len() < 2 {
            return Self::nan();
        }
        Self {
            ess: stats::kish_ess(weights),
            agreement: stats::agreement_index(weights),
            cv: stats::coefficient_of_variation(weights),
        }
    }
}

/// Outcome of the best-subset search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsetSelectionResult {
    /// Members, best likelihood first
    pub sim_ids: Vec<u64>,
    pub size: usize,
    pub metrics: SubsetMetrics,
    pub converged: bool,
    pub tier_name: String,
}

/// ESS of one estimated parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterEss {
    pub name: String,
    #[serde(with = "crate::state::nan_as_null")]
    pub ess: f64,
    pub meets_target: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterEssReport {
    pub method: EssMethod,
    pub target: f64,
    pub parameters: Vec<ParameterEss>,
    pub fraction_meeting_target: f64,
    #[serde(with = "crate::state::nan_as_null")]
    pub min_ess: f64,
}

/// Everything the engine learned about one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceDiagnostics {
    pub n_rows: usize,
    pub n_finite: usize,
    pub n_valid: usize,
    pub n_outliers: usize,
    pub n_retained: usize,

    /// Temperature behind `weight_all`
    #[serde(with = "crate::state::nan_as_null")]
    pub temperature: f64,

    /// Diagnostics of `weight_all` over valid rows
    pub overall: SubsetMetrics,

    pub parameter_ess: ParameterEssReport,
    pub subset: SubsetSelectionResult,
}

impl ConvergenceDiagnostics {
    /// Whether the run may stop, given its convergence settings.
    pub fn is_converged(&self, config: &ConvergenceConfig) -> bool {
        let ess_ok = self.parameter_ess.fraction_meeting_target >= config.required_fraction;
        let subset_ok = !config.require_subset_convergence || self.subset.converged;
        ess_ok && subset_ok
    }
}

// ============================================================================
// PARAMETER ESS
// ============================================================================

/// ESS of every column of `values` (rows = samples) under `weights`.
pub fn parameter_ess(values: &DMatrix<f64>, weights: &[f64], method: EssMethod) -> Vec<f64> {
    let n = values.nrows();
    if n < 2 || weights.len() != n {
        return vec![f64::NAN; values.ncols()];
    }
    let total: f64 = weights.iter().sum();
    if !(total > 0.0) || !total.is_finite() {
        return vec![f64::NAN; values.ncols()];
    }
    let w = DVector::from_iterator(n, weights.iter().map(|w| w / total));

    match method {
        EssMethod::Perplexity => vec![stats::perplexity_ess(weights); values.ncols()],
        EssMethod::DesignEffect => values
            .column_iter()
            .map(|column| {
                let mu = w.dot(&column);
                let dev = column.map(|x| x - mu);
                let spread = w.dot(&dev.component_mul(&dev));
                let w_sq = w.component_mul(&w);
                let var_of_mean = w_sq.dot(&dev.component_mul(&dev));
                if !spread.is_finite() {
                    f64::NAN
                } else if var_of_mean > 0.0 && spread > 0.0 {
                    spread / var_of_mean
                } else {
                    // Constant column: fall back to the weight-only answer
                    stats::kish_ess(weights)
                }
            })
            .collect(),
    }
}

/// Per-parameter ESS of the valid rows under `weight_all`.
pub fn parameter_ess_report(
    table: &ConsolidatedTable,
    estimated: &[String],
    config: &ConvergenceConfig,
) -> ParameterEssReport {
    let target = config.parameter_ess_target;
    let columns: Vec<(String, Option<usize>)> = estimated
        .iter()
        .map(|name| (name.clone(), table.parameter_index(name)))
        .collect();

    let valid: Vec<_> = table.rows.iter().filter(|r| r.is_valid).collect();
    let weights: Vec<f64> = valid.iter().map(|r| r.weight_all).collect();

    let ess_values = if valid.len() < 2 {
        warn!("Fewer than two valid rows ({}); parameter ESS is undefined", valid.len());
        vec![f64::NAN; columns.len()]
    } else {
        let matrix = DMatrix::from_fn(valid.len(), columns.len(), |i, j| match columns[j].1 {
            Some(col) => valid[i].parameters.get(col).copied().unwrap_or(f64::NAN),
            None => f64::NAN,
        });
        parameter_ess(&matrix, &weights, config.ess_method)
    };

    let parameters: Vec<ParameterEss> = columns
        .into_iter()
        .zip(ess_values)
        .map(|((name, _), ess)| ParameterEss {
            name,
            ess,
            meets_target: ess >= target,
        })
        .collect();

    let meeting = parameters.iter().filter(|p| p.meets_target).count();
    let fraction_meeting_target = if parameters.is_empty() {
        0.0
    } else {
        meeting as f64 / parameters.len() as f64
    };
    let min_ess = parameters
        .iter()
        .map(|p| p.ess)
        .fold(f64::INFINITY, |acc, e| if e.is_nan() || acc.is_nan() { f64::NAN } else { acc.min(e) });

    ParameterEssReport {
        method: config.ess_method,
        target,
        parameters,
        fraction_meeting_target,
        min_ess: if min_ess.is_infinite() { f64::NAN } else { min_ess },
    }
}

// ============================================================================
// BEST-SUBSET SEARCH
// ============================================================================

/// Valid `(sim_id, likelihood)` pairs, best first, lowest `sim_id` on ties.
fn ranked_valid(table: &ConsolidatedTable) -> Vec<(u64, f64)> {
    let mut ranked: Vec<(u64, f64)> = table
        .rows
        .iter()
        .filter(|r| r.is_valid)
        .map(|r| (r.sim_id, r.likelihood))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked
}

fn subset_metrics(top: &[(u64, f64)], cap: f64) -> SubsetMetrics {
    let lls: Vec<f64> = top.iter().map(|(_, l)| *l).collect();
    SubsetMetrics::from_weights(&weighting::akaike_weights(&lls, cap))
}

/// Searches tiers in the order given for the first `(tier, size)` whose
/// top-likelihood subset meets all three targets.
pub fn best_subset_search(table: &ConsolidatedTable, config: &ConvergenceConfig) -> SubsetSelectionResult {
    let ranked = ranked_valid(table);

    if ranked.len() >= 2 {
        for tier in &config.tiers {
            let mut size = config.min_subset_size;
            while size <= config.max_subset_size && size <= ranked.len() {
                let metrics = subset_metrics(&ranked[..size], config.best_cap);
                if tier.is_met_by(&metrics) {
                    debug!("Subset tier '{}' met at size {}", tier.name, size);
                    return SubsetSelectionResult {
                        sim_ids: ranked[..size].iter().map(|(id, _)| *id).collect(),
                        size,
                        metrics,
                        converged: true,
                        tier_name: tier.name.clone(),
                    };
                }
                size += config.subset_size_step;
            }
        }
    } else {
        warn!("Fewer than two valid rows ({}); subset metrics are undefined", ranked.len());
    }

    let size = config.fallback_subset_size.min(ranked.len());
    SubsetSelectionResult {
        sim_ids: ranked[..size].iter().map(|(id, _)| *id).collect(),
        size,
        metrics: subset_metrics(&ranked[..size], config.best_cap),
        converged: false,
        tier_name: FALLBACK_TIER.to_string(),
    }
}

// ============================================================================
// FULL ANALYSIS
// ============================================================================

/// Computes all three weight columns, the subset flags and the diagnostics.
///
/// Expects a table already annotated by the aggregator.
pub fn analyze(
    table: &mut ConsolidatedTable,
    estimated: &[String],
    config: &ConvergenceConfig,
) -> ConvergenceDiagnostics {
    for row in &mut table.rows {
        row.weight_all = 0.0;
        row.weight_retained = 0.0;
        row.weight_best = 0.0;
        row.is_best_subset = false;
    }

    // weight_all: tempered over valid rows
    let valid_idx: Vec<usize> = indices(table, |r| r.is_valid);
    let valid_ll: Vec<f64> = valid_idx.iter().map(|&i| table.rows[i].likelihood).collect();
    let (weights, temperature) =
        weighting::tempered_weights(&valid_ll, config.tempered_target(), config.weight_floor);
    for (&i, w) in valid_idx.iter().zip(&weights) {
        table.rows[i].weight_all = *w;
    }

    // weight_retained: Akaike over retained rows
    let retained_idx: Vec<usize> = indices(table, |r| r.is_retained);
    let retained_ll: Vec<f64> = retained_idx.iter().map(|&i| table.rows[i].likelihood).collect();
    for (&i, w) in retained_idx
        .iter()
        .zip(weighting::akaike_weights(&retained_ll, config.retained_cap))
    {
        table.rows[i].weight_retained = w;
    }

    // weight_best: Akaike over the chosen subset
    let subset = best_subset_search(table, config);
    let subset_idx: Vec<usize> = subset
        .sim_ids
        .iter()
        .filter_map(|id| table.rows.binary_search_by_key(id, |r| r.sim_id).ok())
        .collect();
    let subset_ll: Vec<f64> = subset_idx.iter().map(|&i| table.rows[i].likelihood).collect();
    for (&i, w) in subset_idx
        .iter()
        .zip(weighting::akaike_weights(&subset_ll, config.best_cap))
    {
        table.rows[i].is_best_subset = true;
        table.rows[i].weight_best = w;
    }

    let parameter_ess = parameter_ess_report(table, estimated, config);
    let overall = SubsetMetrics::from_weights(&weights);

    ConvergenceDiagnostics {
        n_rows: table.len(),
        n_finite: table.rows.iter().filter(|r| r.is_finite).count(),
        n_valid: valid_idx.len(),
        n_outliers: table.rows.iter().filter(|r| r.is_outlier).count(),
        n_retained: retained_idx.len(),
        temperature,
        overall,
        parameter_ess,
        subset,
    }
}

fn indices(table: &ConsolidatedTable, pred: impl Fn(&ConsolidatedRow) -> bool) -> Vec<usize> {
    table
        .rows
        .iter()
        .enumerate()
        .filter(|(_, r)| pred(r))
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggregationMode, Aggregator};
    use approx::assert_relative_eq;

    fn row(sim_id: u64, likelihood: f64, params: Vec<f64>) -> ConsolidatedRow {
        ConsolidatedRow {
            sim_id,
            likelihood,
            parameters: params,
            finite_iterations: 1,
            total_iterations: 1,
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

    fn annotated(likelihoods: &[f64]) -> ConsolidatedTable {
        let mut table = ConsolidatedTable {
            parameter_names: vec!["r".into(), "k".into()],
            rows: likelihoods
                .iter()
                .enumerate()
                .map(|(i, l)| row(i as u64 + 1, *l, vec![i as f64, 7.0]))
                .collect(),
        };
        Aggregator::new(AggregationMode::Streaming).annotate(&mut table);
        table
    }

    fn names() -> Vec<String> {
        vec!["r".into(), "k".into()]
    }

    #[test]
    fn test_uniform_weights_ess_is_n() {
        let values = DMatrix::from_fn(30, 2, |i, j| (i * (j + 1)) as f64);
        let weights = vec![1.0; 30];

        for ess in parameter_ess(&values, &weights, EssMethod::DesignEffect) {
            assert_relative_eq!(ess, 30.0, epsilon = 1e-9);
        }
        for ess in parameter_ess(&values, &weights, EssMethod::Perplexity) {
            assert_relative_eq!(ess, 30.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_design_effect_drops_with_concentrated_weights() {
        let values = DMatrix::from_fn(10, 1, |i, _| i as f64);
        let mut weights = vec![1.0; 10];
        weights[0] = 50.0;
        let ess = parameter_ess(&values, &weights, EssMethod::DesignEffect)[0];
        assert!(ess < 10.0);
        assert!(ess >= 1.0);
    }

    #[test]
    fn test_flat_subset_converges_on_relaxed_tier() {
        let table = annotated(&[-5.0; 100]);
        let result = best_subset_search(&table, &ConvergenceConfig::default());

        assert!(result.converged);
        assert_eq!(result.tier_name, "relaxed");
        assert_eq!(result.size, 100);
        assert_relative_eq!(result.metrics.ess, 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_tiers_searched_in_given_order() {
        let table = annotated(&[-5.0; 100]);
        let mut config = ConvergenceConfig::default();
        config.tiers = vec![
            ConvergenceTier::new("loose", 10.0, 0.0, 10.0),
            ConvergenceTier::new("tight", 50.0, 0.5, 1.0),
        ];
        let result = best_subset_search(&table, &config);
        assert_eq!(result.tier_name, "loose");
        assert_eq!(result.size, 50);

        config.tiers.reverse();
        let result = best_subset_search(&table, &config);
        assert_eq!(result.tier_name, "tight");
    }

    #[test]
    fn test_dominant_row_falls_back() {
        let mut lls = vec![-100.0; 300];
        lls[17] = 0.0;
        let table = annotated(&lls);
        let result = best_subset_search(&table, &ConvergenceConfig::default());

        assert!(!result.converged);
        assert_eq!(result.tier_name, FALLBACK_TIER);
        assert_eq!(result.size, 200);
        assert_eq!(result.sim_ids[0], 18);
    }

    #[test]
    fn test_too_few_valid_rows_give_nan() {
        let mut table = annotated(&[-1.0, f64::NAN]);
        let diagnostics = analyze(&mut table, &names(), &ConvergenceConfig::default());

        assert_eq!(diagnostics.n_valid, 1);
        assert!(diagnostics.parameter_ess.min_ess.is_nan());
        assert_eq!(diagnostics.parameter_ess.fraction_meeting_target, 0.0);
        assert!(diagnostics.subset.metrics.ess.is_nan());
        assert!(!diagnostics.subset.converged);
        assert!(!diagnostics.is_converged(&ConvergenceConfig::default()));
    }

    #[test]
    fn test_weight_columns_sum_to_member_counts() {
        let lls: Vec<f64> = (0..120).map(|i| -(i as f64) * 0.05).chain([f64::NAN, -1e10]).collect();
        let mut table = annotated(&lls);
        let config = ConvergenceConfig::default();
        let diagnostics = analyze(&mut table, &names(), &config);

        let sum = |f: fn(&ConsolidatedRow) -> f64| table.rows.iter().map(f).sum::<f64>();
        assert_relative_eq!(sum(|r| r.weight_all), diagnostics.n_valid as f64, epsilon = 1e-6);
        assert_relative_eq!(sum(|r| r.weight_retained), diagnostics.n_retained as f64, epsilon = 1e-6);
        assert_relative_eq!(sum(|r| r.weight_best), diagnostics.subset.size as f64, epsilon = 1e-6);

        let members = table.rows.iter().filter(|r| r.is_best_subset).count();
        assert_eq!(members, diagnostics.subset.size);
        assert!(table.rows.iter().all(|r| r.is_valid || r.weight_all == 0.0));
    }

    #[test]
    fn test_diagnostics_serialize_nan_as_null() {
        let mut table = annotated(&[-1.0]);
        let diagnostics = analyze(&mut table, &names(), &ConvergenceConfig::default());
        let json = serde_json::to_string(&diagnostics).unwrap();
        assert!(json.contains("\"min_ess\":null"));
        let back: ConvergenceDiagnostics = serde_json::from_str(&json).unwrap();
        assert!(back.parameter_ess.min_ess.is_nan());
    }
}
