//! Small numeric helpers for likelihood collapse, outlier fences and
//! effective sample sizes.
//!
//! All functions take plain slices and return NaN (never panic) when the
//! input is too small to say anything.

/// `ln(mean(exp(x)))`, computed stably.
///
/// Returns NaN for an empty slice.
pub fn log_mean_exp(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + (sum / values.len() as f64).ln()
}

/// Quantile of already sorted data by linear interpolation between order
/// statistics (`h = (n - 1) p`).
pub fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let h = (n - 1) as f64 * p.clamp(0.0, 1.0);
            let lo = h.floor() as usize;
            let hi = (lo + 1).min(n - 1);
            sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
        }
    }
}

/// Quantile of unsorted data; non-finite values are ignored.
pub fn quantile(values: &[f64], p: f64) -> f64 {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    quantile_sorted(&sorted, p)
}

/// Tukey fences `(Q1 - k·IQR, Q3 + k·IQR)`.
pub fn tukey_fences(values: &[f64], k: f64) -> (f64, f64) {
    let q1 = quantile(values, 0.25);
    let q3 = quantile(values, 0.75);
    let iqr = q3 - q1;
    (q1 - k * iqr, q3 + k * iqr)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> f64 {
    let m = mean(values);
    if m.is_nan() {
        return f64::NAN;
    }
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// `sd(w) / mean(w)`.
pub fn coefficient_of_variation(weights: &[f64]) -> f64 {
    if weights.len() < 2 {
        return f64::NAN;
    }
    let m = mean(weights);
    if m == 0.0 {
        return f64::NAN;
    }
    std_dev(weights) / m
}

/// Kish effective sample size `(Σw)² / Σw²`.
pub fn kish_ess(weights: &[f64]) -> f64 {
    let sum: f64 = weights.iter().sum();
    let sum_sq: f64 = weights.iter().map(|w| w * w).sum();
    if sum_sq <= 0.0 || !sum_sq.is_finite() {
        return f64::NAN;
    }
    sum * sum / sum_sq
}

/// Perplexity `exp(H(p))` of the normalised weights.
pub fn perplexity_ess(weights: &[f64]) -> f64 {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return f64::NAN;
    }
    let entropy: f64 = weights
        .iter()
        .map(|w| w / total)
        .filter(|p| *p > 0.0)
        .map(|p| -p * p.ln())
        .sum();
    entropy.exp()
}

/// `W_top × (1 − p_max)`.
///
/// `W_top` is the normalised weight mass of entries at or above the mean
/// weight, `p_max` the largest normalised weight. A single dominant entry
/// drives the index to zero; a flat weight vector gives `1 − 1/n`.
pub fn agreement_index(weights: &[f64]) -> f64 {
    if weights.len() < 2 {
        return f64::NAN;
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return f64::NAN;
    }
    let mean_w = total / weights.len() as f64;
    let w_top: f64 = weights.iter().filter(|w| **w >= mean_w).sum::<f64>() / total;
    let p_max = weights.iter().copied().fold(0.0, f64::max) / total;
    w_top * (1.0 - p_max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_log_mean_exp() {
        assert_relative_eq!(log_mean_exp(&[-3.0, -3.0]), -3.0, epsilon = 1e-12);
        assert_relative_eq!(
            log_mean_exp(&[0.0, 2.0_f64.ln()]),
            1.5_f64.ln(),
            epsilon = 1e-12
        );
        // No underflow for very negative values
        assert_relative_eq!(log_mean_exp(&[-1e4, -1e4]), -1e4, epsilon = 1e-9);
        assert!(log_mean_exp(&[]).is_nan());
    }

    #[test]
    fn test_quantiles_interpolate() {
        let data = [0.0, 10.0, 15.0, 20.0, 30.0];
        assert_relative_eq!(quantile(&data, 0.25), 10.0);
        assert_relative_eq!(quantile(&data, 0.75), 20.0);
        assert_relative_eq!(quantile(&[1.0, 2.0], 0.5), 1.5);
        assert!(quantile(&[], 0.5).is_nan());
    }

    #[test]
    fn test_tukey_fences() {
        let (lo, hi) = tukey_fences(&[0.0, 10.0, 15.0, 20.0, 30.0], 1.5);
        assert_relative_eq!(lo, -5.0);
        assert_relative_eq!(hi, 35.0);
        assert!(36.0 > hi);
        assert!(34.0 <= hi);
    }

    #[test]
    fn test_ess_of_flat_weights_is_n() {
        let w = vec![1.0; 40];
        assert_relative_eq!(kish_ess(&w), 40.0, epsilon = 1e-9);
        assert_relative_eq!(perplexity_ess(&w), 40.0, epsilon = 1e-9);
        assert_relative_eq!(coefficient_of_variation(&w), 0.0);
    }

    #[test]
    fn test_degenerate_weights() {
        let w = [1.0, 0.0, 0.0, 0.0];
        assert_relative_eq!(kish_ess(&w), 1.0);
        assert_relative_eq!(perplexity_ess(&w), 1.0);
        assert_relative_eq!(agreement_index(&w), 0.0);
        assert!(kish_ess(&[0.0, 0.0]).is_nan());
    }

    #[test]
    fn test_agreement_of_flat_weights() {
        assert_relative_eq!(agreement_index(&[2.0; 4]), 0.75);
        assert!(agreement_index(&[1.0]).is_nan());
    }
}
