//! Importance weights over consolidated rows.
//!
//! Two schemes:
//! - **Akaike**: `exp(-ΔAIC/2)` with `ΔAIC = 2(Lmax − L)`, truncated at a cap
//! - **Tempered**: `exp((L − Lmax)/T)` with `T` tuned so the Kish ESS hits a
//!   target
//!
//! Both return weights normalised to sum to the number of inputs, so a flat
//! weight vector is all ones.

use crate::stats;

/// Lower edge of the log-temperature search.
const LOG_T_MIN: f64 = -20.0;
/// Upper edge of the log-temperature search.
const LOG_T_MAX: f64 = 40.0;
const BISECTION_STEPS: usize = 80;

/// Akaike weights for a set of log-likelihoods.
///
/// Rows whose ΔAIC exceeds `cap` get weight zero. Non-finite likelihoods
/// get weight zero. Returns all zeros when nothing is finite.
pub fn akaike_weights(likelihoods: &[f64], cap: f64) -> Vec<f64> {
    let l_max = max_finite(likelihoods);
    let raw: Vec<f64> = likelihoods
        .iter()
        .map(|&l| {
            if !l.is_finite() {
                return 0.0;
            }
            let delta = 2.0 * (l_max - l);
            if delta > cap {
                0.0
            } else {
                (-delta / 2.0).exp()
            }
        })
        .collect();
    normalise_to_count(raw)
}

/// Tempered weights and the temperature that produced them.
///
/// `T` is found by bisection on `ln T` so that the Kish ESS of the weights
/// is as close as possible to `target_ess` (clamped to `[1, n]`). Weights
/// are floored at `floor` before normalisation; non-finite likelihoods get
/// weight zero.
pub fn tempered_weights(likelihoods: &[f64], target_ess: f64, floor: f64) -> (Vec<f64>, f64) {
    let finite = likelihoods.iter().filter(|l| l.is_finite()).count();
    if finite == 0 {
        return (vec![0.0; likelihoods.len()], f64::NAN);
    }
    if finite == 1 {
        return (raw_tempered(likelihoods, 1.0, floor), 1.0);
    }

    let l_max = max_finite(likelihoods);
    let target = target_ess.clamp(1.0, finite as f64);
    let ess_at = |log_t: f64| stats::kish_ess(&raw_tempered_with(likelihoods, l_max, log_t.exp(), floor));

    // ESS grows with T; bracket then bisect
    let (mut lo, mut hi) = (LOG_T_MIN, LOG_T_MAX);
    let log_t = if ess_at(lo) >= target {
        lo
    } else if ess_at(hi) <= target {
        hi
    } else {
        for _ in 0..BISECTION_STEPS {
            let mid = 0.5 * (lo + hi);
            if ess_at(mid) < target {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        0.5 * (lo + hi)
    };

    let temperature = log_t.exp();
    (raw_tempered(likelihoods, temperature, floor), temperature)
}

fn raw_tempered(likelihoods: &[f64], temperature: f64, floor: f64) -> Vec<f64> {
    let l_max = max_finite(likelihoods);
    normalise_to_count(raw_tempered_with(likelihoods, l_max, temperature, floor))
}

fn raw_tempered_with(likelihoods: &[f64], l_max: f64, temperature: f64, floor: f64) -> Vec<f64> {
    likelihoods
        .iter()
        .map(|&l| {
            if l.is_finite() {
                ((l - l_max) / temperature).exp().max(floor)
            } else {
                0.0
            }
        })
        .collect()
}

fn max_finite(values: &[f64]) -> f64 {
    values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max)
}

/// Scales `raw` so it sums to its length. All-zero input stays zero.
pub fn normalise_to_count(mut raw: Vec<f64>) -> Vec<f64> {
    let total: f64 = raw.iter().sum();
    if total > 0.0 && total.is_finite() {
        let scale = raw.len() as f64 / total;
        raw.iter_mut().for_each(|w| *w *= scale);
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_zero_delta_gives_uniform_akaike_weights() {
        let weights = akaike_weights(&[-12.5; 7], 10.0);
        assert_eq!(weights.len(), 7);
        for w in &weights {
            assert_relative_eq!(*w, 1.0, epsilon = 1e-12);
        }
        assert_relative_eq!(weights.iter().sum::<f64>(), 7.0, epsilon = 1e-12);
    }

    #[test]
    fn test_akaike_cap_truncates() {
        // ΔAIC = 0, 2, 20
        let weights = akaike_weights(&[0.0, -1.0, -10.0], 10.0);
        assert_eq!(weights[2], 0.0);
        assert_relative_eq!(weights[0] / weights[1], 1.0_f64.exp(), epsilon = 1e-9);
        assert_relative_eq!(weights.iter().sum::<f64>(), 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_akaike_ignores_non_finite() {
        let weights = akaike_weights(&[f64::NAN, -1.0], 10.0);
        assert_eq!(weights[0], 0.0);
        assert_relative_eq!(weights[1], 2.0);
    }

    #[test]
    fn test_tempered_weights_hit_target_ess() {
        let lls: Vec<f64> = (0..200).map(|i| -(i as f64) * 0.5).collect();
        let (weights, temperature) = tempered_weights(&lls, 50.0, 1e-300);

        assert!(temperature > 0.0);
        assert_relative_eq!(stats::kish_ess(&weights), 50.0, max_relative = 1e-3);
        assert_relative_eq!(weights.iter().sum::<f64>(), 200.0, epsilon = 1e-6);
        // Monotone in likelihood
        assert!(weights.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_tempered_weights_with_equal_likelihoods() {
        let (weights, _) = tempered_weights(&[-3.0; 5], 2.0, 1e-300);
        for w in weights {
            assert_relative_eq!(w, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_tempered_weights_empty_and_single() {
        let (weights, t) = tempered_weights(&[f64::NAN, f64::NAN], 10.0, 1e-300);
        assert_eq!(weights, vec![0.0, 0.0]);
        assert!(t.is_nan());

        let (weights, _) = tempered_weights(&[-4.0], 10.0, 1e-300);
        assert_eq!(weights, vec![1.0]);
    }
}
