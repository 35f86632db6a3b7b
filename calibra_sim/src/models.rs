//! Reference collaborators so the binary runs end-to-end.
//!
//! - `logistic`: discrete logistic growth with multiplicative log-normal
//!   process noise, parameters `r` and `k`
//! - `sir`: chain-binomial SIR epidemic reporting daily incidence,
//!   parameters `beta` and `gamma`
//! - `WeightedLikelihood`: weighted sum of Gaussian and Poisson terms
//!
//! A parameter missing from the sampled vector falls back to the model
//! setting of the same name.

use crate::error::{Result, RunError};
use calibra_core::config::ModelSpec;
use calibra_env::{
    ComponentKind, EnvError, LikelihoodConfig, LikelihoodModel, ParameterVector, SimulationModel,
    TimeSeries,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Binomial, Distribution, Normal};
use std::sync::Arc;

/// Builds the simulation model named in the configuration.
pub fn build_model(spec: &ModelSpec) -> Result<Arc<dyn SimulationModel>> {
    match spec.name.as_str() {
        "logistic" => Ok(Arc::new(LogisticModel::from_spec(spec)?)),
        "sir" => Ok(Arc::new(SirModel::from_spec(spec)?)),
        other => Err(RunError::Model(format!(
            "unknown model '{}' (expected logistic or sir)",
            other
        ))),
    }
}

fn param(params: &ParameterVector, spec: &ModelSpec, name: &str) -> std::result::Result<f64, EnvError> {
    params
        .get(name)
        .or_else(|| spec.settings.get(name).copied())
        .filter(|v| v.is_finite())
        .ok_or_else(|| EnvError::simulation(format!("missing parameter '{}'", name)))
}

fn steps(spec: &ModelSpec, default: f64) -> Result<usize> {
    let steps = spec.setting("steps", default);
    if !(steps >= 1.0 && steps.fract() == 0.0) {
        return Err(RunError::Model(format!("steps must be a positive integer, got {}", steps)));
    }
    Ok(steps as usize)
}

// ============================================================================
// LOGISTIC GROWTH
// ============================================================================

/// `x[t+1] = x[t] + r·x[t]·(1 − x[t]/k)·dt`, times `exp(ε)`, `ε ~ N(0, noise)`.
#[derive(Debug, Clone)]
pub struct LogisticModel {
    spec: ModelSpec,
    initial: f64,
    steps: usize,
    dt: f64,
    noise: f64,
}

impl LogisticModel {
    pub fn from_spec(spec: &ModelSpec) -> Result<Self> {
        let initial = spec.setting("initial", 10.0);
        let dt = spec.setting("dt", 1.0);
        let noise = spec.setting("noise", 0.05);
        if !(initial > 0.0 && dt > 0.0 && noise >= 0.0) {
            return Err(RunError::Model(
                "logistic: need initial > 0, dt > 0 and noise >= 0".to_string(),
            ));
        }
        Ok(Self {
            spec: spec.clone(),
            initial,
            steps: steps(spec, 30.0)?,
            dt,
            noise,
        })
    }
}

impl SimulationModel for LogisticModel {
    fn simulate(&self, params: &ParameterVector, seed: u64) -> std::result::Result<TimeSeries, EnvError> {
        let r = param(params, &self.spec, "r")?;
        let k = param(params, &self.spec, "k")?;
        if k <= 0.0 {
            return Err(EnvError::simulation(format!("capacity k must be positive, got {}", k)));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let shock = Normal::new(0.0, self.noise).map_err(|e| EnvError::simulation(e.to_string()))?;

        let mut x = self.initial;
        let mut times = Vec::with_capacity(self.steps);
        let mut values = Vec::with_capacity(self.steps);
        for step in 0..self.steps {
            times.push(step as f64 * self.dt);
            values.push(x);
            x = (x + r * x * (1.0 - x / k) * self.dt) * shock.sample(&mut rng).exp();
            if !x.is_finite() {
                return Err(EnvError::simulation(format!("population diverged at step {}", step)));
            }
            x = x.max(0.0);
        }
        Ok(TimeSeries::new(times, values))
    }

    fn name(&self) -> &str {
        "logistic"
    }
}

// ============================================================================
// SIR EPIDEMIC
// ============================================================================

/// Chain-binomial SIR; each step reports the new infections.
#[derive(Debug, Clone)]
pub struct SirModel {
    spec: ModelSpec,
    population: u64,
    initial_infected: u64,
    steps: usize,
}

impl SirModel {
    pub fn from_spec(spec: &ModelSpec) -> Result<Self> {
        let population = spec.setting("population", 1000.0);
        let infected = spec.setting("initial_infected", 5.0);
        if !(population >= 1.0 && infected >= 1.0 && infected <= population) {
            return Err(RunError::Model(
                "sir: need 1 <= initial_infected <= population".to_string(),
            ));
        }
        Ok(Self {
            spec: spec.clone(),
            population: population as u64,
            initial_infected: infected as u64,
            steps: steps(spec, 50.0)?,
        })
    }
}

impl SimulationModel for SirModel {
    fn simulate(&self, params: &ParameterVector, seed: u64) -> std::result::Result<TimeSeries, EnvError> {
        let beta = param(params, &self.spec, "beta")?;
        let gamma = param(params, &self.spec, "gamma")?;
        if beta < 0.0 || gamma < 0.0 {
            return Err(EnvError::simulation("beta and gamma must be non-negative"));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let n = self.population as f64;
        let p_recover = 1.0 - (-gamma).exp();
        let (mut s, mut i) = (self.population - self.initial_infected, self.initial_infected);

        let mut values = Vec::with_capacity(self.steps);
        for _ in 0..self.steps {
            let p_infect = 1.0 - (-beta * i as f64 / n).exp();
            let new_infections = draw_binomial(s, p_infect, &mut rng)?;
            let recoveries = draw_binomial(i, p_recover, &mut rng)?;
            s -= new_infections;
            i = i + new_infections - recoveries;
            values.push(new_infections as f64);
        }
        Ok(TimeSeries::from_values(values))
    }

    fn name(&self) -> &str {
        "sir"
    }
}

fn draw_binomial(n: u64, p: f64, rng: &mut ChaCha8Rng) -> std::result::Result<u64, EnvError> {
    if n == 0 || p <= 0.0 {
        return Ok(0);
    }
    Binomial::new(n, p.min(1.0))
        .map(|d| d.sample(rng))
        .map_err(|e| EnvError::simulation(e.to_string()))
}

// ============================================================================
// LIKELIHOOD
// ============================================================================

/// Weighted sum of the enabled likelihood components.
///
/// Points are matched by index. A length mismatch, an empty series or a
/// non-finite term scores NaN.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedLikelihood;

impl LikelihoodModel for WeightedLikelihood {
    fn log_likelihood(&self, observed: &TimeSeries, estimated: &TimeSeries, config: &LikelihoodConfig) -> f64 {
        if observed.is_empty() || observed.len() != estimated.len() {
            return f64::NAN;
        }

        let mut total = 0.0;
        let mut any = false;
        for component in config.enabled_components() {
            let term = match component.kind {
                ComponentKind::Gaussian => gaussian(&observed.values, &estimated.values, component.sigma),
                ComponentKind::Poisson => poisson(&observed.values, &estimated.values),
            };
            total += component.weight * term;
            any = true;
        }

        if any && total.is_finite() {
            total
        } else {
            f64::NAN
        }
    }

    fn name(&self) -> &str {
        "weighted"
    }
}

fn gaussian(observed: &[f64], estimated: &[f64], sigma: f64) -> f64 {
    let norm = (sigma * (2.0 * std::f64::consts::PI).sqrt()).ln();
    observed
        .iter()
        .zip(estimated)
        .map(|(o, e)| {
            let z = (o - e) / sigma;
            -0.5 * z * z - norm
        })
        .sum()
}

/// Counts are the rounded observations; the rate is floored so an empty
/// simulated point does not zero out the whole score.
fn poisson(observed: &[f64], estimated: &[f64]) -> f64 {
    const MIN_RATE: f64 = 1e-9;
    observed
        .iter()
        .zip(estimated)
        .map(|(o, e)| {
            if *o < 0.0 || *e < 0.0 {
                return f64::NAN;
            }
            let k = o.round();
            let rate = e.max(MIN_RATE);
            k * rate.ln() - rate - ln_factorial(k)
        })
        .sum()
}

fn ln_factorial(k: f64) -> f64 {
    if k < 20.0 {
        return (2..=k as u64).map(|i| (i as f64).ln()).sum();
    }
    // Stirling series, within 1e-9 for k >= 20
    k * k.ln() - k + 0.5 * (2.0 * std::f64::consts::PI * k).ln() + 1.0 / (12.0 * k)
        - 1.0 / (360.0 * k.powi(3))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use calibra_env::LikelihoodComponent;
    use std::collections::BTreeMap;

    fn spec(name: &str, settings: &[(&str, f64)]) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            settings: settings.iter().map(|(k, v)| (k.to_string(), *v)).collect::<BTreeMap<_, _>>(),
        }
    }

    fn logistic_params(r: f64, k: f64) -> ParameterVector {
        ParameterVector::from_pairs([("r", r), ("k", k)])
    }

    #[test]
    fn test_registry() {
        assert_eq!(build_model(&spec("logistic", &[])).unwrap().name(), "logistic");
        assert_eq!(build_model(&spec("sir", &[])).unwrap().name(), "sir");
        assert!(matches!(build_model(&spec("sird", &[])), Err(RunError::Model(_))));
        assert!(build_model(&spec("logistic", &[("steps", 0.0)])).is_err());
    }

    #[test]
    fn test_logistic_is_deterministic_per_seed() {
        let model = LogisticModel::from_spec(&spec("logistic", &[])).unwrap();
        let params = logistic_params(0.4, 500.0);

        let a = model.simulate(&params, 11).unwrap();
        let b = model.simulate(&params, 11).unwrap();
        let c = model.simulate(&params, 12).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 30);
        assert!(a.is_well_formed());
    }

    #[test]
    fn test_logistic_without_noise_approaches_capacity() {
        let model = LogisticModel::from_spec(&spec("logistic", &[("noise", 0.0), ("steps", 200.0)])).unwrap();
        let series = model.simulate(&logistic_params(0.5, 250.0), 1).unwrap();
        assert_relative_eq!(series.values[0], 10.0);
        assert_relative_eq!(*series.values.last().unwrap(), 250.0, epsilon = 1e-6);
    }

    #[test]
    fn test_missing_parameter_uses_setting_or_fails() {
        let model = LogisticModel::from_spec(&spec("logistic", &[("k", 300.0)])).unwrap();
        let only_r = ParameterVector::from_pairs([("r", 0.3)]);
        assert!(model.simulate(&only_r, 1).is_ok());

        let bare = LogisticModel::from_spec(&spec("logistic", &[])).unwrap();
        let err = bare.simulate(&only_r, 1).unwrap_err();
        assert!(err.to_string().contains("'k'"));
    }

    #[test]
    fn test_sir_conserves_population() {
        let model = SirModel::from_spec(&spec("sir", &[("population", 500.0), ("steps", 80.0)])).unwrap();
        let params = ParameterVector::from_pairs([("beta", 0.6), ("gamma", 0.2)]);
        let series = model.simulate(&params, 3).unwrap();

        let infected: f64 = series.values.iter().sum();
        assert!(infected <= 495.0);
        assert!(series.values.iter().all(|v| *v >= 0.0 && v.fract() == 0.0));
        assert_eq!(series, model.simulate(&params, 3).unwrap());
    }

    #[test]
    fn test_gaussian_exact_match() {
        let config = LikelihoodConfig::default();
        let series = TimeSeries::from_values(vec![1.0, 2.0, 3.0]);
        let ll = WeightedLikelihood.log_likelihood(&series, &series, &config);
        let expected = -3.0 * (2.0 * std::f64::consts::PI).sqrt().ln();
        assert_relative_eq!(ll, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_weighted_components() {
        let observed = TimeSeries::from_values(vec![3.0]);
        let estimated = TimeSeries::from_values(vec![2.0]);
        let mut poisson = LikelihoodComponent::poisson();
        poisson.weight = 2.0;
        let mut disabled = LikelihoodComponent::gaussian(1.0);
        disabled.enabled = false;
        let config = LikelihoodConfig {
            components: vec![poisson, disabled],
            failure_sentinel: -1e10,
        };

        let ll = WeightedLikelihood.log_likelihood(&observed, &estimated, &config);
        // 2 * (3 ln 2 - 2 - ln 6)
        assert_relative_eq!(ll, 2.0 * (3.0 * 2f64.ln() - 2.0 - 6f64.ln()), epsilon = 1e-12);
    }

    #[test]
    fn test_failures_score_nan() {
        let config = LikelihoodConfig::default();
        let a = TimeSeries::from_values(vec![1.0, 2.0]);
        let b = TimeSeries::from_values(vec![1.0]);
        assert!(WeightedLikelihood.log_likelihood(&a, &b, &config).is_nan());

        let none = LikelihoodConfig {
            components: vec![],
            failure_sentinel: -1e10,
        };
        assert!(WeightedLikelihood.log_likelihood(&a, &a, &none).is_nan());
    }

    #[test]
    fn test_ln_factorial_branches_agree() {
        let exact: f64 = (2..=20u64).map(|i| (i as f64).ln()).sum();
        assert_relative_eq!(ln_factorial(20.0), exact, epsilon = 1e-9);
        assert_relative_eq!(ln_factorial(0.0), 0.0);
    }
}
