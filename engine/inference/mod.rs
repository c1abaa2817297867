//! # Inference Engine
//!
//! Fits an [`IntensityModel`] under a [`PriorRegistry`] with one of two back-ends:
//!
//! - **Variational**: mean-field Gaussian over the unconstrained parameters,
//!   optimised with Adam against a reparameterised ELBO estimate.
//! - **Sampling**: NUTS from mini-mcmc, one independently seeded run per chain,
//!   chains run in parallel.
//!
//! Both back-ends see the model only through [`LogPosterior`], and both are
//! deterministic for a fixed seed. Non-fatal problems (a flat loss tail, too many
//! divergences) are attached to the [`FittedResult`] as [`FitWarning`]s.

pub mod hmc;
pub mod svi;
pub mod target;

pub use target::LogPosterior;

use crate::cache::{CacheKey, CacheLookup, ResultCache};
use crate::config::ModelConfig;
use crate::intensity::IntensityModel;
use crate::params::LayoutError;
use crate::priors::{PriorMisspecificationError, PriorRegistry};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceMethod {
    Variational,
    Sampling,
}

/// Hyper-parameters of the variational back-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SviConfig {
    pub num_steps: usize,
    pub learning_rate: f64,
    /// Monte Carlo draws per ELBO gradient estimate.
    pub num_particles: usize,
}

impl Default for SviConfig {
    fn default() -> Self {
        Self {
            num_steps: 1000,
            learning_rate: 0.01,
            num_particles: 4,
        }
    }
}

/// Hyper-parameters of the sampling back-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McmcConfig {
    /// Adaptation iterations per chain, discarded.
    pub num_warmup: usize,
    /// Retained draws per chain.
    pub num_samples: usize,
    pub num_chains: usize,
    /// Acceptance probability the step-size adaptation aims for.
    pub target_accept: f64,
    /// Divergence rate above which a warning is attached to the result.
    pub divergence_threshold: f64,
    /// Start chains from a BFGS posterior mode instead of the prior centre.
    pub find_map: bool,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            num_warmup: 500,
            num_samples: 1000,
            num_chains: 2,
            target_accept: 0.8,
            divergence_threshold: 0.05,
            find_map: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceSettings {
    Variational(SviConfig),
    Sampling(McmcConfig),
}

/// One inference invocation: the method, its hyper-parameters and the seed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRun {
    #[serde(with = "seed_repr")]
    pub seed: u64,
    pub settings: InferenceSettings,
}

impl InferenceRun {
    pub fn variational(seed: u64, config: SviConfig) -> Self {
        Self {
            seed,
            settings: InferenceSettings::Variational(config),
        }
    }

    pub fn sampling(seed: u64, config: McmcConfig) -> Self {
        Self {
            seed,
            settings: InferenceSettings::Sampling(config),
        }
    }

    pub fn method(&self) -> InferenceMethod {
        match self.settings {
            InferenceSettings::Variational(_) => InferenceMethod::Variational,
            InferenceSettings::Sampling(_) => InferenceMethod::Sampling,
        }
    }
}

/// TOML integers are signed 64-bit. Seeds above `i64::MAX` are written as
/// decimal strings; both forms are read back.
mod seed_repr {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(seed: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        match i64::try_from(*seed) {
            Ok(small) => serializer.serialize_i64(small),
            Err(_) => serializer.collect_str(seed),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        deserializer.deserialize_any(SeedVisitor)
    }

    struct SeedVisitor;

    impl Visitor<'_> for SeedVisitor {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a non-negative integer seed, or one written as a decimal string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
            v.parse().map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
        }
    }
}

/// Non-fatal conditions detected during a fit.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitWarning {
    #[error(
        "ConvergenceWarning: the loss did not decrease over the final {window} steps (mean {start_mean:.4} -> {end_mean:.4})."
    )]
    Convergence {
        window: usize,
        start_mean: f64,
        end_mean: f64,
    },
    #[error("Divergence rate {rate:.3} exceeds the threshold {threshold:.3}; inspect the fit before use.")]
    HighDivergence { rate: f64, threshold: f64 },
    #[error("MAP initialisation failed ({reason}); chains started from the prior centre.")]
    MapFallback { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDiagnostics {
    pub chain: usize,
    /// Fraction of retained transitions that moved the chain.
    pub acceptance_rate: f64,
    /// Retained transitions that stayed put.
    pub num_divergences: usize,
    pub num_samples: usize,
    pub effective_sample_size: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerDiagnostics {
    pub chains: Vec<ChainDiagnostics>,
    pub divergence_rate: f64,
    /// Largest Gelman-Rubin statistic across parameters; needs two or more chains.
    pub max_rhat: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Posterior {
    /// Mean-field Gaussian over the unconstrained parameters.
    Variational {
        loc: Array1<f64>,
        log_scale: Array1<f64>,
        loss_trace: Vec<f64>,
    },
    /// Constrained draws, `[num_chains * num_samples, num_parameters]`, chain-major.
    Samples {
        draws: Array2<f64>,
        diagnostics: SamplerDiagnostics,
    },
}

/// Output of one inference run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedResult {
    pub model_config: ModelConfig,
    pub run: InferenceRun,
    /// Every coordinate of the model layout, latent ones included.
    pub parameter_names: Vec<String>,
    pub posterior: Posterior,
    pub warnings: Vec<FitWarning>,
}

impl FittedResult {
    pub fn method(&self) -> InferenceMethod {
        self.run.method()
    }

    pub fn loss_trace(&self) -> Option<&[f64]> {
        match &self.posterior {
            Posterior::Variational { loss_trace, .. } => Some(loss_trace),
            Posterior::Samples { .. } => None,
        }
    }

    pub fn sampler_diagnostics(&self) -> Option<&SamplerDiagnostics> {
        match &self.posterior {
            Posterior::Samples { diagnostics, .. } => Some(diagnostics),
            Posterior::Variational { .. } => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error(transparent)]
    PriorMisspecification(#[from] PriorMisspecificationError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(
        "The log posterior is not finite at the initial point ({0}). Check that the priors put mass where the data are."
    )]
    NonFiniteStart(f64),
    #[error("Sampling chain {chain} failed: {reason}")]
    Sampler { chain: usize, reason: String },
}

/// Runs inference for one model under one prior registry.
pub struct InferenceEngine<'a> {
    model: &'a dyn IntensityModel,
    priors: &'a PriorRegistry,
}

impl<'a> InferenceEngine<'a> {
    pub fn new(
        model: &'a dyn IntensityModel,
        priors: &'a PriorRegistry,
    ) -> Result<Self, InferenceError> {
        priors.validate_names(model.variant(), &model.parameter_names())?;
        Ok(Self { model, priors })
    }

    pub fn model(&self) -> &dyn IntensityModel {
        self.model
    }

    pub fn run(&self, run: &InferenceRun) -> Result<FittedResult, InferenceError> {
        let target = LogPosterior::new(self.model, self.priors)?;
        let init = self.model.initial_point(self.priors);
        let start_density = target.log_density(init.view());
        if !start_density.is_finite() {
            return Err(InferenceError::NonFiniteStart(start_density));
        }

        log::info!(
            "Starting {:?} inference for {:?} model ({} coordinates, seed {})",
            run.method(),
            self.model.variant(),
            target.dim(),
            run.seed
        );

        let (posterior, warnings) = match &run.settings {
            InferenceSettings::Variational(config) => {
                let fit = svi::fit(&target, init, config, run.seed);
                (
                    Posterior::Variational {
                        loc: fit.loc,
                        log_scale: fit.log_scale,
                        loss_trace: fit.loss_trace,
                    },
                    fit.warnings,
                )
            }
            InferenceSettings::Sampling(config) => {
                let fit = hmc::sample(&target, init, config, run.seed)?;
                (
                    Posterior::Samples {
                        draws: fit.draws,
                        diagnostics: fit.diagnostics,
                    },
                    fit.warnings,
                )
            }
        };

        for warning in &warnings {
            log::warn!("{warning}");
        }
        log::info!("{:?} inference finished", run.method());

        Ok(FittedResult {
            model_config: self.model.config().clone(),
            run: run.clone(),
            parameter_names: self.model.layout().names(),
            posterior,
            warnings,
        })
    }
}

/// Load-or-run-then-store.
///
/// A hit is returned as is. Absent and corrupt artifacts both fall through to a
/// fresh run; corruption has already been reported by the cache. A failure to
/// store the fresh result is logged and does not discard it.
pub fn fit_cached(
    engine: &InferenceEngine<'_>,
    cache: &ResultCache,
    key: &CacheKey,
    run: &InferenceRun,
) -> Result<FittedResult, InferenceError> {
    if let CacheLookup::Hit(result) = cache.load(key) {
        log::info!("Using cached result from {}", cache.artifact_path(key).display());
        return Ok(*result);
    }

    let result = engine.run(run)?;
    if let Err(e) = cache.store(key, &result) {
        log::warn!("Fitted result could not be cached: {e}");
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelVariant;
    use crate::covariates::CovariateField;
    use crate::domain::{DomainOptions, Event, EventSet, build_extent};
    use crate::intensity::build_model;
    use crate::priors::Prior;
    use std::collections::BTreeMap;

    #[test]
    fn test_run_method_tag() {
        assert_eq!(
            InferenceRun::variational(1, SviConfig::default()).method(),
            InferenceMethod::Variational
        );
        assert_eq!(
            InferenceRun::sampling(1, McmcConfig::default()).method(),
            InferenceMethod::Sampling
        );
    }

    #[test]
    fn test_engine_rejects_priors_missing_for_covariate_weight() {
        let events = EventSet::new(vec![Event::new(0.0, 0.0, 0.0), Event::new(1.0, 1.0, 1.0)]).unwrap();
        let extent = build_extent(&events, &DomainOptions::default()).unwrap();
        let mut columns = BTreeMap::new();
        columns.insert("pop".to_string(), vec![1.0, 2.0, 3.0, 4.0]);
        let field = CovariateField::new("EPSG:27700", extent.spatial.bounds, (2, 2), columns).unwrap();
        let base = PriorRegistry::new()
            .with("a_0", Prior::Normal { loc: 0.0, scale: 1.0 })
            .with("gp_variance", Prior::HalfNormal { scale: 1.0 });
        let full = base.clone().with("w_pop", Prior::Normal { loc: 0.0, scale: 1.0 });
        let config = ModelConfig::new(ModelVariant::Lgcp)
            .with_grid(2, 2)
            .with_covariates(&["pop"]);
        let model = build_model(&config, &events, &extent, Some(&field), &full).unwrap();

        match InferenceEngine::new(model.as_ref(), &base) {
            Err(InferenceError::PriorMisspecification(PriorMisspecificationError::MissingKeys {
                keys,
                ..
            })) => assert_eq!(keys, vec!["w_pop".to_string()]),
            Err(other) => panic!("expected a missing w_pop prior, got {other:?}"),
            Ok(_) => panic!("expected a missing w_pop prior"),
        }
        assert!(InferenceEngine::new(model.as_ref(), &full).is_ok());
    }

    #[test]
    fn test_seeds_beyond_toml_integers_round_trip() {
        let run = InferenceRun::variational(u64::MAX, SviConfig::default());
        let text = toml::to_string(&run).unwrap();
        assert!(text.contains("seed = \"18446744073709551615\""));
        let back: InferenceRun = toml::from_str(&text).unwrap();
        assert_eq!(back, run);

        let small = InferenceRun::sampling(42, McmcConfig::default());
        let text = toml::to_string(&small).unwrap();
        assert!(text.contains("seed = 42"));
        assert_eq!(toml::from_str::<InferenceRun>(&text).unwrap(), small);

        assert!(toml::from_str::<InferenceRun>("seed = -1\n[settings.variational]\n").is_err());
        assert!(toml::from_str::<InferenceRun>("seed = \"x1\"\n[settings.variational]\n").is_err());
    }

    #[test]
    fn test_warning_messages_name_the_condition() {
        let warning = FitWarning::Convergence {
            window: 10,
            start_mean: 1.0,
            end_mean: 1.5,
        };
        assert!(warning.to_string().starts_with("ConvergenceWarning"));
        let warning = FitWarning::HighDivergence {
            rate: 0.2,
            threshold: 0.05,
        };
        assert!(warning.to_string().contains("0.200"));
    }
}
