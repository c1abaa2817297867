//! Engine configuration.
//!
//! Every tunable lives in an explicit structure handed to the component that needs
//! it, so several model comparisons with different settings can run side by side.
//! The whole configuration round-trips through TOML.

use crate::domain::DomainOptions;
use crate::evaluate::EvaluatorConfig;
use crate::inference::{InferenceRun, InferenceSettings};
use crate::params::{A_0, ALPHA, BETA, GP_VARIANCE, SIGMA_SQ};
use crate::priors::PriorRegistry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// The intensity model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    /// Constant background plus self-exciting triggering.
    Hawkes,
    /// Log-Gaussian Cox process background, no triggering.
    Lgcp,
    /// Log-Gaussian Cox background plus self-exciting triggering.
    CoxHawkes,
}

impl ModelVariant {
    /// Parameters every model of this family needs a prior for. Covariate weights
    /// come on top of these.
    pub fn required_parameters(&self) -> &'static [&'static str] {
        match self {
            ModelVariant::Hawkes => &[A_0, ALPHA, BETA, SIGMA_SQ],
            ModelVariant::Lgcp => &[A_0, GP_VARIANCE],
            ModelVariant::CoxHawkes => &[A_0, GP_VARIANCE, ALPHA, BETA, SIGMA_SQ],
        }
    }

    pub fn is_self_exciting(&self) -> bool {
        matches!(self, ModelVariant::Hawkes | ModelVariant::CoxHawkes)
    }
}

/// Structural description of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub variant: ModelVariant,
    /// Number of grid cells along x and y used to discretise the latent field.
    pub grid_resolution: (usize, usize),
    /// Covariate columns entering the log background linearly.
    #[serde(default)]
    pub covariates: Vec<String>,
    /// Replace the constant Hawkes background with a log-Gaussian field.
    #[serde(default)]
    pub cox_background: bool,
    /// Kernel length scale as a fraction of the longer domain side.
    #[serde(default = "default_gp_length_scale")]
    pub gp_length_scale: f64,
    #[serde(default = "default_standardize")]
    pub standardize_covariates: bool,
}

fn default_gp_length_scale() -> f64 {
    0.25
}

fn default_standardize() -> bool {
    true
}

impl ModelConfig {
    pub fn new(variant: ModelVariant) -> Self {
        Self {
            variant,
            grid_resolution: (10, 10),
            covariates: Vec::new(),
            cox_background: false,
            gp_length_scale: default_gp_length_scale(),
            standardize_covariates: default_standardize(),
        }
    }

    pub fn with_covariates(mut self, columns: &[&str]) -> Self {
        self.covariates = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_grid(mut self, nx: usize, ny: usize) -> Self {
        self.grid_resolution = (nx, ny);
        self
    }

    /// The family actually built: a Hawkes model with a Cox background is a
    /// Cox-Hawkes model.
    pub fn resolved_variant(&self) -> ModelVariant {
        match (self.variant, self.cox_background) {
            (ModelVariant::Hawkes, true) => ModelVariant::CoxHawkes,
            (variant, _) => variant,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (nx, ny) = self.grid_resolution;
        if nx == 0 || ny == 0 {
            return Err(ConfigError::Invalid {
                field: "model.grid_resolution",
                reason: format!("need at least one cell per axis, got ({nx}, {ny})"),
            });
        }
        if !(self.gp_length_scale.is_finite() && self.gp_length_scale > 0.0) {
            return Err(ConfigError::Invalid {
                field: "model.gp_length_scale",
                reason: format!("must be positive, got {}", self.gp_length_scale),
            });
        }
        if !self.covariates.is_empty() && self.resolved_variant() == ModelVariant::Hawkes {
            return Err(ConfigError::Invalid {
                field: "model.covariates",
                reason: "covariates require a log-Gaussian background (lgcp, cox_hawkes or cox_background = true)".to_string(),
            });
        }
        Ok(())
    }
}

/// Top-level configuration for one model fit and its evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub domain: DomainOptions,
    pub model: ModelConfig,
    pub inference: InferenceRun,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub priors: PriorRegistry,
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.model.validate()?;

        match &self.inference.settings {
            InferenceSettings::Variational(svi) => {
                if svi.num_steps == 0 {
                    return Err(invalid("inference.num_steps", "must be at least 1"));
                }
                if !(svi.learning_rate.is_finite() && svi.learning_rate > 0.0) {
                    return Err(invalid("inference.learning_rate", "must be positive"));
                }
                if svi.num_particles == 0 {
                    return Err(invalid("inference.num_particles", "must be at least 1"));
                }
            }
            InferenceSettings::Sampling(mcmc) => {
                if mcmc.num_chains == 0 {
                    return Err(invalid("inference.num_chains", "must be at least 1"));
                }
                if mcmc.num_samples == 0 {
                    return Err(invalid("inference.num_samples", "must be at least 1"));
                }
                if !(mcmc.target_accept > 0.0 && mcmc.target_accept < 1.0) {
                    return Err(invalid("inference.target_accept", "must lie in (0, 1)"));
                }
                if !(0.0..=1.0).contains(&mcmc.divergence_threshold) {
                    return Err(invalid(
                        "inference.divergence_threshold",
                        "must lie in [0, 1]",
                    ));
                }
            }
        }

        if self.evaluator.num_draws == 0 {
            return Err(invalid("evaluator.num_draws", "must be at least 1"));
        }
        if !(self.evaluator.credible_level > 0.0 && self.evaluator.credible_level < 1.0) {
            return Err(invalid("evaluator.credible_level", "must lie in (0, 1)"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priors::Prior;

    const CONFIG: &str = r#"
[domain]
time_margin = 7.0

[model]
variant = "hawkes"
grid_resolution = [5, 4]
cox_background = true
covariates = ["popdensity", "houseprice"]

[inference]
seed = 42

[inference.settings.sampling]
num_warmup = 100
num_samples = 400
num_chains = 2

[evaluator]
num_draws = 50

[priors.a_0]
family = "normal"
loc = 1.0
scale = 10.0

[priors.alpha]
family = "beta"
a = 20.0
b = 60.0
"#;

    #[test]
    fn test_parse_full_config() {
        let config = EngineConfig::from_toml_str(CONFIG).unwrap();
        assert_eq!(config.domain.time_margin, 7.0);
        assert_eq!(config.domain.buffer_fraction, 0.01);
        assert_eq!(config.model.grid_resolution, (5, 4));
        assert_eq!(config.model.resolved_variant(), ModelVariant::CoxHawkes);
        assert_eq!(config.model.gp_length_scale, 0.25);
        assert_eq!(config.inference.seed, 42);
        match &config.inference.settings {
            InferenceSettings::Sampling(mcmc) => {
                assert_eq!(mcmc.num_chains, 2);
                assert_eq!(mcmc.divergence_threshold, 0.05);
            }
            other => panic!("expected sampling settings, got {other:?}"),
        }
        assert_eq!(config.evaluator.num_draws, 50);
        assert_eq!(
            config.priors.get("alpha"),
            Some(&Prior::Beta { a: 20.0, b: 60.0 })
        );
    }

    #[test]
    fn test_config_round_trips() {
        let config = EngineConfig::from_toml_str(CONFIG).unwrap();
        let text = toml::to_string_pretty(&config).unwrap();
        let back = EngineConfig::from_toml_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_rejects_covariates_on_constant_background() {
        let mut config = ModelConfig::new(ModelVariant::Hawkes);
        config.covariates = vec!["pop".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "model.covariates", .. })
        ));
    }

    #[test]
    fn test_rejects_empty_grid() {
        let config = ModelConfig::new(ModelVariant::Lgcp).with_grid(0, 3);
        assert!(config.validate().is_err());
    }
}
