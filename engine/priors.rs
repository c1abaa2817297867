//! Prior distributions and the registry binding them to model parameters.
//!
//! Every fit must be given an explicit registry. Nothing here injects a default
//! prior: a missing entry is a configuration error reported with the full list of
//! missing names.

use crate::config::ModelVariant;
use serde::{Deserialize, Serialize};
use statrs::distribution::{Beta, Continuous, Exp, Gamma, LogNormal, Normal, Uniform};
use std::collections::BTreeMap;
use std::f64::consts::LN_2;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PriorMisspecificationError {
    #[error(
        "The {:?} model requires priors for [{}], which are missing from the registry.",
        .variant,
        .keys.join(", ")
    )]
    MissingKeys {
        variant: ModelVariant,
        keys: Vec<String>,
    },

    #[error("The prior for '{name}' has invalid hyper-parameters: {reason}")]
    InvalidHyperparameter { name: String, reason: String },
}

/// A univariate prior family with its hyper-parameters.
///
/// Serialised with a `family` tag, e.g. `{ family = "half_normal", scale = 2.0 }`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Prior {
    Normal { loc: f64, scale: f64 },
    HalfNormal { scale: f64 },
    LogNormal { loc: f64, scale: f64 },
    Beta { a: f64, b: f64 },
    Gamma { shape: f64, rate: f64 },
    Exponential { rate: f64 },
    Uniform { low: f64, high: f64 },
}

impl Prior {
    /// Normalised log density at `x`; `-inf` outside the support or when the
    /// hyper-parameters do not define a distribution.
    pub fn log_density(&self, x: f64) -> f64 {
        if !x.is_finite() {
            return f64::NEG_INFINITY;
        }
        match self.density() {
            Ok(density) => density.ln_pdf(x),
            Err(_) => f64::NEG_INFINITY,
        }
    }

    /// A representative point of the distribution, used to start inference.
    pub fn central_value(&self) -> f64 {
        match *self {
            Prior::Normal { loc, .. } => loc,
            // Median of the half-normal.
            Prior::HalfNormal { scale } => 0.674_489_75 * scale,
            Prior::LogNormal { loc, .. } => loc.exp(),
            Prior::Beta { a, b } => a / (a + b),
            Prior::Gamma { shape, rate } => shape / rate,
            Prior::Exponential { rate } => 1.0 / rate,
            Prior::Uniform { low, high } => 0.5 * (low + high),
        }
    }

    fn density(&self) -> Result<Density, String> {
        let density = match *self {
            Prior::Normal { loc, scale } => Density::Normal(Normal::new(loc, scale).map_err(describe)?),
            Prior::HalfNormal { scale } => Density::HalfNormal(Normal::new(0.0, scale).map_err(describe)?),
            Prior::LogNormal { loc, scale } => {
                Density::LogNormal(LogNormal::new(loc, scale).map_err(describe)?)
            }
            Prior::Beta { a, b } => Density::Beta(Beta::new(a, b).map_err(describe)?),
            Prior::Gamma { shape, rate } => Density::Gamma(Gamma::new(shape, rate).map_err(describe)?),
            Prior::Exponential { rate } => Density::Exponential(Exp::new(rate).map_err(describe)?),
            Prior::Uniform { low, high } => Density::Uniform(Uniform::new(low, high).map_err(describe)?),
        };
        Ok(density)
    }
}

fn describe(e: impl std::fmt::Display) -> String {
    e.to_string()
}

enum Density {
    Normal(Normal),
    /// Normal folded onto `[0, inf)`.
    HalfNormal(Normal),
    LogNormal(LogNormal),
    Beta(Beta),
    Gamma(Gamma),
    Exponential(Exp),
    Uniform(Uniform),
}

impl Density {
    fn ln_pdf(&self, x: f64) -> f64 {
        match self {
            Density::Normal(d) => d.ln_pdf(x),
            Density::HalfNormal(d) => {
                if x < 0.0 {
                    f64::NEG_INFINITY
                } else {
                    LN_2 + d.ln_pdf(x)
                }
            }
            Density::LogNormal(d) => d.ln_pdf(x),
            Density::Beta(d) => d.ln_pdf(x),
            Density::Gamma(d) => d.ln_pdf(x),
            Density::Exponential(d) => d.ln_pdf(x),
            Density::Uniform(d) => d.ln_pdf(x),
        }
    }
}

/// Parameter name → prior.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriorRegistry {
    priors: BTreeMap<String, Prior>,
}

impl PriorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, prior: Prior) -> Self {
        self.priors.insert(name.into(), prior);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, prior: Prior) -> Option<Prior> {
        self.priors.insert(name.into(), prior)
    }

    pub fn get(&self, name: &str) -> Option<&Prior> {
        self.priors.get(name)
    }

    pub fn len(&self) -> usize {
        self.priors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.priors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.priors.keys().map(String::as_str)
    }

    /// Checks that every base parameter of `variant` has a well-formed prior.
    pub fn validate(&self, variant: ModelVariant) -> Result<(), PriorMisspecificationError> {
        let names: Vec<String> = variant
            .required_parameters()
            .iter()
            .map(|s| s.to_string())
            .collect();
        self.validate_names(variant, &names)
    }

    /// Checks an explicit list of required names, e.g. a model's full parameter list
    /// including covariate weights.
    pub fn validate_names(
        &self,
        variant: ModelVariant,
        required: &[String],
    ) -> Result<(), PriorMisspecificationError> {
        let missing: Vec<String> = required
            .iter()
            .filter(|name| !self.priors.contains_key(name.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(PriorMisspecificationError::MissingKeys {
                variant,
                keys: missing,
            });
        }

        for name in required {
            if let Some(prior) = self.priors.get(name) {
                prior.density().map_err(|reason| {
                    PriorMisspecificationError::InvalidHyperparameter {
                        name: name.clone(),
                        reason,
                    }
                })?;
            }
        }

        for extra in self
            .priors
            .keys()
            .filter(|k| !required.iter().any(|r| r == *k))
        {
            log::debug!("Prior '{extra}' is not used by the {variant:?} model and will be ignored");
        }
        Ok(())
    }
}
