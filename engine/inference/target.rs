//! Unnormalised log posterior over the unconstrained parameter vector.

use super::InferenceError;
use crate::intensity::IntensityModel;
use crate::params::Role;
use crate::priors::{Prior, PriorMisspecificationError, PriorRegistry};
use finitediff::FiniteDiff;
use ndarray::{Array1, ArrayView1};
use std::f64::consts::PI;

/// `log p(θ | data) + const` in unconstrained coordinates:
/// registry priors on the constrained values, the transform's log-Jacobian, a
/// standard-normal prior on every latent coordinate and the model log-likelihood.
pub struct LogPosterior<'a> {
    model: &'a dyn IntensityModel,
    /// One entry per layout coordinate; `None` marks a latent coordinate.
    priors: Vec<Option<Prior>>,
}

impl<'a> LogPosterior<'a> {
    pub fn new(
        model: &'a dyn IntensityModel,
        registry: &PriorRegistry,
    ) -> Result<Self, InferenceError> {
        let mut priors = Vec::with_capacity(model.layout().len());
        let mut missing = Vec::new();
        for spec in model.layout().specs() {
            match spec.role {
                Role::Latent => priors.push(None),
                Role::Named => match registry.get(&spec.name) {
                    Some(prior) => priors.push(Some(*prior)),
                    None => missing.push(spec.name.clone()),
                },
            }
        }
        if !missing.is_empty() {
            return Err(PriorMisspecificationError::MissingKeys {
                variant: model.variant(),
                keys: missing,
            }
            .into());
        }
        Ok(Self { model, priors })
    }

    pub fn dim(&self) -> usize {
        self.priors.len()
    }

    pub fn model(&self) -> &dyn IntensityModel {
        self.model
    }

    pub fn log_density(&self, theta: ArrayView1<f64>) -> f64 {
        let (values, log_jac) = self.model.layout().constrain(theta);
        let mut lp = log_jac;
        for (i, prior) in self.priors.iter().enumerate() {
            lp += match prior {
                Some(prior) => prior.log_density(values[i]),
                None => -0.5 * theta[i] * theta[i] - 0.5 * (2.0 * PI).ln(),
            };
        }
        if !lp.is_finite() {
            return f64::NEG_INFINITY;
        }
        let total = lp + self.model.log_likelihood(values.view());
        if total.is_nan() { f64::NEG_INFINITY } else { total }
    }

    /// Log density and its central finite-difference gradient.
    pub fn log_density_and_gradient(&self, theta: &Array1<f64>) -> (f64, Array1<f64>) {
        let value = self.log_density(theta.view());
        let point = theta.to_vec();
        let grad = point.central_diff(&|x: &Vec<f64>| self.log_density(ArrayView1::from(x.as_slice())));
        (value, Array1::from(grad))
    }
}
