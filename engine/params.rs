//! Parameter layouts and support transforms.
//!
//! Inference back-ends work on an unconstrained vector in `R^d`. Models evaluate
//! intensities on the constrained vector (positive rates, branching ratios in the
//! unit interval). A `ParameterLayout` owns the ordering and the transforms between
//! the two, including the log-Jacobian needed to keep the posterior correct.

use crate::priors::PriorRegistry;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

pub const A_0: &str = "a_0";
pub const ALPHA: &str = "alpha";
pub const BETA: &str = "beta";
pub const SIGMA_SQ: &str = "sigma_sq";
pub const GP_VARIANCE: &str = "gp_variance";

/// Registry key of the weight attached to a covariate column.
pub fn covariate_weight_name(column: &str) -> String {
    format!("w_{column}")
}

pub fn latent_name(index: usize) -> String {
    format!("z[{index}]")
}

/// Where a parameter lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Support {
    Real,
    Positive,
    UnitInterval,
}

impl Support {
    /// Maps an unconstrained value into the support, returning the value and
    /// `log |d value / d u|`.
    pub fn constrain(&self, u: f64) -> (f64, f64) {
        match self {
            Support::Real => (u, 0.0),
            Support::Positive => {
                let v = u.exp();
                (v, u)
            }
            Support::UnitInterval => {
                let v = sigmoid(u);
                // log(v (1 - v)) written to stay finite for large |u|.
                let log_jac = -softplus(-u) - softplus(u);
                (v, log_jac)
            }
        }
    }

    pub fn unconstrain(&self, v: f64) -> f64 {
        match self {
            Support::Real => v,
            Support::Positive => v.ln(),
            Support::UnitInterval => (v / (1.0 - v)).ln(),
        }
    }

    /// Pulls a value strictly inside the support so it can be unconstrained.
    fn interior(&self, v: f64) -> f64 {
        match self {
            Support::Real => v,
            Support::Positive => v.max(1e-6),
            Support::UnitInterval => v.clamp(1e-6, 1.0 - 1e-6),
        }
    }
}

fn sigmoid(u: f64) -> f64 {
    if u >= 0.0 {
        1.0 / (1.0 + (-u).exp())
    } else {
        let e = u.exp();
        e / (1.0 + e)
    }
}

fn softplus(u: f64) -> f64 {
    if u > 30.0 { u } else { u.exp().ln_1p() }
}

/// Whether a parameter is bound to a registry prior or is a whitened latent
/// coordinate with an implicit standard-normal prior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Named,
    Latent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub support: Support,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LayoutError {
    #[error("Parameter '{0}' is not part of this model.")]
    UnknownParameter(String),
    #[error("No value supplied for parameter '{0}'.")]
    MissingValue(String),
    #[error("Expected a parameter vector of length {expected}, got {found}.")]
    LengthMismatch { expected: usize, found: usize },
}

/// Ordered parameter specs of one model.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParameterLayout {
    specs: Vec<ParameterSpec>,
}

impl ParameterLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a named parameter and returns its index.
    pub fn push_named(&mut self, name: impl Into<String>, support: Support) -> usize {
        self.specs.push(ParameterSpec {
            name: name.into(),
            support,
            role: Role::Named,
        });
        self.specs.len() - 1
    }

    /// Appends `count` latent coordinates and returns the index of the first.
    pub fn push_latent(&mut self, count: usize) -> usize {
        let start = self.specs.len();
        for i in 0..count {
            self.specs.push(ParameterSpec {
                name: latent_name(i),
                support: Support::Real,
                role: Role::Latent,
            });
        }
        start
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn specs(&self) -> &[ParameterSpec] {
        &self.specs
    }

    pub fn names(&self) -> Vec<String> {
        self.specs.iter().map(|s| s.name.clone()).collect()
    }

    /// Names of the parameters that need a registry prior, in layout order.
    pub fn named(&self) -> Vec<String> {
        self.specs
            .iter()
            .filter(|s| s.role == Role::Named)
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.specs.iter().position(|s| s.name == name)
    }

    /// Unconstrained → constrained, with the summed log-Jacobian.
    pub fn constrain(&self, theta: ArrayView1<f64>) -> (Array1<f64>, f64) {
        let mut values = Array1::<f64>::zeros(self.specs.len());
        let mut log_jac = 0.0;
        for (i, spec) in self.specs.iter().enumerate() {
            let (v, lj) = spec.support.constrain(theta[i]);
            values[i] = v;
            log_jac += lj;
        }
        (values, log_jac)
    }

    /// Constrained → unconstrained. Boundary values are nudged inside first.
    pub fn unconstrain(&self, values: ArrayView1<f64>) -> Array1<f64> {
        self.specs
            .iter()
            .enumerate()
            .map(|(i, spec)| spec.support.unconstrain(spec.support.interior(values[i])))
            .collect()
    }

    /// Builds a constrained vector from named values. Latent coordinates default to
    /// zero; every named parameter must be supplied.
    pub fn assemble(&self, values: &[(&str, f64)]) -> Result<Array1<f64>, LayoutError> {
        for (name, _) in values {
            if self.index_of(name).is_none() {
                return Err(LayoutError::UnknownParameter(name.to_string()));
            }
        }
        let mut out = Array1::<f64>::zeros(self.specs.len());
        for (i, spec) in self.specs.iter().enumerate() {
            match values.iter().find(|(name, _)| *name == spec.name) {
                Some(&(_, v)) => out[i] = v,
                None if spec.role == Role::Latent => {}
                None => return Err(LayoutError::MissingValue(spec.name.clone())),
            }
        }
        Ok(out)
    }

    pub fn check_len(&self, found: usize) -> Result<(), LayoutError> {
        if found == self.specs.len() {
            Ok(())
        } else {
            Err(LayoutError::LengthMismatch {
                expected: self.specs.len(),
                found,
            })
        }
    }

    /// Starting point in unconstrained space: the central value of each named
    /// parameter's prior, zero for latent coordinates. Named parameters without a
    /// prior start at a support-appropriate default.
    pub fn initial_point(&self, priors: &PriorRegistry) -> Array1<f64> {
        let constrained: Array1<f64> = self
            .specs
            .iter()
            .map(|spec| match spec.role {
                Role::Latent => 0.0,
                Role::Named => priors
                    .get(&spec.name)
                    .map(|p| p.central_value())
                    .unwrap_or(match spec.support {
                        Support::Real => 0.0,
                        Support::Positive => 1.0,
                        Support::UnitInterval => 0.5,
                    }),
            })
            .collect();
        self.unconstrain(constrained.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priors::Prior;
    use approx::assert_relative_eq;

    fn layout() -> ParameterLayout {
        let mut layout = ParameterLayout::new();
        layout.push_named(A_0, Support::Positive);
        layout.push_named(ALPHA, Support::UnitInterval);
        layout.push_named("w_pop", Support::Real);
        layout.push_latent(2);
        layout
    }

    #[test]
    fn test_transform_round_trip() {
        let layout = layout();
        let values = ndarray::array![0.3, 0.25, -1.5, 0.1, -0.2];
        let theta = layout.unconstrain(values.view());
        let (back, _) = layout.constrain(theta.view());
        for (a, b) in values.iter().zip(back.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_log_jacobian_matches_finite_difference() {
        for support in [Support::Positive, Support::UnitInterval] {
            for &u in &[-3.0, -0.4, 0.0, 1.2, 4.0] {
                let h = 1e-6;
                let (vp, _) = support.constrain(u + h);
                let (vm, _) = support.constrain(u - h);
                let fd = ((vp - vm) / (2.0 * h)).ln();
                let (_, lj) = support.constrain(u);
                assert_relative_eq!(lj, fd, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_unit_interval_jacobian_is_finite_in_tails() {
        let (_, lj) = Support::UnitInterval.constrain(800.0);
        assert!(lj.is_finite());
        let (_, lj) = Support::UnitInterval.constrain(-800.0);
        assert!(lj.is_finite());
    }

    #[test]
    fn test_assemble_requires_named_values() {
        let layout = layout();
        let full = layout
            .assemble(&[(A_0, 0.1), (ALPHA, 0.0), ("w_pop", 2.0)])
            .unwrap();
        assert_eq!(full.to_vec(), vec![0.1, 0.0, 2.0, 0.0, 0.0]);

        assert_eq!(
            layout.assemble(&[(A_0, 0.1), (ALPHA, 0.0)]),
            Err(LayoutError::MissingValue("w_pop".to_string()))
        );
        assert_eq!(
            layout.assemble(&[(A_0, 0.1), (ALPHA, 0.0), ("w_pop", 1.0), ("bogus", 1.0)]),
            Err(LayoutError::UnknownParameter("bogus".to_string()))
        );
    }

    #[test]
    fn test_initial_point_uses_prior_centres() {
        let layout = layout();
        let priors = PriorRegistry::new()
            .with(A_0, Prior::Gamma { shape: 2.0, rate: 4.0 })
            .with(ALPHA, Prior::Beta { a: 1.0, b: 3.0 });
        let theta = layout.initial_point(&priors);
        let (values, _) = layout.constrain(theta.view());
        assert_relative_eq!(values[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(values[1], 0.25, epsilon = 1e-12);
        assert_eq!(values[2], 0.0);
        assert_eq!(values[3], 0.0);
    }
}
