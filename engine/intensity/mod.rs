//! # Intensity Models
//!
//! A model maps a constrained parameter vector (ordered by its
//! [`ParameterLayout`]) to a conditional intensity over the space-time window.
//! The inference back-ends and the evaluator only ever see the
//! [`IntensityModel`] trait; [`build_model`] selects the implementation from a
//! [`ModelConfig`].

pub mod cox_hawkes;
pub mod field;
pub mod hawkes;
pub mod lgcp;
pub mod trigger;

use crate::config::{ConfigError, ModelConfig, ModelVariant};
use crate::covariates::{CovariateField, DimensionMismatchError, SpatialGrid};
use crate::domain::{DataValidationError, EventSet, Extent};
use crate::params::{ALPHA, LayoutError, ParameterLayout};
use crate::priors::{PriorMisspecificationError, PriorRegistry};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cox_hawkes::CoxHawkesModel;
pub use hawkes::HawkesModel;
pub use lgcp::LgcpModel;
pub use trigger::TriggerParams;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error(transparent)]
    DataValidation(#[from] DataValidationError),
    #[error(transparent)]
    DimensionMismatch(#[from] DimensionMismatchError),
    #[error(transparent)]
    PriorMisspecification(#[from] PriorMisspecificationError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Parameter vector does not fit the model: {0}")]
    Layout(#[from] LayoutError),
    #[error(
        "Branching ratio alpha = {alpha} is not below 1; the process is explosive and its expected event count diverges."
    )]
    Supercritical { alpha: f64 },
    #[error("Expected event count is not finite ({0}).")]
    NonFiniteEventCount(f64),
    #[error("Failed to factorize the latent field covariance: {0}")]
    KernelFactorization(#[from] ndarray_linalg::error::LinalgError),
}

/// Split of the expected event count into background and triggered parts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BranchingDecomposition {
    pub background: f64,
    pub triggered: f64,
}

impl BranchingDecomposition {
    pub fn total(&self) -> f64 {
        self.background + self.triggered
    }

    pub fn triggered_fraction(&self) -> f64 {
        let total = self.total();
        if total > 0.0 { self.triggered / total } else { 0.0 }
    }
}

/// Shared contract of the three model families.
///
/// Every `params` argument is the *constrained* vector in layout order.
pub trait IntensityModel: Send + Sync {
    fn variant(&self) -> ModelVariant;

    fn config(&self) -> &ModelConfig;

    fn layout(&self) -> &ParameterLayout;

    fn extent(&self) -> &Extent;

    /// Grid the surfaces are reported on.
    fn grid(&self) -> &SpatialGrid;

    /// Names of the parameters bound to registry priors, in layout order.
    fn parameter_names(&self) -> Vec<String> {
        self.layout().named()
    }

    /// `k` in the AIC penalty. Latent field coordinates are not counted.
    fn num_free_parameters(&self) -> usize {
        self.parameter_names().len()
    }

    fn log_intensity(&self, x: f64, y: f64, t: f64, params: ArrayView1<f64>) -> f64;

    /// `log λ` at every observed event.
    fn log_intensity_at_events(&self, params: ArrayView1<f64>) -> Vec<f64>;

    fn branching(
        &self,
        params: ArrayView1<f64>,
    ) -> Result<Option<BranchingDecomposition>, ModelError>;

    /// Background intensity on the model grid, shape `[ny, nx]`.
    fn background_surface(&self, params: ArrayView1<f64>) -> Array2<f64>;

    /// Triggering parameters; `None` for models without self-excitation.
    fn trigger_params(&self, _params: ArrayView1<f64>) -> Option<TriggerParams> {
        None
    }

    /// Conditional intensity at every cell centre at time `t`, shape `[ny, nx]`.
    fn intensity_surface(&self, t: f64, params: ArrayView1<f64>) -> Array2<f64> {
        let grid = self.grid();
        Array2::from_shape_fn((grid.ny, grid.nx), |(j, i)| {
            let (x, y) = grid.cell_center(j * grid.nx + i);
            self.log_intensity(x, y, t, params).exp()
        })
    }

    /// Background events per unit time over the whole domain.
    fn background_rate(&self, params: ArrayView1<f64>) -> f64 {
        // The surface is constant within each cell, and cells share the domain evenly.
        let surface = self.background_surface(params);
        surface.sum() * self.extent().spatial.bounds.area() / surface.len().max(1) as f64
    }

    /// Offspring events per unit time at `t` over the whole domain.
    fn triggered_rate(&self, _t: f64, _params: ArrayView1<f64>) -> f64 {
        0.0
    }

    /// Events per unit time at `t` over the whole domain.
    fn event_rate(&self, t: f64, params: ArrayView1<f64>) -> f64 {
        self.background_rate(params) + self.triggered_rate(t, params)
    }

    /// Integral of the intensity over the space-time window. Models without a
    /// branching structure integrate their background rate over the horizon.
    fn expected_event_count(&self, params: ArrayView1<f64>) -> Result<f64, ModelError> {
        if let Some(idx) = self.layout().index_of(ALPHA) {
            let alpha = params[idx];
            if alpha >= 1.0 {
                return Err(ModelError::Supercritical { alpha });
            }
        }
        let total = match self.branching(params)? {
            Some(split) => split.total(),
            None => self.background_rate(params) * self.extent().temporal.t_max,
        };
        if total.is_finite() {
            Ok(total)
        } else {
            Err(ModelError::NonFiniteEventCount(total))
        }
    }

    /// Poisson-process log-likelihood; `-inf` when the parameters are invalid.
    fn log_likelihood(&self, params: ArrayView1<f64>) -> f64 {
        if self.layout().check_len(params.len()).is_err() {
            return f64::NEG_INFINITY;
        }
        let count = match self.expected_event_count(params) {
            Ok(count) => count,
            Err(_) => return f64::NEG_INFINITY,
        };
        let sum: f64 = self.log_intensity_at_events(params).iter().sum();
        let ll = sum - count;
        if ll.is_nan() { f64::NEG_INFINITY } else { ll }
    }

    /// Unconstrained starting point derived from the priors' central values.
    fn initial_point(&self, priors: &PriorRegistry) -> Array1<f64> {
        self.layout().initial_point(priors)
    }
}

/// Builds the model selected by `config` over `events`.
///
/// Fails fast on anything that would make inference meaningless: an invalid
/// configuration, events outside `extent`, covariates that do not cover the domain
/// and priors missing for any named parameter.
pub fn build_model(
    config: &ModelConfig,
    events: &EventSet,
    extent: &Extent,
    covariates: Option<&CovariateField>,
    priors: &PriorRegistry,
) -> Result<Box<dyn IntensityModel>, ModelError> {
    config.validate()?;
    extent.check_contains(events)?;

    let variant = config.resolved_variant();
    let model: Box<dyn IntensityModel> = match variant {
        ModelVariant::Hawkes => Box::new(HawkesModel::new(config, events, extent)?),
        ModelVariant::Lgcp => Box::new(LgcpModel::new(config, events, extent, covariates)?),
        ModelVariant::CoxHawkes => {
            Box::new(CoxHawkesModel::new(config, events, extent, covariates)?)
        }
    };
    priors.validate_names(variant, &model.parameter_names())?;

    log::info!(
        "Built {:?} model over {} events with {} free parameters ({} total coordinates)",
        variant,
        events.len(),
        model.num_free_parameters(),
        model.layout().len()
    );
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DomainOptions, Event, build_extent};
    use crate::priors::Prior;

    fn events() -> EventSet {
        EventSet::new(vec![
            Event::new(0.0, 0.0, 0.0),
            Event::new(1.0, 1.0, 1.0),
            Event::new(0.5, 0.2, 2.0),
        ])
        .unwrap()
    }

    fn hawkes_priors() -> PriorRegistry {
        PriorRegistry::new()
            .with("a_0", Prior::Gamma { shape: 2.0, rate: 2.0 })
            .with("alpha", Prior::Beta { a: 2.0, b: 5.0 })
            .with("beta", Prior::Gamma { shape: 2.0, rate: 1.0 })
            .with("sigma_sq", Prior::HalfNormal { scale: 1.0 })
    }

    #[test]
    fn test_factory_reports_missing_beta() {
        let events = events();
        let extent = build_extent(&events, &DomainOptions::default()).unwrap();
        let priors = PriorRegistry::new()
            .with("a_0", Prior::Gamma { shape: 2.0, rate: 2.0 })
            .with("alpha", Prior::Beta { a: 2.0, b: 5.0 })
            .with("sigma_sq", Prior::HalfNormal { scale: 1.0 });
        let err = build_model(
            &ModelConfig::new(ModelVariant::Hawkes),
            &events,
            &extent,
            None,
            &priors,
        )
        .err()
        .unwrap();
        match err {
            ModelError::PriorMisspecification(PriorMisspecificationError::MissingKeys {
                keys,
                ..
            }) => assert_eq!(keys, vec!["beta".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_factory_resolves_cox_background() {
        let events = events();
        let extent = build_extent(&events, &DomainOptions::default()).unwrap();
        let priors = hawkes_priors().with("gp_variance", Prior::HalfNormal { scale: 1.0 });
        let mut config = ModelConfig::new(ModelVariant::Hawkes).with_grid(2, 2);
        config.cox_background = true;
        let model = build_model(&config, &events, &extent, None, &priors).unwrap();
        assert_eq!(model.variant(), ModelVariant::CoxHawkes);
        assert_eq!(model.num_free_parameters(), 5);
        assert_eq!(model.layout().len(), 5 + 4);
    }

    #[test]
    fn test_factory_rejects_events_outside_extent() {
        let events = events();
        let mut extent = build_extent(&events, &DomainOptions::default()).unwrap();
        extent.temporal.t_max = 1.5;
        assert!(matches!(
            build_model(
                &ModelConfig::new(ModelVariant::Hawkes),
                &events,
                &extent,
                None,
                &hawkes_priors()
            ),
            Err(ModelError::DataValidation(DataValidationError::OutsideExtent { index: 2, .. }))
        ));
    }

    #[test]
    fn test_branching_fraction() {
        let split = BranchingDecomposition {
            background: 3.0,
            triggered: 1.0,
        };
        assert_eq!(split.total(), 4.0);
        assert_eq!(split.triggered_fraction(), 0.25);
        let empty = BranchingDecomposition {
            background: 0.0,
            triggered: 0.0,
        };
        assert_eq!(empty.triggered_fraction(), 0.0);
    }
}
