//! Hawkes triggering on top of a log-Gaussian background field.

use super::field::{FieldIndex, LatentField};
use super::trigger::{TriggerIndex, TriggerKernel, TriggerParams};
use super::{BranchingDecomposition, IntensityModel, ModelError};
use crate::config::{ModelConfig, ModelVariant};
use crate::covariates::{CovariateField, SpatialGrid};
use crate::domain::{EventSet, Extent};
use crate::params::ParameterLayout;
use ndarray::{Array2, ArrayView1};

#[derive(Debug, Clone)]
pub struct CoxHawkesModel {
    config: ModelConfig,
    extent: Extent,
    layout: ParameterLayout,
    trigger_index: TriggerIndex,
    trigger: TriggerKernel,
    field: LatentField,
    field_index: FieldIndex,
    /// Grid cell of each event, in the kernel's time order.
    event_cells: Vec<usize>,
}

impl CoxHawkesModel {
    pub fn new(
        config: &ModelConfig,
        events: &EventSet,
        extent: &Extent,
        covariates: Option<&CovariateField>,
    ) -> Result<Self, ModelError> {
        let field = LatentField::build(extent, config, covariates)?;
        let trigger = TriggerKernel::new(events, extent);
        let mut layout = ParameterLayout::new();
        let field_index = field.register(&mut layout);
        let trigger_index = TriggerIndex::register(&mut layout);
        let event_cells = trigger
            .events()
            .iter()
            .map(|e| field.grid().cell_of(e.x, e.y))
            .collect();
        Ok(Self {
            config: config.clone(),
            extent: *extent,
            layout,
            trigger_index,
            trigger,
            field,
            field_index,
            event_cells,
        })
    }
}

impl IntensityModel for CoxHawkesModel {
    fn variant(&self) -> ModelVariant {
        ModelVariant::CoxHawkes
    }

    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    fn extent(&self) -> &Extent {
        &self.extent
    }

    fn grid(&self) -> &SpatialGrid {
        self.field.grid()
    }

    fn log_intensity(&self, x: f64, y: f64, t: f64, params: ArrayView1<f64>) -> f64 {
        let field = self.field_index.params(params);
        let background = self
            .field
            .log_background_at(self.field.grid().cell_of(x, y), &field)
            .exp();
        let p = self.trigger_index.params(params);
        (background + self.trigger.excitation(x, y, t, &p)).ln()
    }

    fn log_intensity_at_events(&self, params: ArrayView1<f64>) -> Vec<f64> {
        let surface = self.field.log_surface(&self.field_index.params(params));
        let p = self.trigger_index.params(params);
        self.trigger
            .excitation_at_events(&p)
            .into_iter()
            .zip(&self.event_cells)
            .map(|(excitation, &cell)| (surface[cell].exp() + excitation).ln())
            .collect()
    }

    fn branching(
        &self,
        params: ArrayView1<f64>,
    ) -> Result<Option<BranchingDecomposition>, ModelError> {
        let p = self.trigger_index.params(params);
        if p.alpha >= 1.0 {
            return Err(ModelError::Supercritical { alpha: p.alpha });
        }
        let surface = self.field.log_surface(&self.field_index.params(params));
        Ok(Some(BranchingDecomposition {
            background: self.field.integral(&surface) * self.extent.temporal.t_max,
            triggered: self.trigger.expected_offspring(&p),
        }))
    }

    fn background_surface(&self, params: ArrayView1<f64>) -> Array2<f64> {
        let surface = self.field.log_surface(&self.field_index.params(params));
        self.field.surface(&surface)
    }

    fn trigger_params(&self, params: ArrayView1<f64>) -> Option<TriggerParams> {
        Some(self.trigger_index.params(params))
    }

    fn triggered_rate(&self, t: f64, params: ArrayView1<f64>) -> f64 {
        self.trigger.offspring_rate(t, &self.trigger_index.params(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DomainOptions, Event, build_extent};
    use crate::intensity::HawkesModel;
    use crate::params::{A_0, ALPHA, BETA, GP_VARIANCE, SIGMA_SQ};
    use approx::assert_relative_eq;

    fn events() -> EventSet {
        EventSet::new(vec![
            Event::new(0.8, 0.2, 1.0),
            Event::new(0.1, 0.1, 0.0),
            Event::new(0.5, 0.9, 2.5),
            Event::new(0.4, 0.4, 1.7),
        ])
        .unwrap()
    }

    #[test]
    fn test_flat_field_reduces_to_hawkes() {
        let events = events();
        let extent = build_extent(&events, &DomainOptions::default()).unwrap();
        let config = ModelConfig::new(ModelVariant::CoxHawkes).with_grid(2, 2);
        let cox = CoxHawkesModel::new(&config, &events, &extent, None).unwrap();
        let hawkes = HawkesModel::new(&config, &events, &extent).unwrap();

        let rate: f64 = 0.3;
        let trig = [(ALPHA, 0.4), (BETA, 1.5), (SIGMA_SQ, 0.1)];
        let mut cox_values = vec![(A_0, rate.ln()), (GP_VARIANCE, 1.0)];
        cox_values.extend(trig);
        let mut hawkes_values = vec![(A_0, rate)];
        hawkes_values.extend(trig);
        let cox_theta = cox.layout.assemble(&cox_values).unwrap();
        let hawkes_theta = hawkes.layout().assemble(&hawkes_values).unwrap();

        assert_relative_eq!(
            cox.log_likelihood(cox_theta.view()),
            hawkes.log_likelihood(hawkes_theta.view()),
            epsilon = 1e-10
        );
        assert_relative_eq!(
            cox.log_intensity(0.3, 0.3, 2.0, cox_theta.view()),
            hawkes.log_intensity(0.3, 0.3, 2.0, hawkes_theta.view()),
            epsilon = 1e-12
        );
        let split = cox.branching(cox_theta.view()).unwrap().unwrap();
        assert!(split.triggered_fraction() > 0.0);
    }

    #[test]
    fn test_parameter_names_include_field_and_trigger() {
        let events = events();
        let extent = build_extent(&events, &DomainOptions::default()).unwrap();
        let config = ModelConfig::new(ModelVariant::CoxHawkes).with_grid(3, 2);
        let model = CoxHawkesModel::new(&config, &events, &extent, None).unwrap();
        assert_eq!(
            model.parameter_names(),
            vec!["a_0", "gp_variance", "alpha", "beta", "sigma_sq"]
        );
        assert_eq!(model.layout().len(), 5 + 6);
    }
}
