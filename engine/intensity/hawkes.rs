//! Constant-background Hawkes model.

use super::trigger::{TriggerIndex, TriggerKernel, TriggerParams};
use super::{BranchingDecomposition, IntensityModel, ModelError};
use crate::config::{ModelConfig, ModelVariant};
use crate::covariates::SpatialGrid;
use crate::domain::{EventSet, Extent};
use crate::params::{A_0, ParameterLayout, Support};
use ndarray::{Array2, ArrayView1};

#[derive(Debug, Clone)]
pub struct HawkesModel {
    config: ModelConfig,
    extent: Extent,
    layout: ParameterLayout,
    a_0: usize,
    trigger_index: TriggerIndex,
    trigger: TriggerKernel,
    grid: SpatialGrid,
}

impl HawkesModel {
    pub fn new(config: &ModelConfig, events: &EventSet, extent: &Extent) -> Result<Self, ModelError> {
        let mut layout = ParameterLayout::new();
        let a_0 = layout.push_named(A_0, Support::Positive);
        let trigger_index = TriggerIndex::register(&mut layout);
        Ok(Self {
            config: config.clone(),
            extent: *extent,
            layout,
            a_0,
            trigger_index,
            trigger: TriggerKernel::new(events, extent),
            grid: SpatialGrid::new(extent.spatial.bounds, config.grid_resolution)?,
        })
    }
}

impl IntensityModel for HawkesModel {
    fn variant(&self) -> ModelVariant {
        ModelVariant::Hawkes
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
        &self.grid
    }

    fn log_intensity(&self, x: f64, y: f64, t: f64, params: ArrayView1<f64>) -> f64 {
        let p = self.trigger_index.params(params);
        (params[self.a_0] + self.trigger.excitation(x, y, t, &p)).ln()
    }

    fn log_intensity_at_events(&self, params: ArrayView1<f64>) -> Vec<f64> {
        let a_0 = params[self.a_0];
        let p = self.trigger_index.params(params);
        self.trigger
            .excitation_at_events(&p)
            .into_iter()
            .map(|excitation| (a_0 + excitation).ln())
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
        Ok(Some(BranchingDecomposition {
            background: params[self.a_0] * self.extent.volume(),
            triggered: self.trigger.expected_offspring(&p),
        }))
    }

    fn background_surface(&self, params: ArrayView1<f64>) -> Array2<f64> {
        Array2::from_elem((self.grid.ny, self.grid.nx), params[self.a_0])
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
    use crate::params::{ALPHA, BETA, SIGMA_SQ};
    use approx::assert_relative_eq;

    fn model() -> HawkesModel {
        let events = EventSet::new(vec![
            Event::new(0.0, 0.0, 0.0),
            Event::new(1.0, 0.0, 1.0),
            Event::new(0.0, 1.0, 2.0),
        ])
        .unwrap();
        let extent = build_extent(&events, &DomainOptions::default()).unwrap();
        HawkesModel::new(&ModelConfig::new(ModelVariant::Hawkes), &events, &extent).unwrap()
    }

    fn params(model: &HawkesModel, a_0: f64, alpha: f64) -> ndarray::Array1<f64> {
        model
            .layout
            .assemble(&[(A_0, a_0), (ALPHA, alpha), (BETA, 1.0), (SIGMA_SQ, 0.2)])
            .unwrap()
    }

    #[test]
    fn test_no_triggering_when_alpha_is_zero() {
        let model = model();
        let theta = params(&model, 0.1, 0.0);
        assert_eq!(model.log_intensity(0.5, 0.5, 1.5, theta.view()), 0.1f64.ln());
    }

    #[test]
    fn test_background_only_at_time_zero() {
        let model = model();
        let theta = params(&model, 0.3, 0.6);
        assert_eq!(model.log_intensity(0.0, 0.0, 0.0, theta.view()), 0.3f64.ln());
        assert!(model.log_intensity(0.0, 0.0, 0.5, theta.view()) > 0.3f64.ln());
    }

    #[test]
    fn test_expected_count_is_background_plus_offspring() {
        let model = model();
        let theta = params(&model, 0.2, 0.5);
        let count = model.expected_event_count(theta.view()).unwrap();
        let split = model.branching(theta.view()).unwrap().unwrap();
        assert_relative_eq!(count, split.total(), epsilon = 1e-12);
        assert_relative_eq!(split.background, 0.2 * model.extent.volume(), epsilon = 1e-12);
        assert!(split.triggered > 0.0 && split.triggered < 1.5);
    }

    #[test]
    fn test_supercritical_is_reported() {
        let model = model();
        let theta = params(&model, 0.2, 1.0);
        assert!(matches!(
            model.expected_event_count(theta.view()),
            Err(ModelError::Supercritical { .. })
        ));
        assert_eq!(model.log_likelihood(theta.view()), f64::NEG_INFINITY);
    }

    #[test]
    fn test_log_likelihood_matches_definition() {
        let model = model();
        let theta = params(&model, 0.2, 0.3);
        let sum: f64 = model.log_intensity_at_events(theta.view()).iter().sum();
        let count = model.expected_event_count(theta.view()).unwrap();
        assert_relative_eq!(model.log_likelihood(theta.view()), sum - count, epsilon = 1e-12);
    }

    #[test]
    fn test_time_resolved_rates() {
        let model = model();
        let theta = params(&model, 0.2, 0.5);
        let area = model.extent.spatial.bounds.area();

        let before = model.intensity_surface(0.0, theta.view());
        assert_eq!(before.dim(), (model.grid.ny, model.grid.nx));
        assert!(before.iter().all(|&v| (v - 0.2).abs() < 1e-12));
        assert_relative_eq!(model.event_rate(0.0, theta.view()), 0.2 * area, epsilon = 1e-12);

        let after = model.intensity_surface(1.5, theta.view());
        assert!(after.iter().all(|&v| v > 0.2));
        let p = model.trigger_params(theta.view()).unwrap();
        assert_eq!(p.alpha, 0.5);
        let offspring = model.event_rate(1.5, theta.view()) - 0.2 * area;
        assert!(offspring > 0.0 && offspring < p.temporal_decay(0.5) + p.temporal_decay(1.5));
    }
}
