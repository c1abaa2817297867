//! Log-Gaussian Cox process with an optional linear covariate term.

use super::field::{FieldIndex, LatentField};
use super::{BranchingDecomposition, IntensityModel, ModelError};
use crate::config::{ModelConfig, ModelVariant};
use crate::covariates::{CovariateField, SpatialGrid};
use crate::domain::{EventSet, Extent};
use crate::params::ParameterLayout;
use ndarray::{Array2, ArrayView1};

#[derive(Debug, Clone)]
pub struct LgcpModel {
    config: ModelConfig,
    extent: Extent,
    layout: ParameterLayout,
    field: LatentField,
    field_index: FieldIndex,
    /// Grid cell of each observed event.
    event_cells: Vec<usize>,
}

impl LgcpModel {
    pub fn new(
        config: &ModelConfig,
        events: &EventSet,
        extent: &Extent,
        covariates: Option<&CovariateField>,
    ) -> Result<Self, ModelError> {
        let field = LatentField::build(extent, config, covariates)?;
        let mut layout = ParameterLayout::new();
        let field_index = field.register(&mut layout);
        let event_cells = events.iter().map(|e| field.grid().cell_of(e.x, e.y)).collect();
        Ok(Self {
            config: config.clone(),
            extent: *extent,
            layout,
            field,
            field_index,
            event_cells,
        })
    }
}

impl IntensityModel for LgcpModel {
    fn variant(&self) -> ModelVariant {
        ModelVariant::Lgcp
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

    fn log_intensity(&self, x: f64, y: f64, _t: f64, params: ArrayView1<f64>) -> f64 {
        let p = self.field_index.params(params);
        self.field.log_background_at(self.field.grid().cell_of(x, y), &p)
    }

    fn log_intensity_at_events(&self, params: ArrayView1<f64>) -> Vec<f64> {
        let surface = self.field.log_surface(&self.field_index.params(params));
        self.event_cells.iter().map(|&c| surface[c]).collect()
    }

    fn branching(
        &self,
        _params: ArrayView1<f64>,
    ) -> Result<Option<BranchingDecomposition>, ModelError> {
        Ok(None)
    }

    fn background_surface(&self, params: ArrayView1<f64>) -> Array2<f64> {
        let surface = self.field.log_surface(&self.field_index.params(params));
        self.field.surface(&surface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DomainOptions, Event, build_extent};
    use crate::params::{A_0, GP_VARIANCE};
    use approx::assert_relative_eq;

    fn model() -> LgcpModel {
        let events = EventSet::new(vec![
            Event::new(0.1, 0.1, 0.0),
            Event::new(0.9, 0.9, 0.5),
            Event::new(0.2, 0.8, 1.0),
        ])
        .unwrap();
        let extent = build_extent(&events, &DomainOptions::default()).unwrap();
        let config = ModelConfig::new(ModelVariant::Lgcp).with_grid(3, 3);
        LgcpModel::new(&config, &events, &extent, None).unwrap()
    }

    #[test]
    fn test_flat_field_count_is_rate_times_volume() {
        let model = model();
        let theta = model.layout.assemble(&[(A_0, 0.4), (GP_VARIANCE, 1.0)]).unwrap();
        let count = model.expected_event_count(theta.view()).unwrap();
        assert_relative_eq!(count, 0.4f64.exp() * model.extent.volume(), epsilon = 1e-10);
        assert_eq!(model.log_intensity(0.5, 0.5, 0.7, theta.view()), 0.4);
        assert!(model.branching(theta.view()).unwrap().is_none());
    }

    #[test]
    fn test_intensity_is_time_homogeneous() {
        let model = model();
        let mut theta = model.layout.assemble(&[(A_0, 0.0), (GP_VARIANCE, 0.5)]).unwrap();
        theta[3] = 1.2;
        let early = model.log_intensity(0.3, 0.6, 0.0, theta.view());
        let late = model.log_intensity(0.3, 0.6, 1.9, theta.view());
        assert_eq!(early, late);
    }

    #[test]
    fn test_event_values_match_pointwise_evaluation() {
        let model = model();
        let mut theta = model.layout.assemble(&[(A_0, -0.2), (GP_VARIANCE, 2.0)]).unwrap();
        theta[2] = 0.7;
        theta[6] = -1.1;
        let at_events = model.log_intensity_at_events(theta.view());
        for (value, (x, y)) in at_events.iter().zip([(0.1, 0.1), (0.9, 0.9), (0.2, 0.8)]) {
            assert_relative_eq!(*value, model.log_intensity(x, y, 0.0, theta.view()), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_count_integrates_non_flat_surface() {
        let model = model();
        let mut theta = model.layout.assemble(&[(A_0, 0.1), (GP_VARIANCE, 1.5)]).unwrap();
        theta[2] = 0.8;
        theta[7] = -0.6;
        let log_surface = model.field.log_surface(&model.field_index.params(theta.view()));
        let expected = model.field.integral(&log_surface) * model.extent.temporal.t_max;
        let count = model.expected_event_count(theta.view()).unwrap();
        assert_relative_eq!(count, expected, max_relative = 1e-12);
    }
}
