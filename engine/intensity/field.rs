//! Log-Gaussian background field on the model grid.
//!
//! The Gaussian process is whitened: with `L` the Cholesky factor of the
//! squared-exponential kernel over cell centres and `z ~ N(0, I)`, the field is
//! `sqrt(gp_variance) * L z`. The factor depends only on the grid and the length
//! scale, so it is computed once at build time.

use super::ModelError;
use crate::config::ModelConfig;
use crate::covariates::{CovariateField, DimensionMismatchError, SpatialGrid};
use crate::domain::Extent;
use crate::params::{A_0, GP_VARIANCE, ParameterLayout, Support, covariate_weight_name};
use ndarray::{Array1, Array2, ArrayView1, s};
use ndarray_linalg::{Cholesky, UPLO};
use std::ops::Range;

const KERNEL_JITTER: f64 = 1e-6;

#[derive(Debug, Clone, Copy)]
pub struct FieldParams<'a> {
    pub a_0: f64,
    pub gp_variance: f64,
    pub weights: ArrayView1<'a, f64>,
    pub latent: ArrayView1<'a, f64>,
}

/// Positions of the field parameters inside a model layout.
#[derive(Debug, Clone)]
pub struct FieldIndex {
    a_0: usize,
    gp_variance: usize,
    weights: Range<usize>,
    latent: Range<usize>,
}

impl FieldIndex {
    pub fn params<'a>(&self, values: ArrayView1<'a, f64>) -> FieldParams<'a> {
        FieldParams {
            a_0: values[self.a_0],
            gp_variance: values[self.gp_variance],
            weights: values.slice_move(s![self.weights.clone()]),
            latent: values.slice_move(s![self.latent.clone()]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LatentField {
    grid: SpatialGrid,
    chol: Array2<f64>,
    covariate_names: Vec<String>,
    /// `[cells, covariates]`; zero columns when the model has no covariates.
    design: Array2<f64>,
}

impl LatentField {
    pub fn build(
        extent: &Extent,
        config: &ModelConfig,
        covariates: Option<&CovariateField>,
    ) -> Result<Self, ModelError> {
        let grid = SpatialGrid::new(extent.spatial.bounds, config.grid_resolution)?;

        let design = if config.covariates.is_empty() {
            Array2::zeros((grid.num_cells(), 0))
        } else {
            let field = covariates.ok_or_else(|| {
                DimensionMismatchError::UnknownColumn(config.covariates[0].clone())
            })?;
            field.design_for(&grid, &config.covariates, config.standardize_covariates)?
        };

        let length_scale =
            config.gp_length_scale * grid.bounds.width().max(grid.bounds.height());
        let chol = squared_exponential(&grid, length_scale).cholesky(UPLO::Lower)?;

        log::debug!(
            "Latent field: {}x{} grid, length scale {:.4e}, {} covariate(s)",
            grid.nx,
            grid.ny,
            length_scale,
            config.covariates.len()
        );

        Ok(Self {
            grid,
            chol,
            covariate_names: config.covariates.clone(),
            design,
        })
    }

    /// Adds the field's parameters to `layout`: `a_0`, `gp_variance`, one weight per
    /// covariate, then the latent coordinates.
    pub fn register(&self, layout: &mut ParameterLayout) -> FieldIndex {
        let a_0 = layout.push_named(A_0, Support::Real);
        let gp_variance = layout.push_named(GP_VARIANCE, Support::Positive);
        let w_start = layout.len();
        for name in &self.covariate_names {
            layout.push_named(covariate_weight_name(name), Support::Real);
        }
        let w_end = layout.len();
        let z_start = layout.push_latent(self.grid.num_cells());
        FieldIndex {
            a_0,
            gp_variance,
            weights: w_start..w_end,
            latent: z_start..layout.len(),
        }
    }

    pub fn grid(&self) -> &SpatialGrid {
        &self.grid
    }

    /// Log background intensity of every cell.
    pub fn log_surface(&self, p: &FieldParams) -> Array1<f64> {
        let gp = self.chol.dot(&p.latent) * p.gp_variance.sqrt();
        let linear = self.design.dot(&p.weights);
        gp + linear + p.a_0
    }

    /// Log background intensity of a single cell.
    pub fn log_background_at(&self, cell: usize, p: &FieldParams) -> f64 {
        p.a_0
            + p.gp_variance.sqrt() * self.chol.row(cell).dot(&p.latent)
            + self.design.row(cell).dot(&p.weights)
    }

    /// Integral of `exp(log_surface)` over the domain, per unit time.
    pub fn integral(&self, log_surface: &Array1<f64>) -> f64 {
        log_surface.mapv(f64::exp).sum() * self.grid.cell_area()
    }

    /// Background intensity surface as a `[ny, nx]` array.
    pub fn surface(&self, log_surface: &Array1<f64>) -> Array2<f64> {
        Array2::from_shape_fn((self.grid.ny, self.grid.nx), |(j, i)| {
            log_surface[j * self.grid.nx + i].exp()
        })
    }
}

fn squared_exponential(grid: &SpatialGrid, length_scale: f64) -> Array2<f64> {
    let n = grid.num_cells();
    let centres: Vec<(f64, f64)> = (0..n).map(|c| grid.cell_center(c)).collect();
    let denom = 2.0 * length_scale * length_scale;
    Array2::from_shape_fn((n, n), |(a, b)| {
        let (xa, ya) = centres[a];
        let (xb, yb) = centres[b];
        let d2 = (xa - xb).powi(2) + (ya - yb).powi(2);
        let k = (-d2 / denom).exp();
        if a == b { k + KERNEL_JITTER } else { k }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelVariant;
    use crate::domain::{Bounds, SpatialDomain, TemporalHorizon};
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    fn extent() -> Extent {
        Extent {
            spatial: SpatialDomain {
                bounds: Bounds {
                    x_min: 0.0,
                    x_max: 2.0,
                    y_min: 0.0,
                    y_max: 1.0,
                },
                buffer_fraction: 0.0,
            },
            temporal: TemporalHorizon { t_max: 5.0 },
        }
    }

    #[test]
    fn test_cholesky_reproduces_kernel() {
        let config = ModelConfig::new(ModelVariant::Lgcp).with_grid(3, 2);
        let field = LatentField::build(&extent(), &config, None).unwrap();
        let k = squared_exponential(field.grid(), 0.25 * 2.0);
        let rebuilt = field.chol.dot(&field.chol.t());
        for (a, b) in k.iter().zip(rebuilt.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_zero_latent_gives_flat_surface() {
        let config = ModelConfig::new(ModelVariant::Lgcp).with_grid(4, 4);
        let field = LatentField::build(&extent(), &config, None).unwrap();
        let mut layout = ParameterLayout::new();
        let index = field.register(&mut layout);
        assert_eq!(layout.len(), 2 + 16);

        let values = layout.assemble(&[(A_0, 0.5), (GP_VARIANCE, 2.0)]).unwrap();
        let p = index.params(values.view());
        let surface = field.log_surface(&p);
        assert!(surface.iter().all(|&v| v == 0.5));
        assert_relative_eq!(field.integral(&surface), 0.5f64.exp() * 2.0, epsilon = 1e-12);
        assert_eq!(field.log_background_at(5, &p), 0.5);
        assert_eq!(field.surface(&surface).dim(), (4, 4));
    }

    #[test]
    fn test_covariate_weights_shift_surface() {
        let mut columns = BTreeMap::new();
        columns.insert("pop".to_string(), vec![0.0, 1.0]);
        let cov = CovariateField::new("EPSG:4326", extent().spatial.bounds, (2, 1), columns).unwrap();
        let mut config = ModelConfig::new(ModelVariant::Lgcp)
            .with_grid(2, 1)
            .with_covariates(&["pop"]);
        config.standardize_covariates = false;
        let field = LatentField::build(&extent(), &config, Some(&cov)).unwrap();
        let mut layout = ParameterLayout::new();
        let index = field.register(&mut layout);
        assert_eq!(layout.named(), vec!["a_0", "gp_variance", "w_pop"]);

        let values = layout
            .assemble(&[(A_0, 0.0), (GP_VARIANCE, 1.0), ("w_pop", 3.0)])
            .unwrap();
        let surface = field.log_surface(&index.params(values.view()));
        assert_eq!(surface.to_vec(), vec![0.0, 3.0]);
    }

    #[test]
    fn test_missing_covariate_field_fails() {
        let config = ModelConfig::new(ModelVariant::Lgcp).with_covariates(&["pop"]);
        assert!(matches!(
            LatentField::build(&extent(), &config, None),
            Err(ModelError::DimensionMismatch(DimensionMismatchError::UnknownColumn(_)))
        ));
    }
}
