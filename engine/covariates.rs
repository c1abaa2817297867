//! Regular spatial grids and the covariate fields joined onto them.
//!
//! The engine never reprojects: a `CovariateField` is expected to already share the
//! event coordinate frame. The `crs` label is carried for the caller's bookkeeping.

use crate::domain::Bounds;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Coverage checks tolerate this much floating-point slack on each edge.
const COVERAGE_TOLERANCE: f64 = 1e-9;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DimensionMismatchError {
    #[error("A grid needs at least one cell per axis, got {nx} x {ny}.")]
    EmptyGrid { nx: usize, ny: usize },

    #[error("Covariate column '{column}' has {found} values but the field grid has {expected} cells.")]
    ColumnLength {
        column: String,
        expected: usize,
        found: usize,
    },

    #[error("Covariate column '{0}' is not present in the covariate field.")]
    UnknownColumn(String),

    #[error(
        "The covariate field bounds {field:?} do not cover the spatial domain {domain:?}."
    )]
    InsufficientCoverage { field: Bounds, domain: Bounds },

    #[error("Covariate column '{column}' has a missing or non-finite value in model grid cell {cell}.")]
    MissingValue { column: String, cell: usize },
}

/// A regular `nx × ny` discretisation of a rectangle.
///
/// Cells are indexed row-major: cell `(i, j)` (column `i` along x, row `j` along y)
/// has index `j * nx + i`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialGrid {
    pub bounds: Bounds,
    pub nx: usize,
    pub ny: usize,
}

impl SpatialGrid {
    pub fn new(bounds: Bounds, resolution: (usize, usize)) -> Result<Self, DimensionMismatchError> {
        let (nx, ny) = resolution;
        if nx == 0 || ny == 0 {
            return Err(DimensionMismatchError::EmptyGrid { nx, ny });
        }
        Ok(Self { bounds, nx, ny })
    }

    pub fn num_cells(&self) -> usize {
        self.nx * self.ny
    }

    pub fn cell_width(&self) -> f64 {
        self.bounds.width() / self.nx as f64
    }

    pub fn cell_height(&self) -> f64 {
        self.bounds.height() / self.ny as f64
    }

    pub fn cell_area(&self) -> f64 {
        self.cell_width() * self.cell_height()
    }

    pub fn cell_center(&self, index: usize) -> (f64, f64) {
        let i = index % self.nx;
        let j = index / self.nx;
        (
            self.bounds.x_min + (i as f64 + 0.5) * self.cell_width(),
            self.bounds.y_min + (j as f64 + 0.5) * self.cell_height(),
        )
    }

    /// Index of the cell containing `(x, y)`. Points outside the grid map to the
    /// nearest edge cell.
    pub fn cell_of(&self, x: f64, y: f64) -> usize {
        let i = axis_cell(x, self.bounds.x_min, self.cell_width(), self.nx);
        let j = axis_cell(y, self.bounds.y_min, self.cell_height(), self.ny);
        j * self.nx + i
    }
}

fn axis_cell(v: f64, origin: f64, step: f64, n: usize) -> usize {
    if step <= 0.0 {
        return 0;
    }
    let raw = ((v - origin) / step).floor();
    if raw <= 0.0 {
        0
    } else {
        (raw as usize).min(n - 1)
    }
}

/// Named scalar covariates on their own regular grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateField {
    pub crs: String,
    grid: SpatialGrid,
    columns: BTreeMap<String, Vec<f64>>,
}

impl CovariateField {
    /// Creates a field; every column must hold one value per grid cell (row-major).
    /// Missing values are encoded as NaN and only rejected when a model uses them.
    pub fn new(
        crs: impl Into<String>,
        bounds: Bounds,
        resolution: (usize, usize),
        columns: BTreeMap<String, Vec<f64>>,
    ) -> Result<Self, DimensionMismatchError> {
        let grid = SpatialGrid::new(bounds, resolution)?;
        for (name, values) in &columns {
            if values.len() != grid.num_cells() {
                return Err(DimensionMismatchError::ColumnLength {
                    column: name.clone(),
                    expected: grid.num_cells(),
                    found: values.len(),
                });
            }
        }
        Ok(Self {
            crs: crs.into(),
            grid,
            columns,
        })
    }

    pub fn grid(&self) -> &SpatialGrid {
        &self.grid
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Joins the requested columns onto `target` by looking up the field cell that
    /// contains each target cell centre.
    ///
    /// Returns a `[target cells, columns]` design matrix. With `standardize`, each
    /// column is centred and scaled to unit variance over the target cells; constant
    /// columns are only centred.
    pub fn design_for(
        &self,
        target: &SpatialGrid,
        columns: &[String],
        standardize: bool,
    ) -> Result<Array2<f64>, DimensionMismatchError> {
        if !self.grid.bounds.covers(&target.bounds, COVERAGE_TOLERANCE) {
            return Err(DimensionMismatchError::InsufficientCoverage {
                field: self.grid.bounds,
                domain: target.bounds,
            });
        }

        let n_cells = target.num_cells();
        let mut design = Array2::<f64>::zeros((n_cells, columns.len()));
        for (k, name) in columns.iter().enumerate() {
            let values = self
                .columns
                .get(name)
                .ok_or_else(|| DimensionMismatchError::UnknownColumn(name.clone()))?;
            for cell in 0..n_cells {
                let (cx, cy) = target.cell_center(cell);
                let value = values[self.grid.cell_of(cx, cy)];
                if !value.is_finite() {
                    return Err(DimensionMismatchError::MissingValue {
                        column: name.clone(),
                        cell,
                    });
                }
                design[[cell, k]] = value;
            }

            if standardize {
                let mut col = design.column_mut(k);
                let mean = col.mean().unwrap_or(0.0);
                let sd = col.std(0.0);
                if sd > 0.0 {
                    col.mapv_inplace(|v| (v - mean) / sd);
                } else {
                    col.mapv_inplace(|v| v - mean);
                }
            }
        }
        Ok(design)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_bounds() -> Bounds {
        Bounds {
            x_min: 0.0,
            x_max: 1.0,
            y_min: 0.0,
            y_max: 1.0,
        }
    }

    #[test]
    fn test_cell_indexing_round_trips_centres() {
        let grid = SpatialGrid::new(unit_bounds(), (4, 3)).unwrap();
        assert_eq!(grid.num_cells(), 12);
        for idx in 0..grid.num_cells() {
            let (cx, cy) = grid.cell_center(idx);
            assert_eq!(grid.cell_of(cx, cy), idx);
        }
        // Outside points clamp to the edge cells.
        assert_eq!(grid.cell_of(-5.0, -5.0), 0);
        assert_eq!(grid.cell_of(5.0, 5.0), 11);
        assert_eq!(grid.cell_of(1.0, 1.0), 11);
    }

    #[test]
    fn test_empty_grid_rejected() {
        assert!(matches!(
            SpatialGrid::new(unit_bounds(), (0, 3)),
            Err(DimensionMismatchError::EmptyGrid { .. })
        ));
    }

    #[test]
    fn test_design_joins_by_containing_cell() {
        let mut columns = BTreeMap::new();
        columns.insert("pop".to_string(), vec![1.0, 2.0, 3.0, 4.0]);
        let field = CovariateField::new("EPSG:4326", unit_bounds(), (2, 2), columns).unwrap();

        let target = SpatialGrid::new(unit_bounds(), (4, 4)).unwrap();
        let design = field
            .design_for(&target, &["pop".to_string()], false)
            .unwrap();
        assert_eq!(design.dim(), (16, 1));
        // Bottom-left target cell sits in field cell 0, top-right in field cell 3.
        assert_eq!(design[[0, 0]], 1.0);
        assert_eq!(design[[3, 0]], 2.0);
        assert_eq!(design[[12, 0]], 3.0);
        assert_eq!(design[[15, 0]], 4.0);
    }

    #[test]
    fn test_standardized_columns_have_zero_mean() {
        let mut columns = BTreeMap::new();
        columns.insert("a".to_string(), vec![1.0, 2.0, 3.0, 10.0]);
        columns.insert("flat".to_string(), vec![5.0; 4]);
        let field = CovariateField::new("EPSG:4326", unit_bounds(), (2, 2), columns).unwrap();
        let target = SpatialGrid::new(unit_bounds(), (2, 2)).unwrap();
        let design = field
            .design_for(&target, &["a".to_string(), "flat".to_string()], true)
            .unwrap();
        assert!(design.column(0).mean().unwrap().abs() < 1e-12);
        assert!((design.column(0).std(0.0) - 1.0).abs() < 1e-12);
        assert!(design.column(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_design_failures() {
        let mut columns = BTreeMap::new();
        columns.insert("pop".to_string(), vec![1.0, f64::NAN, 3.0, 4.0]);
        let field = CovariateField::new("EPSG:4326", unit_bounds(), (2, 2), columns).unwrap();
        let target = SpatialGrid::new(unit_bounds(), (2, 2)).unwrap();

        assert!(matches!(
            field.design_for(&target, &["pop".to_string()], false),
            Err(DimensionMismatchError::MissingValue { cell: 1, .. })
        ));
        assert!(matches!(
            field.design_for(&target, &["income".to_string()], false),
            Err(DimensionMismatchError::UnknownColumn(_))
        ));

        let wide = SpatialGrid::new(
            Bounds {
                x_min: -1.0,
                x_max: 1.0,
                y_min: 0.0,
                y_max: 1.0,
            },
            (2, 2),
        )
        .unwrap();
        assert!(matches!(
            field.design_for(&wide, &["pop".to_string()], false),
            Err(DimensionMismatchError::InsufficientCoverage { .. })
        ));

        let mut short = BTreeMap::new();
        short.insert("pop".to_string(), vec![1.0]);
        assert!(matches!(
            CovariateField::new("EPSG:4326", unit_bounds(), (2, 2), short),
            Err(DimensionMismatchError::ColumnLength { .. })
        ));
    }
}
