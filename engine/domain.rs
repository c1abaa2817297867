//! # Event Sets and Domain Construction
//!
//! Validated event containers and the derivation of the spatial bounding region
//! and temporal horizon that every intensity model integrates over.
//!
//! An `EventSet` can only be constructed through its validating constructors, so
//! downstream code may rely on it being non-empty with finite coordinates and
//! non-negative times.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single observed event at location `(x, y)` and time `t`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub x: f64,
    pub y: f64,
    pub t: f64,
}

impl Event {
    pub fn new(x: f64, y: f64, t: f64) -> Self {
        Self { x, y, t }
    }
}

/// Errors raised while validating events or deriving their domain.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataValidationError {
    #[error("The event set is empty; at least one event is required.")]
    EmptyEventSet,

    #[error("Event {index} has a non-finite '{field}' value ({value}).")]
    NonFinite {
        index: usize,
        field: &'static str,
        value: f64,
    },

    #[error("Event {index} has negative time {t}; event times must lie in [0, T_max).")]
    NegativeTime { index: usize, t: f64 },

    #[error("Column lengths differ: x has {x}, y has {y} and t has {t} entries.")]
    ColumnLengthMismatch { x: usize, y: usize, t: usize },

    #[error("Spatial buffer fraction must be finite and non-negative, got {0}.")]
    InvalidBuffer(f64),

    #[error("Temporal margin must be finite and strictly positive, got {0}.")]
    InvalidTimeMargin(f64),

    #[error(
        "Temporal margin {margin} is lost in rounding at the largest event time {max_time}; use a larger margin."
    )]
    MarginAbsorbed { max_time: f64, margin: f64 },

    #[error("Event {index} at ({x}, {y}, {t}) lies outside the model's space-time window.")]
    OutsideExtent { index: usize, x: f64, y: f64, t: f64 },
}

/// A validated, non-empty collection of events.
///
/// Storage order is the caller's order. Models that need time ordering take a
/// sorted copy through [`EventSet::sorted_by_time`].
#[derive(Debug, Clone, PartialEq)]
pub struct EventSet {
    events: Vec<Event>,
}

impl EventSet {
    pub fn new(events: Vec<Event>) -> Result<Self, DataValidationError> {
        if events.is_empty() {
            return Err(DataValidationError::EmptyEventSet);
        }
        for (index, event) in events.iter().enumerate() {
            for (field, value) in [("x", event.x), ("y", event.y), ("t", event.t)] {
                if !value.is_finite() {
                    return Err(DataValidationError::NonFinite {
                        index,
                        field,
                        value,
                    });
                }
            }
            if event.t < 0.0 {
                return Err(DataValidationError::NegativeTime { index, t: event.t });
            }
        }
        Ok(Self { events })
    }

    /// Builds an event set from three parallel columns.
    pub fn from_columns(x: &[f64], y: &[f64], t: &[f64]) -> Result<Self, DataValidationError> {
        if x.len() != y.len() || x.len() != t.len() {
            return Err(DataValidationError::ColumnLengthMismatch {
                x: x.len(),
                y: y.len(),
                t: t.len(),
            });
        }
        let events = x
            .iter()
            .zip(y)
            .zip(t)
            .map(|((&x, &y), &t)| Event { x, y, t })
            .collect();
        Self::new(events)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// Returns a copy ordered by time. Ties keep their input order.
    pub fn sorted_by_time(&self) -> Vec<Event> {
        let mut sorted = self.events.clone();
        sorted.sort_by(|a, b| a.t.total_cmp(&b.t));
        sorted
    }

    pub fn max_time(&self) -> f64 {
        self.events
            .iter()
            .map(|e| e.t)
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

/// An axis-aligned rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl Bounds {
    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x_min && x <= self.x_max && y >= self.y_min && y <= self.y_max
    }

    /// True when `other` lies inside `self`, allowing `tol` of slack on every edge.
    pub fn covers(&self, other: &Bounds, tol: f64) -> bool {
        self.x_min <= other.x_min + tol
            && self.x_max >= other.x_max - tol
            && self.y_min <= other.y_min + tol
            && self.y_max >= other.y_max - tol
    }
}

/// The rectangular spatial region a model is defined on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialDomain {
    pub bounds: Bounds,
    /// Fraction of each axis range added as margin on both sides.
    pub buffer_fraction: f64,
}

/// End of the observation window. Always strictly after the last event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemporalHorizon {
    pub t_max: f64,
}

impl TemporalHorizon {
    /// `n` evenly spaced times from 0 to `T_max` inclusive.
    pub fn grid(&self, n: usize) -> Vec<f64> {
        match n {
            0 => Vec::new(),
            1 => vec![0.0],
            _ => (0..n)
                .map(|i| self.t_max * i as f64 / (n - 1) as f64)
                .collect(),
        }
    }
}

/// The space-time window `SpatialDomain × [0, T_max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub spatial: SpatialDomain,
    pub temporal: TemporalHorizon,
}

impl Extent {
    /// Volume of the space-time window.
    pub fn volume(&self) -> f64 {
        self.spatial.bounds.area() * self.temporal.t_max
    }

    /// Fails on the first event not strictly inside `[0, T_max)` and the bounds.
    pub fn check_contains(&self, events: &EventSet) -> Result<(), DataValidationError> {
        for (index, e) in events.iter().enumerate() {
            if !self.spatial.bounds.contains(e.x, e.y) || e.t >= self.temporal.t_max {
                return Err(DataValidationError::OutsideExtent {
                    index,
                    x: e.x,
                    y: e.y,
                    t: e.t,
                });
            }
        }
        Ok(())
    }
}

/// Margins used when deriving an [`Extent`] from events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainOptions {
    pub buffer_fraction: f64,
    /// Forward margin added after the last event. Forecasting runs use larger values.
    pub time_margin: f64,
}

impl Default for DomainOptions {
    fn default() -> Self {
        Self {
            buffer_fraction: 0.01,
            time_margin: 1.0,
        }
    }
}

/// Derives the spatial domain and temporal horizon of an event set.
pub fn build_extent(
    events: &EventSet,
    options: &DomainOptions,
) -> Result<Extent, DataValidationError> {
    if !options.buffer_fraction.is_finite() || options.buffer_fraction < 0.0 {
        return Err(DataValidationError::InvalidBuffer(options.buffer_fraction));
    }
    if !options.time_margin.is_finite() || options.time_margin <= 0.0 {
        return Err(DataValidationError::InvalidTimeMargin(options.time_margin));
    }
    if events.is_empty() {
        return Err(DataValidationError::EmptyEventSet);
    }

    let (x_min, x_max) = axis_range(events.iter().map(|e| e.x));
    let (y_min, y_max) = axis_range(events.iter().map(|e| e.y));
    let buffer_x = axis_buffer(x_min, x_max, options.buffer_fraction);
    let buffer_y = axis_buffer(y_min, y_max, options.buffer_fraction);

    let bounds = Bounds {
        x_min: x_min - buffer_x,
        x_max: x_max + buffer_x,
        y_min: y_min - buffer_y,
        y_max: y_max + buffer_y,
    };
    let max_time = events.max_time();
    let t_max = max_time + options.time_margin;
    if t_max <= max_time {
        return Err(DataValidationError::MarginAbsorbed {
            max_time,
            margin: options.time_margin,
        });
    }

    log::debug!(
        "Derived domain x=[{:.6}, {:.6}], y=[{:.6}, {:.6}], T_max={:.4} from {} events",
        bounds.x_min,
        bounds.x_max,
        bounds.y_min,
        bounds.y_max,
        t_max,
        events.len()
    );

    Ok(Extent {
        spatial: SpatialDomain {
            bounds,
            buffer_fraction: options.buffer_fraction,
        },
        temporal: TemporalHorizon { t_max },
    })
}

fn axis_range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}

// A zero-width axis would give the domain zero area; fall back to a margin
// relative to the coordinate magnitude.
fn axis_buffer(lo: f64, hi: f64, fraction: f64) -> f64 {
    let range = hi - lo;
    if range > 0.0 {
        fraction * range
    } else {
        fraction * lo.abs().max(1.0)
    }
}
