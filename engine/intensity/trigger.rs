//! Self-exciting triggering kernel shared by the Hawkes and Cox-Hawkes models.
//!
//! Each earlier event `j` adds
//! `alpha * beta * exp(-beta (t - t_j)) * N2(x - x_j, y - y_j; sigma_sq)`
//! to the intensity at `(x, y, t)`, where `N2` is the isotropic bivariate normal
//! density. Only strictly earlier events trigger.

use crate::domain::{Bounds, Event, EventSet, Extent};
use crate::params::{ALPHA, BETA, ParameterLayout, SIGMA_SQ, Support};
use ndarray::ArrayView1;
use rayon::prelude::*;
use statrs::function::erf::erf;
use std::f64::consts::{PI, SQRT_2};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerParams {
    pub alpha: f64,
    pub beta: f64,
    pub sigma_sq: f64,
}

impl TriggerParams {
    /// Offspring rate `dt` after a parent, integrated over all space.
    pub fn temporal_decay(&self, dt: f64) -> f64 {
        self.alpha * self.beta * (-self.beta * dt).exp()
    }
}

/// Positions of the triggering parameters inside a model layout.
#[derive(Debug, Clone, Copy)]
pub struct TriggerIndex {
    alpha: usize,
    beta: usize,
    sigma_sq: usize,
}

impl TriggerIndex {
    pub fn register(layout: &mut ParameterLayout) -> Self {
        Self {
            alpha: layout.push_named(ALPHA, Support::UnitInterval),
            beta: layout.push_named(BETA, Support::Positive),
            sigma_sq: layout.push_named(SIGMA_SQ, Support::Positive),
        }
    }

    pub fn params(&self, values: ArrayView1<f64>) -> TriggerParams {
        TriggerParams {
            alpha: values[self.alpha],
            beta: values[self.beta],
            sigma_sq: values[self.sigma_sq],
        }
    }
}

/// Time-ordered events plus the window their offspring are counted in.
#[derive(Debug, Clone)]
pub struct TriggerKernel {
    events: Vec<Event>,
    bounds: Bounds,
    t_max: f64,
}

impl TriggerKernel {
    pub fn new(events: &EventSet, extent: &Extent) -> Self {
        Self {
            events: events.sorted_by_time(),
            bounds: extent.spatial.bounds,
            t_max: extent.temporal.t_max,
        }
    }

    /// Events in the order used by [`TriggerKernel::excitation_at_events`].
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Summed triggering contribution at `(x, y, t)` from events strictly before `t`.
    pub fn excitation(&self, x: f64, y: f64, t: f64, p: &TriggerParams) -> f64 {
        let end = self.events.partition_point(|e| e.t < t);
        self.events[..end]
            .iter()
            .map(|e| kernel(t - e.t, x - e.x, y - e.y, p))
            .sum()
    }

    /// Triggering contribution felt by each event (time order) from its predecessors.
    pub fn excitation_at_events(&self, p: &TriggerParams) -> Vec<f64> {
        self.events
            .par_iter()
            .map(|target| self.excitation(target.x, target.y, target.t, p))
            .collect()
    }

    /// Offspring per unit time at `t` landing inside the domain, from events
    /// strictly before `t`.
    pub fn offspring_rate(&self, t: f64, p: &TriggerParams) -> f64 {
        let sigma = p.sigma_sq.sqrt();
        let end = self.events.partition_point(|e| e.t < t);
        self.events[..end]
            .iter()
            .map(|e| p.temporal_decay(t - e.t) * spatial_mass(e, &self.bounds, sigma))
            .sum()
    }

    /// Expected number of offspring inside the window:
    /// `sum_j alpha (1 - exp(-beta (T - t_j))) P_j`, with `P_j` the Gaussian mass of
    /// event `j`'s spatial kernel falling inside the domain.
    pub fn expected_offspring(&self, p: &TriggerParams) -> f64 {
        let sigma = p.sigma_sq.sqrt();
        self.events
            .iter()
            .map(|e| {
                let temporal = 1.0 - (-p.beta * (self.t_max - e.t)).exp();
                p.alpha * temporal * spatial_mass(e, &self.bounds, sigma)
            })
            .sum()
    }
}

fn kernel(dt: f64, dx: f64, dy: f64, p: &TriggerParams) -> f64 {
    let spatial = (-(dx * dx + dy * dy) / (2.0 * p.sigma_sq)).exp() / (2.0 * PI * p.sigma_sq);
    p.temporal_decay(dt) * spatial
}

fn spatial_mass(e: &Event, bounds: &Bounds, sigma: f64) -> f64 {
    let axis = |lo: f64, hi: f64, centre: f64| {
        0.5 * (erf((hi - centre) / (sigma * SQRT_2)) - erf((lo - centre) / (sigma * SQRT_2)))
    };
    axis(bounds.x_min, bounds.x_max, e.x) * axis(bounds.y_min, bounds.y_max, e.y)
}
