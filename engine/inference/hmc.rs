//! NUTS sampling over the unconstrained parameters, using mini-mcmc.
//!
//! # Design
//!
//! - The [`LogPosterior`] is exposed to mini-mcmc as a [`GradientTarget`] with
//!   the density and gradient computed on ndarray, so burn's autodiff is never
//!   used. Points where either is not finite report [`OUTSIDE_LOG_DENSITY`] and
//!   a zero gradient, which makes every trajectory reaching them divergent.
//! - Each chain is its own NUTS run with its own seed derived from the run seed
//!   and the chain index, so the draws do not depend on how rayon schedules the
//!   chains.
//! - NUTS tunes its step size during warmup and does not report divergences.
//!   A divergent first doubling returns the starting point, so a retained
//!   transition that leaves the chain where it was is counted as divergent.

use super::{ChainDiagnostics, FitWarning, InferenceError, LogPosterior, McmcConfig, SamplerDiagnostics};
use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use burn::tensor::TensorData;
use mini_mcmc::distributions::GradientTarget;
use mini_mcmc::nuts::NUTS;
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Backend type for NUTS - uses f64 for numerical precision
pub type NutsBackend = Autodiff<NdArray<f64>>;

/// Log density reported where the posterior or its gradient is not finite.
pub const OUTSIDE_LOG_DENSITY: f64 = -1e10;

const INIT_JITTER: f64 = 0.1;
const MAP_TOLERANCE: f64 = 1e-6;
const MAP_MAX_ITERATIONS: usize = 200;

pub struct HmcFit {
    /// Constrained draws, chain-major.
    pub draws: Array2<f64>,
    pub diagnostics: SamplerDiagnostics,
    pub warnings: Vec<FitWarning>,
}

/// Borrowing adapter; mini-mcmc clones the target once per chain.
#[derive(Clone, Copy)]
struct NutsTarget<'t, 'a> {
    posterior: &'t LogPosterior<'a>,
}

impl NutsTarget<'_, '_> {
    fn log_density(&self, z: &[f64]) -> f64 {
        if z.len() != self.posterior.dim() {
            return OUTSIDE_LOG_DENSITY;
        }
        let lp = self.posterior.log_density(ArrayView1::from(z));
        if lp.is_finite() { lp } else { OUTSIDE_LOG_DENSITY }
    }

    fn log_density_and_gradient(&self, z: &[f64]) -> (f64, Array1<f64>) {
        let dim = self.posterior.dim();
        if z.len() != dim {
            return (OUTSIDE_LOG_DENSITY, Array1::zeros(dim));
        }
        let (lp, grad) = self.posterior.log_density_and_gradient(&Array1::from(z.to_vec()));
        if lp.is_finite() && grad.iter().all(|g| g.is_finite()) {
            (lp, grad)
        } else {
            (OUTSIDE_LOG_DENSITY, Array1::zeros(dim))
        }
    }
}

fn tensor_values(z: Tensor<NutsBackend, 1>) -> Vec<f64> {
    // An unreadable tensor is left empty and rejected by the length check.
    z.into_data().to_vec().unwrap_or_default()
}

impl GradientTarget<f64, NutsBackend> for NutsTarget<'_, '_> {
    fn unnorm_logp(&self, z: Tensor<NutsBackend, 1>) -> Tensor<NutsBackend, 1> {
        let device = z.device();
        let logp = self.log_density(&tensor_values(z));
        Tensor::<NutsBackend, 1>::from_data(TensorData::new(vec![logp], [1]), &device)
    }

    fn unnorm_logp_and_grad(
        &self,
        z: Tensor<NutsBackend, 1>,
    ) -> (Tensor<NutsBackend, 1>, Tensor<NutsBackend, 1>) {
        let device = z.device();
        let (logp, grad) = self.log_density_and_gradient(&tensor_values(z));

        let logp_tensor =
            Tensor::<NutsBackend, 1>::from_data(TensorData::new(vec![logp], [1]), &device);
        let dim = grad.len();
        let grad_tensor =
            Tensor::<NutsBackend, 1>::from_data(TensorData::new(grad.to_vec(), [dim]), &device);
        (logp_tensor, grad_tensor)
    }
}

pub fn sample(
    target: &LogPosterior,
    init: Array1<f64>,
    config: &McmcConfig,
    seed: u64,
) -> Result<HmcFit, InferenceError> {
    let mut warnings = Vec::new();

    let start = if config.find_map {
        match find_map(target, &init) {
            Ok(mode) => mode,
            Err(reason) => {
                warnings.push(FitWarning::MapFallback { reason });
                init
            }
        }
    } else {
        init
    };

    let runs: Vec<ChainRun> = (0..config.num_chains)
        .into_par_iter()
        .map(|chain| run_chain(target, &start, config, chain, chain_seed(seed, chain)))
        .collect::<Result<_, _>>()?;

    let dim = start.len();
    let total: usize = runs.iter().map(|r| r.draws.nrows()).sum();
    let mut draws = Array2::<f64>::zeros((total, dim));
    let mut row = 0;
    for run in &runs {
        let n = run.draws.nrows();
        draws.slice_mut(s![row..row + n, ..]).assign(&run.draws);
        row += n;
    }

    let num_divergences: usize = runs.iter().map(|r| r.diagnostics.num_divergences).sum();
    let divergence_rate = if total > 0 {
        num_divergences as f64 / total as f64
    } else {
        0.0
    };
    let max_rhat = max_rhat(&draws, config.num_chains, config.num_samples);

    if divergence_rate > config.divergence_threshold {
        warnings.push(FitWarning::HighDivergence {
            rate: divergence_rate,
            threshold: config.divergence_threshold,
        });
    }
    log::info!(
        "NUTS finished: {} chains x {} draws, divergence rate {:.4}, max R-hat {:?}",
        config.num_chains,
        config.num_samples,
        divergence_rate,
        max_rhat
    );

    Ok(HmcFit {
        draws,
        diagnostics: SamplerDiagnostics {
            chains: runs.into_iter().map(|r| r.diagnostics).collect(),
            divergence_rate,
            max_rhat,
        },
        warnings,
    })
}

fn chain_seed(seed: u64, chain: usize) -> u64 {
    seed ^ (chain as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Posterior mode by BFGS on the negative log density.
fn find_map(target: &LogPosterior, init: &Array1<f64>) -> Result<Array1<f64>, String> {
    let dim = init.len();
    let cost_and_grad = |theta: &Array1<f64>| -> (f64, Array1<f64>) {
        let (lp, grad) = target.log_density_and_gradient(theta);
        if lp.is_finite() && grad.iter().all(|g| g.is_finite()) {
            (-lp, -grad)
        } else {
            // Large finite cost keeps the line search inside the support.
            (1e10, Array1::zeros(dim))
        }
    };

    let BfgsSolution {
        final_point,
        final_value,
        iterations,
        ..
    } = Bfgs::new(init.clone(), cost_and_grad)
        .with_tolerance(MAP_TOLERANCE)
        .with_max_iterations(MAP_MAX_ITERATIONS)
        .run()
        .map_err(|e| format!("BFGS failed: {e:?}"))?;

    if !target.log_density(final_point.view()).is_finite() {
        return Err("BFGS ended at a point of zero posterior density".to_string());
    }
    log::debug!("MAP search converged in {iterations} iterations, log density {:.6}", -final_value);
    Ok(final_point)
}

struct ChainRun {
    /// Constrained draws of this chain.
    draws: Array2<f64>,
    diagnostics: ChainDiagnostics,
}

fn run_chain(
    target: &LogPosterior,
    start: &Array1<f64>,
    config: &McmcConfig,
    chain: usize,
    seed: u64,
) -> Result<ChainRun, InferenceError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let dim = start.len();

    let jittered: Array1<f64> = start
        .iter()
        .map(|&v| v + INIT_JITTER * rng.sample::<f64, _>(StandardNormal))
        .collect();
    let initial = if target.log_density(jittered.view()).is_finite() {
        jittered
    } else {
        start.clone()
    };

    let mut sampler = NUTS::<f64, NutsBackend, NutsTarget>::new(
        NutsTarget { posterior: target },
        vec![initial.to_vec()],
        config.target_accept,
    )
    .set_seed(seed);

    let (samples_tensor, run_stats) = sampler
        .run_progress(config.num_samples, config.num_warmup)
        .map_err(|e| InferenceError::Sampler {
            chain,
            reason: e.to_string(),
        })?;
    log::debug!("Chain {chain}: {run_stats}");

    let values: Vec<f64> = samples_tensor
        .into_data()
        .to_vec()
        .map_err(|e| InferenceError::Sampler {
            chain,
            reason: format!("unreadable draws: {e:?}"),
        })?;
    let unconstrained = Array2::from_shape_vec((values.len() / dim.max(1), dim), values).map_err(|e| {
        InferenceError::Sampler {
            chain,
            reason: format!("draws do not match {dim} coordinates: {e}"),
        }
    })?;

    let (num_divergences, acceptance_rate) = transition_counts(&unconstrained);
    let layout = target.model().layout();
    let mut draws = Array2::<f64>::zeros(unconstrained.dim());
    for (mut row, theta) in draws.outer_iter_mut().zip(unconstrained.outer_iter()) {
        row.assign(&layout.constrain(theta).0);
    }

    log::debug!(
        "Chain {chain}: acceptance {acceptance_rate:.3}, {num_divergences} divergences"
    );

    Ok(ChainRun {
        diagnostics: ChainDiagnostics {
            chain,
            acceptance_rate,
            num_divergences,
            num_samples: draws.nrows(),
            effective_sample_size: f64::from(run_stats.ess.mean),
        },
        draws,
    })
}

/// Divergent (stalled) transitions and the fraction of transitions that moved,
/// counted between consecutive retained draws.
fn transition_counts(draws: &Array2<f64>) -> (usize, f64) {
    let transitions = draws.nrows().saturating_sub(1);
    if transitions == 0 {
        return (0, 0.0);
    }
    let stalled = draws
        .outer_iter()
        .zip(draws.outer_iter().skip(1))
        .filter(|(previous, next)| previous == next)
        .count();
    (stalled, (transitions - stalled) as f64 / transitions as f64)
}

/// Largest Gelman-Rubin R-hat across parameters. Parameters with no
/// within-chain variation are skipped.
fn max_rhat(draws: &Array2<f64>, num_chains: usize, num_samples: usize) -> Option<f64> {
    if num_chains < 2 || num_samples < 2 {
        return None;
    }
    let n = num_samples as f64;
    let m = num_chains as f64;
    let mut worst: Option<f64> = None;
    for column in draws.axis_iter(Axis(1)) {
        let mut chain_means = Vec::with_capacity(num_chains);
        let mut within = 0.0;
        for c in 0..num_chains {
            let chain = column.slice(s![c * num_samples..(c + 1) * num_samples]);
            let mean = chain.sum() / n;
            within += chain.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
            chain_means.push(mean);
        }
        within /= m;
        if within <= 0.0 {
            continue;
        }
        let grand = chain_means.iter().sum::<f64>() / m;
        let between = n / (m - 1.0) * chain_means.iter().map(|v| (v - grand).powi(2)).sum::<f64>();
        let var_plus = (n - 1.0) / n * within + between / n;
        let rhat = (var_plus / within).sqrt();
        if rhat.is_finite() {
            worst = Some(worst.map_or(rhat, |w| w.max(rhat)));
        }
    }
    worst
}
