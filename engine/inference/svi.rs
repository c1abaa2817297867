//! Stochastic variational inference with a mean-field Gaussian guide.

use super::{FitWarning, LogPosterior, SviConfig};
use ndarray::{Array1, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::f64::consts::PI;

/// The convergence check inspects the last `1 / CONVERGENCE_FRACTION` of the trace.
const CONVERGENCE_FRACTION: usize = 10;
const INITIAL_LOG_SCALE: f64 = -2.302_585_092_994_046; // ln(0.1)
const LOG_SCALE_BOUNDS: (f64, f64) = (-15.0, 5.0);

pub struct SviFit {
    pub loc: Array1<f64>,
    pub log_scale: Array1<f64>,
    pub loss_trace: Vec<f64>,
    pub warnings: Vec<FitWarning>,
}

/// Adam on the ELBO (ascent).
struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    m: Array1<f64>,
    v: Array1<f64>,
    t: i32,
}

impl Adam {
    fn new(dim: usize, learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            m: Array1::zeros(dim),
            v: Array1::zeros(dim),
            t: 0,
        }
    }

    fn step(&mut self, params: &mut Array1<f64>, grad: &Array1<f64>) {
        self.t += 1;
        let bias1 = 1.0 - self.beta1.powi(self.t);
        let bias2 = 1.0 - self.beta2.powi(self.t);
        for i in 0..params.len() {
            self.m[i] = self.beta1 * self.m[i] + (1.0 - self.beta1) * grad[i];
            self.v[i] = self.beta2 * self.v[i] + (1.0 - self.beta2) * grad[i] * grad[i];
            let m_hat = self.m[i] / bias1;
            let v_hat = self.v[i] / bias2;
            params[i] += self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }
}

/// Maximises the ELBO from `init` (the guide mean) for `config.num_steps` steps.
///
/// Each step records the negative ELBO estimate. Particles whose density or
/// gradient is not finite are dropped; a step with no usable particle records
/// `+inf` and leaves the guide unchanged.
pub fn fit(target: &LogPosterior, init: Array1<f64>, config: &SviConfig, seed: u64) -> SviFit {
    let dim = init.len();
    let mut rng = StdRng::seed_from_u64(seed);
    // Guide parameters packed as [loc, log_scale].
    let mut packed = Array1::<f64>::zeros(2 * dim);
    packed.slice_mut(s![..dim]).assign(&init);
    packed.slice_mut(s![dim..]).fill(INITIAL_LOG_SCALE);
    let mut adam = Adam::new(2 * dim, config.learning_rate);
    let entropy_const = 0.5 * dim as f64 * (1.0 + (2.0 * PI).ln());
    let mut loss_trace = Vec::with_capacity(config.num_steps);

    for step in 0..config.num_steps {
        let loc = packed.slice(s![..dim]).to_owned();
        let log_scale = packed.slice(s![dim..]).to_owned();
        let scale = log_scale.mapv(f64::exp);

        let mut grad = Array1::<f64>::zeros(2 * dim);
        let mut lp_sum = 0.0;
        let mut used = 0usize;
        for _ in 0..config.num_particles {
            let eps: Array1<f64> = (0..dim).map(|_| rng.sample::<f64, _>(StandardNormal)).collect();
            let theta = &loc + &(&scale * &eps);
            let (lp, g) = target.log_density_and_gradient(&theta);
            if !lp.is_finite() || g.iter().any(|v| !v.is_finite()) {
                continue;
            }
            lp_sum += lp;
            used += 1;
            for i in 0..dim {
                grad[i] += g[i];
                grad[dim + i] += g[i] * eps[i] * scale[i];
            }
        }

        if used == 0 {
            log::debug!("SVI step {step}: no finite particle, guide left unchanged");
            loss_trace.push(f64::INFINITY);
            continue;
        }

        let n = used as f64;
        grad.mapv_inplace(|g| g / n);
        // Entropy of the guide contributes +1 per log-scale coordinate.
        grad.slice_mut(s![dim..]).mapv_inplace(|g| g + 1.0);
        let elbo = lp_sum / n + log_scale.sum() + entropy_const;
        loss_trace.push(-elbo);

        adam.step(&mut packed, &grad);
        packed
            .slice_mut(s![dim..])
            .mapv_inplace(|v| v.clamp(LOG_SCALE_BOUNDS.0, LOG_SCALE_BOUNDS.1));

        if (step + 1) % 100 == 0 {
            log::debug!("SVI step {}: loss {:.4}", step + 1, -elbo);
        }
    }

    let mut warnings = Vec::new();
    if let Some(warning) = convergence_warning(&loss_trace) {
        warnings.push(warning);
    }

    SviFit {
        loc: packed.slice(s![..dim]).to_owned(),
        log_scale: packed.slice(s![dim..]).to_owned(),
        loss_trace,
        warnings,
    }
}

/// Compares the mean loss of the two halves of the final 10% of the trace. No
/// net decrease yields a warning. Traces too short to split are not judged.
pub fn convergence_warning(loss_trace: &[f64]) -> Option<FitWarning> {
    let window = loss_trace.len().div_ceil(CONVERGENCE_FRACTION).max(2);
    if loss_trace.len() < window {
        return None;
    }
    let tail = &loss_trace[loss_trace.len() - window..];
    let half = window / 2;
    let mean = |xs: &[f64]| xs.iter().sum::<f64>() / xs.len() as f64;
    let start_mean = mean(&tail[..half]);
    let end_mean = mean(&tail[half..]);
    if end_mean < start_mean {
        None
    } else {
        Some(FitWarning::Convergence {
            window,
            start_mean,
            end_mean,
        })
    }
}
