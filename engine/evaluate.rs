//! # Model Evaluator
//!
//! Read-only summaries of fitted results: expected AIC and ranking, expected
//! event counts, per-parameter posterior summaries, the branching decomposition
//! of Hawkes-family fits and the posterior-mean background surface. Time-resolved
//! read-outs cover the conditional intensity surface at a given time, the event
//! rate over time and the triggering decay curve.
//!
//! Every statistic is a Monte Carlo average over constrained posterior draws.
//! Sampling results contribute their stored draws, thinned evenly to
//! `num_draws`. Variational results are sampled from the guide with the
//! evaluator's own seed, so evaluation is reproducible.

use crate::inference::{FittedResult, Posterior};
use crate::intensity::{BranchingDecomposition, IntensityModel, ModelError};
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Posterior draws averaged over per statistic.
    pub num_draws: usize,
    /// Seed for drawing from variational guides.
    pub seed: u64,
    /// Mass of the equal-tailed credible interval in parameter summaries.
    pub credible_level: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            num_draws: 200,
            seed: 0,
            credible_level: 0.9,
        }
    }
}

#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(
        "The fitted result has parameters [{found}] but the model expects [{expected}]. Was it fitted with a different configuration?"
    )]
    LayoutMismatch { expected: String, found: String },
    #[error(
        "The stored posterior has {found} coordinates per draw but the model has {expected}."
    )]
    PosteriorShape { expected: usize, found: usize },
    #[error("The fitted result contains no posterior draws.")]
    NoDraws,
    #[error("Time {t} lies outside the model horizon [0, {t_max}].")]
    TimeOutsideHorizon { t: f64, t_max: f64 },
    #[error("Lag {0} must be finite and non-negative.")]
    InvalidLag(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSummary {
    pub name: String,
    pub mean: f64,
    pub std_dev: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Posterior mean and equal-tailed credible band of a curve at one abscissa.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub at: f64,
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedModel {
    pub name: String,
    pub expected_aic: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ModelEvaluator {
    config: EvaluatorConfig,
}

impl ModelEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Constrained draws used by every statistic, `[draws, parameters]`.
    pub fn posterior_draws(
        &self,
        result: &FittedResult,
        model: &dyn IntensityModel,
    ) -> Result<Array2<f64>, EvaluationError> {
        let names = model.layout().names();
        if result.parameter_names != names {
            return Err(EvaluationError::LayoutMismatch {
                expected: names.join(", "),
                found: result.parameter_names.join(", "),
            });
        }
        let wanted = self.config.num_draws.max(1);

        let dim = names.len();
        match &result.posterior {
            Posterior::Samples { draws, .. } => {
                if draws.ncols() != dim {
                    return Err(EvaluationError::PosteriorShape {
                        expected: dim,
                        found: draws.ncols(),
                    });
                }
                let available = draws.nrows();
                if available == 0 {
                    return Err(EvaluationError::NoDraws);
                }
                if available <= wanted {
                    return Ok(draws.clone());
                }
                let rows: Vec<usize> = (0..wanted).map(|i| i * available / wanted).collect();
                Ok(draws.select(ndarray::Axis(0), &rows))
            }
            Posterior::Variational { loc, log_scale, .. } => {
                for found in [loc.len(), log_scale.len()] {
                    if found != dim {
                        return Err(EvaluationError::PosteriorShape { expected: dim, found });
                    }
                }
                let scale = log_scale.mapv(f64::exp);
                let mut rng = StdRng::seed_from_u64(self.config.seed);
                let mut out = Array2::<f64>::zeros((wanted, loc.len()));
                for mut row in out.rows_mut() {
                    let theta: Array1<f64> = loc
                        .iter()
                        .zip(scale.iter())
                        .map(|(m, s)| m + s * rng.sample::<f64, _>(StandardNormal))
                        .collect();
                    let (values, _) = model.layout().constrain(theta.view());
                    row.assign(&values);
                }
                Ok(out)
            }
        }
    }

    /// `-2 E[log L] + 2k`, with `k` the model's free (named) parameter count.
    pub fn expected_aic(
        &self,
        result: &FittedResult,
        model: &dyn IntensityModel,
    ) -> Result<f64, EvaluationError> {
        let draws = self.posterior_draws(result, model)?;
        let mean_ll = mean_over(&draws, |row| model.log_likelihood(row));
        let k = model.num_free_parameters() as f64;
        Ok(-2.0 * mean_ll + 2.0 * k)
    }

    /// Posterior mean of the expected event count. An explosive or non-finite draw
    /// is an error, never averaged away.
    pub fn expected_event_count(
        &self,
        result: &FittedResult,
        model: &dyn IntensityModel,
    ) -> Result<f64, EvaluationError> {
        let draws = self.posterior_draws(result, model)?;
        let mut total = 0.0;
        for row in draws.rows() {
            total += model.expected_event_count(row)?;
        }
        Ok(total / draws.nrows() as f64)
    }

    /// Expected AIC of each entry, ascending. Ties keep the input order.
    pub fn rank(
        &self,
        entries: &[(&str, &FittedResult, &dyn IntensityModel)],
    ) -> Result<Vec<RankedModel>, EvaluationError> {
        let scores = entries
            .iter()
            .map(|(name, result, model)| Ok((name.to_string(), self.expected_aic(result, *model)?)))
            .collect::<Result<Vec<_>, EvaluationError>>()?;
        Ok(Self::rank_scores(scores))
    }

    pub fn rank_scores(scores: Vec<(String, f64)>) -> Vec<RankedModel> {
        let mut ranked: Vec<RankedModel> = scores
            .into_iter()
            .map(|(name, expected_aic)| RankedModel { name, expected_aic })
            .collect();
        ranked.sort_by(|a, b| a.expected_aic.total_cmp(&b.expected_aic));
        ranked
    }

    /// Mean, standard deviation and equal-tailed credible interval of every named
    /// parameter, in layout order.
    pub fn parameter_summaries(
        &self,
        result: &FittedResult,
        model: &dyn IntensityModel,
    ) -> Result<Vec<ParameterSummary>, EvaluationError> {
        let draws = self.posterior_draws(result, model)?;
        let tail = (1.0 - self.config.credible_level) / 2.0;
        let layout = model.layout();
        Ok(model
            .parameter_names()
            .into_iter()
            .filter_map(|name| layout.index_of(&name).map(|idx| (name, idx)))
            .map(|(name, idx)| summarize(name, draws.column(idx), tail))
            .collect())
    }

    /// Summaries of the covariate weights only.
    pub fn covariate_weight_summaries(
        &self,
        result: &FittedResult,
        model: &dyn IntensityModel,
    ) -> Result<Vec<ParameterSummary>, EvaluationError> {
        Ok(self
            .parameter_summaries(result, model)?
            .into_iter()
            .filter(|s| s.name.starts_with("w_"))
            .collect())
    }

    /// Posterior-mean split of the expected count into background and triggered
    /// events. `None` for models without triggering.
    pub fn branching_decomposition(
        &self,
        result: &FittedResult,
        model: &dyn IntensityModel,
    ) -> Result<Option<BranchingDecomposition>, EvaluationError> {
        if !model.variant().is_self_exciting() {
            return Ok(None);
        }
        let draws = self.posterior_draws(result, model)?;
        let mut background = 0.0;
        let mut triggered = 0.0;
        for row in draws.rows() {
            if let Some(split) = model.branching(row)? {
                background += split.background;
                triggered += split.triggered;
            }
        }
        let n = draws.nrows() as f64;
        Ok(Some(BranchingDecomposition {
            background: background / n,
            triggered: triggered / n,
        }))
    }

    /// Posterior-mean background intensity on the model grid, `[ny, nx]`.
    pub fn mean_background_surface(
        &self,
        result: &FittedResult,
        model: &dyn IntensityModel,
    ) -> Result<Array2<f64>, EvaluationError> {
        let draws = self.posterior_draws(result, model)?;
        let mut rows = draws.rows().into_iter();
        let first = rows.next().ok_or(EvaluationError::NoDraws)?;
        let mut sum = model.background_surface(first);
        for row in rows {
            sum += &model.background_surface(row);
        }
        Ok(sum / draws.nrows() as f64)
    }

    /// Posterior-mean conditional intensity at every cell centre at time `t`,
    /// triggering included, `[ny, nx]`.
    pub fn mean_intensity_surface(
        &self,
        result: &FittedResult,
        model: &dyn IntensityModel,
        t: f64,
    ) -> Result<Array2<f64>, EvaluationError> {
        check_time(model, t)?;
        let draws = self.posterior_draws(result, model)?;
        let mut rows = draws.rows().into_iter();
        let first = rows.next().ok_or(EvaluationError::NoDraws)?;
        let mut sum = model.intensity_surface(t, first);
        for row in rows {
            sum += &model.intensity_surface(t, row);
        }
        Ok(sum / draws.nrows() as f64)
    }

    /// Events per unit time over the whole domain at each of `times`, e.g.
    /// `extent.temporal.grid(n)`.
    pub fn event_rate_curve(
        &self,
        result: &FittedResult,
        model: &dyn IntensityModel,
        times: &[f64],
    ) -> Result<Vec<CurvePoint>, EvaluationError> {
        for &t in times {
            check_time(model, t)?;
        }
        let draws = self.posterior_draws(result, model)?;
        let tail = (1.0 - self.config.credible_level) / 2.0;
        Ok(times
            .iter()
            .map(|&t| {
                let values: Vec<f64> = draws.rows().into_iter().map(|row| model.event_rate(t, row)).collect();
                curve_point(t, values, tail)
            })
            .collect())
    }

    /// Offspring rate `alpha * beta * exp(-beta * dt)` at each lag. `None` for
    /// models without triggering.
    pub fn trigger_decay_curve(
        &self,
        result: &FittedResult,
        model: &dyn IntensityModel,
        lags: &[f64],
    ) -> Result<Option<Vec<CurvePoint>>, EvaluationError> {
        if let Some(&bad) = lags.iter().find(|dt| !(dt.is_finite() && **dt >= 0.0)) {
            return Err(EvaluationError::InvalidLag(bad));
        }
        if !model.variant().is_self_exciting() {
            return Ok(None);
        }
        let draws = self.posterior_draws(result, model)?;
        let params: Vec<_> = draws
            .rows()
            .into_iter()
            .filter_map(|row| model.trigger_params(row))
            .collect();
        if params.is_empty() {
            return Ok(None);
        }
        let tail = (1.0 - self.config.credible_level) / 2.0;
        Ok(Some(
            lags.iter()
                .map(|&dt| curve_point(dt, params.iter().map(|p| p.temporal_decay(dt)).collect(), tail))
                .collect(),
        ))
    }
}

fn check_time(model: &dyn IntensityModel, t: f64) -> Result<(), EvaluationError> {
    let t_max = model.extent().temporal.t_max;
    if t.is_finite() && (0.0..=t_max).contains(&t) {
        Ok(())
    } else {
        Err(EvaluationError::TimeOutsideHorizon { t, t_max })
    }
}

fn curve_point(at: f64, mut values: Vec<f64>, tail: f64) -> CurvePoint {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.sort_by(|a, b| a.total_cmp(b));
    CurvePoint {
        at,
        mean,
        lower: quantile(&values, tail),
        upper: quantile(&values, 1.0 - tail),
    }
}

fn mean_over<F>(draws: &Array2<f64>, f: F) -> f64
where
    F: Fn(ArrayView1<f64>) -> f64,
{
    draws.rows().into_iter().map(f).sum::<f64>() / draws.nrows() as f64
}

fn summarize(name: String, column: ArrayView1<f64>, tail: f64) -> ParameterSummary {
    let n = column.len() as f64;
    let mean = column.sum() / n;
    let std_dev = if column.len() > 1 {
        (column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    } else {
        0.0
    };
    let mut sorted = column.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    ParameterSummary {
        name,
        mean,
        std_dev,
        lower: quantile(&sorted, tail),
        upper: quantile(&sorted, 1.0 - tail),
    }
}

/// Linear-interpolation quantile of sorted values.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}
