//! Spatio-temporal point-process inference.
//!
//! Models event occurrence in space and time with three intensity families
//! (Hawkes, log-Gaussian Cox, Cox-Hawkes), fits them by stochastic variational
//! inference or Hamiltonian Monte Carlo, caches fitted results on disk, and ranks
//! competing fits by expected AIC.

pub mod cache;
pub mod config;
pub mod covariates;
pub mod domain;
pub mod evaluate;
pub mod inference;
pub mod intensity;
pub mod params;
pub mod priors;

pub use cache::{CacheKey, CacheLookup, ResultCache};
pub use config::{EngineConfig, ModelConfig, ModelVariant};
pub use domain::{Event, EventSet, Extent, build_extent};
pub use evaluate::{EvaluatorConfig, ModelEvaluator};
pub use inference::{FittedResult, InferenceEngine, InferenceRun, fit_cached};
pub use intensity::{IntensityModel, build_model};
pub use priors::{Prior, PriorRegistry};
