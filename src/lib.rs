//! Bayesian estimation of epidemiological parameters of ANCA-associated
//! vasculitis.
//!
//! Noisy observations of incidence, prevalence, mortality, relapse rate and
//! treatment effect are combined with uniform priors, and the posterior is
//! sampled with the No-U-Turn Sampler.
//!
//! ```no_run
//! use aav_nuts::{run_inference, Observations};
//!
//! let observations = Observations::from_values([2.5, 30., 0.1, 0.2, 0.5]);
//! let summary = run_inference(&observations).unwrap();
//! println!("{summary}");
//! ```

pub(crate) mod adapt_strategy;
pub(crate) mod chain;
pub(crate) mod cpu_potential;
pub(crate) mod cpu_state;
pub mod diagnostics;
pub mod distributions;
pub(crate) mod inference;
pub(crate) mod mass_matrix;
pub(crate) mod math;
pub(crate) mod model;
pub(crate) mod nuts;
pub(crate) mod sampler;
pub(crate) mod stepsize;
pub(crate) mod transform;

pub use adapt_strategy::DualAverageSettings;
pub use chain::{Chain, ChainPhase, DrawStats};
pub use cpu_potential::CpuLogpFunc;
pub use diagnostics::{
    summarize, CredibleInterval, DensityEstimate, ParameterSummary, PosteriorSummary,
    SamplingWarning, SummarySettings,
};
pub use inference::{
    run_inference, run_inference_with, sample_posterior, InferenceError, InferenceSettings,
    PosteriorDensity, PosteriorModel,
};
pub use mass_matrix::DiagAdaptExpSettings;
pub use model::{
    build_log_posterior, ConfigurationError, LogPosterior, Observation, Observations, Parameter,
    ParameterVector, PosteriorError, NUM_PARAMETERS,
};
pub use nuts::{DivergenceInfo, LogpError, NutsError};
pub use sampler::{sample_parallel, Model, SamplerSettings};
pub use stepsize::DualAverageOptions;
pub use transform::{Parameterization, TransformedPosterior};
