//! The inference entry points: validate input, sample, summarize.

use std::time::{Duration, Instant};

use anyhow::Result;
use log::info;
use rand::{distr::Open01, Rng};
use thiserror::Error;

use crate::{
    chain::Chain,
    cpu_potential::CpuLogpFunc,
    diagnostics::{summarize, PosteriorSummary, SummarySettings},
    model::{
        build_log_posterior, ConfigurationError, LogPosterior, Observations, Parameter,
        PosteriorError, NUM_PARAMETERS,
    },
    sampler::{sample_parallel, Model, SamplerSettings},
    transform::{Parameterization, TransformedPosterior},
};

/// Failures of a whole inference run. No partial results are returned.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("sampling did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("chain {chain} failed")]
    ChainFailure {
        chain: u64,
        #[source]
        source: anyhow::Error,
    },
    #[error("could not start thread pool")]
    ThreadPool(#[source] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InferenceSettings {
    pub sampler: SamplerSettings,
    pub summary: SummarySettings,
}

impl InferenceSettings {
    pub fn validate(&self) -> std::result::Result<(), ConfigurationError> {
        self.sampler.validate()?;
        self.summary.validate()
    }
}

/// Density of the AAV posterior in the space the sampler moves in.
#[derive(Debug, Clone)]
pub enum PosteriorDensity {
    Constrained(LogPosterior),
    Unconstrained(TransformedPosterior),
}

impl CpuLogpFunc for PosteriorDensity {
    type Err = PosteriorError;

    fn logp(
        &mut self,
        position: &[f64],
        grad: &mut [f64],
    ) -> std::result::Result<f64, PosteriorError> {
        match self {
            PosteriorDensity::Constrained(posterior) => posterior.logp(position, grad),
            PosteriorDensity::Unconstrained(posterior) => posterior.logp(position, grad),
        }
    }

    fn dim(&self) -> usize {
        NUM_PARAMETERS
    }
}

/// The AAV posterior as a [`Model`] for the sampler.
#[derive(Debug, Clone)]
pub struct PosteriorModel {
    posterior: TransformedPosterior,
    constrained: LogPosterior,
    parameterization: Parameterization,
}

impl PosteriorModel {
    pub fn new(posterior: LogPosterior, parameterization: Parameterization) -> Self {
        PosteriorModel {
            posterior: TransformedPosterior::new(posterior.clone()),
            constrained: posterior,
            parameterization,
        }
    }
}

impl Model for PosteriorModel {
    type Density = PosteriorDensity;

    fn density(&self) -> Result<PosteriorDensity> {
        Ok(match self.parameterization {
            Parameterization::Constrained => {
                PosteriorDensity::Constrained(self.constrained.clone())
            }
            Parameterization::Unconstrained => {
                PosteriorDensity::Unconstrained(self.posterior.clone())
            }
        })
    }

    fn init_position<R: Rng + ?Sized>(&self, rng: &mut R, position: &mut [f64]) -> Result<()> {
        let mut theta = [0f64; NUM_PARAMETERS];
        for (parameter, theta) in Parameter::ALL.into_iter().zip(theta.iter_mut()) {
            let (lower, upper) = parameter.support();
            let fraction: f64 = rng.sample(Open01);
            *theta = lower + (upper - lower) * fraction;
        }
        match self.parameterization {
            Parameterization::Constrained => position.copy_from_slice(&theta),
            Parameterization::Unconstrained => self.posterior.unconstrain(&theta, position),
        }
        Ok(())
    }

    fn constrain(&self, position: &[f64], draw: &mut [f64]) {
        match self.parameterization {
            Parameterization::Constrained => draw.copy_from_slice(position),
            Parameterization::Unconstrained => self.posterior.constrain(position, draw),
        }
    }
}

/// Sample the posterior of the AAV model and return the raw chains.
///
/// Draws are stored as parameter values in canonical order, regardless of
/// the parameterization the sampler used.
pub fn sample_posterior(
    observations: &Observations,
    settings: &SamplerSettings,
) -> std::result::Result<Vec<Chain>, InferenceError> {
    settings.validate()?;
    let posterior = build_log_posterior(observations)?;
    let model = PosteriorModel::new(posterior, settings.parameterization);
    sample_parallel(model, settings)
}

/// Estimate the AAV parameters with explicit settings.
pub fn run_inference_with(
    observations: &Observations,
    settings: &InferenceSettings,
) -> std::result::Result<PosteriorSummary, InferenceError> {
    settings.validate()?;
    let start = Instant::now();
    let chains = sample_posterior(observations, &settings.sampler)?;
    let summary = summarize(&chains, &settings.summary);
    info!(
        "Sampled {} chains of {} draws in {:.2?}, {} warnings",
        summary.num_chains,
        summary.num_draws,
        start.elapsed(),
        summary.warnings.len()
    );
    Ok(summary)
}

/// Estimate the AAV parameters with the default settings.
pub fn run_inference(
    observations: &Observations,
) -> std::result::Result<PosteriorSummary, InferenceError> {
    run_inference_with(observations, &InferenceSettings::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn observations() -> Observations {
        Observations::from_values([2.5, 30., 0.1, 0.2, 0.5])
    }

    #[test]
    fn init_positions_lie_in_support() {
        let posterior = build_log_posterior(&observations()).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        for parameterization in [Parameterization::Constrained, Parameterization::Unconstrained] {
            let model = PosteriorModel::new(posterior.clone(), parameterization);
            let mut density = model.density().unwrap();
            for _ in 0..100 {
                let mut position = [0f64; NUM_PARAMETERS];
                let mut draw = [0f64; NUM_PARAMETERS];
                let mut grad = [0f64; NUM_PARAMETERS];
                model.init_position(&mut rng, &mut position).unwrap();
                model.constrain(&position, &mut draw);
                for (parameter, &value) in Parameter::ALL.iter().zip(&draw) {
                    let (lower, upper) = parameter.support();
                    assert!((lower..=upper).contains(&value));
                }
                assert!(density.logp(&position, &mut grad).unwrap().is_finite());
            }
        }
    }

    #[test]
    fn missing_observation_fails_before_sampling() {
        let observations = Observations::new()
            .with(Parameter::Incidence, 2.5)
            .with(Parameter::Prevalence, 30.);
        let result = run_inference(&observations);
        assert!(matches!(
            result,
            Err(InferenceError::Configuration(
                ConfigurationError::MissingObservation(Parameter::Mortality)
            ))
        ));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut settings = InferenceSettings::default();
        settings.summary.hdi_prob = 0.;
        let error = run_inference_with(&observations(), &settings).unwrap_err();
        assert!(matches!(
            error,
            InferenceError::Configuration(ConfigurationError::InvalidSettings(_))
        ));
        assert_eq!(
            InferenceSettings::default().validate(),
            Ok(())
        );
    }
}
