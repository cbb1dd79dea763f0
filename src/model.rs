//! The AAV parameter model.
//!
//! Five epidemiological parameters, each with a uniform prior over a fixed
//! support and a normal likelihood for a single noisy observation of it.

use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::{
    cpu_potential::CpuLogpFunc,
    distributions::{LogDensity, Normal, Uniform},
    nuts::LogpError,
};

pub const NUM_PARAMETERS: usize = 5;

/// Values of all five parameters in canonical order, see [`Parameter::ALL`].
pub type ParameterVector = [f64; NUM_PARAMETERS];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Parameter {
    /// New cases per 100,000 per year
    Incidence,
    /// Cases per 100,000
    Prevalence,
    Mortality,
    RelapseRate,
    TreatmentEffect,
}

struct ParameterInfo {
    name: &'static str,
    support: (f64, f64),
    sigma: f64,
    observation_range: (f64, f64),
}

const PARAMETER_INFO: [ParameterInfo; NUM_PARAMETERS] = [
    ParameterInfo {
        name: "incidence",
        support: (0.1, 10.),
        sigma: 1.,
        observation_range: (0.1, 20.),
    },
    ParameterInfo {
        name: "prevalence",
        support: (1., 50.),
        sigma: 5.,
        observation_range: (0.1, 100.),
    },
    ParameterInfo {
        name: "mortality",
        support: (0.01, 0.3),
        sigma: 0.05,
        observation_range: (0.01, 0.3),
    },
    ParameterInfo {
        name: "relapse_rate",
        support: (0.01, 0.5),
        sigma: 0.1,
        observation_range: (0.01, 0.5),
    },
    ParameterInfo {
        name: "treatment_effect",
        support: (0.1, 0.9),
        sigma: 0.1,
        observation_range: (0.1, 0.9),
    },
];

impl Parameter {
    pub const ALL: [Parameter; NUM_PARAMETERS] = [
        Parameter::Incidence,
        Parameter::Prevalence,
        Parameter::Mortality,
        Parameter::RelapseRate,
        Parameter::TreatmentEffect,
    ];

    /// Position in a [`ParameterVector`].
    pub fn index(self) -> usize {
        self as usize
    }

    fn info(self) -> &'static ParameterInfo {
        &PARAMETER_INFO[self.index()]
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Bounds `(lower, upper)` of the uniform prior.
    pub fn support(self) -> (f64, f64) {
        self.info().support
    }

    pub fn prior(self) -> Uniform {
        let (lower, upper) = self.support();
        Uniform::new(lower, upper).expect("Prior bounds are valid constants")
    }

    /// Noise standard deviation used when an observation does not specify one.
    pub fn default_sigma(self) -> f64 {
        self.info().sigma
    }

    /// Range of values accepted as an observation.
    ///
    /// This is wider than the prior support for incidence and prevalence:
    /// an observation above the support pulls the posterior to the upper bound.
    pub fn observation_range(self) -> (f64, f64) {
        self.info().observation_range
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Parameter {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Parameter::ALL
            .into_iter()
            .find(|param| param.name() == s)
            .ok_or_else(|| ConfigurationError::UnknownParameter(s.to_string()))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("no observation for parameter {0}")]
    MissingObservation(Parameter),
    #[error("observation {value} for {parameter} is outside of the valid range [{lower}, {upper}]")]
    ObservationOutOfRange {
        parameter: Parameter,
        value: f64,
        lower: f64,
        upper: f64,
    },
    #[error("invalid noise sigma {sigma} for {parameter}, must be finite and positive")]
    InvalidSigma { parameter: Parameter, sigma: f64 },
    #[error("unknown parameter name {0:?}")]
    UnknownParameter(String),
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

/// A noisy measurement of a single parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub value: f64,
    pub sigma: f64,
}

impl Observation {
    /// Only called on observations that passed [`Observations::validate`].
    fn likelihood(self) -> Normal {
        Normal::new(self.value, self.sigma).expect("Observation sigma was validated")
    }
}

/// At most one observation per parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Observations {
    values: [Option<Observation>; NUM_PARAMETERS],
}

impl Observations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observations for all parameters with the default noise sigmas.
    pub fn from_values(values: ParameterVector) -> Self {
        Parameter::ALL.into_iter().zip(values).collect()
    }

    /// Add an observation with the default noise sigma of the parameter.
    pub fn with(self, parameter: Parameter, value: f64) -> Self {
        self.with_sigma(parameter, value, parameter.default_sigma())
    }

    pub fn with_sigma(mut self, parameter: Parameter, value: f64, sigma: f64) -> Self {
        self.insert(parameter, Observation { value, sigma });
        self
    }

    /// Set the observation for `parameter`, returning the previous one.
    pub fn insert(
        &mut self,
        parameter: Parameter,
        observation: Observation,
    ) -> Option<Observation> {
        self.values[parameter.index()].replace(observation)
    }

    pub fn get(&self, parameter: Parameter) -> Option<Observation> {
        self.values[parameter.index()]
    }

    /// Check that every parameter has exactly one valid observation.
    pub fn validate(&self) -> Result<[Observation; NUM_PARAMETERS], ConfigurationError> {
        let mut out = [Observation {
            value: f64::NAN,
            sigma: f64::NAN,
        }; NUM_PARAMETERS];
        for (parameter, slot) in Parameter::ALL.into_iter().zip(out.iter_mut()) {
            let observation = self
                .get(parameter)
                .ok_or(ConfigurationError::MissingObservation(parameter))?;
            let (lower, upper) = parameter.observation_range();
            let value = observation.value;
            if !((value >= lower) & (value <= upper)) {
                return Err(ConfigurationError::ObservationOutOfRange {
                    parameter,
                    value,
                    lower,
                    upper,
                });
            }
            let sigma = observation.sigma;
            if !sigma.is_finite() | (sigma <= 0.) {
                return Err(ConfigurationError::InvalidSigma { parameter, sigma });
            }
            *slot = observation;
        }
        Ok(out)
    }
}

impl FromIterator<(Parameter, f64)> for Observations {
    fn from_iter<T: IntoIterator<Item = (Parameter, f64)>>(iter: T) -> Self {
        iter.into_iter()
            .fold(Observations::new(), |obs, (parameter, value)| {
                obs.with(parameter, value)
            })
    }
}

impl FromIterator<(Parameter, Observation)> for Observations {
    fn from_iter<T: IntoIterator<Item = (Parameter, Observation)>>(iter: T) -> Self {
        let mut observations = Observations::new();
        for (parameter, observation) in iter {
            observations.insert(parameter, observation);
        }
        observations
    }
}

/// The joint log posterior density of the five parameters, up to a constant.
#[derive(Debug, Clone)]
pub struct LogPosterior {
    priors: [Uniform; NUM_PARAMETERS],
    likelihoods: [Normal; NUM_PARAMETERS],
}

/// Build the log posterior density for a complete set of observations.
pub fn build_log_posterior(
    observations: &Observations,
) -> Result<LogPosterior, ConfigurationError> {
    let observations = observations.validate()?;
    let priors = Parameter::ALL.map(Parameter::prior);
    // The normal density is symmetric in value and mean, so the likelihood
    // of the observation as a function of the parameter is a normal density
    // centred on the observation.
    let likelihoods = observations.map(Observation::likelihood);
    Ok(LogPosterior {
        priors,
        likelihoods,
    })
}

impl LogPosterior {
    /// Log density and its gradient at `theta`.
    ///
    /// Outside of the prior support the log density is `-inf`, and the
    /// gradient of each out of support component is zero.
    pub fn evaluate(&self, theta: &ParameterVector) -> (f64, ParameterVector) {
        let mut grad = [0f64; NUM_PARAMETERS];
        let logp = self.logp_into(theta, &mut grad);
        (logp, grad)
    }

    pub(crate) fn logp_into(&self, theta: &[f64], grad: &mut [f64]) -> f64 {
        assert!(theta.len() == NUM_PARAMETERS);
        assert!(grad.len() == NUM_PARAMETERS);

        let mut logp = 0f64;
        for (prior, likelihood, &x, g) in
            itertools::izip!(&self.priors, &self.likelihoods, theta, grad.iter_mut())
        {
            let prior_logp = prior.logp(x);
            if prior_logp == f64::NEG_INFINITY {
                logp = f64::NEG_INFINITY;
                *g = 0.;
                continue;
            }
            let (like_logp, like_grad) = likelihood.logp_and_grad(x);
            logp += prior_logp + like_logp;
            *g = prior.dlogp(x) + like_grad;
        }
        logp
    }
}

#[derive(Error, Debug)]
pub enum PosteriorError {}

impl LogpError for PosteriorError {
    fn is_recoverable(&self) -> bool {
        false
    }
}

impl CpuLogpFunc for LogPosterior {
    type Err = PosteriorError;

    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, PosteriorError> {
        Ok(self.logp_into(position, grad))
    }

    fn dim(&self) -> usize {
        NUM_PARAMETERS
    }
}
