use std::marker::PhantomData;

use crate::nuts::{Collector, DivergenceInfo, NutsOptions, State};

/// Parameters of the dual averaging step size controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DualAverageOptions {
    pub k: f64,
    pub t0: f64,
    pub gamma: f64,
    pub initial_step: f64,
}

impl Default for DualAverageOptions {
    fn default() -> DualAverageOptions {
        DualAverageOptions {
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
            initial_step: 0.1,
        }
    }
}

/// Dual averaging of the log step size (Hoffman & Gelman 2014).
#[derive(Clone, Debug)]
pub(crate) struct DualAverage {
    log_step: f64,
    /// Weighted average of the past log step sizes.
    log_step_avg: f64,
    /// Running average of `target - accept`.
    mean_error: f64,
    /// The log step size is shrunk towards this value.
    log_step_center: f64,
    iteration: u64,
    settings: DualAverageOptions,
}

impl DualAverage {
    pub(crate) fn new(settings: DualAverageOptions) -> DualAverage {
        let mut controller = DualAverage {
            log_step: 0.,
            log_step_avg: 0.,
            mean_error: 0.,
            log_step_center: 0.,
            iteration: 1,
            settings,
        };
        controller.reset(settings.initial_step);
        controller
    }

    pub(crate) fn advance(&mut self, accept_stat: f64, target: f64) {
        let DualAverageOptions { k, t0, gamma, .. } = self.settings;
        let t = self.iteration as f64;
        let weight = (t + t0).recip();
        self.mean_error += weight * (target - accept_stat - self.mean_error);
        self.log_step = self.log_step_center - self.mean_error * t.sqrt() / gamma;
        let eta = t.powf(-k);
        self.log_step_avg = eta * self.log_step + (1. - eta) * self.log_step_avg;
        self.iteration += 1;
    }

    pub(crate) fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    pub(crate) fn current_step_size_adapted(&self) -> f64 {
        self.log_step_avg.exp()
    }

    /// Restart the controller around a new initial step size.
    pub(crate) fn reset(&mut self, initial_step: f64) {
        self.log_step = initial_step.ln();
        self.log_step_avg = self.log_step;
        self.mean_error = 0.;
        self.log_step_center = (10. * initial_step).ln();
        self.iteration = 1;
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    fn new() -> RunningMean {
        RunningMean { sum: 0., count: 0 }
    }

    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// NaN until the first value was added.
    pub(crate) fn current(&self) -> f64 {
        self.sum / self.count as f64
    }

    pub(crate) fn reset(&mut self) {
        *self = RunningMean::new();
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Mean Metropolis acceptance probability of the leapfrog steps of one
/// trajectory, relative to the energy at its initial point.
pub(crate) struct AcceptanceRateCollector<S: State> {
    initial_energy: f64,
    pub(crate) mean: RunningMean,
    _marker: PhantomData<S>,
}

impl<S: State> AcceptanceRateCollector<S> {
    pub(crate) fn new() -> AcceptanceRateCollector<S> {
        AcceptanceRateCollector {
            initial_energy: 0.,
            mean: RunningMean::new(),
            _marker: PhantomData,
        }
    }
}

impl<S: State> Collector for AcceptanceRateCollector<S> {
    type State = S;

    fn register_leapfrog(
        &mut self,
        _start: &Self::State,
        end: &Self::State,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        let accept = match divergence_info {
            Some(_) => 0.,
            None => end.log_acceptance_probability(self.initial_energy).exp(),
        };
        self.mean.add(accept);
    }

    fn register_init(&mut self, state: &Self::State, _options: &NutsOptions) {
        self.initial_energy = state.energy();
        self.mean.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;

    #[test]
    fn low_acceptance_shrinks_step_size() {
        let mut step = DualAverage::new(DualAverageOptions::default());
        for _ in 0..100 {
            step.advance(0.2, 0.95);
        }
        assert!(step.current_step_size() < 0.1);
        assert!(step.current_step_size_adapted() < 0.1);
    }

    #[test]
    fn high_acceptance_grows_step_size() {
        let mut step = DualAverage::new(DualAverageOptions::default());
        for _ in 0..100 {
            step.advance(1., 0.6);
        }
        assert!(step.current_step_size() > 0.1);
    }

    #[test]
    fn reset_restores_initial_step() {
        let mut step = DualAverage::new(DualAverageOptions::default());
        step.advance(0., 0.8);
        step.reset(0.5);
        assert_relative_eq!(step.current_step_size(), 0.5, max_relative = 1e-12);
        assert_relative_eq!(step.current_step_size_adapted(), 0.5, max_relative = 1e-12);
    }

    #[test]
    fn running_mean() {
        let mut mean = RunningMean::new();
        assert!(mean.current().is_nan());
        mean.add(1.);
        mean.add(0.);
        assert_eq!(mean.current(), 0.5);
        assert_eq!(mean.count(), 2);
        mean.reset();
        assert_eq!(mean.count(), 0);
    }
}
