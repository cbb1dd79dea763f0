use itertools::izip;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{
    cpu_state::{InnerState, State},
    math::{multiply, vector_dot},
    nuts::{Collector, SampleInfo, State as _},
};

/// The kinetic energy part of the Hamiltonian.
pub(crate) trait MassMatrix {
    fn update_velocity(&self, state: &mut InnerState);
    fn update_kinetic_energy(&self, state: &mut InnerState);
    fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut InnerState, rng: &mut R);
}

#[cfg(test)]
pub(crate) struct NullCollector {}

#[cfg(test)]
impl Collector for NullCollector {
    type State = State;
}

/// A diagonal inverse mass matrix.
///
/// `variance` is the diagonal of the inverse mass matrix: the velocity is
/// `variance * p` and momenta have standard deviation `1 / sqrt(variance)`.
#[derive(Debug)]
pub(crate) struct DiagMassMatrix {
    momentum_scale: Box<[f64]>,
    pub(crate) variance: Box<[f64]>,
}

impl DiagMassMatrix {
    /// The identity matrix.
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            momentum_scale: vec![1.; dim].into(),
            variance: vec![1.; dim].into(),
        }
    }

    /// Replace the diagonal. Panics on values that are not positive and finite.
    pub(crate) fn update_diag(&mut self, diag: impl Iterator<Item = f64>) {
        for (variance, scale, value) in izip!(
            self.variance.iter_mut(),
            self.momentum_scale.iter_mut(),
            diag
        ) {
            assert!(
                value.is_finite() & (value > 0.),
                "Invalid mass matrix entry {value}"
            );
            *variance = value;
            *scale = value.recip().sqrt();
        }
    }
}

impl MassMatrix for DiagMassMatrix {
    fn update_velocity(&self, state: &mut InnerState) {
        multiply(&self.variance, &state.p, &mut state.v);
    }

    fn update_kinetic_energy(&self, state: &mut InnerState) {
        state.kinetic_energy = 0.5 * vector_dot(&state.p, &state.v);
    }

    fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut InnerState, rng: &mut R) {
        for (p, &scale) in state.p.iter_mut().zip(self.momentum_scale.iter()) {
            let z: f64 = rng.sample(StandardNormal);
            *p = scale * z;
        }
    }
}

/// Running mean and variance of a vector where each new sample has weight
/// `decay` and the previous estimate is scaled by `1 - decay`.
#[derive(Debug)]
pub(crate) struct ExpWeightedVariance {
    mean: Box<[f64]>,
    variance: Box<[f64]>,
    count: u64,
    decay: f64,
}

impl ExpWeightedVariance {
    pub(crate) fn new(dim: usize, decay: f64) -> Self {
        ExpWeightedVariance {
            mean: vec![0.; dim].into(),
            variance: vec![0.; dim].into(),
            count: 0,
            decay,
        }
    }

    pub(crate) fn set_mean(&mut self, values: impl Iterator<Item = f64>) {
        for (mean, value) in self.mean.iter_mut().zip(values) {
            *mean = value;
        }
    }

    pub(crate) fn set_variance(&mut self, values: impl Iterator<Item = f64>) {
        for (variance, value) in self.variance.iter_mut().zip(values) {
            *variance = value;
        }
    }

    pub(crate) fn add_sample(&mut self, values: impl Iterator<Item = f64>) {
        let decay = self.decay;
        for (x, mean, variance) in izip!(values, self.mean.iter_mut(), self.variance.iter_mut()) {
            let delta = x - *mean;
            *mean = decay.mul_add(delta, *mean);
            *variance = (1. - decay) * (*variance + decay * delta * delta);
        }
        self.count += 1;
    }

    pub(crate) fn current(&self) -> &[f64] {
        &self.variance
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Settings for mass matrix adaptation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiagAdaptExpSettings {
    /// Weight of a new draw in the variance estimate.
    pub variance_decay: f64,
    /// Weight of a new draw while still in the first estimation window.
    pub early_variance_decay: f64,
    /// Number of warmup draws at the end with a fixed mass matrix.
    pub final_window: u64,
    /// Draws between two switches of the estimation window.
    pub window_switch_freq: u64,
    /// Draws before the first switch of the estimation window.
    pub early_window_switch_freq: u64,
    /// Start from the squared gradient at the initial point instead of the
    /// identity.
    pub grad_init: bool,
}

impl Default for DiagAdaptExpSettings {
    fn default() -> Self {
        Self {
            variance_decay: 0.02,
            early_variance_decay: 0.8,
            final_window: 50,
            window_switch_freq: 50,
            early_window_switch_freq: 20,
            grad_init: false,
        }
    }
}

/// Position and gradient of the most recent draw.
pub(crate) struct DrawGradCollector {
    pub(crate) draw: Box<[f64]>,
    pub(crate) grad: Box<[f64]>,
    /// False if the draw says little about the posterior scale and should
    /// not enter the variance estimate.
    pub(crate) informative: bool,
}

impl DrawGradCollector {
    pub(crate) fn new(dim: usize) -> Self {
        DrawGradCollector {
            draw: vec![0.; dim].into(),
            grad: vec![0.; dim].into(),
            informative: true,
        }
    }
}

impl Collector for DrawGradCollector {
    type State = State;

    fn register_draw(&mut self, state: &Self::State, info: &SampleInfo) {
        self.draw.copy_from_slice(&state.q);
        self.grad.copy_from_slice(&state.grad);
        let offset = state.index_in_trajectory();
        self.informative = match info.divergence_info {
            Some(_) => offset.abs() >= 4,
            None => offset != 0,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_state::StatePool;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn identity_by_default() {
        let mass_matrix = DiagMassMatrix::new(3);
        assert_eq!(&mass_matrix.variance[..], &[1., 1., 1.]);

        let mut pool = StatePool::with_capacity(3, 2);
        let mut state = pool.new_state();
        let inner = state.try_mut_inner().unwrap();
        inner.p.copy_from_slice(&[1., 2., 3.]);
        mass_matrix.update_velocity(inner);
        mass_matrix.update_kinetic_energy(inner);
        assert_eq!(&inner.v[..], &[1., 2., 3.]);
        assert_relative_eq!(inner.kinetic_energy, 7.);
    }

    #[test]
    fn momentum_has_inverse_scale() {
        let mut mass_matrix = DiagMassMatrix::new(1);
        mass_matrix.update_diag([4.].into_iter());

        let mut pool = StatePool::with_capacity(1, 2);
        let mut state = pool.new_state();
        let inner = state.try_mut_inner().unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let n = 20_000;
        let mut sum_sq = 0.;
        for _ in 0..n {
            mass_matrix.randomize_momentum(inner, &mut rng);
            sum_sq += inner.p[0] * inner.p[0];
        }
        assert_relative_eq!(sum_sq / n as f64, 0.25, max_relative = 0.05);
    }

    #[test]
    #[should_panic(expected = "Invalid mass matrix entry")]
    fn reject_negative_variance() {
        let mut mass_matrix = DiagMassMatrix::new(1);
        mass_matrix.update_diag([-1.].into_iter());
    }

    #[test]
    fn exp_weighted_variance_tracks_spread() {
        let mut estimator = ExpWeightedVariance::new(1, 0.01);
        estimator.set_mean([0.].into_iter());
        for i in 0..5_000 {
            let x = if i % 2 == 0 { 2. } else { -2. };
            estimator.add_sample([x].into_iter());
        }
        assert_eq!(estimator.count(), 5_000);
        assert_relative_eq!(estimator.current()[0], 4., max_relative = 0.05);
    }
}
