use std::fmt::Debug;

use rand::Rng;

use crate::cpu_state::{State, StatePool};
use crate::mass_matrix::MassMatrix;
use crate::math::{axpy, axpy_out};
use crate::nuts::{
    Collector, Direction, DivergenceInfo, Hamiltonian, LogpError, NutsError, State as _,
};

/// A log density with gradient on `R^n`.
///
/// Implementors fill `grad` with the gradient of the log density at `position`
/// and return the log density. Returning `-inf` marks a point outside of the
/// support, the sampler rejects leapfrog steps that end there.
pub trait CpuLogpFunc {
    type Err: Debug + Send + Sync + LogpError + 'static;

    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::Err>;
    fn dim(&self) -> usize;
}

/// Hamiltonian with the negative log density as potential energy and a
/// kinetic energy given by the mass matrix.
pub(crate) struct EuclideanPotential<F: CpuLogpFunc, M: MassMatrix> {
    logp: F,
    pub(crate) mass_matrix: M,
    max_energy_error: f64,
    pub(crate) step_size: f64,
}

impl<F: CpuLogpFunc, M: MassMatrix> EuclideanPotential<F, M> {
    pub(crate) fn new(logp: F, mass_matrix: M, max_energy_error: f64, step_size: f64) -> Self {
        EuclideanPotential {
            logp,
            mass_matrix,
            max_energy_error,
            step_size,
        }
    }

    /// Evaluate the log density at the position of `state` and store the
    /// potential energy and the gradient.
    fn eval_logp(&mut self, state: &mut State) -> Result<(), F::Err> {
        let inner = state.inner_mut();
        let logp = self.logp.logp(&inner.q, &mut inner.grad)?;
        inner.potential_energy = -logp;
        Ok(())
    }
}

impl<F: CpuLogpFunc, M: MassMatrix> Hamiltonian for EuclideanPotential<F, M> {
    type State = State;
    type LogpError = F::Err;

    fn leapfrog<C: Collector<State = Self::State>>(
        &mut self,
        pool: &mut StatePool,
        start: &Self::State,
        dir: Direction,
        initial_energy: f64,
        collector: &mut C,
    ) -> Result<Result<Self::State, DivergenceInfo>, NutsError> {
        let sign: i64 = match dir {
            Direction::Forward => 1,
            Direction::Backward => -1,
        };
        let epsilon = sign as f64 * self.step_size;

        let mut out = pool.new_state();
        {
            let next = out.inner_mut();
            axpy_out(&start.grad, &start.p, epsilon / 2., &mut next.p);
            self.mass_matrix.update_velocity(next);
            axpy_out(&next.v, &start.q, epsilon, &mut next.q);
        }

        if let Err(error) = self.eval_logp(&mut out) {
            if !error.is_recoverable() {
                return Err(NutsError::LogpFailure(Box::new(error)));
            }
            let info = DivergenceInfo {
                start_location: Some(start.q.clone()),
                start_idx_in_trajectory: Some(start.trajectory_index),
                logp_function_error: Some(Box::new(error)),
                ..Default::default()
            };
            collector.register_leapfrog(start, &out, Some(&info));
            return Ok(Err(info));
        }

        {
            let next = out.inner_mut();
            axpy(&next.grad, &mut next.p, epsilon / 2.);
            self.mass_matrix.update_velocity(next);
            self.mass_matrix.update_kinetic_energy(next);
            next.trajectory_index = start.trajectory_index + sign;
        }
        start.extend_momentum_sum(&mut out);

        let energy_error = out.energy() - initial_energy;
        if (energy_error.abs() > self.max_energy_error) | !energy_error.is_finite() {
            let info = DivergenceInfo {
                start_location: Some(start.q.clone()),
                end_location: Some(out.q.clone()),
                energy_error: Some(energy_error),
                start_idx_in_trajectory: Some(start.trajectory_index),
                end_idx_in_trajectory: Some(out.trajectory_index),
                logp_function_error: None,
            };
            collector.register_leapfrog(start, &out, Some(&info));
            return Ok(Err(info));
        }

        collector.register_leapfrog(start, &out, None);
        Ok(Ok(out))
    }

    fn init_state(&mut self, pool: &mut StatePool, init: &[f64]) -> Result<Self::State, NutsError> {
        let mut state = pool.new_state();
        {
            let inner = state.inner_mut();
            inner.q.copy_from_slice(init);
            inner.p_sum.fill(0.);
        }
        self.eval_logp(&mut state)
            .map_err(|error| NutsError::LogpFailure(Box::new(error)))?;
        let finite = state.potential_energy.is_finite() & state.grad.iter().all(|g| g.is_finite());
        if !finite {
            return Err(NutsError::BadInitGrad);
        }
        Ok(state)
    }

    fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut Self::State, rng: &mut R) {
        let inner = state.inner_mut();
        self.mass_matrix.randomize_momentum(inner, rng);
        self.mass_matrix.update_velocity(inner);
        self.mass_matrix.update_kinetic_energy(inner);
    }

    fn new_empty_state(&mut self, pool: &mut StatePool) -> Self::State {
        pool.new_state()
    }

    fn new_pool(&mut self, capacity: usize) -> StatePool {
        StatePool::with_capacity(self.dim(), capacity)
    }

    fn dim(&self) -> usize {
        self.logp.dim()
    }

    fn step_size(&self) -> f64 {
        self.step_size
    }
}

#[cfg(test)]
pub(crate) mod test_logps {
    use crate::{cpu_potential::CpuLogpFunc, nuts::LogpError};
    use thiserror::Error;

    /// Independent standard normals centred at `mu`.
    #[derive(Clone)]
    pub(crate) struct NormalLogp {
        dim: usize,
        mu: f64,
    }

    impl NormalLogp {
        pub(crate) fn new(dim: usize, mu: f64) -> NormalLogp {
            NormalLogp { dim, mu }
        }
    }

    #[derive(Error, Debug)]
    pub(crate) enum NoError {}

    impl LogpError for NoError {
        fn is_recoverable(&self) -> bool {
            false
        }
    }

    impl CpuLogpFunc for NormalLogp {
        type Err = NoError;

        fn dim(&self) -> usize {
            self.dim
        }

        fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, NoError> {
            assert_eq!(position.len(), grad.len());
            let mut logp = 0.;
            for (&x, g) in position.iter().zip(grad.iter_mut()) {
                let z = x - self.mu;
                logp -= 0.5 * z * z;
                *g = -z;
            }
            Ok(logp)
        }
    }

    /// Fails with a recoverable error for positions with a negative first coordinate.
    pub(crate) struct HalfPlaneLogp {}

    #[derive(Error, Debug)]
    #[error("position outside of half plane")]
    pub(crate) struct OutsideHalfPlane {}

    impl LogpError for OutsideHalfPlane {
        fn is_recoverable(&self) -> bool {
            true
        }
    }

    impl CpuLogpFunc for HalfPlaneLogp {
        type Err = OutsideHalfPlane;

        fn dim(&self) -> usize {
            1
        }

        fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, OutsideHalfPlane> {
            let x = position[0];
            if x < 0. {
                return Err(OutsideHalfPlane {});
            }
            grad[0] = -x;
            Ok(-0.5 * x * x)
        }
    }
}
