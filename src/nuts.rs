//! Multinomial No-U-Turn trajectories.
//!
//! A trajectory is grown by repeatedly doubling it in a random direction
//! until the generalized U-turn criterion holds between its ends or between
//! the ends of one of its halves, until a leapfrog step diverges, or until
//! the maximum depth is reached. The next draw is picked from all points of
//! the trajectory with weights proportional to `exp(-H)`.

use std::marker::PhantomData;

use rand::{
    distr::{Distribution, StandardUniform},
    Rng,
};
use thiserror::Error;

use crate::chain::ChainPhase;
use crate::math::logaddexp;

#[derive(Error, Debug)]
pub enum NutsError {
    #[error("Logp function returned unrecoverable error")]
    LogpFailure(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Logp or its gradient is not finite at the initial position")]
    BadInitGrad,

    #[error("Sampler can not draw in phase {0:?}")]
    NotReady(ChainPhase),
}

pub type Result<T> = std::result::Result<T, NutsError>;

/// Where and why a leapfrog step was rejected.
#[derive(Debug, Default)]
pub struct DivergenceInfo {
    pub start_location: Option<Box<[f64]>>,
    /// `None` if the log density could not be evaluated at the end point.
    pub end_location: Option<Box<[f64]>>,
    /// Energy at the end of the step minus the energy at the start of the
    /// trajectory.
    pub energy_error: Option<f64>,
    pub start_idx_in_trajectory: Option<i64>,
    pub end_idx_in_trajectory: Option<i64>,
    /// The recoverable error returned by the log density, if that caused
    /// the rejection.
    pub logp_function_error: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Distribution<Direction> for StandardUniform {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        match rng.random::<bool>() {
            true => Direction::Forward,
            false => Direction::Backward,
        }
    }
}

/// Observes a trajectory while it is built.
///
/// Adaptation uses collectors to learn about acceptance rates and about the
/// scale of the posterior without access to the trajectory itself.
pub trait Collector {
    type State: State;

    /// Called after every leapfrog step, with details if it diverged.
    fn register_leapfrog(
        &mut self,
        _start: &Self::State,
        _end: &Self::State,
        _divergence_info: Option<&DivergenceInfo>,
    ) {
    }
    /// Called with the state that was chosen as the next draw.
    fn register_draw(&mut self, _state: &Self::State, _info: &SampleInfo) {}
    /// Called once the momentum of the initial point is set.
    fn register_init(&mut self, _state: &Self::State, _options: &NutsOptions) {}
}

pub trait LogpError: std::error::Error + Send + Sync {
    /// Recoverable errors reject the leapfrog step like a divergence,
    /// all others stop the chain.
    fn is_recoverable(&self) -> bool;
}

/// Potential and kinetic energy together with the leapfrog integrator.
pub trait Hamiltonian {
    type State: State;
    type LogpError: LogpError + 'static;

    /// Integrate one step of size `step_size()` from `start` in direction `dir`.
    ///
    /// The outer error is fatal, the inner one marks a rejected step.
    fn leapfrog<C: Collector<State = Self::State>>(
        &mut self,
        pool: &mut <Self::State as State>::Pool,
        start: &Self::State,
        dir: Direction,
        initial_energy: f64,
        collector: &mut C,
    ) -> Result<std::result::Result<Self::State, DivergenceInfo>>;

    /// A state at position `init` with log density and gradient evaluated.
    /// The momentum is not initialized.
    fn init_state(
        &mut self,
        pool: &mut <Self::State as State>::Pool,
        init: &[f64],
    ) -> Result<Self::State>;

    /// Draw a new momentum from the kinetic energy distribution.
    fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut Self::State, rng: &mut R);

    fn new_empty_state(&mut self, pool: &mut <Self::State as State>::Pool) -> Self::State;

    fn new_pool(&mut self, capacity: usize) -> <Self::State as State>::Pool;

    /// Number of position coordinates
    fn dim(&self) -> usize;

    fn step_size(&self) -> f64;
}

/// A point of a trajectory in phase space.
///
/// Besides position and momentum a state knows its index relative to the
/// initial point and the sum of all momenta between it and the initial
/// point, which is all the U-turn criterion needs.
pub trait State: Clone {
    type Pool;

    fn write_position(&self, out: &mut [f64]);

    /// Generalized U-turn criterion for the sub-trajectory between `self`
    /// and `other`.
    fn is_turning(&self, other: &Self) -> bool;

    /// Potential plus kinetic energy
    fn energy(&self) -> f64;
    fn potential_energy(&self) -> f64;
    fn index_in_trajectory(&self) -> i64;

    /// Turn this state into the initial point of a new trajectory.
    fn make_init_point(&mut self);

    fn log_acceptance_probability(&self, initial_energy: f64) -> f64 {
        (initial_energy - self.energy()).min(0.)
    }
}

#[derive(Debug)]
pub struct SampleInfo {
    /// Number of doublings of the final trajectory
    pub depth: u64,
    pub divergence_info: Option<DivergenceInfo>,
    /// The trajectory stopped at the maximum depth without a U-turn.
    pub reached_maxdepth: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct NutsOptions {
    pub maxdepth: u64,
}

/// A contiguous stretch of a trajectory with `2^depth` points.
struct Trajectory<P: Hamiltonian, C: Collector<State = P::State>> {
    /// The end with the smaller index in the trajectory
    first: P::State,
    last: P::State,
    /// Multinomial draw among the points of this stretch
    proposal: P::State,
    /// Log of the summed weights of all points
    log_weight: f64,
    depth: u64,
    initial_energy: f64,
    /// Only the trajectory grown from the initial point uses biased
    /// progressive sampling when absorbing a new half.
    contains_init: bool,
    collector: PhantomData<C>,
}

/// Outcome of doubling a trajectory.
enum Growth<P: Hamiltonian, C: Collector<State = P::State>> {
    Continue(Trajectory<P, C>),
    UTurn(Trajectory<P, C>),
    /// The new half diverged and was discarded.
    Divergent(Trajectory<P, C>, DivergenceInfo),
    Failed(NutsError),
}

impl<P: Hamiltonian, C: Collector<State = P::State>> Trajectory<P, C> {
    fn new(init: P::State) -> Self {
        Trajectory {
            initial_energy: init.energy(),
            first: init.clone(),
            last: init.clone(),
            proposal: init,
            log_weight: 0.,
            depth: 0,
            contains_init: true,
            collector: PhantomData,
        }
    }

    /// The end that new points are attached to when growing in `direction`.
    fn end(&self, direction: Direction) -> &P::State {
        match direction {
            Direction::Forward => &self.last,
            Direction::Backward => &self.first,
        }
    }

    /// Build a new stretch of the same depth next to `self` and absorb it.
    fn grow<R: Rng + ?Sized>(
        mut self,
        pool: &mut <P::State as State>::Pool,
        rng: &mut R,
        potential: &mut P,
        direction: Direction,
        collector: &mut C,
    ) -> Growth<P, C> {
        let mut half = match self.leaf(pool, potential, direction, collector) {
            Ok(Ok(leaf)) => leaf,
            Ok(Err(info)) => return Growth::Divergent(self, info),
            Err(err) => return Growth::Failed(err),
        };

        while half.depth < self.depth {
            half = match half.grow(pool, rng, potential, direction, collector) {
                Growth::Continue(half) => half,
                // A U-turn inside the new half rejects all of it.
                Growth::UTurn(_) => return Growth::UTurn(self),
                Growth::Divergent(_, info) => return Growth::Divergent(self, info),
                Growth::Failed(err) => return Growth::Failed(err),
            };
        }

        let turning = self.turns_with(&half, direction);
        self.absorb(half, rng, direction);

        if turning {
            Growth::UTurn(self)
        } else {
            Growth::Continue(self)
        }
    }

    /// Check the U-turn criterion for the union of `self` and the adjacent
    /// `half`, and for the two halves extended by one point each.
    fn turns_with(&self, half: &Self, direction: Direction) -> bool {
        let (first, last) = match direction {
            Direction::Forward => (&self.first, &half.last),
            Direction::Backward => (&half.first, &self.last),
        };
        if first.is_turning(last) {
            return true;
        }
        if self.depth == 0 {
            return false;
        }
        self.last.is_turning(&half.last) || self.first.is_turning(&half.first)
    }

    fn absorb<R: Rng + ?Sized>(&mut self, half: Self, rng: &mut R, direction: Direction) {
        debug_assert_eq!(self.depth, half.depth);
        match direction {
            Direction::Forward => self.last = half.last,
            Direction::Backward => self.first = half.first,
        }
        debug_assert!(self.first.index_in_trajectory() <= self.last.index_in_trajectory());

        let log_weight = logaddexp(self.log_weight, half.log_weight);

        // Trajectories that contain the initial point move away from it
        // whenever the new half is at least as heavy.
        let reference = if self.contains_init {
            self.log_weight
        } else {
            log_weight
        };
        let accept = (half.log_weight >= reference)
            || rng.random_bool((half.log_weight - reference).exp());
        if accept {
            self.proposal = half.proposal;
        }

        self.depth += 1;
        self.log_weight = log_weight;
    }

    /// A stretch with the single point one leapfrog step beyond `self`.
    fn leaf(
        &self,
        pool: &mut <P::State as State>::Pool,
        potential: &mut P,
        direction: Direction,
        collector: &mut C,
    ) -> Result<std::result::Result<Self, DivergenceInfo>> {
        let start = self.end(direction);
        let leapfrog = potential.leapfrog(pool, start, direction, self.initial_energy, collector)?;
        let point = match leapfrog {
            Ok(point) => point,
            Err(info) => return Ok(Err(info)),
        };

        let log_weight = point.log_acceptance_probability(self.initial_energy)
            + (self.initial_energy - point.energy()).max(0.);
        Ok(Ok(Trajectory {
            first: point.clone(),
            last: point.clone(),
            proposal: point,
            log_weight,
            depth: 0,
            initial_energy: self.initial_energy,
            contains_init: false,
            collector: PhantomData,
        }))
    }

    fn finish(self, collector: &mut C, info: SampleInfo) -> (P::State, SampleInfo) {
        collector.register_draw(&self.proposal, &info);
        (self.proposal, info)
    }
}

/// Build one trajectory from `init` and return the next draw of the chain.
///
/// The draw may be `init` itself if no other point was selected.
pub(crate) fn sample_trajectory<P, R, C>(
    pool: &mut <P::State as State>::Pool,
    init: &mut P::State,
    rng: &mut R,
    potential: &mut P,
    options: &NutsOptions,
    collector: &mut C,
) -> Result<(P::State, SampleInfo)>
where
    P: Hamiltonian,
    R: Rng + ?Sized,
    C: Collector<State = P::State>,
{
    potential.randomize_momentum(init, rng);
    init.make_init_point();
    collector.register_init(init, options);

    let mut trajectory = Trajectory::new(init.clone());
    while trajectory.depth < options.maxdepth {
        let direction: Direction = rng.random();
        trajectory = match trajectory.grow(pool, rng, potential, direction, collector) {
            Growth::Continue(trajectory) => trajectory,
            Growth::UTurn(trajectory) => {
                let info = SampleInfo {
                    depth: trajectory.depth,
                    divergence_info: None,
                    reached_maxdepth: false,
                };
                return Ok(trajectory.finish(collector, info));
            }
            Growth::Divergent(trajectory, divergence) => {
                let info = SampleInfo {
                    depth: trajectory.depth,
                    divergence_info: Some(divergence),
                    reached_maxdepth: false,
                };
                return Ok(trajectory.finish(collector, info));
            }
            Growth::Failed(err) => return Err(err),
        };
    }
    let info = SampleInfo {
        depth: trajectory.depth,
        divergence_info: None,
        reached_maxdepth: true,
    };
    Ok(trajectory.finish(collector, info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cpu_potential::{test_logps::NormalLogp, EuclideanPotential},
        cpu_state::StatePool,
        mass_matrix::{DiagMassMatrix, NullCollector},
    };
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn setup(
        dim: usize,
        step_size: f64,
        max_energy_error: f64,
        init: &[f64],
    ) -> (
        EuclideanPotential<NormalLogp, DiagMassMatrix>,
        StatePool,
        crate::cpu_state::State,
    ) {
        let logp = NormalLogp::new(dim, 0.);
        let mut potential =
            EuclideanPotential::new(logp, DiagMassMatrix::new(dim), max_energy_error, step_size);
        let mut pool = potential.new_pool(20);
        let state = potential.init_state(&mut pool, init).unwrap();
        (potential, pool, state)
    }

    fn run(seed: u64, step_size: f64, maxdepth: u64) -> (Vec<f64>, SampleInfo) {
        let (mut potential, mut pool, mut state) = setup(3, step_size, 1000., &[0.5, -1., 2.]);
        let mut rng = StdRng::seed_from_u64(seed);
        let (draw, info) = sample_trajectory(
            &mut pool,
            &mut state,
            &mut rng,
            &mut potential,
            &NutsOptions { maxdepth },
            &mut NullCollector {},
        )
        .unwrap();
        let mut position = vec![0f64; 3];
        draw.write_position(&mut position);
        (position, info)
    }

    #[test]
    fn same_seed_same_draw() {
        let (first, first_info) = run(42, 0.3, 10);
        let (second, second_info) = run(42, 0.3, 10);
        assert_eq!(first, second);
        assert_eq!(first_info.depth, second_info.depth);
        assert!(first_info.depth >= 1);
        assert!(first_info.divergence_info.is_none());
    }

    #[test]
    fn stops_at_maxdepth() {
        // Tiny steps never turn around within two doublings.
        let (_, info) = run(1, 1e-4, 2);
        assert!(info.reached_maxdepth);
        assert_eq!(info.depth, 2);
    }

    #[test]
    fn divergence_keeps_initial_point() {
        let (mut potential, mut pool, mut state) = setup(2, 1e3, 10., &[1., -1.]);
        let mut rng = StdRng::seed_from_u64(1);
        let (draw, info) = sample_trajectory(
            &mut pool,
            &mut state,
            &mut rng,
            &mut potential,
            &NutsOptions { maxdepth: 10 },
            &mut NullCollector {},
        )
        .unwrap();
        let divergence = info.divergence_info.expect("Expected a divergence");
        assert!(divergence.energy_error.unwrap() > 10.);
        assert_eq!(info.depth, 0);
        let mut position = vec![0f64; 2];
        draw.write_position(&mut position);
        assert_eq!(position, vec![1., -1.]);
    }
}
