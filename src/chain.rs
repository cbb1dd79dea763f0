use std::fmt::Debug;

use log::debug;
use rand::Rng;

use crate::{
    cpu_potential::{CpuLogpFunc, EuclideanPotential},
    mass_matrix::DiagMassMatrix,
    nuts::{sample_trajectory, Collector, Hamiltonian, NutsError, NutsOptions, SampleInfo, State},
};

type Result<T> = std::result::Result<T, NutsError>;

/// Adaptation of the sampler parameters during warmup.
pub(crate) trait AdaptStrategy {
    type Potential: Hamiltonian;
    type Collector: Collector<State = <Self::Potential as Hamiltonian>::State>;
    type Stats: Copy + Send + Debug;

    fn init<R: Rng + ?Sized>(
        &mut self,
        options: &mut NutsOptions,
        potential: &mut Self::Potential,
        pool: &mut <<Self::Potential as Hamiltonian>::State as State>::Pool,
        state: &<Self::Potential as Hamiltonian>::State,
        rng: &mut R,
    );

    fn adapt(
        &mut self,
        options: &mut NutsOptions,
        potential: &mut Self::Potential,
        draw: u64,
        collector: &Self::Collector,
    );

    fn new_collector(&self) -> Self::Collector;

    fn current_stats(
        &self,
        options: &NutsOptions,
        potential: &Self::Potential,
        collector: &Self::Collector,
    ) -> Self::Stats;
}

/// The life cycle of a single chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPhase {
    /// No position has been set yet.
    Init,
    /// Draws are used to tune step size and mass matrix.
    Warmup,
    /// Sampler parameters are frozen, draws are posterior samples.
    Sampling,
    /// All draws have been produced.
    Done,
}

/// Statistics of one NUTS draw, before they are flattened into [`DrawStats`].
#[derive(Debug)]
pub(crate) struct NutsSampleStats<A: Debug> {
    pub(crate) depth: u64,
    pub(crate) maxdepth_reached: bool,
    pub(crate) idx_in_trajectory: i64,
    pub(crate) logp: f64,
    pub(crate) energy: f64,
    pub(crate) energy_error: f64,
    pub(crate) diverging: bool,
    pub(crate) draw: u64,
    pub(crate) tuning: bool,
    pub(crate) step_size: f64,
    pub(crate) strategy_stats: A,
}

pub(crate) struct NutsChain<P, R, S>
where
    P: Hamiltonian,
    R: Rng,
    S: AdaptStrategy<Potential = P>,
{
    pool: <P::State as State>::Pool,
    potential: P,
    collector: S::Collector,
    options: NutsOptions,
    rng: R,
    init: P::State,
    chain: u64,
    draw_count: u64,
    num_tune: u64,
    num_draws: u64,
    phase: ChainPhase,
    strategy: S,
}

impl<P, R, S> NutsChain<P, R, S>
where
    P: Hamiltonian,
    R: Rng,
    S: AdaptStrategy<Potential = P>,
{
    pub(crate) fn new(
        mut potential: P,
        strategy: S,
        options: NutsOptions,
        rng: R,
        chain: u64,
        num_tune: u64,
        num_draws: u64,
    ) -> Self {
        let pool_size = options.maxdepth.min(25) as usize;
        let mut pool = potential.new_pool(pool_size);
        let init = potential.new_empty_state(&mut pool);
        let collector = strategy.new_collector();
        NutsChain {
            pool,
            potential,
            collector,
            options,
            rng,
            init,
            chain,
            draw_count: 0,
            num_tune,
            num_draws,
            phase: ChainPhase::Init,
            strategy,
        }
    }

    fn phase_after(&self, draw_count: u64) -> ChainPhase {
        if draw_count < self.num_tune {
            ChainPhase::Warmup
        } else if draw_count < self.num_tune + self.num_draws {
            ChainPhase::Sampling
        } else {
            ChainPhase::Done
        }
    }

    pub(crate) fn phase(&self) -> ChainPhase {
        self.phase
    }

    pub(crate) fn step_size(&self) -> f64 {
        self.potential.step_size()
    }

    /// Initialize the sampler to a position. This should be called
    /// before calling draw.
    ///
    /// This fails if the logp function returns an error or if the
    /// density is not finite at `position`.
    pub(crate) fn set_position(&mut self, position: &[f64]) -> Result<()> {
        let state = self.potential.init_state(&mut self.pool, position)?;
        self.strategy.init(
            &mut self.options,
            &mut self.potential,
            &mut self.pool,
            &state,
            &mut self.rng,
        );
        self.init = state;
        self.draw_count = 0;
        self.phase = self.phase_after(0);
        Ok(())
    }

    /// Draw a new sample and return the position and some diagnostic information.
    pub(crate) fn draw(&mut self) -> Result<(Box<[f64]>, NutsSampleStats<S::Stats>)> {
        if matches!(self.phase, ChainPhase::Init | ChainPhase::Done) {
            return Err(NutsError::NotReady(self.phase));
        }
        let tuning = self.phase == ChainPhase::Warmup;
        let step_size = self.potential.step_size();
        let (state, info) = sample_trajectory(
            &mut self.pool,
            &mut self.init,
            &mut self.rng,
            &mut self.potential,
            &self.options,
            &mut self.collector,
        )?;
        let mut position: Box<[f64]> = vec![0f64; self.potential.dim()].into();
        state.write_position(&mut position);

        let initial_energy = self.init.energy();
        let stats = self.sample_stats(&state, &info, initial_energy, tuning, step_size);

        self.strategy.adapt(
            &mut self.options,
            &mut self.potential,
            self.draw_count,
            &self.collector,
        );

        self.draw_count += 1;
        self.phase = self.phase_after(self.draw_count);
        if tuning & (self.phase != ChainPhase::Warmup) {
            debug!(
                "Chain {} finished warmup with step size {:.4e}",
                self.chain,
                self.potential.step_size()
            );
        }
        self.init = state;
        Ok((position, stats))
    }

    fn sample_stats(
        &self,
        state: &P::State,
        info: &SampleInfo,
        initial_energy: f64,
        tuning: bool,
        step_size: f64,
    ) -> NutsSampleStats<S::Stats> {
        NutsSampleStats {
            depth: info.depth,
            maxdepth_reached: info.reached_maxdepth,
            idx_in_trajectory: state.index_in_trajectory(),
            logp: -state.potential_energy(),
            energy: state.energy(),
            energy_error: info
                .divergence_info
                .as_ref()
                .and_then(|div| div.energy_error)
                .unwrap_or(state.energy() - initial_energy),
            diverging: info.divergence_info.is_some(),
            draw: self.draw_count,
            tuning,
            step_size,
            strategy_stats: self.strategy.current_stats(
                &self.options,
                &self.potential,
                &self.collector,
            ),
        }
    }
}

impl<F, R, S> NutsChain<EuclideanPotential<F, DiagMassMatrix>, R, S>
where
    F: CpuLogpFunc,
    R: Rng,
    S: AdaptStrategy<Potential = EuclideanPotential<F, DiagMassMatrix>>,
{
    /// The diagonal of the current inverse mass matrix.
    pub(crate) fn mass_matrix_inv(&self) -> &[f64] {
        &self.potential.mass_matrix.variance
    }
}

/// Flattened statistics of a single draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawStats {
    /// Index of the draw within the chain, counting warmup draws
    pub draw: u64,
    /// Depth of the trajectory tree
    pub depth: u64,
    pub maxdepth_reached: bool,
    pub index_in_trajectory: i64,
    pub diverging: bool,
    /// Log density of the draw in the space the sampler runs in
    pub logp: f64,
    pub energy: f64,
    pub energy_error: f64,
    pub step_size: f64,
    /// Dual averaging estimate of the final step size
    pub step_size_bar: f64,
    pub mean_tree_accept: f64,
    /// Number of leapfrog steps in the trajectory
    pub n_steps: u64,
    pub tuning: bool,
    /// Whether the mass matrix was still updated after this draw
    pub adapting_mass_matrix: bool,
}

/// The result of sampling one chain.
///
/// Draws are stored in the constrained parameter space, one boxed slice per
/// draw in the order they were produced.
#[derive(Debug, Clone)]
pub struct Chain {
    pub chain_id: u64,
    /// Posterior draws, exactly `num_draws` of them.
    pub draws: Vec<Box<[f64]>>,
    /// Draws produced while tuning.
    pub warmup: Vec<Box<[f64]>>,
    /// Statistics for warmup and posterior draws, warmup first.
    pub stats: Vec<DrawStats>,
    /// Divergences after tuning.
    pub divergences: u64,
    pub warmup_divergences: u64,
    /// The frozen step size used for the posterior draws.
    pub step_size: f64,
    /// Diagonal of the adapted inverse mass matrix.
    pub mass_matrix_inv: Box<[f64]>,
    /// More than the tolerated fraction of posterior draws diverged.
    pub low_quality: bool,
}

impl Chain {
    pub fn len(&self) -> usize {
        self.draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    /// All posterior draws of the parameter at `index`.
    pub fn values(&self, index: usize) -> Vec<f64> {
        self.draws.iter().map(|draw| draw[index]).collect()
    }

    /// Fraction of posterior draws that ended in a divergence.
    pub fn divergence_rate(&self) -> f64 {
        if self.draws.is_empty() {
            return 0.;
        }
        self.divergences as f64 / self.draws.len() as f64
    }

    /// Statistics of the posterior draws only.
    pub fn sampling_stats(&self) -> &[DrawStats] {
        &self.stats[self.warmup.len()..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapt_strategy::{
            CombinedStrategy, DualAverageSettings, DualAverageStrategy, ExpWindowDiagAdapt,
        },
        cpu_potential::test_logps::NormalLogp,
        mass_matrix::DiagAdaptExpSettings,
    };
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;

    fn chain(
        num_tune: u64,
        num_draws: u64,
    ) -> NutsChain<
        EuclideanPotential<NormalLogp, DiagMassMatrix>,
        rand::rngs::StdRng,
        CombinedStrategy<
            DualAverageStrategy<NormalLogp, DiagMassMatrix>,
            ExpWindowDiagAdapt<NormalLogp>,
        >,
    > {
        let dim = 2;
        let strategy = CombinedStrategy::new(
            DualAverageStrategy::new(DualAverageSettings::default(), num_tune),
            ExpWindowDiagAdapt::new(DiagAdaptExpSettings::default(), num_tune, dim),
        );
        let potential =
            EuclideanPotential::new(NormalLogp::new(dim, 0.), DiagMassMatrix::new(dim), 1000., 0.1);
        let rng = rand::rngs::StdRng::seed_from_u64(7);
        NutsChain::new(
            potential,
            strategy,
            NutsOptions { maxdepth: 10 },
            rng,
            0,
            num_tune,
            num_draws,
        )
    }

    #[test]
    fn draw_before_init_fails() {
        let mut sampler = chain(5, 5);
        assert!(matches!(
            sampler.draw(),
            Err(NutsError::NotReady(ChainPhase::Init))
        ));
    }

    #[test]
    fn phases_follow_draw_count() {
        let mut sampler = chain(3, 2);
        sampler.set_position(&[0.5, -0.5]).unwrap();
        let mut phases = vec![sampler.phase()];
        let mut tuning = vec![];
        while sampler.phase() != ChainPhase::Done {
            let (position, stats) = sampler.draw().unwrap();
            assert_eq!(position.len(), 2);
            tuning.push(stats.tuning);
            phases.push(sampler.phase());
        }
        assert_eq!(
            phases,
            vec![
                ChainPhase::Warmup,
                ChainPhase::Warmup,
                ChainPhase::Warmup,
                ChainPhase::Sampling,
                ChainPhase::Sampling,
                ChainPhase::Done,
            ]
        );
        assert_eq!(tuning, vec![true, true, true, false, false]);
        assert!(matches!(
            sampler.draw(),
            Err(NutsError::NotReady(ChainPhase::Done))
        ));
    }

    #[test]
    fn no_warmup_starts_sampling() {
        let mut sampler = chain(0, 1);
        sampler.set_position(&[0., 0.]).unwrap();
        assert_eq!(sampler.phase(), ChainPhase::Sampling);
    }

    #[test]
    fn chain_accessors() {
        let chain = Chain {
            chain_id: 1,
            draws: vec![vec![1., 2.].into(), vec![3., 4.].into()],
            warmup: vec![vec![0., 0.].into()],
            stats: vec![],
            divergences: 1,
            warmup_divergences: 0,
            step_size: 0.5,
            mass_matrix_inv: vec![1., 1.].into(),
            low_quality: true,
        };
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.values(1), vec![2., 4.]);
        assert_eq!(chain.divergence_rate(), 0.5);
    }
}
