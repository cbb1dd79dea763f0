//! Warmup adaptation of the step size and the diagonal mass matrix.

use std::{fmt::Debug, iter, marker::PhantomData};

use itertools::izip;
use log::debug;
use rand::Rng;

use crate::{
    chain::AdaptStrategy,
    cpu_potential::{CpuLogpFunc, EuclideanPotential},
    cpu_state::{State, StatePool},
    mass_matrix::{
        DiagAdaptExpSettings, DiagMassMatrix, DrawGradCollector, ExpWeightedVariance, MassMatrix,
    },
    nuts::{Collector, Direction, DivergenceInfo, Hamiltonian, NutsOptions, SampleInfo, State as _},
    stepsize::{AcceptanceRateCollector, DualAverage, DualAverageOptions},
};

const MIN_MASS_MATRIX_VARIANCE: f64 = 1e-10;
const MAX_MASS_MATRIX_VARIANCE: f64 = 1e10;

/// Settings for step size adaptation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DualAverageSettings {
    /// Mean acceptance probability of the leapfrog steps that the step
    /// size is tuned towards.
    pub target_accept: f64,
    pub params: DualAverageOptions,
}

impl Default for DualAverageSettings {
    fn default() -> Self {
        Self {
            target_accept: 0.95,
            params: DualAverageOptions::default(),
        }
    }
}

pub(crate) struct DualAverageStrategy<F, M> {
    controller: DualAverage,
    settings: DualAverageSettings,
    num_tune: u64,
    _marker: PhantomData<(F, M)>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DualAverageStats {
    pub(crate) step_size_bar: f64,
    pub(crate) mean_tree_accept: f64,
    pub(crate) n_steps: u64,
}

impl<F: CpuLogpFunc, M: MassMatrix> DualAverageStrategy<F, M> {
    pub(crate) fn new(settings: DualAverageSettings, num_tune: u64) -> Self {
        Self {
            controller: DualAverage::new(settings.params),
            settings,
            num_tune,
            _marker: PhantomData,
        }
    }

    /// Acceptance probability of a single leapfrog step from `state`.
    ///
    /// `None` if the log density failed with an unrecoverable error.
    fn single_step_accept(
        potential: &mut EuclideanPotential<F, M>,
        pool: &mut StatePool,
        state: &State,
        options: &NutsOptions,
    ) -> Option<f64> {
        let mut collector = AcceptanceRateCollector::new();
        collector.register_init(state, options);
        let _ = potential
            .leapfrog(pool, state, Direction::Forward, state.energy(), &mut collector)
            .ok()?;
        Some(collector.mean.current())
    }

    /// Starting from the configured initial step size, double or halve it
    /// until one leapfrog step from `state` crosses the target acceptance.
    fn search_initial_step<R: Rng + ?Sized>(
        &self,
        options: &NutsOptions,
        potential: &mut EuclideanPotential<F, M>,
        pool: &mut StatePool,
        state: &State,
        rng: &mut R,
    ) -> Option<f64> {
        let mut state = state.deep_clone(pool);
        potential.randomize_momentum(&mut state, rng);
        state.make_init_point();

        let target = self.settings.target_accept;
        potential.step_size = self.settings.params.initial_step;
        let increase = Self::single_step_accept(potential, pool, &state, options)? > target;

        for _ in 0..100 {
            let accept = Self::single_step_accept(potential, pool, &state, options)?;
            let crossed = if increase {
                (accept <= target) | (potential.step_size > 1e5)
            } else {
                (accept >= target) | (potential.step_size < 1e-10)
            };
            if crossed {
                return Some(potential.step_size);
            }
            potential.step_size *= if increase { 2. } else { 0.5 };
        }
        None
    }
}

impl<F: CpuLogpFunc, M: MassMatrix> AdaptStrategy for DualAverageStrategy<F, M> {
    type Potential = EuclideanPotential<F, M>;
    type Collector = AcceptanceRateCollector<State>;
    type Stats = DualAverageStats;

    fn init<R: Rng + ?Sized>(
        &mut self,
        options: &mut NutsOptions,
        potential: &mut Self::Potential,
        pool: &mut StatePool,
        state: &State,
        rng: &mut R,
    ) {
        let step_size = self
            .search_initial_step(options, potential, pool, state, rng)
            .unwrap_or(self.settings.params.initial_step);
        debug!("Initial step size {step_size:.4e}");
        potential.step_size = step_size;
        self.controller.reset(step_size);
    }

    fn adapt(
        &mut self,
        _options: &mut NutsOptions,
        potential: &mut Self::Potential,
        draw: u64,
        collector: &Self::Collector,
    ) {
        if draw < self.num_tune {
            self.controller
                .advance(collector.mean.current(), self.settings.target_accept);
        }
        // From the last warmup draw on every draw uses the averaged step size.
        potential.step_size = if draw + 1 < self.num_tune {
            self.controller.current_step_size()
        } else {
            self.controller.current_step_size_adapted()
        };
    }

    fn new_collector(&self) -> Self::Collector {
        AcceptanceRateCollector::new()
    }

    fn current_stats(
        &self,
        _options: &NutsOptions,
        _potential: &Self::Potential,
        collector: &Self::Collector,
    ) -> Self::Stats {
        DualAverageStats {
            step_size_bar: self.controller.current_step_size_adapted(),
            mean_tree_accept: collector.mean.current(),
            n_steps: collector.mean.count(),
        }
    }
}

/// Exponentially weighted variances of draws and of gradients.
struct VarianceWindow {
    draws: ExpWeightedVariance,
    grads: ExpWeightedVariance,
}

impl VarianceWindow {
    fn new(dim: usize, decay: f64) -> Self {
        VarianceWindow {
            draws: ExpWeightedVariance::new(dim, decay),
            grads: ExpWeightedVariance::new(dim, decay),
        }
    }

    fn count(&self) -> u64 {
        self.draws.count()
    }

    fn add(&mut self, collector: &DrawGradCollector) {
        self.draws.add_sample(collector.draw.iter().copied());
        self.grads.add_sample(collector.grad.iter().copied());
    }

    /// Diagonal of the inverse mass matrix, `sqrt(var(draw) / var(grad))`.
    fn mass_matrix_diag(&self) -> impl Iterator<Item = f64> + '_ {
        izip!(self.draws.current(), self.grads.current()).map(|(draw, grad)| {
            let variance = (draw / grad)
                .sqrt()
                .clamp(MIN_MASS_MATRIX_VARIANCE, MAX_MASS_MATRIX_VARIANCE);
            if variance.is_finite() {
                variance
            } else {
                1.
            }
        })
    }
}

/// Diagonal mass matrix adaptation with two overlapping estimation windows.
///
/// The foreground window sets the mass matrix. The background window
/// collects the same draws and replaces the foreground every
/// `window_switch_freq` draws, so early warmup draws are forgotten.
pub(crate) struct ExpWindowDiagAdapt<F> {
    dim: usize,
    /// Adaptation stops before this draw.
    stop_at: u64,
    foreground: VarianceWindow,
    background: VarianceWindow,
    settings: DiagAdaptExpSettings,
    adapting: bool,
    _marker: PhantomData<F>,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct ExpWindowDiagAdaptStats {
    pub(crate) adapting: bool,
}

impl<F: CpuLogpFunc> ExpWindowDiagAdapt<F> {
    pub(crate) fn new(settings: DiagAdaptExpSettings, num_tune: u64, dim: usize) -> Self {
        Self {
            dim,
            stop_at: num_tune.saturating_sub(settings.final_window),
            foreground: VarianceWindow::new(dim, settings.early_variance_decay),
            background: VarianceWindow::new(dim, settings.early_variance_decay),
            settings,
            adapting: true,
            _marker: PhantomData,
        }
    }

    fn update_mass_matrix(&self, mass_matrix: &mut DiagMassMatrix) {
        mass_matrix.update_diag(self.foreground.mass_matrix_diag());
    }
}

impl<F: CpuLogpFunc> AdaptStrategy for ExpWindowDiagAdapt<F> {
    type Potential = EuclideanPotential<F, DiagMassMatrix>;
    type Collector = DrawGradCollector;
    type Stats = ExpWindowDiagAdaptStats;

    fn init<R: Rng + ?Sized>(
        &mut self,
        _options: &mut NutsOptions,
        potential: &mut Self::Potential,
        _pool: &mut StatePool,
        state: &State,
        _rng: &mut R,
    ) {
        let grad_init = self.settings.grad_init;
        let window = &mut self.foreground;
        window.draws.set_variance(iter::repeat(1.));
        window.draws.set_mean(state.q.iter().copied());
        window.grads.set_variance(state.grad.iter().map(|&grad| {
            let variance = grad * grad;
            if grad_init & (variance > 0.) & variance.is_finite() {
                variance
            } else {
                1.
            }
        }));
        window.grads.set_mean(iter::repeat(0.));

        self.update_mass_matrix(&mut potential.mass_matrix);
    }

    fn adapt(
        &mut self,
        _options: &mut NutsOptions,
        potential: &mut Self::Potential,
        draw: u64,
        collector: &Self::Collector,
    ) {
        self.adapting = draw + 1 < self.stop_at;
        if draw >= self.stop_at {
            return;
        }

        let settings = self.settings;
        let background_count = self.background.count();
        let early_switch = (background_count == settings.early_window_switch_freq)
            & (draw < settings.window_switch_freq);
        let regular_switch = (draw % settings.window_switch_freq == 0) & (background_count > 5);

        if early_switch | regular_switch {
            let mut fresh = VarianceWindow::new(self.dim, settings.variance_decay);
            fresh.draws.set_mean(collector.draw.iter().copied());
            fresh.grads.set_mean(collector.grad.iter().copied());
            self.foreground = std::mem::replace(&mut self.background, fresh);
        } else if collector.informative {
            self.foreground.add(collector);
            self.background.add(collector);
        }

        let use_window = settings.grad_init | (draw > settings.window_switch_freq);
        if (self.foreground.count() > 2) & use_window {
            self.update_mass_matrix(&mut potential.mass_matrix);
        }
    }

    fn new_collector(&self) -> Self::Collector {
        DrawGradCollector::new(self.dim)
    }

    fn current_stats(
        &self,
        _options: &NutsOptions,
        _potential: &Self::Potential,
        _collector: &Self::Collector,
    ) -> Self::Stats {
        ExpWindowDiagAdaptStats {
            adapting: self.adapting,
        }
    }
}

/// Step size and mass matrix adaptation on the same potential.
pub(crate) struct CombinedStrategy<S1, S2> {
    step_size: S1,
    mass_matrix: S2,
}

impl<S1, S2> CombinedStrategy<S1, S2> {
    pub(crate) fn new(step_size: S1, mass_matrix: S2) -> Self {
        Self {
            step_size,
            mass_matrix,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CombinedStats<D1: Debug, D2: Debug> {
    pub(crate) step_size: D1,
    pub(crate) mass_matrix: D2,
}

impl<S1, S2> AdaptStrategy for CombinedStrategy<S1, S2>
where
    S1: AdaptStrategy,
    S2: AdaptStrategy<Potential = S1::Potential>,
{
    type Potential = S1::Potential;
    type Collector = CombinedCollector<S1::Collector, S2::Collector>;
    type Stats = CombinedStats<S1::Stats, S2::Stats>;

    fn init<R: Rng + ?Sized>(
        &mut self,
        options: &mut NutsOptions,
        potential: &mut Self::Potential,
        pool: &mut <<Self::Potential as Hamiltonian>::State as crate::nuts::State>::Pool,
        state: &<Self::Potential as Hamiltonian>::State,
        rng: &mut R,
    ) {
        // The step size search runs with the initial mass matrix.
        self.mass_matrix.init(options, potential, pool, state, rng);
        self.step_size.init(options, potential, pool, state, rng);
    }

    fn adapt(
        &mut self,
        options: &mut NutsOptions,
        potential: &mut Self::Potential,
        draw: u64,
        collector: &Self::Collector,
    ) {
        self.step_size
            .adapt(options, potential, draw, &collector.step_size);
        self.mass_matrix
            .adapt(options, potential, draw, &collector.mass_matrix);
    }

    fn new_collector(&self) -> Self::Collector {
        CombinedCollector {
            step_size: self.step_size.new_collector(),
            mass_matrix: self.mass_matrix.new_collector(),
        }
    }

    fn current_stats(
        &self,
        options: &NutsOptions,
        potential: &Self::Potential,
        collector: &Self::Collector,
    ) -> Self::Stats {
        CombinedStats {
            step_size: self
                .step_size
                .current_stats(options, potential, &collector.step_size),
            mass_matrix: self
                .mass_matrix
                .current_stats(options, potential, &collector.mass_matrix),
        }
    }
}

pub(crate) struct CombinedCollector<C1: Collector, C2: Collector> {
    step_size: C1,
    mass_matrix: C2,
}

impl<C1, C2> Collector for CombinedCollector<C1, C2>
where
    C1: Collector,
    C2: Collector<State = C1::State>,
{
    type State = C1::State;

    fn register_leapfrog(
        &mut self,
        start: &Self::State,
        end: &Self::State,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        self.step_size.register_leapfrog(start, end, divergence_info);
        self.mass_matrix
            .register_leapfrog(start, end, divergence_info);
    }

    fn register_draw(&mut self, state: &Self::State, info: &SampleInfo) {
        self.step_size.register_draw(state, info);
        self.mass_matrix.register_draw(state, info);
    }

    fn register_init(&mut self, state: &Self::State, options: &NutsOptions) {
        self.step_size.register_init(state, options);
        self.mass_matrix.register_init(state, options);
    }
}
