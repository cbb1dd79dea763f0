use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::{ThreadPoolBuildError, ThreadPoolBuilder};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, RecvTimeoutError},
        Arc,
    },
    thread::spawn,
    time::{Duration, Instant},
};

use crate::{
    adapt_strategy::{
        CombinedStats, CombinedStrategy, DualAverageSettings, DualAverageStats,
        DualAverageStrategy, ExpWindowDiagAdapt, ExpWindowDiagAdaptStats,
    },
    chain::{Chain, ChainPhase, DrawStats, NutsChain, NutsSampleStats},
    cpu_potential::{CpuLogpFunc, EuclideanPotential},
    inference::InferenceError,
    mass_matrix::{DiagAdaptExpSettings, DiagMassMatrix},
    model::ConfigurationError,
    nuts::NutsOptions,
    transform::Parameterization,
};

/// Number of random initial points tried before a chain gives up.
const MAX_INIT_TRIES: usize = 100;

/// Upper bound on the draws a chain reserves memory for up front.
const MAX_PREALLOCATED_DRAWS: u64 = 1 << 16;

/// Settings for the NUTS sampler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerSettings {
    /// The number of tuning steps, where we fit the step size and mass matrix.
    pub num_tune: u64,
    /// The number of draws after tuning
    pub num_draws: u64,
    pub num_chains: usize,
    /// Worker threads. Defaults to one per chain.
    pub num_cores: Option<usize>,
    pub seed: u64,
    /// The maximum tree depth during sampling. The number of leapfrog steps
    /// is smaller than 2 ^ maxdepth.
    pub maxdepth: u64,
    /// If the energy error is larger than this threshold we treat the leapfrog
    /// step as a divergence.
    pub max_energy_error: f64,
    /// A chain with a larger fraction of diverging posterior draws is
    /// flagged as low quality.
    pub max_divergence_rate: f64,
    pub step_size: DualAverageSettings,
    pub mass_matrix: DiagAdaptExpSettings,
    pub parameterization: Parameterization,
    /// Abandon the whole run if it takes longer than this.
    pub timeout: Option<Duration>,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            num_tune: 1000,
            num_draws: 2000,
            num_chains: 4,
            num_cores: None,
            seed: 0,
            maxdepth: 10,
            max_energy_error: 1000f64,
            max_divergence_rate: 0.1,
            step_size: DualAverageSettings::default(),
            mass_matrix: DiagAdaptExpSettings::default(),
            parameterization: Parameterization::default(),
            timeout: None,
        }
    }
}

type DiagNutsChain<F> = NutsChain<
    EuclideanPotential<F, DiagMassMatrix>,
    SmallRng,
    CombinedStrategy<DualAverageStrategy<F, DiagMassMatrix>, ExpWindowDiagAdapt<F>>,
>;

impl SamplerSettings {
    pub fn validate(&self) -> std::result::Result<(), ConfigurationError> {
        let invalid = |msg: String| Err(ConfigurationError::InvalidSettings(msg));
        let target = self.step_size.target_accept;
        let initial_step = self.step_size.params.initial_step;
        let mass_matrix = &self.mass_matrix;

        if self.num_draws == 0 {
            return invalid("num_draws must be positive".into());
        }
        if self.num_tune.checked_add(self.num_draws).is_none() {
            return invalid(format!(
                "num_tune {} and num_draws {} add up to too many draws",
                self.num_tune, self.num_draws
            ));
        }
        if self.num_chains == 0 {
            return invalid("num_chains must be positive".into());
        }
        if self.num_cores == Some(0) {
            return invalid("num_cores must be positive".into());
        }
        if !(1..=30).contains(&self.maxdepth) {
            return invalid(format!("maxdepth {} must be in 1..=30", self.maxdepth));
        }
        if !(self.max_energy_error > 0.) {
            return invalid(format!(
                "max_energy_error {} must be positive",
                self.max_energy_error
            ));
        }
        if !(0. ..=1.).contains(&self.max_divergence_rate) {
            return invalid(format!(
                "max_divergence_rate {} must be in [0, 1]",
                self.max_divergence_rate
            ));
        }
        if !((target > 0.) & (target < 1.)) {
            return invalid(format!("target_accept {} must be in (0, 1)", target));
        }
        if !(initial_step.is_finite() & (initial_step > 0.)) {
            return invalid(format!("initial step size {} must be positive", initial_step));
        }
        if (mass_matrix.window_switch_freq == 0) | (mass_matrix.early_window_switch_freq == 0) {
            return invalid("mass matrix window sizes must be positive".into());
        }
        for decay in [mass_matrix.variance_decay, mass_matrix.early_variance_decay] {
            if !((decay > 0.) & (decay < 1.)) {
                return invalid(format!("variance decay {} must be in (0, 1)", decay));
            }
        }
        Ok(())
    }

    fn new_chain<F: CpuLogpFunc, R: Rng>(
        &self,
        chain: u64,
        logp: F,
        rng: &mut R,
    ) -> DiagNutsChain<F> {
        let num_tune = self.num_tune;
        let dim = logp.dim();
        let step_size_adapt = DualAverageStrategy::new(self.step_size, num_tune);
        let mass_matrix_adapt = ExpWindowDiagAdapt::new(self.mass_matrix, num_tune, dim);

        let strategy = CombinedStrategy::new(step_size_adapt, mass_matrix_adapt);

        let mass_matrix = DiagMassMatrix::new(dim);
        let potential = EuclideanPotential::new(
            logp,
            mass_matrix,
            self.max_energy_error,
            self.step_size.params.initial_step,
        );

        let options = NutsOptions {
            maxdepth: self.maxdepth,
        };

        let rng = SmallRng::from_rng(rng);

        NutsChain::new(
            potential,
            strategy,
            options,
            rng,
            chain,
            num_tune,
            self.num_draws,
        )
    }
}

/// A posterior density together with a way to pick initial points and to
/// map sampler positions back to parameter values.
pub trait Model: Send + Sync + 'static {
    type Density: CpuLogpFunc;

    /// A fresh density evaluator for one chain.
    fn density(&self) -> Result<Self::Density>;

    /// Draw a random initial position in the space the sampler moves in.
    fn init_position<R: Rng + ?Sized>(&self, rng: &mut R, position: &mut [f64]) -> Result<()>;

    /// Write the parameter values for a sampler position into `draw`.
    fn constrain(&self, position: &[f64], draw: &mut [f64]);
}

type DiagNutsStats = NutsSampleStats<CombinedStats<DualAverageStats, ExpWindowDiagAdaptStats>>;

fn draw_stats(stats: &DiagNutsStats) -> DrawStats {
    let step_size_stats = &stats.strategy_stats.step_size;
    DrawStats {
        draw: stats.draw,
        depth: stats.depth,
        maxdepth_reached: stats.maxdepth_reached,
        index_in_trajectory: stats.idx_in_trajectory,
        diverging: stats.diverging,
        logp: stats.logp,
        energy: stats.energy,
        energy_error: stats.energy_error,
        step_size: stats.step_size,
        step_size_bar: step_size_stats.step_size_bar,
        mean_tree_accept: step_size_stats.mean_tree_accept,
        n_steps: step_size_stats.n_steps,
        tuning: stats.tuning,
        adapting_mass_matrix: stats.strategy_stats.mass_matrix.adapting,
    }
}

/// Run a single chain to completion.
///
/// Returns `Ok(None)` if `abort` was raised before the chain finished.
pub(crate) fn sample_chain<M: Model>(
    model: &M,
    settings: &SamplerSettings,
    chain_id: u64,
    abort: &AtomicBool,
) -> Result<Option<Chain>> {
    debug!("Starting chain {chain_id}");
    let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
    rng.set_stream(chain_id);

    let logp = model.density().context("Failed to create model density")?;
    let dim = logp.dim();
    let mut sampler = settings.new_chain(chain_id, logp, &mut rng);

    let mut initval = vec![0f64; dim];
    let mut error = None;
    for attempt in 0..MAX_INIT_TRIES {
        model
            .init_position(&mut rng, &mut initval)
            .context("Failed to generate a new initial position")?;
        match sampler.set_position(&initval) {
            Ok(()) => {
                error = None;
                break;
            }
            Err(err) => {
                debug!("Chain {chain_id}: initial point {attempt} rejected: {err}");
                error = Some(err);
            }
        }
    }

    if let Some(error) = error {
        return Err(anyhow::Error::new(error).context("All initialization points failed"));
    }

    let num_tune = settings.num_tune.min(MAX_PREALLOCATED_DRAWS) as usize;
    let num_draws = settings.num_draws.min(MAX_PREALLOCATED_DRAWS) as usize;
    let mut warmup = Vec::with_capacity(num_tune);
    let mut draws = Vec::with_capacity(num_draws);
    let mut stats = Vec::with_capacity(num_tune + num_draws);
    let mut divergences = 0u64;
    let mut warmup_divergences = 0u64;

    while sampler.phase() != ChainPhase::Done {
        if abort.load(Ordering::Relaxed) {
            debug!("Chain {chain_id} aborted after {} draws", stats.len());
            return Ok(None);
        }
        let (position, info) = sampler
            .draw()
            .with_context(|| format!("Failed to draw sample {} in chain {chain_id}", stats.len()))?;

        let mut draw: Box<[f64]> = vec![0f64; dim].into();
        model.constrain(&position, &mut draw);

        let info = draw_stats(&info);
        if info.tuning {
            warmup_divergences += info.diverging as u64;
            warmup.push(draw);
        } else {
            divergences += info.diverging as u64;
            draws.push(draw);
        }
        stats.push(info);
    }

    let mut chain = Chain {
        chain_id,
        draws,
        warmup,
        stats,
        divergences,
        warmup_divergences,
        step_size: sampler.step_size(),
        mass_matrix_inv: sampler.mass_matrix_inv().into(),
        low_quality: false,
    };
    chain.low_quality = chain.divergence_rate() > settings.max_divergence_rate;

    info!(
        "Chain {chain_id} finished: {} draws, {} divergences, step size {:.4e}",
        chain.len(),
        chain.divergences,
        chain.step_size
    );
    if chain.low_quality {
        warn!(
            "Chain {chain_id} is of low quality: {:.1}% of the draws diverged",
            100. * chain.divergence_rate()
        );
    }
    Ok(Some(chain))
}

/// Sample all chains in parallel on a dedicated thread pool.
///
/// Chains are returned in order of their id. If any chain fails or the
/// timeout passes, the remaining chains are stopped and no chain is returned.
pub fn sample_parallel<M: Model>(
    model: M,
    settings: &SamplerSettings,
) -> std::result::Result<Vec<Chain>, InferenceError> {
    settings.validate()?;

    let settings = *settings;
    let num_chains = settings.num_chains;
    let num_cores = settings.num_cores.unwrap_or(num_chains);
    // A timeout too large to be represented never expires.
    let deadline = settings
        .timeout
        .and_then(|timeout| Instant::now().checked_add(timeout));

    let abort = Arc::new(AtomicBool::new(false));
    let (results_tx, results_rx) = channel();

    let abort_inner = abort.clone();
    let main_thread = spawn(move || -> std::result::Result<(), ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_cores)
            .thread_name(|i| format!("aav-nuts-worker-{}", i))
            .build()?;

        let model_ref = &model;
        let settings_ref = &settings;
        let abort_ref = &*abort_inner;

        pool.scope_fifo(move |scope| {
            let results = results_tx;
            for chain_id in 0..num_chains as u64 {
                let results = results.clone();
                scope.spawn_fifo(move |_| {
                    let result = sample_chain(model_ref, settings_ref, chain_id, abort_ref);
                    // The receiver is gone if the run was abandoned.
                    let _ = results.send((chain_id, result));
                });
            }
            drop(results);
        });
        Ok(())
    });

    let mut chains = Vec::with_capacity(num_chains);
    let mut failure = None;
    while chains.len() < num_chains {
        let received = match deadline {
            Some(deadline) => {
                results_rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => results_rx
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok((_, Ok(Some(chain)))) => chains.push(chain),
            Ok((chain, Ok(None))) => {
                failure = Some(InferenceError::ChainFailure {
                    chain,
                    source: anyhow!("Chain stopped before all draws were produced"),
                });
                break;
            }
            Ok((chain, Err(source))) => {
                failure = Some(InferenceError::ChainFailure { chain, source });
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                let timeout = settings.timeout.unwrap_or_default();
                warn!(
                    "Sampling timed out after {:?}, {} of {} chains finished",
                    timeout,
                    chains.len(),
                    num_chains
                );
                failure = Some(InferenceError::TimedOut(timeout));
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Stops the remaining workers at their next draw.
    abort.store(true, Ordering::Relaxed);
    match main_thread.join() {
        Err(payload) => std::panic::resume_unwind(payload),
        Ok(Err(err)) => return Err(InferenceError::ThreadPool(err)),
        Ok(Ok(())) => {}
    }

    if let Some(failure) = failure {
        return Err(failure);
    }
    if chains.len() < num_chains {
        return Err(InferenceError::ChainFailure {
            chain: chains.len() as u64,
            source: anyhow!("Worker exited without reporting a result"),
        });
    }
    chains.sort_by_key(|chain| chain.chain_id);
    Ok(chains)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_potential::test_logps::NormalLogp;
    use pretty_assertions::assert_eq;
    use rand_distr::StandardNormal;

    struct NormalModel {
        dim: usize,
    }

    impl Model for NormalModel {
        type Density = NormalLogp;

        fn density(&self) -> Result<NormalLogp> {
            Ok(NormalLogp::new(self.dim, 1.))
        }

        fn init_position<R: Rng + ?Sized>(&self, rng: &mut R, position: &mut [f64]) -> Result<()> {
            position
                .iter_mut()
                .for_each(|x| *x = rng.sample::<f64, _>(StandardNormal));
            Ok(())
        }

        fn constrain(&self, position: &[f64], draw: &mut [f64]) {
            draw.copy_from_slice(position);
        }
    }

    fn settings() -> SamplerSettings {
        SamplerSettings {
            num_tune: 100,
            num_draws: 50,
            num_chains: 2,
            ..Default::default()
        }
    }

    #[test]
    fn chain_has_requested_length() {
        let model = NormalModel { dim: 3 };
        let abort = AtomicBool::new(false);
        let chain = sample_chain(&model, &settings(), 0, &abort)
            .unwrap()
            .unwrap();
        assert_eq!(chain.len(), 50);
        assert_eq!(chain.warmup.len(), 100);
        assert_eq!(chain.stats.len(), 150);
        assert_eq!(chain.sampling_stats().len(), 50);
        assert!(chain.sampling_stats().iter().all(|stats| !stats.tuning));
        assert!(chain.step_size > 0.);
        assert_eq!(chain.mass_matrix_inv.len(), 3);
    }

    #[test]
    fn chains_are_reproducible() {
        let model = NormalModel { dim: 2 };
        let abort = AtomicBool::new(false);
        let first = sample_chain(&model, &settings(), 1, &abort).unwrap().unwrap();
        let second = sample_chain(&model, &settings(), 1, &abort).unwrap().unwrap();
        let other = sample_chain(&model, &settings(), 2, &abort).unwrap().unwrap();
        assert_eq!(first.draws, second.draws);
        assert_ne!(first.draws, other.draws);
    }

    #[test]
    fn abort_flag_stops_chain() {
        let model = NormalModel { dim: 2 };
        let abort = AtomicBool::new(true);
        let result = sample_chain(&model, &settings(), 0, &abort).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn parallel_chains_are_sorted() {
        let settings = SamplerSettings {
            num_chains: 3,
            num_cores: Some(2),
            ..settings()
        };
        let chains = sample_parallel(NormalModel { dim: 2 }, &settings).unwrap();
        let ids: Vec<u64> = chains.iter().map(|chain| chain.chain_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn invalid_settings() {
        let settings = SamplerSettings {
            num_draws: 0,
            ..settings()
        };
        assert!(matches!(
            sample_parallel(NormalModel { dim: 2 }, &settings),
            Err(InferenceError::Configuration(
                ConfigurationError::InvalidSettings(_)
            ))
        ));
        let mut settings = SamplerSettings::default();
        settings.step_size.target_accept = 1.;
        assert!(settings.validate().is_err());
        assert!(SamplerSettings::default().validate().is_ok());

        let settings = SamplerSettings {
            num_tune: u64::MAX,
            ..self::settings()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigurationError::InvalidSettings(_))
        ));
    }

    #[test]
    fn huge_timeout_never_expires() {
        let settings = SamplerSettings {
            timeout: Some(Duration::MAX),
            ..settings()
        };
        let chains = sample_parallel(NormalModel { dim: 2 }, &settings).unwrap();
        assert_eq!(chains.len(), 2);
        assert!(chains.iter().all(|chain| chain.len() == 50));
    }

    #[test]
    fn large_tuning_count_is_not_preallocated() {
        let settings = SamplerSettings {
            num_tune: u64::MAX - 50,
            ..settings()
        };
        assert!(settings.validate().is_ok());
        let abort = AtomicBool::new(false);
        let model = NormalModel { dim: 2 };
        let result = std::thread::scope(|scope| {
            let chain = scope.spawn(|| sample_chain(&model, &settings, 0, &abort));
            std::thread::sleep(Duration::from_millis(50));
            abort.store(true, Ordering::Relaxed);
            chain.join()
        });
        assert!(matches!(result, Ok(Ok(None))));
    }
}
