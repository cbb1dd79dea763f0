//! Posterior summaries and convergence diagnostics of finished chains.

use std::{
    f64::consts::{E, PI},
    fmt,
};

use itertools::Itertools;
use log::warn;
use thiserror::Error;

use crate::{
    chain::Chain,
    model::{ConfigurationError, Parameter},
};

/// Settings for [`summarize`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummarySettings {
    /// Lower and upper probability of the quantile interval.
    pub interval: (f64, f64),
    /// Probability mass of the highest density interval.
    pub hdi_prob: f64,
    /// Larger r_hat values produce a convergence warning.
    pub rhat_threshold: f64,
    /// Smaller effective sample sizes produce a warning.
    pub min_ess: f64,
    /// Number of grid points of each density estimate.
    pub density_points: usize,
}

impl Default for SummarySettings {
    fn default() -> Self {
        Self {
            interval: (0.03, 0.97),
            hdi_prob: 0.94,
            rhat_threshold: 1.01,
            min_ess: 400.,
            density_points: 200,
        }
    }
}

impl SummarySettings {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |msg: String| Err(ConfigurationError::InvalidSettings(msg));
        let (lower, upper) = self.interval;
        if !((0. ..=1.).contains(&lower) & (0. ..=1.).contains(&upper) & (lower < upper)) {
            return invalid(format!("interval ({lower}, {upper}) is not a probability range"));
        }
        if !((self.hdi_prob > 0.) & (self.hdi_prob <= 1.)) {
            return invalid(format!("hdi_prob {} must be in (0, 1]", self.hdi_prob));
        }
        if !(self.rhat_threshold.is_finite() & (self.rhat_threshold >= 1.)) {
            return invalid(format!(
                "rhat_threshold {} must be at least 1",
                self.rhat_threshold
            ));
        }
        if !(self.min_ess.is_finite() & (self.min_ess >= 0.)) {
            return invalid(format!("min_ess {} must be non-negative", self.min_ess));
        }
        if self.density_points < 2 {
            return invalid("density_points must be at least 2".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CredibleInterval {
    pub lower: f64,
    pub upper: f64,
}

impl CredibleInterval {
    pub fn contains(&self, value: f64) -> bool {
        (self.lower <= value) & (value <= self.upper)
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// A kernel density estimate evaluated on a regular grid.
#[derive(Debug, Clone, PartialEq)]
pub struct DensityEstimate {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub bandwidth: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSummary {
    pub parameter: Parameter,
    pub mean: f64,
    pub sd: f64,
    /// Quantile interval for `SummarySettings::interval`.
    pub interval: CredibleInterval,
    pub hdi: CredibleInterval,
    /// Monte Carlo standard error of the mean
    pub mcse_mean: f64,
    /// Monte Carlo standard error of the standard deviation
    pub mcse_sd: f64,
    /// Bulk effective sample size.
    pub ess: f64,
    /// Effective sample size of the 5% and 95% tails, the smaller of the two.
    pub ess_tail: f64,
    /// `None` if it is not defined for the chains, e.g. for a single chain.
    pub r_hat: Option<f64>,
    pub density: DensityEstimate,
}

/// Problems with the posterior sample that do not prevent a summary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SamplingWarning {
    #[error("r_hat of {parameter} is {r_hat:.3}, the chains did not converge")]
    Convergence { parameter: Parameter, r_hat: f64 },
    #[error("r_hat of {parameter} is undefined, convergence cannot be assessed")]
    UndefinedRhat { parameter: Parameter },
    #[error("effective sample size of {parameter} is only {ess:.0}")]
    LowEffectiveSampleSize { parameter: Parameter, ess: f64 },
    #[error("chain {chain} diverged in {divergences} of {draws} draws")]
    LowQualitySample {
        chain: u64,
        divergences: u64,
        draws: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorSummary {
    /// One entry per parameter, in canonical order.
    pub parameters: Vec<ParameterSummary>,
    pub warnings: Vec<SamplingWarning>,
    pub num_chains: usize,
    /// Posterior draws per chain
    pub num_draws: usize,
    /// Divergences after warmup, summed over chains.
    pub divergences: u64,
    pub settings: SummarySettings,
}

impl PosteriorSummary {
    pub fn get(&self, parameter: Parameter) -> &ParameterSummary {
        &self.parameters[parameter.index()]
    }

    pub fn is_reliable(&self) -> bool {
        self.warnings.is_empty()
    }
}

fn percent(prob: f64) -> f64 {
    (prob * 1000.).round() / 10.
}

impl fmt::Display for PosteriorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (lower, upper) = self.settings.interval;
        let hdi_tail = (1. - self.settings.hdi_prob) / 2.;
        writeln!(
            f,
            "{:<17}{:>10}{:>10}{:>10}{:>10}{:>10}{:>10}{:>10}{:>10}{:>9}{:>9}{:>8}",
            "parameter",
            "mean",
            "sd",
            format!("q{}%", percent(lower)),
            format!("q{}%", percent(upper)),
            format!("hdi_{}%", percent(hdi_tail)),
            format!("hdi_{}%", percent(1. - hdi_tail)),
            "mcse_mean",
            "mcse_sd",
            "ess_bulk",
            "ess_tail",
            "r_hat",
        )?;
        for summary in &self.parameters {
            let r_hat = match summary.r_hat {
                Some(r_hat) => format!("{r_hat:.3}"),
                None => "-".into(),
            };
            write!(
                f,
                "{:<17}{:>10.4}{:>10.4}{:>10.4}{:>10.4}{:>10.4}{:>10.4}",
                summary.parameter.name(),
                summary.mean,
                summary.sd,
                summary.interval.lower,
                summary.interval.upper,
                summary.hdi.lower,
                summary.hdi.upper,
            )?;
            writeln!(
                f,
                "{:>10.4}{:>10.4}{:>9.0}{:>9.0}{:>8}",
                summary.mcse_mean, summary.mcse_sd, summary.ess, summary.ess_tail, r_hat,
            )?;
        }
        write!(
            f,
            "{} chains of {} draws, {} divergences",
            self.num_chains, self.num_draws, self.divergences
        )?;
        for warning in &self.warnings {
            write!(f, "\nwarning: {warning}")?;
        }
        Ok(())
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn variance(values: &[f64], ddof: usize) -> f64 {
    let mean = mean(values);
    values.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (values.len() - ddof) as f64
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut values = values.to_vec();
    values.sort_unstable_by(f64::total_cmp);
    values
}

fn quantile_sorted(sorted: &[f64], prob: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let h = (sorted.len() - 1) as f64 * prob.clamp(0., 1.);
    let lower = h.floor() as usize;
    let upper = (lower + 1).min(sorted.len() - 1);
    sorted[lower] + (h - lower as f64) * (sorted[upper] - sorted[lower])
}

/// Empirical quantile with linear interpolation between order statistics.
pub fn quantile(values: &[f64], prob: f64) -> f64 {
    quantile_sorted(&sorted(values), prob)
}

fn hdi_sorted(sorted: &[f64], prob: f64) -> CredibleInterval {
    let n = sorted.len();
    if n == 0 {
        return CredibleInterval {
            lower: f64::NAN,
            upper: f64::NAN,
        };
    }
    let width = ((prob * n as f64).floor() as usize).min(n - 1);
    let start = (0..n - width)
        .min_by(|&a, &b| {
            (sorted[a + width] - sorted[a]).total_cmp(&(sorted[b + width] - sorted[b]))
        })
        .unwrap_or(0);
    CredibleInterval {
        lower: sorted[start],
        upper: sorted[start + width],
    }
}

/// The narrowest interval that contains a fraction `prob` of the draws.
pub fn hdi(values: &[f64], prob: f64) -> CredibleInterval {
    hdi_sorted(&sorted(values), prob)
}

fn truncated<C: AsRef<[f64]>>(chains: &[C]) -> (Vec<&[f64]>, usize) {
    let n = chains
        .iter()
        .map(|chain| chain.as_ref().len())
        .min()
        .unwrap_or(0);
    let chains = chains.iter().map(|chain| &chain.as_ref()[..n]).collect();
    (chains, n)
}

/// Potential scale reduction factor of several chains of draws.
///
/// Chains are truncated to the length of the shortest one. Identical
/// chains give exactly 1.
pub fn r_hat<C: AsRef<[f64]>>(chains: &[C]) -> Option<f64> {
    let (chains, n) = truncated(chains);
    if (chains.len() < 2) | (n < 2) {
        return None;
    }
    let means = chains.iter().map(|chain| mean(chain)).collect_vec();
    let within = mean(&chains.iter().map(|chain| variance(chain, 0)).collect_vec());
    let between_over_n = variance(&means, 1);

    if within == 0. {
        if between_over_n == 0. {
            return None;
        }
        return Some(f64::INFINITY);
    }
    Some(((within + between_over_n) / within).sqrt())
}

fn autocovariance(chain: &[f64], mean: f64, lag: usize) -> f64 {
    chain
        .iter()
        .zip(&chain[lag..])
        .map(|(a, b)| (a - mean) * (b - mean))
        .sum::<f64>()
        / chain.len() as f64
}

/// Effective sample size over several chains using Geyer's initial
/// monotone sequence estimator.
///
/// Returns NaN for chains shorter than four draws or without variance.
pub fn effective_sample_size<C: AsRef<[f64]>>(chains: &[C]) -> f64 {
    let (chains, n) = truncated(chains);
    let m = chains.len();
    if (m == 0) | (n < 4) {
        return f64::NAN;
    }
    let means = chains.iter().map(|chain| mean(chain)).collect_vec();
    let within = mean(&chains.iter().map(|chain| variance(chain, 1)).collect_vec());
    let between_over_n = if m > 1 { variance(&means, 1) } else { 0. };
    let var_plus = within * (n - 1) as f64 / n as f64 + between_over_n;
    if !(var_plus > 0.) {
        return f64::NAN;
    }

    let rho = |lag: usize| -> f64 {
        if lag == 0 {
            return 1.;
        }
        let acov = chains
            .iter()
            .zip(&means)
            .map(|(chain, &mean)| autocovariance(chain, mean, lag))
            .sum::<f64>()
            / m as f64;
        1. - (within - acov) / var_plus
    };

    let mut sum = 0f64;
    let mut previous = f64::INFINITY;
    let mut lag = 0;
    while lag + 1 < n {
        let pair = (rho(lag) + rho(lag + 1)).min(previous);
        if !(pair > 0.) {
            break;
        }
        sum += pair;
        previous = pair;
        lag += 2;
    }

    let total = (m * n) as f64;
    let tau = (2. * sum - 1.).max(1. / total.log10());
    total / tau
}

fn standard_normal_pdf(z: f64) -> f64 {
    if z.abs() >= 8. {
        return 0.;
    }
    (-0.5 * z * z).exp() / (2. * PI).sqrt()
}

/// Gaussian kernel density estimate restricted to `[lower, upper]`.
///
/// Uses Silverman's rule of thumb for the bandwidth and reflects the
/// kernels at both bounds, so no mass is lost outside the support.
pub fn kernel_density(
    values: &[f64],
    (lower, upper): (f64, f64),
    points: usize,
) -> DensityEstimate {
    if values.is_empty() {
        return DensityEstimate {
            x: vec![],
            y: vec![],
            bandwidth: f64::NAN,
        };
    }
    let sorted = sorted(values);
    let n = sorted.len();
    let sd = if n > 1 { variance(&sorted, 1).sqrt() } else { 0. };
    let iqr = (quantile_sorted(&sorted, 0.75) - quantile_sorted(&sorted, 0.25)) / 1.34;

    let mut spread = sd.min(iqr);
    if !(spread > 0.) {
        spread = sd.max(iqr);
    }
    if !(spread > 0.) {
        spread = 1e-3 * (upper - lower);
    }
    let bandwidth = 0.9 * spread * (n as f64).powf(-0.2);

    let grid_lower = lower.max(sorted[0] - 3. * bandwidth);
    let mut grid_upper = upper.min(sorted[n - 1] + 3. * bandwidth);
    if grid_upper <= grid_lower {
        grid_upper = grid_lower + bandwidth;
    }
    let points = points.max(2);
    let delta = (grid_upper - grid_lower) / (points - 1) as f64;

    let norm = 1. / (n as f64 * bandwidth);
    let x = (0..points)
        .map(|i| grid_lower + i as f64 * delta)
        .collect_vec();
    let y = x
        .iter()
        .map(|&x| {
            sorted
                .iter()
                .map(|&value| {
                    standard_normal_pdf((x - value) / bandwidth)
                        + standard_normal_pdf((x - (2. * lower - value)) / bandwidth)
                        + standard_normal_pdf((x - (2. * upper - value)) / bandwidth)
                })
                .sum::<f64>()
                * norm
        })
        .collect();

    DensityEstimate { x, y, bandwidth }
}

/// Monte Carlo standard error of the standard deviation, from the effective
/// sample size of the squared deviations.
fn mcse_sd(chains: &[Vec<f64>], mean: f64, sd: f64) -> f64 {
    let squared = chains
        .iter()
        .map(|chain| chain.iter().map(|x| (x - mean).powi(2)).collect_vec())
        .collect_vec();
    let ess = effective_sample_size(&squared);
    sd * (E * (1. - ess.recip()).powf(ess - 1.) - 1.).sqrt()
}

/// The smaller effective sample size of the indicators for the 5% and the
/// 95% quantile.
fn tail_effective_sample_size(chains: &[Vec<f64>], pooled: &[f64]) -> f64 {
    [0.05, 0.95]
        .into_iter()
        .map(|prob| {
            let cut = quantile_sorted(pooled, prob);
            let below = chains
                .iter()
                .map(|chain| chain.iter().map(|&x| f64::from(u8::from(x <= cut))).collect_vec())
                .collect_vec();
            effective_sample_size(&below)
        })
        .fold(f64::NAN, f64::min)
}

fn summarize_parameter(
    parameter: Parameter,
    chains: &[Vec<f64>],
    settings: &SummarySettings,
) -> ParameterSummary {
    let pooled = sorted(&chains.concat());
    let mean = mean(&pooled);
    let sd = if pooled.len() > 1 {
        variance(&pooled, 1).sqrt()
    } else {
        f64::NAN
    };
    let ess = effective_sample_size(chains);
    let (lower, upper) = settings.interval;

    ParameterSummary {
        parameter,
        mean,
        sd,
        interval: CredibleInterval {
            lower: quantile_sorted(&pooled, lower),
            upper: quantile_sorted(&pooled, upper),
        },
        hdi: hdi_sorted(&pooled, settings.hdi_prob),
        mcse_mean: sd / ess.sqrt(),
        mcse_sd: mcse_sd(chains, mean, sd),
        ess,
        ess_tail: tail_effective_sample_size(chains, &pooled),
        r_hat: r_hat(chains),
        density: kernel_density(&pooled, parameter.support(), settings.density_points),
    }
}

/// Summarize the posterior draws of all chains.
pub fn summarize(chains: &[Chain], settings: &SummarySettings) -> PosteriorSummary {
    let parameters = Parameter::ALL
        .iter()
        .map(|&parameter| {
            let values = chains
                .iter()
                .map(|chain| chain.values(parameter.index()))
                .collect_vec();
            summarize_parameter(parameter, &values, settings)
        })
        .collect_vec();

    let mut warnings = vec![];
    for summary in &parameters {
        match summary.r_hat {
            None => warnings.push(SamplingWarning::UndefinedRhat {
                parameter: summary.parameter,
            }),
            Some(r_hat) if !(r_hat <= settings.rhat_threshold) => {
                warnings.push(SamplingWarning::Convergence {
                    parameter: summary.parameter,
                    r_hat,
                })
            }
            Some(_) => {}
        }
        // NaN means the sample size could not be estimated at all.
        if !(summary.ess >= settings.min_ess) {
            warnings.push(SamplingWarning::LowEffectiveSampleSize {
                parameter: summary.parameter,
                ess: summary.ess,
            });
        }
    }
    for chain in chains.iter().filter(|chain| chain.low_quality) {
        warnings.push(SamplingWarning::LowQualitySample {
            chain: chain.chain_id,
            divergences: chain.divergences,
            draws: chain.len(),
        });
    }
    for warning in &warnings {
        warn!("{warning}");
    }

    PosteriorSummary {
        parameters,
        warnings,
        num_chains: chains.len(),
        num_draws: chains.iter().map(Chain::len).min().unwrap_or(0),
        divergences: chains.iter().map(|chain| chain.divergences).sum(),
        settings: *settings,
    }
}
