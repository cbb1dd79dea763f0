//! Sampling bounded parameters on the real line.
//!
//! A parameter with support `[lower, upper]` is written as
//! `lower + (upper - lower) * sigmoid(u)` for unconstrained `u`, and the
//! density in `u` includes the log Jacobian of that map.

use itertools::izip;

use crate::{
    cpu_potential::CpuLogpFunc,
    math::{sigmoid, softplus},
    model::{LogPosterior, Parameter, PosteriorError, NUM_PARAMETERS},
};

/// The space the sampler moves in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parameterization {
    /// Log-odds coordinates for every parameter. Trajectories can never leave
    /// the prior support.
    #[default]
    Unconstrained,
    /// Sample the parameters directly. Leapfrog steps that leave the support
    /// have a log density of `-inf` and are rejected as divergences.
    Constrained,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct IntervalTransform {
    lower: f64,
    upper: f64,
    width: f64,
    log_width: f64,
}

impl IntervalTransform {
    pub(crate) fn new(lower: f64, upper: f64) -> Self {
        assert!(lower < upper);
        let width = upper - lower;
        IntervalTransform {
            lower,
            upper,
            width,
            log_width: width.ln(),
        }
    }

    pub(crate) fn for_parameter(parameter: Parameter) -> Self {
        let (lower, upper) = parameter.support();
        Self::new(lower, upper)
    }

    /// Map `u` into the interval. Saturates at the bounds for large `|u|`.
    #[inline]
    pub(crate) fn constrain(&self, u: f64) -> f64 {
        self.width
            .mul_add(sigmoid(u), self.lower)
            .clamp(self.lower, self.upper)
    }

    /// The inverse of `constrain`. Infinite at the bounds.
    #[inline]
    pub(crate) fn unconstrain(&self, x: f64) -> f64 {
        let p = (x - self.lower) / self.width;
        p.ln() - (-p).ln_1p()
    }

    /// `ln |d constrain / du|`
    #[inline]
    pub(crate) fn log_jacobian(&self, u: f64) -> f64 {
        self.log_width - softplus(u) - softplus(-u)
    }

    /// Returns `d constrain / du` and `d log_jacobian / du`.
    #[inline]
    fn derivatives(&self, u: f64) -> (f64, f64) {
        let s = sigmoid(u);
        (self.width * s * (1. - s), 1. - 2. * s)
    }
}

/// The log posterior expressed in log-odds coordinates.
#[derive(Debug, Clone)]
pub struct TransformedPosterior {
    posterior: LogPosterior,
    transforms: [IntervalTransform; NUM_PARAMETERS],
    grad_theta: [f64; NUM_PARAMETERS],
}

impl TransformedPosterior {
    pub fn new(posterior: LogPosterior) -> Self {
        TransformedPosterior {
            posterior,
            transforms: Parameter::ALL.map(IntervalTransform::for_parameter),
            grad_theta: [0f64; NUM_PARAMETERS],
        }
    }

    /// Write the parameter values for unconstrained `position` into `out`.
    pub fn constrain(&self, position: &[f64], out: &mut [f64]) {
        izip!(&self.transforms, position, out).for_each(|(transform, &u, out)| {
            *out = transform.constrain(u);
        });
    }

    /// Write the unconstrained coordinates of `theta` into `out`.
    pub fn unconstrain(&self, theta: &[f64], out: &mut [f64]) {
        izip!(&self.transforms, theta, out).for_each(|(transform, &x, out)| {
            *out = transform.unconstrain(x);
        });
    }
}

impl CpuLogpFunc for TransformedPosterior {
    type Err = PosteriorError;

    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, PosteriorError> {
        assert!(position.len() == NUM_PARAMETERS);
        let mut theta = [0f64; NUM_PARAMETERS];
        self.constrain(position, &mut theta);
        let logp = self.posterior.logp_into(&theta, &mut self.grad_theta);

        let mut log_jacobian = 0f64;
        izip!(&self.transforms, position, &self.grad_theta, grad).for_each(
            |(transform, &u, &grad_theta, grad)| {
                let (dtheta, dlog_jac) = transform.derivatives(u);
                log_jacobian += transform.log_jacobian(u);
                *grad = grad_theta * dtheta + dlog_jac;
            },
        );
        Ok(logp + log_jacobian)
    }

    fn dim(&self) -> usize {
        NUM_PARAMETERS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{build_log_posterior, Observations};
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn posterior() -> TransformedPosterior {
        let observations = Observations::from_values([2.5, 30., 0.1, 0.2, 0.5]);
        TransformedPosterior::new(build_log_posterior(&observations).unwrap())
    }

    #[test]
    fn midpoint_maps_to_zero() {
        let transform = IntervalTransform::new(0.1, 10.);
        assert_relative_eq!(transform.constrain(0.), 5.05);
        assert_relative_eq!(transform.unconstrain(5.05), 0., epsilon = 1e-12);
        assert_relative_eq!(transform.log_jacobian(0.), (9.9f64 / 4.).ln());
    }

    #[test]
    fn saturates_inside_bounds() {
        let transform = IntervalTransform::new(0.01, 0.3);
        assert_relative_eq!(transform.constrain(1e3), 0.3, max_relative = 1e-12);
        assert!(transform.constrain(1e3) <= 0.3);
        assert_eq!(transform.constrain(-1e3), 0.01);
        assert!(transform.log_jacobian(1e3).is_finite());
    }

    proptest! {
        #[test]
        fn constrain_inverts_unconstrain(p in 0.001f64..0.999f64) {
            let transform = IntervalTransform::new(1., 50.);
            let x = 1. + 49. * p;
            let u = transform.unconstrain(x);
            prop_assert!((transform.constrain(u) - x).abs() < 1e-9);
        }

        #[test]
        fn transformed_gradient_matches_finite_difference(
            position in prop::array::uniform5(-4f64..4f64),
            index in 0usize..NUM_PARAMETERS,
        ) {
            let mut density = posterior();
            let mut grad = [0f64; NUM_PARAMETERS];
            let mut scratch = [0f64; NUM_PARAMETERS];
            density.logp(&position, &mut grad).unwrap();

            let h = 1e-6;
            let mut plus = position;
            plus[index] += h;
            let mut minus = position;
            minus[index] -= h;
            let numeric = (density.logp(&plus, &mut scratch).unwrap()
                - density.logp(&minus, &mut scratch).unwrap())
                / (2. * h);
            prop_assert!((numeric - grad[index]).abs() <= 1e-4 * (1. + grad[index].abs()));
        }
    }
}
