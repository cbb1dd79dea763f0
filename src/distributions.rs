//! Scalar densities used as priors and likelihoods.
//!
//! Everything here works on the log scale. Derivatives are returned alongside
//! the log density so that gradient based samplers do not need a second pass.

use std::f64::consts::PI;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DistributionError {
    #[error("invalid uniform bounds [{lower}, {upper}]")]
    InvalidBounds { lower: f64, upper: f64 },
    #[error("invalid standard deviation {0}, must be finite and positive")]
    InvalidSigma(f64),
}

/// A univariate log density with its derivative.
pub trait LogDensity {
    /// Log density at `x`. Returns `-inf` where the density is zero.
    fn logp(&self, x: f64) -> f64;

    /// Derivative of the log density with respect to `x`.
    ///
    /// Outside of the support this is defined as zero; callers must check
    /// the log density to decide whether a point is acceptable.
    fn dlogp(&self, x: f64) -> f64;

    fn logp_and_grad(&self, x: f64) -> (f64, f64) {
        (self.logp(x), self.dlogp(x))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Uniform {
    lower: f64,
    upper: f64,
    log_width: f64,
}

impl Uniform {
    pub fn new(lower: f64, upper: f64) -> Result<Self, DistributionError> {
        if !(lower.is_finite() & upper.is_finite()) | (lower >= upper) {
            return Err(DistributionError::InvalidBounds { lower, upper });
        }
        Ok(Uniform {
            lower,
            upper,
            log_width: (upper - lower).ln(),
        })
    }

    /// Whether `x` lies in the closed interval `[lower, upper]`.
    #[inline]
    pub fn contains(&self, x: f64) -> bool {
        (x >= self.lower) & (x <= self.upper)
    }
}

impl LogDensity for Uniform {
    #[inline]
    fn logp(&self, x: f64) -> f64 {
        if self.contains(x) {
            -self.log_width
        } else {
            f64::NEG_INFINITY
        }
    }

    #[inline]
    fn dlogp(&self, _x: f64) -> f64 {
        0.
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normal {
    mu: f64,
    sigma: f64,
    log_norm: f64,
}

impl Normal {
    pub fn new(mu: f64, sigma: f64) -> Result<Self, DistributionError> {
        if !sigma.is_finite() | (sigma <= 0.) {
            return Err(DistributionError::InvalidSigma(sigma));
        }
        Ok(Normal {
            mu,
            sigma,
            log_norm: -sigma.ln() - 0.5 * (2. * PI).ln(),
        })
    }
}

impl LogDensity for Normal {
    #[inline]
    fn logp(&self, x: f64) -> f64 {
        let z = (x - self.mu) / self.sigma;
        self.log_norm - 0.5 * z * z
    }

    #[inline]
    fn dlogp(&self, x: f64) -> f64 {
        -(x - self.mu) / (self.sigma * self.sigma)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn uniform_inside_and_outside() {
        let dist = Uniform::new(0.1, 10.).unwrap();
        assert_relative_eq!(dist.logp(5.), -(9.9f64).ln());
        assert_relative_eq!(dist.logp(0.1), -(9.9f64).ln());
        assert_relative_eq!(dist.logp(10.), -(9.9f64).ln());
        assert_eq!(dist.logp(10.0001), f64::NEG_INFINITY);
        assert_eq!(dist.logp(-1.), f64::NEG_INFINITY);
        assert_eq!(dist.logp(f64::NAN), f64::NEG_INFINITY);
        assert_eq!(dist.dlogp(20.), 0.);
    }

    #[test]
    fn invalid_parameters() {
        assert!(Uniform::new(1., 1.).is_err());
        assert!(Uniform::new(2., 1.).is_err());
        assert!(Uniform::new(f64::NEG_INFINITY, 1.).is_err());
        assert_eq!(
            Normal::new(0., 0.).unwrap_err(),
            DistributionError::InvalidSigma(0.)
        );
        assert!(Normal::new(0., f64::NAN).is_err());
    }

    #[test]
    fn normal_standard_values() {
        let dist = Normal::new(0., 1.).unwrap();
        assert_relative_eq!(dist.logp(0.), -0.5 * (2. * PI).ln(), max_relative = 1e-14);
        let dist = Normal::new(2.5, 5.).unwrap();
        let expected = -0.5 * (0.5f64).powi(2) - 5f64.ln() - 0.5 * (2. * PI).ln();
        assert_relative_eq!(dist.logp(5.), expected, max_relative = 1e-14);
        assert_relative_eq!(dist.dlogp(5.), -0.1);
    }

    proptest! {
        #[test]
        fn normal_gradient_matches_finite_difference(
            mu in -10f64..10f64,
            sigma in 0.05f64..5f64,
            x in -10f64..10f64,
        ) {
            let dist = Normal::new(mu, sigma).unwrap();
            let h = 1e-6;
            let numeric = (dist.logp(x + h) - dist.logp(x - h)) / (2. * h);
            let (_, grad) = dist.logp_and_grad(x);
            prop_assert!((numeric - grad).abs() <= 1e-4 * (1. + grad.abs()));
        }
    }
}
