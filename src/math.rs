use itertools::izip;
use multiversion::multiversion;

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

/// `ln(1 + exp(x))` without overflow for large `x`.
#[inline]
pub(crate) fn softplus(x: f64) -> f64 {
    if x > 0. {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

#[inline]
pub(crate) fn sigmoid(x: f64) -> f64 {
    if x >= 0. {
        1. / (1. + (-x).exp())
    } else {
        let e = x.exp();
        e / (1. + e)
    }
}

/// Returns `((a + b) . x, (a + b) . y)`.
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn scalar_prods2(
    positive1: &[f64],
    positive2: &[f64],
    x: &[f64],
    y: &[f64],
) -> (f64, f64) {
    let n = positive1.len();

    assert!(positive2.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);

    izip!(positive1, positive2, x, y).fold((0., 0.), |(s1, s2), (a, b, x, y)| {
        (s1 + x * (a + b), s2 + y * (a + b))
    })
}

/// Returns `((a - b + c) . x, (a - b + c) . y)`.
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn scalar_prods3(
    positive1: &[f64],
    negative1: &[f64],
    positive2: &[f64],
    x: &[f64],
    y: &[f64],
) -> (f64, f64) {
    let n = positive1.len();

    assert!(negative1.len() == n);
    assert!(positive2.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);

    izip!(positive1, negative1, positive2, x, y).fold(
        (0., 0.),
        |(s1, s2), (a, b, c, x, y)| {
            let sum = a - b + c;
            (s1 + x * sum, s2 + y * sum)
        },
    )
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn multiply(x: &[f64], y: &[f64], out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(out, x, y).for_each(|(out, &x, &y)| {
        *out = x * y;
    });
}

/// `out = a * x + y`
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn axpy_out(x: &[f64], y: &[f64], a: f64, out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(x, y, out).for_each(|(&x, &y, out)| {
        *out = a.mul_add(x, y);
    });
}

/// `y += a * x`
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    let n = x.len();
    assert!(y.len() == n);

    x.iter().zip(y).for_each(|(&x, y)| {
        *y = a.mul_add(x, *y);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn check_logaddexp() {
        let x = 10f64;
        let y = 12f64;
        assert_relative_eq!(
            logaddexp(x, y),
            (x.exp() + y.exp()).ln(),
            max_relative = 1e-12
        );
        assert_eq!(logaddexp(f64::NEG_INFINITY, 1.), 1.);
        assert!(logaddexp(f64::NAN, 1.).is_nan());
    }

    #[test]
    fn check_softplus_large_inputs() {
        assert_eq!(softplus(800.), 800.);
        assert_eq!(softplus(-800.), 0.);
        assert_relative_eq!(softplus(0.), 2f64.ln());
    }

    #[test]
    fn check_sigmoid_saturates() {
        assert_eq!(sigmoid(800.), 1.);
        assert_eq!(sigmoid(-800.), 0.);
        assert_relative_eq!(sigmoid(0.), 0.5);
    }

    proptest! {
        #[test]
        fn check_scalar_prods2(
            (a, b, x, y) in (1usize..20).prop_flat_map(|n| (
                prop::collection::vec(-100f64..100f64, n),
                prop::collection::vec(-100f64..100f64, n),
                prop::collection::vec(-100f64..100f64, n),
                prop::collection::vec(-100f64..100f64, n),
            ))
        ) {
            let (s1, s2) = scalar_prods2(&a, &b, &x, &y);
            let sum: Vec<f64> = a.iter().zip(&b).map(|(a, b)| a + b).collect();
            prop_assert!((s1 - vector_dot(&sum, &x)).abs() < 1e-8);
            prop_assert!((s2 - vector_dot(&sum, &y)).abs() < 1e-8);
        }

        #[test]
        fn check_scalar_prods3(
            (a, b, c, x) in (1usize..20).prop_flat_map(|n| (
                prop::collection::vec(-100f64..100f64, n),
                prop::collection::vec(-100f64..100f64, n),
                prop::collection::vec(-100f64..100f64, n),
                prop::collection::vec(-100f64..100f64, n),
            ))
        ) {
            let (s1, s2) = scalar_prods3(&a, &b, &c, &x, &x);
            let sum: Vec<f64> = izip!(&a, &b, &c).map(|(a, b, c)| a - b + c).collect();
            prop_assert!((s1 - vector_dot(&sum, &x)).abs() < 1e-8);
            prop_assert_eq!(s1, s2);
        }
    }

    #[test]
    fn check_axpy() {
        let x = [1., 2., 3.];
        let mut y = [1., 1., 1.];
        axpy(&x, &mut y, 2.);
        assert_eq!(y, [3., 5., 7.]);

        let mut out = [0.; 3];
        axpy_out(&x, &y, -1., &mut out);
        assert_eq!(out, [2., 3., 4.]);

        multiply(&x, &y, &mut out);
        assert_eq!(out, [3., 10., 21.]);
    }
}
