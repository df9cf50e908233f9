//! Test utilities: deterministic sample generators and numerical references.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, UnitSphere};

use crate::scalar::SphScalar;

/// Print only when the `test-verbose` feature is enabled.
#[macro_export]
macro_rules! test_println {
    ($($arg:tt)*) => {
        if cfg!(feature = "test-verbose") {
            println!($($arg)*);
        }
    };
}

/// Random directions scaled to radii in `[0.5, 1.5)`.
///
/// Keeps samples away from the origin so normalized finite differences
/// stay well conditioned.
pub fn random_points<T: SphScalar>(n: usize, seed: u64) -> Vec<[T; 3]> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let dir: [f64; 3] = UnitSphere.sample(&mut rng);
            let radius = rng.gen_range(0.5..1.5);
            dir.map(|c| T::cast_f64(c * radius))
        })
        .collect()
}

/// Uniform values in `[-1, 1)`, e.g. upstream gradients.
pub fn random_values<T: SphScalar>(n: usize, seed: u64) -> Vec<T> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| T::cast_f64(rng.gen_range(-1.0..1.0)))
        .collect()
}

/// Unit vectors on a Fibonacci lattice.
pub fn sphere_points<T: SphScalar>(n: usize) -> Vec<[T; 3]> {
    let golden = std::f64::consts::PI * (3.0 - 5.0f64.sqrt());
    (0..n)
        .map(|i| {
            let z = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let rho = (1.0 - z * z).sqrt();
            let phi = golden * i as f64;
            [rho * phi.cos(), rho * phi.sin(), z].map(T::cast_f64)
        })
        .collect()
}

/// Legendre polynomial `P_l(t)` by Bonnet's recurrence.
pub fn legendre(l: usize, t: f64) -> f64 {
    let (mut p0, mut p1) = (1.0, t);
    if l == 0 {
        return p0;
    }
    for k in 1..l {
        let p2 = ((2 * k + 1) as f64 * t * p1 - k as f64 * p0) / (k + 1) as f64;
        p0 = p1;
        p1 = p2;
    }
    p1
}

/// Centered difference of a vector-valued `f` along `axis`.
pub fn central_difference<F>(f: F, point: [f64; 3], axis: usize, h: f64) -> Vec<f64>
where
    F: Fn([f64; 3]) -> Vec<f64>,
{
    let mut plus = point;
    let mut minus = point;
    plus[axis] += h;
    minus[axis] -= h;
    f(plus)
        .iter()
        .zip(f(minus))
        .map(|(p, m)| (p - m) / (2.0 * h))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_points_deterministic() {
        let a = random_points::<f64>(8, 42);
        let b = random_points::<f64>(8, 42);
        assert_eq!(a, b);
        for p in &a {
            let r = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
            assert!((0.5..1.5).contains(&r), "radius {r}");
        }
    }

    #[test]
    fn test_sphere_points_unit() {
        for p in sphere_points::<f64>(25) {
            let r2 = p[0] * p[0] + p[1] * p[1] + p[2] * p[2];
            assert!((r2 - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_legendre() {
        assert_eq!(legendre(0, 0.3), 1.0);
        assert_eq!(legendre(1, 0.3), 0.3);
        assert!((legendre(2, 0.3) - 0.5 * (3.0 * 0.09 - 1.0)).abs() < 1e-15);
        assert!((legendre(5, 1.0) - 1.0).abs() < 1e-15);
    }
}
