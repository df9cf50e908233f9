//! Chain rule from solid harmonics to harmonics of the normalized direction.
//!
//! With normalization the recurrence runs on `u = v / r` and produces
//! derivatives `f_a`, `f_ab` with respect to `u`. The derivatives of
//! `g(v) = f(v / |v|)` are
//!
//! ```text
//! g_a  = (f_a - u_a t) / r
//! g_ab = (f_ab - u_b T_a - u_a T_b + 3 u_a u_b t - δ_ab t
//!         - u_a f_b - u_b f_a + u_a u_b t2) / r²
//! ```
//!
//! with `t = Σ u_i f_i`, `T_a = Σ_i u_i f_ia` and `t2 = Σ u_i u_j f_ij`.
//!
//! A zero-length input uses `u = 0` and `1/r = 0`, so only `Y_0^0` is
//! non-zero and every derivative vanishes.

use crate::scalar::SphScalar;
use crate::types::EvalFlags;

/// Per-sample change of variables, or the identity when normalization is off.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainRule<T> {
    u: [T; 3],
    inv_r: T,
    enabled: bool,
}

impl<T: SphScalar> ChainRule<T> {
    pub fn identity() -> Self {
        Self {
            u: [T::zero(); 3],
            inv_r: T::one(),
            enabled: false,
        }
    }

    /// Coordinates to feed the recurrence, and the matching chain rule.
    pub fn prepare(point: [T; 3], normalize: bool) -> ([T; 3], Self) {
        if !normalize {
            return (point, Self::identity());
        }
        let [x, y, z] = point;
        let r2 = x * x + y * y + z * z;
        let inv_r = if r2 > T::zero() {
            T::one() / r2.sqrt()
        } else {
            T::zero()
        };
        let u = point.map(|c| c * inv_r);
        (
            u,
            Self {
                u,
                inv_r,
                enabled: true,
            },
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn gradient(&self, grad: [T; 3]) -> [T; 3] {
        if !self.enabled {
            return grad;
        }
        let u = self.u;
        let t = u[0] * grad[0] + u[1] * grad[1] + u[2] * grad[2];
        std::array::from_fn(|a| (grad[a] - u[a] * t) * self.inv_r)
    }

    /// Transform a symmetric Hessian; the result is symmetric bit-for-bit.
    pub fn hessian(&self, grad: [T; 3], hess: [[T; 3]; 3]) -> [[T; 3]; 3] {
        if !self.enabled {
            return hess;
        }
        let u = self.u;
        let ir2 = self.inv_r * self.inv_r;
        let three = T::cast_f64(3.0);

        let t = u[0] * grad[0] + u[1] * grad[1] + u[2] * grad[2];
        let tv: [T; 3] =
            std::array::from_fn(|a| u[0] * hess[0][a] + u[1] * hess[1][a] + u[2] * hess[2][a]);
        let t2 = u[0] * tv[0] + u[1] * tv[1] + u[2] * tv[2];

        let mut out = [[T::zero(); 3]; 3];
        for a in 0..3 {
            for b in a..3 {
                let mut value = hess[a][b] - u[b] * tv[a] - u[a] * tv[b]
                    + three * u[a] * u[b] * t
                    - u[a] * grad[b]
                    - u[b] * grad[a]
                    + u[a] * u[b] * t2;
                if a == b {
                    value -= t;
                }
                out[a][b] = value * ir2;
                out[b][a] = out[a][b];
            }
        }
        out
    }

    /// Apply whichever transforms `flags` asks for.
    pub fn apply(
        &self,
        grad: [T; 3],
        hess: [[T; 3]; 3],
        flags: EvalFlags,
    ) -> ([T; 3], [[T; 3]; 3]) {
        if !self.is_enabled() {
            return (grad, hess);
        }
        let hess = if flags.hessian() {
            self.hessian(grad, hess)
        } else {
            hess
        };
        let grad = if flags.grad() {
            self.gradient(grad)
        } else {
            grad
        };
        (grad, hess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// f(u) = u_x u_z, so g(v) = x z / r².
    fn raw(u: [f64; 3]) -> ([f64; 3], [[f64; 3]; 3]) {
        (
            [u[2], 0.0, u[0]],
            [[0.0, 0.0, 1.0], [0.0, 0.0, 0.0], [1.0, 0.0, 0.0]],
        )
    }

    fn g(v: [f64; 3]) -> f64 {
        v[0] * v[2] / (v[0] * v[0] + v[1] * v[1] + v[2] * v[2])
    }

    #[test]
    fn test_matches_finite_differences() {
        let v = [0.7, -1.1, 0.4];
        let (u, chain) = ChainRule::prepare(v, true);
        let (f_grad, f_hess) = raw(u);
        let grad = chain.gradient(f_grad);
        let hess = chain.hessian(f_grad, f_hess);

        let h = 1e-4;
        for a in 0..3 {
            let mut vp = v;
            let mut vm = v;
            vp[a] += h;
            vm[a] -= h;
            assert_relative_eq!(grad[a], (g(vp) - g(vm)) / (2.0 * h), epsilon = 1e-7);

            for b in 0..3 {
                let shifted = |da: f64, db: f64| {
                    let mut w = v;
                    w[a] += da;
                    w[b] += db;
                    g(w)
                };
                let fd = (shifted(h, h) - shifted(h, -h) - shifted(-h, h) + shifted(-h, -h))
                    / (4.0 * h * h);
                assert_relative_eq!(hess[a][b], fd, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_zero_vector_is_finite() {
        let (u, chain) = ChainRule::prepare([0.0f32; 3], true);
        assert_eq!(u, [0.0; 3]);
        let grad = chain.gradient([1.0, 2.0, 3.0]);
        assert_eq!(grad, [0.0; 3]);
        let hess = chain.hessian([1.0, 2.0, 3.0], [[1.0; 3]; 3]);
        assert!(hess.iter().flatten().all(|h| *h == 0.0));
    }

    #[test]
    fn test_identity_when_disabled() {
        let point = [3.0, 4.0, 12.0];
        let (coords, chain) = ChainRule::prepare(point, false);
        assert_eq!(coords, point);
        assert!(!chain.is_enabled());
        assert_eq!(chain.gradient([1.0, 2.0, 3.0]), [1.0, 2.0, 3.0]);
    }
}
