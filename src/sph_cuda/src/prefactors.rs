//! Prefactor table for the degree recurrence.
//!
//! The table is one flat array of `(L+1)(L+2)` scalars split in two halves:
//!
//! ```text
//! [ pk_0 | pk_1 | ... | pk_L | qlmk_0 | qlmk_1 | ... | qlmk_L ]
//! ```
//!
//! Degree `l` owns `l + 1` entries in each half, at offset `l(l+1)/2`.
//!
//! - `pk[l][m] = (-1)^m sqrt((2l+1)/(2π) · (l-m)!/(l+m)!)`, with an extra
//!   `1/sqrt(2)` on `m = 0`. These turn the `Q` polynomials into
//!   orthonormal real harmonics.
//! - `qlmk[l][m] = -1/((l+m+1)(l-m))` for `m < l`, and
//!   `qlmk[l][l] = Q_l^l = -(2l-1) Q_{l-1}^{l-1}` with `Q_0^0 = 1`.

use std::f64::consts::PI;

use crate::scalar::SphScalar;

/// Number of entries in each half of the table.
#[inline]
pub const fn half_len(l_max: usize) -> usize {
    (l_max + 1) * (l_max + 2) / 2
}

/// Offset of degree `l` within one half.
#[inline]
pub const fn degree_offset(l: usize) -> usize {
    l * (l + 1) / 2
}

/// Compute the table in `f64`.
pub fn compute_prefactors(l_max: usize) -> Vec<f64> {
    let size_q = half_len(l_max);
    let mut table = vec![0.0f64; 2 * size_q];

    let mut q_ll = 1.0f64;
    for l in 0..=l_max {
        let k = degree_offset(l);

        let mut factor = (2 * l + 1) as f64 / (2.0 * PI);
        table[k] = factor.sqrt() * std::f64::consts::FRAC_1_SQRT_2;
        for m in 1..=l {
            factor /= ((l + m) * (l + 1 - m)) as f64;
            let sign = if m % 2 == 0 { 1.0 } else { -1.0 };
            table[k + m] = sign * factor.sqrt();
        }

        if l > 0 {
            q_ll *= -((2 * l - 1) as f64);
        }
        table[size_q + k + l] = q_ll;
        for m in 0..l {
            table[size_q + k + m] = -1.0 / ((l + m + 1) * (l - m)) as f64;
        }
    }

    table
}

/// Read-only prefactor table in evaluation precision.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefactorTable<T> {
    l_max: usize,
    values: Vec<T>,
}

impl<T: SphScalar> PrefactorTable<T> {
    /// Build the table for degrees `0..=l_max`.
    pub fn new(l_max: usize) -> Self {
        let values = compute_prefactors(l_max)
            .into_iter()
            .map(T::cast_f64)
            .collect();
        Self { l_max, values }
    }
}

impl<T> PrefactorTable<T> {
    pub fn l_max(&self) -> usize {
        self.l_max
    }

    /// The flat table, as uploaded to the device.
    pub fn as_slice(&self) -> &[T] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Normalization factors `pk[l][0..=l]`.
    #[inline]
    pub fn pk(&self, l: usize) -> &[T] {
        let k = degree_offset(l);
        &self.values[k..k + l + 1]
    }

    /// Recurrence coefficients `qlmk[l][0..=l]` (the last entry is `Q_l^l`).
    #[inline]
    pub fn qlmk(&self, l: usize) -> &[T] {
        let k = half_len(self.l_max) + degree_offset(l);
        &self.values[k..k + l + 1]
    }
}
