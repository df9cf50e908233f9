//! Closed forms for the lowest degrees.

use super::{DegreeSlots, Term};
use crate::scalar::SphScalar;
use crate::types::EvalFlags;

/// Highest degree evaluated from a closed form instead of the recurrence.
pub const HARDCODED_LMAX: usize = 1;

/// `Y_0^0 = 1 / (2 sqrt(π))`.
pub const Y00: f64 = 0.28209479177387814;

/// `sqrt(3 / (4π))`, the degree-1 scale.
pub const Y1: f64 = 0.4886025119029199;

/// How a single degree is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegreeKernel {
    /// Constant value, zero derivatives.
    Degree0,
    /// `Y1 · (y, z, x)`: constant gradient, zero Hessian.
    Degree1,
    /// Downward `m` recurrence over `Q_l`, `Q_{l-1}` and `Q_{l-2}`.
    Generic(usize),
}

impl DegreeKernel {
    pub fn for_degree(l: usize) -> Self {
        match l {
            0 => Self::Degree0,
            1 => Self::Degree1,
            l => Self::Generic(l),
        }
    }
}

pub(super) fn degree0<T: SphScalar>(flags: EvalFlags, out: &mut DegreeSlots<'_, T>) {
    out.write(0, &Term::constant(T::cast_f64(Y00)), flags);
}

pub(super) fn degree1<T: SphScalar>(point: [T; 3], flags: EvalFlags, out: &mut DegreeSlots<'_, T>) {
    let scale = T::cast_f64(Y1);
    // Local order m = -1, 0, 1 reads y, z, x.
    for (local, axis) in [1usize, 2, 0].into_iter().enumerate() {
        let mut term = Term::constant(scale * point[axis]);
        term.g[axis] = scale;
        out.write(local, &term, flags);
    }
}
