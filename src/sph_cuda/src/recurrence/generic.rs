//! Generic degree sweep for `l > HARDCODED_LMAX`.
//!
//! For a fixed `l` the orders are visited from `m = l` down to `m = 0`,
//! carrying `Q^{m+1}` and `Q^{m+2}` for degrees `l`, `l-1` and `l-2`:
//!
//! ```text
//! Q_d^d = qlmk[d][d]
//! Q_d^m = qlmk[d][m] · (2(m+1) z · Q_d^{m+1} + (x² + y²) · Q_d^{m+2})   m < d
//! Q_d^m = 0                                                           m > d
//! ```
//!
//! Derivatives of the polynomial part follow from
//! `∂x Q_l^m = x Q_{l-1}^{m+1}`, `∂y Q_l^m = y Q_{l-1}^{m+1}` and
//! `∂z Q_l^m = (l+m) Q_{l-1}^m`; the second derivatives apply the same
//! identities once more through `Q_{l-2}`.

use super::azimuthal::AzimuthalRow;
use super::hardcoded::HARDCODED_LMAX;
use super::{DegreeSlots, Term};
use crate::prefactors::PrefactorTable;
use crate::scalar::SphScalar;
use crate::types::EvalFlags;

/// One step of the downward `m` recurrence for degree `d`.
#[inline]
fn q_step<T: SphScalar>(qlmk: &[T], d: usize, m: usize, twomz: T, rxy: T, q1: T, q2: T) -> T {
    if m > d {
        T::zero()
    } else if m == d {
        qlmk[d]
    } else {
        qlmk[m] * (twomz * q1 + rxy * q2)
    }
}

/// `Q_l^m(z, x² + y²)` and its derivatives.
#[allow(clippy::too_many_arguments)]
fn polynomial<T: SphScalar>(point: [T; 3], k: T, q: T, p0: T, p1: T, r0: T, r1: T, r2: T) -> Term<T> {
    let [x, y, _] = point;
    Term {
        v: q,
        g: [x * p1, y * p1, k * p0],
        h: [
            p1 + x * x * r2,
            x * y * r2,
            x * k * r1,
            p1 + y * y * r2,
            y * k * r1,
            k * (k - T::one()) * r0,
        ],
    }
}

/// `c_m` (cosine) or `s_m` (sine) and their x/y derivatives.
fn azimuthal<T: SphScalar>(az: &AzimuthalRow<'_, T>, m: usize, sine: bool) -> Term<T> {
    let zero = T::zero();
    let mut term = Term::constant(if sine { az.s.get(m) } else { az.c.get(m) });
    if m >= 1 {
        let fm = T::cast_usize(m);
        let (c1, s1) = (az.c.get(m - 1), az.s.get(m - 1));
        term.g = if sine {
            [fm * s1, fm * c1, zero]
        } else {
            [fm * c1, -(fm * s1), zero]
        };
    }
    if m >= 2 {
        let fmm = T::cast_usize(m * (m - 1));
        let (c2, s2) = (az.c.get(m - 2), az.s.get(m - 2));
        term.h = if sine {
            [fmm * s2, fmm * c2, zero, -(fmm * s2), zero, zero]
        } else {
            [fmm * c2, -(fmm * s2), zero, -(fmm * c2), zero, zero]
        };
    }
    term
}

/// Evaluate degree `l` into `out` (local index `l + m`).
pub(super) fn generic_degree<T: SphScalar>(
    l: usize,
    point: [T; 3],
    az: &AzimuthalRow<'_, T>,
    table: &PrefactorTable<T>,
    flags: EvalFlags,
    out: &mut DegreeSlots<'_, T>,
) {
    debug_assert!(l > HARDCODED_LMAX);

    let [x, y, _] = point;
    let rxy = x * x + y * y;
    let pk = table.pk(l);
    let (q_l, q_l1, q_l2) = (table.qlmk(l), table.qlmk(l - 1), table.qlmk(l - 2));

    let zero = T::zero();
    let (mut q1, mut q2) = (zero, zero);
    let (mut p1, mut p2) = (zero, zero);
    let (mut r1, mut r2) = (zero, zero);

    for m in (0..=l).rev() {
        let twomz = az.twomz.get(m);
        let q = q_step(q_l, l, m, twomz, rxy, q1, q2);
        let p0 = q_step(q_l1, l - 1, m, twomz, rxy, p1, p2);
        let r0 = q_step(q_l2, l - 2, m, twomz, rxy, r1, r2);

        let poly = polynomial(point, T::cast_usize(l + m), q, p0, p1, r0, r1, r2);
        if m == 0 {
            out.write(l, &poly.scaled(pk[0]), flags);
        } else {
            let cos = poly.product(&azimuthal(az, m, false));
            let sin = poly.product(&azimuthal(az, m, true));
            out.write(l + m, &cos.scaled(pk[m]), flags);
            out.write(l - m, &sin.scaled(pk[m]), flags);
        }

        q2 = q1;
        q1 = q;
        p2 = p1;
        p1 = p0;
        r2 = r1;
        r1 = r0;
    }
}

#[cfg(test)]
mod tests {
    use super::super::azimuthal::AzimuthalBuffers;
    use super::super::DegreeBuffers;
    use super::*;
    use approx::assert_relative_eq;

    fn degree_values(l: usize, point: [f64; 3]) -> Vec<f64> {
        let table = PrefactorTable::<f64>::new(l);
        let mut az = AzimuthalBuffers::new(l, 1);
        az.fill_row(0, point);
        let mut buffers = DegreeBuffers::new(l, 1);
        buffers.clear(l);
        generic_degree(l, point, &az.row(0), &table, EvalFlags::values(false), &mut buffers.slots(0));
        (0..2 * l + 1).map(|k| buffers.value(0, k)).collect()
    }

    #[test]
    fn test_degree2_closed_forms() {
        let (x, y, z) = (0.3, -0.4, 0.5);
        let values = degree_values(2, [x, y, z]);

        let c = 1.0925484305920792;
        assert_relative_eq!(values[0], c * x * y, epsilon = 1e-14);
        assert_relative_eq!(values[1], c * y * z, epsilon = 1e-14);
        assert_relative_eq!(
            values[2],
            0.31539156525252005 * (2.0 * z * z - x * x - y * y),
            epsilon = 1e-14
        );
        assert_relative_eq!(values[3], c * x * z, epsilon = 1e-14);
        assert_relative_eq!(values[4], 0.5462742152960396 * (x * x - y * y), epsilon = 1e-14);
    }

    #[test]
    fn test_degree3_zonal() {
        let (x, y, z) = (0.1, 0.2, 0.7);
        let values = degree_values(3, [x, y, z]);
        let r2 = x * x + y * y + z * z;
        // Y_3^0 = sqrt(7/(16π)) z (5z² - 3r²)
        let expected = (7.0 / (16.0 * std::f64::consts::PI)).sqrt() * z * (5.0 * z * z - 3.0 * r2);
        assert_relative_eq!(values[3], expected, epsilon = 1e-14);
    }
}
