//! Azimuthal recurrence: `c_m + i s_m = (x + i y)^m` and the `2(m+1) z` terms.

use super::{RowRef, RowView};
use crate::scalar::SphScalar;

/// Per-row `c`, `s` and `twomz` accumulators of length `l_max + 1`.
#[derive(Debug, Clone)]
pub struct AzimuthalBuffers<T> {
    c: Vec<T>,
    s: Vec<T>,
    twomz: Vec<T>,
    rows: usize,
    l_max: usize,
}

/// Read-only view of one row's azimuthal terms.
pub struct AzimuthalRow<'a, T> {
    pub c: RowRef<'a, T>,
    pub s: RowRef<'a, T>,
    pub twomz: RowRef<'a, T>,
}

impl<T: SphScalar> AzimuthalBuffers<T> {
    pub fn new(l_max: usize, rows: usize) -> Self {
        let len = (l_max + 1) * rows;
        Self {
            c: vec![T::zero(); len],
            s: vec![T::zero(); len],
            twomz: vec![T::zero(); len],
            rows,
            l_max,
        }
    }

    /// Run the recurrence for `row` at `point`.
    ///
    /// `c_0 = 1`, `s_0 = 0`, `c_m = c_{m-1} x - s_{m-1} y`,
    /// `s_m = c_{m-1} y + s_{m-1} x`, `twomz_m = 2(m+1) z`.
    pub fn fill_row(&mut self, row: usize, point: [T; 3]) {
        let [x, y, z] = point;
        let two_z = z + z;

        let mut c = RowView::new(&mut self.c, self.rows, row);
        let mut s = RowView::new(&mut self.s, self.rows, row);
        let mut twomz = RowView::new(&mut self.twomz, self.rows, row);

        c.set(0, T::one());
        s.set(0, T::zero());
        twomz.set(0, two_z);
        for m in 1..=self.l_max {
            let (c_prev, s_prev) = (c.get(m - 1), s.get(m - 1));
            c.set(m, c_prev * x - s_prev * y);
            s.set(m, c_prev * y + s_prev * x);
            twomz.set(m, twomz.get(m - 1) + two_z);
        }
    }

    pub fn row(&self, row: usize) -> AzimuthalRow<'_, T> {
        AzimuthalRow {
            c: RowRef::new(&self.c, self.rows, row),
            s: RowRef::new(&self.s, self.rows, row),
            twomz: RowRef::new(&self.twomz, self.rows, row),
        }
    }
}
