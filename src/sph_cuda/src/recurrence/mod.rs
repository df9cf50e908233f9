//! Host recurrence engine.
//!
//! Evaluates the solid harmonics of one degree at a time for one sample
//! row. The building blocks here are shared by the tiled host backend
//! ([`crate::scratch`], [`crate::dispatch`]) and by the direct per-sample
//! evaluator [`evaluate_sample`], which is the reference the tiled paths
//! are checked against.
//!
//! Scratch buffers hold several rows interleaved: slot `i` of row `row`
//! lives at `i * rows + row`, the layout the device kernel uses for its
//! shared memory.

pub mod azimuthal;
mod generic;
pub mod hardcoded;

pub use azimuthal::{AzimuthalBuffers, AzimuthalRow};
pub use hardcoded::{DegreeKernel, HARDCODED_LMAX};

use crate::normalize::ChainRule;
use crate::prefactors::PrefactorTable;
use crate::scalar::SphScalar;
use crate::types::{EvalFlags, SampleSlices, HESSIAN_PAIRS, HESSIAN_SLOT};

/// Mutable strided view of one row in an interleaved buffer.
pub struct RowView<'a, T> {
    data: &'a mut [T],
    rows: usize,
    row: usize,
}

impl<'a, T: Copy> RowView<'a, T> {
    #[inline]
    pub fn new(data: &'a mut [T], rows: usize, row: usize) -> Self {
        debug_assert!(row < rows);
        Self { data, rows, row }
    }

    #[inline]
    pub fn get(&self, i: usize) -> T {
        self.data[i * self.rows + self.row]
    }

    #[inline]
    pub fn set(&mut self, i: usize, value: T) {
        self.data[i * self.rows + self.row] = value;
    }
}

/// Read-only strided view of one row in an interleaved buffer.
pub struct RowRef<'a, T> {
    data: &'a [T],
    rows: usize,
    row: usize,
}

impl<'a, T: Copy> RowRef<'a, T> {
    #[inline]
    pub fn new(data: &'a [T], rows: usize, row: usize) -> Self {
        debug_assert!(row < rows);
        Self { data, rows, row }
    }

    #[inline]
    pub fn get(&self, i: usize) -> T {
        self.data[i * self.rows + self.row]
    }
}

/// A value with its gradient and the unique Hessian entries (see [`HESSIAN_PAIRS`]).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Term<T> {
    pub v: T,
    pub g: [T; 3],
    pub h: [T; 6],
}

impl<T: SphScalar> Term<T> {
    /// A value whose derivatives are all zero.
    pub fn constant(v: T) -> Self {
        Self {
            v,
            g: [T::zero(); 3],
            h: [T::zero(); 6],
        }
    }

    pub fn scaled(&self, factor: T) -> Self {
        Self {
            v: factor * self.v,
            g: self.g.map(|g| factor * g),
            h: self.h.map(|h| factor * h),
        }
    }

    /// Product rule up to second order.
    pub fn product(&self, other: &Self) -> Self {
        let mut out = Self::constant(self.v * other.v);
        for a in 0..3 {
            out.g[a] = self.g[a] * other.v + self.v * other.g[a];
        }
        for (slot, &(a, b)) in HESSIAN_PAIRS.iter().enumerate() {
            out.h[slot] = self.h[slot] * other.v
                + self.g[a] * other.g[b]
                + self.g[b] * other.g[a]
                + self.v * other.h[slot];
        }
        out
    }
}

/// Output slots of one degree for one row.
pub struct DegreeSlots<'a, T> {
    pub value: RowView<'a, T>,
    pub grad: [RowView<'a, T>; 3],
    pub hess: [RowView<'a, T>; 6],
}

impl<T: Copy> DegreeSlots<'_, T> {
    /// Store `term` at local index `local` (`l + m`).
    #[inline]
    pub fn write(&mut self, local: usize, term: &Term<T>, flags: EvalFlags) {
        self.value.set(local, term.v);
        if flags.grad() {
            for (view, g) in self.grad.iter_mut().zip(term.g) {
                view.set(local, g);
            }
        }
        if flags.hessian() {
            for (view, h) in self.hess.iter_mut().zip(term.h) {
                view.set(local, h);
            }
        }
    }
}

/// Value, gradient and Hessian scratch for one degree, `2 l_max + 1` slots per row.
#[derive(Debug, Clone)]
pub struct DegreeBuffers<T> {
    value: Vec<T>,
    grad: [Vec<T>; 3],
    hess: [Vec<T>; 6],
    rows: usize,
}

impl<T: SphScalar> DegreeBuffers<T> {
    pub fn new(l_max: usize, rows: usize) -> Self {
        let len = (2 * l_max + 1) * rows;
        Self {
            value: vec![T::zero(); len],
            grad: std::array::from_fn(|_| vec![T::zero(); len]),
            hess: std::array::from_fn(|_| vec![T::zero(); len]),
            rows,
        }
    }

    /// Zero slot `i` of `row` in every buffer.
    #[inline]
    pub fn clear_slot(&mut self, row: usize, i: usize) {
        let slot = i * self.rows + row;
        self.value[slot] = T::zero();
        for buffer in self.grad.iter_mut().chain(self.hess.iter_mut()) {
            buffer[slot] = T::zero();
        }
    }

    /// Zero the `2l + 1` slots of degree `l` for every row.
    pub fn clear(&mut self, l: usize) {
        for i in 0..2 * l + 1 {
            for row in 0..self.rows {
                self.clear_slot(row, i);
            }
        }
    }

    pub fn slots(&mut self, row: usize) -> DegreeSlots<'_, T> {
        let rows = self.rows;
        DegreeSlots {
            value: RowView::new(&mut self.value, rows, row),
            grad: self.grad.each_mut().map(|g| RowView::new(g, rows, row)),
            hess: self.hess.each_mut().map(|h| RowView::new(h, rows, row)),
        }
    }

    #[inline]
    pub fn value(&self, row: usize, i: usize) -> T {
        self.value[i * self.rows + row]
    }

    /// Value, gradient and full symmetric Hessian stored at slot `i` of `row`.
    pub fn channel(&self, row: usize, i: usize) -> (T, [T; 3], [[T; 3]; 3]) {
        let slot = i * self.rows + row;
        let grad = [self.grad[0][slot], self.grad[1][slot], self.grad[2][slot]];
        let hess = std::array::from_fn(|a| {
            std::array::from_fn(|b| self.hess[HESSIAN_SLOT[a][b]][slot])
        });
        (self.value[slot], grad, hess)
    }
}

/// Evaluate degree `l` for one row.
pub fn compute_degree<T: SphScalar>(
    l: usize,
    point: [T; 3],
    az: &AzimuthalRow<'_, T>,
    table: &PrefactorTable<T>,
    flags: EvalFlags,
    out: &mut DegreeSlots<'_, T>,
) {
    match DegreeKernel::for_degree(l) {
        DegreeKernel::Degree0 => hardcoded::degree0(flags, out),
        DegreeKernel::Degree1 => hardcoded::degree1(point, flags, out),
        DegreeKernel::Generic(l) => generic::generic_degree(l, point, az, table, flags, out),
    }
}

/// Scratch reused by [`evaluate_sample`] across samples.
#[derive(Debug, Clone)]
pub struct SampleWorkspace<T> {
    azimuthal: AzimuthalBuffers<T>,
    degree: DegreeBuffers<T>,
}

impl<T: SphScalar> SampleWorkspace<T> {
    pub fn new(l_max: usize) -> Self {
        Self {
            azimuthal: AzimuthalBuffers::new(l_max, 1),
            degree: DegreeBuffers::new(l_max, 1),
        }
    }
}

/// Evaluate one sample straight into its output rows, without tiling.
pub fn evaluate_sample<T: SphScalar>(
    point: [T; 3],
    table: &PrefactorTable<T>,
    flags: EvalFlags,
    workspace: &mut SampleWorkspace<T>,
    out: &mut SampleSlices<'_, T>,
) {
    let (coords, chain) = ChainRule::prepare(point, flags.normalize);
    workspace.azimuthal.fill_row(0, coords);

    for l in 0..=table.l_max() {
        workspace.degree.clear(l);
        compute_degree(
            l,
            coords,
            &workspace.azimuthal.row(0),
            table,
            flags,
            &mut workspace.degree.slots(0),
        );
        for i in 0..2 * l + 1 {
            let (value, grad, hess) = workspace.degree.channel(0, i);
            let (grad, hess) = chain.apply(grad, hess, flags);
            out.write(l * l + i, value, grad, hess);
        }
    }
}
