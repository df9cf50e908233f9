//! Work-group scratch for the tiled host backend.
//!
//! A [`TileScratch`] mirrors the shared memory of one device work-group:
//! `rows` samples, each served by `lanes` units. Every degree runs one
//! Clear → Compute → Flush cycle:
//!
//! ```text
//! Idle/Flushed(l-1) --clear(l)--> Cleared(l) --compute(l)--> Computed(l) --flush(l)--> Flushed(l)
//! ```
//!
//! On the device the cycle is ordered by barriers; here the transitions are
//! checked with `debug_assert!` and lanes are emulated by strided loops
//! (lane `k` owns slots `k, k + lanes, k + 2·lanes, ...`).

use crate::normalize::ChainRule;
use crate::prefactors::PrefactorTable;
use crate::recurrence::{compute_degree, AzimuthalBuffers, DegreeBuffers};
use crate::scalar::SphScalar;
use crate::types::{EvalFlags, TileConfig, TileSlices};

/// Where the scratch is in the per-degree cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Cleared(usize),
    Computed(usize),
    Flushed(usize),
}

/// Per-group scratch, reused across the tiles one worker processes.
#[derive(Debug, Clone)]
pub struct TileScratch<T> {
    tiling: TileConfig,
    flags: EvalFlags,
    l_max: usize,
    azimuthal: AzimuthalBuffers<T>,
    degree: DegreeBuffers<T>,
    coords: Vec<[T; 3]>,
    chain: Vec<ChainRule<T>>,
    phase: Phase,
}

impl<T: SphScalar> TileScratch<T> {
    pub fn new(l_max: usize, tiling: TileConfig, flags: EvalFlags) -> Self {
        Self {
            tiling,
            flags,
            l_max,
            azimuthal: AzimuthalBuffers::new(l_max, tiling.rows),
            degree: DegreeBuffers::new(l_max, tiling.rows),
            coords: vec![[T::zero(); 3]; tiling.rows],
            chain: vec![ChainRule::identity(); tiling.rows],
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Stage the samples of one tile and run the azimuthal recurrence.
    ///
    /// Rows past the end of `samples` read a zero vector; they take part in
    /// every phase but are never flushed.
    pub fn load(&mut self, samples: &[[T; 3]]) {
        debug_assert!(samples.len() <= self.tiling.rows);
        for row in 0..self.tiling.rows {
            let point = samples.get(row).copied().unwrap_or([T::zero(); 3]);
            let (coords, chain) = ChainRule::prepare(point, self.flags.normalize);
            self.coords[row] = coords;
            self.chain[row] = chain;
            // lane 0
            self.azimuthal.fill_row(row, coords);
        }
        self.phase = Phase::Idle;
    }

    /// Zero the `2l + 1` slots of degree `l`, lanes striding over slots.
    pub fn clear(&mut self, l: usize) {
        debug_assert!(
            matches!(self.phase, Phase::Idle if l == 0)
                || self.phase == Phase::Flushed(l.wrapping_sub(1)),
            "clear({l}) from {:?}",
            self.phase
        );
        let width = 2 * l + 1;
        for row in 0..self.tiling.rows {
            for lane in 0..self.tiling.lanes {
                for i in (lane..width).step_by(self.tiling.lanes) {
                    self.degree.clear_slot(row, i);
                }
            }
        }
        self.phase = Phase::Cleared(l);
    }

    /// Lane 0 of every row evaluates degree `l` into the scratch.
    pub fn compute(&mut self, l: usize, table: &PrefactorTable<T>) {
        debug_assert_eq!(self.phase, Phase::Cleared(l));
        for row in 0..self.tiling.rows {
            compute_degree(
                l,
                self.coords[row],
                &self.azimuthal.row(row),
                table,
                self.flags,
                &mut self.degree.slots(row),
            );
        }
        self.phase = Phase::Computed(l);
    }

    /// Copy degree `l` to the in-range rows of `out`, applying the chain rule.
    pub fn flush(&mut self, l: usize, out: &mut TileSlices<'_, T>) {
        debug_assert_eq!(self.phase, Phase::Computed(l));
        let nt = (self.l_max + 1) * (self.l_max + 1);
        let width = 2 * l + 1;
        let in_range = out.len(nt);
        for row in 0..in_range {
            let mut sample = out.sample_mut(row, nt);
            for lane in 0..self.tiling.lanes {
                for i in (lane..width).step_by(self.tiling.lanes) {
                    let (value, grad, hess) = self.degree.channel(row, i);
                    let (grad, hess) = self.chain[row].apply(grad, hess, self.flags);
                    sample.write(l * l + i, value, grad, hess);
                }
            }
        }
        self.phase = Phase::Flushed(l);
    }

    /// Run every degree for one tile.
    pub fn evaluate_tile(
        &mut self,
        samples: &[[T; 3]],
        table: &PrefactorTable<T>,
        out: &mut TileSlices<'_, T>,
    ) {
        self.load(samples);
        for l in 0..=self.l_max {
            self.clear(l);
            self.compute(l, table);
            self.flush(l, out);
        }
    }
}
