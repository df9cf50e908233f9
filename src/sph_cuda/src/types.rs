//! Core data types shared by the host and device evaluation paths.
//!
//! # Output layout
//!
//! All outputs are sample-major and flattened row-major, with
//! `nt = (l_max + 1)^2` channels per sample:
//!
//! ```text
//! sph   [N × nt]            sph[i*nt + c]
//! dsph  [N × 3 × nt]        dsph[i*3*nt + a*nt + c]
//! ddsph [N × 3 × 3 × nt]    ddsph[i*9*nt + (3*a + b)*nt + c]
//! ```
//!
//! Channel `c` of degree `l` and order `m` is `l*l + l + m`.

use serde::{Deserialize, Serialize};

use crate::error::{SphError, SphResult};
use crate::scalar::SphScalar;

/// Number of channels for all degrees `0..=l_max`.
#[inline]
pub const fn ntotal(l_max: usize) -> usize {
    (l_max + 1) * (l_max + 1)
}

/// Flat channel index of `(l, m)`, with `-l <= m <= l`.
#[inline]
pub fn channel_index(l: usize, m: i64) -> usize {
    debug_assert!(m.unsigned_abs() as usize <= l);
    ((l * l + l) as i64 + m) as usize
}

/// Unique Hessian entries, in the order the scratch stores them.
pub const HESSIAN_PAIRS: [(usize, usize); 6] = [(0, 0), (0, 1), (0, 2), (1, 1), (1, 2), (2, 2)];

/// Map a symmetric `(a, b)` axis pair to its slot in [`HESSIAN_PAIRS`].
pub const HESSIAN_SLOT: [[usize; 3]; 3] = [[0, 1, 2], [1, 3, 4], [2, 4, 5]];

/// Bits of the packed flag word read by the device kernel.
pub const FLAG_GRAD: u32 = 1;
pub const FLAG_HESSIAN: u32 = 2;
pub const FLAG_NORMALIZE: u32 = 4;

/// Which outputs an evaluation produces.
///
/// `requires_hessian` implies `requires_grad`: the chain rule for the
/// normalized Hessian needs the raw gradient, and the gradient is always
/// returned alongside the Hessian.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalFlags {
    pub requires_grad: bool,
    pub requires_hessian: bool,
    pub normalize: bool,
}

impl EvalFlags {
    /// Values only.
    pub fn values(normalize: bool) -> Self {
        Self {
            requires_grad: false,
            requires_hessian: false,
            normalize,
        }
    }

    /// Values and gradients.
    pub fn gradients(normalize: bool) -> Self {
        Self {
            requires_grad: true,
            requires_hessian: false,
            normalize,
        }
    }

    /// Values, gradients and Hessians.
    pub fn hessians(normalize: bool) -> Self {
        Self {
            requires_grad: true,
            requires_hessian: true,
            normalize,
        }
    }

    /// Whether gradients are produced (explicitly or implied by the Hessian).
    #[inline]
    pub fn grad(&self) -> bool {
        self.requires_grad || self.requires_hessian
    }

    #[inline]
    pub fn hessian(&self) -> bool {
        self.requires_hessian
    }

    /// Pack into the bitmask the device kernel reads.
    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.grad() {
            bits |= FLAG_GRAD;
        }
        if self.hessian() {
            bits |= FLAG_HESSIAN;
        }
        if self.normalize {
            bits |= FLAG_NORMALIZE;
        }
        bits
    }
}

/// Work-group geometry: `rows` samples per group, `lanes` units per sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileConfig {
    pub rows: usize,
    pub lanes: usize,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self { rows: 8, lanes: 8 }
    }
}

impl TileConfig {
    pub fn new(rows: usize, lanes: usize) -> SphResult<Self> {
        let tiling = Self { rows, lanes };
        tiling.validate()?;
        Ok(tiling)
    }

    /// Both sizes non-zero, lanes a power of two (the backward reduction halves them).
    pub fn validate(&self) -> SphResult<()> {
        if self.rows == 0 || self.lanes == 0 || !self.lanes.is_power_of_two() {
            return Err(SphError::InvalidTiling {
                rows: self.rows,
                lanes: self.lanes,
            });
        }
        Ok(())
    }

    /// Number of tiles needed to cover `n_samples`.
    #[inline]
    pub fn num_tiles(&self, n_samples: usize) -> usize {
        n_samples.div_ceil(self.rows)
    }
}

/// Evaluation results for a batch of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SphOutput<T> {
    /// Values `[N × nt]`.
    pub sph: Vec<T>,
    /// Gradients `[N × 3 × nt]`, present when gradients were requested.
    pub dsph: Option<Vec<T>>,
    /// Hessians `[N × 3 × 3 × nt]`, present when Hessians were requested.
    pub ddsph: Option<Vec<T>>,
    pub n_samples: usize,
    pub l_max: usize,
}

impl<T: SphScalar> SphOutput<T> {
    /// Zero-filled output sized for `n_samples` at `l_max` with the buffers `flags` asks for.
    pub fn zeros(n_samples: usize, l_max: usize, flags: EvalFlags) -> Self {
        let nt = ntotal(l_max);
        Self {
            sph: vec![T::zero(); n_samples * nt],
            dsph: flags.grad().then(|| vec![T::zero(); n_samples * 3 * nt]),
            ddsph: flags.hessian().then(|| vec![T::zero(); n_samples * 9 * nt]),
            n_samples,
            l_max,
        }
    }
}

impl<T: Copy> SphOutput<T> {
    /// Channels per sample.
    #[inline]
    pub fn ntotal(&self) -> usize {
        ntotal(self.l_max)
    }

    /// Flags describing which buffers this output carries (normalization is not recorded).
    pub fn flags(&self) -> EvalFlags {
        EvalFlags {
            requires_grad: self.dsph.is_some(),
            requires_hessian: self.ddsph.is_some(),
            normalize: false,
        }
    }

    /// Check every buffer against the layout for `n_samples` / `l_max` / `flags`.
    pub fn check_shape(&self, n_samples: usize, l_max: usize, flags: EvalFlags) -> SphResult<()> {
        if self.l_max != l_max {
            return Err(SphError::DegreeMismatch {
                expected: l_max,
                actual: self.l_max,
            });
        }
        let nt = ntotal(l_max);
        check_len("sph", Some(&self.sph), n_samples * nt)?;
        if flags.grad() {
            check_len("dsph", self.dsph.as_ref(), n_samples * 3 * nt)?;
        }
        if flags.hessian() {
            check_len("ddsph", self.ddsph.as_ref(), n_samples * 9 * nt)?;
        }
        Ok(())
    }

    /// Values of sample `i`.
    pub fn sample(&self, i: usize) -> &[T] {
        let nt = self.ntotal();
        &self.sph[i * nt..(i + 1) * nt]
    }

    /// `Y_l^m` of sample `i`.
    pub fn value(&self, i: usize, l: usize, m: i64) -> T {
        self.sph[i * self.ntotal() + channel_index(l, m)]
    }

    /// `∂Y_l^m/∂axis` of sample `i`.
    pub fn gradient(&self, i: usize, axis: usize, l: usize, m: i64) -> Option<T> {
        let nt = self.ntotal();
        self.dsph
            .as_ref()
            .map(|d| d[i * 3 * nt + axis * nt + channel_index(l, m)])
    }

    /// `∂²Y_l^m/∂a∂b` of sample `i`.
    pub fn hessian(&self, i: usize, a: usize, b: usize, l: usize, m: i64) -> Option<T> {
        let nt = self.ntotal();
        self.ddsph
            .as_ref()
            .map(|d| d[i * 9 * nt + (3 * a + b) * nt + channel_index(l, m)])
    }
}

fn check_len<T>(name: &'static str, buffer: Option<&Vec<T>>, expected: usize) -> SphResult<()> {
    let actual = buffer.map(Vec::len).unwrap_or(0);
    if actual != expected {
        return Err(SphError::ShapeMismatch {
            name,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Mutable output rows of a single sample.
pub struct SampleSlices<'a, T> {
    pub sph: &'a mut [T],
    pub dsph: Option<&'a mut [T]>,
    pub ddsph: Option<&'a mut [T]>,
}

impl<T: Copy> SampleSlices<'_, T> {
    /// Write one channel's value and (when the rows exist) its derivatives.
    #[inline]
    pub fn write(&mut self, channel: usize, value: T, grad: [T; 3], hess: [[T; 3]; 3]) {
        let nt = self.sph.len();
        self.sph[channel] = value;
        if let Some(dsph) = self.dsph.as_deref_mut() {
            for (a, g) in grad.iter().enumerate() {
                dsph[a * nt + channel] = *g;
            }
        }
        if let Some(ddsph) = self.ddsph.as_deref_mut() {
            for (a, row) in hess.iter().enumerate() {
                for (b, h) in row.iter().enumerate() {
                    ddsph[(3 * a + b) * nt + channel] = *h;
                }
            }
        }
    }
}

/// Mutable output rows of one work-group's samples.
///
/// The final group is shorter when the sample count is not a multiple of `rows`.
pub struct TileSlices<'a, T> {
    pub sph: &'a mut [T],
    pub dsph: Option<&'a mut [T]>,
    pub ddsph: Option<&'a mut [T]>,
}

impl<T> TileSlices<'_, T> {
    /// Number of in-range samples in this group.
    #[inline]
    pub fn len(&self, nt: usize) -> usize {
        self.sph.len() / nt
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sph.is_empty()
    }

    /// Output rows of sample `row` within the group.
    pub fn sample_mut(&mut self, row: usize, nt: usize) -> SampleSlices<'_, T> {
        SampleSlices {
            sph: &mut self.sph[row * nt..(row + 1) * nt],
            dsph: self
                .dsph
                .as_deref_mut()
                .map(|d| &mut d[row * 3 * nt..(row + 1) * 3 * nt]),
            ddsph: self
                .ddsph
                .as_deref_mut()
                .map(|d| &mut d[row * 9 * nt..(row + 1) * 9 * nt]),
        }
    }
}

/// Split flat output buffers into per-group chunks of `rows` samples.
pub fn split_rows<'a, T>(
    sph: &'a mut [T],
    dsph: Option<&'a mut [T]>,
    ddsph: Option<&'a mut [T]>,
    nt: usize,
    rows: usize,
) -> Vec<TileSlices<'a, T>> {
    let mut dsph_chunks = dsph.map(|d| d.chunks_mut(rows * 3 * nt));
    let mut ddsph_chunks = ddsph.map(|d| d.chunks_mut(rows * 9 * nt));
    sph.chunks_mut(rows * nt)
        .map(|sph| TileSlices {
            sph,
            dsph: dsph_chunks.as_mut().and_then(Iterator::next),
            ddsph: ddsph_chunks.as_mut().and_then(Iterator::next),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_index() {
        assert_eq!(channel_index(0, 0), 0);
        assert_eq!(channel_index(1, -1), 1);
        assert_eq!(channel_index(1, 1), 3);
        assert_eq!(channel_index(2, -2), 4);
        assert_eq!(channel_index(3, 3), 15);
        assert_eq!(ntotal(3), 16);
    }

    #[test]
    fn test_hessian_implies_gradient() {
        let flags = EvalFlags {
            requires_grad: false,
            requires_hessian: true,
            normalize: true,
        };
        assert!(flags.grad());
        assert_eq!(flags.bits(), FLAG_GRAD | FLAG_HESSIAN | FLAG_NORMALIZE);
        assert_eq!(EvalFlags::gradients(false).bits(), FLAG_GRAD);

        let out = SphOutput::<f64>::zeros(5, 2, flags);
        assert_eq!(out.sph.len(), 5 * 9);
        assert_eq!(out.dsph.as_ref().map(Vec::len), Some(5 * 3 * 9));
        assert_eq!(out.ddsph.as_ref().map(Vec::len), Some(5 * 9 * 9));
    }

    #[test]
    fn test_hessian_slots_symmetric() {
        for a in 0..3 {
            for b in 0..3 {
                let slot = HESSIAN_SLOT[a][b];
                assert_eq!(HESSIAN_SLOT[b][a], slot);
                let (i, j) = HESSIAN_PAIRS[slot];
                assert_eq!((i.min(j), i.max(j)), (a.min(b), a.max(b)));
            }
        }
    }

    #[test]
    fn test_check_shape_rejects_wrong_sizes() {
        let flags = EvalFlags::gradients(false);
        let mut out = SphOutput::<f32>::zeros(4, 3, flags);
        assert!(out.check_shape(4, 3, flags).is_ok());

        assert!(matches!(
            out.check_shape(4, 2, flags),
            Err(SphError::DegreeMismatch { expected: 2, actual: 3 })
        ));
        assert!(matches!(
            out.check_shape(5, 3, flags),
            Err(SphError::ShapeMismatch { name: "sph", .. })
        ));

        out.dsph = None;
        assert!(matches!(
            out.check_shape(4, 3, flags),
            Err(SphError::ShapeMismatch {
                name: "dsph",
                actual: 0,
                ..
            })
        ));
    }

    #[test]
    fn test_tile_config_validation() {
        assert!(TileConfig::new(8, 8).is_ok());
        assert!(TileConfig::new(3, 4).is_ok());
        assert!(TileConfig::new(0, 8).is_err());
        assert!(TileConfig::new(8, 6).is_err());
        assert_eq!(TileConfig::default().num_tiles(17), 3);
    }

    #[test]
    fn test_split_rows_overhang() {
        let nt = 4;
        let mut sph = vec![0.0f64; 5 * nt];
        let mut dsph = vec![0.0f64; 5 * 3 * nt];
        let mut chunks = split_rows(&mut sph, Some(&mut dsph), None, nt, 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(nt), 2);
        assert_eq!(chunks[2].len(nt), 1);
        assert_eq!(chunks[2].dsph.as_ref().map(|d| d.len()), Some(3 * nt));
        assert!(chunks[0].ddsph.is_none());

        let mut sample = chunks[1].sample_mut(1, nt);
        sample.write(2, 1.5, [1.0, 2.0, 3.0], [[0.0; 3]; 3]);
        drop(chunks);
        assert_eq!(sph[3 * nt + 2], 1.5);
        assert_eq!(dsph[3 * 3 * nt + 2 * nt + 2], 3.0);
    }
}
