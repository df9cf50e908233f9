//! CubeCL kernels and their shared-memory layouts.

pub mod backward;
pub mod forward;

pub use backward::vector_jacobian_kernel;
pub use forward::spherical_harmonics_kernel;

use crate::types::{EvalFlags, TileConfig};

/// Shared memory sizes (in elements) of one forward work-group.
///
/// Buffers a launch does not need are sized to one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardLayout {
    pub prefactor_len: u32,
    pub azimuthal_len: u32,
    pub channel_len: u32,
    pub grad_len: u32,
    pub hess_len: u32,
}

impl ForwardLayout {
    pub fn new(l_max: usize, flags: EvalFlags, tiling: TileConfig) -> Self {
        let channel_len = ((2 * l_max + 1) * tiling.rows) as u32;
        Self {
            prefactor_len: ((l_max + 1) * (l_max + 2)) as u32,
            azimuthal_len: ((l_max + 1) * tiling.rows) as u32,
            channel_len,
            grad_len: if flags.grad() { 3 * channel_len } else { 1 },
            hess_len: if flags.hessian() { 6 * channel_len } else { 1 },
        }
    }

    /// Total elements across all seven shared arrays.
    pub fn elements(&self) -> usize {
        (self.prefactor_len
            + 3 * self.azimuthal_len
            + self.channel_len
            + self.grad_len
            + self.hess_len) as usize
    }

    pub fn bytes<F>(&self) -> usize {
        self.elements() * std::mem::size_of::<F>()
    }

    /// Shared bytes of a launch, computed in `usize` before any narrowing.
    pub fn required_bytes<F>(l_max: usize, flags: EvalFlags, tiling: TileConfig) -> usize {
        let channel = (2 * l_max + 1).saturating_mul(tiling.rows);
        let per_channel = 1 + if flags.grad() { 3 } else { 0 } + if flags.hessian() { 6 } else { 0 };
        let unused = if flags.grad() { 0 } else { 1 } + if flags.hessian() { 0 } else { 1 };
        (l_max + 1)
            .saturating_mul(l_max + 2)
            .saturating_add((l_max + 1).saturating_mul(3 * tiling.rows))
            .saturating_add(channel.saturating_mul(per_channel))
            .saturating_add(unused)
            .saturating_mul(std::mem::size_of::<F>())
    }
}

/// `log2(lanes)` halving steps for the backward reduction.
pub fn reduce_steps(lanes: usize) -> u32 {
    lanes.trailing_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_layout() {
        let layout = ForwardLayout::new(3, EvalFlags::values(false), TileConfig::default());
        assert_eq!(layout.prefactor_len, 20);
        assert_eq!(layout.azimuthal_len, 32);
        assert_eq!(layout.channel_len, 56);
        assert_eq!(layout.grad_len, 1);
        assert_eq!(layout.elements(), 20 + 96 + 56 + 2);

        let layout = ForwardLayout::new(3, EvalFlags::hessians(false), TileConfig::default());
        assert_eq!(layout.grad_len, 168);
        assert_eq!(layout.hess_len, 336);
        assert_eq!(layout.bytes::<f64>(), layout.elements() * 8);
    }

    #[test]
    fn test_required_bytes_matches_layout() {
        for flags in [
            EvalFlags::values(false),
            EvalFlags::gradients(true),
            EvalFlags::hessians(true),
        ] {
            for l_max in [0, 1, 5] {
                let tiling = TileConfig::new(4, 8).unwrap();
                let layout = ForwardLayout::new(l_max, flags, tiling);
                assert_eq!(
                    ForwardLayout::required_bytes::<f32>(l_max, flags, tiling),
                    layout.bytes::<f32>()
                );
            }
        }
        // Saturates instead of wrapping for absurd degrees.
        let huge = ForwardLayout::required_bytes::<f64>(
            usize::MAX / 4,
            EvalFlags::hessians(false),
            TileConfig::default(),
        );
        assert_eq!(huge, usize::MAX);
    }

    #[test]
    fn test_reduce_steps() {
        assert_eq!(reduce_steps(1), 0);
        assert_eq!(reduce_steps(8), 3);
        assert_eq!(reduce_steps(32), 5);
    }
}
