//! Backward kernel: `xyz_grad[i][a] = Σ_c dsph[i][a][c] · sph_grad[i][c]`.
//!
//! Launched with `CubeCount(tiles, 3, 1)`: `CUBE_POS_Y` selects the axis.
//! Each row's lanes accumulate strided partial sums over the channels,
//! then halve the partials `reduce_steps = log2(lanes)` times in shared
//! memory. Overhang rows contribute zero and do not write.

use cubecl::prelude::*;

/// Contract upstream gradients with `dsph`.
///
/// # Arguments
/// * `dsph` - [N * 3 * nt]: gradients from the forward pass
/// * `sph_grad` - [N * nt]: upstream gradients w.r.t. `sph`
/// * `num_samples` - N
/// * `num_channels` - nt = (L+1)^2
/// * `reduce_steps` - log2(CUBE_DIM_X)
/// * `xyz_grad` - [N * 3] output
/// * `partial_len` - CUBE_DIM_X * CUBE_DIM_Y
#[cube(launch_unchecked)]
pub fn vector_jacobian_kernel<F: Float>(
    dsph: &Array<F>,
    sph_grad: &Array<F>,
    num_samples: u32,
    num_channels: u32,
    reduce_steps: u32,
    xyz_grad: &mut Array<F>,
    #[comptime] partial_len: u32,
) {
    let lane = UNIT_POS_X;
    let row = UNIT_POS_Y;
    let lanes = CUBE_DIM_X;
    let axis = CUBE_POS_Y;
    let sample = CUBE_POS_X * CUBE_DIM_Y + row;
    let in_range = sample < num_samples;

    let mut partial = SharedMemory::<F>::new(partial_len);

    let mut acc = F::new(0.0);
    if in_range {
        let dbase = sample * 3 * num_channels + axis * num_channels;
        let gbase = sample * num_channels;
        let iters = (num_channels + lanes - 1) / lanes;
        for k in 0..iters {
            let c = k * lanes + lane;
            if c < num_channels {
                acc += dsph[dbase + c] * sph_grad[gbase + c];
            }
        }
    }
    let base = row * lanes;
    partial[base + lane] = acc;
    sync_cube();

    let mut stride = lanes / 2;
    for _step in 0..reduce_steps {
        if lane < stride {
            partial[base + lane] = partial[base + lane] + partial[base + lane + stride];
        }
        sync_cube();
        stride = stride / 2;
    }

    if lane == 0u32 && in_range {
        xyz_grad[sample * 3 + axis] = partial[base];
    }
}
