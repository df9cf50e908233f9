//! Forward kernel: harmonics, gradients and Hessians for a tile of samples.
//!
//! One cube handles `CUBE_DIM_Y` samples ("rows"), each served by
//! `CUBE_DIM_X` units ("lanes"). Shared memory holds the prefactor table,
//! the per-row azimuthal terms and one degree's worth of value / gradient /
//! Hessian scratch (row `r`, slot `i` at `i * rows + r`).
//!
//! Phases, each ending in `sync_cube()`:
//! 1. stage the prefactors (all units, strided)
//! 2. azimuthal recurrence (lane 0 of each row)
//! 3. for every degree `l`:
//!    - clear `2l+1` slots (lanes strided)
//!    - compute the degree (lane 0 of each row)
//!    - flush to global memory with the chain rule (lanes strided, rows
//!      past `num_samples` masked)
//!
//! Rows past the end of the batch never `terminate!()`: they read a zero
//! vector and take part in every barrier.

use cubecl::prelude::*;

use crate::types::{FLAG_GRAD, FLAG_HESSIAN, FLAG_NORMALIZE};

/// One step of the downward `m` recurrence of degree `d`.
#[cube]
#[allow(clippy::too_many_arguments)]
fn q_step<F: Float>(
    prefactors: &SharedMemory<F>,
    q_offset: u32,
    d: u32,
    m: u32,
    twomz: F,
    rxy: F,
    q1: F,
    q2: F,
) -> F {
    let mut q = F::new(0.0);
    let base = q_offset + d * (d + 1) / 2;
    if m == d {
        q = prefactors[base + d];
    } else if m < d {
        q = prefactors[base + m] * (twomz * q1 + rxy * q2);
    }
    q
}

/// Store one channel's value and derivatives into the degree scratch.
#[cube]
#[allow(clippy::too_many_arguments)]
fn store_channel<F: Float>(
    value: &mut SharedMemory<F>,
    grad: &mut SharedMemory<F>,
    hess: &mut SharedMemory<F>,
    slot: u32,
    stride: u32,
    flags: u32,
    v: F,
    gx: F,
    gy: F,
    gz: F,
    hxx: F,
    hxy: F,
    hxz: F,
    hyy: F,
    hyz: F,
    hzz: F,
) {
    value[slot] = v;
    if (flags & FLAG_GRAD) != 0u32 {
        grad[slot] = gx;
        grad[stride + slot] = gy;
        grad[2 * stride + slot] = gz;
    }
    if (flags & FLAG_HESSIAN) != 0u32 {
        hess[slot] = hxx;
        hess[stride + slot] = hxy;
        hess[2 * stride + slot] = hxz;
        hess[3 * stride + slot] = hyy;
        hess[4 * stride + slot] = hyz;
        hess[5 * stride + slot] = hzz;
    }
}

/// `Y_1^{-1,0,1} = c · (y, z, x)` with `c = pk[1][0]`; the Hessian stays cleared.
#[cube]
#[allow(clippy::too_many_arguments)]
fn degree1<F: Float>(
    value: &mut SharedMemory<F>,
    grad: &mut SharedMemory<F>,
    hess: &mut SharedMemory<F>,
    row: u32,
    rows: u32,
    stride: u32,
    flags: u32,
    c: F,
    x: F,
    y: F,
    z: F,
) {
    let zero = F::new(0.0);
    store_channel(
        value, grad, hess, row, stride, flags, c * y, zero, c, zero, zero, zero, zero, zero,
        zero, zero,
    );
    store_channel(
        value,
        grad,
        hess,
        rows + row,
        stride,
        flags,
        c * z,
        zero,
        zero,
        c,
        zero,
        zero,
        zero,
        zero,
        zero,
        zero,
    );
    store_channel(
        value,
        grad,
        hess,
        2 * rows + row,
        stride,
        flags,
        c * x,
        c,
        zero,
        zero,
        zero,
        zero,
        zero,
        zero,
        zero,
        zero,
    );
}

/// Degree `l >= 2` for one row: downward sweep over `m` with `Q_l`, `Q_{l-1}`, `Q_{l-2}`.
#[cube]
#[allow(clippy::too_many_arguments)]
fn generic_degree<F: Float>(
    prefactors: &SharedMemory<F>,
    c: &SharedMemory<F>,
    s: &SharedMemory<F>,
    twomz: &SharedMemory<F>,
    value: &mut SharedMemory<F>,
    grad: &mut SharedMemory<F>,
    hess: &mut SharedMemory<F>,
    l: u32,
    q_offset: u32,
    row: u32,
    rows: u32,
    stride: u32,
    flags: u32,
    x: F,
    y: F,
) {
    let zero = F::new(0.0);
    let rxy = x * x + y * y;
    let pk_base = l * (l + 1) / 2;

    let mut q1 = F::new(0.0);
    let mut q2 = F::new(0.0);
    let mut p1 = F::new(0.0);
    let mut p2 = F::new(0.0);
    let mut r1 = F::new(0.0);
    let mut r2 = F::new(0.0);

    for mi in 0..l + 1 {
        let m = l - mi;
        let tz = twomz[m * rows + row];
        let q = q_step(prefactors, q_offset, l, m, tz, rxy, q1, q2);
        let p0 = q_step(prefactors, q_offset, l - 1, m, tz, rxy, p1, p2);
        let r0 = q_step(prefactors, q_offset, l - 2, m, tz, rxy, r1, r2);

        // Polynomial part A = Q_l^m and its derivatives.
        let k = F::cast_from(l + m);
        let ax = x * p1;
        let ay = y * p1;
        let az = k * p0;
        let axx = p1 + x * x * r2;
        let axy = x * y * r2;
        let axz = x * k * r1;
        let ayy = p1 + y * y * r2;
        let ayz = y * k * r1;
        let azz = k * (k - F::new(1.0)) * r0;

        let f = prefactors[pk_base + m];
        if m == 0u32 {
            store_channel(
                value,
                grad,
                hess,
                l * rows + row,
                stride,
                flags,
                f * q,
                f * ax,
                f * ay,
                f * az,
                f * axx,
                f * axy,
                f * axz,
                f * ayy,
                f * ayz,
                f * azz,
            );
        } else {
            let fm = F::cast_from(m);
            let cm = c[m * rows + row];
            let sm = s[m * rows + row];
            let c1 = c[(m - 1) * rows + row];
            let s1 = s[(m - 1) * rows + row];

            // Azimuthal part B: c_m for +m, s_m for -m.
            let bx_c = fm * c1;
            let by_c = zero - fm * s1;
            let bx_s = fm * s1;
            let by_s = fm * c1;

            let mut bxx_c = F::new(0.0);
            let mut bxy_c = F::new(0.0);
            let mut byy_c = F::new(0.0);
            let mut bxx_s = F::new(0.0);
            let mut bxy_s = F::new(0.0);
            let mut byy_s = F::new(0.0);
            if m >= 2u32 {
                let fmm = F::cast_from(m * (m - 1));
                let c2 = c[(m - 2) * rows + row];
                let s2 = s[(m - 2) * rows + row];
                bxx_c = fmm * c2;
                bxy_c = zero - fmm * s2;
                byy_c = zero - fmm * c2;
                bxx_s = fmm * s2;
                bxy_s = fmm * c2;
                byy_s = zero - fmm * s2;
            }

            store_channel(
                value,
                grad,
                hess,
                (l + m) * rows + row,
                stride,
                flags,
                f * q * cm,
                f * (ax * cm + q * bx_c),
                f * (ay * cm + q * by_c),
                f * (az * cm),
                f * (axx * cm + F::new(2.0) * ax * bx_c + q * bxx_c),
                f * (axy * cm + ax * by_c + ay * bx_c + q * bxy_c),
                f * (axz * cm + az * bx_c),
                f * (ayy * cm + F::new(2.0) * ay * by_c + q * byy_c),
                f * (ayz * cm + az * by_c),
                f * (azz * cm),
            );
            store_channel(
                value,
                grad,
                hess,
                (l - m) * rows + row,
                stride,
                flags,
                f * q * sm,
                f * (ax * sm + q * bx_s),
                f * (ay * sm + q * by_s),
                f * (az * sm),
                f * (axx * sm + F::new(2.0) * ax * bx_s + q * bxx_s),
                f * (axy * sm + ax * by_s + ay * bx_s + q * bxy_s),
                f * (axz * sm + az * bx_s),
                f * (ayy * sm + F::new(2.0) * ay * by_s + q * byy_s),
                f * (ayz * sm + az * by_s),
                f * (azz * sm),
            );
        }

        q2 = q1;
        q1 = q;
        p2 = p1;
        p1 = p0;
        r2 = r1;
        r1 = r0;
    }
}

/// One entry of the normalized Hessian (see `normalize.rs`).
#[cube]
#[allow(clippy::too_many_arguments)]
fn chain_hessian<F: Float>(
    h: F,
    ua: F,
    ub: F,
    ta: F,
    tb: F,
    ga: F,
    gb: F,
    t: F,
    t2: F,
    diag: F,
    ir2: F,
) -> F {
    (h - ub * ta - ua * tb + F::new(3.0) * ua * ub * t - diag - ua * gb - ub * ga + ua * ub * t2)
        * ir2
}

/// Evaluate real spherical harmonics up to `l_max` for every sample.
///
/// # Arguments
/// * `xyz` - [N * 3]: input vectors
/// * `prefactors` - [(L+1)(L+2)]: `pk` half followed by `qlmk` half
/// * `num_samples` - N
/// * `l_max` - maximum degree L
/// * `flags` - `FLAG_GRAD | FLAG_HESSIAN | FLAG_NORMALIZE`
/// * `sph` - [N * nt] output
/// * `dsph` - [N * 3 * nt] output (1 element when gradients are off)
/// * `ddsph` - [N * 9 * nt] output (1 element when Hessians are off)
/// * `prefactor_len` .. `hess_len` - shared memory sizes, see `ForwardLayout`
#[cube(launch_unchecked)]
#[allow(clippy::too_many_arguments)]
pub fn spherical_harmonics_kernel<F: Float>(
    xyz: &Array<F>,
    prefactors: &Array<F>,
    num_samples: u32,
    l_max: u32,
    flags: u32,
    sph: &mut Array<F>,
    dsph: &mut Array<F>,
    ddsph: &mut Array<F>,
    #[comptime] prefactor_len: u32,
    #[comptime] azimuthal_len: u32,
    #[comptime] channel_len: u32,
    #[comptime] grad_len: u32,
    #[comptime] hess_len: u32,
) {
    let lane = UNIT_POS_X;
    let row = UNIT_POS_Y;
    let lanes = CUBE_DIM_X;
    let rows = CUBE_DIM_Y;
    let sample = CUBE_POS_X * rows + row;
    let in_range = sample < num_samples;

    let want_grad = (flags & FLAG_GRAD) != 0u32;
    let want_hess = (flags & FLAG_HESSIAN) != 0u32;
    let normalize = (flags & FLAG_NORMALIZE) != 0u32;

    let nt = (l_max + 1) * (l_max + 1);
    let q_offset = (l_max + 1) * (l_max + 2) / 2;
    let stride = (2 * l_max + 1) * rows;

    let mut shared_prefactors = SharedMemory::<F>::new(prefactor_len);
    let mut c = SharedMemory::<F>::new(azimuthal_len);
    let mut s = SharedMemory::<F>::new(azimuthal_len);
    let mut twomz = SharedMemory::<F>::new(azimuthal_len);
    let mut value = SharedMemory::<F>::new(channel_len);
    let mut grad = SharedMemory::<F>::new(grad_len);
    let mut hess = SharedMemory::<F>::new(hess_len);

    // Stage prefactors.
    let unit = row * lanes + lane;
    let group = rows * lanes;
    let table_len = 2 * q_offset;
    let stage_iters = (table_len + group - 1) / group;
    for k in 0..stage_iters {
        let i = k * group + unit;
        if i < table_len {
            shared_prefactors[i] = prefactors[i];
        }
    }

    // Load sample (zero vector for overhang rows) and normalize.
    let mut x = F::new(0.0);
    let mut y = F::new(0.0);
    let mut z = F::new(0.0);
    if in_range {
        x = xyz[sample * 3];
        y = xyz[sample * 3 + 1];
        z = xyz[sample * 3 + 2];
    }
    let mut ir = F::new(1.0);
    if normalize {
        let r2 = x * x + y * y + z * z;
        ir = F::new(0.0);
        if r2 > F::new(0.0) {
            ir = F::new(1.0) / F::sqrt(r2);
        }
        x = x * ir;
        y = y * ir;
        z = z * ir;
    }

    // Azimuthal recurrence, lane 0 of each row.
    if lane == 0u32 {
        let two_z = z + z;
        c[row] = F::new(1.0);
        s[row] = F::new(0.0);
        twomz[row] = two_z;
        for m in 1..l_max + 1 {
            let prev = (m - 1) * rows + row;
            let cur = m * rows + row;
            c[cur] = c[prev] * x - s[prev] * y;
            s[cur] = c[prev] * y + s[prev] * x;
            twomz[cur] = twomz[prev] + two_z;
        }
    }
    sync_cube();

    let ir2 = ir * ir;
    for l in 0..l_max + 1 {
        let width = 2 * l + 1;
        let iters = (width + lanes - 1) / lanes;

        // Clear.
        for k in 0..iters {
            let i = k * lanes + lane;
            if i < width {
                let slot = i * rows + row;
                value[slot] = F::new(0.0);
                if want_grad {
                    grad[slot] = F::new(0.0);
                    grad[stride + slot] = F::new(0.0);
                    grad[2 * stride + slot] = F::new(0.0);
                }
                if want_hess {
                    hess[slot] = F::new(0.0);
                    hess[stride + slot] = F::new(0.0);
                    hess[2 * stride + slot] = F::new(0.0);
                    hess[3 * stride + slot] = F::new(0.0);
                    hess[4 * stride + slot] = F::new(0.0);
                    hess[5 * stride + slot] = F::new(0.0);
                }
            }
        }
        sync_cube();

        // Compute.
        if lane == 0u32 {
            if l == 0u32 {
                // pk[0][0] · Q_0^0
                value[row] = shared_prefactors[0] * shared_prefactors[q_offset];
            } else if l == 1u32 {
                degree1(
                    &mut value,
                    &mut grad,
                    &mut hess,
                    row,
                    rows,
                    stride,
                    flags,
                    shared_prefactors[1],
                    x,
                    y,
                    z,
                );
            } else {
                generic_degree(
                    &shared_prefactors,
                    &c,
                    &s,
                    &twomz,
                    &mut value,
                    &mut grad,
                    &mut hess,
                    l,
                    q_offset,
                    row,
                    rows,
                    stride,
                    flags,
                    x,
                    y,
                );
            }
        }
        sync_cube();

        // Flush.
        for k in 0..iters {
            let i = k * lanes + lane;
            if i < width && in_range {
                let slot = i * rows + row;
                let channel = l * l + i;
                sph[sample * nt + channel] = value[slot];

                if want_grad {
                    let gx = grad[slot];
                    let gy = grad[stride + slot];
                    let gz = grad[2 * stride + slot];
                    let t = x * gx + y * gy + z * gz;

                    if want_hess {
                        let hxx = hess[slot];
                        let hxy = hess[stride + slot];
                        let hxz = hess[2 * stride + slot];
                        let hyy = hess[3 * stride + slot];
                        let hyz = hess[4 * stride + slot];
                        let hzz = hess[5 * stride + slot];

                        let mut oxx = hxx;
                        let mut oxy = hxy;
                        let mut oxz = hxz;
                        let mut oyy = hyy;
                        let mut oyz = hyz;
                        let mut ozz = hzz;
                        if normalize {
                            let tx = x * hxx + y * hxy + z * hxz;
                            let ty = x * hxy + y * hyy + z * hyz;
                            let tz = x * hxz + y * hyz + z * hzz;
                            let t2 = x * tx + y * ty + z * tz;
                            let nd = F::new(0.0);
                            oxx = chain_hessian(hxx, x, x, tx, tx, gx, gx, t, t2, t, ir2);
                            oxy = chain_hessian(hxy, x, y, tx, ty, gx, gy, t, t2, nd, ir2);
                            oxz = chain_hessian(hxz, x, z, tx, tz, gx, gz, t, t2, nd, ir2);
                            oyy = chain_hessian(hyy, y, y, ty, ty, gy, gy, t, t2, t, ir2);
                            oyz = chain_hessian(hyz, y, z, ty, tz, gy, gz, t, t2, nd, ir2);
                            ozz = chain_hessian(hzz, z, z, tz, tz, gz, gz, t, t2, t, ir2);
                        }

                        let hbase = sample * 9 * nt + channel;
                        ddsph[hbase] = oxx;
                        ddsph[hbase + nt] = oxy;
                        ddsph[hbase + 2 * nt] = oxz;
                        ddsph[hbase + 3 * nt] = oxy;
                        ddsph[hbase + 4 * nt] = oyy;
                        ddsph[hbase + 5 * nt] = oyz;
                        ddsph[hbase + 6 * nt] = oxz;
                        ddsph[hbase + 7 * nt] = oyz;
                        ddsph[hbase + 8 * nt] = ozz;
                    }

                    let mut ox = gx;
                    let mut oy = gy;
                    let mut oz = gz;
                    if normalize {
                        ox = (gx - x * t) * ir;
                        oy = (gy - y * t) * ir;
                        oz = (gz - z * t) * ir;
                    }
                    let gbase = sample * 3 * nt + channel;
                    dsph[gbase] = ox;
                    dsph[gbase + nt] = oy;
                    dsph[gbase + 2 * nt] = oz;
                }
            }
        }
        sync_cube();
    }
}
