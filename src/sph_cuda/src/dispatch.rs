//! Host dispatch: split a batch into work-group tiles and run them in parallel.
//!
//! Tile `t` covers samples `t·rows .. min((t+1)·rows, N)`. Each rayon worker
//! allocates one [`TileScratch`] and reuses it for every tile it picks up.
//! Every output cell has exactly one writer, so tiles need no synchronization.

use rayon::prelude::*;
use tracing::debug;

use crate::error::{SphError, SphResult};
use crate::prefactors::PrefactorTable;
use crate::recurrence::{evaluate_sample, SampleWorkspace};
use crate::scalar::SphScalar;
use crate::scratch::TileScratch;
use crate::types::{ntotal, split_rows, EvalFlags, SphOutput, TileConfig};

/// Evaluate `xyz` with the tiled host backend into a freshly sized output.
pub fn evaluate_tiled<T: SphScalar>(
    xyz: &[[T; 3]],
    table: &PrefactorTable<T>,
    flags: EvalFlags,
    tiling: TileConfig,
) -> SphResult<SphOutput<T>> {
    let mut out = SphOutput::zeros(xyz.len(), table.l_max(), flags);
    evaluate_tiled_into(xyz, table, flags, tiling, &mut out)?;
    Ok(out)
}

/// Evaluate `xyz` into caller-provided buffers.
///
/// The buffers must match the layout for `xyz.len()` samples at
/// `table.l_max()`; they are checked before any work is done.
pub fn evaluate_tiled_into<T: SphScalar>(
    xyz: &[[T; 3]],
    table: &PrefactorTable<T>,
    flags: EvalFlags,
    tiling: TileConfig,
    out: &mut SphOutput<T>,
) -> SphResult<()> {
    tiling.validate()?;
    let l_max = table.l_max();
    out.check_shape(xyz.len(), l_max, flags)?;
    out.n_samples = xyz.len();
    if xyz.is_empty() {
        return Ok(());
    }

    let nt = ntotal(l_max);
    let tiles = split_rows(
        &mut out.sph,
        out.dsph.as_deref_mut().filter(|_| flags.grad()),
        out.ddsph.as_deref_mut().filter(|_| flags.hessian()),
        nt,
        tiling.rows,
    );
    debug!(
        n_samples = xyz.len(),
        l_max,
        tiles = tiles.len(),
        rows = tiling.rows,
        lanes = tiling.lanes,
        "Evaluating spherical harmonics on host"
    );

    tiles.into_par_iter().zip(xyz.par_chunks(tiling.rows)).for_each_init(
        || TileScratch::new(l_max, tiling, flags),
        |scratch, (mut tile, samples)| scratch.evaluate_tile(samples, table, &mut tile),
    );
    Ok(())
}

/// Evaluate each sample independently, without tiling.
///
/// Slower than [`evaluate_tiled`]; used as the reference implementation.
pub fn evaluate_direct<T: SphScalar>(
    xyz: &[[T; 3]],
    table: &PrefactorTable<T>,
    flags: EvalFlags,
) -> SphOutput<T> {
    let l_max = table.l_max();
    let nt = ntotal(l_max);
    let mut out = SphOutput::zeros(xyz.len(), l_max, flags);
    if xyz.is_empty() {
        return out;
    }

    let samples = split_rows(
        &mut out.sph,
        out.dsph.as_deref_mut(),
        out.ddsph.as_deref_mut(),
        nt,
        1,
    );
    samples.into_par_iter().zip(xyz.par_iter()).for_each_init(
        || SampleWorkspace::new(l_max),
        |workspace, (mut rows, point)| {
            let mut sample = rows.sample_mut(0, nt);
            evaluate_sample(*point, table, flags, workspace, &mut sample);
        },
    );
    out
}

/// Reject prefactor tables built for a different degree.
pub fn check_table<T>(table: &PrefactorTable<T>, l_max: usize) -> SphResult<()> {
    if table.l_max() != l_max {
        return Err(SphError::DegreeMismatch {
            expected: l_max,
            actual: table.l_max(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{central_difference, legendre, random_points, sphere_points};
    use approx::assert_relative_eq;

    #[test]
    fn test_output_shapes() {
        let xyz = random_points::<f64>(13, 1);
        for l_max in [0, 1, 2, 5] {
            let table = PrefactorTable::new(l_max);
            let nt = ntotal(l_max);

            let out = evaluate_tiled(&xyz, &table, EvalFlags::values(false), TileConfig::default())
                .unwrap();
            assert_eq!(out.sph.len(), 13 * nt);
            assert!(out.dsph.is_none());

            let out = evaluate_tiled(&xyz, &table, EvalFlags::hessians(true), TileConfig::default())
                .unwrap();
            assert_eq!(out.dsph.as_ref().unwrap().len(), 13 * 3 * nt);
            assert_eq!(out.ddsph.as_ref().unwrap().len(), 13 * 9 * nt);
        }
    }

    #[test]
    fn test_tiled_matches_direct_exactly() {
        let xyz = random_points::<f64>(29, 7);
        let table = PrefactorTable::new(7);
        for normalize in [false, true] {
            let flags = EvalFlags::hessians(normalize);
            let direct = evaluate_direct(&xyz, &table, flags);
            for tiling in [
                TileConfig::default(),
                TileConfig::new(3, 2).unwrap(),
                TileConfig::new(1, 1).unwrap(),
                TileConfig::new(32, 16).unwrap(),
            ] {
                let tiled = evaluate_tiled(&xyz, &table, flags, tiling).unwrap();
                assert_eq!(tiled, direct, "tiling {tiling:?}, normalize {normalize}");
            }
        }
    }

    #[test]
    fn test_samples_are_independent() {
        let xyz = random_points::<f64>(20, 3);
        let table = PrefactorTable::new(4);
        let flags = EvalFlags::hessians(true);
        let batch = evaluate_tiled(&xyz, &table, flags, TileConfig::default()).unwrap();

        let single = evaluate_tiled(&xyz[11..12], &table, flags, TileConfig::default()).unwrap();
        let nt = ntotal(4);
        assert_eq!(batch.sample(11), single.sample(0));
        assert_eq!(
            &batch.ddsph.as_ref().unwrap()[11 * 9 * nt..12 * 9 * nt],
            &single.ddsph.as_ref().unwrap()[..]
        );
    }

    #[test]
    fn test_low_degrees_identical_across_l_max() {
        let xyz = random_points::<f32>(17, 11);
        let flags = EvalFlags::hessians(true);
        let reference =
            evaluate_tiled(&xyz, &PrefactorTable::new(2), flags, TileConfig::default()).unwrap();

        for l_max in [0, 1, 3, 9] {
            let other =
                evaluate_tiled(&xyz, &PrefactorTable::new(l_max), flags, TileConfig::default())
                    .unwrap();
            for i in 0..xyz.len() {
                for l in 0..=l_max.min(2) {
                    for m in -(l as i64)..=(l as i64) {
                        assert_eq!(reference.value(i, l, m), other.value(i, l, m), "L={l_max}");
                        for a in 0..3 {
                            assert_eq!(
                                reference.gradient(i, a, l, m),
                                other.gradient(i, a, l, m),
                                "L={l_max}"
                            );
                            for b in 0..3 {
                                assert_eq!(
                                    reference.hessian(i, a, b, l, m),
                                    other.hessian(i, a, b, l, m),
                                    "L={l_max}"
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_normalizing_unit_vectors_is_noop() {
        let xyz = sphere_points::<f64>(40);
        let table = PrefactorTable::new(8);
        let raw = evaluate_tiled(&xyz, &table, EvalFlags::values(false), TileConfig::default())
            .unwrap();
        let normalized =
            evaluate_tiled(&xyz, &table, EvalFlags::values(true), TileConfig::default()).unwrap();
        for (a, b) in raw.sph.iter().zip(&normalized.sph) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_addition_theorem() {
        let xyz = random_points::<f64>(10, 5);
        let l_max = 10;
        let out = evaluate_tiled(
            &xyz,
            &PrefactorTable::new(l_max),
            EvalFlags::values(true),
            TileConfig::default(),
        )
        .unwrap();
        for i in 0..xyz.len() {
            for l in 0..=l_max {
                let sum: f64 = (-(l as i64)..=(l as i64))
                    .map(|m| out.value(i, l, m).powi(2))
                    .sum();
                let expected = (2 * l + 1) as f64 / (4.0 * std::f64::consts::PI);
                assert_relative_eq!(sum, expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_zero_vector_normalized() {
        let table = PrefactorTable::<f64>::new(4);
        let out = evaluate_tiled(
            &[[0.0; 3]],
            &table,
            EvalFlags::hessians(true),
            TileConfig::default(),
        )
        .unwrap();
        assert_relative_eq!(out.sph[0], crate::recurrence::hardcoded::Y00);
        assert!(out.sph[1..].iter().all(|v| *v == 0.0));
        assert!(out.dsph.unwrap().iter().all(|v| v.is_finite() && *v == 0.0));
        assert!(out.ddsph.unwrap().iter().all(|v| v.is_finite() && *v == 0.0));
    }

    #[test]
    fn test_rejects_mis_sized_buffers() {
        let xyz = random_points::<f64>(4, 2);
        let table = PrefactorTable::new(3);
        let flags = EvalFlags::gradients(false);

        let mut out = SphOutput::zeros(5, 3, flags);
        let err = evaluate_tiled_into(&xyz, &table, flags, TileConfig::default(), &mut out);
        assert!(matches!(err, Err(SphError::ShapeMismatch { name: "sph", .. })));

        let mut out = SphOutput::zeros(4, 3, EvalFlags::values(false));
        let err = evaluate_tiled_into(&xyz, &table, flags, TileConfig::default(), &mut out);
        assert!(matches!(err, Err(SphError::ShapeMismatch { name: "dsph", .. })));

        let mut out = SphOutput::zeros(4, 2, flags);
        let err = evaluate_tiled_into(&xyz, &table, flags, TileConfig::default(), &mut out);
        assert!(matches!(err, Err(SphError::DegreeMismatch { .. })));
    }

    #[test]
    fn test_empty_batch() {
        let table = PrefactorTable::<f32>::new(3);
        let out = evaluate_tiled(&[], &table, EvalFlags::hessians(false), TileConfig::default())
            .unwrap();
        assert!(out.sph.is_empty());
        assert_eq!(out.n_samples, 0);
    }

    #[test]
    fn test_check_table() {
        let table = PrefactorTable::<f32>::new(3);
        assert!(check_table(&table, 3).is_ok());
        assert!(check_table(&table, 4).is_err());
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let l_max = 6;
        let table = PrefactorTable::new(l_max);
        let nt = ntotal(l_max);
        let h = 1e-6;
        for normalize in [false, true] {
            let values = |p: [f64; 3]| evaluate_direct(&[p], &table, EvalFlags::values(normalize)).sph;
            for point in random_points::<f64>(6, 21) {
                let out = evaluate_direct(&[point], &table, EvalFlags::gradients(normalize));
                for axis in 0..3 {
                    let numeric = central_difference(values, point, axis, h);
                    for c in 0..nt {
                        let analytic = out.dsph.as_ref().unwrap()[axis * nt + c];
                        assert_relative_eq!(analytic, numeric[c], epsilon = 1e-7, max_relative = 1e-6);
                    }
                }
            }
        }
    }

    #[test]
    fn test_hessians_match_finite_differences() {
        let l_max = 6;
        let table = PrefactorTable::new(l_max);
        let nt = ntotal(l_max);
        let h = 1e-6;
        for normalize in [false, true] {
            let gradients = |p: [f64; 3]| {
                evaluate_direct(&[p], &table, EvalFlags::gradients(normalize))
                    .dsph
                    .unwrap()
            };
            for point in random_points::<f64>(6, 22) {
                let out = evaluate_direct(&[point], &table, EvalFlags::hessians(normalize));
                for b in 0..3 {
                    // numeric[a * nt + c] = d²Y_c / dx_a dx_b
                    let numeric = central_difference(gradients, point, b, h);
                    for a in 0..3 {
                        for c in 0..nt {
                            let analytic = out.ddsph.as_ref().unwrap()[(a * 3 + b) * nt + c];
                            assert_relative_eq!(
                                analytic,
                                numeric[a * nt + c],
                                epsilon = 1e-6,
                                max_relative = 1e-5
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_hessian_symmetry() {
        let l_max = 8;
        let xyz = random_points::<f64>(12, 30);
        for normalize in [false, true] {
            let out = evaluate_tiled(
                &xyz,
                &PrefactorTable::new(l_max),
                EvalFlags::hessians(normalize),
                TileConfig::default(),
            )
            .unwrap();
            for i in 0..xyz.len() {
                for l in 0..=l_max {
                    for m in -(l as i64)..=(l as i64) {
                        for a in 0..3 {
                            for b in 0..3 {
                                assert_eq!(out.hessian(i, a, b, l, m), out.hessian(i, b, a, l, m));
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_on_axis_values() {
        let l_max = 9;
        let table = PrefactorTable::new(l_max);
        let xyz: Vec<[f64; 3]> = [0.7, -0.7, 1.3, -1.3, 1.0, -1.0]
            .iter()
            .map(|&z| [0.0, 0.0, z])
            .collect();
        let out = evaluate_tiled(&xyz, &table, EvalFlags::gradients(false), TileConfig::default())
            .unwrap();

        for (i, point) in xyz.iter().enumerate() {
            let z = point[2];
            for l in 0..=l_max {
                let scale = ((2 * l + 1) as f64 / (4.0 * std::f64::consts::PI)).sqrt();
                let expected = scale * legendre(l, z.signum()) * z.abs().powi(l as i32);
                assert_relative_eq!(out.value(i, l, 0), expected, epsilon = 1e-12, max_relative = 1e-12);
                for m in 1..=(l as i64) {
                    assert_eq!(out.value(i, l, m), 0.0);
                    assert_eq!(out.value(i, l, -m), 0.0);
                }
            }
        }
    }
}
