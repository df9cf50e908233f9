//! Reverse-mode pass: contract upstream gradients with `dsph`.
//!
//! For upstream gradients `sph_grad [N × nt]` the gradient with respect to
//! the input coordinates is
//!
//! ```text
//! xyz_grad[i][a] = Σ_c dsph[i][a][c] · sph_grad[i][c]
//! ```

use rayon::prelude::*;

use crate::error::{SphError, SphResult};
use crate::scalar::SphScalar;
use crate::types::ntotal;

/// Check `dsph` / `sph_grad` against each other and return the sample count.
pub fn check_backward_shapes<T>(dsph: &[T], sph_grad: &[T], l_max: usize) -> SphResult<usize> {
    let nt = ntotal(l_max);
    if sph_grad.len() % nt != 0 {
        return Err(SphError::ShapeMismatch {
            name: "sph_grad",
            expected: sph_grad.len().div_ceil(nt) * nt,
            actual: sph_grad.len(),
        });
    }
    let n_samples = sph_grad.len() / nt;
    if dsph.len() != n_samples * 3 * nt {
        return Err(SphError::ShapeMismatch {
            name: "dsph",
            expected: n_samples * 3 * nt,
            actual: dsph.len(),
        });
    }
    Ok(n_samples)
}

/// Vector-Jacobian product on the host, parallel over samples.
pub fn vector_jacobian_product<T: SphScalar>(
    dsph: &[T],
    sph_grad: &[T],
    l_max: usize,
) -> SphResult<Vec<[T; 3]>> {
    check_backward_shapes(dsph, sph_grad, l_max)?;
    let nt = ntotal(l_max);

    Ok(dsph
        .par_chunks(3 * nt)
        .zip(sph_grad.par_chunks(nt))
        .map(|(d, g)| {
            std::array::from_fn(|a| {
                d[a * nt..(a + 1) * nt]
                    .iter()
                    .zip(g)
                    .fold(T::zero(), |acc, (d, g)| acc + *d * *g)
            })
        })
        .collect())
}
