//! CubeCL-based CUDA spherical harmonics library.
//!
//! This library evaluates real spherical harmonics `Y_l^m` for all
//! `0 <= l <= L` on batches of 3-vectors, together with their Cartesian
//! gradients and Hessians, on CUDA through CubeCL or on the host through
//! rayon.
//!
//! # Architecture
//!
//! One evaluation runs in phases per work-group (tile of samples):
//! - Phase 1: Prefactor staging and the azimuthal `cos/sin(mφ)` recurrence
//! - Phase 2: Per degree, clear the channel scratch
//! - Phase 3: Per degree, the Legendre-type `Q_l^m` recurrence (hardcoded
//!   closed forms for l <= 1)
//! - Phase 4: Per degree, chain rule for normalized inputs and the
//!   coalesced flush to the outputs
//!
//! The backward pass contracts upstream gradients with `dsph`.
//!
//! # Usage
//!
//! ```ignore
//! use sph_cuda::SphericalHarmonics;
//!
//! let calc = SphericalHarmonics::<f32>::new(8, true)?;
//!
//! let points: Vec<[f32; 3]> = load_points();
//! let out = calc.compute_with_hessians(&points)?;
//!
//! // Y_3^{-1} of the first sample and its d/dz
//! let y = out.value(0, 3, -1);
//! let dy_dz = out.gradient(0, 2, 3, -1);
//! ```

pub mod backward;
pub mod calculator;
pub mod dispatch;
pub mod error;
pub mod kernels;
pub mod normalize;
pub mod prefactors;
pub mod recurrence;
pub mod runtime;
pub mod scalar;
pub mod scratch;
#[cfg(test)]
pub mod test_utils;
pub mod timing;
pub mod types;

pub use backward::vector_jacobian_product;
pub use dispatch::{evaluate_direct, evaluate_tiled, evaluate_tiled_into};
pub use error::{SphError, SphResult};
pub use prefactors::{compute_prefactors, PrefactorTable};
pub use scalar::SphScalar;
pub use scratch::{Phase, TileScratch};
pub use timing::EvaluationTiming;
pub use types::{channel_index, ntotal, EvalFlags, SphOutput, TileConfig};

// High-level API (recommended for most users)
pub use calculator::{Backend, SphConfig, SphericalHarmonics, SphericalHarmonicsBuilder};

// GPU runtime (for direct device access)
pub use runtime::{
    device_count, is_cuda_available, DeviceBuffer, DeviceContext, DeviceOutputs, DeviceScalar,
};
