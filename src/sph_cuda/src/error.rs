//! Error types for spherical harmonics evaluation.
//!
//! The device and kernel layers report failures through [`SphError`]. The
//! high-level [`crate::calculator`] API wraps these in `anyhow::Error`; the
//! original variant can be recovered with `downcast_ref::<SphError>()`.

use thiserror::Error;

/// Errors from device setup, shape validation and kernel launches.
#[derive(Error, Debug)]
pub enum SphError {
    #[error("No CUDA device found")]
    NoDevice,

    #[error("CUDA backend requested but no usable CUDA device is available")]
    CudaUnavailable,

    #[error("Device id {id} out of range ({count} device(s) present)")]
    InvalidDeviceId { id: usize, count: usize },

    #[error("CUDA driver error: {0}")]
    Driver(#[from] cudarc::driver::DriverError),

    #[error("Invalid tiling: {rows} rows x {lanes} lanes (both must be non-zero, lanes a power of two)")]
    InvalidTiling { rows: usize, lanes: usize },

    #[error("Work-group scratch needs {required} bytes, limit is {limit} bytes")]
    ScratchTooLarge { required: usize, limit: usize },

    #[error("Batch needs {elements} elements in one device buffer, 32-bit indexing allows {limit}")]
    BatchTooLarge { elements: usize, limit: usize },

    #[error("Shape mismatch for `{name}`: expected {expected} elements, got {actual}")]
    ShapeMismatch {
        name: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Degree mismatch: expected l_max={expected}, got l_max={actual}")]
    DegreeMismatch { expected: usize, actual: usize },
}

/// Result alias for the device and kernel layers.
pub type SphResult<T> = std::result::Result<T, SphError>;
