//! High-level spherical harmonics calculator.
//!
//! This module provides the main entry point [`SphericalHarmonics`]. It owns
//! the prefactor table for one maximum degree and routes evaluations to the
//! tiled CPU backend or to a CUDA device.
//!
//! # Example
//!
//! ```ignore
//! use sph_cuda::{Backend, SphericalHarmonics};
//!
//! let calc = SphericalHarmonics::<f64>::builder()
//!     .l_max(6)
//!     .normalize(true)
//!     .backend(Backend::Auto)
//!     .build()?;
//!
//! let out = calc.compute_with_gradients(&points)?;
//! let y = out.value(0, 2, -1);
//! ```

use std::marker::PhantomData;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backward::vector_jacobian_product;
use crate::dispatch::{check_table, evaluate_tiled_into};
use crate::error::SphError;
use crate::prefactors::PrefactorTable;
use crate::runtime::{is_cuda_available, DeviceContext, DeviceScalar};
use crate::types::{EvalFlags, SphOutput, TileConfig};

/// Where evaluations run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Backend {
    /// Tiled host backend on the rayon thread pool.
    Cpu,
    /// CUDA device; construction fails without one.
    Cuda,
    /// CUDA when a device is usable, otherwise CPU.
    #[default]
    Auto,
}

/// Configuration for [`SphericalHarmonics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SphConfig {
    /// Maximum degree L (inclusive).
    pub l_max: usize,

    /// Normalize inputs to the unit sphere before evaluation.
    /// When false the outputs are solid harmonics `r^l Y_l^m`.
    pub normalize: bool,

    pub backend: Backend,

    /// CUDA device used by the `Cuda` and `Auto` backends.
    pub device_id: usize,

    /// Samples per work-group and lanes per sample.
    pub tiling: TileConfig,
}

impl Default for SphConfig {
    fn default() -> Self {
        Self {
            l_max: 4,
            normalize: true,
            backend: Backend::Auto,
            device_id: 0,
            tiling: TileConfig::default(),
        }
    }
}

/// Builder for [`SphericalHarmonics`].
#[derive(Debug, Clone)]
pub struct SphericalHarmonicsBuilder<T> {
    config: SphConfig,
    _scalar: PhantomData<T>,
}

impl<T: DeviceScalar> SphericalHarmonicsBuilder<T> {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: SphConfig::default(),
            _scalar: PhantomData,
        }
    }

    /// Set the maximum degree.
    pub fn l_max(mut self, l_max: usize) -> Self {
        self.config.l_max = l_max;
        self
    }

    /// Enable or disable input normalization.
    pub fn normalize(mut self, normalize: bool) -> Self {
        self.config.normalize = normalize;
        self
    }

    /// Select the evaluation backend.
    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    /// Set the CUDA device id.
    pub fn device_id(mut self, device_id: usize) -> Self {
        self.config.device_id = device_id;
        self
    }

    /// Set the work-group tiling.
    pub fn tiling(mut self, rows: usize, lanes: usize) -> Self {
        self.config.tiling = TileConfig { rows, lanes };
        self
    }

    /// Build the calculator.
    pub fn build(self) -> Result<SphericalHarmonics<T>> {
        SphericalHarmonics::with_config(self.config)
    }
}

impl<T: DeviceScalar> Default for SphericalHarmonicsBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Spherical harmonics calculator for a fixed maximum degree.
///
/// Outputs are flat row-major arrays (see [`SphOutput`]): channel
/// `l*l + l + m`, gradient axis-major per sample, Hessian as a full
/// symmetric 3×3 block per channel.
pub struct SphericalHarmonics<T: DeviceScalar> {
    config: SphConfig,
    table: PrefactorTable<T>,
    /// Device context (None when running on the CPU backend).
    device: Option<DeviceContext>,
}

impl<T: DeviceScalar> SphericalHarmonics<T> {
    /// Create a calculator with default settings for the given degree.
    pub fn new(l_max: usize, normalize: bool) -> Result<Self> {
        let config = SphConfig {
            l_max,
            normalize,
            ..Default::default()
        };
        Self::with_config(config)
    }

    /// Create a calculator with custom configuration.
    pub fn with_config(config: SphConfig) -> Result<Self> {
        config
            .tiling
            .validate()
            .context("Invalid work-group tiling")?;

        let device = match config.backend {
            Backend::Cpu => None,
            Backend::Cuda => {
                if !is_cuda_available() {
                    bail!(SphError::CudaUnavailable);
                }
                let context = DeviceContext::with_device_id(config.device_id)
                    .with_context(|| format!("Failed to open CUDA device {}", config.device_id))?;
                Some(context)
            }
            Backend::Auto => {
                if is_cuda_available() {
                    match DeviceContext::with_device_id(config.device_id) {
                        Ok(context) => Some(context),
                        Err(e) => {
                            warn!(
                                device_id = config.device_id,
                                error = %e,
                                "Failed to initialize CUDA device, falling back to CPU"
                            );
                            None
                        }
                    }
                } else {
                    None
                }
            }
        };

        match &device {
            Some(device) => {
                debug!(device_id = device.device_id(), l_max = config.l_max, "Using CUDA backend")
            }
            None => debug!(l_max = config.l_max, "Using CPU backend"),
        }

        Ok(Self {
            table: PrefactorTable::new(config.l_max),
            config,
            device,
        })
    }

    /// Create a builder for configuring the calculator.
    pub fn builder() -> SphericalHarmonicsBuilder<T> {
        SphericalHarmonicsBuilder::new()
    }

    /// Get the current configuration.
    pub fn config(&self) -> &SphConfig {
        &self.config
    }

    pub fn l_max(&self) -> usize {
        self.config.l_max
    }

    pub fn prefactors(&self) -> &PrefactorTable<T> {
        &self.table
    }

    /// Whether evaluations run on a CUDA device.
    pub fn is_gpu_active(&self) -> bool {
        self.device.is_some()
    }

    /// Values only.
    pub fn compute(&self, xyz: &[[T; 3]]) -> Result<SphOutput<T>> {
        self.evaluate(xyz, false, false)
    }

    /// Values and gradients.
    pub fn compute_with_gradients(&self, xyz: &[[T; 3]]) -> Result<SphOutput<T>> {
        self.evaluate(xyz, true, false)
    }

    /// Values, gradients and Hessians.
    pub fn compute_with_hessians(&self, xyz: &[[T; 3]]) -> Result<SphOutput<T>> {
        self.evaluate(xyz, true, true)
    }

    /// Evaluate a batch of 3-vectors.
    ///
    /// `requires_hessian` implies `requires_grad`.
    pub fn evaluate(
        &self,
        xyz: &[[T; 3]],
        requires_grad: bool,
        requires_hessian: bool,
    ) -> Result<SphOutput<T>> {
        let flags = self.flags(requires_grad, requires_hessian);
        let mut out = SphOutput::zeros(xyz.len(), self.config.l_max, flags);
        self.evaluate_with(xyz, flags, &mut out)?;
        Ok(out)
    }

    /// Evaluate into pre-sized output buffers.
    ///
    /// The derivative orders produced follow which buffers `out` carries.
    /// Both backends write into the existing buffers.
    pub fn evaluate_into(&self, xyz: &[[T; 3]], out: &mut SphOutput<T>) -> Result<()> {
        let requested = out.flags();
        let flags = self.flags(requested.requires_grad, requested.requires_hessian);
        out.check_shape(xyz.len(), self.config.l_max, flags)
            .context("Output buffers do not match the evaluation")?;
        self.evaluate_with(xyz, flags, out)
    }

    fn evaluate_with(&self, xyz: &[[T; 3]], flags: EvalFlags, out: &mut SphOutput<T>) -> Result<()> {
        let tiling = self.config.tiling;
        let Some(device) = &self.device else {
            return evaluate_tiled_into(xyz, &self.table, flags, tiling, out)
                .context("CPU spherical harmonics evaluation failed");
        };
        match device.evaluate_into(xyz, &self.table, flags, tiling, out) {
            Ok(_timing) => Ok(()),
            Err(e @ (SphError::ScratchTooLarge { .. } | SphError::BatchTooLarge { .. }))
                if self.config.backend == Backend::Auto =>
            {
                warn!(error = %e, "Launch exceeds device limits, evaluating on CPU instead");
                evaluate_tiled_into(xyz, &self.table, flags, tiling, out)
                    .context("CPU spherical harmonics evaluation failed")
            }
            Err(e) => Err(e).context("CUDA spherical harmonics evaluation failed"),
        }
    }

    /// Gradient of a scalar loss w.r.t. the inputs given its gradient w.r.t. `sph`.
    ///
    /// # Arguments
    /// * `dsph` - [N * 3 * nt] gradients from a forward pass of this calculator
    /// * `sph_grad` - [N * nt] upstream gradients
    pub fn backward(&self, dsph: &[T], sph_grad: &[T]) -> Result<Vec<[T; 3]>> {
        check_table(&self.table, self.config.l_max)?;
        match &self.device {
            Some(device) => device
                .backward(dsph, sph_grad, self.config.l_max, self.config.tiling)
                .context("CUDA vector-Jacobian product failed"),
            None => vector_jacobian_product(dsph, sph_grad, self.config.l_max)
                .context("CPU vector-Jacobian product failed"),
        }
    }

    fn flags(&self, requires_grad: bool, requires_hessian: bool) -> EvalFlags {
        EvalFlags {
            requires_grad: requires_grad || requires_hessian,
            requires_hessian,
            normalize: self.config.normalize,
        }
    }
}
