//! CUDA runtime management for spherical harmonics evaluation.
//!
//! This module provides the device side of the crate:
//! - Device enumeration and an explicit per-device [`DeviceContext`]
//! - Typed device buffers with upload / download
//! - Launch wrappers for the forward and backward kernels
//!
//! # Example
//!
//! ```ignore
//! use sph_cuda::{DeviceContext, EvalFlags, PrefactorTable, TileConfig};
//!
//! let context = DeviceContext::new()?;
//! let table = PrefactorTable::<f32>::new(8);
//! let out = context.evaluate(&points, &table, EvalFlags::hessians(true), TileConfig::default())?;
//! ```

use std::marker::PhantomData;

use cubecl::client::ComputeClient;
use cubecl::cuda::{CudaDevice, CudaRuntime};
use cubecl::prelude::*;
use cubecl::server::Handle;
use tracing::debug;

use crate::backward::check_backward_shapes;
use crate::error::{SphError, SphResult};
use crate::kernels::{
    reduce_steps, spherical_harmonics_kernel, vector_jacobian_kernel, ForwardLayout,
};
use crate::prefactors::PrefactorTable;
use crate::scalar::SphScalar;
use crate::time_phase;
use crate::timing::{EvaluationTiming, TimingCollector};
use crate::types::{ntotal, EvalFlags, SphOutput, TileConfig};

/// Type alias for CUDA compute client
type CudaClient = ComputeClient<<CudaRuntime as Runtime>::Server>;

/// Shared memory available to one work-group.
pub const SHARED_MEMORY_LIMIT: usize = 48 * 1024;

/// Units per work-group.
pub const MAX_UNITS_PER_CUBE: usize = 1024;

/// Scalars the device kernels can be launched with (`f32`, `f64`).
pub trait DeviceScalar: SphScalar + Float + CubeElement {}

impl<T: SphScalar + Float + CubeElement> DeviceScalar for T {}

/// Typed device allocation.
///
/// Memory is owned by CubeCL's memory manager and released when the last
/// handle is dropped.
pub struct DeviceBuffer<F> {
    handle: Handle,
    len: usize,
    _marker: PhantomData<F>,
}

impl<F> DeviceBuffer<F> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    fn arg(&self) -> ArrayArg<'_, CudaRuntime>
    where
        F: DeviceScalar,
    {
        unsafe { ArrayArg::from_raw_parts::<F>(&self.handle, self.len.max(1), 1) }
    }
}

/// Device-resident outputs of a forward evaluation.
pub struct DeviceOutputs<F> {
    pub sph: DeviceBuffer<F>,
    pub dsph: Option<DeviceBuffer<F>>,
    pub ddsph: Option<DeviceBuffer<F>>,
}

/// CUDA device context for spherical harmonics evaluation.
///
/// Each context is bound to one device; create one per device to spread
/// work over several GPUs.
pub struct DeviceContext {
    device_id: usize,
    /// CUDA device (kept alive for context lifetime)
    #[allow(dead_code)]
    device: CudaDevice,
    client: CudaClient,
}

impl DeviceContext {
    /// Create a context on the default CUDA device.
    pub fn new() -> SphResult<Self> {
        Self::with_device_id(0)
    }

    /// Create a context on a specific CUDA device.
    pub fn with_device_id(device_id: usize) -> SphResult<Self> {
        let count = device_count()?;
        if count == 0 {
            return Err(SphError::NoDevice);
        }
        if device_id >= count {
            return Err(SphError::InvalidDeviceId {
                id: device_id,
                count,
            });
        }

        let device = CudaDevice::new(device_id);
        let client = CudaRuntime::client(&device);
        debug!(device_id, device_count = count, "CUDA device context created");

        Ok(Self {
            device_id,
            device,
            client,
        })
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    /// Get the underlying compute client.
    pub fn client(&self) -> &CudaClient {
        &self.client
    }

    /// Copy `data` to a new device buffer.
    pub fn upload<F: DeviceScalar>(&self, data: &[F]) -> DeviceBuffer<F> {
        if data.is_empty() {
            return self.alloc(0);
        }
        DeviceBuffer {
            handle: self.client.create(F::as_bytes(data)),
            len: data.len(),
            _marker: PhantomData,
        }
    }

    /// Copy a batch of 3-vectors to the device as `[N * 3]`.
    pub fn upload_points<F: DeviceScalar>(&self, xyz: &[[F; 3]]) -> DeviceBuffer<F> {
        let flat: Vec<F> = xyz.iter().flat_map(|p| p.iter().copied()).collect();
        self.upload(&flat)
    }

    /// Allocate an uninitialized buffer of `len` elements.
    pub fn alloc<F: DeviceScalar>(&self, len: usize) -> DeviceBuffer<F> {
        DeviceBuffer {
            handle: self.client.empty(len.max(1) * std::mem::size_of::<F>()),
            len,
            _marker: PhantomData,
        }
    }

    /// Copy a device buffer back to the host.
    pub fn download<F: DeviceScalar>(&self, buffer: &DeviceBuffer<F>) -> Vec<F> {
        if buffer.is_empty() {
            return Vec::new();
        }
        let bytes = self.client.read_one(buffer.handle.clone());
        F::from_bytes(&bytes)[..buffer.len].to_vec()
    }

    /// Copy a device buffer into a host slice of the same length.
    pub fn download_into<F: DeviceScalar>(&self, buffer: &DeviceBuffer<F>, dst: &mut [F]) {
        debug_assert_eq!(buffer.len(), dst.len());
        if buffer.is_empty() {
            return;
        }
        let bytes = self.client.read_one(buffer.handle.clone());
        dst.copy_from_slice(&F::from_bytes(&bytes)[..buffer.len]);
    }

    /// Allocate device outputs for `n_samples` at `l_max`.
    pub fn alloc_outputs<F: DeviceScalar>(
        &self,
        n_samples: usize,
        l_max: usize,
        flags: EvalFlags,
    ) -> DeviceOutputs<F> {
        let nt = ntotal(l_max);
        DeviceOutputs {
            sph: self.alloc(n_samples * nt),
            dsph: flags.grad().then(|| self.alloc(n_samples * 3 * nt)),
            ddsph: flags.hessian().then(|| self.alloc(n_samples * 9 * nt)),
        }
    }

    /// Shared-memory layout of a forward launch, rejected if it does not fit.
    pub fn forward_layout<F: DeviceScalar>(
        l_max: usize,
        flags: EvalFlags,
        tiling: TileConfig,
    ) -> SphResult<ForwardLayout> {
        check_launch_tiling(tiling)?;
        let required = ForwardLayout::required_bytes::<F>(l_max, flags, tiling);
        if required > SHARED_MEMORY_LIMIT {
            return Err(SphError::ScratchTooLarge {
                required,
                limit: SHARED_MEMORY_LIMIT,
            });
        }
        Ok(ForwardLayout::new(l_max, flags, tiling))
    }

    /// Evaluate samples already resident on the device.
    ///
    /// # Arguments
    /// * `xyz` - [N * 3] device samples
    /// * `n_samples` - N
    /// * `prefactors` - device copy of a [`PrefactorTable`] built for `l_max`
    /// * `outputs` - buffers from [`Self::alloc_outputs`] with matching flags
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate_on_device<F: DeviceScalar>(
        &self,
        xyz: &DeviceBuffer<F>,
        n_samples: usize,
        prefactors: &DeviceBuffer<F>,
        l_max: usize,
        flags: EvalFlags,
        tiling: TileConfig,
        outputs: &DeviceOutputs<F>,
    ) -> SphResult<()> {
        let layout = Self::forward_layout::<F>(l_max, flags, tiling)?;
        let nt = ntotal(l_max);
        let extent = LaunchExtent::new(n_samples, forward_width(flags), nt, tiling)?;
        check_device_len("xyz", xyz, n_samples * 3)?;
        check_device_len("prefactors", prefactors, (l_max + 1) * (l_max + 2))?;
        check_device_len("sph", &outputs.sph, n_samples * nt)?;

        let dummy;
        let dsph = match (&outputs.dsph, flags.grad()) {
            (Some(dsph), true) => {
                check_device_len("dsph", dsph, n_samples * 3 * nt)?;
                dsph
            }
            (None, true) => return Err(missing("dsph", n_samples * 3 * nt)),
            _ => {
                dummy = self.alloc::<F>(1);
                &dummy
            }
        };
        let dummy_hess;
        let ddsph = match (&outputs.ddsph, flags.hessian()) {
            (Some(ddsph), true) => {
                check_device_len("ddsph", ddsph, n_samples * 9 * nt)?;
                ddsph
            }
            (None, true) => return Err(missing("ddsph", n_samples * 9 * nt)),
            _ => {
                dummy_hess = self.alloc::<F>(1);
                &dummy_hess
            }
        };

        if n_samples == 0 {
            return Ok(());
        }

        debug!(
            n_samples,
            l_max,
            tiles = extent.tiles,
            rows = tiling.rows,
            lanes = tiling.lanes,
            shared_bytes = layout.bytes::<F>(),
            "Launching spherical harmonics kernel"
        );

        unsafe {
            spherical_harmonics_kernel::launch_unchecked::<F, CudaRuntime>(
                &self.client,
                CubeCount::Static(extent.tiles, 1, 1),
                CubeDim::new(tiling.lanes as u32, tiling.rows as u32, 1),
                xyz.arg(),
                prefactors.arg(),
                ScalarArg::new(extent.samples),
                ScalarArg::new(l_max as u32),
                ScalarArg::new(flags.bits()),
                outputs.sph.arg(),
                dsph.arg(),
                ddsph.arg(),
                layout.prefactor_len,
                layout.azimuthal_len,
                layout.channel_len,
                layout.grad_len,
                layout.hess_len,
            );
        }
        Ok(())
    }

    /// Evaluate `xyz` on the device and copy the results back.
    pub fn evaluate<F: DeviceScalar>(
        &self,
        xyz: &[[F; 3]],
        table: &PrefactorTable<F>,
        flags: EvalFlags,
        tiling: TileConfig,
    ) -> SphResult<SphOutput<F>> {
        self.evaluate_timed(xyz, table, flags, tiling)
            .map(|(out, _)| out)
    }

    /// [`Self::evaluate`] with a phase timing breakdown (zero without `profiling`).
    pub fn evaluate_timed<F: DeviceScalar>(
        &self,
        xyz: &[[F; 3]],
        table: &PrefactorTable<F>,
        flags: EvalFlags,
        tiling: TileConfig,
    ) -> SphResult<(SphOutput<F>, EvaluationTiming)> {
        let mut out = SphOutput::zeros(xyz.len(), table.l_max(), flags);
        let timing = self.evaluate_into(xyz, table, flags, tiling, &mut out)?;
        Ok((out, timing))
    }

    /// Evaluate `xyz` on the device and download into caller-provided buffers.
    ///
    /// `out` is checked against the layout for `xyz.len()` samples at
    /// `table.l_max()` before anything is uploaded.
    pub fn evaluate_into<F: DeviceScalar>(
        &self,
        xyz: &[[F; 3]],
        table: &PrefactorTable<F>,
        flags: EvalFlags,
        tiling: TileConfig,
        out: &mut SphOutput<F>,
    ) -> SphResult<EvaluationTiming> {
        let l_max = table.l_max();
        let n_samples = xyz.len();
        Self::forward_layout::<F>(l_max, flags, tiling)?;
        out.check_shape(n_samples, l_max, flags)?;
        out.n_samples = n_samples;

        let mut collector = TimingCollector::new();
        collector.start();

        if n_samples == 0 {
            return Ok(collector.finish());
        }

        let (xyz_gpu, prefactors_gpu) = time_phase!(collector, "upload", {
            (self.upload_points(xyz), self.upload(table.as_slice()))
        });
        let outputs = self.alloc_outputs::<F>(n_samples, l_max, flags);

        time_phase!(collector, "kernel", {
            self.evaluate_on_device(
                &xyz_gpu,
                n_samples,
                &prefactors_gpu,
                l_max,
                flags,
                tiling,
                &outputs,
            )?;
            cubecl::future::block_on(self.client.sync());
        });

        time_phase!(collector, "download", {
            self.download_into(&outputs.sph, &mut out.sph);
            if let (Some(src), Some(dst)) = (&outputs.dsph, out.dsph.as_deref_mut()) {
                self.download_into(src, dst);
            }
            if let (Some(src), Some(dst)) = (&outputs.ddsph, out.ddsph.as_deref_mut()) {
                self.download_into(src, dst);
            }
        });

        let timing = collector.finish();
        debug!(
            upload_ms = timing.upload_ms,
            kernel_ms = timing.kernel_ms,
            download_ms = timing.download_ms,
            "Spherical harmonics evaluation finished"
        );
        Ok(timing)
    }

    /// Vector-Jacobian product on the device.
    ///
    /// # Arguments
    /// * `dsph` - [N * 3 * nt] gradients from a forward pass
    /// * `sph_grad` - [N * nt] upstream gradients
    ///
    /// # Returns
    /// `xyz_grad` with one 3-vector per sample.
    pub fn backward<F: DeviceScalar>(
        &self,
        dsph: &[F],
        sph_grad: &[F],
        l_max: usize,
        tiling: TileConfig,
    ) -> SphResult<Vec<[F; 3]>> {
        check_launch_tiling(tiling)?;
        let n_samples = check_backward_shapes(dsph, sph_grad, l_max)?;
        if n_samples == 0 {
            return Ok(Vec::new());
        }
        let nt = ntotal(l_max);
        let extent = LaunchExtent::new(n_samples, 3, nt, tiling)?;
        let required = tiling.rows * tiling.lanes * std::mem::size_of::<F>();
        if required > SHARED_MEMORY_LIMIT {
            return Err(SphError::ScratchTooLarge {
                required,
                limit: SHARED_MEMORY_LIMIT,
            });
        }

        let dsph_gpu = self.upload(dsph);
        let sph_grad_gpu = self.upload(sph_grad);
        let xyz_grad_gpu = self.alloc::<F>(n_samples * 3);

        debug!(n_samples, l_max, tiles = extent.tiles, "Launching vector-Jacobian kernel");
        unsafe {
            vector_jacobian_kernel::launch_unchecked::<F, CudaRuntime>(
                &self.client,
                CubeCount::Static(extent.tiles, 3, 1),
                CubeDim::new(tiling.lanes as u32, tiling.rows as u32, 1),
                dsph_gpu.arg(),
                sph_grad_gpu.arg(),
                ScalarArg::new(extent.samples),
                ScalarArg::new(nt as u32),
                ScalarArg::new(reduce_steps(tiling.lanes)),
                xyz_grad_gpu.arg(),
                (tiling.rows * tiling.lanes) as u32,
            );
        }

        let flat = self.download(&xyz_grad_gpu);
        Ok(flat.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())
    }
}

/// Sample count and cube count of a launch, both as kernel-side `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchExtent {
    pub samples: u32,
    pub tiles: u32,
}

impl LaunchExtent {
    /// Reject batches whose largest buffer (`n_samples * width * nt`
    /// elements) or padded sample index does not fit the kernels' `u32`
    /// index arithmetic.
    pub fn new(n_samples: usize, width: usize, nt: usize, tiling: TileConfig) -> SphResult<Self> {
        let limit = u32::MAX as usize;
        let elements = n_samples
            .checked_mul(width)
            .and_then(|e| e.checked_mul(nt))
            .unwrap_or(usize::MAX);
        let tiles = tiling.num_tiles(n_samples);
        let padded = tiles.checked_mul(tiling.rows).unwrap_or(usize::MAX);
        let too_large = || SphError::BatchTooLarge {
            elements: elements.max(padded),
            limit,
        };
        if elements > limit || padded > limit {
            return Err(too_large());
        }
        Ok(Self {
            samples: u32::try_from(n_samples).map_err(|_| too_large())?,
            tiles: u32::try_from(tiles).map_err(|_| too_large())?,
        })
    }
}

/// Elements per sample of the widest forward output.
fn forward_width(flags: EvalFlags) -> usize {
    if flags.hessian() {
        9
    } else if flags.grad() {
        3
    } else {
        1
    }
}

fn check_launch_tiling(tiling: TileConfig) -> SphResult<()> {
    tiling.validate()?;
    if tiling.rows * tiling.lanes > MAX_UNITS_PER_CUBE {
        return Err(SphError::InvalidTiling {
            rows: tiling.rows,
            lanes: tiling.lanes,
        });
    }
    Ok(())
}

fn check_device_len<F>(
    name: &'static str,
    buffer: &DeviceBuffer<F>,
    expected: usize,
) -> SphResult<()> {
    if buffer.len() != expected {
        return Err(SphError::ShapeMismatch {
            name,
            expected,
            actual: buffer.len(),
        });
    }
    Ok(())
}

fn missing(name: &'static str, expected: usize) -> SphError {
    SphError::ShapeMismatch {
        name,
        expected,
        actual: 0,
    }
}

/// Number of CUDA devices visible to the driver.
///
/// Returns [`SphError::NoDevice`] when the driver library cannot be loaded.
pub fn device_count() -> SphResult<usize> {
    match std::panic::catch_unwind(cudarc::driver::CudaContext::device_count) {
        Ok(count) => Ok(usize::try_from(count?).unwrap_or(0)),
        Err(_) => Err(SphError::NoDevice),
    }
}

/// Check if CUDA is available on this system.
pub fn is_cuda_available() -> bool {
    if !matches!(device_count(), Ok(count) if count > 0) {
        return false;
    }
    std::panic::catch_unwind(|| {
        let device = CudaDevice::new(0);
        let _client = CudaRuntime::client(&device);
    })
    .is_ok()
}
