//! CUDA device runtime
//!
//! Owns a CUDA context and its default stream, and implements
//! [`DeviceRuntime`] on top of them: allocation and transfers through
//! cudarc, module builds through [`NvccCompiler`].

use crate::buffer::CudaBuffer;
use crate::compiler::NvccCompiler;
use crate::kernel::{CudaKernel, CudaModuleHandle};
use blockwise::runtime::{DeviceLimits, DeviceRuntime, LaunchArg, LaunchShape, RuntimeError};
use thiserror::Error;

#[cfg(feature = "cuda-runtime")]
use crate::kernel::CudaKernelError;
#[cfg(feature = "cuda-runtime")]
use cudarc::driver::{CudaContext, CudaStream, DriverError, sys::CUdevice_attribute};
#[cfg(feature = "cuda-runtime")]
use cudarc::nvrtc::Ptx;
#[cfg(feature = "cuda-runtime")]
use std::sync::Arc;

/// CUDA runtime bound to one device
#[cfg(feature = "cuda-runtime")]
pub struct CudaRuntime {
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    compiler: NvccCompiler,
    limits: DeviceLimits,
    device_index: usize,
}

/// Stub CUDA runtime (when cuda-runtime feature is disabled)
#[cfg(not(feature = "cuda-runtime"))]
pub struct CudaRuntime {
    compiler: NvccCompiler,
    limits: DeviceLimits,
    device_index: usize,
}

#[cfg(feature = "cuda-runtime")]
impl CudaRuntime {
    /// Create a runtime on device `device_index`
    ///
    /// The nvcc configuration is read from the environment; see
    /// [`NvccCompiler::from_env`].
    pub fn new(device_index: usize) -> Result<Self, CudaDeviceError> {
        let context = CudaContext::new(device_index).map_err(|e| {
            CudaDeviceError::Initialization(format!(
                "Failed to create CUDA context for device {}: {}",
                device_index, e
            ))
        })?;
        let stream = context.default_stream();
        let limits = query_limits(&context);
        log::info!("CUDA device {} initialized ({:?})", device_index, limits);

        Ok(Self {
            context,
            stream,
            compiler: NvccCompiler::from_env(),
            limits,
            device_index,
        })
    }

    /// Check if a device and nvcc are both usable
    pub fn is_available() -> bool {
        NvccCompiler::from_env().is_available() && CudaContext::new(0).is_ok()
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.context
    }

    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }
}

#[cfg(feature = "cuda-runtime")]
fn query_limits(context: &Arc<CudaContext>) -> DeviceLimits {
    let defaults = DeviceLimits::default();
    let attr = |a: CUdevice_attribute, fallback: u32| {
        context
            .attribute(a)
            .ok()
            .and_then(|v| u32::try_from(v).ok())
            .filter(|&v| v > 0)
            .unwrap_or(fallback)
    };
    DeviceLimits {
        warp_size: attr(
            CUdevice_attribute::CU_DEVICE_ATTRIBUTE_WARP_SIZE,
            defaults.warp_size,
        ),
        max_threads_per_group: attr(
            CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
            defaults.max_threads_per_group,
        ),
        // y shares the x limit in the splay, so take the smaller of the two
        max_grid_dim: attr(
            CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_X,
            defaults.max_grid_dim,
        )
        .min(attr(
            CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Y,
            defaults.max_grid_dim,
        )),
    }
}

#[cfg(not(feature = "cuda-runtime"))]
impl CudaRuntime {
    /// Create a runtime (stub - always fails without cuda-runtime feature)
    pub fn new(_device_index: usize) -> Result<Self, CudaDeviceError> {
        Err(CudaDeviceError::Initialization(
            "CUDA runtime not available. Rebuild with --features cuda-runtime".to_string(),
        ))
    }

    pub fn is_available() -> bool {
        false
    }
}

impl CudaRuntime {
    /// Replace the nvcc configuration used for module builds
    pub fn with_compiler(mut self, compiler: NvccCompiler) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn compiler(&self) -> &NvccCompiler {
        &self.compiler
    }

    pub fn device_index(&self) -> usize {
        self.device_index
    }
}

#[cfg(feature = "cuda-runtime")]
impl DeviceRuntime for CudaRuntime {
    type Buffer = CudaBuffer;
    type Module = CudaModuleHandle;
    type Function = CudaKernel;

    fn allocate(&self, bytes: usize) -> Result<CudaBuffer, RuntimeError> {
        Ok(CudaBuffer::allocate(&self.stream, bytes)?)
    }

    fn upload(&self, data: &[u8]) -> Result<CudaBuffer, RuntimeError> {
        let mut buffer = CudaBuffer::allocate(&self.stream, data.len())?;
        buffer.copy_from_host(&self.stream, data)?;
        Ok(buffer)
    }

    fn write(&self, dst: &mut CudaBuffer, data: &[u8]) -> Result<(), RuntimeError> {
        Ok(dst.copy_from_host(&self.stream, data)?)
    }

    fn download(&self, src: &CudaBuffer, dst: &mut [u8]) -> Result<(), RuntimeError> {
        Ok(src.copy_to_host(&self.stream, dst)?)
    }

    fn device_address(&self, buffer: &CudaBuffer) -> u64 {
        buffer.device_ptr_u64(&self.stream)
    }

    fn compile_module(&self, source: &str) -> Result<CudaModuleHandle, RuntimeError> {
        let ptx = self.compiler.compile_to_ptx(source)?;
        let module = self
            .context
            .load_module(Ptx::from_src(ptx))
            .map_err(|e| CudaKernelError::ModuleLoad(format!("Failed to load PTX: {e}")))?;
        Ok(CudaModuleHandle::new(module))
    }

    fn get_function(
        &self,
        module: &CudaModuleHandle,
        name: &str,
    ) -> Result<CudaKernel, RuntimeError> {
        Ok(module.load_kernel(name)?)
    }

    fn launch(
        &self,
        function: &CudaKernel,
        args: &[LaunchArg],
        shape: LaunchShape,
    ) -> Result<(), RuntimeError> {
        Ok(function.launch(&self.stream, args, shape)?)
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }
}

#[cfg(not(feature = "cuda-runtime"))]
impl DeviceRuntime for CudaRuntime {
    type Buffer = CudaBuffer;
    type Module = CudaModuleHandle;
    type Function = CudaKernel;

    fn allocate(&self, bytes: usize) -> Result<CudaBuffer, RuntimeError> {
        Ok(CudaBuffer::allocate(bytes)?)
    }

    fn upload(&self, data: &[u8]) -> Result<CudaBuffer, RuntimeError> {
        Ok(CudaBuffer::allocate(data.len())?)
    }

    fn write(&self, _dst: &mut CudaBuffer, _data: &[u8]) -> Result<(), RuntimeError> {
        Err(unavailable())
    }

    fn download(&self, _src: &CudaBuffer, _dst: &mut [u8]) -> Result<(), RuntimeError> {
        Err(unavailable())
    }

    fn device_address(&self, _buffer: &CudaBuffer) -> u64 {
        0
    }

    fn compile_module(&self, source: &str) -> Result<CudaModuleHandle, RuntimeError> {
        // still surfaces compiler diagnostics when nvcc is installed
        self.compiler.compile_to_ptx(source)?;
        Err(unavailable())
    }

    fn get_function(
        &self,
        _module: &CudaModuleHandle,
        _name: &str,
    ) -> Result<CudaKernel, RuntimeError> {
        Err(unavailable())
    }

    fn launch(
        &self,
        _function: &CudaKernel,
        _args: &[LaunchArg],
        _shape: LaunchShape,
    ) -> Result<(), RuntimeError> {
        Err(unavailable())
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }
}

#[cfg(not(feature = "cuda-runtime"))]
fn unavailable() -> RuntimeError {
    RuntimeError::Unavailable(
        "CUDA runtime not available. Rebuild with --features cuda-runtime".to_string(),
    )
}

/// Error types for CUDA device operations
#[derive(Debug, Error)]
pub enum CudaDeviceError {
    #[error("CUDA initialization error: {0}")]
    Initialization(String),
    #[cfg(feature = "cuda-runtime")]
    #[error("CUDA driver error: {0}")]
    Driver(#[from] DriverError),
}

impl From<CudaDeviceError> for RuntimeError {
    fn from(e: CudaDeviceError) -> Self {
        RuntimeError::Unavailable(e.to_string())
    }
}
