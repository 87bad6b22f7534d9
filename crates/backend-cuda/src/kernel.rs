//! CUDA module and kernel handles
//!
//! A module is loaded from PTX once per registry compile; every block
//! function gets a [`CudaKernel`] that keeps the module alive.

use blockwise::runtime::{LaunchShape, RuntimeError};
use thiserror::Error;

#[cfg(feature = "cuda-runtime")]
use blockwise::dtype::ScalarValue;
#[cfg(feature = "cuda-runtime")]
use blockwise::runtime::LaunchArg;
#[cfg(feature = "cuda-runtime")]
use cudarc::driver::{CudaFunction, CudaModule, CudaStream, LaunchConfig, PushKernelArg};
#[cfg(feature = "cuda-runtime")]
use std::sync::Arc;

/// Loaded CUDA module
#[cfg(feature = "cuda-runtime")]
#[derive(Clone)]
pub struct CudaModuleHandle {
    module: Arc<CudaModule>,
}

/// Stub CUDA module (when cuda-runtime feature is disabled)
#[cfg(not(feature = "cuda-runtime"))]
#[derive(Clone)]
pub struct CudaModuleHandle {
    _private: (),
}

/// Exported kernel of a loaded module
#[cfg(feature = "cuda-runtime")]
#[derive(Clone)]
pub struct CudaKernel {
    /// Keeps the module loaded for as long as the kernel is bound
    #[allow(dead_code)]
    module: Arc<CudaModule>,
    function: CudaFunction,
    entry_point: String,
}

/// Stub CUDA kernel (when cuda-runtime feature is disabled)
#[cfg(not(feature = "cuda-runtime"))]
#[derive(Clone)]
pub struct CudaKernel {
    entry_point: String,
}

// Safety: the module is reference counted and launches go through a stream
unsafe impl Send for CudaKernel {}
unsafe impl Sync for CudaKernel {}

impl CudaKernel {
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }
}

/// CUDA launch configuration for a launch shape
pub fn launch_dims(shape: &LaunchShape) -> ((u32, u32, u32), (u32, u32, u32)) {
    let [gx, gy, gz] = shape.grid;
    let [bx, by, bz] = shape.block;
    ((gx, gy, gz), (bx, by, bz))
}

#[cfg(feature = "cuda-runtime")]
impl CudaModuleHandle {
    pub fn new(module: Arc<CudaModule>) -> Self {
        Self { module }
    }

    /// Look up an exported kernel by name
    pub fn load_kernel(&self, entry_point: &str) -> Result<CudaKernel, CudaKernelError> {
        let function = self.module.load_function(entry_point).map_err(|e| {
            CudaKernelError::FunctionNotFound(format!("Function '{entry_point}' not found: {e}"))
        })?;
        Ok(CudaKernel {
            module: Arc::clone(&self.module),
            function,
            entry_point: entry_point.to_string(),
        })
    }
}

#[cfg(feature = "cuda-runtime")]
impl CudaKernel {
    /// Launches the kernel and waits for it to finish
    pub fn launch(
        &self,
        stream: &Arc<CudaStream>,
        args: &[LaunchArg],
        shape: LaunchShape,
    ) -> Result<(), CudaKernelError> {
        let (grid_dim, block_dim) = launch_dims(&shape);
        let config = LaunchConfig {
            grid_dim,
            block_dim,
            shared_mem_bytes: 0,
        };

        let mut builder = stream.launch_builder(&self.function);
        for arg in args {
            match arg {
                LaunchArg::Pointer(ptr) => builder.arg(ptr),
                LaunchArg::Scalar(value) => match value {
                    ScalarValue::I8(v) => builder.arg(v),
                    ScalarValue::U8(v) => builder.arg(v),
                    ScalarValue::I16(v) => builder.arg(v),
                    ScalarValue::U16(v) => builder.arg(v),
                    ScalarValue::I32(v) => builder.arg(v),
                    ScalarValue::U32(v) => builder.arg(v),
                    ScalarValue::I64(v) => builder.arg(v),
                    ScalarValue::U64(v) => builder.arg(v),
                    ScalarValue::F32(v) => builder.arg(v),
                    ScalarValue::F64(v) => builder.arg(v),
                },
            };
        }

        log::debug!(
            "Launching kernel '{}' with grid={:?}, block={:?}, {} args",
            self.entry_point,
            grid_dim,
            block_dim,
            args.len()
        );

        // Safety: argument kinds and order were checked against the signature
        // the kernel was generated from
        unsafe { builder.launch(config) }
            .map_err(|e| CudaKernelError::Launch(format!("Kernel launch failed: {e}")))?;
        stream
            .synchronize()
            .map_err(|e| CudaKernelError::Launch(format!("Stream synchronization failed: {e}")))?;

        log::debug!("Kernel '{}' completed successfully", self.entry_point);
        Ok(())
    }
}

impl std::fmt::Debug for CudaKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaKernel")
            .field("entry_point", &self.entry_point)
            .finish()
    }
}

/// Error types for CUDA kernel operations
#[derive(Debug, Error)]
pub enum CudaKernelError {
    #[error("Module load error: {0}")]
    ModuleLoad(String),
    #[error("Function not found: {0}")]
    FunctionNotFound(String),
    #[error("Kernel launch error: {0}")]
    Launch(String),
}

impl From<CudaKernelError> for RuntimeError {
    fn from(e: CudaKernelError) -> Self {
        match e {
            CudaKernelError::ModuleLoad(msg) => RuntimeError::Compile(msg),
            CudaKernelError::FunctionNotFound(msg) => RuntimeError::FunctionNotFound(msg),
            CudaKernelError::Launch(msg) => RuntimeError::Launch(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_dims() {
        let shape = LaunchShape {
            grid: [3, 2, 1],
            block: [128, 1, 1],
        };
        assert_eq!(launch_dims(&shape), ((3, 2, 1), (128, 1, 1)));
    }

    #[test]
    fn test_error_conversion() {
        let e: RuntimeError = CudaKernelError::FunctionNotFound("_kernel_f".into()).into();
        assert!(matches!(e, RuntimeError::FunctionNotFound(_)));
        let e: RuntimeError = CudaKernelError::Launch("boom".into()).into();
        assert!(matches!(e, RuntimeError::Launch(_)));
    }
}
