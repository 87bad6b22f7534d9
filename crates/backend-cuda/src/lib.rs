//! CUDA backend for blockwise
//!
//! This crate provides CUDA code generation for block functions, an nvcc
//! build toolchain and a device runtime built on cudarc.
//!
//! # Features
//!
//! - `cuda-runtime`: Enable full CUDA runtime support (requires CUDA SDK)
//!
//! Without the feature, [`CudaRenderer`] and [`NvccCompiler`] still work,
//! but [`CudaRuntime::new`] reports the runtime as unavailable.
//!
//! # Usage
//!
//! ```ignore
//! use blockwise::prelude::*;
//! use blockwise_backend_cuda::{CudaRenderer, CudaRuntime};
//!
//! let runtime = CudaRuntime::new(0)?;
//! RegistryCompiler::new(&CudaRenderer::new(), &runtime)
//!     .with_options(CompileOptions::from_env())
//!     .compile_all(&mut registry)?;
//! registry.invoke(&runtime, "blur", &mut [KernelArg::raw(&mut img), KernelArg::raw(&mut out)])?;
//! ```

mod buffer;
mod compiler;
mod device;
pub mod kernel;
pub mod renderer;

pub use buffer::{CudaBuffer, CudaBufferError};
pub use compiler::{BuildMode, CudaCompilerError, NvccCompiler};
pub use device::{CudaDeviceError, CudaRuntime};
pub use kernel::{CudaKernel, CudaKernelError, CudaModuleHandle};
pub use renderer::CudaRenderer;

/// Registry type whose entries are bound to CUDA kernels
pub type CudaRegistry = blockwise::FunctionRegistry<blockwise::CompiledKernel<CudaKernel>>;

/// Check if nvcc is available with the environment configuration
pub fn is_nvcc_available() -> bool {
    NvccCompiler::from_env().is_available()
}
