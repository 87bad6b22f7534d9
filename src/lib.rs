//! Blockwise: block-partitioned kernel dispatch
//!
//! Blockwise runs user-declared "block functions" once per block of their
//! array arguments on a GPU. A function is declared with its argument types,
//! the block shape of each partitioned argument and an overlap policy; the
//! engine works out how many blocks a call implies, ships arrays to the
//! device with a fixed-layout descriptor and copies the results back.
//!
//! # Architecture
//!
//! - **registry**: declarations and the explicit [`FunctionRegistry`]
//! - **dtype**: element types and their marshal codes
//! - **descriptor**: the 64-byte device array record and device arrays
//! - **partition**: block counts for tiled, sliding and centered blocks
//! - **dispatch**: argument validation, marshaling, launch and copy-back
//! - **compile**: generating, compiling and binding every declared function
//! - **runtime**: traits implemented by device backends
//! - **ast**: the IR kernel bodies are written in
//!
//! Backends are provided as separate crates:
//! - **blockwise-backend-cuda**: CUDA code generation, nvcc and a cudarc runtime
//!
//! # Lifecycle
//!
//! ```ignore
//! let mut registry = FunctionRegistry::new();
//! registry.register(
//!     BlockFunction::builder("invert")
//!         .arg("img", "float32[]".parse::<ElementType>()?)
//!         .block_shape("img", [1, 1])
//!         .body(vec![store("img", [0, 0], -load("img", [0, 0]))])
//!         .build(),
//! )?;
//! RegistryCompiler::new(&CudaRenderer::new(), &runtime).compile_all(&mut registry)?;
//! registry.invoke(&runtime, "invert", &mut [KernelArg::raw(&mut image)])?;
//! ```

// ============================================================================
// Core Modules
// ============================================================================

pub mod array;
pub mod ast;
pub mod compile;
pub mod descriptor;
pub mod dispatch;
pub mod dtype;
pub mod error;
pub mod partition;
pub mod registry;
pub mod runtime;

// ============================================================================
// Re-exports
// ============================================================================

pub use array::HostArray;
pub use compile::{CompileOptions, RegistryCompiler};
pub use descriptor::{DeviceArray, DeviceArrayDescriptor};
pub use dispatch::{Dispatcher, KernelArg};
pub use dtype::{ElementType, ScalarType, ScalarValue};
pub use error::{BlockwiseError, Result};
pub use registry::{BlockFunction, BlockShape, CompiledKernel, FunctionRegistry, RegistryEntry};
pub use runtime::{CodeGenerator, DeviceRuntime, RuntimeError};

// ============================================================================
// Prelude
// ============================================================================

/// Prelude module with commonly used types and traits
pub mod prelude {
    pub use crate::array::HostArray;
    pub use crate::ast::{
        Expr, Stmt, assign, block_index, dim, for_, if_, if_else, let_, load, store, sync, var,
    };
    pub use crate::compile::{CompileOptions, RegistryCompiler};
    pub use crate::descriptor::DeviceArray;
    pub use crate::dispatch::{Dispatcher, KernelArg};
    pub use crate::dtype::{Element, ElementType, ScalarType, ScalarValue};
    pub use crate::error::{BlockwiseError, Result};
    pub use crate::registry::{BlockFunction, BlockShape, CompiledKernel, FunctionRegistry};
    pub use crate::runtime::{
        CodeGenerator, DeviceLimits, DeviceRuntime, LaunchArg, LaunchShape, RuntimeError,
    };
}
