//! Interfaces to the external device runtime and kernel code generator
//!
//! The dispatch engine never talks to a GPU API directly. A backend crate
//! implements [`DeviceRuntime`] (memory, module compilation, launches) and
//! [`CodeGenerator`] (kernel source for one declared function), and the
//! registry compiler and dispatcher drive them.

use crate::ast::Stmt;
use crate::dtype::{ElementType, ScalarValue};
use crate::registry::BlockShape;
use thiserror::Error;

/// Failure reported by a device runtime or code generator
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("device allocation failed: {0}")]
    Allocation(String),

    #[error("memory transfer failed: {0}")]
    Transfer(String),

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("code generation failed: {0}")]
    Codegen(String),

    #[error("module compilation failed: {0}")]
    Compile(String),

    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("kernel launch failed: {0}")]
    Launch(String),
}

/// Hardware limits that drive the launch-shape splay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub warp_size: u32,
    pub max_threads_per_group: u32,
    /// Largest grid extent along x (and y)
    pub max_grid_dim: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            warp_size: 32,
            max_threads_per_group: 1024,
            max_grid_dim: 65535,
        }
    }
}

/// 3-D grid and thread-group extents of one launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchShape {
    pub grid: [u32; 3],
    pub block: [u32; 3],
}

impl LaunchShape {
    /// Total number of threads the launch starts
    pub fn capacity(&self) -> u64 {
        self.grid
            .iter()
            .chain(self.block.iter())
            .map(|&d| d as u64)
            .product()
    }

    /// True when only `grid[0..2]` and `block[0]` are used
    ///
    /// Generated kernels flatten exactly these axes into the block index, so
    /// any other non-unit extent would run the same block twice.
    pub fn is_flat(&self) -> bool {
        self.block[1] == 1 && self.block[2] == 1 && self.grid[2] == 1
    }
}

/// One marshaled kernel argument
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LaunchArg {
    /// Device address of an array descriptor
    Pointer(u64),
    Scalar(ScalarValue),
}

impl LaunchArg {
    pub fn marshal_code(&self) -> char {
        match self {
            LaunchArg::Pointer(_) => 'P',
            LaunchArg::Scalar(v) => v.scalar_type().marshal_code(),
        }
    }
}

/// Device memory, module and launch primitives
pub trait DeviceRuntime {
    /// Device allocation; dropping it releases the memory
    type Buffer;
    type Module;
    /// Callable kernel entry point; keeps its module alive
    type Function;

    fn allocate(&self, bytes: usize) -> Result<Self::Buffer, RuntimeError>;

    fn upload(&self, data: &[u8]) -> Result<Self::Buffer, RuntimeError>;

    /// Overwrites the start of `dst` with `data`
    fn write(&self, dst: &mut Self::Buffer, data: &[u8]) -> Result<(), RuntimeError>;

    fn download(&self, src: &Self::Buffer, dst: &mut [u8]) -> Result<(), RuntimeError>;

    fn device_address(&self, buffer: &Self::Buffer) -> u64;

    fn compile_module(&self, source: &str) -> Result<Self::Module, RuntimeError>;

    fn get_function(&self, module: &Self::Module, name: &str)
    -> Result<Self::Function, RuntimeError>;

    /// Runs `function` and blocks until the device has finished
    fn launch(
        &self,
        function: &Self::Function,
        args: &[LaunchArg],
        shape: LaunchShape,
    ) -> Result<(), RuntimeError>;

    fn limits(&self) -> DeviceLimits {
        DeviceLimits::default()
    }

    /// Maps a block count to a launch shape
    fn splay(&self, count: usize) -> LaunchShape {
        crate::dispatch::splay(count, &self.limits())
    }
}

/// One argument of a kernel as seen by the code generator
#[derive(Debug, Clone, PartialEq)]
pub struct KernelParam<'a> {
    pub name: &'a str,
    pub ty: ElementType,
    /// `None` for broadcast (non block-partitioned) arguments
    pub block_shape: Option<&'a BlockShape>,
}

/// Everything a code generator needs to emit one kernel
#[derive(Debug, Clone, PartialEq)]
pub struct KernelDescription<'a> {
    pub name: &'a str,
    /// Exported symbol the compiled module must define
    pub entry_point: String,
    pub params: Vec<KernelParam<'a>>,
    pub overlapping: bool,
    pub center_as_origin: bool,
    pub body: &'a [Stmt],
}

/// Source text produced for one kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedKernel {
    pub source: String,
    /// Declaration of the entry point, without the trailing `;`
    pub prototype: String,
}

/// Turns a kernel description into compilable source
pub trait CodeGenerator {
    fn generate(&self, kernel: &KernelDescription<'_>) -> Result<GeneratedKernel, RuntimeError>;
}
