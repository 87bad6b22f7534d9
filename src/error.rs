//! Error types for declaration, compilation and dispatch

use crate::runtime::RuntimeError;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, BlockwiseError>;

/// Every failure the registry, partitioner, compiler and dispatcher can report
#[derive(Debug, Error)]
pub enum BlockwiseError {
    /// A function with this name was already declared
    #[error("the function \"{0}\" has already been registered")]
    DuplicateRegistration(String),

    /// An argument name appears in more than one group of a declaration
    #[error("variable \"{variable}\" of function \"{function}\" is specified multiple times")]
    DuplicateVariable { function: String, variable: String },

    /// The declaration contradicts itself
    #[error("invalid configuration for \"{function}\": {reason}")]
    InvalidConfiguration { function: String, reason: String },

    #[error("unknown block function \"{0}\"")]
    UnknownFunction(String),

    #[error("block function \"{0}\" is already bound to a compiled kernel")]
    AlreadyBound(String),

    #[error("block function \"{0}\" has not been compiled; run compile_all() first")]
    NotCompiled(String),

    #[error("unsupported type '{0}'")]
    UnsupportedType(String),

    /// Rank of an array differs from the rank of its declared block shape
    #[error("argument \"{argument}\" has shape {shape:?}, which does not match block shape {block:?}")]
    ShapeMismatch {
        argument: String,
        shape: Vec<usize>,
        block: Vec<usize>,
    },

    /// A sliding window does not fit inside the array along some axis
    #[error("block shape {block:?} of argument \"{argument}\" does not fit into shape {shape:?}")]
    BlockTooLarge {
        argument: String,
        shape: Vec<usize>,
        block: Vec<usize>,
    },

    #[error(
        "size of argument \"{argument}\" {shape:?} must be an integer multiple of its block size \
         {block:?} when using non-overlapping blocks"
    )]
    IndivisibleBlockShape {
        argument: String,
        shape: Vec<usize>,
        block: Vec<usize>,
    },

    #[error(
        "number of blocks of argument \"{argument}\" ({found}) doesn't match the preceding \
         blockwise arguments ({expected})"
    )]
    InconsistentBlockCount {
        argument: String,
        expected: usize,
        found: usize,
    },

    #[error("device arrays support at most {max} dimensions, \"{argument}\" has {ndim}")]
    UnsupportedRank {
        argument: String,
        ndim: usize,
        max: usize,
    },

    #[error("array \"{argument}\" is too large for a device descriptor: {reason}")]
    ArrayTooLarge { argument: String, reason: String },

    #[error("block function \"{function}\" takes {expected} arguments but {found} were given")]
    ArgumentCount {
        function: String,
        expected: usize,
        found: usize,
    },

    #[error("argument \"{argument}\" expects {expected}, got {found}")]
    ArgumentTypeMismatch {
        argument: String,
        expected: String,
        found: String,
    },

    #[error("block count {0} does not fit in the kernel's int argument")]
    BlockCountOverflow(usize),

    /// The runtime chose a launch shape that does not map every block to one thread
    #[error(
        "launch shape grid={grid:?} block={block:?} of \"{function}\" does not cover {count} \
         blocks one thread each"
    )]
    InvalidLaunchShape {
        function: String,
        count: usize,
        grid: [u32; 3],
        block: [u32; 3],
    },

    #[error("compilation of \"{function}\" failed: {message}")]
    CompilationError { function: String, message: String },

    #[error("kernel \"{function}\" failed: {source}")]
    KernelExecutionError {
        function: String,
        #[source]
        source: RuntimeError,
    },

    /// Device memory operation failed outside the launch itself
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl BlockwiseError {
    pub(crate) fn invalid(function: &str, reason: impl Into<String>) -> Self {
        BlockwiseError::InvalidConfiguration {
            function: function.to_string(),
            reason: reason.into(),
        }
    }
}
