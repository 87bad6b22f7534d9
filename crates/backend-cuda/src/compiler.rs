//! nvcc build toolchain
//!
//! Compiles a generated module to PTX with nvcc. Two build modes exist: an
//! optimized build and an instrumented emulation build with device debug
//! info and `DEVICEEMU` defined, so kernel sources can special-case it.

use blockwise::runtime::RuntimeError;
use std::process::Command;
use tempfile::TempDir;
use thiserror::Error;

/// Environment variable overriding the nvcc executable
pub const NVCC_ENV: &str = "NVCC";
/// Environment variable overriding the target architecture
pub const ARCH_ENV: &str = "BLOCKWISE_CUDA_ARCH";

const DEFAULT_ARCH: &str = "sm_50";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildMode {
    /// `-O3`
    #[default]
    Optimized,
    /// Device debug build with `DEVICEEMU=1` defined
    Emulation,
}

impl BuildMode {
    fn flags(self) -> &'static [&'static str] {
        match self {
            BuildMode::Optimized => &["-O3", "--use_fast_math"],
            BuildMode::Emulation => &["-G", "-DDEVICEEMU=1"],
        }
    }
}

/// Compiles CUDA source to PTX by invoking nvcc
#[derive(Debug, Clone)]
pub struct NvccCompiler {
    nvcc: String,
    /// Target GPU architecture (e.g., "sm_50", "sm_70")
    arch: String,
    mode: BuildMode,
}

impl Default for NvccCompiler {
    fn default() -> Self {
        Self {
            nvcc: "nvcc".to_string(),
            arch: DEFAULT_ARCH.to_string(),
            mode: BuildMode::default(),
        }
    }
}

impl NvccCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `NVCC` and `BLOCKWISE_CUDA_ARCH`, falling back to the defaults
    pub fn from_env() -> Self {
        let mut compiler = Self::default();
        if let Ok(nvcc) = std::env::var(NVCC_ENV)
            && !nvcc.trim().is_empty()
        {
            compiler.nvcc = nvcc;
        }
        if let Ok(arch) = std::env::var(ARCH_ENV)
            && !arch.trim().is_empty()
        {
            compiler.arch = arch;
        }
        compiler
    }

    pub fn with_arch(mut self, arch: &str) -> Self {
        self.arch = arch.to_string();
        self
    }

    pub fn with_mode(mut self, mode: BuildMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_nvcc(mut self, nvcc: &str) -> Self {
        self.nvcc = nvcc.to_string();
        self
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn mode(&self) -> BuildMode {
        self.mode
    }

    /// Check if the configured nvcc can be run
    pub fn is_available(&self) -> bool {
        Command::new(&self.nvcc)
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// Compiles `source` and returns the PTX text
    pub fn compile_to_ptx(&self, source: &str) -> Result<String, CudaCompilerError> {
        let temp_dir = TempDir::new()
            .map_err(|e| CudaCompilerError::Io(format!("Failed to create temp dir: {}", e)))?;
        let source_path = temp_dir.path().join("module.cu");
        let ptx_path = temp_dir.path().join("module.ptx");

        std::fs::write(&source_path, source)
            .map_err(|e| CudaCompilerError::Io(format!("Failed to write source: {}", e)))?;

        log::debug!(
            "Running {} ({:?}, {}) on {:?}",
            self.nvcc,
            self.mode,
            self.arch,
            source_path
        );

        let output = Command::new(&self.nvcc)
            .arg("-ptx")
            .args(self.mode.flags())
            .arg("-arch")
            .arg(&self.arch)
            .arg("-o")
            .arg(&ptx_path)
            .arg(&source_path)
            .output()
            .map_err(|e| CudaCompilerError::NvccNotFound(format!("{}: {}", self.nvcc, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(CudaCompilerError::Compilation(format!(
                "Could not compile GPU code:\nstdout: {}\nstderr: {}",
                stdout, stderr
            )));
        }

        let ptx = std::fs::read_to_string(&ptx_path)
            .map_err(|e| CudaCompilerError::Io(format!("Failed to read PTX: {}", e)))?;
        log::debug!("PTX compilation successful ({} bytes)", ptx.len());
        Ok(ptx)
    }
}

/// Error types for nvcc compilation
#[derive(Debug, Error)]
pub enum CudaCompilerError {
    #[error("nvcc not found: {0}")]
    NvccNotFound(String),
    #[error("CUDA compilation error: {0}")]
    Compilation(String),
    #[error("IO error: {0}")]
    Io(String),
}

impl From<CudaCompilerError> for RuntimeError {
    fn from(e: CudaCompilerError) -> Self {
        match e {
            CudaCompilerError::NvccNotFound(_) => RuntimeError::Unavailable(e.to_string()),
            _ => RuntimeError::Compile(e.to_string()),
        }
    }
}
