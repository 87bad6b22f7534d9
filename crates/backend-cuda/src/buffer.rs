//! CUDA buffer implementation
//!
//! Raw device memory used for array data and descriptor records.

#[cfg(feature = "cuda-runtime")]
use cudarc::driver::{CudaSlice, CudaStream, DevicePtr};
#[cfg(feature = "cuda-runtime")]
use std::sync::Arc;

use blockwise::runtime::RuntimeError;
use thiserror::Error;

/// Device allocation; released when dropped
#[cfg(feature = "cuda-runtime")]
pub struct CudaBuffer {
    /// Device memory (stored as bytes, at least one byte long)
    data: CudaSlice<u8>,
    /// Requested size in bytes
    len: usize,
}

/// Stub CUDA buffer (when cuda-runtime feature is disabled)
#[cfg(not(feature = "cuda-runtime"))]
pub struct CudaBuffer {
    len: usize,
}

impl CudaBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check_fits(&self, bytes: usize) -> Result<(), CudaBufferError> {
        if bytes > self.len {
            return Err(CudaBufferError::SizeMismatch {
                expected: self.len,
                actual: bytes,
            });
        }
        Ok(())
    }
}

#[cfg(feature = "cuda-runtime")]
impl CudaBuffer {
    /// Allocate zeroed device memory
    pub fn allocate(stream: &Arc<CudaStream>, len: usize) -> Result<Self, CudaBufferError> {
        let data = stream
            .alloc_zeros::<u8>(len.max(1))
            .map_err(|e| CudaBufferError::Allocation(format!("{len} bytes: {e}")))?;
        Ok(Self { data, len })
    }

    /// Raw device address, as passed to kernels
    pub fn device_ptr_u64(&self, stream: &Arc<CudaStream>) -> u64 {
        let (ptr, _sync) = self.data.device_ptr(stream);
        ptr as u64
    }

    /// Copy `data` to the start of the buffer
    pub fn copy_from_host(
        &mut self,
        stream: &Arc<CudaStream>,
        data: &[u8],
    ) -> Result<(), CudaBufferError> {
        self.check_fits(data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        let mut dst = self.data.slice_mut(0..data.len());
        stream
            .memcpy_htod(data, &mut dst)
            .map_err(|e| CudaBufferError::Copy(format!("Host to device copy failed: {e}")))
    }

    /// Copy the start of the buffer into `data`
    pub fn copy_to_host(
        &self,
        stream: &Arc<CudaStream>,
        data: &mut [u8],
    ) -> Result<(), CudaBufferError> {
        self.check_fits(data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        let src = self.data.slice(0..data.len());
        stream
            .memcpy_dtoh(&src, data)
            .map_err(|e| CudaBufferError::Copy(format!("Device to host copy failed: {e}")))
    }
}

#[cfg(not(feature = "cuda-runtime"))]
impl CudaBuffer {
    /// Stub allocation; always fails
    pub fn allocate(len: usize) -> Result<Self, CudaBufferError> {
        Err(CudaBufferError::Allocation(format!(
            "{len} bytes: CUDA runtime not available. Rebuild with --features cuda-runtime"
        )))
    }
}

impl std::fmt::Debug for CudaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaBuffer").field("len", &self.len).finish()
    }
}

/// Error types for CUDA buffer operations
#[derive(Debug, Error)]
pub enum CudaBufferError {
    #[error("CUDA allocation error: {0}")]
    Allocation(String),
    #[error("Size mismatch: buffer holds {expected} bytes, transfer needs {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("CUDA copy error: {0}")]
    Copy(String),
}

impl From<CudaBufferError> for RuntimeError {
    fn from(e: CudaBufferError) -> Self {
        match e {
            CudaBufferError::Allocation(msg) => RuntimeError::Allocation(msg),
            CudaBufferError::SizeMismatch { expected, actual } => {
                RuntimeError::SizeMismatch { expected, actual }
            }
            CudaBufferError::Copy(msg) => RuntimeError::Transfer(msg),
        }
    }
}
