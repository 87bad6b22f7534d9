//! Device array descriptor
//!
//! Every array passed to a kernel is uploaded together with a fixed-size
//! record that device code reads through the `<Type>Array` structs emitted
//! by [`typedef_preamble`]:
//!
//! ```text
//! offset  field
//!      0  data     (u64 device pointer)
//!      8  dim[4]   (i32, zero padded)
//!     24  offset[4](i32, reserved, zero)
//!     40  ndim     (i32)
//!     44  size     (i32)
//!     48  padding up to 64
//! ```
//!
//! The record has the same size for every rank, so generated code can rely
//! on a compile-time layout.

use crate::array::HostArray;
use crate::dtype::ScalarType;
use crate::error::{BlockwiseError, Result};
use crate::runtime::DeviceRuntime;
use log::trace;
use std::fmt::Write;

/// Maximum rank a descriptor can describe
pub const MAX_DIMS: usize = 4;

/// Alignment (and therefore size) of the device record
pub const DESCRIPTOR_ALIGN: usize = 64;

/// Pointer plus ten 32-bit integers, rounded up to the alignment
pub const DESCRIPTOR_SIZE: usize =
    (8usize + 10 * 4).div_ceil(DESCRIPTOR_ALIGN) * DESCRIPTOR_ALIGN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceArrayDescriptor {
    pub data: u64,
    pub dim: [i32; MAX_DIMS],
    pub offset: [i32; MAX_DIMS],
    pub ndim: i32,
    pub size: i32,
}

impl DeviceArrayDescriptor {
    /// Fills `dim`, `ndim` and `size` from `shape`
    ///
    /// Fails before anything is allocated if the shape cannot be described.
    pub fn for_shape(argument: &str, data: u64, shape: &[usize]) -> Result<Self> {
        check_shape(argument, shape)?;
        let mut dim = [0i32; MAX_DIMS];
        for (d, &s) in dim.iter_mut().zip(shape) {
            *d = s as i32;
        }
        Ok(Self {
            data,
            dim,
            offset: [0; MAX_DIMS],
            ndim: shape.len() as i32,
            size: shape.iter().product::<usize>() as i32,
        })
    }

    /// Shape recorded in the descriptor
    pub fn shape(&self) -> Vec<usize> {
        self.dim[..self.ndim.clamp(0, MAX_DIMS as i32) as usize]
            .iter()
            .map(|&d| d as usize)
            .collect()
    }

    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut out = [0u8; DESCRIPTOR_SIZE];
        out[0..8].copy_from_slice(&self.data.to_ne_bytes());
        let ints = self
            .dim
            .iter()
            .chain(self.offset.iter())
            .chain([&self.ndim, &self.size]);
        for (i, v) in ints.enumerate() {
            let at = 8 + i * 4;
            out[at..at + 4].copy_from_slice(&v.to_ne_bytes());
        }
        out
    }

    /// Decodes a record written by [`Self::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < DESCRIPTOR_SIZE {
            return None;
        }
        let int_at = |i: usize| {
            let at = 8 + i * 4;
            i32::from_ne_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let mut data = [0u8; 8];
        data.copy_from_slice(&bytes[0..8]);
        Some(Self {
            data: u64::from_ne_bytes(data),
            dim: std::array::from_fn(int_at),
            offset: std::array::from_fn(|i| int_at(MAX_DIMS + i)),
            ndim: int_at(2 * MAX_DIMS),
            size: int_at(2 * MAX_DIMS + 1),
        })
    }
}

/// Rank and extents must fit the fixed record
pub fn check_shape(argument: &str, shape: &[usize]) -> Result<()> {
    if shape.len() > MAX_DIMS {
        return Err(BlockwiseError::UnsupportedRank {
            argument: argument.to_string(),
            ndim: shape.len(),
            max: MAX_DIMS,
        });
    }
    let limit = i32::MAX as usize;
    if let Some(&s) = shape.iter().find(|&&s| s > limit) {
        return Err(BlockwiseError::ArrayTooLarge {
            argument: argument.to_string(),
            reason: format!("extent {s} exceeds {limit}"),
        });
    }
    let size = shape
        .iter()
        .try_fold(1usize, |acc, &s| acc.checked_mul(s))
        .filter(|&n| n <= limit);
    if size.is_none() {
        return Err(BlockwiseError::ArrayTooLarge {
            argument: argument.to_string(),
            reason: format!("element count of {shape:?} exceeds {limit}"),
        });
    }
    Ok(())
}

/// Array data and its descriptor, both resident on the device
///
/// Dropping it releases both buffers.
pub struct DeviceArray<B> {
    descriptor: B,
    data: B,
    shape: Vec<usize>,
    element_type: ScalarType,
}

impl<B> DeviceArray<B> {
    /// Copies `host` to the device and writes its descriptor
    pub fn upload<R>(runtime: &R, argument: &str, host: &dyn HostArray) -> Result<Self>
    where
        R: DeviceRuntime<Buffer = B> + ?Sized,
    {
        let shape = host.shape().to_vec();
        check_shape(argument, &shape)?;

        let data = runtime.upload(&host.to_bytes())?;
        let record =
            DeviceArrayDescriptor::for_shape(argument, runtime.device_address(&data), &shape)?;
        let mut descriptor = runtime.allocate(DESCRIPTOR_SIZE)?;
        runtime.write(&mut descriptor, &record.to_bytes())?;
        trace!(
            "Uploaded '{}' {:?} ({} bytes) at {:#x}",
            argument,
            shape,
            host.byte_len(),
            record.data
        );

        Ok(Self {
            descriptor,
            data,
            shape,
            element_type: host.element_type(),
        })
    }

    /// Copies the device contents back into `host`
    pub fn download_into<R>(&self, runtime: &R, host: &mut dyn HostArray) -> Result<()>
    where
        R: DeviceRuntime<Buffer = B> + ?Sized,
    {
        let mut bytes = vec![0u8; host.byte_len()];
        runtime.download(&self.data, &mut bytes)?;
        host.copy_from_bytes(&bytes)?;
        Ok(())
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn element_type(&self) -> ScalarType {
        self.element_type
    }

    /// Buffer holding the descriptor record; this is what kernels receive
    pub fn descriptor_buffer(&self) -> &B {
        &self.descriptor
    }

    pub fn data_buffer(&self) -> &B {
        &self.data
    }
}

impl<B> std::fmt::Debug for DeviceArray<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceArray")
            .field("shape", &self.shape)
            .field("element_type", &self.element_type)
            .finish()
    }
}

/// Device-side struct definitions shared by every generated module
pub fn typedef_preamble() -> String {
    let mut code = String::from("#define sync __syncthreads\n\n");
    for ty in ScalarType::ALL {
        let name = ty.array_struct_name();
        let _ = write!(
            code,
            "typedef struct __align__({DESCRIPTOR_ALIGN}) {{\n    \
             {native} *data;\n    \
             int dim[{MAX_DIMS}];\n    \
             int offset[{MAX_DIMS}];\n    \
             int ndim;\n    \
             int size;\n\
             }} {name}Struct;\n\
             typedef {name}Struct* {name};\n",
            native = ty.native_name(),
        );
    }
    code.push('\n');
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_size() {
        assert_eq!(DESCRIPTOR_SIZE, 64);
        let a = DeviceArrayDescriptor::for_shape("a", 1, &[7]).unwrap();
        let b = DeviceArrayDescriptor::for_shape("b", 1, &[2, 3, 4, 5]).unwrap();
        assert_eq!(a.to_bytes().len(), b.to_bytes().len());
    }

    #[test]
    fn test_fields_zero_padded() {
        let d = DeviceArrayDescriptor::for_shape("img", 0xdead_beef, &[480, 640]).unwrap();
        assert_eq!(d.dim, [480, 640, 0, 0]);
        assert_eq!(d.offset, [0; 4]);
        assert_eq!(d.ndim, 2);
        assert_eq!(d.size, 480 * 640);

        let bytes = d.to_bytes();
        assert_eq!(&bytes[0..8], &0xdead_beefu64.to_ne_bytes());
        assert_eq!(&bytes[8..12], &480i32.to_ne_bytes());
        assert_eq!(&bytes[40..44], &2i32.to_ne_bytes());
        assert!(bytes[48..].iter().all(|&b| b == 0));

        let decoded = DeviceArrayDescriptor::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, d);
        assert_eq!(decoded.shape(), vec![480, 640]);
    }

    #[test]
    fn test_shape_limits() {
        assert!(matches!(
            check_shape("a", &[1, 1, 1, 1, 1]),
            Err(BlockwiseError::UnsupportedRank { ndim: 5, .. })
        ));
        assert!(matches!(
            check_shape("a", &[1 << 16, 1 << 16]),
            Err(BlockwiseError::ArrayTooLarge { .. })
        ));
        assert!(check_shape("a", &[]).is_ok());
    }

    #[test]
    fn test_preamble_matches_struct_names() {
        let code = typedef_preamble();
        assert!(code.contains("} IntArrayStruct;"));
        assert!(code.contains("typedef IntArrayStruct* IntArray;"));
        assert!(code.contains("unsigned char *data;"));
        assert!(code.contains("__align__(64)"));
        assert_eq!(code.matches("int ndim;").count(), ScalarType::ALL.len());
    }
}
