//! Host-side arrays that can be passed to a block function
//!
//! Any `ndarray` array (owned or a mutable view, in any memory layout) with a
//! supported element type can be uploaded. Bytes are produced and consumed in
//! logical row-major order so results land back in the same host array the
//! caller passed in.

use crate::dtype::{Element, ScalarType};
use crate::runtime::RuntimeError;
use ndarray::{ArrayBase, DataMut, Dimension};

pub trait HostArray {
    fn shape(&self) -> &[usize];

    fn element_type(&self) -> ScalarType;

    /// Total element count
    fn size(&self) -> usize {
        self.shape().iter().product()
    }

    fn byte_len(&self) -> usize {
        self.size() * self.element_type().size_bytes()
    }

    /// Contents as native-endian bytes in row-major order
    fn to_bytes(&self) -> Vec<u8>;

    /// Overwrites the contents from bytes produced by [`HostArray::to_bytes`]
    fn copy_from_bytes(&mut self, bytes: &[u8]) -> Result<(), RuntimeError>;
}

impl<T, S, D> HostArray for ArrayBase<S, D>
where
    T: Element,
    S: DataMut<Elem = T>,
    D: Dimension,
{
    fn shape(&self) -> &[usize] {
        ArrayBase::shape(self)
    }

    fn element_type(&self) -> ScalarType {
        T::SCALAR
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HostArray::byte_len(self));
        for &v in self.iter() {
            v.write_ne_bytes(&mut out);
        }
        out
    }

    fn copy_from_bytes(&mut self, bytes: &[u8]) -> Result<(), RuntimeError> {
        let expected = HostArray::byte_len(self);
        if bytes.len() != expected {
            return Err(RuntimeError::SizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        let width = T::SCALAR.size_bytes();
        for (dst, chunk) in self.iter_mut().zip(bytes.chunks_exact(width)) {
            *dst = T::read_ne_bytes(chunk);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, ShapeBuilder, array};

    #[test]
    fn test_bytes_follow_logical_order() {
        let a = array![[1i32, 2], [3, 4]];
        let t = a.t().to_owned();
        let mut fortran = Array2::<i32>::zeros((2, 2).f());
        fortran.assign(&a);

        assert_eq!(a.to_bytes(), fortran.to_bytes());
        assert_ne!(a.to_bytes(), t.to_bytes());
        assert_eq!(HostArray::shape(&a), &[2, 2]);
        assert_eq!(a.element_type(), ScalarType::I32);
    }

    #[test]
    fn test_copy_back_into_view() {
        let mut big = Array2::<f32>::zeros((3, 4));
        let src = array![[1.0f32, 2.0], [3.0, 4.0]];
        {
            let mut view = big.slice_mut(ndarray::s![1.., 1..3]);
            view.copy_from_bytes(&src.to_bytes()).unwrap();
        }
        assert_eq!(big[[1, 1]], 1.0);
        assert_eq!(big[[2, 2]], 4.0);
        assert_eq!(big[[0, 0]], 0.0);
    }

    #[test]
    fn test_copy_rejects_wrong_size() {
        let mut a = Array2::<u8>::zeros((2, 2));
        assert!(matches!(
            a.copy_from_bytes(&[0u8; 3]),
            Err(RuntimeError::SizeMismatch {
                expected: 4,
                actual: 3
            })
        ));
    }
}
