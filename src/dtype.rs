//! Element types and their marshaling codes
//!
//! Every declared argument carries an [`ElementType`]. The type mapper turns
//! it into the one-character code used to pack kernel arguments on the host
//! and the native type name used by generated device code. Both sides must
//! agree: an `int32[]` argument is packed as a pointer (`P`) and is read on
//! the device through a struct literally named `IntArray`.

use crate::error::{BlockwiseError, Result};
use std::fmt;
use std::str::FromStr;

/// Numeric element type of a scalar argument or of an array's elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl ScalarType {
    pub const ALL: [ScalarType; 10] = [
        ScalarType::I8,
        ScalarType::U8,
        ScalarType::I16,
        ScalarType::U16,
        ScalarType::I32,
        ScalarType::U32,
        ScalarType::I64,
        ScalarType::U64,
        ScalarType::F32,
        ScalarType::F64,
    ];

    /// Argument-packing code for a scalar of this type
    pub fn marshal_code(self) -> char {
        match self {
            ScalarType::I8 => 'b',
            ScalarType::U8 => 'B',
            ScalarType::I16 => 'h',
            ScalarType::U16 => 'H',
            ScalarType::I32 => 'i',
            ScalarType::U32 => 'I',
            ScalarType::I64 => 'l',
            ScalarType::U64 => 'L',
            ScalarType::F32 => 'f',
            ScalarType::F64 => 'd',
        }
    }

    /// C type name used in generated device code
    pub fn native_name(self) -> &'static str {
        match self {
            ScalarType::I8 => "char",
            ScalarType::U8 => "unsigned char",
            ScalarType::I16 => "short",
            ScalarType::U16 => "unsigned short",
            ScalarType::I32 => "int",
            ScalarType::U32 => "unsigned int",
            ScalarType::I64 => "long long",
            ScalarType::U64 => "unsigned long long",
            ScalarType::F32 => "float",
            ScalarType::F64 => "double",
        }
    }

    /// Name of the device-side array struct holding elements of this type
    pub fn array_struct_name(self) -> &'static str {
        match self {
            ScalarType::I8 => "CharArray",
            ScalarType::U8 => "UcharArray",
            ScalarType::I16 => "ShortArray",
            ScalarType::U16 => "UshortArray",
            ScalarType::I32 => "IntArray",
            ScalarType::U32 => "UintArray",
            ScalarType::I64 => "LongArray",
            ScalarType::U64 => "UlongArray",
            ScalarType::F32 => "FloatArray",
            ScalarType::F64 => "DoubleArray",
        }
    }

    pub fn size_bytes(self) -> usize {
        match self {
            ScalarType::I8 | ScalarType::U8 => 1,
            ScalarType::I16 | ScalarType::U16 => 2,
            ScalarType::I32 | ScalarType::U32 | ScalarType::F32 => 4,
            ScalarType::I64 | ScalarType::U64 | ScalarType::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ScalarType::F32 | ScalarType::F64)
    }

    fn spelling(self) -> &'static str {
        match self {
            ScalarType::I8 => "int8",
            ScalarType::U8 => "uint8",
            ScalarType::I16 => "int16",
            ScalarType::U16 => "uint16",
            ScalarType::I32 => "int32",
            ScalarType::U32 => "uint32",
            ScalarType::I64 => "int64",
            ScalarType::U64 => "uint64",
            ScalarType::F32 => "float32",
            ScalarType::F64 => "float64",
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.spelling())
    }
}

impl FromStr for ScalarType {
    type Err = BlockwiseError;

    fn from_str(s: &str) -> Result<Self> {
        ScalarType::ALL
            .into_iter()
            .find(|t| t.spelling() == s)
            .ok_or_else(|| BlockwiseError::UnsupportedType(s.to_string()))
    }
}

/// Declared type of a block function argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Scalar(ScalarType),
    /// Multi-dimensional buffer passed through a device array descriptor
    Array(ScalarType),
}

impl ElementType {
    pub fn array_of(elem: ScalarType) -> Self {
        ElementType::Array(elem)
    }

    pub fn is_array(self) -> bool {
        matches!(self, ElementType::Array(_))
    }

    /// Marshaling code and native type name for this argument type
    pub fn marshal(self) -> (char, &'static str) {
        match self {
            ElementType::Scalar(t) => (t.marshal_code(), t.native_name()),
            ElementType::Array(t) => ('P', t.array_struct_name()),
        }
    }

    pub fn marshal_code(self) -> char {
        self.marshal().0
    }

    pub fn native_name(self) -> &'static str {
        self.marshal().1
    }
}

impl From<ScalarType> for ElementType {
    fn from(t: ScalarType) -> Self {
        ElementType::Scalar(t)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::Scalar(t) => write!(f, "{t}"),
            ElementType::Array(t) => write!(f, "{t}[]"),
        }
    }
}

impl FromStr for ElementType {
    type Err = BlockwiseError;

    /// Parses `float32`, `int32[]` and friends
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let parsed = match trimmed.strip_suffix("[]") {
            Some(inner) => inner.trim().parse().map(ElementType::Array),
            None => trimmed.parse().map(ElementType::Scalar),
        };
        parsed.map_err(|_| BlockwiseError::UnsupportedType(s.to_string()))
    }
}

/// Marshal signature of a kernel: one code per declared argument followed by
/// the implicit trailing block count
pub fn kernel_signature(arg_types: impl IntoIterator<Item = ElementType>) -> String {
    let mut sig: String = arg_types.into_iter().map(ElementType::marshal_code).collect();
    sig.push(ScalarType::I32.marshal_code());
    sig
}

/// Rust primitive usable as a host array element or scalar argument
pub trait Element: Copy + Default + fmt::Debug + 'static {
    const SCALAR: ScalarType;

    fn write_ne_bytes(self, out: &mut Vec<u8>);

    /// Decodes one element; `bytes` has exactly `SCALAR.size_bytes()` bytes
    fn read_ne_bytes(bytes: &[u8]) -> Self;

    fn into_scalar(self) -> ScalarValue;
}

/// Typed scalar kernel argument
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

macro_rules! impl_element {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const SCALAR: ScalarType = ScalarType::$variant;

                fn write_ne_bytes(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_ne_bytes());
                }

                fn read_ne_bytes(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_ne_bytes(raw)
                }

                fn into_scalar(self) -> ScalarValue {
                    ScalarValue::$variant(self)
                }
            }

            impl From<$ty> for ScalarValue {
                fn from(v: $ty) -> Self {
                    ScalarValue::$variant(v)
                }
            }
        )*

        impl ScalarValue {
            pub fn scalar_type(&self) -> ScalarType {
                match self {
                    $(ScalarValue::$variant(_) => ScalarType::$variant,)*
                }
            }

            /// Native-endian bytes, as passed to the launch
            pub fn to_ne_bytes(&self) -> Vec<u8> {
                let mut out = Vec::with_capacity(8);
                match *self {
                    $(ScalarValue::$variant(v) => v.write_ne_bytes(&mut out),)*
                }
                out
            }
        }
    };
}

impl_element! {
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}
