//! Defines the primitive element types an array can hold.

use crate::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;

/// Element type of a chunked array.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,

    // Signed integers
    I8,
    I16,
    I32,
    I64,

    // Unsigned integers
    U8,
    U16,
    U32,
    U64,

    // Floats
    F32,
    F64,
}

impl DataType {
    pub fn of<T: Element>() -> Self {
        T::DATA_TYPE
    }

    /// User-facing name of type. Used in errors, descriptors and debug messages.
    ///
    /// # Examples
    /// ```
    /// # use tessera_core::*;
    /// assert_eq!(DataType::I8.name(), "int8");
    /// assert_eq!(DataType::U32.name(), "uint32");
    /// ```
    pub fn name(&self) -> &'static str {
        use DataType::*;
        match self {
            Bool => "bool",
            I8 => "int8",
            I16 => "int16",
            I32 => "int32",
            I64 => "int64",
            U8 => "uint8",
            U16 => "uint16",
            U32 => "uint32",
            U64 => "uint64",
            F32 => "float32",
            F64 => "float64",
        }
    }

    /// Size of this data type in bytes.
    pub fn size_in_bytes(&self) -> usize {
        use DataType::*;
        match self {
            Bool | I8 | U8 => 1,
            I16 | U16 => 2,
            I32 | U32 | F32 => 4,
            I64 | U64 | F64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug)]
#[error("unknown data type {0:?}")]
pub struct UnknownDataType(String);

impl FromStr for DataType {
    type Err = UnknownDataType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use DataType::*;
        let dtype = match s.trim() {
            "bool" => Bool,
            "int8" | "i8" => I8,
            "int16" | "i16" => I16,
            "int32" | "i32" => I32,
            "int64" | "i64" => I64,
            "uint8" | "u8" => U8,
            "uint16" | "u16" => U16,
            "uint32" | "u32" => U32,
            "uint64" | "u64" => U64,
            "float32" | "f32" => F32,
            "float64" | "f64" => F64,
            other => return Err(UnknownDataType(other.to_string())),
        };

        Ok(dtype)
    }
}

/// Rust types that can be stored as elements of an array. Values are encoded little-endian.
pub trait Element: Copy + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($t:ident => $dtype:ident)*) => {
        $(
        impl Element for $t {
            const DATA_TYPE: DataType = DataType::$dtype;

            #[inline(always)]
            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            #[inline(always)]
            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                $t::from_le_bytes(buf)
            }
        }
        )*
    }
}

impl_element!(i8 => I8 i16 => I16 i32 => I32 i64 => I64
              u8 => U8 u16 => U16 u32 => U32 u64 => U64
              f32 => F32 f64 => F64);

impl Element for bool {
    const DATA_TYPE: DataType = DataType::Bool;

    fn write_le(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Encode a slice of elements into a little-endian byte buffer.
pub fn encode_elements<T: Element>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::DATA_TYPE.size_in_bytes());
    for &v in values {
        v.write_le(&mut out);
    }
    out
}

/// Decode a little-endian byte buffer into elements. Trailing bytes that do not form a
/// complete element are ignored.
pub fn decode_elements<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(T::DATA_TYPE.size_in_bytes())
        .map(T::read_le)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_names() {
        for dtype in &[
            DataType::Bool,
            DataType::I8,
            DataType::I64,
            DataType::U16,
            DataType::F32,
            DataType::F64,
        ] {
            assert_eq!(dtype.name().parse::<DataType>().unwrap(), *dtype);
        }

        assert!("complex128".parse::<DataType>().is_err());
    }

    #[test]
    fn test_elements() {
        let values = [1i64, -2, 3];
        let bytes = encode_elements(&values);
        assert_eq!(bytes.len(), 24);
        assert_eq!(decode_elements::<i64>(&bytes), values);

        let flags = encode_elements(&[true, false]);
        assert_eq!(flags, vec![1, 0]);
        assert_eq!(DataType::of::<f32>(), DataType::F32);
    }
}
