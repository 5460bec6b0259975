//! Element-wise primitives over little-endian tensor bytes.
//!
//! Tensors keep their elements as raw bytes tagged with a `DataType`. These
//! helpers widen them to `f64` for arithmetic and narrow them back.

use crate::error::{QdpError, Result};
use crate::types::DataType;

/// Read/write a value from/to a little-endian byte slice (alignment-safe).
trait LeBytes: Sized + Copy {
    const SIZE: usize;
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
}

macro_rules! impl_le_bytes {
    ($($ty:ty => $size:expr),*) => {
        $(
            impl LeBytes for $ty {
                const SIZE: usize = $size;

                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; $size];
                    raw.copy_from_slice(&bytes[..$size]);
                    <$ty>::from_le_bytes(raw)
                }
                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes[..$size].copy_from_slice(&self.to_le_bytes());
                }
                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }
                #[inline]
                fn from_f64(v: f64) -> Self {
                    v as $ty
                }
            }
        )*
    };
}

impl_le_bytes!(f32 => 4, f64 => 8);

fn check_len(bytes: &[u8], count: usize, dtype: DataType) -> Result<()> {
    let expected = count * dtype.size_in_bytes();
    if bytes.len() != expected {
        return Err(QdpError::BufferSizeMismatch {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn read_typed<T: LeBytes>(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(T::SIZE)
        .map(|c| T::read_le(c).to_f64())
        .collect()
}

fn write_typed<T: LeBytes>(values: &[f64], bytes: &mut [u8]) {
    for (v, c) in values.iter().zip(bytes.chunks_exact_mut(T::SIZE)) {
        T::from_f64(*v).write_le(c);
    }
}

fn add_typed<T: LeBytes + std::ops::Add<Output = T>>(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.chunks_exact_mut(T::SIZE).zip(src.chunks_exact(T::SIZE)) {
        let sum = T::read_le(d) + T::read_le(s);
        sum.write_le(d);
    }
}

/// Widen `bytes` (a whole number of `dtype` elements) to `f64`.
pub fn read_f64s(bytes: &[u8], dtype: DataType) -> Result<Vec<f64>> {
    let size = dtype.size_in_bytes();
    if bytes.len() % size != 0 {
        return Err(QdpError::BufferSizeMismatch {
            expected: bytes.len() / size * size,
            actual: bytes.len(),
        });
    }
    match dtype {
        DataType::F32 => Ok(read_typed::<f32>(bytes)),
        DataType::F64 => Ok(read_typed::<f64>(bytes)),
        DataType::F16 => Err(QdpError::UnsupportedDType { dtype, op: "read" }),
    }
}

/// Narrow `values` into `bytes`, which must hold exactly `values.len()` elements.
pub fn write_f64s(values: &[f64], bytes: &mut [u8], dtype: DataType) -> Result<()> {
    check_len(bytes, values.len(), dtype)?;
    match dtype {
        DataType::F32 => write_typed::<f32>(values, bytes),
        DataType::F64 => write_typed::<f64>(values, bytes),
        DataType::F16 => return Err(QdpError::UnsupportedDType { dtype, op: "write" }),
    }
    Ok(())
}

/// Element-wise `dst[i] += src[i]` in the native precision of `dtype`.
///
/// `dst` and `src` must both contain exactly `count * dtype.size_in_bytes()` bytes.
pub fn add_slice(dst: &mut [u8], src: &[u8], count: usize, dtype: DataType) -> Result<()> {
    check_len(dst, count, dtype)?;
    check_len(src, count, dtype)?;
    match dtype {
        DataType::F32 => add_typed::<f32>(dst, src),
        DataType::F64 => add_typed::<f64>(dst, src),
        DataType::F16 => return Err(QdpError::UnsupportedDType { dtype, op: "add" }),
    }
    Ok(())
}

/// Encode `values` as `dtype` bytes.
pub fn encode_f64s(values: &[f64], dtype: DataType) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; values.len() * dtype.size_in_bytes()];
    write_f64s(values, &mut bytes, dtype)?;
    Ok(bytes)
}
