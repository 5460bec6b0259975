//! Quantizer trait and wire format for quantized column blocks.

use crate::error::{QdpError, Result};

/// Quantized representation of a contiguous block of matrix columns.
///
/// Wire format: `[rows:u32][cols:u32][payload]` where the payload layout is
/// owned by the quantizer that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedColumns {
    pub rows: usize,
    pub cols: usize,
    /// Quantizer-specific payload.
    pub data: Vec<u8>,
}

impl QuantizedColumns {
    /// Number of logical elements represented.
    pub fn numel(&self) -> usize {
        self.rows * self.cols
    }

    /// Serialize with the `[rows][cols]` header.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.data.len());
        out.extend_from_slice(&(self.rows as u32).to_le_bytes());
        out.extend_from_slice(&(self.cols as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse bytes produced by [`QuantizedColumns::to_wire`].
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(QdpError::BufferSizeMismatch {
                expected: 8,
                actual: bytes.len(),
            });
        }
        let rows = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let cols = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        Ok(Self {
            rows,
            cols,
            data: bytes[8..].to_vec(),
        })
    }
}

/// Trait for gradient quantizers.
///
/// Implementations quantize a column-major block column by column. Error
/// feedback runs through `residual`: on entry it holds the error carried from
/// the previous round; the quantizer adds `input` to it, quantizes the sum,
/// and leaves behind `sum - dequantize(quantized)`. Start from a zero-filled
/// residual of the same length as `input`.
pub trait Quantizer: Send + Sync {
    /// Bits per element on the wire.
    fn bits(&self) -> u32;

    /// Quantize `input` (`rows` x `input.len() / rows`, column-major).
    fn quantize(&self, input: &[f64], rows: usize, residual: &mut [f64]) -> QuantizedColumns;

    /// Expand `quantized` into `output`, which must hold `quantized.numel()` values.
    fn dequantize(&self, quantized: &QuantizedColumns, output: &mut [f64]) -> Result<()>;
}

/// Column count of a `rows`-high block with `len` elements.
pub(crate) fn block_cols(len: usize, rows: usize) -> usize {
    if rows == 0 { 0 } else { len / rows }
}

pub(crate) fn check_output(quantized: &QuantizedColumns, output: &[f64]) -> Result<()> {
    if output.len() != quantized.numel() {
        return Err(QdpError::ShapeMismatch {
            operation: "dequantize",
            expected: vec![quantized.rows, quantized.cols],
            actual: vec![output.len()],
        });
    }
    Ok(())
}
