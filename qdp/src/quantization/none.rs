//! Full-precision pass-through. Sends every value as `f64`.

use crate::error::{QdpError, Result};

use super::traits::{QuantizedColumns, Quantizer, block_cols, check_output};

/// Lossless quantizer; the residual is always left at zero.
pub struct FullPrecision;

impl Quantizer for FullPrecision {
    fn bits(&self) -> u32 {
        64
    }

    fn quantize(&self, input: &[f64], rows: usize, residual: &mut [f64]) -> QuantizedColumns {
        let mut data = Vec::with_capacity(input.len() * 8);
        for (r, &v) in residual.iter_mut().zip(input) {
            data.extend_from_slice(&(*r + v).to_le_bytes());
            *r = 0.0;
        }
        QuantizedColumns {
            rows,
            cols: block_cols(input.len(), rows),
            data,
        }
    }

    fn dequantize(&self, quantized: &QuantizedColumns, output: &mut [f64]) -> Result<()> {
        check_output(quantized, output)?;
        if quantized.data.len() != output.len() * 8 {
            return Err(QdpError::BufferSizeMismatch {
                expected: output.len() * 8,
                actual: quantized.data.len(),
            });
        }
        for (o, chunk) in output.iter_mut().zip(quantized.data.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *o = f64::from_le_bytes(raw);
        }
        Ok(())
    }
}
