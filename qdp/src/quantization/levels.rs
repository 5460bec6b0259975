//! Column-wise uniform quantization with `2^bits` levels.
//!
//! Each column is encoded as `[lower:f64][step:f64][codes]`, codes bit-packed
//! LSB first and padded to a whole byte per column. An element decodes to
//! `lower + code * step`.

use crate::config::MAX_QUANTIZED_BITS;
use crate::error::{QdpError, Result};

use super::traits::{QuantizedColumns, Quantizer, block_cols, check_output};

/// Lossy column quantizer with error feedback.
///
/// With one bit, each column is split at a threshold (zero, or the column
/// mean) and both halves are reconstructed as their means. With more bits,
/// the column's `[min, max]` range is divided into `2^bits - 1` equal steps
/// and each value rounds to the nearest level.
pub struct LevelQuantizer {
    bits: u32,
    zero_threshold: bool,
}

impl LevelQuantizer {
    pub fn new(bits: u32, zero_threshold_for_one_bit: bool) -> Result<Self> {
        if !(1..=MAX_QUANTIZED_BITS).contains(&bits) {
            return Err(QdpError::configuration(format!(
                "level quantization takes 1..={MAX_QUANTIZED_BITS} bits, got {bits}"
            )));
        }
        Ok(Self {
            bits,
            zero_threshold: zero_threshold_for_one_bit,
        })
    }

    fn levels(&self) -> u32 {
        1 << self.bits
    }

    fn column_bytes(&self, rows: usize) -> usize {
        16 + (rows * self.bits as usize).div_ceil(8)
    }

    /// `(lower, step)` for one column.
    fn column_grid(&self, column: &[f64]) -> (f64, f64) {
        if column.is_empty() {
            return (0.0, 0.0);
        }
        if self.bits == 1 {
            let threshold = self.threshold(column);
            let (mut lo_sum, mut lo_n, mut hi_sum, mut hi_n) = (0.0, 0usize, 0.0, 0usize);
            for &v in column {
                if v >= threshold {
                    hi_sum += v;
                    hi_n += 1;
                } else {
                    lo_sum += v;
                    lo_n += 1;
                }
            }
            let hi = if hi_n > 0 { hi_sum / hi_n as f64 } else { 0.0 };
            let lo = if lo_n > 0 { lo_sum / lo_n as f64 } else { hi };
            let hi = if hi_n > 0 { hi } else { lo };
            return (lo, hi - lo);
        }

        let min = column.iter().copied().fold(f64::INFINITY, f64::min);
        let max = column.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let step = (max - min) / (self.levels() - 1) as f64;
        if step.is_finite() && step > 0.0 {
            (min, step)
        } else {
            (min, 0.0)
        }
    }

    fn threshold(&self, column: &[f64]) -> f64 {
        if self.zero_threshold {
            0.0
        } else {
            column.iter().sum::<f64>() / column.len() as f64
        }
    }

    fn code(&self, v: f64, lower: f64, step: f64, threshold: f64) -> u32 {
        if self.bits == 1 {
            return u32::from(step != 0.0 && v >= threshold);
        }
        if step == 0.0 {
            return 0;
        }
        let max_code = (self.levels() - 1) as f64;
        ((v - lower) / step).round().clamp(0.0, max_code) as u32
    }
}

fn pack(codes: &[u32], bits: u32, out: &mut [u8]) {
    let bits = bits as usize;
    for (i, &code) in codes.iter().enumerate() {
        for b in 0..bits {
            if (code >> b) & 1 == 1 {
                let pos = i * bits + b;
                out[pos / 8] |= 1 << (pos % 8);
            }
        }
    }
}

fn unpack(packed: &[u8], bits: u32, index: usize) -> u32 {
    let bits = bits as usize;
    let mut code = 0u32;
    for b in 0..bits {
        let pos = index * bits + b;
        if (packed[pos / 8] >> (pos % 8)) & 1 == 1 {
            code |= 1 << b;
        }
    }
    code
}

fn read_f64(bytes: &[u8]) -> f64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    f64::from_le_bytes(raw)
}

impl Quantizer for LevelQuantizer {
    fn bits(&self) -> u32 {
        self.bits
    }

    fn quantize(&self, input: &[f64], rows: usize, residual: &mut [f64]) -> QuantizedColumns {
        let cols = block_cols(input.len(), rows);
        let col_bytes = self.column_bytes(rows);
        let mut data = vec![0u8; cols * col_bytes];
        let mut codes = vec![0u32; rows];

        for c in 0..cols {
            let span = c * rows..(c + 1) * rows;
            let column = &mut residual[span.clone()];
            for (r, &v) in column.iter_mut().zip(&input[span]) {
                *r += v;
            }

            let (lower, step) = self.column_grid(column);
            let threshold = self.threshold(column);
            for (code, r) in codes.iter_mut().zip(column.iter_mut()) {
                *code = self.code(*r, lower, step, threshold);
                *r -= lower + *code as f64 * step;
            }

            let out = &mut data[c * col_bytes..(c + 1) * col_bytes];
            out[..8].copy_from_slice(&lower.to_le_bytes());
            out[8..16].copy_from_slice(&step.to_le_bytes());
            pack(&codes, self.bits, &mut out[16..]);
        }

        QuantizedColumns { rows, cols, data }
    }

    fn dequantize(&self, quantized: &QuantizedColumns, output: &mut [f64]) -> Result<()> {
        check_output(quantized, output)?;
        let rows = quantized.rows;
        let col_bytes = self.column_bytes(rows);
        let expected = quantized.cols * col_bytes;
        if quantized.data.len() != expected {
            return Err(QdpError::BufferSizeMismatch {
                expected,
                actual: quantized.data.len(),
            });
        }

        for c in 0..quantized.cols {
            let col = &quantized.data[c * col_bytes..(c + 1) * col_bytes];
            let lower = read_f64(&col[..8]);
            let step = read_f64(&col[8..16]);
            for (i, o) in output[c * rows..(c + 1) * rows].iter_mut().enumerate() {
                *o = lower + unpack(&col[16..], self.bits, i) as f64 * step;
            }
        }
        Ok(())
    }
}
