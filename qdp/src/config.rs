//! Runtime-configurable tuning parameters for qdp.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `QDP_`) or by constructing a custom `QdpConfig`.

use crate::error::{QdpError, Result};

/// Bit widths at or above this value disable quantization.
pub const FULL_PRECISION_BITS: u32 = 32;

/// Widest lossy quantization supported.
pub const MAX_QUANTIZED_BITS: u32 = 16;

/// Tuning parameters for quantized aggregation and the learner state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct QdpConfig {
    /// Bits per quantized element. `1` is one-bit quantization, values in
    /// `1..=16` give `2^bits` levels, `32` and above send full precision.
    pub quantization_bits: u32,

    /// One-bit quantization splits each column at zero; when false it splits
    /// at the column mean.
    pub zero_threshold_for_one_bit: bool,

    /// Quantize the contribution a worker makes to its own stripe.
    pub quantize_self_stripe: bool,

    /// Gradients with at most this many elements are aggregated exactly.
    pub exact_max_elements: usize,

    /// Locally accumulated samples required before the group synchronizes.
    /// `0` synchronizes on every step.
    pub sync_after_samples: usize,
}

impl Default for QdpConfig {
    fn default() -> Self {
        Self {
            quantization_bits: 1,
            zero_threshold_for_one_bit: true,
            quantize_self_stripe: true,
            exact_max_elements: 1024,
            sync_after_samples: 0,
        }
    }
}

impl QdpConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `QDP_QUANTIZATION_BITS`
    /// - `QDP_ZERO_THRESHOLD_FOR_ONE_BIT`
    /// - `QDP_QUANTIZE_SELF_STRIPE`
    /// - `QDP_EXACT_MAX_ELEMENTS`
    /// - `QDP_SYNC_AFTER_SAMPLES`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("QDP_QUANTIZATION_BITS") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.quantization_bits = n;
            }
        }
        if let Ok(v) = std::env::var("QDP_ZERO_THRESHOLD_FOR_ONE_BIT") {
            if let Ok(b) = v.parse::<bool>() {
                cfg.zero_threshold_for_one_bit = b;
            }
        }
        if let Ok(v) = std::env::var("QDP_QUANTIZE_SELF_STRIPE") {
            if let Ok(b) = v.parse::<bool>() {
                cfg.quantize_self_stripe = b;
            }
        }
        if let Ok(v) = std::env::var("QDP_EXACT_MAX_ELEMENTS") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.exact_max_elements = n;
            }
        }
        if let Ok(v) = std::env::var("QDP_SYNC_AFTER_SAMPLES") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.sync_after_samples = n;
            }
        }

        cfg
    }

    /// Reject bit widths no quantizer implements.
    pub fn validate(&self) -> Result<()> {
        let bits = self.quantization_bits;
        if bits == 0 || (bits > MAX_QUANTIZED_BITS && bits < FULL_PRECISION_BITS) {
            return Err(QdpError::configuration(format!(
                "quantization_bits must be in 1..={MAX_QUANTIZED_BITS} or >= {FULL_PRECISION_BITS}, got {bits}"
            )));
        }
        Ok(())
    }
}
