pub mod levels;
pub mod none;
pub mod traits;

use std::sync::Arc;

pub use levels::LevelQuantizer;
pub use none::FullPrecision;
pub use traits::{QuantizedColumns, Quantizer};

use crate::config::{FULL_PRECISION_BITS, QdpConfig};
use crate::error::Result;

/// Build the quantizer selected by `config.quantization_bits`.
pub fn quantizer_for(config: &QdpConfig) -> Result<Arc<dyn Quantizer>> {
    config.validate()?;
    if config.quantization_bits >= FULL_PRECISION_BITS {
        Ok(Arc::new(FullPrecision))
    } else {
        Ok(Arc::new(LevelQuantizer::new(
            config.quantization_bits,
            config.zero_threshold_for_one_bit,
        )?))
    }
}
