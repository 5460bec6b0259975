//! Routing of gradients to aggregation paths.

use crate::error::{QdpError, Result};
use crate::types::{Device, StorageFormat};

/// Aggregation path a gradient takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    /// Sparse block-column gradients; summed by the sparse collective.
    Sparse,
    /// Vectors and small tensors; summed at full precision.
    Exact,
    /// Large dense tensors; quantized with error feedback.
    Quantized,
}

/// Pure function of (format, device, shape) deciding each gradient's bucket.
#[derive(Debug, Clone, Copy)]
pub struct GradientClassifier {
    exact_max_elements: usize,
}

impl GradientClassifier {
    pub fn new(exact_max_elements: usize) -> Self {
        Self { exact_max_elements }
    }

    /// Bucket for a gradient with the given storage.
    ///
    /// Sparse block-column storage on the CPU has no aggregation path and
    /// fails immediately.
    pub fn classify(&self, format: StorageFormat, device: Device, shape: &[usize]) -> Result<Bucket> {
        if format == StorageFormat::SparseBlockColumn {
            if device == Device::Cpu {
                return Err(QdpError::unsupported(
                    "sparse_aggregate",
                    format!("sparse block-column gradient of shape {shape:?} on the CPU"),
                ));
            }
            return Ok(Bucket::Sparse);
        }
        let numel: usize = shape.iter().product();
        if shape.len() <= 1 || numel <= self.exact_max_elements {
            Ok(Bucket::Exact)
        } else {
            Ok(Bucket::Quantized)
        }
    }
}
