use std::collections::BTreeMap;

use crate::tensor::Tensor;
use crate::types::{DataType, Device, ParameterId, StorageFormat};

/// Descriptor of a learnable tensor.
///
/// Identity, ordering and hashing use `id` only, so a `GradientMap`
/// iterates in the same order on every worker.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub id: ParameterId,
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DataType,
    pub device: Device,
    /// Storage format of the gradients produced for this parameter.
    pub gradient_format: StorageFormat,
}

impl Parameter {
    /// Dense parameter.
    pub fn new(
        id: u64,
        name: impl Into<String>,
        shape: &[usize],
        dtype: DataType,
        device: Device,
    ) -> Self {
        Self {
            id: ParameterId(id),
            name: name.into(),
            shape: shape.to_vec(),
            dtype,
            device,
            gradient_format: StorageFormat::Dense,
        }
    }

    /// Parameter whose gradients arrive as sparse block-column tensors
    /// (embedding tables fed by sparse inputs, for instance).
    pub fn with_sparse_gradient(mut self) -> Self {
        self.gradient_format = StorageFormat::SparseBlockColumn;
        self
    }

    /// All-zero gradient of the right shape, type, device and format.
    pub fn zero_gradient(&self) -> Tensor {
        match self.gradient_format {
            StorageFormat::Dense => Tensor::zeros(&self.shape, self.dtype, self.device),
            StorageFormat::SparseBlockColumn => {
                Tensor::empty_sparse(&self.shape, self.dtype, self.device)
            }
        }
    }
}

impl PartialEq for Parameter {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Parameter {}

impl PartialOrd for Parameter {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Parameter {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl std::hash::Hash for Parameter {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Per-parameter gradients of one step, in canonical parameter order.
pub type GradientMap = BTreeMap<Parameter, Tensor>;
