//! Collective primitives the data-parallel learner is built on.
//!
//! A communicator exposes its worker group and three blocking collectives.
//! Every worker in the group must issue the same collectives, in the same
//! order, over lists of the same length and shapes; a collective returns only
//! once every addressed worker has issued the matching call.

mod helpers;
pub mod local;
pub mod stripe;

pub use local::LocalCommunicator;
pub use stripe::stripe_columns;

use crate::error::Result;
use crate::tensor::Tensor;
use crate::types::Rank;

/// Identity of one worker in a communicator group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerDescriptor {
    pub global_rank: Rank,
    pub host_id: String,
}

/// Group communication used by the aggregation pipeline.
pub trait DistributedCommunicator: Send + Sync {
    /// All workers of the group, ordered by rank.
    fn workers(&self) -> Vec<WorkerDescriptor>;

    /// The worker this communicator instance belongs to.
    fn current_worker(&self) -> WorkerDescriptor;

    /// Overwrite every tensor with its exact sum across `workers`.
    fn aggregate_in_place(
        &self,
        tensors: &mut [&mut Tensor],
        workers: &[WorkerDescriptor],
    ) -> Result<()>;

    /// Sum sparse block-column tensors across the whole group.
    ///
    /// The result holds the union of the columns present on any worker.
    fn sparse_aggregate_in_place(&self, tensors: &mut [&mut Tensor]) -> Result<()>;

    /// Quantized collectives, if this communicator implements them.
    fn as_quantized(&self) -> Option<&dyn QuantizedCommunicator> {
        None
    }
}

/// Capability of communicators that can aggregate with lossy quantization.
pub trait QuantizedCommunicator: DistributedCommunicator {
    /// Bits per element the quantizer puts on the wire.
    fn quantization_bits(&self) -> u32;

    /// Shape of the stripe this worker reduces for a tensor of `shape`, or
    /// `None` when it owns no columns of that tensor.
    fn stripe_shape(&self, shape: &[usize]) -> Option<Vec<usize>>;

    /// Quantized all-reduce with error feedback.
    ///
    /// `residuals[i]` and `stripe_residuals[i]` belong to `gradients[i]`. On
    /// return every gradient holds the approximate cross-worker sum and both
    /// residual lists hold the error left over for the next round.
    fn quantized_aggregate_in_place(
        &self,
        gradients: &mut [&mut Tensor],
        residuals: &mut [Tensor],
        stripe_residuals: &mut [Option<Tensor>],
        workers: &[WorkerDescriptor],
    ) -> Result<()>;
}
