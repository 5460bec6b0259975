pub mod buffer;
pub mod classify;
pub mod data_parallel;
pub mod residual;

pub use buffer::GradientBuffer;
pub use classify::{Bucket, GradientClassifier};
pub use data_parallel::{QuantizedDataParallelLearner, UpdateStatus};
pub use residual::ResidualStore;

use crate::checkpoint::Dictionary;
use crate::error::Result;
use crate::parameter::{GradientMap, Parameter};

/// Single-node parameter update wrapped by the data-parallel learner.
pub trait Learner: Send {
    /// Parameters this learner updates.
    fn parameters(&self) -> &[Parameter];

    /// Apply `gradients`, summed over `sample_count` samples.
    ///
    /// Returns `false` once learning should stop.
    fn update(&mut self, gradients: &mut GradientMap, sample_count: usize, at_end_of_sweep: bool)
    -> bool;

    /// State needed to resume this learner.
    fn create_checkpoint(&self) -> Result<Dictionary> {
        Ok(Dictionary::new())
    }

    /// Restore state produced by [`Learner::create_checkpoint`].
    fn restore_from_checkpoint(&mut self, _checkpoint: &Dictionary) -> Result<()> {
        Ok(())
    }
}
