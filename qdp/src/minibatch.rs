use crate::tensor::Tensor;

/// Per-step metadata travelling with the gradients.
///
/// After a synchronizing update, `num_samples`, `training_loss` and
/// `eval_criterion` hold the sums across the worker group.
#[derive(Debug, Clone)]
pub struct MinibatchInfo {
    pub num_samples: usize,
    pub training_loss: Tensor,
    pub eval_criterion: Tensor,
    pub at_end_of_sweep: bool,
}

impl MinibatchInfo {
    /// Info for a minibatch of `num_samples` with scalar loss and criterion sums.
    pub fn new(num_samples: usize, training_loss: f64, eval_criterion: f64) -> Self {
        Self {
            num_samples,
            training_loss: Tensor::scalar(training_loss),
            eval_criterion: Tensor::scalar(eval_criterion),
            at_end_of_sweep: false,
        }
    }

    /// Info for a worker that has run out of local data.
    pub fn empty() -> Self {
        Self::new(0, 0.0, 0.0)
    }

    pub fn with_end_of_sweep(mut self, at_end_of_sweep: bool) -> Self {
        self.at_end_of_sweep = at_end_of_sweep;
        self
    }

    /// True when this step carries no samples.
    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }
}
