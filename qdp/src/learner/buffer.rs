//! Local accumulation between synchronizing steps.

use crate::error::Result;
use crate::minibatch::MinibatchInfo;
use crate::parameter::GradientMap;
use crate::tensor::Tensor;

/// Sum of the gradients and minibatch statistics of unsynchronized steps.
#[derive(Default)]
pub struct GradientBuffer {
    gradients: GradientMap,
    samples: usize,
    training_loss: Option<Tensor>,
    eval_criterion: Option<Tensor>,
    at_end_of_sweep: bool,
}

impl GradientBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples held back from the group.
    pub fn pending_samples(&self) -> usize {
        self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0 && self.gradients.is_empty()
    }

    /// Add one step's gradients and statistics.
    pub fn accumulate(&mut self, gradients: &GradientMap, info: &MinibatchInfo) -> Result<()> {
        for (param, grad) in gradients {
            match self.gradients.get_mut(param) {
                Some(sum) => sum.add_assign(grad)?,
                None => {
                    self.gradients.insert(param.clone(), grad.clone());
                }
            }
        }
        add_into(&mut self.training_loss, &info.training_loss)?;
        add_into(&mut self.eval_criterion, &info.eval_criterion)?;
        self.samples += info.num_samples;
        self.at_end_of_sweep |= info.at_end_of_sweep;
        Ok(())
    }

    /// Fold the buffer into the current step and clear it.
    ///
    /// Afterwards `gradients` and `info` describe every step since the last
    /// synchronization.
    pub fn drain_into(&mut self, gradients: &mut GradientMap, info: &mut MinibatchInfo) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        for (param, mut sum) in std::mem::take(&mut self.gradients) {
            if let Some(current) = gradients.get(&param) {
                sum.add_assign(current)?;
            }
            gradients.insert(param, sum);
        }
        if let Some(loss) = self.training_loss.take() {
            info.training_loss.add_assign(&loss)?;
        }
        if let Some(criterion) = self.eval_criterion.take() {
            info.eval_criterion.add_assign(&criterion)?;
        }
        info.num_samples += std::mem::take(&mut self.samples);
        info.at_end_of_sweep |= std::mem::take(&mut self.at_end_of_sweep);
        Ok(())
    }
}

fn add_into(slot: &mut Option<Tensor>, value: &Tensor) -> Result<()> {
    match slot {
        Some(sum) => sum.add_assign(value),
        None => {
            *slot = Some(value.clone());
            Ok(())
        }
    }
}
