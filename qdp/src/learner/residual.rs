//! Error-feedback state owned by one data-parallel learner.

use crate::communicator::QuantizedCommunicator;
use crate::error::{QdpError, Result};
use crate::parameter::Parameter;
use crate::tensor::Tensor;
use crate::types::ParameterId;

/// Residual and stripe residual buffers of the quantized parameters.
///
/// Entry `i` of every list belongs to the `i`-th quantized parameter in
/// ascending id order, which is also the order gradients are submitted to the
/// quantized collective.
pub struct ResidualStore {
    ids: Vec<ParameterId>,
    residuals: Vec<Tensor>,
    stripe_residuals: Vec<Option<Tensor>>,
}

impl ResidualStore {
    /// Zero-filled buffers for `params`, which must be in ascending id order.
    pub fn new<'a>(
        params: impl IntoIterator<Item = &'a Parameter>,
        communicator: &dyn QuantizedCommunicator,
    ) -> Self {
        let mut store = Self {
            ids: Vec::new(),
            residuals: Vec::new(),
            stripe_residuals: Vec::new(),
        };
        for p in params {
            store.ids.push(p.id);
            store
                .residuals
                .push(Tensor::zeros(&p.shape, p.dtype, p.device));
            store.stripe_residuals.push(
                communicator
                    .stripe_shape(&p.shape)
                    .map(|shape| Tensor::zeros(&shape, p.dtype, p.device)),
            );
        }
        store
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Parameter ids in buffer order.
    pub fn ids(&self) -> &[ParameterId] {
        &self.ids
    }

    pub fn residuals(&self) -> &[Tensor] {
        &self.residuals
    }

    pub fn stripe_residuals(&self) -> &[Option<Tensor>] {
        &self.stripe_residuals
    }

    /// Fail unless `ids` is exactly the list the buffers were built for.
    pub fn check_alignment(&self, ids: &[ParameterId]) -> Result<()> {
        if ids != self.ids.as_slice() {
            return Err(QdpError::ResidualMisaligned {
                reason: format!(
                    "quantized gradients {ids:?} do not match residual buffers {:?}",
                    self.ids
                ),
            });
        }
        Ok(())
    }

    /// Mutable views handed to the quantized collective.
    pub(crate) fn buffers_mut(&mut self) -> (&mut [Tensor], &mut [Option<Tensor>]) {
        (&mut self.residuals, &mut self.stripe_residuals)
    }

    /// Zero every residual and every present stripe residual.
    pub fn reset(&mut self) {
        for r in &mut self.residuals {
            r.set_zero();
        }
        for s in self.stripe_residuals.iter_mut().flatten() {
            s.set_zero();
        }
    }

    /// True when no buffer holds carried error.
    pub fn is_zero(&self) -> Result<bool> {
        for r in &self.residuals {
            if !r.is_zero()? {
                return Ok(false);
            }
        }
        for s in self.stripe_residuals.iter().flatten() {
            if !s.is_zero()? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
