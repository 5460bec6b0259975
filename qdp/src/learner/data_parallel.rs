//! Synchronous data-parallel learner with quantized gradient aggregation.
//!
//! Every synchronizing step issues exactly three collectives, in this order,
//! whatever the local data looks like:
//!
//! 1. exact aggregate of the small gradients, loss, criterion and sample count;
//! 2. quantized aggregate of the large dense gradients;
//! 3. sparse aggregate of the block-column gradients.
//!
//! A worker that has run out of data still takes part with zero gradients,
//! and the lists it submits are built in parameter-id order, so all workers
//! stay in lockstep.

use std::sync::Arc;

use crate::checkpoint::{Dictionary, DictionaryValue};
use crate::communicator::DistributedCommunicator;
use crate::config::QdpConfig;
use crate::error::{QdpError, Result};
use crate::learner::buffer::GradientBuffer;
use crate::learner::classify::{Bucket, GradientClassifier};
use crate::learner::residual::ResidualStore;
use crate::learner::Learner;
use crate::minibatch::MinibatchInfo;
use crate::parameter::{GradientMap, Parameter};
use crate::tensor::Tensor;
use crate::types::ParameterId;

const LEARNER_KEY: &str = "learner";
const QUANTIZATION_BITS_KEY: &str = "quantization_bits";
const WORLD_SIZE_KEY: &str = "world_size";

/// Outcome of one [`QuantizedDataParallelLearner::update`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateStatus {
    /// The step ran the collective sequence; false while accumulating locally.
    pub synchronized: bool,
    /// No worker in the group contributed samples.
    pub is_empty: bool,
    /// What the wrapped learner returned; true while accumulating.
    pub continue_learning: bool,
}

/// Wraps a single-node [`Learner`] and aggregates its gradients across the
/// communicator's group before every update.
pub struct QuantizedDataParallelLearner {
    communicator: Arc<dyn DistributedCommunicator>,
    learner: Box<dyn Learner>,
    parameters: Vec<Parameter>,
    classifier: GradientClassifier,
    residuals: ResidualStore,
    buffer: GradientBuffer,
    sync_after_samples: usize,
    quantization_bits: u32,
    world_size: usize,
}

impl QuantizedDataParallelLearner {
    /// Wrap `learner`.
    ///
    /// Fails when asynchronous buffered updates are requested, when the
    /// communicator cannot quantize, or when a parameter has no aggregation
    /// path (sparse gradients on the CPU, `F16` elements).
    pub fn new(
        communicator: Arc<dyn DistributedCommunicator>,
        use_async_buffered_update: bool,
        learner: Box<dyn Learner>,
        config: &QdpConfig,
    ) -> Result<Self> {
        if use_async_buffered_update {
            return Err(QdpError::configuration(
                "asynchronous buffered parameter update is not supported",
            ));
        }
        let Some(quantized) = communicator.as_quantized() else {
            return Err(QdpError::configuration(
                "communicator does not implement quantized aggregation",
            ));
        };

        let mut parameters = learner.parameters().to_vec();
        parameters.sort();
        if let Some(pair) = parameters.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(QdpError::configuration(format!(
                "parameter id {} is used by both {:?} and {:?}",
                pair[0].id, pair[0].name, pair[1].name
            )));
        }

        if let Some(p) = parameters.iter().find(|p| !p.dtype.is_reducible()) {
            return Err(QdpError::configuration(format!(
                "parameter {} ({:?}) has element type {}, which cannot be aggregated",
                p.id, p.name, p.dtype
            )));
        }

        let classifier = GradientClassifier::new(config.exact_max_elements);
        let mut quantized_params = Vec::new();
        for p in &parameters {
            if classifier.classify(p.gradient_format, p.device, &p.shape)? == Bucket::Quantized {
                quantized_params.push(p);
            }
        }
        let residuals = ResidualStore::new(quantized_params, quantized);
        let quantization_bits = quantized.quantization_bits();
        let world_size = communicator.workers().len();

        tracing::info!(
            rank = communicator.current_worker().global_rank,
            world_size,
            quantization_bits,
            parameters = parameters.len(),
            quantized = residuals.len(),
            sync_after_samples = config.sync_after_samples,
            "quantized data-parallel learner ready"
        );

        Ok(Self {
            communicator,
            learner,
            parameters,
            classifier,
            residuals,
            buffer: GradientBuffer::new(),
            sync_after_samples: config.sync_after_samples,
            quantization_bits,
            world_size,
        })
    }

    /// Aggregate this step's gradients across the group and apply them.
    ///
    /// While fewer than `sync_after_samples` samples have been seen locally
    /// since the last synchronization, the step is only buffered. Otherwise
    /// the buffered and current gradients are aggregated, `gradients` and
    /// `info` are overwritten with the group-wide sums, the wrapped learner is
    /// updated, and the global sample count is added to `total_samples_seen`.
    pub fn update(
        &mut self,
        gradients: &mut GradientMap,
        info: &mut MinibatchInfo,
        total_samples_seen: &mut usize,
    ) -> Result<UpdateStatus> {
        self.check_known(gradients)?;

        let pending = self.buffer.pending_samples() + info.num_samples;
        if !info.is_empty() && pending < self.sync_after_samples {
            self.buffer.accumulate(gradients, info)?;
            tracing::debug!(
                pending,
                threshold = self.sync_after_samples,
                "accumulating gradients locally"
            );
            return Ok(UpdateStatus {
                synchronized: false,
                is_empty: false,
                continue_learning: true,
            });
        }

        // Gradients handed in with an empty minibatch are stale.
        if info.is_empty() {
            self.prepare_zero_gradients(gradients, info);
        }
        self.buffer.drain_into(gradients, info)?;
        self.check_complete(gradients)?;

        let local_samples = info.num_samples;
        self.aggregate(gradients, info)?;

        *total_samples_seen += info.num_samples;
        let continue_learning =
            self.learner
                .update(gradients, info.num_samples, info.at_end_of_sweep);

        tracing::debug!(
            local_samples,
            global_samples = info.num_samples,
            total_samples_seen = *total_samples_seen,
            continue_learning,
            "synchronized gradients"
        );

        Ok(UpdateStatus {
            synchronized: true,
            is_empty: info.is_empty(),
            continue_learning,
        })
    }

    /// Checkpoint state of this learner. Residual state is zeroed first and
    /// never written.
    pub fn create_checkpoint(&mut self) -> Result<Dictionary> {
        let pending = self.buffer.pending_samples();
        if pending > 0 {
            return Err(QdpError::PendingAccumulation { samples: pending });
        }
        self.residuals.reset();

        let mut checkpoint = Dictionary::new();
        checkpoint.insert(
            LEARNER_KEY,
            DictionaryValue::Bytes(self.learner.create_checkpoint()?.to_bytes()?),
        );
        checkpoint.insert(
            QUANTIZATION_BITS_KEY,
            DictionaryValue::U64(self.quantization_bits as u64),
        );
        checkpoint.insert(WORLD_SIZE_KEY, DictionaryValue::U64(self.world_size as u64));
        Ok(checkpoint)
    }

    /// Resume from [`QuantizedDataParallelLearner::create_checkpoint`] output.
    ///
    /// Residual state restarts at zero even if the group size or bit width
    /// changed since the checkpoint was taken.
    pub fn restore_from_checkpoint(&mut self, checkpoint: &Dictionary) -> Result<()> {
        let Some(bytes) = checkpoint.get_bytes(LEARNER_KEY) else {
            return Err(QdpError::Checkpoint(format!(
                "missing {LEARNER_KEY:?} entry"
            )));
        };
        self.learner
            .restore_from_checkpoint(&Dictionary::from_bytes(bytes)?)?;

        let saved_world = checkpoint.get_u64(WORLD_SIZE_KEY);
        let saved_bits = checkpoint.get_u64(QUANTIZATION_BITS_KEY);
        if saved_world != Some(self.world_size as u64)
            || saved_bits != Some(self.quantization_bits as u64)
        {
            tracing::warn!(
                ?saved_world,
                world_size = self.world_size,
                ?saved_bits,
                quantization_bits = self.quantization_bits,
                "resuming with a different group or quantization; residuals restart at zero"
            );
        }

        self.residuals.reset();
        self.buffer = GradientBuffer::new();
        tracing::info!(world_size = self.world_size, "restored from checkpoint");
        Ok(())
    }

    /// Error-feedback buffers, in quantized-parameter order.
    pub fn residuals(&self) -> &ResidualStore {
        &self.residuals
    }

    /// Parameters of the wrapped learner, in aggregation order.
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn learner(&self) -> &dyn Learner {
        self.learner.as_ref()
    }

    pub fn communicator(&self) -> &Arc<dyn DistributedCommunicator> {
        &self.communicator
    }

    /// Samples buffered locally and not yet synchronized.
    pub fn pending_samples(&self) -> usize {
        self.buffer.pending_samples()
    }

    fn check_known(&self, gradients: &GradientMap) -> Result<()> {
        for param in gradients.keys() {
            if self
                .parameters
                .binary_search_by_key(&param.id, |p| p.id)
                .is_err()
            {
                return Err(QdpError::UnknownParameter { id: param.id });
            }
        }
        Ok(())
    }

    fn check_complete(&self, gradients: &GradientMap) -> Result<()> {
        for param in &self.parameters {
            let Some(grad) = gradients.get(param) else {
                return Err(QdpError::MissingGradient { id: param.id });
            };
            if grad.shape() != param.shape.as_slice() {
                return Err(QdpError::ShapeMismatch {
                    operation: "update",
                    expected: param.shape.clone(),
                    actual: grad.shape().to_vec(),
                });
            }
            if grad.dtype() != param.dtype {
                return Err(QdpError::UnsupportedDType {
                    dtype: grad.dtype(),
                    op: "update",
                });
            }
        }
        Ok(())
    }

    /// Replace every gradient and statistic with zeros so an idle worker can
    /// still take part in the collectives.
    fn prepare_zero_gradients(&self, gradients: &mut GradientMap, info: &mut MinibatchInfo) {
        for param in &self.parameters {
            gradients.insert(param.clone(), param.zero_gradient());
        }
        info.training_loss.set_zero();
        info.eval_criterion.set_zero();
    }

    fn aggregate(&mut self, gradients: &mut GradientMap, info: &mut MinibatchInfo) -> Result<()> {
        let workers = self.communicator.workers();

        let mut exact: Vec<&mut Tensor> = Vec::new();
        let mut quantized: Vec<&mut Tensor> = Vec::new();
        let mut quantized_ids: Vec<ParameterId> = Vec::new();
        let mut sparse: Vec<&mut Tensor> = Vec::new();
        for (param, grad) in gradients.iter_mut() {
            match self
                .classifier
                .classify(grad.format(), grad.device(), grad.shape())?
            {
                Bucket::Exact => exact.push(grad),
                Bucket::Quantized => {
                    quantized_ids.push(param.id);
                    quantized.push(grad);
                }
                Bucket::Sparse => sparse.push(grad),
            }
        }
        self.residuals.check_alignment(&quantized_ids)?;

        tracing::trace!(
            exact = exact.len(),
            quantized = quantized.len(),
            sparse = sparse.len(),
            "classified gradients"
        );

        let mut sample_count = Tensor::scalar(info.num_samples as f64);
        let mut header = exact;
        header.push(&mut info.training_loss);
        header.push(&mut info.eval_criterion);
        header.push(&mut sample_count);
        self.communicator.aggregate_in_place(&mut header, &workers)?;
        info.num_samples = sample_count
            .stored_f64s()?
            .first()
            .map_or(0, |&n| n.round() as usize);

        let Some(quantized_comm) = self.communicator.as_quantized() else {
            return Err(QdpError::configuration(
                "communicator does not implement quantized aggregation",
            ));
        };
        let (residuals, stripe_residuals) = self.residuals.buffers_mut();
        quantized_comm.quantized_aggregate_in_place(
            &mut quantized,
            residuals,
            stripe_residuals,
            &workers,
        )?;

        self.communicator.sparse_aggregate_in_place(&mut sparse)?;
        Ok(())
    }
}
