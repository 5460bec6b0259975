use std::sync::Arc;

use qdp::{
    DataType, Device, DistributedCommunicator, LocalCommunicator, MinibatchInfo, Parameter,
    QdpConfig, QdpError, QuantizedDataParallelLearner, Result, Tensor, WorkerDescriptor,
};

use super::helpers::{RecordingLearner, gradients, recording_learner};

/// Communicator that can only aggregate exactly.
struct ExactOnly(LocalCommunicator);

impl DistributedCommunicator for ExactOnly {
    fn workers(&self) -> Vec<WorkerDescriptor> {
        self.0.workers()
    }

    fn current_worker(&self) -> WorkerDescriptor {
        self.0.current_worker()
    }

    fn aggregate_in_place(
        &self,
        tensors: &mut [&mut Tensor],
        workers: &[WorkerDescriptor],
    ) -> Result<()> {
        self.0.aggregate_in_place(tensors, workers)
    }

    fn sparse_aggregate_in_place(&self, tensors: &mut [&mut Tensor]) -> Result<()> {
        self.0.sparse_aggregate_in_place(tensors)
    }
}

fn params() -> Vec<Parameter> {
    vec![Parameter::new(1, "w", &[40, 40], DataType::F32, Device::Gpu(0))]
}

#[test]
fn test_async_buffered_update_is_rejected() {
    let config = QdpConfig::default();
    let comm = LocalCommunicator::group(1, &config).unwrap().remove(0);
    let (inner, _log) = RecordingLearner::new(params());
    let err = QuantizedDataParallelLearner::new(Arc::new(comm), true, Box::new(inner), &config)
        .err()
        .unwrap();
    assert!(matches!(err, QdpError::Configuration { .. }));
}

#[test]
fn test_communicator_without_quantization_is_rejected() {
    let config = QdpConfig::default();
    let comm = ExactOnly(LocalCommunicator::group(1, &config).unwrap().remove(0));
    assert!(comm.as_quantized().is_none());
    let (inner, _log) = RecordingLearner::new(params());
    let err = QuantizedDataParallelLearner::new(Arc::new(comm), false, Box::new(inner), &config)
        .err()
        .unwrap();
    assert!(matches!(err, QdpError::Configuration { .. }));
}

#[test]
fn test_half_precision_parameter_is_rejected() {
    let config = QdpConfig::default();
    let comm = LocalCommunicator::group(1, &config).unwrap().remove(0);
    let (inner, _log) = RecordingLearner::new(vec![
        Parameter::new(1, "bias", &[8], DataType::F32, Device::Gpu(0)),
        Parameter::new(2, "w", &[40, 40], DataType::F16, Device::Gpu(0)),
    ]);
    let err = QuantizedDataParallelLearner::new(Arc::new(comm), false, Box::new(inner), &config)
        .err()
        .unwrap();
    assert!(matches!(err, QdpError::Configuration { .. }), "{err}");
}

#[test]
fn test_unsupported_bit_widths_are_rejected() {
    for bits in [0, 17, 31] {
        let config = QdpConfig {
            quantization_bits: bits,
            ..QdpConfig::default()
        };
        assert!(matches!(
            LocalCommunicator::group(2, &config),
            Err(QdpError::Configuration { .. })
        ));
    }
    for bits in [1, 2, 16, 32, 64] {
        let config = QdpConfig {
            quantization_bits: bits,
            ..QdpConfig::default()
        };
        assert!(LocalCommunicator::group(2, &config).is_ok());
    }
}

#[test]
fn test_residuals_cover_quantized_parameters_only() {
    let config = QdpConfig::default();
    let comm = LocalCommunicator::group(1, &config).unwrap().remove(0);
    let params = vec![
        Parameter::new(5, "w2", &[33, 33], DataType::F32, Device::Gpu(0)),
        Parameter::new(1, "bias", &[4096], DataType::F32, Device::Gpu(0)),
        Parameter::new(3, "w1", &[32, 32], DataType::F32, Device::Gpu(0)),
        Parameter::new(2, "w0", &[64, 64], DataType::F64, Device::Cpu),
        Parameter::new(4, "emb", &[8, 1000], DataType::F32, Device::Gpu(0)).with_sparse_gradient(),
    ];
    let (learner, _log) = recording_learner(comm, &config, params);

    let ids: Vec<u64> = learner.residuals().ids().iter().map(|id| id.0).collect();
    assert_eq!(ids, vec![2, 5]);
    let ordered: Vec<u64> = learner.parameters().iter().map(|p| p.id.0).collect();
    assert_eq!(ordered, vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_stop_request_is_propagated() {
    let config = QdpConfig::default();
    let comm = LocalCommunicator::group(1, &config).unwrap().remove(0);
    let bias = Parameter::new(1, "bias", &[2], DataType::F32, Device::Gpu(0));
    let (inner, _log) = RecordingLearner::new(vec![bias.clone()]);
    let mut learner = QuantizedDataParallelLearner::new(
        Arc::new(comm),
        false,
        Box::new(inner.stopping_after(2)),
        &config,
    )
    .unwrap();

    let mut keep_going = Vec::new();
    for _ in 0..2 {
        let mut grads = gradients(&[(&bias, vec![1.0, 1.0])]);
        let status = learner
            .update(&mut grads, &mut MinibatchInfo::new(1, 0.0, 0.0), &mut 0)
            .unwrap();
        keep_going.push(status.continue_learning);
    }
    assert_eq!(keep_going, vec![true, false]);
}
