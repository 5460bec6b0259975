use std::collections::BTreeMap;
use std::sync::Arc;

use qdp::{
    DataType, Device, GradientMap, LocalCommunicator, MinibatchInfo, Parameter, QdpConfig,
    QdpError, QuantizedDataParallelLearner, Tensor,
};

use super::helpers::{RecordingLearner, gradients, recording_learner, run_workers};

fn embedding(device: Device) -> Parameter {
    Parameter::new(4, "emb", &[3, 10], DataType::F32, device).with_sparse_gradient()
}

#[tokio::test]
async fn test_sparse_columns_union_2_workers() {
    let results = run_workers(2, QdpConfig::default(), |comm, config| {
        let rank = comm.rank();
        let emb = embedding(Device::Gpu(0));
        let bias = Parameter::new(1, "bias", &[2], DataType::F32, Device::Gpu(0));
        let (mut learner, _log) = recording_learner(comm, config, vec![emb.clone(), bias.clone()]);

        let columns = if rank == 0 {
            vec![(1, vec![1.0, 1.0, 1.0]), (3, vec![2.0, 2.0, 2.0])]
        } else {
            vec![(3, vec![0.5, 0.5, 0.5]), (7, vec![4.0, 5.0, 6.0])]
        };
        let mut grads = gradients(&[(&bias, vec![1.0, 1.0])]);
        grads.insert(
            emb.clone(),
            Tensor::sparse_block_column(&emb.shape, emb.dtype, emb.device, columns).unwrap(),
        );

        learner
            .update(&mut grads, &mut MinibatchInfo::new(2, 0.0, 0.0), &mut 0)
            .unwrap();

        let merged = grads[&emb].sparse_column_map().unwrap();
        let expected: BTreeMap<u32, Vec<f64>> = [
            (1, vec![1.0, 1.0, 1.0]),
            (3, vec![2.5, 2.5, 2.5]),
            (7, vec![4.0, 5.0, 6.0]),
        ]
        .into_iter()
        .collect();
        assert_eq!(merged, expected);
        assert_eq!(grads[&emb].sparse_columns(), Some(&[1, 3, 7][..]));
        assert_eq!(grads[&bias].to_f64s().unwrap(), vec![2.0, 2.0]);
        grads[&emb].to_f64s().unwrap()
    })
    .await;

    assert_eq!(results[0], results[1]);
}

#[tokio::test]
async fn test_idle_worker_contributes_no_sparse_columns() {
    run_workers(2, QdpConfig::default(), |comm, config| {
        let rank = comm.rank();
        let emb = embedding(Device::Gpu(1));
        let (mut learner, _log) = recording_learner(comm, config, vec![emb.clone()]);

        let (mut grads, mut info) = if rank == 0 {
            let mut grads = GradientMap::new();
            grads.insert(
                emb.clone(),
                Tensor::sparse_block_column(
                    &emb.shape,
                    emb.dtype,
                    emb.device,
                    vec![(9, vec![1.0, 2.0, 3.0])],
                )
                .unwrap(),
            );
            (grads, MinibatchInfo::new(1, 0.0, 0.0))
        } else {
            (GradientMap::new(), MinibatchInfo::empty())
        };

        learner.update(&mut grads, &mut info, &mut 0).unwrap();
        assert_eq!(grads[&emb].sparse_columns(), Some(&[9][..]));
        assert_eq!(
            grads[&emb].sparse_column_map().unwrap()[&9],
            vec![1.0, 2.0, 3.0]
        );
    })
    .await;
}

#[test]
fn test_cpu_sparse_parameter_fails_fast() {
    let config = QdpConfig::default();
    let comm = LocalCommunicator::group(1, &config).unwrap().remove(0);
    let (inner, _log) = RecordingLearner::new(vec![embedding(Device::Cpu)]);
    let err = QuantizedDataParallelLearner::new(Arc::new(comm), false, Box::new(inner), &config)
        .err()
        .unwrap();
    assert!(matches!(
        err,
        QdpError::Unsupported {
            operation: "sparse_aggregate",
            ..
        }
    ));
}

#[test]
fn test_cpu_sparse_gradient_fails_before_any_collective() {
    let config = QdpConfig::default();
    let mut group = LocalCommunicator::group(2, &config).unwrap();
    // Any collective would fail on the missing peer instead.
    drop(group.pop());
    let emb = embedding(Device::Gpu(0));
    let (mut learner, log) = recording_learner(group.remove(0), &config, vec![emb.clone()]);

    let mut grads = GradientMap::new();
    grads.insert(emb.clone(), Tensor::empty_sparse(&emb.shape, emb.dtype, Device::Cpu));
    let err = learner
        .update(&mut grads, &mut MinibatchInfo::new(1, 0.0, 0.0), &mut 0)
        .unwrap_err();
    assert!(matches!(err, QdpError::Unsupported { .. }));
    assert!(log.lock().unwrap().is_empty());
}
