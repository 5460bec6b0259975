use qdp::{DataType, Device, Dictionary, MinibatchInfo, Parameter, QdpConfig, QdpError};

use super::helpers::{gradients, recording_learner, run_workers};

fn weight() -> Parameter {
    Parameter::new(1, "w", &[8, 160], DataType::F64, Device::Gpu(0))
}

fn ramp(rank: u32) -> Vec<f64> {
    (0..8 * 160)
        .map(|i| (i % 8) as f64 * 0.3 - rank as f64)
        .collect()
}

#[tokio::test]
async fn test_checkpoint_zeroes_residuals() {
    let checkpoints = run_workers(2, QdpConfig::default(), |comm, config| {
        let rank = comm.rank();
        let w = weight();
        let (mut learner, _log) = recording_learner(comm, config, vec![w.clone()]);

        for _ in 0..2 {
            let mut grads = gradients(&[(&w, ramp(rank))]);
            learner
                .update(&mut grads, &mut MinibatchInfo::new(3, 0.0, 0.0), &mut 0)
                .unwrap();
        }
        assert!(!learner.residuals().is_zero().unwrap());

        let checkpoint = learner.create_checkpoint().unwrap();
        assert!(learner.residuals().is_zero().unwrap());
        assert_eq!(checkpoint.get_u64("world_size"), Some(2));
        assert_eq!(checkpoint.get_u64("quantization_bits"), Some(1));

        let inner = Dictionary::from_bytes(checkpoint.get_bytes("learner").unwrap()).unwrap();
        assert_eq!(inner.get_u64("updates"), Some(2));
        checkpoint.to_bytes().unwrap()
    })
    .await;

    // Resume on a group of a different size.
    let saved = Dictionary::from_bytes(&checkpoints[0]).unwrap();
    run_workers(3, QdpConfig::default(), move |comm, config| {
        let rank = comm.rank();
        let w = weight();
        let (mut learner, _log) = recording_learner(comm, config, vec![w.clone()]);
        learner.restore_from_checkpoint(&saved).unwrap();
        assert!(learner.residuals().is_zero().unwrap());

        let mut grads = gradients(&[(&w, ramp(rank))]);
        let status = learner
            .update(&mut grads, &mut MinibatchInfo::new(1, 0.0, 0.0), &mut 0)
            .unwrap();
        assert!(status.synchronized);
    })
    .await;
}

#[tokio::test]
async fn test_checkpoint_waits_for_pending_samples() {
    let config = QdpConfig {
        sync_after_samples: 5,
        ..QdpConfig::default()
    };
    run_workers(2, config, |comm, config| {
        let w = weight();
        let (mut learner, _log) = recording_learner(comm, config, vec![w.clone()]);

        let mut grads = gradients(&[(&w, ramp(0))]);
        learner
            .update(&mut grads, &mut MinibatchInfo::new(2, 0.0, 0.0), &mut 0)
            .unwrap();
        assert!(matches!(
            learner.create_checkpoint(),
            Err(QdpError::PendingAccumulation { samples: 2 })
        ));

        let mut grads = gradients(&[(&w, ramp(0))]);
        let status = learner
            .update(&mut grads, &mut MinibatchInfo::new(3, 0.0, 0.0), &mut 0)
            .unwrap();
        assert!(status.synchronized);
        assert!(learner.create_checkpoint().is_ok());
    })
    .await;
}

#[test]
fn test_restore_discards_pending_samples() {
    let config = QdpConfig {
        sync_after_samples: 100,
        ..QdpConfig::default()
    };
    let comm = qdp::LocalCommunicator::group(1, &config).unwrap().remove(0);
    let w = weight();
    let (mut learner, _log) = recording_learner(comm, &config, vec![w.clone()]);
    let saved = learner.create_checkpoint().unwrap();

    let mut grads = gradients(&[(&w, ramp(0))]);
    learner
        .update(&mut grads, &mut MinibatchInfo::new(7, 0.0, 0.0), &mut 0)
        .unwrap();
    assert_eq!(learner.pending_samples(), 7);

    learner.restore_from_checkpoint(&saved).unwrap();
    assert_eq!(learner.pending_samples(), 0);
}
