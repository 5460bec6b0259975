use qdp::{DataType, Device, LocalCommunicator, MinibatchInfo, Parameter, QdpConfig};

use super::helpers::{gradients, recording_learner, run_workers};

fn bias() -> Parameter {
    Parameter::new(1, "bias", &[4], DataType::F64, Device::Gpu(0))
}

fn accumulating(threshold: usize) -> QdpConfig {
    QdpConfig {
        sync_after_samples: threshold,
        ..QdpConfig::default()
    }
}

#[test]
fn test_accumulating_steps_issue_no_collectives() {
    let config = accumulating(100);
    let mut group = LocalCommunicator::group(2, &config).unwrap();
    // A collective would fail against the dropped peer.
    drop(group.pop());
    let b = bias();
    let (mut learner, log) = recording_learner(group.remove(0), &config, vec![b.clone()]);

    for _ in 0..3 {
        let mut grads = gradients(&[(&b, vec![1.0; 4])]);
        let mut total = 0;
        let status = learner
            .update(&mut grads, &mut MinibatchInfo::new(10, 0.0, 0.0), &mut total)
            .unwrap();
        assert!(!status.synchronized);
        assert!(status.continue_learning);
        assert_eq!(total, 0);
    }
    assert_eq!(learner.pending_samples(), 30);
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_threshold_crossing_synchronizes_the_sum() {
    run_workers(2, accumulating(10), |comm, config| {
        let rank = comm.rank() as f64;
        let b = bias();
        let (mut learner, log) = recording_learner(comm, config, vec![b.clone()]);
        let mut total = 0;

        let mut synchronized = Vec::new();
        for step in 1..=3 {
            let mut grads = gradients(&[(&b, vec![step as f64 + rank; 4])]);
            let mut info = MinibatchInfo::new(4, 1.0, 0.0);
            let status = learner.update(&mut grads, &mut info, &mut total).unwrap();
            synchronized.push(status.synchronized);
            if status.synchronized {
                assert_eq!(info.num_samples, 24);
                assert_eq!(info.training_loss.to_f64s().unwrap(), vec![6.0]);
                // (1 + 2 + 3) on rank 0, (2 + 3 + 4) on rank 1.
                assert_eq!(grads[&b].to_f64s().unwrap(), vec![15.0; 4]);
            }
        }

        assert_eq!(synchronized, vec![false, false, true]);
        assert_eq!(total, 24);
        assert_eq!(learner.pending_samples(), 0);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].sample_count, 24);
    })
    .await;
}

#[tokio::test]
async fn test_empty_minibatch_flushes_the_buffer() {
    run_workers(2, accumulating(100), |comm, config| {
        let b = bias();
        let (mut learner, log) = recording_learner(comm, config, vec![b.clone()]);
        let mut total = 0;

        let mut grads = gradients(&[(&b, vec![2.0; 4])]);
        let status = learner
            .update(&mut grads, &mut MinibatchInfo::new(4, 0.0, 0.0), &mut total)
            .unwrap();
        assert!(!status.synchronized);

        // Left over from the previous step; must not be counted twice.
        let mut grads = gradients(&[(&b, vec![9.0; 4])]);
        let mut info = MinibatchInfo::empty();
        let status = learner.update(&mut grads, &mut info, &mut total).unwrap();
        assert!(status.synchronized);
        assert!(!status.is_empty);
        assert_eq!(info.num_samples, 8);
        assert_eq!(total, 8);
        assert_eq!(grads[&b].to_f64s().unwrap(), vec![4.0; 4]);
        assert_eq!(log.lock().unwrap().len(), 1);
    })
    .await;
}

#[tokio::test]
async fn test_end_of_sweep_on_buffered_step_reaches_learner() {
    run_workers(2, accumulating(10), |comm, config| {
        let b = bias();
        let (mut learner, log) = recording_learner(comm, config, vec![b.clone()]);
        let mut total = 0;

        let mut grads = gradients(&[(&b, vec![1.0; 4])]);
        let mut info = MinibatchInfo::new(4, 0.0, 0.0).with_end_of_sweep(true);
        let status = learner.update(&mut grads, &mut info, &mut total).unwrap();
        assert!(!status.synchronized);

        let mut grads = gradients(&[(&b, vec![1.0; 4])]);
        let mut info = MinibatchInfo::new(8, 0.0, 0.0);
        let status = learner.update(&mut grads, &mut info, &mut total).unwrap();
        assert!(status.synchronized);

        let mut grads = gradients(&[(&b, vec![1.0; 4])]);
        let mut info = MinibatchInfo::new(12, 0.0, 0.0);
        learner.update(&mut grads, &mut info, &mut total).unwrap();

        let seen: Vec<bool> = log
            .lock()
            .unwrap()
            .iter()
            .map(|applied| applied.at_end_of_sweep)
            .collect();
        assert_eq!(seen, vec![true, false]);
    })
    .await;
}
