use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use qdp::{
    Dictionary, DictionaryValue, GradientMap, Learner, LocalCommunicator, Parameter, ParameterId,
    QdpConfig, QuantizedDataParallelLearner, Result, Tensor,
};

/// Helper: run `f` on every rank of an in-process group, each on its own
/// blocking thread. Returns the per-rank results in rank order.
pub async fn run_workers<F, T>(world_size: u32, config: QdpConfig, f: F) -> Vec<T>
where
    F: Fn(LocalCommunicator, &QdpConfig) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    let group = LocalCommunicator::group(world_size, &config).unwrap();
    let f = Arc::new(f);
    let config = Arc::new(config);
    let mut handles = Vec::new();
    for comm in group {
        let f = Arc::clone(&f);
        let config = Arc::clone(&config);
        handles.push(tokio::task::spawn_blocking(move || f(comm, &config)));
    }
    let mut results = Vec::new();
    for h in handles {
        results.push(h.await.unwrap());
    }
    results
}

/// One call to [`Learner::update`], as seen by the wrapped learner.
#[derive(Debug, Clone)]
pub struct Applied {
    pub sample_count: usize,
    pub at_end_of_sweep: bool,
    pub gradients: BTreeMap<ParameterId, Vec<f64>>,
}

pub type UpdateLog = Arc<Mutex<Vec<Applied>>>;

/// Learner that only records what it is asked to apply.
pub struct RecordingLearner {
    params: Vec<Parameter>,
    log: UpdateLog,
    stop_after: Option<usize>,
}

impl RecordingLearner {
    pub fn new(params: Vec<Parameter>) -> (Self, UpdateLog) {
        let log = UpdateLog::default();
        let learner = Self {
            params,
            log: Arc::clone(&log),
            stop_after: None,
        };
        (learner, log)
    }

    /// Ask to stop once `updates` updates have been applied.
    pub fn stopping_after(mut self, updates: usize) -> Self {
        self.stop_after = Some(updates);
        self
    }
}

impl Learner for RecordingLearner {
    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn update(&mut self, gradients: &mut GradientMap, sample_count: usize, at_end_of_sweep: bool) -> bool {
        let gradients = gradients
            .iter()
            .map(|(p, g)| (p.id, g.to_f64s().unwrap()))
            .collect();
        let mut log = self.log.lock().unwrap();
        log.push(Applied {
            sample_count,
            at_end_of_sweep,
            gradients,
        });
        self.stop_after.is_none_or(|n| log.len() < n)
    }

    fn create_checkpoint(&self) -> Result<Dictionary> {
        let mut dict = Dictionary::new();
        dict.insert(
            "updates",
            DictionaryValue::U64(self.log.lock().unwrap().len() as u64),
        );
        Ok(dict)
    }
}

/// Data-parallel learner over a [`RecordingLearner`] for `params`.
pub fn recording_learner(
    comm: LocalCommunicator,
    config: &QdpConfig,
    params: Vec<Parameter>,
) -> (QuantizedDataParallelLearner, UpdateLog) {
    let (inner, log) = RecordingLearner::new(params);
    let learner =
        QuantizedDataParallelLearner::new(Arc::new(comm), false, Box::new(inner), config).unwrap();
    (learner, log)
}

/// Column-major values where column `c` holds `scale * (c + 1)` throughout.
pub fn column_constant(rows: usize, cols: usize, scale: f64) -> Vec<f64> {
    (0..cols)
        .flat_map(|c| std::iter::repeat_n(scale * (c + 1) as f64, rows))
        .collect()
}

/// Dense gradient for `param` holding `values`.
pub fn dense(param: &Parameter, values: &[f64]) -> Tensor {
    Tensor::from_f64s(&param.shape, values, param.dtype, param.device).unwrap()
}

/// Gradient map from `(parameter, values)` pairs.
pub fn gradients(pairs: &[(&Parameter, Vec<f64>)]) -> GradientMap {
    pairs
        .iter()
        .map(|(p, values)| ((*p).clone(), dense(p, values)))
        .collect()
}
