pub mod checkpoint;
pub mod communicator;
pub mod config;
pub mod element;
pub mod error;
pub mod learner;
pub mod minibatch;
pub mod parameter;
pub mod quantization;
pub mod tensor;
pub mod types;

pub use checkpoint::{Dictionary, DictionaryValue};
pub use communicator::{
    DistributedCommunicator, LocalCommunicator, QuantizedCommunicator, WorkerDescriptor,
};
pub use config::QdpConfig;
pub use error::{QdpError, Result};
pub use learner::{Learner, QuantizedDataParallelLearner, UpdateStatus};
pub use minibatch::MinibatchInfo;
pub use parameter::{GradientMap, Parameter};
pub use quantization::{FullPrecision, LevelQuantizer, Quantizer};
pub use tensor::Tensor;
pub use types::{DataType, Device, ParameterId, Rank, StorageFormat};
