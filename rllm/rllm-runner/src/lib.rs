pub mod attn;
pub mod broadcast;
pub mod builder;
pub mod config;
mod dict;
pub mod dump;
mod errors;
pub mod exec;
pub mod model_input;
pub mod runner;
pub mod sampling;
pub mod schema;
pub mod seq;
pub mod tensor;
pub mod value;

pub use fxhash::FxHashMap as HashMap;

pub use attn::{AttentionBackend, AttentionMetadata, FlashAttnBackend, PagedAttnBackend};
pub use broadcast::BroadcastableModelInput;
pub use builder::{ModelInputBuilder, ModelRunnerInputBuilder};
pub use config::{DeviceSpec, RunnerConfig, SamplingParams};
pub use dict::TensorDict;
pub use errors::RunnerError;
pub use exec::{ForwardBatch, ForwardOutput, ModelExecutor};
pub use model_input::{ModelInput, StatefulModelInput};
pub use runner::{
    GeneratorRegistry, ModelRunner, ModelRunnerBase, MultiStepModelRunner, RunnerState,
};
pub use tensor::{DType, Device, Tensor};
pub use value::Value;
