use crate::Device;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, path::PathBuf};

/// Where a worker keeps its tensors, as written in a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceSpec {
    #[default]
    Cpu,
    Cuda(usize),
}

impl DeviceSpec {
    /// Open the device; fails for CUDA when candle was built without it.
    pub fn device(&self) -> Result<Device> {
        match self {
            DeviceSpec::Cpu => Ok(Device::Cpu),
            DeviceSpec::Cuda(ordinal) => Ok(Device::new_cuda(*ordinal)?),
        }
    }
}

impl Display for DeviceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DeviceSpec::Cpu => write!(f, "cpu"),
            DeviceSpec::Cuda(idx) => write!(f, "cuda:{}", idx),
        }
    }
}

/// Per-worker runner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Device the worker's inputs are built on (or moved to after broadcast).
    pub device: DeviceSpec,
    /// Size of a KV-cache block in number of tokens.
    pub block_size: usize,
    /// Maximum length of a sequence (including prompt and generated text).
    pub max_model_len: usize,
    /// Number of decode steps a multi-step runner runs per prepared input.
    pub num_scheduler_steps: usize,
    /// Whether this worker owns the scheduling decision (and sampling).
    pub is_driver_worker: bool,
    /// Persist the input of a failed execute_model() call.
    pub dump_input_on_error: bool,
    pub dump_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            device: DeviceSpec::Cpu,
            block_size: 16,
            max_model_len: 4096,
            num_scheduler_steps: 1,
            is_driver_worker: true,
            dump_input_on_error: true,
            dump_dir: std::env::temp_dir(),
        }
    }
}

impl RunnerConfig {
    pub fn verify_args(&self) -> Result<()> {
        if self.block_size == 0 {
            bail!("block_size must be at least 1.");
        }
        if self.max_model_len == 0 {
            bail!("max_model_len must be at least 1.");
        }
        if self.num_scheduler_steps < 1 {
            bail!(
                "num_scheduler_steps must be at least 1, got {}.",
                self.num_scheduler_steps
            );
        }
        Ok(())
    }
}

pub const SAMPLING_EPS: f32 = 1e-5;

/// Sampling parameters for one request, as scheduled.
///
/// Only the fields the runner looks at are kept here; the sampler itself is
/// an external collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Number of output sequences to return for the given prompt.
    pub n: usize,

    /// Number of output sequences that are generated from the prompt.
    pub best_of: usize,

    /// Float that controls the randomness of the sampling. Default is 1.0.
    pub temperature: f32,

    /// Float that controls the cumulative probability of the top tokens to consider. Default is 1.0.
    pub top_p: f32,

    /// Integer that controls the number of top tokens to consider. Default is -1.
    pub top_k: isize,

    /// Random seed; a seeded request gets its own generator on the worker.
    pub seed: Option<u64>,

    /// Maximum number of tokens to generate per output sequence.
    pub max_tokens: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            n: 1,
            best_of: 1,
            temperature: 0.0,
            top_p: 1.0,
            top_k: -1,
            seed: None,
            max_tokens: 16,
        }
    }
}

impl SamplingParams {
    pub fn is_greedy(&self) -> bool {
        self.temperature < SAMPLING_EPS
    }

    /// Verifies the arguments of the sampling parameters.
    pub fn verify_args(&self) -> Result<()> {
        if self.n < 1 {
            bail!("n must be at least 1, got {}.", self.n);
        }
        if self.best_of < self.n {
            bail!(
                "best_of must be greater than or equal to n, got n={} and best_of={}.",
                self.n,
                self.best_of
            );
        }
        if self.temperature < 0.0 {
            bail!(
                "temperature must be non-negative, got {}.",
                self.temperature
            );
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            bail!("top_p must be in (0, 1], got {}.", self.top_p);
        }
        if self.top_k < -1 || self.top_k == 0 {
            bail!(
                "top_k must be -1 (disable), or at least 1, got {}.",
                self.top_k
            );
        }
        if self.max_tokens < 1 {
            bail!("max_tokens must be at least 1, got {}.", self.max_tokens);
        }
        if self.is_greedy() {
            if self.best_of > 1 {
                bail!(
                    "best_of must be 1 when using greedy sampling. Got {}.",
                    self.best_of
                );
            }
            if self.top_p < 1.0 - SAMPLING_EPS {
                bail!("top_p must be 1 when using greedy sampling.");
            }
            if self.top_k != -1 {
                bail!("top_k must be -1 when using greedy sampling.");
            }
        }
        Ok(())
    }
}
