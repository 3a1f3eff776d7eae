use crate::{
    attn::AttentionBackend,
    broadcast::BroadcastableModelInput,
    builder::{ModelInputBuilder, ModelRunnerInputBuilder},
    config::RunnerConfig,
    dump::dump_input_when_error,
    errors::RunnerError,
    exec::{ForwardBatch, ForwardOutput, ModelExecutor},
    model_input::{ModelInput, StatefulModelInput},
    sampling::{SamplerOutput, SamplingMetadata, SamplingScope},
    seq::{IntermediateTensors, KvCache, SequenceGroupMetadata},
    Device, HashMap, Tensor, TensorDict,
};
use anyhow::{bail, Result};
use rand::{rngs::StdRng, SeedableRng};
use std::sync::Arc;

/// Per-request random generators, for requests that asked for a seed.
#[derive(Debug, Default)]
pub struct GeneratorRegistry {
    generators: HashMap<String, StdRng>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The generator of `request_id`, created on first use.
    pub fn get_or_seed(&mut self, request_id: &str, seed: Option<u64>) -> &mut StdRng {
        self.generators
            .entry(request_id.to_string())
            .or_insert_with(|| match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            })
    }

    pub fn get_mut(&mut self, request_id: &str) -> Option<&mut StdRng> {
        self.generators.get_mut(request_id)
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.generators.contains_key(request_id)
    }

    pub fn remove_finished(&mut self, finished_requests_ids: &[String]) {
        for id in finished_requests_ids {
            if self.generators.remove(id).is_some() {
                log::trace!("dropped generator for {}", id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.generators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    InputPrepared,
    Executing,
}

/// Per-device model runner.
///
/// The driver prepares an input from the scheduler output and broadcasts it;
/// followers rebuild it from the broadcast map. Every worker then executes it.
pub trait ModelRunnerBase {
    type Input: BroadcastableModelInput;

    fn name(&self) -> String;

    /// Follower side; tensors are moved to this worker's device.
    fn make_model_input_from_broadcasted_tensor_dict(
        &mut self,
        tensor_dict: TensorDict,
    ) -> Result<Self::Input>;

    /// Driver side; no communication with other workers happens here.
    fn prepare_model_input(
        &mut self,
        seq_group_metadata_list: &[SequenceGroupMetadata],
        virtual_engine: usize,
        finished_requests_ids: Option<&[String]>,
    ) -> Result<Self::Input>;

    /// `None` when this worker is not the last pipeline stage.
    fn execute_model(
        &mut self,
        model_input: &Self::Input,
        kv_caches: Option<&[KvCache]>,
        intermediate_tensors: Option<&IntermediateTensors>,
        num_steps: usize,
    ) -> Result<Option<Vec<SamplerOutput>>>;

    fn generators(&mut self) -> &mut GeneratorRegistry;

    /// Drop the generators of finished requests and return the rest.
    fn get_generators(
        &mut self,
        finished_requests_ids: Option<&[String]>,
    ) -> &mut GeneratorRegistry {
        let generators = self.generators();
        if let Some(ids) = finished_requests_ids {
            generators.remove_finished(ids);
        }
        generators
    }
}

fn check_num_steps(name: &str, num_steps: usize) -> Result<()> {
    if num_steps == 0 {
        bail!("{}: num_steps must be at least 1", name);
    }
    Ok(())
}

fn full_sampling<'a>(
    name: &str,
    sampling_metadata: Option<&'a SamplingMetadata>,
) -> Result<&'a SamplingMetadata> {
    match sampling_metadata {
        Some(md) if md.scope() == SamplingScope::Full => Ok(md),
        _ => Err(
            RunnerError::unimplemented(name, "sampling without full sampling metadata").into(),
        ),
    }
}

/// Shared by both runner shapes.
struct RunnerCore<B: AttentionBackend, E> {
    config: Arc<RunnerConfig>,
    device: Device,
    attn_backend: Arc<B>,
    executor: E,
    generators: GeneratorRegistry,
    state: RunnerState,
}

impl<B, E> RunnerCore<B, E>
where
    B: AttentionBackend,
    E: ModelExecutor<B::Metadata>,
{
    fn new(config: RunnerConfig, attn_backend: B, executor: E) -> Result<Self> {
        config.verify_args()?;
        let device = config.device.device()?;
        log::info!(
            "{}: runner on {}, block size {}",
            attn_backend.get_name(),
            config.device,
            config.block_size
        );
        Ok(Self {
            config: Arc::new(config),
            device,
            attn_backend: Arc::new(attn_backend),
            executor,
            generators: GeneratorRegistry::new(),
            state: RunnerState::Idle,
        })
    }

    fn build_input(
        &mut self,
        seq_group_metadata_list: &[SequenceGroupMetadata],
        virtual_engine: usize,
        finished_requests_ids: Option<&[String]>,
    ) -> Result<ModelInput<B::Metadata>> {
        if let Some(ids) = finished_requests_ids {
            self.generators.remove_finished(ids);
        }

        let mut builder = ModelInputBuilder::new(
            self.config.clone(),
            self.attn_backend.clone(),
            self.device.clone(),
            virtual_engine,
            finished_requests_ids.map(|ids| ids.to_vec()),
        );
        for sg in seq_group_metadata_list {
            sg.sampling_params.verify_args()?;
            builder.add_seq_group(sg)?;
            if let Some(seed) = sg.sampling_params.seed {
                self.generators.get_or_seed(&sg.request_id, Some(seed));
            }
        }
        let model_input = builder.build()?;
        self.state = RunnerState::InputPrepared;
        Ok(model_input)
    }

    fn rebuild_input<I>(&mut self, tensor_dict: TensorDict) -> Result<I>
    where
        I: BroadcastableModelInput<AttnMetadata = B::Metadata>,
    {
        let tensor_dict = tensor_dict.to_device(&self.device)?;
        let model_input =
            I::from_broadcasted_tensor_dict(tensor_dict, Some(self.attn_backend.as_ref()))?;
        self.state = RunnerState::InputPrepared;
        Ok(model_input)
    }

    /// One forward pass; `None` out of a non-final pipeline stage.
    fn forward(
        &mut self,
        batch: &ForwardBatch<'_, B::Metadata>,
        kv_caches: Option<&[KvCache]>,
        intermediate_tensors: Option<&IntermediateTensors>,
    ) -> Result<Option<Tensor>> {
        match self
            .executor
            .forward(batch, kv_caches, intermediate_tensors)?
        {
            ForwardOutput::Logits(logits) => Ok(Some(logits)),
            ForwardOutput::Intermediate(_) => {
                log::trace!("forward returned intermediate tensors");
                Ok(None)
            }
        }
    }
}

/// Runs one forward pass and one sampling step per call.
pub struct ModelRunner<B: AttentionBackend, E> {
    core: RunnerCore<B, E>,
}

impl<B, E> ModelRunner<B, E>
where
    B: AttentionBackend,
    E: ModelExecutor<B::Metadata>,
{
    pub fn new(config: RunnerConfig, attn_backend: B, executor: E) -> Result<Self> {
        Ok(Self {
            core: RunnerCore::new(config, attn_backend, executor)?,
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.core.config
    }

    pub fn attn_backend(&self) -> &B {
        &self.core.attn_backend
    }

    pub fn executor(&self) -> &E {
        &self.core.executor
    }

    pub fn state(&self) -> RunnerState {
        self.core.state
    }

    fn execute_step(
        &mut self,
        model_input: &ModelInput<B::Metadata>,
        kv_caches: Option<&[KvCache]>,
        intermediate_tensors: Option<&IntermediateTensors>,
    ) -> Result<Option<Vec<SamplerOutput>>> {
        let batch = ForwardBatch {
            input_tokens: model_input.input_tokens(),
            input_positions: model_input.input_positions(),
            attn_metadata: model_input.attn_metadata(),
            virtual_engine: model_input.virtual_engine(),
            step: 0,
        };
        let logits = match self.core.forward(&batch, kv_caches, intermediate_tensors)? {
            Some(logits) => logits,
            None => return Ok(None),
        };

        // only the driver samples
        if !self.core.config.is_driver_worker {
            return Ok(Some(Vec::new()));
        }

        let name = self.name();
        let sampling_metadata = full_sampling(&name, model_input.sampling_metadata())?;
        let output =
            self.core
                .executor
                .sample(&logits, sampling_metadata, &mut self.core.generators)?;
        Ok(Some(vec![output]))
    }
}

impl<B, E> ModelRunnerBase for ModelRunner<B, E>
where
    B: AttentionBackend,
    E: ModelExecutor<B::Metadata>,
{
    type Input = ModelInput<B::Metadata>;

    fn name(&self) -> String {
        format!("ModelRunner<{}>", self.core.attn_backend.get_name())
    }

    fn make_model_input_from_broadcasted_tensor_dict(
        &mut self,
        tensor_dict: TensorDict,
    ) -> Result<Self::Input> {
        self.core.rebuild_input(tensor_dict)
    }

    fn prepare_model_input(
        &mut self,
        seq_group_metadata_list: &[SequenceGroupMetadata],
        virtual_engine: usize,
        finished_requests_ids: Option<&[String]>,
    ) -> Result<Self::Input> {
        self.core.build_input(
            seq_group_metadata_list,
            virtual_engine,
            finished_requests_ids,
        )
    }

    fn execute_model(
        &mut self,
        model_input: &Self::Input,
        kv_caches: Option<&[KvCache]>,
        intermediate_tensors: Option<&IntermediateTensors>,
        num_steps: usize,
    ) -> Result<Option<Vec<SamplerOutput>>> {
        check_num_steps(&self.name(), num_steps)?;
        if num_steps > 1 {
            return Err(RunnerError::unimplemented(self.name(), "num_steps > 1").into());
        }

        self.core.state = RunnerState::Executing;
        let config = self.core.config.clone();
        let r = dump_input_when_error(model_input, &config, || {
            self.execute_step(model_input, kv_caches, intermediate_tensors)
        });
        self.core.state = RunnerState::Idle;
        r
    }

    fn generators(&mut self) -> &mut GeneratorRegistry {
        &mut self.core.generators
    }
}

/// Runs several decode steps over one prepared input, feeding each step's
/// sampled tokens back as the next step's input.
pub struct MultiStepModelRunner<B: AttentionBackend, E> {
    core: RunnerCore<B, E>,
}

impl<B, E> MultiStepModelRunner<B, E>
where
    B: AttentionBackend,
    E: ModelExecutor<B::Metadata>,
{
    pub fn new(config: RunnerConfig, attn_backend: B, executor: E) -> Result<Self> {
        Ok(Self {
            core: RunnerCore::new(config, attn_backend, executor)?,
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.core.config
    }

    pub fn executor(&self) -> &E {
        &self.core.executor
    }

    pub fn state(&self) -> RunnerState {
        self.core.state
    }

    fn execute_steps(
        &mut self,
        model_input: &StatefulModelInput<B::Metadata>,
        kv_caches: Option<&[KvCache]>,
        intermediate_tensors: Option<&IntermediateTensors>,
    ) -> Result<Option<Vec<SamplerOutput>>> {
        let name = self.name();
        let is_driver = self.core.config.is_driver_worker;
        let frozen = model_input.frozen_model_input();
        if model_input.is_multi_step() {
            if !is_driver {
                return Err(RunnerError::unimplemented(name, "multi-step on a follower").into());
            }
            full_sampling(&name, frozen.sampling_metadata())?;
        }

        let mut outputs = Vec::new();
        let mut step_input = model_input.clone();
        loop {
            let tokens = step_input.step_tokens();
            let positions = step_input.step_positions()?;
            let batch = ForwardBatch {
                input_tokens: &tokens,
                input_positions: &positions,
                attn_metadata: step_input.attn_metadata(),
                virtual_engine: frozen.virtual_engine(),
                step: step_input.current_step(),
            };
            let logits = match self.core.forward(&batch, kv_caches, intermediate_tensors)? {
                Some(logits) => logits,
                None => return Ok(None),
            };
            if !is_driver {
                return Ok(Some(Vec::new()));
            }

            let sampling_metadata = full_sampling(&name, frozen.sampling_metadata())?;
            let output =
                self.core
                    .executor
                    .sample(&logits, sampling_metadata, &mut self.core.generators)?;

            if step_input.is_last_step() {
                outputs.push(output);
                break;
            }
            let sampled = match &output.sampled_token_ids {
                Some(t) => t.clone(),
                None => bail!(
                    "{}: step {} returned no sampled token ids",
                    name,
                    step_input.current_step()
                ),
            };
            step_input = step_input.advance_step(self.core.attn_backend.as_ref(), Some(sampled))?;
            outputs.push(output);
        }
        log::debug!("{}: ran {} steps", name, outputs.len());
        Ok(Some(outputs))
    }
}

impl<B, E> ModelRunnerBase for MultiStepModelRunner<B, E>
where
    B: AttentionBackend,
    E: ModelExecutor<B::Metadata>,
{
    type Input = StatefulModelInput<B::Metadata>;

    fn name(&self) -> String {
        format!("MultiStepModelRunner<{}>", self.core.attn_backend.get_name())
    }

    fn make_model_input_from_broadcasted_tensor_dict(
        &mut self,
        tensor_dict: TensorDict,
    ) -> Result<Self::Input> {
        self.core.rebuild_input(tensor_dict)
    }

    fn prepare_model_input(
        &mut self,
        seq_group_metadata_list: &[SequenceGroupMetadata],
        virtual_engine: usize,
        finished_requests_ids: Option<&[String]>,
    ) -> Result<Self::Input> {
        let frozen = self.core.build_input(
            seq_group_metadata_list,
            virtual_engine,
            finished_requests_ids,
        )?;
        Ok(StatefulModelInput::new(
            frozen,
            self.core.config.num_scheduler_steps,
        ))
    }

    fn execute_model(
        &mut self,
        model_input: &Self::Input,
        kv_caches: Option<&[KvCache]>,
        intermediate_tensors: Option<&IntermediateTensors>,
        num_steps: usize,
    ) -> Result<Option<Vec<SamplerOutput>>> {
        check_num_steps(&self.name(), num_steps)?;
        if num_steps != model_input.num_steps() {
            bail!(
                "{}: asked for {} steps, input was prepared for {}",
                self.name(),
                num_steps,
                model_input.num_steps()
            );
        }

        self.core.state = RunnerState::Executing;
        let config = self.core.config.clone();
        let r = dump_input_when_error(model_input, &config, || {
            self.execute_steps(model_input, kv_caches, intermediate_tensors)
        });
        self.core.state = RunnerState::Idle;
        r
    }

    fn generators(&mut self) -> &mut GeneratorRegistry {
        &mut self.core.generators
    }
}
