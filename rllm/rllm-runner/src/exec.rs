use crate::{
    attn::AttentionMetadata,
    runner::GeneratorRegistry,
    sampling::{SamplerOutput, SamplingMetadata},
    seq::{IntermediateTensors, KvCache},
    Tensor,
};
use anyhow::Result;

pub enum ForwardOutput {
    /// `[num_tokens or num_selected, vocab_size]`
    Logits(Tensor),
    /// Hidden states for the next pipeline stage.
    Intermediate(IntermediateTensors),
}

/// What the model sees for one forward pass.
#[derive(Debug, Clone, Copy)]
pub struct ForwardBatch<'a, M> {
    pub input_tokens: &'a Tensor,
    pub input_positions: &'a Tensor,
    pub attn_metadata: Option<&'a M>,
    pub virtual_engine: usize,
    /// 0 except for later steps of a multi-step run.
    pub step: usize,
}

/// The model and sampler a runner drives.
pub trait ModelExecutor<M: AttentionMetadata> {
    fn forward(
        &mut self,
        batch: &ForwardBatch<'_, M>,
        kv_caches: Option<&[KvCache]>,
        intermediate_tensors: Option<&IntermediateTensors>,
    ) -> Result<ForwardOutput>;

    /// Seeded requests must draw from `generators`.
    fn sample(
        &mut self,
        logits: &Tensor,
        sampling_metadata: &SamplingMetadata,
        generators: &mut GeneratorRegistry,
    ) -> Result<SamplerOutput>;
}
