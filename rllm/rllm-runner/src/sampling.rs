use crate::{
    config::SamplingParams,
    schema::{FieldKind, FieldSet, FieldSpec, Record, RecordSchema},
    seq::{SeqId, Token},
    Tensor, TensorDict,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};

pub const SELECTED_TOKEN_INDICES: &str = "selected_token_indices";

/// How much of the sampling bookkeeping a worker holds.
///
/// Absence of sampling metadata altogether means "nothing to sample here".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingScope {
    /// Built locally from the request list; the worker can run the sampler.
    Full,
    /// Rebuilt from a broadcast: only the logit rows to select are known,
    /// sampling itself happens on the driver.
    IndicesOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceGroupToSample {
    pub request_id: String,
    pub seq_ids: Vec<SeqId>,
    pub sampling_params: SamplingParams,
    pub is_prompt: bool,
    /// False while a chunked prompt is still being prefilled.
    pub do_sample: bool,
    /// Positions in `selected_token_indices` that belong to this group.
    pub sample_indices: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct SamplingMetadata {
    seq_groups: Option<Vec<SequenceGroupToSample>>,
    selected_token_indices: Tensor,
    num_prompts: usize,
    scope: SamplingScope,
}

impl SamplingMetadata {
    pub fn new(seq_groups: Vec<SequenceGroupToSample>, selected_token_indices: Tensor) -> Self {
        let num_prompts = seq_groups.iter().filter(|g| g.is_prompt).count();
        Self {
            seq_groups: Some(seq_groups),
            selected_token_indices,
            num_prompts,
            scope: SamplingScope::Full,
        }
    }

    pub fn indices_only(selected_token_indices: Tensor) -> Self {
        Self {
            seq_groups: None,
            selected_token_indices,
            num_prompts: 0,
            scope: SamplingScope::IndicesOnly,
        }
    }

    pub fn scope(&self) -> SamplingScope {
        self.scope
    }

    pub fn seq_groups(&self) -> Option<&[SequenceGroupToSample]> {
        self.seq_groups.as_deref()
    }

    pub fn selected_token_indices(&self) -> &Tensor {
        &self.selected_token_indices
    }

    pub fn num_prompts(&self) -> usize {
        self.num_prompts
    }
}

// only the selected indices cross the broadcast boundary
impl Record for SamplingMetadata {
    const SCHEMA: RecordSchema = RecordSchema {
        name: "SamplingMetadata",
        fields: &[FieldSpec::required(SELECTED_TOKEN_INDICES, FieldKind::Tensor)],
    };

    fn write_fields(&self, dict: &mut TensorDict) {
        dict.insert(SELECTED_TOKEN_INDICES, self.selected_token_indices.clone());
    }

    fn from_fields(mut fields: FieldSet, _dict: &mut TensorDict) -> Result<Self> {
        Ok(Self::indices_only(fields.required(SELECTED_TOKEN_INDICES)?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceOutput {
    pub parent_seq_id: SeqId,
    pub output_token: Token,
    pub logprob: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceGroupOutput {
    pub request_id: String,
    pub samples: Vec<SequenceOutput>,
}

/// Result of sampling one step.
#[derive(Debug, Clone, Default)]
pub struct SamplerOutput {
    pub outputs: Vec<SequenceGroupOutput>,
    /// One token per selected row, fed back as input by multi-step runs.
    pub sampled_token_ids: Option<Tensor>,
}

impl SamplerOutput {
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}
