use crate::{
    attn::{AttentionBackend, AttentionMetadata, BatchLayout},
    broadcast::{
        add_attn_metadata_broadcastable_dict, add_sampling_metadata_broadcastable_dict,
        add_step_attn_metadata_broadcastable_dict, init_attn_metadata_from_tensor_dict,
        init_frozen_model_input_from_tensor_dict, init_sampling_metadata_from_tensor_dict,
        init_step_attn_metadata_from_tensor_dict, BroadcastableModelInput, ATTN_METADATA_KEY,
        FROZEN_MODEL_INPUT_KEY, SAMPLING_METADATA_KEY, STEP_ATTN_METADATA_KEY,
    },
    errors::RunnerError,
    sampling::SamplingMetadata,
    schema::{FieldKind, FieldSet, FieldSpec, Record, RecordSchema},
    tensor::{from_vec1, to_index_vec},
    value::IdMap,
    Tensor, TensorDict,
};
use anyhow::{bail, Result};
use std::sync::Arc;

/// Everything one worker needs to run a single forward step.
///
/// The batch layout (and with it `seq_lens` and `query_lens`) and the
/// per-group part of the sampling metadata are device-only: they are not
/// broadcast, and inputs rebuilt on followers don't have them.
#[derive(Debug, Clone)]
pub struct ModelInput<M> {
    input_tokens: Tensor,    // u32, [num_tokens]
    input_positions: Tensor, // i64, [num_tokens]
    layout: Option<BatchLayout>,
    attn_metadata: Option<M>,
    sampling_metadata: Option<SamplingMetadata>,
    virtual_engine: usize,
    is_prompt: Option<bool>,
    request_ids_to_seq_ids: Option<IdMap>,
    finished_requests_ids: Option<Vec<String>>,
}

pub(crate) struct ModelInputParts<M> {
    pub input_tokens: Tensor,
    pub input_positions: Tensor,
    pub layout: BatchLayout,
    pub attn_metadata: Option<M>,
    pub sampling_metadata: Option<SamplingMetadata>,
    pub virtual_engine: usize,
    pub is_prompt: Option<bool>,
    pub request_ids_to_seq_ids: Option<IdMap>,
    pub finished_requests_ids: Option<Vec<String>>,
}

impl<M: AttentionMetadata> ModelInput<M> {
    pub(crate) fn from_parts(p: ModelInputParts<M>) -> Self {
        Self {
            input_tokens: p.input_tokens,
            input_positions: p.input_positions,
            layout: Some(p.layout),
            attn_metadata: p.attn_metadata,
            sampling_metadata: p.sampling_metadata,
            virtual_engine: p.virtual_engine,
            is_prompt: p.is_prompt,
            request_ids_to_seq_ids: p.request_ids_to_seq_ids,
            finished_requests_ids: p.finished_requests_ids,
        }
    }

    pub fn input_tokens(&self) -> &Tensor {
        &self.input_tokens
    }

    pub fn input_positions(&self) -> &Tensor {
        &self.input_positions
    }

    pub fn layout(&self) -> Option<&BatchLayout> {
        self.layout.as_ref()
    }

    /// Context length of every sequence; empty without a layout.
    pub fn seq_lens(&self) -> Vec<usize> {
        self.layout
            .iter()
            .flat_map(|l| l.seqs.iter().map(|s| s.context_len()))
            .collect()
    }

    pub fn query_lens(&self) -> Vec<usize> {
        self.layout
            .iter()
            .flat_map(|l| l.seqs.iter().map(|s| s.query_len))
            .collect()
    }

    pub fn attn_metadata(&self) -> Option<&M> {
        self.attn_metadata.as_ref()
    }

    pub fn sampling_metadata(&self) -> Option<&SamplingMetadata> {
        self.sampling_metadata.as_ref()
    }

    pub fn virtual_engine(&self) -> usize {
        self.virtual_engine
    }

    pub fn is_prompt(&self) -> Option<bool> {
        self.is_prompt
    }

    pub fn request_ids_to_seq_ids(&self) -> Option<&IdMap> {
        self.request_ids_to_seq_ids.as_ref()
    }

    pub fn finished_requests_ids(&self) -> Option<&[String]> {
        self.finished_requests_ids.as_deref()
    }

    pub fn num_tokens(&self) -> usize {
        self.input_tokens.elem_count()
    }

    /// Copy with a different set of finished request ids.
    pub fn with_finished_requests_ids(&self, ids: Option<Vec<String>>) -> Self {
        Self {
            finished_requests_ids: ids,
            ..self.clone()
        }
    }
}

impl<M: AttentionMetadata> Record for ModelInput<M> {
    const SCHEMA: RecordSchema = RecordSchema {
        name: "ModelInput",
        fields: &[
            FieldSpec::required("input_tokens", FieldKind::Tensor),
            FieldSpec::required("input_positions", FieldKind::Tensor),
            FieldSpec::required("virtual_engine", FieldKind::Int),
            FieldSpec::optional("is_prompt", FieldKind::Bool),
            FieldSpec::optional("request_ids_to_seq_ids", FieldKind::IdMap),
            FieldSpec::optional("finished_requests_ids", FieldKind::StrList),
        ],
    };

    fn write_fields(&self, dict: &mut TensorDict) {
        dict.insert("input_tokens", self.input_tokens.clone());
        dict.insert("input_positions", self.input_positions.clone());
        dict.insert("virtual_engine", self.virtual_engine);
        if let Some(is_prompt) = self.is_prompt {
            dict.insert("is_prompt", is_prompt);
        }
        if let Some(ids) = &self.request_ids_to_seq_ids {
            dict.insert("request_ids_to_seq_ids", ids.clone());
        }
        if let Some(ids) = &self.finished_requests_ids {
            dict.insert("finished_requests_ids", ids.clone());
        }
    }

    fn from_fields(mut fields: FieldSet, dict: &mut TensorDict) -> Result<Self> {
        let input_tokens: Tensor = fields.required("input_tokens")?;
        let input_positions: Tensor = fields.required("input_positions")?;
        if input_tokens.elem_count() != input_positions.elem_count() {
            bail!(
                "{} input tokens but {} positions",
                input_tokens.elem_count(),
                input_positions.elem_count()
            );
        }
        Ok(Self {
            input_tokens,
            input_positions,
            layout: None,
            attn_metadata: dict.take_record(ATTN_METADATA_KEY)?,
            sampling_metadata: dict.take_record(SAMPLING_METADATA_KEY)?,
            virtual_engine: fields.required("virtual_engine")?,
            is_prompt: fields.optional("is_prompt")?,
            request_ids_to_seq_ids: fields.optional("request_ids_to_seq_ids")?,
            finished_requests_ids: fields.optional("finished_requests_ids")?,
        })
    }
}

impl<M: AttentionMetadata> BroadcastableModelInput for ModelInput<M> {
    type AttnMetadata = M;

    fn as_broadcastable_tensor_dict(&self) -> TensorDict {
        let mut tensor_dict = TensorDict::new();
        self.write_fields(&mut tensor_dict);
        add_attn_metadata_broadcastable_dict(&mut tensor_dict, self.attn_metadata.as_ref());
        add_sampling_metadata_broadcastable_dict(
            &mut tensor_dict,
            self.sampling_metadata.as_ref(),
        );
        tensor_dict
    }

    fn from_broadcasted_tensor_dict<B>(
        mut tensor_dict: TensorDict,
        attn_backend: Option<&B>,
    ) -> Result<Self>
    where
        B: AttentionBackend<Metadata = M>,
    {
        if let Some(attn_backend) = attn_backend {
            init_attn_metadata_from_tensor_dict(attn_backend, &mut tensor_dict)?;
        }
        init_sampling_metadata_from_tensor_dict(&mut tensor_dict)?;
        let fields = tensor_dict.pop_fields(&Self::SCHEMA)?;
        Self::from_fields(fields, &mut tensor_dict)
    }
}

/// A model input reused across several decode steps.
///
/// The frozen part is built once and shared between steps. Each step only
/// differs in the small per-step fields below, including the attention
/// metadata of its decode-shaped batch. Stepping returns a new value.
#[derive(Debug, Clone)]
pub struct StatefulModelInput<M> {
    frozen_model_input: Arc<ModelInput<M>>,
    num_steps: usize,
    current_step: usize,
    is_multi_step: bool,
    is_first_multi_step: bool,
    is_last_step: bool,
    num_queries: usize,
    num_seqs: usize,
    last_sampled_token_ids: Option<Tensor>,
    // None at step 0, where the frozen metadata applies
    attn_metadata: Option<M>,
    // device-only
    layout: Option<BatchLayout>,
}

impl<M: AttentionMetadata> StatefulModelInput<M> {
    /// First of `num_steps` steps over `frozen_model_input`.
    pub fn new(frozen_model_input: ModelInput<M>, num_steps: usize) -> Self {
        let num_steps = std::cmp::max(num_steps, 1);
        let layout = frozen_model_input.layout.clone();
        let num_queries = frozen_model_input.query_lens().len();
        let num_seqs = frozen_model_input.seq_lens().len();
        Self {
            frozen_model_input: Arc::new(frozen_model_input),
            num_steps,
            current_step: 0,
            is_multi_step: num_steps > 1,
            is_first_multi_step: true,
            is_last_step: num_steps == 1,
            num_queries,
            num_seqs,
            last_sampled_token_ids: None,
            attn_metadata: None,
            layout,
        }
    }

    /// The next step. `sampled_token_ids` become its input tokens, one per
    /// sampled sequence, and the backend describes the decode batch they
    /// form.
    pub fn advance_step<B>(
        &self,
        attn_backend: &B,
        sampled_token_ids: Option<Tensor>,
    ) -> Result<Self>
    where
        B: AttentionBackend<Metadata = M>,
    {
        let current_step = self.current_step + 1;
        if current_step >= self.num_steps {
            bail!(
                "can't advance to step {} of a {}-step input",
                current_step,
                self.num_steps
            );
        }
        let layout = match &self.layout {
            Some(l) => l.next_decode_step()?,
            None => bail!(
                "{}: input has no batch layout to step from",
                attn_backend.get_name()
            ),
        };
        if let Some(t) = &sampled_token_ids {
            if t.elem_count() != layout.seqs.len() {
                bail!(
                    "{} sampled tokens for {} sequences",
                    t.elem_count(),
                    layout.seqs.len()
                );
            }
        }
        let device = self.frozen_model_input.input_tokens.device();
        let attn_metadata = attn_backend.build_metadata(&layout, device)?;
        log::trace!(
            "step {}: {} decode seqs, {} slots",
            current_step,
            layout.seqs.len(),
            attn_metadata.slot_mapping().elem_count()
        );

        Ok(Self {
            frozen_model_input: self.frozen_model_input.clone(),
            num_steps: self.num_steps,
            current_step,
            is_multi_step: self.is_multi_step,
            is_first_multi_step: false,
            is_last_step: current_step + 1 == self.num_steps,
            num_queries: self.num_queries,
            num_seqs: self.num_seqs,
            last_sampled_token_ids: sampled_token_ids,
            attn_metadata: Some(attn_metadata),
            layout: Some(layout),
        })
    }

    pub fn frozen_model_input(&self) -> &ModelInput<M> {
        &self.frozen_model_input
    }

    pub fn shares_frozen_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.frozen_model_input, &other.frozen_model_input)
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn is_multi_step(&self) -> bool {
        self.is_multi_step
    }

    pub fn is_first_multi_step(&self) -> bool {
        self.is_first_multi_step
    }

    pub fn is_last_step(&self) -> bool {
        self.is_last_step
    }

    pub fn num_queries(&self) -> usize {
        self.num_queries
    }

    pub fn num_seqs(&self) -> usize {
        self.num_seqs
    }

    pub fn last_sampled_token_ids(&self) -> Option<&Tensor> {
        self.last_sampled_token_ids.as_ref()
    }

    /// Attention metadata of the current step.
    pub fn attn_metadata(&self) -> Option<&M> {
        match &self.attn_metadata {
            Some(md) => Some(md),
            None => self.frozen_model_input.attn_metadata(),
        }
    }

    pub fn layout(&self) -> Option<&BatchLayout> {
        self.layout.as_ref()
    }

    /// Tokens to feed at the current step.
    pub fn step_tokens(&self) -> Tensor {
        match (&self.last_sampled_token_ids, self.current_step) {
            (Some(sampled), step) if step > 0 => sampled.clone(),
            _ => self.frozen_model_input.input_tokens.clone(),
        }
    }

    /// Positions at the current step: the last position of every sampled
    /// row moved forward by the number of steps taken.
    pub fn step_positions(&self) -> Result<Tensor> {
        let frozen = &self.frozen_model_input;
        if self.current_step == 0 {
            return Ok(frozen.input_positions.clone());
        }
        let positions = to_index_vec(&frozen.input_positions)?;
        let rows = match &frozen.sampling_metadata {
            Some(md) => to_index_vec(md.selected_token_indices())?,
            None => (0..positions.len() as i64).collect(),
        };
        let step = self.current_step as i64;
        let mut r = Vec::with_capacity(rows.len());
        for row in rows {
            match positions.get(row as usize) {
                Some(p) => r.push(p + step),
                None => bail!("selected row {} outside of {} positions", row, positions.len()),
            }
        }
        from_vec1(r, frozen.input_positions.device())
    }
}

impl<M: AttentionMetadata> Record for StatefulModelInput<M> {
    const SCHEMA: RecordSchema = RecordSchema {
        name: "StatefulModelInput",
        fields: &[
            FieldSpec::required("num_steps", FieldKind::Int),
            FieldSpec::required("current_step", FieldKind::Int),
            FieldSpec::required("is_multi_step", FieldKind::Bool),
            FieldSpec::required("is_first_multi_step", FieldKind::Bool),
            FieldSpec::required("is_last_step", FieldKind::Bool),
            FieldSpec::required("num_queries", FieldKind::Int),
            FieldSpec::required("num_seqs", FieldKind::Int),
            FieldSpec::optional("last_sampled_token_ids", FieldKind::Tensor),
        ],
    };

    fn write_fields(&self, dict: &mut TensorDict) {
        dict.insert("num_steps", self.num_steps);
        dict.insert("current_step", self.current_step);
        dict.insert("is_multi_step", self.is_multi_step);
        dict.insert("is_first_multi_step", self.is_first_multi_step);
        dict.insert("is_last_step", self.is_last_step);
        dict.insert("num_queries", self.num_queries);
        dict.insert("num_seqs", self.num_seqs);
        if let Some(t) = &self.last_sampled_token_ids {
            dict.insert("last_sampled_token_ids", t.clone());
        }
    }

    fn from_fields(mut fields: FieldSet, dict: &mut TensorDict) -> Result<Self> {
        let frozen: ModelInput<M> = match dict.take_record(FROZEN_MODEL_INPUT_KEY)? {
            Some(f) => f,
            None => {
                return Err(RunnerError::MissingField {
                    record: Self::SCHEMA.name,
                    field: FROZEN_MODEL_INPUT_KEY,
                }
                .into())
            }
        };
        let num_steps: usize = fields.required("num_steps")?;
        let current_step: usize = fields.required("current_step")?;
        if num_steps == 0 || current_step >= num_steps {
            bail!("step {} of a {}-step input", current_step, num_steps);
        }
        Ok(Self {
            frozen_model_input: Arc::new(frozen),
            num_steps,
            current_step,
            is_multi_step: fields.required("is_multi_step")?,
            is_first_multi_step: fields.required("is_first_multi_step")?,
            is_last_step: fields.required("is_last_step")?,
            num_queries: fields.required("num_queries")?,
            num_seqs: fields.required("num_seqs")?,
            last_sampled_token_ids: fields.optional("last_sampled_token_ids")?,
            attn_metadata: dict.take_record(STEP_ATTN_METADATA_KEY)?,
            layout: None,
        })
    }
}

impl<M: AttentionMetadata> BroadcastableModelInput for StatefulModelInput<M> {
    type AttnMetadata = M;

    fn as_broadcastable_tensor_dict(&self) -> TensorDict {
        let mut tensor_dict = self.frozen_model_input.as_broadcastable_tensor_dict();
        self.write_fields(&mut tensor_dict);
        add_step_attn_metadata_broadcastable_dict(&mut tensor_dict, self.attn_metadata.as_ref());
        tensor_dict
    }

    fn from_broadcasted_tensor_dict<B>(
        mut tensor_dict: TensorDict,
        attn_backend: Option<&B>,
    ) -> Result<Self>
    where
        B: AttentionBackend<Metadata = M>,
    {
        init_step_attn_metadata_from_tensor_dict(attn_backend, &mut tensor_dict)?;
        if let Some(attn_backend) = attn_backend {
            init_attn_metadata_from_tensor_dict(attn_backend, &mut tensor_dict)?;
        }
        init_sampling_metadata_from_tensor_dict(&mut tensor_dict)?;
        init_frozen_model_input_from_tensor_dict::<ModelInput<M>>(&mut tensor_dict)?;
        let fields = tensor_dict.pop_fields(&Self::SCHEMA)?;
        Self::from_fields(fields, &mut tensor_dict)
    }
}
