use crate::{
    attn::{AttentionBackend, BatchLayout, SeqLayout},
    config::RunnerConfig,
    model_input::{ModelInput, ModelInputParts},
    sampling::{SamplingMetadata, SequenceGroupToSample},
    seq::{SequenceData, SequenceGroupMetadata},
    tensor::from_vec1,
    value::IdMap,
    Device,
};
use anyhow::{bail, Result};
use std::sync::Arc;

/// Accumulates sequence groups, one call at a time, into an execution input.
pub trait ModelRunnerInputBuilder {
    type Output;

    /// Append the contribution of one group; groups keep their call order.
    fn add_seq_group(&mut self, seq_group_metadata: &SequenceGroupMetadata) -> Result<()>;

    fn build(self) -> Result<Self::Output>;
}

/// Builds a [`ModelInput`] over a paged KV cache.
pub struct ModelInputBuilder<B: AttentionBackend> {
    config: Arc<RunnerConfig>,
    attn_backend: Arc<B>,
    device: Device,
    virtual_engine: usize,
    finished_requests_ids: Option<Vec<String>>,

    tokens: Vec<u32>,
    positions: Vec<i64>,
    seqs: Vec<SeqLayout>,
    seq_groups: Vec<SequenceGroupToSample>,
    selected_token_indices: Vec<i64>,
    request_ids_to_seq_ids: IdMap,
    num_prompt_groups: usize,
}

/// One sequence's contribution, checked but not yet part of the batch.
struct StagedSeq {
    tokens: Vec<u32>,
    positions: Vec<i64>,
    layout: SeqLayout,
}

impl<B: AttentionBackend> ModelInputBuilder<B> {
    /// Tensors are built on `device`.
    pub fn new(
        config: Arc<RunnerConfig>,
        attn_backend: Arc<B>,
        device: Device,
        virtual_engine: usize,
        finished_requests_ids: Option<Vec<String>>,
    ) -> Self {
        Self {
            config,
            attn_backend,
            device,
            virtual_engine,
            finished_requests_ids,
            tokens: Vec::new(),
            positions: Vec::new(),
            seqs: Vec::new(),
            seq_groups: Vec::new(),
            selected_token_indices: Vec::new(),
            request_ids_to_seq_ids: IdMap::new(),
            num_prompt_groups: 0,
        }
    }

    pub fn num_seq_groups(&self) -> usize {
        self.seq_groups.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.tokens.len()
    }

    /// Work out what `seq` adds to the batch without touching the builder.
    fn stage_seq(
        &self,
        sg: &SequenceGroupMetadata,
        seq: &SequenceData,
        block_table: &[usize],
    ) -> Result<StagedSeq> {
        let block_size = self.config.block_size;
        let max_seq = self.config.max_model_len;

        let seq_len = seq.get_len();
        if seq_len == 0 {
            bail!("seq {} of {} has no tokens", seq.seq_id, sg.request_id);
        }
        let computed = seq.get_num_computed_tokens();
        let off = if computed >= seq_len {
            // just re-compute the last token
            seq_len - 1
        } else {
            computed
        };
        let mut q_len = seq_len - off;
        if sg.is_prompt {
            if let Some(chunk) = sg.token_chunk_size {
                q_len = std::cmp::min(q_len, std::cmp::max(chunk, 1));
            }
        }
        let k_len = off + q_len;
        if k_len > max_seq {
            bail!(
                "seq {} of {} needs {} tokens, max_model_len is {}",
                seq.seq_id,
                sg.request_id,
                k_len,
                max_seq
            );
        }

        log::trace!(
            "seq {}: off={} q_len={} k_len={}",
            seq.seq_id,
            off,
            q_len,
            k_len
        );

        let mut kv_slots = Vec::with_capacity(k_len);
        for idx in 0..k_len {
            let block = match block_table.get(idx / block_size) {
                Some(b) => *b,
                None => bail!(
                    "seq {} has {} blocks, no slot for token {}",
                    seq.seq_id,
                    block_table.len(),
                    idx
                ),
            };
            kv_slots.push(block * block_size + idx % block_size);
        }
        Ok(StagedSeq {
            tokens: (off..k_len).map(|idx| seq.get_token(idx)).collect(),
            positions: (off..k_len).map(|idx| idx as i64).collect(),
            layout: SeqLayout {
                query_len: q_len,
                kv_slots,
                block_table: block_table.to_vec(),
                sampled: k_len == seq_len,
            },
        })
    }
}

impl<B: AttentionBackend> ModelRunnerInputBuilder for ModelInputBuilder<B> {
    type Output = ModelInput<B::Metadata>;

    fn add_seq_group(&mut self, sg: &SequenceGroupMetadata) -> Result<()> {
        let mut staged = Vec::with_capacity(sg.seq_data.len());
        for seq in &sg.seq_data {
            let block_table = match sg.block_tables.get(&seq.seq_id) {
                Some(t) => t,
                None => bail!("no block table for seq {} of {}", seq.seq_id, sg.request_id),
            };
            staged.push(self.stage_seq(sg, seq, block_table)?);
        }

        // the whole group checked out; commit it
        let mut sample_indices = Vec::new();
        let mut do_sample = true;
        for st in staged {
            self.tokens.extend(st.tokens);
            self.positions.extend(st.positions);
            if st.layout.sampled {
                sample_indices.push(self.selected_token_indices.len());
                self.selected_token_indices
                    .push(self.tokens.len() as i64 - 1);
            } else {
                do_sample = false;
            }
            self.seqs.push(st.layout);
        }

        if sg.is_prompt {
            self.num_prompt_groups += 1;
        }
        self.request_ids_to_seq_ids
            .insert(sg.request_id.clone(), sg.seq_ids());
        self.seq_groups.push(SequenceGroupToSample {
            request_id: sg.request_id.clone(),
            seq_ids: sg.seq_ids(),
            sampling_params: sg.sampling_params.clone(),
            is_prompt: sg.is_prompt,
            do_sample,
            sample_indices,
        });
        Ok(())
    }

    fn build(self) -> Result<ModelInput<B::Metadata>> {
        let device = &self.device;
        let layout = BatchLayout {
            seqs: self.seqs,
            block_size: self.config.block_size,
        };
        let attn_metadata = self.attn_backend.build_metadata(&layout, device)?;

        let num_groups = self.seq_groups.len();
        let is_prompt = if num_groups == 0 {
            None
        } else if self.num_prompt_groups == num_groups {
            Some(true)
        } else if self.num_prompt_groups == 0 {
            Some(false)
        } else {
            // mixed prefill and decode
            None
        };

        let selected_token_indices = from_vec1(self.selected_token_indices, device)?;
        let sampling_metadata = SamplingMetadata::new(self.seq_groups, selected_token_indices);

        log::debug!(
            "{}: built input with {} groups, {} seqs, {} tokens",
            self.attn_backend.get_name(),
            num_groups,
            layout.seqs.len(),
            self.tokens.len()
        );

        Ok(ModelInput::from_parts(ModelInputParts {
            input_tokens: from_vec1(self.tokens, device)?,
            input_positions: from_vec1(self.positions, device)?,
            layout,
            attn_metadata: Some(attn_metadata),
            sampling_metadata: Some(sampling_metadata),
            virtual_engine: self.virtual_engine,
            is_prompt,
            request_ids_to_seq_ids: Some(self.request_ids_to_seq_ids),
            finished_requests_ids: self.finished_requests_ids,
        }))
    }
}
