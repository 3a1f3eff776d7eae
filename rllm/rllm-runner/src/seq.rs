//! Scheduler-side descriptors consumed by the runner.

use crate::{config::SamplingParams, HashMap, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Token = u32;
pub type SeqId = u64;

/// Token state of one sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceData {
    pub seq_id: SeqId,
    prompt_token_ids: Vec<Token>,
    output_token_ids: Vec<Token>,
    num_computed_tokens: usize,
}

impl SequenceData {
    pub fn new(seq_id: SeqId, prompt_token_ids: &[Token]) -> Self {
        Self {
            seq_id,
            prompt_token_ids: prompt_token_ids.to_vec(),
            output_token_ids: Vec::new(),
            num_computed_tokens: 0,
        }
    }

    pub fn with_output(mut self, output_token_ids: &[Token]) -> Self {
        self.output_token_ids.extend_from_slice(output_token_ids);
        self
    }

    /// Mark the first `n` tokens as already having KV entries.
    pub fn with_computed(mut self, n: usize) -> Self {
        self.num_computed_tokens = n;
        self
    }

    pub fn get_len(&self) -> usize {
        self.prompt_token_ids.len() + self.output_token_ids.len()
    }

    pub fn get_prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    pub fn get_token(&self, idx: usize) -> Token {
        if idx < self.prompt_token_ids.len() {
            self.prompt_token_ids[idx]
        } else {
            self.output_token_ids[idx - self.prompt_token_ids.len()]
        }
    }

    pub fn get_num_computed_tokens(&self) -> usize {
        self.num_computed_tokens
    }

    pub fn output_token_ids(&self) -> &[Token] {
        &self.output_token_ids
    }
}

/// What the scheduler hands to a worker for one sequence group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceGroupMetadata {
    pub request_id: String,
    pub is_prompt: bool,
    pub seq_data: Vec<SequenceData>,
    pub sampling_params: SamplingParams,
    /// seq_id -> physical block numbers
    pub block_tables: HashMap<SeqId, Vec<usize>>,
    /// With chunked prefill, how many prompt tokens to run this step.
    pub token_chunk_size: Option<usize>,
}

impl SequenceGroupMetadata {
    pub fn seq_ids(&self) -> Vec<SeqId> {
        self.seq_data.iter().map(|s| s.seq_id).collect()
    }
}

/// Hidden states passed between pipeline-parallel stages.
#[derive(Debug, Clone, Default)]
pub struct IntermediateTensors {
    tensors: BTreeMap<String, Tensor>,
}

impl IntermediateTensors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, tensor: Tensor) {
        self.tensors.insert(key.to_string(), tensor);
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// Key/value cache of one layer; allocation is owned by the cache engine.
#[derive(Debug, Clone)]
pub struct KvCache {
    pub key: Tensor,
    pub value: Tensor,
}
