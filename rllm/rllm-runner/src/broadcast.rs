//! Broadcast protocol for model inputs.
//!
//! The driver flattens its input with
//! [`BroadcastableModelInput::as_broadcastable_tensor_dict`]; followers rebuild
//! it with [`BroadcastableModelInput::from_broadcasted_tensor_dict`]. Rebuilding
//! runs in stages: nested records (attention metadata, sampling metadata, the
//! frozen part of a multi-step input) are extracted first and parked in the
//! map under well-known keys, then the outer record picks them up.

use crate::{
    attn::{AttentionBackend, AttentionMetadata},
    sampling::{SamplingMetadata, SELECTED_TOKEN_INDICES},
    schema::Record,
    TensorDict,
};
use anyhow::Result;

pub const ATTN_METADATA_KEY: &str = "attn_metadata";
pub const SAMPLING_METADATA_KEY: &str = "sampling_metadata";
pub const FROZEN_MODEL_INPUT_KEY: &str = "frozen_model_input";
pub const STEP_ATTN_METADATA_KEY: &str = "step_attn_metadata";
/// Per-step attention metadata is flattened under this prefix, next to the
/// frozen input's own metadata.
pub const STEP_ATTN_PREFIX: &str = "step.";

/// An execution input that can cross a process/device boundary.
pub trait BroadcastableModelInput: Sized + Send + 'static {
    type AttnMetadata: AttentionMetadata;

    /// Flat map of every field other workers need.
    fn as_broadcastable_tensor_dict(&self) -> TensorDict;

    /// Pop fields out of `tensor_dict` and build a new instance. Keys that
    /// don't belong to the input are ignored. Attention metadata is only
    /// rebuilt when `attn_backend` is given.
    fn from_broadcasted_tensor_dict<B>(
        tensor_dict: TensorDict,
        attn_backend: Option<&B>,
    ) -> Result<Self>
    where
        B: AttentionBackend<Metadata = Self::AttnMetadata>;
}

pub fn add_attn_metadata_broadcastable_dict<M: AttentionMetadata>(
    tensor_dict: &mut TensorDict,
    attn_metadata: Option<&M>,
) {
    if let Some(md) = attn_metadata {
        md.write_fields(tensor_dict);
    }
}

/// Extract the backend's metadata fields and park the record under
/// [`ATTN_METADATA_KEY`].
pub fn init_attn_metadata_from_tensor_dict<B: AttentionBackend>(
    attn_backend: &B,
    tensor_dict: &mut TensorDict,
) -> Result<()> {
    let schema = attn_backend.metadata_schema();
    let fields = tensor_dict.pop_fields(&schema)?;
    let attn_metadata = attn_backend.make_metadata(fields, tensor_dict)?;
    log::trace!("{}: rebuilt {}", attn_backend.get_name(), schema.name);
    tensor_dict.insert_record(ATTN_METADATA_KEY, attn_metadata);
    Ok(())
}

pub fn add_sampling_metadata_broadcastable_dict(
    tensor_dict: &mut TensorDict,
    sampling_metadata: Option<&SamplingMetadata>,
) {
    if let Some(md) = sampling_metadata {
        md.write_fields(tensor_dict);
    }
}

/// `selected_token_indices` alone is enough for an indices-only
/// [`SamplingMetadata`]; without it no sampling metadata is parked.
pub fn init_sampling_metadata_from_tensor_dict(tensor_dict: &mut TensorDict) -> Result<()> {
    if tensor_dict.contains_key(SELECTED_TOKEN_INDICES) {
        let fields = tensor_dict.pop_fields(&SamplingMetadata::SCHEMA)?;
        let sampling_metadata = SamplingMetadata::from_fields(fields, tensor_dict)?;
        tensor_dict.insert_record(SAMPLING_METADATA_KEY, sampling_metadata);
    }
    Ok(())
}

pub fn add_step_attn_metadata_broadcastable_dict<M: AttentionMetadata>(
    tensor_dict: &mut TensorDict,
    attn_metadata: Option<&M>,
) {
    if let Some(md) = attn_metadata {
        let mut step_dict = TensorDict::new();
        md.write_fields(&mut step_dict);
        tensor_dict.extend_prefixed(STEP_ATTN_PREFIX, step_dict);
    }
}

/// Pop the [`STEP_ATTN_PREFIX`] keys and, given a backend, rebuild them into
/// metadata parked under [`STEP_ATTN_METADATA_KEY`]. Nothing is parked when
/// no per-step metadata was sent.
pub fn init_step_attn_metadata_from_tensor_dict<B: AttentionBackend>(
    attn_backend: Option<&B>,
    tensor_dict: &mut TensorDict,
) -> Result<()> {
    let mut step_dict = tensor_dict.split_prefixed(STEP_ATTN_PREFIX);
    let attn_backend = match attn_backend {
        Some(b) if !step_dict.is_empty() => b,
        _ => return Ok(()),
    };
    init_attn_metadata_from_tensor_dict(attn_backend, &mut step_dict)?;
    if let Some(md) = step_dict.take_record::<B::Metadata>(ATTN_METADATA_KEY)? {
        tensor_dict.insert_record(STEP_ATTN_METADATA_KEY, md);
    }
    Ok(())
}

/// Rebuild the frozen record `R` and park it under
/// [`FROZEN_MODEL_INPUT_KEY`], leaving the per-step fields in the map.
pub fn init_frozen_model_input_from_tensor_dict<R: Record>(
    tensor_dict: &mut TensorDict,
) -> Result<()> {
    let fields = tensor_dict.pop_fields(&R::SCHEMA)?;
    let frozen_model_input = R::from_fields(fields, tensor_dict)?;
    tensor_dict.insert_record(FROZEN_MODEL_INPUT_KEY, frozen_model_input);
    Ok(())
}
