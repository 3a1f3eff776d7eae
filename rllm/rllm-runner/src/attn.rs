//! Attention backends.
//!
//! A backend only knows how to describe a batch to its kernel: it builds its
//! metadata record from the batch layout on the driver, and declares the
//! schema followers use to rebuild that record from a broadcast map. The
//! kernels themselves live with the model executor.

use crate::{
    schema::{FieldKind, FieldSet, FieldSpec, Record, RecordSchema},
    tensor::{from_vec1, to_offsets},
    Device, Tensor, TensorDict,
};
use anyhow::{bail, Result};
use std::fmt::Debug;

pub trait AttentionMetadata: Record + Sync + Clone + Debug {
    /// KV-cache slot for every query token, `[num_tokens]`.
    fn slot_mapping(&self) -> &Tensor;
    fn num_seqs(&self) -> usize;
}

pub trait AttentionBackend: Send + Sync + 'static {
    type Metadata: AttentionMetadata;

    fn get_name(&self) -> &'static str;

    /// Fields of this backend's metadata as they appear in a broadcast map.
    fn metadata_schema(&self) -> RecordSchema {
        <Self::Metadata as Record>::SCHEMA
    }

    fn make_metadata(&self, fields: FieldSet, dict: &mut TensorDict) -> Result<Self::Metadata> {
        <Self::Metadata as Record>::from_fields(fields, dict)
    }

    fn build_metadata(&self, layout: &BatchLayout, device: &Device) -> Result<Self::Metadata>;
}

/// Placement of one sequence in the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SeqLayout {
    pub query_len: usize,
    /// Physical KV slot of every context position, including the query.
    pub kv_slots: Vec<usize>,
    pub block_table: Vec<usize>,
    /// The last query token is sampled (false mid-way through a chunked
    /// prompt).
    pub sampled: bool,
}

impl SeqLayout {
    pub fn context_len(&self) -> usize {
        self.kv_slots.len()
    }

    pub fn query_slots(&self) -> &[usize] {
        &self.kv_slots[self.kv_slots.len() - self.query_len..]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchLayout {
    pub seqs: Vec<SeqLayout>,
    pub block_size: usize,
}

impl BatchLayout {
    pub fn slot_mapping(&self, device: &Device) -> Result<Tensor> {
        let slots = self
            .seqs
            .iter()
            .flat_map(|s| s.query_slots().iter().map(|x| *x as i64))
            .collect::<Vec<_>>();
        from_vec1(slots, device)
    }

    /// Layout of the following decode step: every sampled sequence gets
    /// its sampled token as the only query, written to the slot right after
    /// its current context. Sequences that were not sampled drop out.
    pub fn next_decode_step(&self) -> Result<BatchLayout> {
        let bl_size = self.block_size;
        let mut seqs = Vec::new();
        for s in self.seqs.iter().filter(|s| s.sampled) {
            let pos = s.context_len();
            let block = match s.block_table.get(pos / bl_size) {
                Some(b) => *b,
                None => bail!(
                    "block table has {} blocks, no slot for position {}",
                    s.block_table.len(),
                    pos
                ),
            };
            let mut kv_slots = s.kv_slots.clone();
            kv_slots.push(block * bl_size + pos % bl_size);
            seqs.push(SeqLayout {
                query_len: 1,
                kv_slots,
                block_table: s.block_table.clone(),
                sampled: true,
            });
        }
        Ok(BatchLayout {
            seqs,
            block_size: bl_size,
        })
    }
}

/// Variable-length flash attention over a gathered KV context.
#[derive(Debug, Clone, Default)]
pub struct FlashAttnBackend;

#[derive(Debug, Clone)]
pub struct FlashAttnMetadata {
    pub seqlens_q: Tensor,      // u32, [batch_size + 1]; points to tokens/positions
    pub seqlens_k: Tensor,      // u32, [batch_size + 1]; can go outside tokens/positions
    pub gather_mapping: Tensor, // i64, [sum(context_len)]
    pub slot_mapping: Tensor,   // i64, [num_tokens]
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
}

impl Record for FlashAttnMetadata {
    const SCHEMA: RecordSchema = RecordSchema {
        name: "FlashAttnMetadata",
        fields: &[
            FieldSpec::required("seqlens_q", FieldKind::Tensor),
            FieldSpec::required("seqlens_k", FieldKind::Tensor),
            FieldSpec::required("gather_mapping", FieldKind::Tensor),
            FieldSpec::required("slot_mapping", FieldKind::Tensor),
            FieldSpec::required("max_seqlen_q", FieldKind::Int),
            FieldSpec::required("max_seqlen_k", FieldKind::Int),
        ],
    };

    fn write_fields(&self, dict: &mut TensorDict) {
        dict.insert("seqlens_q", self.seqlens_q.clone());
        dict.insert("seqlens_k", self.seqlens_k.clone());
        dict.insert("gather_mapping", self.gather_mapping.clone());
        dict.insert("slot_mapping", self.slot_mapping.clone());
        dict.insert("max_seqlen_q", self.max_seqlen_q);
        dict.insert("max_seqlen_k", self.max_seqlen_k);
    }

    fn from_fields(mut fields: FieldSet, _dict: &mut TensorDict) -> Result<Self> {
        Ok(Self {
            seqlens_q: fields.required("seqlens_q")?,
            seqlens_k: fields.required("seqlens_k")?,
            gather_mapping: fields.required("gather_mapping")?,
            slot_mapping: fields.required("slot_mapping")?,
            max_seqlen_q: fields.required("max_seqlen_q")?,
            max_seqlen_k: fields.required("max_seqlen_k")?,
        })
    }
}

impl AttentionMetadata for FlashAttnMetadata {
    fn slot_mapping(&self) -> &Tensor {
        &self.slot_mapping
    }

    fn num_seqs(&self) -> usize {
        self.seqlens_q.elem_count().saturating_sub(1)
    }
}

impl AttentionBackend for FlashAttnBackend {
    type Metadata = FlashAttnMetadata;

    fn get_name(&self) -> &'static str {
        "FLASH_ATTN"
    }

    fn build_metadata(&self, layout: &BatchLayout, device: &Device) -> Result<FlashAttnMetadata> {
        let (max_seqlen_q, seqlens_q) =
            to_offsets(layout.seqs.iter().map(|s| s.query_len), device)?;
        let (max_seqlen_k, seqlens_k) =
            to_offsets(layout.seqs.iter().map(|s| s.context_len()), device)?;
        let gather_mapping = layout
            .seqs
            .iter()
            .flat_map(|s| s.kv_slots.iter().map(|x| *x as i64))
            .collect::<Vec<_>>();

        Ok(FlashAttnMetadata {
            seqlens_q,
            seqlens_k,
            gather_mapping: from_vec1(gather_mapping, device)?,
            slot_mapping: layout.slot_mapping(device)?,
            max_seqlen_q,
            max_seqlen_k,
        })
    }
}

/// Paged attention reading KV straight from cache blocks.
#[derive(Debug, Clone, Default)]
pub struct PagedAttnBackend;

#[derive(Debug, Clone)]
pub struct PagedAttnMetadata {
    pub block_tables: Tensor, // u32, [num_seqs, max_num_blocks_per_seq]
    pub context_lens: Tensor, // u32, [num_seqs]
    pub slot_mapping: Tensor, // i64, [num_tokens]
    pub block_size: usize,
    pub max_context_len: usize,
}

impl Record for PagedAttnMetadata {
    const SCHEMA: RecordSchema = RecordSchema {
        name: "PagedAttnMetadata",
        fields: &[
            FieldSpec::required("block_tables", FieldKind::Tensor),
            FieldSpec::required("context_lens", FieldKind::Tensor),
            FieldSpec::required("slot_mapping", FieldKind::Tensor),
            FieldSpec::required("block_size", FieldKind::Int),
            FieldSpec::required("max_context_len", FieldKind::Int),
        ],
    };

    fn write_fields(&self, dict: &mut TensorDict) {
        dict.insert("block_tables", self.block_tables.clone());
        dict.insert("context_lens", self.context_lens.clone());
        dict.insert("slot_mapping", self.slot_mapping.clone());
        dict.insert("block_size", self.block_size);
        dict.insert("max_context_len", self.max_context_len);
    }

    fn from_fields(mut fields: FieldSet, _dict: &mut TensorDict) -> Result<Self> {
        Ok(Self {
            block_tables: fields.required("block_tables")?,
            context_lens: fields.required("context_lens")?,
            slot_mapping: fields.required("slot_mapping")?,
            block_size: fields.required("block_size")?,
            max_context_len: fields.required("max_context_len")?,
        })
    }
}

impl AttentionMetadata for PagedAttnMetadata {
    fn slot_mapping(&self) -> &Tensor {
        &self.slot_mapping
    }

    fn num_seqs(&self) -> usize {
        self.context_lens.elem_count()
    }
}

impl AttentionBackend for PagedAttnBackend {
    type Metadata = PagedAttnMetadata;

    fn get_name(&self) -> &'static str {
        "PAGED_ATTN"
    }

    fn build_metadata(&self, layout: &BatchLayout, device: &Device) -> Result<PagedAttnMetadata> {
        let bl_size = layout.block_size;
        let mut block_tables: Vec<Vec<u32>> = Vec::new();
        let mut context_lens: Vec<u32> = Vec::new();

        for s in &layout.seqs {
            let ctx_size = s.context_len();
            let needed = (ctx_size + bl_size - 1) / bl_size;
            if s.block_table.len() < needed {
                bail!(
                    "block table has {} blocks, context of {} needs {}",
                    s.block_table.len(),
                    ctx_size,
                    needed
                );
            }
            context_lens.push(ctx_size as u32);
            block_tables.push(s.block_table[..needed].iter().map(|b| *b as u32).collect());
        }

        let num_seqs = block_tables.len();
        let max_context_len = *context_lens.iter().max().unwrap_or(&0) as usize;
        let max_blocks = block_tables.iter().map(|v| v.len()).max().unwrap_or(0);
        let flat_block_tables = block_tables
            .into_iter()
            .flat_map(|mut v| {
                v.resize(max_blocks, 0);
                v.into_iter()
            })
            .collect::<Vec<_>>();

        Ok(PagedAttnMetadata {
            block_tables: Tensor::from_vec(flat_block_tables, (num_seqs, max_blocks), device)?,
            context_lens: from_vec1(context_lens, device)?,
            slot_mapping: layout.slot_mapping(device)?,
            block_size: bl_size,
            max_context_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> BatchLayout {
        BatchLayout {
            seqs: vec![
                SeqLayout {
                    query_len: 3,
                    kv_slots: vec![8, 9, 10],
                    block_table: vec![2],
                    sampled: true,
                },
                SeqLayout {
                    query_len: 1,
                    kv_slots: vec![0, 1, 2, 3, 4],
                    block_table: vec![0, 1],
                    sampled: true,
                },
            ],
            block_size: 4,
        }
    }

    #[test]
    fn flash_offsets() {
        let md = FlashAttnBackend
            .build_metadata(&layout(), &Device::Cpu)
            .unwrap();
        assert_eq!(md.seqlens_q.to_vec1::<u32>().unwrap(), vec![0, 3, 4]);
        assert_eq!(md.seqlens_k.to_vec1::<u32>().unwrap(), vec![0, 3, 8]);
        assert_eq!(md.slot_mapping.to_vec1::<i64>().unwrap(), vec![8, 9, 10, 4]);
        assert_eq!(md.max_seqlen_q, 3);
        assert_eq!(md.max_seqlen_k, 5);
        assert_eq!(md.num_seqs(), 2);
    }

    #[test]
    fn paged_block_tables_are_padded() {
        let md = PagedAttnBackend
            .build_metadata(&layout(), &Device::Cpu)
            .unwrap();
        assert_eq!(md.block_tables.dims(), &[2, 2]);
        assert_eq!(
            md.block_tables.to_vec2::<u32>().unwrap(),
            vec![vec![2, 0], vec![0, 1]]
        );
        assert_eq!(md.context_lens.to_vec1::<u32>().unwrap(), vec![3, 5]);
        assert_eq!(md.max_context_len, 5);
    }

    #[test]
    fn paged_rejects_short_block_table() {
        let mut l = layout();
        l.seqs[1].block_table.pop();
        assert!(PagedAttnBackend.build_metadata(&l, &Device::Cpu).is_err());
    }

    #[test]
    fn decode_step_appends_one_slot() {
        let mut l = layout();
        l.seqs[0].sampled = false;
        let next = l.next_decode_step().unwrap();
        assert_eq!(next.seqs.len(), 1);
        assert_eq!(next.seqs[0].query_len, 1);
        assert_eq!(next.seqs[0].query_slots(), &[5]);
        assert_eq!(next.seqs[0].context_len(), 6);

        let md = FlashAttnBackend
            .build_metadata(&next, &Device::Cpu)
            .unwrap();
        assert_eq!(md.seqlens_q.to_vec1::<u32>().unwrap(), vec![0, 1]);
        assert_eq!(md.seqlens_k.to_vec1::<u32>().unwrap(), vec![0, 6]);
        assert_eq!(md.slot_mapping.to_vec1::<i64>().unwrap(), vec![5]);
        assert_eq!(md.max_seqlen_k, 6);
    }

    #[test]
    fn decode_step_needs_a_block() {
        let mut l = layout();
        l.seqs[1].kv_slots = (0..8).collect();
        assert!(l.next_decode_step().is_err());
    }
}
