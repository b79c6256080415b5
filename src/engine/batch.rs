//! Batch assembly: flattening a plan into executor tensors.
//!
//! Prefill and decode are not distinguished at the tensor level: the
//! batch dimension carries every scheduled token of every scheduled
//! sequence, while the sequence-length dimension stays 1. This merge
//! avoids ragged dimensions entirely.

use candle_core::{Device, Tensor};

use crate::core::sequence::{RequestId, SequenceId};
use crate::error::{Error, Result};
use crate::scheduler::batch::SchedulerOutputs;
use crate::scheduler::Scheduler;

/// Row range of one sequence inside the flattened batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceSpan {
    /// Request the sequence belongs to.
    pub request_id: RequestId,
    /// The sequence.
    pub seq_id: SequenceId,
    /// First row of the sequence in the batch.
    pub start_row: usize,
    /// Number of rows (scheduled tokens) of the sequence.
    pub num_rows: usize,
}

/// Executor-facing input tensors for one fused forward pass.
#[derive(Debug)]
pub struct ModelInputs {
    /// Token ids, shape `[B, 1]`, i64.
    pub input_ids: Tensor,
    /// Absolute positions, shape `[B, 1]`, i64.
    pub position_ids: Tensor,
    /// Physical KV slot written by each token, shape `[B, 1]`, i64.
    pub slot_mapping: Tensor,
    /// Context length including the token itself, shape `[B]`, i64.
    pub context_lens: Tensor,
    /// Per-row block tables, zero-padded, shape `[B, max_blocks]`, u32.
    pub block_tables: Tensor,
    /// Always false: prefill and decode are fused.
    pub is_prompt: bool,
    /// Maximum context length across the batch.
    pub max_context_len: usize,
    /// Row bookkeeping, in scheduled order.
    pub seq_spans: Vec<SequenceSpan>,
}

impl ModelInputs {
    /// Number of rows in the batch.
    pub fn batch_size(&self) -> usize {
        self.seq_spans.iter().map(|span| span.num_rows).sum()
    }
}

/// Flattens scheduled sequences into [`ModelInputs`].
#[derive(Debug, Clone)]
pub struct BatchAssembler {
    device: Device,
}

impl BatchAssembler {
    /// Create an assembler producing tensors on `device`.
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    /// Build the executor inputs for one batch plan.
    ///
    /// For token index `t` of a sequence whose group has processed `p`
    /// tokens: the position is `p + t`, the input id is the prompt or
    /// generated token at that position and the slot is
    /// `table[(p + t) / block_size] * block_size + (p + t) % block_size`.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan references unknown groups or token
    /// positions outside a sequence.
    pub fn assemble(
        &self,
        scheduler: &Scheduler,
        plan: &SchedulerOutputs,
    ) -> Result<ModelInputs> {
        let mut input_ids: Vec<i64> = Vec::new();
        let mut position_ids: Vec<i64> = Vec::new();
        let mut slot_mapping: Vec<i64> = Vec::new();
        let mut context_lens: Vec<i64> = Vec::new();
        let mut row_tables: Vec<Vec<u32>> = Vec::new();
        let mut seq_spans = Vec::new();

        let mut max_num_blocks = 0usize;
        let mut max_context_len = 0usize;

        for sg in &plan.scheduled {
            let group = scheduler
                .get_group(sg.request_id)
                .ok_or(Error::RequestNotFound(sg.request_id))?;
            let processed = group.num_processed_tokens();

            for seq in group.running_sequences() {
                let start_row = input_ids.len();
                let table = seq.block_table();
                max_num_blocks = max_num_blocks.max(table.num_blocks());

                for t in 0..sg.num_tokens {
                    let pos = processed + t;
                    let token =
                        group
                            .token_at(seq, pos)
                            .ok_or(Error::BlockOutOfBounds {
                                logical_idx: pos,
                                num_blocks: seq.total_len(),
                            })?;

                    input_ids.push(token as i64);
                    position_ids.push(pos as i64);
                    slot_mapping.push(table.physical_slot(pos)? as i64);
                    context_lens.push((pos + 1) as i64);
                    row_tables.push(table.physical_ids().to_vec());
                    max_context_len = max_context_len.max(pos + 1);
                }

                seq_spans.push(SequenceSpan {
                    request_id: sg.request_id,
                    seq_id: seq.seq_id(),
                    start_row,
                    num_rows: sg.num_tokens,
                });
            }
        }

        let batch = input_ids.len();
        let mut tables_flat: Vec<u32> = Vec::with_capacity(batch * max_num_blocks);
        for table in &row_tables {
            tables_flat.extend_from_slice(table);
            tables_flat.resize(tables_flat.len() + (max_num_blocks - table.len()), 0);
        }

        Ok(ModelInputs {
            input_ids: Tensor::from_vec(input_ids, (batch, 1), &self.device)?,
            position_ids: Tensor::from_vec(position_ids, (batch, 1), &self.device)?,
            slot_mapping: Tensor::from_vec(slot_mapping, (batch, 1), &self.device)?,
            context_lens: Tensor::from_vec(context_lens, batch, &self.device)?,
            block_tables: Tensor::from_vec(tables_flat, (batch, max_num_blocks), &self.device)?,
            is_prompt: false,
            max_context_len,
            seq_spans,
        })
    }
}
