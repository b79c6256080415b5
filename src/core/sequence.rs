//! Sequence and sequence-group state for inference requests.
//!
//! A [`Sequence`] is one decoding trajectory: its generated tokens, KV
//! block table and lifecycle state. A [`SequenceGroup`] is one user
//! request: a family of sequences sharing the prompt and the sampling
//! parameters (one for greedy decoding, several for parallel sampling
//! or beam search).

use crate::config::SamplingParams;
use crate::core::block::BlockTable;
use crate::core::block_pool::BlockPool;
use crate::error::{Error, Result};

/// Unique identifier for a sequence within a pipeline.
pub type SequenceId = u64;

/// Unique identifier for a request.
pub type RequestId = u64;

/// Hands out pipeline-unique sequence ids.
///
/// Atomic so that request submission from any thread can mint the root
/// sequence id without holding the pipeline lock.
#[derive(Debug, Default)]
pub struct SequenceIdAllocator(std::sync::atomic::AtomicU64);

impl SequenceIdAllocator {
    /// Allocate the next id.
    pub fn next(&self) -> SequenceId {
        self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

/// Status of a sequence in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    /// Waiting in queue to be scheduled.
    Waiting,
    /// Currently running (prefill or decode).
    Running,
    /// Preempted; KV dropped, waiting to be recomputed.
    Swapped,
    /// Finished generation.
    Finished,
}

impl SequenceStatus {
    /// Check if the sequence can still be scheduled.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Waiting | Self::Running | Self::Swapped)
    }

    /// Check if the sequence is finished.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Get the status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Swapped => "Swapped",
            Self::Finished => "Finished",
        }
    }
}

/// Reason for sequence completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// End-of-sequence token generated.
    EndOfSequence,
    /// Token limit reached (`max_new_tokens` or `max_length`).
    Length,
    /// A stop token was generated, or the consumer dropped the handle.
    Stopped,
    /// The prompt could never fit the block budget.
    Ignored,
    /// The executor failed while the sequence was in flight.
    Aborted,
}

/// A single decoding trajectory.
#[derive(Debug, Clone)]
pub struct Sequence {
    /// Unique sequence identifier.
    seq_id: SequenceId,
    /// Identifier of the sequence this one was forked from, if any.
    parent_id: Option<SequenceId>,
    /// Length of the shared prompt (tokens live in the group).
    prompt_len: usize,
    /// Generated token ids, in order.
    generated_ids: Vec<u32>,
    /// Per-token log-probabilities, parallel to `generated_ids`.
    log_probs: Vec<f32>,
    /// Block table for the KV cache mapping.
    block_table: BlockTable,
    /// Current status.
    status: SequenceStatus,
    /// Reason for finishing (if finished).
    finish_reason: Option<FinishReason>,
}

impl Sequence {
    /// Create a fresh root sequence for a prompt of `prompt_len` tokens.
    pub fn new(seq_id: SequenceId, prompt_len: usize, block_size: usize) -> Self {
        Self {
            seq_id,
            parent_id: None,
            prompt_len,
            generated_ids: Vec::new(),
            log_probs: Vec::new(),
            block_table: BlockTable::new(block_size),
            status: SequenceStatus::Waiting,
            finish_reason: None,
        }
    }

    /// Get the sequence ID.
    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    /// Get the parent sequence ID, if the sequence was forked.
    pub fn parent_id(&self) -> Option<SequenceId> {
        self.parent_id
    }

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    /// Get the generated token IDs.
    pub fn generated_ids(&self) -> &[u32] {
        &self.generated_ids
    }

    /// Get the number of generated tokens.
    pub fn generated_len(&self) -> usize {
        self.generated_ids.len()
    }

    /// Get the total length (prompt + generated).
    pub fn total_len(&self) -> usize {
        self.prompt_len + self.generated_ids.len()
    }

    /// Per-token log-probabilities, parallel to the generated ids.
    pub fn log_probs(&self) -> &[f32] {
        &self.log_probs
    }

    /// Sum of generated-token log-probabilities.
    pub fn cumulative_log_prob(&self) -> f32 {
        self.log_probs.iter().sum()
    }

    /// Get the block table.
    pub fn block_table(&self) -> &BlockTable {
        &self.block_table
    }

    /// Get mutable access to the block table.
    pub fn block_table_mut(&mut self) -> &mut BlockTable {
        &mut self.block_table
    }

    /// Get the current status.
    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    /// Get the finish reason (if finished).
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Check if the sequence is finished.
    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    /// Append a generated token with its log-probability.
    pub fn append_token(&mut self, token_id: u32, log_prob: f32) {
        self.generated_ids.push(token_id);
        self.log_probs.push(log_prob);
    }

    /// Drop generated tokens down to `new_len`, returning how many were
    /// removed. Used when speculative validation rejects a tail.
    pub fn truncate_generated(&mut self, new_len: usize) -> usize {
        let removed = self.generated_ids.len().saturating_sub(new_len);
        self.generated_ids.truncate(new_len);
        self.log_probs.truncate(new_len);
        removed
    }

    /// Transition to running state.
    ///
    /// # Errors
    ///
    /// Returns an error if the current state forbids the transition.
    pub fn set_running(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Waiting | SequenceStatus::Swapped => {
                self.status = SequenceStatus::Running;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Running",
            }),
        }
    }

    /// Transition to swapped state (preempted, KV dropped).
    ///
    /// # Errors
    ///
    /// Returns an error if the current state forbids the transition.
    pub fn set_swapped(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Running => {
                self.status = SequenceStatus::Swapped;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Swapped",
            }),
        }
    }

    /// Mark the sequence as finished.
    pub fn set_finished(&mut self, reason: FinishReason) {
        self.status = SequenceStatus::Finished;
        self.finish_reason = Some(reason);
    }

    /// Fork this sequence into a child trajectory.
    ///
    /// The child copies the token state and shares every KV block with
    /// the parent (reference counts incremented); writes are resolved
    /// through copy-on-write later.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot register the shared blocks.
    pub fn fork(&self, child_id: SequenceId, pool: &mut BlockPool) -> Result<Sequence> {
        Ok(Sequence {
            seq_id: child_id,
            parent_id: Some(self.seq_id),
            prompt_len: self.prompt_len,
            generated_ids: self.generated_ids.clone(),
            log_probs: self.log_probs.clone(),
            block_table: self.block_table.fork(pool)?,
            status: self.status,
            finish_reason: None,
        })
    }
}

impl PartialEq for Sequence {
    fn eq(&self, other: &Self) -> bool {
        self.seq_id == other.seq_id
    }
}

impl Eq for Sequence {}

/// One user request: sequences sharing a prompt and sampling params.
#[derive(Debug, Clone)]
pub struct SequenceGroup {
    /// Request identifier.
    request_id: RequestId,
    /// Prompt token ids shared by every sequence of the group.
    prompt_ids: Vec<u32>,
    /// Sampling parameters for the whole family.
    sampling_params: SamplingParams,
    /// The trajectories. Index 0 is the root until the first fork.
    sequences: Vec<Sequence>,
    /// Prompt/generated tokens already pushed through the executor.
    num_processed_tokens: usize,
    /// Submission order for FCFS scheduling.
    arrival: u64,
}

impl SequenceGroup {
    /// Create a group with a single root sequence in `Waiting` state.
    pub fn new(
        request_id: RequestId,
        prompt_ids: Vec<u32>,
        sampling_params: SamplingParams,
        block_size: usize,
        root_seq_id: SequenceId,
        arrival: u64,
    ) -> Self {
        let root = Sequence::new(root_seq_id, prompt_ids.len(), block_size);
        Self {
            request_id,
            prompt_ids,
            sampling_params,
            sequences: vec![root],
            num_processed_tokens: 0,
            arrival,
        }
    }

    /// Get the request ID.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Get the prompt token IDs.
    pub fn prompt_ids(&self) -> &[u32] {
        &self.prompt_ids
    }

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_ids.len()
    }

    /// Get the sampling parameters.
    pub fn sampling_params(&self) -> &SamplingParams {
        &self.sampling_params
    }

    /// Get the submission order.
    pub fn arrival(&self) -> u64 {
        self.arrival
    }

    /// All sequences, running or finished.
    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    /// Mutable access to all sequences.
    pub fn sequences_mut(&mut self) -> &mut [Sequence] {
        &mut self.sequences
    }

    /// Sequences that still take part in forward passes.
    pub fn running_sequences(&self) -> impl Iterator<Item = &Sequence> {
        self.sequences.iter().filter(|seq| !seq.is_finished())
    }

    /// Number of unfinished sequences.
    pub fn num_running(&self) -> usize {
        self.running_sequences().count()
    }

    /// Look up a sequence by id.
    pub fn sequence(&self, seq_id: SequenceId) -> Option<&Sequence> {
        self.sequences.iter().find(|seq| seq.seq_id() == seq_id)
    }

    /// Look up a sequence by id, mutably.
    pub fn sequence_mut(&mut self, seq_id: SequenceId) -> Option<&mut Sequence> {
        self.sequences.iter_mut().find(|seq| seq.seq_id() == seq_id)
    }

    /// Tokens already pushed through the executor.
    pub fn num_processed_tokens(&self) -> usize {
        self.num_processed_tokens
    }

    /// Record `n` more tokens as processed.
    pub fn mark_processed(&mut self, n: usize) {
        self.num_processed_tokens += n;
    }

    /// Rewind the processed counter after a KV rollback.
    pub fn rollback_processed(&mut self, num_processed: usize) {
        self.num_processed_tokens = num_processed;
    }

    /// Context length of the group (prompt plus generated tokens).
    ///
    /// Sequences of a group advance in lockstep, so the first running
    /// sequence is representative.
    pub fn context_len(&self) -> usize {
        self.running_sequences()
            .next()
            .map(|seq| seq.total_len())
            .unwrap_or(self.prompt_ids.len())
    }

    /// Tokens that exist but have not gone through the executor yet.
    ///
    /// During prefill this is the remaining prompt; in decode it is the
    /// freshly appended token (or several, when speculative candidates
    /// await validation).
    pub fn unprocessed_tokens(&self) -> usize {
        self.context_len().saturating_sub(self.num_processed_tokens)
    }

    /// Whether the whole prompt has been prefilled.
    pub fn is_prefill_complete(&self) -> bool {
        self.num_processed_tokens >= self.prompt_ids.len()
    }

    /// Token at logical position `pos` of a sequence (prompt or generated).
    pub fn token_at(&self, seq: &Sequence, pos: usize) -> Option<u32> {
        if pos < self.prompt_ids.len() {
            self.prompt_ids.get(pos).copied()
        } else {
            seq.generated_ids().get(pos - self.prompt_ids.len()).copied()
        }
    }

    /// Prompt and generated ids of a sequence as one vector.
    pub fn full_token_ids(&self, seq: &Sequence) -> Vec<u32> {
        let mut ids = self.prompt_ids.clone();
        ids.extend_from_slice(seq.generated_ids());
        ids
    }

    /// Fork the sequence `parent_id` into a new child trajectory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SequenceNotFound`] for an unknown parent, or a
    /// pool error if the shared blocks cannot be registered.
    pub fn fork_sequence(
        &mut self,
        parent_id: SequenceId,
        child_id: SequenceId,
        pool: &mut BlockPool,
    ) -> Result<()> {
        let parent = self
            .sequence(parent_id)
            .ok_or(Error::SequenceNotFound(parent_id))?;
        let child = parent.fork(child_id, pool)?;
        self.sequences.push(child);
        Ok(())
    }

    /// Remove a pruned trajectory and release its blocks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SequenceNotFound`] for an unknown sequence.
    pub fn drop_sequence(&mut self, seq_id: SequenceId, pool: &mut BlockPool) -> Result<Sequence> {
        let idx = self
            .sequences
            .iter()
            .position(|seq| seq.seq_id() == seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))?;
        let mut seq = self.sequences.remove(idx);
        seq.block_table_mut().release(pool);
        Ok(seq)
    }

    /// Finish one trajectory and release its KV blocks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SequenceNotFound`] for an unknown sequence.
    pub fn finish_sequence(
        &mut self,
        seq_id: SequenceId,
        reason: FinishReason,
        pool: &mut BlockPool,
    ) -> Result<()> {
        let seq = self
            .sequence_mut(seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))?;
        seq.set_finished(reason);
        seq.block_table_mut().release(pool);
        Ok(())
    }

    /// Finish every unfinished trajectory with `reason`.
    pub fn finish_all(&mut self, reason: FinishReason, pool: &mut BlockPool) {
        for seq in &mut self.sequences {
            if !seq.is_finished() {
                seq.set_finished(reason);
                seq.block_table_mut().release(pool);
            }
        }
    }

    /// Whether every trajectory has finished.
    pub fn is_finished(&self) -> bool {
        self.sequences.iter().all(|seq| seq.is_finished())
    }
}
