//! Continuous batching scheduler.
//!
//! The scheduler decides, once per step, which sequence groups run and
//! with how many tokens, within three budgets: the KV block pool, the
//! batched-token cap and the sequence cap.
//!
//! ## Scheduling Flow
//!
//! ```text
//!   add_group()                                    schedule()
//!        │                                              │
//!        ▼                                              ▼
//!   ┌─────────┐                                   ┌─────────────┐
//!   │ Waiting │ ────────────────────────────────► │   Running   │
//!   │  Queue  │     (when resources available)    │     Set     │
//!   └─────────┘                                   └─────────────┘
//!        ▲                                              │
//!        │              preemption                      │
//!        └──────────────────────────────────────────────┘
//!                   (when the pool is exhausted)
//! ```
//!
//! Running groups are served before waiting ones; under memory pressure
//! the youngest running group is preempted and recomputed from scratch.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::config::SchedulerConfig;
use crate::core::block::blocks_for_tokens;
use crate::core::block_pool::{BlockCopy, BlockIndex, BlockPool};
use crate::core::sequence::{FinishReason, RequestId, SequenceGroup, SequenceId};
use crate::error::{Error, Result};

/// One scheduled group with its per-sequence token count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledGroup {
    /// Request identifier.
    pub request_id: RequestId,
    /// Tokens pushed through the executor per running sequence.
    pub num_tokens: usize,
}

/// The batch plan emitted by one scheduling step.
#[derive(Debug, Default)]
pub struct SchedulerOutputs {
    /// Scheduled groups in stable FCFS order.
    pub scheduled: Vec<ScheduledGroup>,
    /// Snapshot of each scheduled sequence's block table.
    pub block_tables: HashMap<SequenceId, Vec<BlockIndex>>,
    /// Sequences preempted during this step.
    pub preempted_seq_ids: Vec<SequenceId>,
    /// Copy-on-write transfers the executor must perform before writing.
    pub blocks_to_copy: Vec<BlockCopy>,
    /// Requests finished with `Ignored` because they can never fit.
    pub ignored_requests: Vec<RequestId>,
    /// Total batch rows (sum of tokens over scheduled sequences).
    pub num_batched_tokens: usize,
}

impl SchedulerOutputs {
    /// Check if there is anything to run.
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }
}

/// Continuous batching scheduler.
///
/// Owns the [`BlockPool`] and the flat request-id → group map; groups
/// move between the waiting queue and the running set in FCFS order.
pub struct Scheduler {
    /// Configuration.
    config: SchedulerConfig,
    /// Block pool for KV cache allocation.
    pool: BlockPool,
    /// All live groups by request id.
    groups: HashMap<RequestId, SequenceGroup>,
    /// Waiting request ids, oldest first. Preempted groups re-enter at
    /// the front.
    waiting: VecDeque<RequestId>,
    /// Running request ids in admission order (oldest first).
    running: Vec<RequestId>,
}

impl Scheduler {
    /// Create a new scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an invalid configuration.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let pool = BlockPool::new(config.num_blocks, config.block_size, config.use_cache_eviction);
        Ok(Self {
            config,
            pool,
            groups: HashMap::new(),
            waiting: VecDeque::new(),
            running: Vec::new(),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Get the block pool.
    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    /// Get mutable access to the block pool.
    pub fn pool_mut(&mut self) -> &mut BlockPool {
        &mut self.pool
    }

    /// Add a new group to the waiting queue (FCFS).
    pub fn add_group(&mut self, group: SequenceGroup) {
        let request_id = group.request_id();
        self.groups.insert(request_id, group);
        self.waiting.push_back(request_id);
    }

    /// Get a group by request id.
    pub fn get_group(&self, request_id: RequestId) -> Option<&SequenceGroup> {
        self.groups.get(&request_id)
    }

    /// Get a group by request id, mutably.
    pub fn get_group_mut(&mut self, request_id: RequestId) -> Option<&mut SequenceGroup> {
        self.groups.get_mut(&request_id)
    }

    /// Borrow a group and the pool together (disjoint fields), for
    /// fork/prune operations that touch both.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestNotFound`] for an unknown request.
    pub fn group_and_pool_mut(
        &mut self,
        request_id: RequestId,
    ) -> Result<(&mut SequenceGroup, &mut BlockPool)> {
        let group = self
            .groups
            .get_mut(&request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        Ok((group, &mut self.pool))
    }

    /// Iterate over all live groups.
    pub fn groups(&self) -> impl Iterator<Item = &SequenceGroup> {
        self.groups.values()
    }

    /// Remove a group, releasing every block it still holds.
    pub fn remove_group(&mut self, request_id: RequestId) -> Option<SequenceGroup> {
        let mut group = self.groups.remove(&request_id)?;
        for seq in group.sequences_mut() {
            seq.block_table_mut().release(&mut self.pool);
        }
        self.running.retain(|&id| id != request_id);
        self.waiting.retain(|&id| id != request_id);
        Some(group)
    }

    /// Finish every sequence of a group with `reason` and remove it.
    pub fn abort_group(&mut self, request_id: RequestId, reason: FinishReason) -> Option<SequenceGroup> {
        let mut group = self.groups.remove(&request_id)?;
        group.finish_all(reason, &mut self.pool);
        self.running.retain(|&id| id != request_id);
        self.waiting.retain(|&id| id != request_id);
        Some(group)
    }

    /// Number of waiting groups.
    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Number of running groups.
    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    /// Check if any group is still waiting or running.
    pub fn has_unfinished_groups(&self) -> bool {
        !self.waiting.is_empty() || !self.running.is_empty()
    }

    /// Produce the batch plan for one step.
    ///
    /// Running groups are reserved first, in FCFS order, preempting the
    /// youngest running group whenever the pool runs dry. Waiting
    /// groups are then admitted, also FCFS, but only as long as no
    /// preemption would be forced.
    pub fn schedule(&mut self) -> SchedulerOutputs {
        let mut outputs = SchedulerOutputs::default();
        let mut scheduled_seqs = 0usize;

        self.schedule_running(&mut outputs, &mut scheduled_seqs);
        self.schedule_waiting(&mut outputs, &mut scheduled_seqs);
        self.snapshot_block_tables(&mut outputs);

        outputs
    }

    /// Reserve blocks and token budget for already-running groups.
    fn schedule_running(&mut self, outputs: &mut SchedulerOutputs, scheduled_seqs: &mut usize) {
        let mut idx = 0;
        while idx < self.running.len() {
            let request_id = self.running[idx];
            let Some(group) = self.groups.get(&request_id) else {
                self.running.remove(idx);
                continue;
            };

            let num_seqs = group.num_running();
            if *scheduled_seqs + num_seqs > self.config.max_num_seqs {
                idx += 1;
                continue;
            }

            let budget_left = self.config.max_num_batched_tokens - outputs.num_batched_tokens;
            let Some(num_tokens) = self.desired_tokens(group, budget_left) else {
                idx += 1;
                continue;
            };

            match self.reserve_group(request_id, num_tokens, outputs) {
                Ok(()) => {
                    outputs.scheduled.push(ScheduledGroup {
                        request_id,
                        num_tokens,
                    });
                    outputs.num_batched_tokens += num_tokens * num_seqs;
                    *scheduled_seqs += num_seqs;
                    idx += 1;
                }
                Err(Error::OutOfBlocks) => {
                    // Preempt the youngest running group and retry this
                    // one, unless it is the youngest itself.
                    let victim = *self.running.last().unwrap_or(&request_id);
                    self.preempt(victim, outputs);
                    if victim == request_id {
                        // idx now points at the next group.
                        continue;
                    }
                }
                Err(_) => {
                    idx += 1;
                }
            }
        }
    }

    /// Admit waiting groups while every budget holds.
    fn schedule_waiting(&mut self, outputs: &mut SchedulerOutputs, scheduled_seqs: &mut usize) {
        while let Some(&request_id) = self.waiting.front() {
            let Some(group) = self.groups.get(&request_id) else {
                self.waiting.pop_front();
                continue;
            };

            // A prompt that can never be scheduled is finished as
            // ignored instead of waiting forever.
            if let Err(err) = self.check_admissible(group) {
                debug!(request_id, error = %err, "finishing unschedulable request as ignored");
                self.waiting.pop_front();
                if let Some(group) = self.groups.get_mut(&request_id) {
                    group.finish_all(FinishReason::Ignored, &mut self.pool);
                }
                outputs.ignored_requests.push(request_id);
                continue;
            }

            let num_seqs = group.num_running();
            if *scheduled_seqs + num_seqs > self.config.max_num_seqs {
                break;
            }

            let budget_left = self.config.max_num_batched_tokens - outputs.num_batched_tokens;
            let Some(num_tokens) = self.desired_tokens(group, budget_left) else {
                break;
            };

            // Admission must not force preemption: the chunk has to fit
            // in the currently free blocks.
            let mut blocks_needed = 0usize;
            let processed = group.num_processed_tokens();
            for seq in group.running_sequences() {
                let covered = seq.block_table().num_blocks();
                let needed = blocks_for_tokens(processed + num_tokens, self.config.block_size);
                blocks_needed += needed.saturating_sub(covered);
            }
            if !self.pool.can_allocate(blocks_needed) {
                break;
            }

            if self.reserve_group(request_id, num_tokens, outputs).is_err() {
                break;
            }

            self.waiting.pop_front();
            self.running.push(request_id);
            if let Some(group) = self.groups.get_mut(&request_id) {
                for seq in group.sequences_mut() {
                    if !seq.is_finished() {
                        let _ = seq.set_running();
                    }
                }
            }
            debug!(request_id, num_tokens, "admitted group");

            outputs.scheduled.push(ScheduledGroup {
                request_id,
                num_tokens,
            });
            outputs.num_batched_tokens += num_tokens * num_seqs;
            *scheduled_seqs += num_seqs;
        }
    }

    /// Check that a waiting group can ever be scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BudgetExceeded`] when the prompt can never fit
    /// the block pool, or would exceed the per-step token cap even in
    /// an otherwise empty batch while prompt chunking is disabled.
    fn check_admissible(&self, group: &SequenceGroup) -> Result<()> {
        let required_blocks: usize = group
            .running_sequences()
            .map(|seq| blocks_for_tokens(seq.total_len(), self.config.block_size))
            .sum();
        if required_blocks > self.pool.num_blocks() {
            return Err(Error::BudgetExceeded {
                required: required_blocks,
                capacity: self.pool.num_blocks(),
            });
        }

        // Without dynamic split-fuse a prefill runs whole.
        let prefill_rows = group.unprocessed_tokens() * group.num_running().max(1);
        if !self.config.dynamic_split_fuse && prefill_rows > self.config.max_num_batched_tokens {
            return Err(Error::BudgetExceeded {
                required: prefill_rows,
                capacity: self.config.max_num_batched_tokens,
            });
        }
        Ok(())
    }

    /// Tokens a group wants this step, bounded by the token budget.
    ///
    /// Returns `None` when the group cannot run this step at all.
    fn desired_tokens(&self, group: &SequenceGroup, budget_left: usize) -> Option<usize> {
        let unprocessed = group.unprocessed_tokens();
        if unprocessed == 0 || budget_left == 0 {
            return None;
        }

        let num_seqs = group.num_running().max(1);
        let per_seq_budget = budget_left / num_seqs;
        if per_seq_budget == 0 {
            return None;
        }

        if !group.is_prefill_complete() && !self.config.dynamic_split_fuse {
            // Whole remaining prompt or nothing.
            return (unprocessed <= per_seq_budget).then_some(unprocessed);
        }
        Some(unprocessed.min(per_seq_budget))
    }

    /// Grow and copy-on-write the block tables of one group for
    /// `num_tokens` new tokens per running sequence.
    fn reserve_group(
        &mut self,
        request_id: RequestId,
        num_tokens: usize,
        outputs: &mut SchedulerOutputs,
    ) -> Result<()> {
        let group = self
            .groups
            .get_mut(&request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        let start = group.num_processed_tokens();
        let end = start + num_tokens;

        for seq in group.sequences_mut() {
            if seq.is_finished() {
                continue;
            }
            seq.block_table_mut().ensure_slots(&mut self.pool, end)?;
            let copies = seq
                .block_table_mut()
                .prepare_write_range(&mut self.pool, start, end)?;
            outputs.blocks_to_copy.extend(copies);
        }
        Ok(())
    }

    /// Preempt a running group: drop its KV and recompute it later.
    fn preempt(&mut self, request_id: RequestId, outputs: &mut SchedulerOutputs) {
        self.running.retain(|&id| id != request_id);
        // Undo anything reserved for the victim during this step.
        let victim_seqs = self
            .groups
            .get(&request_id)
            .map(|group| group.num_running())
            .unwrap_or(0);
        let reclaimed_tokens: usize = outputs
            .scheduled
            .iter()
            .filter(|sg| sg.request_id == request_id)
            .map(|sg| sg.num_tokens * victim_seqs)
            .sum();
        outputs.scheduled.retain(|sg| sg.request_id != request_id);
        outputs.num_batched_tokens -= reclaimed_tokens;

        if let Some(group) = self.groups.get_mut(&request_id) {
            for seq in group.sequences_mut() {
                if seq.is_finished() {
                    continue;
                }
                seq.block_table_mut().release(&mut self.pool);
                let _ = seq.set_swapped();
                outputs.preempted_seq_ids.push(seq.seq_id());
            }
            group.rollback_processed(0);
        }
        // Copies targeting blocks the victim just released are void.
        outputs
            .blocks_to_copy
            .retain(|copy| self.pool.ref_count(copy.dst).is_some());
        self.waiting.push_front(request_id);
        debug!(request_id, "preempted group (recompute)");
    }

    /// Record the scheduled groups' block tables in the plan.
    fn snapshot_block_tables(&self, outputs: &mut SchedulerOutputs) {
        for sg in &outputs.scheduled {
            if let Some(group) = self.groups.get(&sg.request_id) {
                for seq in group.running_sequences() {
                    outputs
                        .block_tables
                        .insert(seq.seq_id(), seq.block_table().physical_ids().to_vec());
                }
            }
        }
    }

    /// Record that a scheduled group's tokens went through the executor.
    pub fn mark_group_processed(&mut self, request_id: RequestId, num_tokens: usize) {
        if let Some(group) = self.groups.get_mut(&request_id) {
            group.mark_processed(num_tokens);
        }
    }

    /// Retire a group whose every sequence has finished.
    pub fn retire_finished(&mut self) -> Vec<SequenceGroup> {
        let finished: Vec<RequestId> = self
            .groups
            .iter()
            .filter(|(_, group)| group.is_finished())
            .map(|(&id, _)| id)
            .collect();
        finished
            .into_iter()
            .filter_map(|id| self.remove_group(id))
            .collect()
    }

    /// Reset the scheduler, releasing every group and block.
    pub fn reset(&mut self) {
        self.groups.clear();
        self.waiting.clear();
        self.running.clear();
        self.pool.reset();
    }
}
