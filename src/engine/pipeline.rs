//! Continuous batching pipeline.
//!
//! The pipeline orchestrates one step of inference:
//!
//! ```text
//!  add_request()                     step()
//!       │                              │
//!       ▼                              ▼
//!  ┌──────────┐   pull   ┌───────────┐   plan   ┌───────────────┐
//!  │ Awaiting │ ───────► │ Scheduler │ ───────► │ BatchAssembler│
//!  │  queue   │          └───────────┘          └───────────────┘
//!  └──────────┘                │                        │
//!                              ▼                        ▼
//!                        ┌──────────┐  logits   ┌──────────────┐
//!                        │ Sampler  │ ◄──────── │   Executor   │
//!                        └──────────┘           └──────────────┘
//!                              │
//!                              ▼
//!                     sequence updates ──► GenerationStream frames
//! ```
//!
//! `step()` runs to completion before any other step or request pull
//! mutates scheduler state; submitters only touch the awaiting queue
//! behind its own mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::config::{AdapterSpec, SamplingParams, SchedulerConfig};
use crate::core::sequence::{
    FinishReason, RequestId, SequenceGroup, SequenceId, SequenceIdAllocator,
};
use crate::engine::batch::{BatchAssembler, ModelInputs};
use crate::engine::sampler::{log_softmax, LogitsRow, Sampler, SequenceUpdate};
use crate::engine::stream::{
    GenerationHandle, GenerationOutput, GenerationOutputs, GenerationStream, Streamer,
};
use crate::error::{Error, Result};
use crate::executor::{Executor, Tokenizer};
use crate::scheduler::batch::SchedulerOutputs;
use crate::scheduler::Scheduler;

/// Ranked results of one request from a blocking generate call.
#[derive(Debug)]
pub struct RequestOutput {
    /// The request.
    pub request_id: RequestId,
    /// Results, best score first, truncated to `num_return_sequences`.
    pub results: Vec<crate::engine::stream::GenerationResult>,
    /// Request-level status when no per-sequence frames exist.
    pub status: Option<FinishReason>,
}

/// Token counts reported by a speculative reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateRequestResult {
    /// Tokens appended to the sequence.
    pub inserted: usize,
    /// Tokens removed from the sequence tail.
    pub removed: usize,
}

/// Continuous batching pipeline over one executor.
pub struct Pipeline {
    scheduler: Scheduler,
    assembler: BatchAssembler,
    sampler: Sampler,
    executor: Box<dyn Executor>,
    tokenizer: Arc<dyn Tokenizer>,
    eos_token_id: Option<u32>,
    /// Validation mode verifies inserted candidate tokens greedily
    /// instead of ignoring multi-token decode rows.
    validation_mode: bool,
    /// Requests submitted but not yet pulled into the scheduler.
    awaiting: Mutex<Vec<(SequenceGroup, Arc<GenerationStream>)>>,
    /// Streams of live requests.
    streams: HashMap<RequestId, Arc<GenerationStream>>,
    /// Per-sequence count of already-published tokens.
    published: HashMap<SequenceId, usize>,
    /// Candidate verdicts of the last step: (accepted, rejected).
    validation_stats: HashMap<RequestId, (usize, usize)>,
    seq_ids: SequenceIdAllocator,
    arrival_clock: AtomicU64,
    next_request_id: AtomicU64,
}

impl Pipeline {
    /// Create a pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an invalid scheduler
    /// configuration.
    pub fn new(
        executor: Box<dyn Executor>,
        tokenizer: Arc<dyn Tokenizer>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        Self::with_validation_mode(executor, tokenizer, config, false)
    }

    /// Create a pipeline, optionally in validation mode (the main side
    /// of a speculative pair).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an invalid scheduler
    /// configuration.
    pub fn with_validation_mode(
        executor: Box<dyn Executor>,
        tokenizer: Arc<dyn Tokenizer>,
        config: SchedulerConfig,
        validation_mode: bool,
    ) -> Result<Self> {
        let scheduler = Scheduler::new(config)?;
        let assembler = BatchAssembler::new(executor.device().clone());
        let eos_token_id = tokenizer.eos_token_id();

        Ok(Self {
            scheduler,
            assembler,
            sampler: Sampler::new(),
            executor,
            tokenizer,
            eos_token_id,
            validation_mode,
            awaiting: Mutex::new(Vec::new()),
            streams: HashMap::new(),
            published: HashMap::new(),
            validation_stats: HashMap::new(),
            seq_ids: SequenceIdAllocator::default(),
            arrival_clock: AtomicU64::new(0),
            next_request_id: AtomicU64::new(0),
        })
    }

    /// Seed the sampler for reproducible multinomial draws.
    pub fn seed_sampler(&mut self, seed: u64) {
        self.sampler = Sampler::with_seed(seed);
    }

    /// The tokenizer collaborator.
    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    /// Hidden size of the underlying executor.
    pub fn hidden_size(&self) -> usize {
        self.executor.hidden_size()
    }

    /// Scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        self.scheduler.config()
    }

    /// The scheduler, for state inspection.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Apply (or clear) LoRA adapters on the executor.
    ///
    /// # Errors
    ///
    /// Propagates executor failures.
    pub fn set_adapters(&mut self, adapters: Option<&AdapterSpec>) -> Result<()> {
        self.executor.set_adapters(adapters)
    }

    /// Submit a text prompt. May be called from any thread.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid sampling params or an empty prompt.
    pub fn add_request(
        &self,
        request_id: RequestId,
        prompt: &str,
        params: SamplingParams,
    ) -> Result<GenerationHandle> {
        let encoding = self.tokenizer.encode(prompt)?;
        self.add_tokenized_request(request_id, encoding.ids, params)
    }

    /// Submit an already-tokenized prompt. May be called from any thread.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid sampling params or an empty prompt.
    pub fn add_tokenized_request(
        &self,
        request_id: RequestId,
        prompt_ids: Vec<u32>,
        params: SamplingParams,
    ) -> Result<GenerationHandle> {
        params.validate()?;
        if prompt_ids.is_empty() {
            return Err(Error::Tokenization("empty prompt".to_string()));
        }

        let group = SequenceGroup::new(
            request_id,
            prompt_ids,
            params,
            self.scheduler.config().block_size,
            self.seq_ids.next(),
            self.arrival_clock.fetch_add(1, Ordering::Relaxed),
        );
        let stream = GenerationStream::create();
        let handle = GenerationHandle::new(request_id, Arc::clone(&stream));

        let mut awaiting = self.awaiting.lock().unwrap_or_else(|e| e.into_inner());
        awaiting.push((group, stream));
        Ok(handle)
    }

    /// Move submitted requests into the scheduler, in submission order.
    pub fn pull_awaiting_requests(&mut self) {
        let mut awaiting = self.awaiting.lock().unwrap_or_else(|e| e.into_inner());
        let mut drained: Vec<_> = awaiting.drain(..).collect();
        drop(awaiting);

        drained.sort_by_key(|(group, _)| group.arrival());
        for (group, stream) in drained {
            debug!(request_id = group.request_id(), "pulled awaiting request");
            self.streams.insert(group.request_id(), stream);
            self.scheduler.add_group(group);
        }
    }

    /// Whether any request is waiting, running or not yet pulled.
    pub fn has_non_finished_requests(&self) -> bool {
        if self.scheduler.has_unfinished_groups() {
            return true;
        }
        let awaiting = self.awaiting.lock().unwrap_or_else(|e| e.into_inner());
        !awaiting.is_empty()
    }

    /// Run one inference step.
    ///
    /// # Errors
    ///
    /// Surfaces executor failures after finishing the affected
    /// sequences as `Aborted`; the pipeline stays usable for surviving
    /// requests.
    pub fn step(&mut self) -> Result<()> {
        self.pull_awaiting_requests();
        self.abort_dropped_requests();

        let plan = self.scheduler.schedule();
        for &request_id in &plan.ignored_requests {
            warn!(request_id, "request ignored: prompt exceeds block budget");
            self.retire_request(request_id, Some(FinishReason::Ignored));
        }
        if plan.is_empty() {
            return Ok(());
        }

        let inputs = self.assembler.assemble(&self.scheduler, &plan)?;
        let logits = match self.executor.forward(&inputs) {
            Ok(logits) => logits,
            Err(err) => {
                self.abort_scheduled(&plan);
                return Err(Error::Executor(err.to_string()));
            }
        };
        let rows: Vec<LogitsRow> = logits.to_dtype(candle_core::DType::F32)?.to_vec2()?;

        self.apply_step_results(&plan, &inputs, &rows)?;
        self.publish_outputs(&plan);
        self.retire_finished();
        Ok(())
    }

    /// Run up to `k` steps, stopping early when nothing is left to do.
    ///
    /// # Errors
    ///
    /// Propagates the first step error.
    pub fn multistep(&mut self, k: usize) -> Result<()> {
        for _ in 0..k {
            if !self.has_non_finished_requests() {
                break;
            }
            self.step()?;
        }
        Ok(())
    }

    /// Generated token ids of every live request (first trajectory).
    pub fn generated_requests(&self) -> HashMap<RequestId, Vec<u32>> {
        self.scheduler
            .groups()
            .map(|group| {
                let generated = group
                    .sequences()
                    .first()
                    .map(|seq| seq.generated_ids().to_vec())
                    .unwrap_or_default();
                (group.request_id(), generated)
            })
            .collect()
    }

    /// Reconcile a request's first trajectory with `target` tokens.
    ///
    /// The longest common prefix survives; the mismatching tail is
    /// dropped (KV rolled back, trailing blocks freed) and the
    /// remainder of `target` is appended unprocessed, so the next step
    /// pushes it through the executor — as candidates to validate on
    /// the main side (`is_validation == false` inserted them), or as
    /// verified tokens to resume drafting from.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestNotFound`] for an unknown request.
    pub fn update_request(
        &mut self,
        request_id: RequestId,
        target: &[u32],
        is_validation: bool,
    ) -> Result<UpdateRequestResult> {
        let group = self
            .scheduler
            .get_group_mut(request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        let prompt_len = group.prompt_len();
        let processed = group.num_processed_tokens();

        let seq_id = group
            .sequences()
            .first()
            .ok_or(Error::RequestNotFound(request_id))?
            .seq_id();

        let generated: Vec<u32> = group
            .sequence(seq_id)
            .map(|seq| seq.generated_ids().to_vec())
            .unwrap_or_default();
        let common = generated
            .iter()
            .zip(target)
            .take_while(|(a, b)| a == b)
            .count();
        let removed = generated.len() - common;
        let inserted = target.len() - common;

        if removed == 0 && inserted == 0 {
            return Ok(UpdateRequestResult::default());
        }

        let new_context = prompt_len + target.len();
        // Keep at least one token unprocessed so the request stays
        // schedulable; everything past the surviving prefix must be
        // recomputed anyway.
        let new_processed = processed
            .min(prompt_len + common)
            .min(new_context.saturating_sub(1));

        {
            let seq = group
                .sequence_mut(seq_id)
                .ok_or(Error::SequenceNotFound(seq_id))?;
            seq.truncate_generated(common);
            for &token in &target[common..] {
                seq.append_token(token, 0.0);
            }
        }
        group.rollback_processed(new_processed);

        // Trim after the group borrow ends; the pool is disjoint state.
        let mut table = {
            let seq = self
                .scheduler
                .get_group_mut(request_id)
                .and_then(|g| g.sequence_mut(seq_id))
                .ok_or(Error::SequenceNotFound(seq_id))?;
            std::mem::take(seq.block_table_mut())
        };
        table.trim(self.scheduler.pool_mut(), new_processed);
        if let Some(seq) = self
            .scheduler
            .get_group_mut(request_id)
            .and_then(|g| g.sequence_mut(seq_id))
        {
            *seq.block_table_mut() = table;
        }

        // Published counters cannot exceed the surviving tokens.
        if let Some(count) = self.published.get_mut(&seq_id) {
            *count = (*count).min(common);
        }

        debug!(
            request_id,
            inserted, removed, is_validation, "reconciled request"
        );
        Ok(UpdateRequestResult { inserted, removed })
    }

    /// Finish a request from the outside (speculative coupling).
    pub fn finish_request(&mut self, request_id: RequestId, reason: FinishReason) {
        self.retire_request(request_id, Some(reason));
    }

    /// Candidate verdicts `(accepted, rejected)` of the last validation
    /// step, keyed by request. Draining; validation mode only.
    pub fn take_validation_stats(&mut self) -> HashMap<RequestId, (usize, usize)> {
        std::mem::take(&mut self.validation_stats)
    }

    /// Process a batch of prompts to completion.
    ///
    /// Requests are admitted together, stepped until every one
    /// finishes (or the streamer stops generation) and returned with
    /// each request's results ranked by score descending, truncated to
    /// its `num_return_sequences`. Frames consumed by the streamer are
    /// not replayed in the returned results.
    ///
    /// # Errors
    ///
    /// Fails when called while requests are in flight, when adapter
    /// specs differ between requests, or when streaming is requested
    /// for anything but a single greedy/multinomial request.
    pub fn generate(
        &mut self,
        prompts: &[Vec<u32>],
        params: &[SamplingParams],
        mut streamer: Option<&mut dyn Streamer>,
    ) -> Result<Vec<RequestOutput>> {
        if self.has_non_finished_requests() {
            return Err(Error::InvalidConfig(
                "generate cannot run while requests are in flight; use add_request".to_string(),
            ));
        }
        if prompts.len() != params.len() {
            return Err(Error::InvalidConfig(
                "prompts and sampling params must be the same length".to_string(),
            ));
        }
        if params
            .windows(2)
            .any(|pair| pair[0].adapters != pair[1].adapters)
        {
            return Err(Error::InvalidConfig(
                "adapters must be the same for all requests".to_string(),
            ));
        }
        if streamer.is_some()
            && !(prompts.len() == 1 && (params[0].is_greedy() || params[0].is_multinomial()))
        {
            return Err(Error::InvalidConfig(
                "streaming needs a single greedy or multinomial request".to_string(),
            ));
        }

        self.executor.reset_state();
        if let Some(first) = params.first() {
            self.executor.set_adapters(first.adapters.as_ref())?;
        }

        let mut handles = Vec::with_capacity(prompts.len());
        for (prompt_ids, request_params) in prompts.iter().zip(params) {
            let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            handles.push(self.add_tokenized_request(
                request_id,
                prompt_ids.clone(),
                request_params.clone(),
            )?);
        }

        let mut continue_generation = true;
        while self.has_non_finished_requests() && continue_generation {
            self.step()?;
            if let Some(streamer) = streamer.as_deref_mut() {
                while continue_generation && handles[0].can_read() {
                    let Some(frame) = handles[0].read() else {
                        break;
                    };
                    for output in frame.values() {
                        if !streamer.put(output.token_id) {
                            continue_generation = false;
                            break;
                        }
                    }
                }
            }
        }
        if let Some(streamer) = streamer.as_deref_mut() {
            streamer.end();
        }
        if !continue_generation {
            let live: Vec<RequestId> = handles.iter().map(|h| h.request_id()).collect();
            for request_id in live {
                self.retire_request(request_id, Some(FinishReason::Stopped));
            }
        }

        let mut outputs = Vec::with_capacity(handles.len());
        for (handle, request_params) in handles.iter().zip(params) {
            outputs.push(collect_request_output(handle, request_params));
        }
        Ok(outputs)
    }

    // ========== Step internals ==========

    /// Finish and remove requests whose handles were dropped.
    fn abort_dropped_requests(&mut self) {
        let dropped: Vec<RequestId> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.is_dropped())
            .map(|(&id, _)| id)
            .collect();
        for request_id in dropped {
            debug!(request_id, "request abandoned by consumer");
            self.retire_request(request_id, Some(FinishReason::Stopped));
        }
    }

    /// Finish every scheduled group after an executor failure.
    fn abort_scheduled(&mut self, plan: &SchedulerOutputs) {
        for sg in &plan.scheduled {
            self.retire_request(sg.request_id, Some(FinishReason::Aborted));
        }
    }

    /// Finish a request with `reason`, free its state and close its
    /// stream.
    fn retire_request(&mut self, request_id: RequestId, reason: Option<FinishReason>) {
        if let Some(group) = self.scheduler.get_group(request_id) {
            for seq in group.sequences() {
                self.published.remove(&seq.seq_id());
            }
        }
        if let Some(reason) = reason {
            self.scheduler.abort_group(request_id, reason);
        } else {
            self.scheduler.remove_group(request_id);
        }
        self.validation_stats.remove(&request_id);
        self.sampler.drop_request(request_id);
        if let Some(stream) = self.streams.remove(&request_id) {
            match reason {
                Some(reason @ (FinishReason::Ignored | FinishReason::Aborted | FinishReason::Stopped)) => {
                    stream.finish_with(reason)
                }
                _ => stream.finish(),
            }
        }
    }

    /// Sample or validate every scheduled group and apply the results.
    fn apply_step_results(
        &mut self,
        plan: &SchedulerOutputs,
        inputs: &ModelInputs,
        rows: &[LogitsRow],
    ) -> Result<()> {
        // Group rows by request, then by sequence.
        let mut rows_by_request: HashMap<RequestId, HashMap<SequenceId, Vec<LogitsRow>>> =
            HashMap::new();
        for span in &inputs.seq_spans {
            let seq_rows: Vec<LogitsRow> = rows[span.start_row..span.start_row + span.num_rows]
                .iter()
                .cloned()
                .collect();
            rows_by_request
                .entry(span.request_id)
                .or_default()
                .insert(span.seq_id, seq_rows);
        }

        for sg in &plan.scheduled {
            self.scheduler
                .mark_group_processed(sg.request_id, sg.num_tokens);

            let Some(seq_rows) = rows_by_request.remove(&sg.request_id) else {
                continue;
            };
            self.apply_group_results(sg.request_id, seq_rows)?;
        }
        Ok(())
    }

    /// Consume one group's logits rows.
    fn apply_group_results(
        &mut self,
        request_id: RequestId,
        seq_rows: HashMap<SequenceId, Vec<LogitsRow>>,
    ) -> Result<()> {
        let Some(group) = self.scheduler.get_group(request_id) else {
            return Ok(());
        };
        let prompt_len = group.prompt_len();
        let processed = group.num_processed_tokens();
        let scheduled_start = processed
            - seq_rows
                .values()
                .next()
                .map(|rows| rows.len())
                .unwrap_or(0);

        // Rows before the last prompt position carry no samples.
        if processed < prompt_len {
            return Ok(());
        }

        // Validation path: a single-trajectory group with candidate
        // tokens beyond the first unprocessed position.
        let single_seq = group.sequences().len() == 1;
        let has_candidates = group.context_len() > scheduled_start + 1;
        if self.validation_mode && single_seq && has_candidates {
            return self.validate_group(request_id, seq_rows, scheduled_start);
        }

        // Normal path: the last row of each sequence yields one token.
        let mut last_rows: HashMap<SequenceId, LogitsRow> = HashMap::new();
        for (seq_id, rows) in seq_rows {
            if let Some(last) = rows.into_iter().next_back() {
                last_rows.insert(seq_id, last);
            }
        }

        let group = self
            .scheduler
            .get_group(request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        let output =
            self.sampler
                .sample_group(group, &last_rows, &self.seq_ids, self.eos_token_id)?;
        self.apply_updates(request_id, output.updates)?;
        self.enforce_limits(request_id)?;
        Ok(())
    }

    /// Greedy-validate candidate tokens of a speculative main request.
    fn validate_group(
        &mut self,
        request_id: RequestId,
        mut seq_rows: HashMap<SequenceId, Vec<LogitsRow>>,
        scheduled_start: usize,
    ) -> Result<()> {
        let group = self
            .scheduler
            .get_group_mut(request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        let prompt_len = group.prompt_len();
        let seq_id = group
            .sequences()
            .first()
            .ok_or(Error::RequestNotFound(request_id))?
            .seq_id();
        let Some(rows) = seq_rows.remove(&seq_id) else {
            return Ok(());
        };

        // First row that predicts a generated position.
        let offset = (prompt_len - 1).saturating_sub(scheduled_start);
        let rel_rows = &rows[offset..];
        let pred_base = (scheduled_start + 1).saturating_sub(prompt_len);

        let generated = group
            .sequence(seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))?
            .generated_ids()
            .to_vec();
        // Candidates beyond the scheduled rows were not verified this
        // step; they are dropped below and re-proposed later.
        let candidates: Vec<u32> = generated[pred_base..]
            .iter()
            .take(rel_rows.len().saturating_sub(1))
            .copied()
            .collect();

        let (accepted, next_token, next_log_prob) =
            self.sampler.validate_greedy(rel_rows, &candidates);
        self.validation_stats
            .insert(request_id, (accepted, candidates.len() - accepted));

        // Rewrite the tail: accepted candidates get their verified
        // log-probs, the rejected tail is dropped, the freshly sampled
        // token follows.
        {
            let seq = group
                .sequence_mut(seq_id)
                .ok_or(Error::SequenceNotFound(seq_id))?;
            seq.truncate_generated(pred_base);
            for (idx, &token) in candidates[..accepted].iter().enumerate() {
                let log_prob = log_softmax(&rel_rows[idx])[token as usize];
                seq.append_token(token, log_prob);
            }
            seq.append_token(next_token, next_log_prob);
        }

        // Roll the KV back to just before the new unprocessed token.
        let new_generated_len = pred_base + accepted + 1;
        let new_processed = prompt_len + new_generated_len - 1;
        group.rollback_processed(new_processed);
        if let Some(count) = self.published.get_mut(&seq_id) {
            *count = (*count).min(pred_base + accepted);
        }

        let mut table = {
            let seq = self
                .scheduler
                .get_group_mut(request_id)
                .and_then(|g| g.sequence_mut(seq_id))
                .ok_or(Error::SequenceNotFound(seq_id))?;
            std::mem::take(seq.block_table_mut())
        };
        table.trim(self.scheduler.pool_mut(), new_processed);
        if let Some(seq) = self
            .scheduler
            .get_group_mut(request_id)
            .and_then(|g| g.sequence_mut(seq_id))
        {
            *seq.block_table_mut() = table;
        }

        self.enforce_limits(request_id)?;
        Ok(())
    }

    /// Apply sampler updates to a group.
    fn apply_updates(&mut self, request_id: RequestId, updates: Vec<SequenceUpdate>) -> Result<()> {
        for update in updates {
            // The group borrow and the pool borrow are disjoint fields
            // of the scheduler; route through dedicated helpers.
            match update {
                SequenceUpdate::Append {
                    seq_id,
                    token_id,
                    log_prob,
                } => {
                    if let Some(seq) = self
                        .scheduler
                        .get_group_mut(request_id)
                        .and_then(|g| g.sequence_mut(seq_id))
                    {
                        seq.append_token(token_id, log_prob);
                    }
                }
                SequenceUpdate::Fork {
                    parent_seq_id,
                    child_seq_id,
                    token_id,
                    log_prob,
                } => {
                    self.fork_in_group(request_id, parent_seq_id, child_seq_id)?;
                    // The parent's streamed prefix counts as published
                    // for the child too; only the divergence streams.
                    let inherited = self.published.get(&parent_seq_id).copied().unwrap_or(0);
                    self.published.insert(child_seq_id, inherited);
                    if let Some(seq) = self
                        .scheduler
                        .get_group_mut(request_id)
                        .and_then(|g| g.sequence_mut(child_seq_id))
                    {
                        seq.append_token(token_id, log_prob);
                    }
                }
                SequenceUpdate::Drop { seq_id } => {
                    self.drop_in_group(request_id, seq_id)?;
                    self.published.remove(&seq_id);
                }
                SequenceUpdate::Finish { seq_id, reason } => {
                    self.finish_in_group(request_id, seq_id, reason)?;
                }
            }
        }
        Ok(())
    }

    /// Finish sequences that hit EOS, a stop token or a length limit.
    fn enforce_limits(&mut self, request_id: RequestId) -> Result<()> {
        let Some(group) = self.scheduler.get_group(request_id) else {
            return Ok(());
        };
        let params = group.sampling_params().clone();

        // A length cap may be overshot when several speculative
        // candidates were ratified at once; the surplus is dropped.
        let length_cap = params
            .max_new_tokens
            .min(params.max_length.saturating_sub(group.prompt_len()));

        let mut to_finish: Vec<(SequenceId, FinishReason, usize)> = Vec::new();
        for seq in group.running_sequences() {
            if seq.generated_ids().is_empty() {
                continue;
            }
            // Several tokens can land in one step (ratified speculative
            // candidates), so stop conditions scan the whole tail.
            let eos_at = (!params.ignore_eos)
                .then(|| {
                    seq.generated_ids()
                        .iter()
                        .position(|&token| Some(token) == self.eos_token_id)
                })
                .flatten();
            let stop_at = seq
                .generated_ids()
                .iter()
                .position(|token| params.stop_token_ids.contains(token));

            if let Some(pos) = eos_at.filter(|&pos| pos < length_cap) {
                to_finish.push((seq.seq_id(), FinishReason::EndOfSequence, pos + 1));
            } else if let Some(pos) = stop_at.filter(|&pos| pos < length_cap) {
                to_finish.push((seq.seq_id(), FinishReason::Stopped, pos + 1));
            } else if seq.generated_len() >= length_cap {
                to_finish.push((seq.seq_id(), FinishReason::Length, length_cap));
            }
        }
        for (seq_id, reason, keep) in to_finish {
            if let Some(seq) = self
                .scheduler
                .get_group_mut(request_id)
                .and_then(|g| g.sequence_mut(seq_id))
            {
                seq.truncate_generated(keep);
            }
            self.finish_in_group(request_id, seq_id, reason)?;
        }
        Ok(())
    }

    /// Publish one frame per newly generated token of each scheduled
    /// group, then close the streams of finished groups.
    fn publish_outputs(&mut self, plan: &SchedulerOutputs) {
        for sg in &plan.scheduled {
            let Some(group) = self.scheduler.get_group(sg.request_id) else {
                continue;
            };
            let Some(stream) = self.streams.get(&sg.request_id) else {
                continue;
            };
            let params = group.sampling_params();

            // Widest backlog across the group's sequences.
            let mut max_new = 0usize;
            for seq in group.sequences() {
                let published = self.published.get(&seq.seq_id()).copied().unwrap_or(0);
                max_new = max_new.max(seq.generated_len().saturating_sub(published));
            }

            for _ in 0..max_new {
                let mut frame = GenerationOutputs::new();
                for seq in group.sequences() {
                    let published = self.published.get(&seq.seq_id()).copied().unwrap_or(0);
                    if published >= seq.generated_len() {
                        continue;
                    }
                    let token_id = seq.generated_ids()[published];
                    let is_last = published + 1 == seq.generated_len();
                    let cumulative: f32 = seq.log_probs()[..published + 1].iter().sum();
                    let finish_reason = if is_last { seq.finish_reason() } else { None };

                    // Beam hypotheses rank by length-penalized score.
                    let score = if params.is_beam_search() && finish_reason.is_some() {
                        cumulative
                            / (seq.generated_len() as f32).powf(params.length_penalty)
                    } else {
                        cumulative
                    };

                    frame.insert(
                        seq.seq_id(),
                        GenerationOutput {
                            parent_id: seq.parent_id(),
                            token_id,
                            cumulative_log_prob: score,
                            finish_reason,
                        },
                    );
                    self.published.insert(seq.seq_id(), published + 1);
                }
                if !frame.is_empty() {
                    stream.push(frame);
                }
            }
        }
    }

    /// Retire groups whose every trajectory has finished.
    fn retire_finished(&mut self) {
        let finished = self.scheduler.retire_finished();
        for group in finished {
            let request_id = group.request_id();
            debug!(request_id, "request finished");
            for seq in group.sequences() {
                self.published.remove(&seq.seq_id());
            }
            self.sampler.drop_request(request_id);
            if let Some(stream) = self.streams.remove(&request_id) {
                stream.finish();
            }
        }
    }

    // ========== Scheduler plumbing ==========

    fn fork_in_group(
        &mut self,
        request_id: RequestId,
        parent_seq_id: SequenceId,
        child_seq_id: SequenceId,
    ) -> Result<()> {
        let scheduler = &mut self.scheduler;
        // Split borrow: groups and pool are independent scheduler fields.
        let (group, pool) = scheduler.group_and_pool_mut(request_id)?;
        group.fork_sequence(parent_seq_id, child_seq_id, pool)
    }

    fn drop_in_group(&mut self, request_id: RequestId, seq_id: SequenceId) -> Result<()> {
        let (group, pool) = self.scheduler.group_and_pool_mut(request_id)?;
        group.drop_sequence(seq_id, pool)?;
        Ok(())
    }

    fn finish_in_group(
        &mut self,
        request_id: RequestId,
        seq_id: SequenceId,
        reason: FinishReason,
    ) -> Result<()> {
        let (group, pool) = self.scheduler.group_and_pool_mut(request_id)?;
        group.finish_sequence(seq_id, reason, pool)
    }
}

/// Drain a handle into ranked, truncated results.
///
/// Trajectories pruned mid-flight (beam search) carry no finish reason
/// and are dropped whenever any completed trajectory exists.
pub(crate) fn collect_request_output(
    handle: &GenerationHandle,
    params: &SamplingParams,
) -> RequestOutput {
    let mut results = handle.read_all();
    if results.iter().any(|r| r.finish_reason.is_some()) {
        results.retain(|r| r.finish_reason.is_some());
    }
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    results.truncate(params.num_return_sequences);
    RequestOutput {
        request_id: handle.request_id(),
        results,
        status: handle.finish_status(),
    }
}
