//! Speculative decoding controller.
//!
//! Couples a main pipeline (validation mode on) with a draft pipeline
//! (validation mode off) that runs several steps ahead:
//!
//! 1. The draft multisteps, producing up to K candidate tokens per
//!    request.
//! 2. Candidates are inserted into the main pipeline's sequences and
//!    KV, marked for validation.
//! 3. The main pipeline steps once, greedily ratifying a prefix of the
//!    candidates.
//! 4. The draft rolls its KV back to the verified tokens and resumes
//!    drafting from there.
//!
//! After every step, the main pipeline's tokens are a prefix of what
//! the user observes, and the draft's KV corresponds to that prefix
//! modulo at most K unaccepted trailing tokens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::{SamplingParams, SchedulerConfig};
use crate::core::sequence::{FinishReason, RequestId};
use crate::engine::pipeline::{Pipeline, RequestOutput, UpdateRequestResult};
use crate::engine::stream::{GenerationHandle, Streamer};
use crate::error::{Error, Result};
use crate::executor::{tokenizers_compatible, Executor, Tokenizer};
use crate::speculative::config::SpeculativeConfig;
use crate::speculative::metrics::SpeculativeMetrics;

/// Everything needed to stand up one side of the speculative pair.
pub struct ModelDesc {
    /// The model executor.
    pub executor: Box<dyn Executor>,
    /// Its tokenizer.
    pub tokenizer: Arc<dyn Tokenizer>,
    /// Scheduler configuration. `None` on the draft side derives one
    /// from the main configuration by splitting the KV cache.
    pub scheduler_config: Option<SchedulerConfig>,
}

/// Split `num_blocks` between main and draft in proportion to their
/// hidden sizes, guaranteeing the draft at least one block whenever two
/// or more exist.
fn split_cache(num_blocks: usize, main_hidden: usize, draft_hidden: usize) -> (usize, usize) {
    let k = draft_hidden as f32 / (main_hidden + draft_hidden) as f32;
    let mut main_blocks = (num_blocks as f32 * (1.0 - k)).ceil() as usize;
    let mut draft_blocks = num_blocks - main_blocks;
    if draft_blocks == 0 && main_blocks > 1 {
        main_blocks -= 1;
        draft_blocks = 1;
    }
    (main_blocks, draft_blocks)
}

/// Drives a draft pipeline ahead of a main pipeline and reconciles
/// their KV states every step.
pub struct SpeculativeController {
    main: Pipeline,
    draft: Pipeline,
    config: SpeculativeConfig,
    /// Guards the coupled state of the two pipelines: candidate
    /// handles, plus submission while a step reconciles them.
    draft_generations: Mutex<HashMap<RequestId, GenerationHandle>>,
    metrics: SpeculativeMetrics,
    next_request_id: AtomicU64,
}

impl SpeculativeController {
    /// Build the controller from the two model descriptions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenizerMismatch`] when the tokenizers are not
    /// interchangeable and [`Error::InvalidConfig`] for bad scheduler
    /// configurations.
    pub fn new(
        main_desc: ModelDesc,
        draft_desc: ModelDesc,
        config: SpeculativeConfig,
    ) -> Result<Self> {
        if !tokenizers_compatible(main_desc.tokenizer.as_ref(), draft_desc.tokenizer.as_ref())? {
            return Err(Error::TokenizerMismatch);
        }

        let main_config = main_desc.scheduler_config.clone().unwrap_or_default();
        let (main_config, draft_config) = match draft_desc.scheduler_config {
            Some(draft_config) => (main_config, draft_config),
            None => {
                let (main_blocks, draft_blocks) = split_cache(
                    main_config.num_blocks,
                    main_desc.executor.hidden_size(),
                    draft_desc.executor.hidden_size(),
                );
                let mut updated_main = main_config.clone();
                updated_main.num_blocks = main_blocks;
                let mut derived_draft = main_config;
                derived_draft.num_blocks = draft_blocks;
                (updated_main, derived_draft)
            }
        };

        let main = Pipeline::with_validation_mode(
            main_desc.executor,
            main_desc.tokenizer,
            main_config,
            true,
        )?;
        let draft = Pipeline::with_validation_mode(
            draft_desc.executor,
            draft_desc.tokenizer,
            draft_config,
            false,
        )?;

        Ok(Self {
            main,
            draft,
            config,
            draft_generations: Mutex::new(HashMap::new()),
            metrics: SpeculativeMetrics::default(),
            next_request_id: AtomicU64::new(0),
        })
    }

    /// Acceptance metrics accumulated so far.
    pub fn metrics(&self) -> &SpeculativeMetrics {
        &self.metrics
    }

    /// The main pipeline (owner of user-visible outputs).
    pub fn main_pipeline(&self) -> &Pipeline {
        &self.main
    }

    /// Whether any request is still in flight.
    pub fn has_non_finished_requests(&self) -> bool {
        self.main.has_non_finished_requests()
    }

    /// Submit a text prompt to both pipelines under the same id.
    ///
    /// # Errors
    ///
    /// Propagates tokenization and parameter validation errors.
    pub fn add_request(
        &self,
        request_id: RequestId,
        prompt: &str,
        params: SamplingParams,
    ) -> Result<GenerationHandle> {
        let encoding = self.main.tokenizer().encode(prompt)?;
        self.add_tokenized_request(request_id, encoding.ids, params)
    }

    /// Submit a tokenized prompt to both pipelines under the same id.
    ///
    /// The draft copy never stops on EOS so it cannot end before the
    /// main request does.
    ///
    /// # Errors
    ///
    /// Propagates parameter validation errors.
    pub fn add_tokenized_request(
        &self,
        request_id: RequestId,
        prompt_ids: Vec<u32>,
        params: SamplingParams,
    ) -> Result<GenerationHandle> {
        let mut draft_params = params.clone();
        draft_params.ignore_eos = true;

        let mut draft_generations = self
            .draft_generations
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let draft_handle =
            self.draft
                .add_tokenized_request(request_id, prompt_ids.clone(), draft_params)?;
        draft_generations.insert(request_id, draft_handle);
        self.main.add_tokenized_request(request_id, prompt_ids, params)
    }

    /// Run one coupled step of draft and main pipelines.
    ///
    /// # Errors
    ///
    /// Propagates pipeline step errors.
    pub fn step(&mut self) -> Result<()> {
        // Blocks request submission for the duration of the step: an
        // insert between the two pulls would break coherence.
        let mut draft_generations = self
            .draft_generations
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        self.draft.pull_awaiting_requests();
        self.main.pull_awaiting_requests();

        // Draft proposes up to K candidates per request.
        self.draft.multistep(self.config.num_candidates)?;

        let draft_generated = self.draft.generated_requests();
        let mut update_info: HashMap<RequestId, UpdateRequestResult> = HashMap::new();
        for (&request_id, candidate_tokens) in &draft_generated {
            let result = self
                .main
                .update_request(request_id, candidate_tokens, false)?;
            update_info.insert(request_id, result);
        }

        // Main validates the candidates in one fused pass.
        self.main.step()?;
        let validation_stats = self.main.take_validation_stats();

        // Roll the draft back onto the verified tokens.
        let main_generated = self.main.generated_requests();
        for (&request_id, verified_tokens) in &main_generated {
            match self.draft.update_request(request_id, verified_tokens, true) {
                Ok(_) => {}
                // The draft copy may have retired ahead of the main one.
                Err(Error::RequestNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        for (&request_id, _) in &draft_generated {
            // Finish draft requests whose main counterpart completed.
            if !main_generated.contains_key(&request_id) {
                self.draft.finish_request(request_id, FinishReason::Stopped);
                draft_generations.remove(&request_id);
            }

            let Some(info) = update_info.get(&request_id) else {
                continue;
            };
            // Prompt-phase steps insert nothing and carry no signal.
            if info.inserted == 0 {
                continue;
            }
            // The validation verdict holds even when the request
            // finished this step and skipped the draft rollback.
            let removed = validation_stats
                .get(&request_id)
                .map(|&(_, rejected)| rejected)
                .unwrap_or(info.removed);
            let acceptance = 1.0 - removed as f32 / info.inserted as f32;
            self.metrics.update_acceptance_rate(request_id, acceptance);
            self.metrics
                .update_accepted_tokens(request_id, info.inserted - removed);
            debug!(request_id, acceptance, "speculative step reconciled");
        }

        Ok(())
    }

    /// Process a batch of tokenized prompts to completion.
    ///
    /// Mirrors [`Pipeline::generate`]: same adapter and streaming
    /// constraints, results ranked by score descending and truncated to
    /// `num_return_sequences`.
    ///
    /// # Errors
    ///
    /// Fails under the same conditions as the pipeline's generate.
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
        if streamer.is_some()
            && !(prompts.len() == 1 && (params[0].is_greedy() || params[0].is_multinomial()))
        {
            return Err(Error::InvalidConfig(
                "streaming needs a single greedy or multinomial request".to_string(),
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
        if let Some(first) = params.first() {
            self.main.set_adapters(first.adapters.as_ref())?;
            self.draft.set_adapters(first.adapters.as_ref())?;
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
            for handle in &handles {
                self.main
                    .finish_request(handle.request_id(), FinishReason::Stopped);
                self.draft
                    .finish_request(handle.request_id(), FinishReason::Stopped);
            }
        }

        let mut outputs = Vec::with_capacity(handles.len());
        for (handle, request_params) in handles.iter().zip(params) {
            outputs.push(crate::engine::pipeline::collect_request_output(
                handle,
                request_params,
            ));
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_cache_proportional() {
        // Equal hidden sizes split the pool in half.
        assert_eq!(split_cache(8, 1024, 1024), (4, 4));
        // A small draft model receives a small share.
        let (main, draft) = split_cache(100, 4096, 1024);
        assert_eq!(main + draft, 100);
        assert!(draft >= 1 && draft < main);
    }

    #[test]
    fn test_split_cache_draft_minimum() {
        // A tiny pool still guarantees the draft one block.
        let (main, draft) = split_cache(2, 1_000_000, 1);
        assert_eq!((main, draft), (1, 1));
    }
}
