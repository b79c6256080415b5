//! Configuration types for paged-infer.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default block size (tokens per block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of tokens batched into a single forward pass.
    pub max_num_batched_tokens: usize,
    /// Total number of KV cache blocks.
    ///
    /// Resolving a cache size in GB down to a block count is the
    /// executor's setup concern; the core consumes block counts.
    pub num_blocks: usize,
    /// Number of tokens per block.
    pub block_size: usize,
    /// Maximum number of sequences scheduled per iteration.
    pub max_num_seqs: usize,
    /// Split long prompts into chunks that share steps with decode.
    pub dynamic_split_fuse: bool,
    /// Keep released blocks reclaimable instead of freeing them eagerly.
    pub use_cache_eviction: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_batched_tokens: 256,
            num_blocks: 1024,
            block_size: DEFAULT_BLOCK_SIZE,
            max_num_seqs: 256,
            dynamic_split_fuse: false,
            use_cache_eviction: false,
        }
    }
}

impl SchedulerConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for zero blocks, zero batched
    /// tokens, a zero block size or a zero sequence cap.
    pub fn validate(&self) -> Result<()> {
        if self.num_blocks == 0 {
            return Err(Error::InvalidConfig("num_blocks must be > 0".to_string()));
        }
        if self.block_size == 0 {
            return Err(Error::InvalidConfig("block_size must be > 0".to_string()));
        }
        if self.max_num_batched_tokens == 0 {
            return Err(Error::InvalidConfig(
                "max_num_batched_tokens must be > 0".to_string(),
            ));
        }
        if self.max_num_seqs == 0 {
            return Err(Error::InvalidConfig("max_num_seqs must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Controls when beam search stops extending running beams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopCriteria {
    /// Stop as soon as `group_size` finished beams exist in a group.
    Early,
    /// Stop when no running beam can beat the worst finished one.
    Heuristic,
    /// Run every beam to its token limit.
    Never,
}

/// Opaque LoRA adapter handle passed through to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    /// Adapter identifier the executor resolves to weights.
    pub name: String,
    /// Blending coefficient applied by the executor.
    pub alpha: f32,
}

/// Per-request sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Maximum number of generated tokens. Takes priority over `max_length`.
    pub max_new_tokens: usize,
    /// Maximum total length (prompt + generated).
    pub max_length: usize,
    /// Keep generating past the EOS token.
    pub ignore_eos: bool,

    // Beam search
    /// Number of diverse beam groups.
    pub num_groups: usize,
    /// Beams per group (beam width).
    pub group_size: usize,
    /// Hamming diversity penalty between groups. 0.0 disables diversity.
    pub diversity_penalty: f32,
    /// Length penalty exponent applied when ranking finished beams.
    pub length_penalty: f32,
    /// Beam stopping condition.
    pub stop_criteria: StopCriteria,

    // Multinomial
    /// Sampling temperature. 0.0 selects greedy decoding.
    pub temperature: f32,
    /// Keep only the `top_k` most likely tokens. 0 disables the filter.
    pub top_k: usize,
    /// Nucleus sampling mass. 1.0 disables the filter.
    pub top_p: f32,
    /// Penalty divisor applied to logits of already-generated tokens.
    pub repetition_penalty: f32,
    /// Forbid repeating any n-gram of this size. 0 disables the mask.
    pub no_repeat_ngram_size: usize,

    /// Number of sequences returned (and, outside beam search, run).
    pub num_return_sequences: usize,
    /// Extra token ids that stop a sequence with `FinishReason::Stopped`.
    pub stop_token_ids: Vec<u32>,
    /// LoRA adapters forwarded to the executor.
    pub adapters: Option<AdapterSpec>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 30,
            max_length: usize::MAX,
            ignore_eos: false,
            num_groups: 1,
            group_size: 1,
            diversity_penalty: 0.0,
            length_penalty: 1.0,
            stop_criteria: StopCriteria::Heuristic,
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            no_repeat_ngram_size: 0,
            num_return_sequences: 1,
            stop_token_ids: Vec::new(),
            adapters: None,
        }
    }
}

impl SamplingParams {
    /// Greedy decoding preset.
    pub fn greedy() -> Self {
        Self::default()
    }

    /// Multinomial sampling preset.
    pub fn multinomial() -> Self {
        Self {
            temperature: 0.8,
            top_k: 50,
            top_p: 0.9,
            ..Self::default()
        }
    }

    /// Diverse beam search preset.
    pub fn beam_search() -> Self {
        Self {
            num_groups: 3,
            group_size: 2,
            diversity_penalty: 1.0,
            num_return_sequences: 3,
            ..Self::default()
        }
    }

    /// Beam search is selected whenever more than one beam is configured.
    pub fn is_beam_search(&self) -> bool {
        self.num_groups * self.group_size > 1
    }

    /// Greedy decoding: zero temperature outside beam search.
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0 && !self.is_beam_search()
    }

    /// Multinomial sampling: positive temperature outside beam search.
    pub fn is_multinomial(&self) -> bool {
        self.temperature > 0.0 && !self.is_beam_search()
    }

    /// Total number of beams kept running during beam search.
    pub fn num_beams(&self) -> usize {
        self.num_groups * self.group_size
    }

    /// Number of sequences a group keeps alive concurrently.
    pub fn num_live_sequences(&self) -> usize {
        if self.is_beam_search() {
            self.num_beams()
        } else {
            self.num_return_sequences
        }
    }

    /// Validate the parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if self.max_new_tokens == 0 {
            return Err(Error::InvalidConfig(
                "max_new_tokens must be > 0".to_string(),
            ));
        }
        if self.num_groups == 0 || self.group_size == 0 {
            return Err(Error::InvalidConfig(
                "num_groups and group_size must be > 0".to_string(),
            ));
        }
        if self.num_return_sequences == 0 {
            return Err(Error::InvalidConfig(
                "num_return_sequences must be > 0".to_string(),
            ));
        }
        if self.temperature < 0.0 {
            return Err(Error::InvalidConfig(
                "temperature must be >= 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(Error::InvalidConfig("top_p must be in (0, 1]".to_string()));
        }
        if self.repetition_penalty <= 0.0 {
            return Err(Error::InvalidConfig(
                "repetition_penalty must be > 0".to_string(),
            ));
        }
        if self.is_beam_search() {
            if self.temperature != 0.0 {
                return Err(Error::InvalidConfig(
                    "beam search is incompatible with multinomial temperature".to_string(),
                ));
            }
            if self.num_return_sequences > self.num_beams() {
                return Err(Error::InvalidConfig(
                    "num_return_sequences cannot exceed the number of beams".to_string(),
                ));
            }
        }
        Ok(())
    }
}
