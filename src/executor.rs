//! External collaborator interfaces: model executor and tokenizer.
//!
//! The core never inspects the forward pass; it exchanges
//! [`ModelInputs`](crate::engine::batch::ModelInputs) for a logits
//! tensor with any paged-attention-capable executor behind the
//! [`Executor`] trait. Tokenization is likewise abstracted behind
//! [`Tokenizer`], with [`HfTokenizer`] adapting the HuggingFace
//! `tokenizers` crate.

use candle_core::{Device, Tensor};

use crate::config::AdapterSpec;
use crate::engine::batch::ModelInputs;
use crate::error::{Error, Result};

/// Probe sentence used to compare tokenizers for interchangeability.
const TOKENIZER_PROBE: &str = "Could you please tell me something about paged attention?";

/// A paged-attention-capable model executor.
pub trait Executor: Send {
    /// Run one fused forward pass.
    ///
    /// Returns logits of shape `[B, V]` in `f32`, one row per batched
    /// token.
    fn forward(&mut self, inputs: &ModelInputs) -> Result<Tensor>;

    /// Apply (or clear) LoRA adapter weights.
    fn set_adapters(&mut self, adapters: Option<&AdapterSpec>) -> Result<()>;

    /// Clear any in-model state between independent generate calls.
    fn reset_state(&mut self);

    /// Device the executor computes on.
    fn device(&self) -> &Device;

    /// Model hidden size; drives the speculative KV cache split.
    fn hidden_size(&self) -> usize;
}

/// Result of encoding a single string (batch dimension 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoding {
    /// Token ids.
    pub ids: Vec<u32>,
    /// Attention mask, parallel to `ids`.
    pub attention_mask: Vec<u32>,
}

/// Text tokenizer collaborator.
pub trait Tokenizer: Send + Sync {
    /// Encode a single string.
    fn encode(&self, text: &str) -> Result<Encoding>;

    /// Decode token ids back to text.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// End-of-sequence token id.
    fn eos_token_id(&self) -> Option<u32>;

    /// Beginning-of-sequence token id.
    fn bos_token_id(&self) -> Option<u32>;

    /// Padding token id.
    fn pad_token_id(&self) -> Option<u32>;
}

/// Two tokenizers are interchangeable iff they encode the probe to the
/// same shape and agree on all three special token ids.
pub fn tokenizers_compatible(lhs: &dyn Tokenizer, rhs: &dyn Tokenizer) -> Result<bool> {
    let encoded_lhs = lhs.encode(TOKENIZER_PROBE)?;
    let encoded_rhs = rhs.encode(TOKENIZER_PROBE)?;

    Ok(encoded_lhs.ids.len() == encoded_rhs.ids.len()
        && lhs.eos_token_id() == rhs.eos_token_id()
        && lhs.bos_token_id() == rhs.bos_token_id()
        && lhs.pad_token_id() == rhs.pad_token_id())
}

/// [`Tokenizer`] implementation over the HuggingFace `tokenizers` crate.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    eos_token_id: Option<u32>,
    bos_token_id: Option<u32>,
    pad_token_id: Option<u32>,
}

impl HfTokenizer {
    /// Wrap a loaded tokenizer, resolving special tokens by the usual
    /// candidates.
    pub fn new(inner: tokenizers::Tokenizer) -> Self {
        let eos_token_id = inner
            .token_to_id("<|endoftext|>")
            .or_else(|| inner.token_to_id("</s>"))
            .or_else(|| inner.token_to_id("<|im_end|>"));
        let bos_token_id = inner
            .token_to_id("<s>")
            .or_else(|| inner.token_to_id("<|startoftext|>"));
        let pad_token_id = inner.token_to_id("<pad>");

        Self {
            inner,
            eos_token_id,
            bos_token_id,
            pad_token_id,
        }
    }

    /// Load from a `tokenizer.json` file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(Self::new(inner))
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Encoding> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(Encoding {
            ids: encoding.get_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
        })
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| Error::Tokenization(e.to_string()))
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }
}
