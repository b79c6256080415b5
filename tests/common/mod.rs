//! Shared stubs for integration tests.
#![allow(dead_code)]

use candle_core::{Device, Tensor};

use paged_infer::engine::batch::ModelInputs;
use paged_infer::executor::{Encoding, Executor, Tokenizer};
use paged_infer::{AdapterSpec, Error};

/// Vocabulary size of the stub model.
pub const VOCAB: usize = 128;

/// Deterministic stub executor.
///
/// Every row's logits peak at `input + offset (mod VOCAB)`; an optional
/// scripted step overrides the peak with a fixed token (EOS injection),
/// and an optional step can fail the forward pass.
pub struct StubExecutor {
    device: Device,
    offset: u32,
    override_at_step: Option<(usize, u32)>,
    fail_at_step: Option<usize>,
    steps: usize,
    hidden_size: usize,
}

impl StubExecutor {
    /// Peaks at `input + offset`.
    pub fn successor(offset: u32) -> Self {
        Self {
            device: Device::Cpu,
            offset,
            override_at_step: None,
            fail_at_step: None,
            steps: 0,
            hidden_size: 64,
        }
    }

    /// On forward call number `step` (1-based), peak at `token` instead.
    pub fn with_override_at(mut self, step: usize, token: u32) -> Self {
        self.override_at_step = Some((step, token));
        self
    }

    /// Fail forward call number `step` (1-based).
    pub fn failing_at(mut self, step: usize) -> Self {
        self.fail_at_step = Some(step);
        self
    }

    /// Report a specific hidden size (drives the speculative KV split).
    pub fn with_hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = hidden_size;
        self
    }
}

impl Executor for StubExecutor {
    fn forward(&mut self, inputs: &ModelInputs) -> paged_infer::Result<Tensor> {
        self.steps += 1;
        if self.fail_at_step == Some(self.steps) {
            return Err(Error::Executor("injected failure".to_string()));
        }

        let ids: Vec<Vec<i64>> = inputs.input_ids.to_vec2()?;
        let batch = ids.len();
        let mut logits = vec![0.0f32; batch * VOCAB];
        for (row, id) in ids.iter().enumerate() {
            let peak = match self.override_at_step {
                Some((step, token)) if step == self.steps => token as usize,
                _ => (id[0] as usize + self.offset as usize) % VOCAB,
            };
            logits[row * VOCAB + peak] = 8.0;
        }
        Ok(Tensor::from_vec(logits, (batch, VOCAB), &self.device)?)
    }

    fn set_adapters(&mut self, _adapters: Option<&AdapterSpec>) -> paged_infer::Result<()> {
        Ok(())
    }

    fn reset_state(&mut self) {
        self.steps = 0;
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

/// Byte-level stub tokenizer with configurable special tokens.
pub struct StubTokenizer {
    pub eos: Option<u32>,
    pub bos: Option<u32>,
    pub pad: Option<u32>,
}

impl StubTokenizer {
    pub fn new(eos: Option<u32>) -> Self {
        Self {
            eos,
            bos: None,
            pad: None,
        }
    }
}

impl Tokenizer for StubTokenizer {
    fn encode(&self, text: &str) -> paged_infer::Result<Encoding> {
        let ids: Vec<u32> = text.bytes().map(u32::from).collect();
        let attention_mask = vec![1; ids.len()];
        Ok(Encoding {
            ids,
            attention_mask,
        })
    }

    fn decode(&self, ids: &[u32]) -> paged_infer::Result<String> {
        let bytes: Vec<u8> = ids.iter().map(|&id| id as u8).collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos
    }

    fn bos_token_id(&self) -> Option<u32> {
        self.bos
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad
    }
}
