//! paged-infer: a continuous-batching LLM inference core in Rust.
//!
//! This crate implements the serving-side machinery of an LLM engine:
//! - Paged KV cache management with copy-on-write block sharing
//! - Continuous batching across prefill and decode
//! - Greedy, multinomial and diverse beam search sampling
//! - Speculative decoding against a draft model
//!
//! The neural forward pass and the tokenizer are collaborators behind
//! the [`Executor`](executor::Executor) and
//! [`Tokenizer`](executor::Tokenizer) traits; the core only exchanges
//! flattened input tensors for logits.

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod executor;
pub mod scheduler;
pub mod speculative;

pub use config::{AdapterSpec, SamplingParams, SchedulerConfig, StopCriteria};
pub use crate::core::sequence::{FinishReason, RequestId, SequenceId, SequenceStatus};
pub use engine::{
    GenerationHandle, GenerationOutput, GenerationOutputs, GenerationResult, Pipeline,
    RequestOutput, Streamer,
};
pub use error::{Error, Result};
pub use executor::{Executor, Tokenizer};
pub use scheduler::{Scheduler, SchedulerOutputs};
pub use speculative::{ModelDesc, SpeculativeConfig, SpeculativeController};
