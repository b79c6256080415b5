//! Inference engine.
//!
//! This module contains:
//! - Pipeline for orchestrating continuous batching steps
//! - BatchAssembler for flattening plans into executor tensors
//! - Sampler and GroupBeamSearcher for token selection
//! - GenerationStream / GenerationHandle for output delivery

pub mod batch;
pub mod beam;
pub mod pipeline;
pub mod sampler;
pub mod stream;

pub use batch::{BatchAssembler, ModelInputs, SequenceSpan};
pub use pipeline::{Pipeline, RequestOutput, UpdateRequestResult};
pub use sampler::{Sampler, SequenceUpdate};
pub use stream::{
    GenerationHandle, GenerationOutput, GenerationOutputs, GenerationResult, GenerationStream,
    Streamer,
};
