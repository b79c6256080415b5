//! Error types for paged-infer.

use thiserror::Error;

/// Result type alias for paged-infer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for paged-infer.
#[derive(Error, Debug)]
pub enum Error {
    /// Block allocation failed - no free blocks available.
    ///
    /// Inside a scheduling step this is recovered by preemption and
    /// never reaches callers.
    #[error("out of KV cache blocks")]
    OutOfBlocks,

    /// A waiting request's prompt exceeds a budget it can never
    /// satisfy: the pool's total block capacity, or the per-step token
    /// cap when prompt chunking is disabled.
    ///
    /// Resolved by finishing the request with `FinishReason::Ignored`.
    #[error("prompt exceeds schedulable budget ({required} needed, {capacity} available)")]
    BudgetExceeded { required: usize, capacity: usize },

    /// A block index that is not currently allocated was referenced.
    #[error("block {0} is not allocated")]
    UnknownBlock(u32),

    /// A logical position beyond the allocated block table was referenced.
    #[error("logical block {logical_idx} out of bounds ({num_blocks} allocated)")]
    BlockOutOfBounds {
        logical_idx: usize,
        num_blocks: usize,
    },

    /// Sequence not found in scheduler.
    #[error("sequence {0} not found")]
    SequenceNotFound(u64),

    /// Request not found in the pipeline.
    #[error("request {0} not found")]
    RequestNotFound(u64),

    /// Invalid sequence state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Main and draft tokenizers disagree on the probe encoding.
    #[error("tokenizers for draft and main models are different")]
    TokenizerMismatch,

    /// Configuration error. Fatal at construction.
    #[error("configuration error: {0}")]
    InvalidConfig(String),

    /// The executor failed during a step.
    ///
    /// Sequences in flight during the failing step are finished with
    /// `FinishReason::Aborted`; the error is surfaced to the caller.
    #[error("executor failure: {0}")]
    Executor(String),

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
