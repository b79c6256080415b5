//! Speculative decoding configuration.

use serde::{Deserialize, Serialize};

/// Configuration for speculative decoding.
///
/// The draft pipeline proposes up to `num_candidates` tokens per step;
/// the main pipeline validates them in a single fused pass. Larger
/// values help when the draft model agrees with the main one often and
/// waste compute when it does not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculativeConfig {
    /// Candidate tokens drafted per step (K).
    pub num_candidates: usize,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self { num_candidates: 4 }
    }
}

impl SpeculativeConfig {
    /// Create a config drafting `num_candidates` tokens per step.
    pub fn new(num_candidates: usize) -> Self {
        Self { num_candidates }
    }
}
