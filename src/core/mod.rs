//! Core infrastructure for paged-infer.
//!
//! This module contains the fundamental building blocks:
//! - BlockPool for KV cache block ownership and copy-on-write
//! - BlockTable for per-sequence logical-to-physical mapping
//! - Sequence and SequenceGroup for request tracking

pub mod block;
pub mod block_pool;
pub mod sequence;
