//! Speculative decoding.
//!
//! A cheap draft pipeline runs ahead of the main pipeline, proposing
//! candidate tokens that the main model validates in a single fused
//! pass. Accepted candidates advance the sequence several tokens per
//! main step; rejected ones are rolled back on both sides.
//!
//! ```text
//! Draft (K=4):   [prompt] -> c1 -> c2 -> c3 -> c4
//! Main validate: rows for [g0, c1, c2, c3, c4] in one pass
//! Reconcile:     accept c1, c2; reject c3, c4; append verified g3
//! ```

pub mod config;
pub mod controller;
pub mod metrics;

pub use config::SpeculativeConfig;
pub use controller::{ModelDesc, SpeculativeController};
pub use metrics::SpeculativeMetrics;
