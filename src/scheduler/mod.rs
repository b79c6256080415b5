//! Batch scheduling for continuous batching.
//!
//! This module handles:
//! - FCFS request admission under token, sequence and block budgets
//! - Iteration-level (continuous) batching
//! - Preemption with recompute under memory pressure

pub mod batch;

pub use batch::{ScheduledGroup, Scheduler, SchedulerOutputs};
