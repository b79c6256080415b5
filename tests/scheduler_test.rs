//! Integration tests for the continuous batching scheduler.

use paged_infer::core::sequence::{FinishReason, SequenceGroup, SequenceStatus};
use paged_infer::{SamplingParams, Scheduler, SchedulerConfig};

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        max_num_batched_tokens: 64,
        num_blocks: 16,
        block_size: 4,
        max_num_seqs: 8,
        dynamic_split_fuse: false,
        use_cache_eviction: false,
    }
}

fn group(request_id: u64, prompt: Vec<u32>, arrival: u64) -> SequenceGroup {
    SequenceGroup::new(
        request_id,
        prompt,
        SamplingParams::greedy(),
        4,
        request_id * 100,
        arrival,
    )
}

#[test]
fn test_scheduler_creation() {
    let scheduler = Scheduler::new(test_config()).unwrap();
    assert_eq!(scheduler.num_waiting(), 0);
    assert_eq!(scheduler.num_running(), 0);
    assert!(!scheduler.has_unfinished_groups());
}

#[test]
fn test_invalid_config_rejected() {
    let mut config = test_config();
    config.num_blocks = 0;
    assert!(Scheduler::new(config).is_err());
}

#[test]
fn test_fcfs_admission() {
    let mut scheduler = Scheduler::new(test_config()).unwrap();
    for id in 0..3 {
        scheduler.add_group(group(id, vec![1, 2, 3, 4], id));
    }

    let plan = scheduler.schedule();
    let order: Vec<u64> = plan.scheduled.iter().map(|sg| sg.request_id).collect();
    assert_eq!(order, vec![0, 1, 2]);
    assert!(plan.scheduled.iter().all(|sg| sg.num_tokens == 4));
    assert_eq!(scheduler.num_running(), 3);
}

#[test]
fn test_token_budget_blocks_admission() {
    let mut config = test_config();
    config.max_num_batched_tokens = 10;
    let mut scheduler = Scheduler::new(config).unwrap();

    scheduler.add_group(group(0, (0..8).collect(), 0));
    scheduler.add_group(group(1, (0..8).collect(), 1));

    // Without dynamic split-fuse the second prompt must fit whole.
    let plan = scheduler.schedule();
    assert_eq!(plan.scheduled.len(), 1);
    assert_eq!(plan.num_batched_tokens, 8);
    assert_eq!(scheduler.num_waiting(), 1);
}

#[test]
fn test_dynamic_split_fuse_chunks_prompts() {
    let mut config = test_config();
    config.max_num_batched_tokens = 4;
    config.dynamic_split_fuse = true;
    let mut scheduler = Scheduler::new(config).unwrap();

    scheduler.add_group(group(0, (0..10).collect(), 0));

    let plan = scheduler.schedule();
    assert_eq!(plan.scheduled.len(), 1);
    assert_eq!(plan.scheduled[0].num_tokens, 4);

    scheduler.mark_group_processed(0, 4);
    let plan = scheduler.schedule();
    assert_eq!(plan.scheduled[0].num_tokens, 4);

    scheduler.mark_group_processed(0, 4);
    let plan = scheduler.schedule();
    assert_eq!(plan.scheduled[0].num_tokens, 2);
}

#[test]
fn test_max_num_seqs_limit() {
    let mut config = test_config();
    config.max_num_seqs = 2;
    let mut scheduler = Scheduler::new(config).unwrap();

    for id in 0..3 {
        scheduler.add_group(group(id, vec![1, 2], id));
    }

    let plan = scheduler.schedule();
    assert_eq!(plan.scheduled.len(), 2);
    assert_eq!(scheduler.num_waiting(), 1);
}

#[test]
fn test_oversized_prompt_finishes_ignored() {
    let mut config = test_config();
    config.num_blocks = 2;
    let mut scheduler = Scheduler::new(config).unwrap();

    // 9 tokens can never fit 2 blocks of 4.
    scheduler.add_group(group(7, (0..9).collect(), 0));

    let plan = scheduler.schedule();
    assert!(plan.is_empty());
    assert_eq!(plan.ignored_requests, vec![7]);

    let ignored = scheduler.get_group(7).unwrap();
    assert!(ignored.is_finished());
    assert_eq!(
        ignored.sequences()[0].finish_reason(),
        Some(FinishReason::Ignored)
    );
}

#[test]
fn test_unchunked_prompt_wider_than_token_cap_is_ignored() {
    let mut config = test_config();
    config.max_num_batched_tokens = 8;
    let mut scheduler = Scheduler::new(config.clone()).unwrap();

    // 9 tokens fit the pool but can never fit one unchunked prefill.
    scheduler.add_group(group(3, (0..9).collect(), 0));

    let plan = scheduler.schedule();
    assert!(plan.is_empty());
    assert_eq!(plan.ignored_requests, vec![3]);
    assert!(!scheduler.has_unfinished_groups());

    let ignored = scheduler.get_group(3).unwrap();
    assert_eq!(
        ignored.sequences()[0].finish_reason(),
        Some(FinishReason::Ignored)
    );

    // With dynamic split-fuse the same prompt is admitted in chunks.
    config.dynamic_split_fuse = true;
    let mut scheduler = Scheduler::new(config).unwrap();
    scheduler.add_group(group(3, (0..9).collect(), 0));

    let plan = scheduler.schedule();
    assert!(plan.ignored_requests.is_empty());
    assert_eq!(plan.scheduled.len(), 1);
    assert_eq!(plan.scheduled[0].num_tokens, 8);
}

#[test]
fn test_preemption_recomputes_youngest() {
    let mut config = test_config();
    config.num_blocks = 3;
    config.block_size = 2;
    let mut scheduler = Scheduler::new(config).unwrap();

    scheduler.add_group(group(0, vec![1, 2], 0));
    scheduler.add_group(group(1, vec![3, 4], 1));
    scheduler.add_group(group(2, vec![5, 6], 2));

    // All three prompts fit one block each.
    let plan = scheduler.schedule();
    assert_eq!(plan.scheduled.len(), 3);
    for sg in &plan.scheduled {
        scheduler.mark_group_processed(sg.request_id, sg.num_tokens);
    }

    // Each group grows past its block; the pool cannot serve them all.
    for id in 0..3 {
        let group = scheduler.get_group_mut(id).unwrap();
        let seq_id = group.sequences()[0].seq_id();
        group.sequence_mut(seq_id).unwrap().append_token(9, 0.0);
    }

    let plan = scheduler.schedule();

    // The youngest groups were preempted, the oldest kept running.
    assert!(plan.scheduled.iter().any(|sg| sg.request_id == 0));
    assert!(!plan.preempted_seq_ids.is_empty());
    let preempted_requests: Vec<u64> = plan
        .preempted_seq_ids
        .iter()
        .map(|seq_id| seq_id / 100)
        .collect();
    assert!(preempted_requests.contains(&2));

    // Preempted groups lost their KV and wait for recompute.
    let victim = scheduler.get_group(2).unwrap();
    assert_eq!(victim.num_processed_tokens(), 0);
    assert_eq!(victim.sequences()[0].status(), SequenceStatus::Swapped);
    assert!(victim.sequences()[0].block_table().is_empty());

    // No sequence is both scheduled and preempted.
    for sg in &plan.scheduled {
        let group = scheduler.get_group(sg.request_id).unwrap();
        for seq in group.sequences() {
            assert!(!plan.preempted_seq_ids.contains(&seq.seq_id()));
        }
    }
}

#[test]
fn test_block_accounting_invariant() {
    let mut config = test_config();
    config.num_blocks = 4;
    config.block_size = 2;
    let mut scheduler = Scheduler::new(config).unwrap();

    scheduler.add_group(group(0, vec![1, 2, 3], 0));
    scheduler.add_group(group(1, vec![4, 5, 6, 7, 8], 1));

    for _ in 0..4 {
        let plan = scheduler.schedule();
        for sg in &plan.scheduled {
            scheduler.mark_group_processed(sg.request_id, sg.num_tokens);
        }
        let pool = scheduler.pool();
        assert_eq!(pool.free_blocks() + pool.allocated_blocks(), 4);
    }
}

#[test]
fn test_remove_group_releases_blocks() {
    let mut scheduler = Scheduler::new(test_config()).unwrap();
    scheduler.add_group(group(0, (0..8).collect(), 0));
    let _ = scheduler.schedule();
    assert!(scheduler.pool().allocated_blocks() > 0);

    scheduler.remove_group(0);
    assert_eq!(scheduler.pool().allocated_blocks(), 0);
    assert!(!scheduler.has_unfinished_groups());
}

#[test]
fn test_scheduled_groups_snapshot_block_tables() {
    let mut scheduler = Scheduler::new(test_config()).unwrap();
    scheduler.add_group(group(0, (0..6).collect(), 0));

    let plan = scheduler.schedule();
    let group = scheduler.get_group(0).unwrap();
    let seq = &group.sequences()[0];
    assert_eq!(
        plan.block_tables.get(&seq.seq_id()).unwrap(),
        seq.block_table().physical_ids()
    );
}
