//! Integration tests for diverse beam search.

use std::collections::{HashMap, HashSet};

use paged_infer::core::block_pool::BlockPool;
use paged_infer::core::sequence::{
    FinishReason, SequenceGroup, SequenceId, SequenceIdAllocator,
};
use paged_infer::engine::sampler::{Sampler, SequenceUpdate};
use paged_infer::{SamplingParams, StopCriteria};

const VOCAB: usize = 16;

/// Apply sampler updates the way the pipeline does.
fn apply(group: &mut SequenceGroup, pool: &mut BlockPool, updates: Vec<SequenceUpdate>) {
    for update in updates {
        match update {
            SequenceUpdate::Append {
                seq_id,
                token_id,
                log_prob,
            } => {
                group
                    .sequence_mut(seq_id)
                    .unwrap()
                    .append_token(token_id, log_prob);
            }
            SequenceUpdate::Fork {
                parent_seq_id,
                child_seq_id,
                token_id,
                log_prob,
            } => {
                group.fork_sequence(parent_seq_id, child_seq_id, pool).unwrap();
                group
                    .sequence_mut(child_seq_id)
                    .unwrap()
                    .append_token(token_id, log_prob);
            }
            SequenceUpdate::Drop { seq_id } => {
                group.drop_sequence(seq_id, pool).unwrap();
            }
            SequenceUpdate::Finish { seq_id, reason } => {
                group.finish_sequence(seq_id, reason, pool).unwrap();
            }
        }
    }
}

fn beam_group(params: SamplingParams, pool: &mut BlockPool) -> SequenceGroup {
    let prompt = vec![1u32, 2, 3, 4];
    let prompt_len = prompt.len();
    let mut group = SequenceGroup::new(0, prompt, params, 4, 0, 0);
    group.sequences_mut()[0]
        .block_table_mut()
        .ensure_slots(pool, prompt_len)
        .unwrap();
    group.mark_processed(prompt_len);
    group
}

fn descending_row() -> Vec<f32> {
    (0..VOCAB).map(|idx| -(idx as f32)).collect()
}

#[test]
fn test_first_expansion_builds_all_beams() {
    let params = SamplingParams::beam_search();
    let num_beams = params.num_beams();

    let mut pool = BlockPool::new(32, 4, false);
    let mut group = beam_group(params, &mut pool);
    let ids = SequenceIdAllocator::default();
    ids.next();

    let rows: HashMap<SequenceId, Vec<f32>> =
        [(0u64, descending_row())].into_iter().collect();

    let mut sampler = Sampler::new();
    let output = sampler.sample_group(&group, &rows, &ids, None).unwrap();

    let forks = output
        .updates
        .iter()
        .filter(|u| matches!(u, SequenceUpdate::Fork { .. }))
        .count();
    let appends = output
        .updates
        .iter()
        .filter(|u| matches!(u, SequenceUpdate::Append { .. }))
        .count();
    assert_eq!(appends, 1);
    assert_eq!(forks, num_beams - 1);

    apply(&mut group, &mut pool, output.updates);
    assert_eq!(group.num_running(), num_beams);

    // Every beam shares the prompt block.
    let root_block = group.sequences()[0].block_table().get(0).unwrap();
    assert_eq!(pool.ref_count(root_block), Some(num_beams));
}

#[test]
fn test_diversity_penalty_separates_groups() {
    let params = SamplingParams {
        num_groups: 3,
        group_size: 1,
        diversity_penalty: 100.0,
        num_return_sequences: 3,
        ..SamplingParams::beam_search()
    };

    let mut pool = BlockPool::new(32, 4, false);
    let group = beam_group(params, &mut pool);
    let ids = SequenceIdAllocator::default();
    ids.next();

    let rows: HashMap<SequenceId, Vec<f32>> =
        [(0u64, descending_row())].into_iter().collect();

    let mut sampler = Sampler::new();
    let output = sampler.sample_group(&group, &rows, &ids, None).unwrap();

    // A huge penalty forces each group onto a fresh token.
    let mut tokens = HashSet::new();
    for update in &output.updates {
        match update {
            SequenceUpdate::Append { token_id, .. }
            | SequenceUpdate::Fork { token_id, .. } => {
                assert!(tokens.insert(*token_id), "token {token_id} reused");
            }
            _ => {}
        }
    }
    assert_eq!(tokens.len(), 3);
    // Best tokens win in group order.
    assert!(tokens.contains(&0) && tokens.contains(&1) && tokens.contains(&2));
}

#[test]
fn test_eos_candidate_becomes_hypothesis() {
    let params = SamplingParams {
        num_groups: 1,
        group_size: 2,
        diversity_penalty: 0.0,
        num_return_sequences: 2,
        stop_criteria: StopCriteria::Never,
        ..SamplingParams::beam_search()
    };
    let eos = 5u32;

    let mut pool = BlockPool::new(32, 4, false);
    let mut group = beam_group(params, &mut pool);
    let ids = SequenceIdAllocator::default();
    ids.next();

    // EOS is the top candidate.
    let mut row = vec![0.0f32; VOCAB];
    row[eos as usize] = 5.0;
    row[7] = 4.0;
    row[8] = 3.0;
    let rows: HashMap<SequenceId, Vec<f32>> = [(0u64, row)].into_iter().collect();

    let mut sampler = Sampler::new();
    let output = sampler.sample_group(&group, &rows, &ids, Some(eos)).unwrap();
    apply(&mut group, &mut pool, output.updates);

    // The EOS fork finished; two running beams continue on 7 and 8.
    let finished: Vec<_> = group
        .sequences()
        .iter()
        .filter(|seq| seq.is_finished())
        .collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].generated_ids().last(), Some(&eos));
    assert_eq!(
        finished[0].finish_reason(),
        Some(FinishReason::EndOfSequence)
    );
    assert_eq!(group.num_running(), 2);

    let running_tokens: HashSet<u32> = group
        .running_sequences()
        .map(|seq| *seq.generated_ids().last().unwrap())
        .collect();
    assert_eq!(running_tokens, HashSet::from([7, 8]));
}

#[test]
fn test_beam_pruning_keeps_width_constant() {
    let params = SamplingParams {
        num_groups: 1,
        group_size: 2,
        diversity_penalty: 0.0,
        num_return_sequences: 2,
        stop_criteria: StopCriteria::Never,
        ..SamplingParams::beam_search()
    };

    let mut pool = BlockPool::new(32, 4, false);
    let mut group = beam_group(params, &mut pool);
    let ids = SequenceIdAllocator::default();
    ids.next();

    let mut sampler = Sampler::new();

    // First expansion from the root.
    let rows: HashMap<SequenceId, Vec<f32>> =
        [(0u64, descending_row())].into_iter().collect();
    let output = sampler.sample_group(&group, &rows, &ids, None).unwrap();
    apply(&mut group, &mut pool, output.updates);
    assert_eq!(group.num_running(), 2);

    // Second step: one beam dominates; width must stay 2.
    let mut rows: HashMap<SequenceId, Vec<f32>> = HashMap::new();
    let running: Vec<u64> = group.running_sequences().map(|s| s.seq_id()).collect();
    let mut strong = vec![0.0f32; VOCAB];
    strong[3] = 10.0;
    strong[4] = 9.0;
    rows.insert(running[0], strong);
    rows.insert(running[1], vec![-10.0f32; VOCAB]);

    let output = sampler.sample_group(&group, &rows, &ids, None).unwrap();
    apply(&mut group, &mut pool, output.updates);
    assert_eq!(group.num_running(), 2);

    // Both survivors descend from the dominating beam.
    let tails: HashSet<u32> = group
        .running_sequences()
        .map(|seq| *seq.generated_ids().last().unwrap())
        .collect();
    assert_eq!(tails, HashSet::from([3, 4]));
}
