//! Integration tests for batch assembly.

use candle_core::Device;

use paged_infer::core::sequence::SequenceGroup;
use paged_infer::engine::BatchAssembler;
use paged_infer::{SamplingParams, Scheduler, SchedulerConfig};

fn config() -> SchedulerConfig {
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
        request_id * 10,
        arrival,
    )
}

#[test]
fn test_prefill_layout() {
    let mut scheduler = Scheduler::new(config()).unwrap();
    scheduler.add_group(group(0, vec![10, 11, 12, 13, 14, 15], 0));
    let plan = scheduler.schedule();

    let assembler = BatchAssembler::new(Device::Cpu);
    let inputs = assembler.assemble(&scheduler, &plan).unwrap();

    assert_eq!(inputs.batch_size(), 6);
    assert!(!inputs.is_prompt);
    assert_eq!(inputs.max_context_len, 6);

    let ids: Vec<Vec<i64>> = inputs.input_ids.to_vec2().unwrap();
    let flat: Vec<i64> = ids.into_iter().map(|row| row[0]).collect();
    assert_eq!(flat, vec![10, 11, 12, 13, 14, 15]);

    let positions: Vec<Vec<i64>> = inputs.position_ids.to_vec2().unwrap();
    let flat: Vec<i64> = positions.into_iter().map(|row| row[0]).collect();
    assert_eq!(flat, vec![0, 1, 2, 3, 4, 5]);

    let context: Vec<i64> = inputs.context_lens.to_vec1().unwrap();
    assert_eq!(context, vec![1, 2, 3, 4, 5, 6]);

    // Slots follow block_index * block_size + offset.
    let table = scheduler.get_group(0).unwrap().sequences()[0]
        .block_table()
        .physical_ids()
        .to_vec();
    let slots: Vec<Vec<i64>> = inputs.slot_mapping.to_vec2().unwrap();
    for (pos, row) in slots.iter().enumerate() {
        let expected = table[pos / 4] as i64 * 4 + (pos % 4) as i64;
        assert_eq!(row[0], expected);
    }
}

#[test]
fn test_decode_layout_after_prefill() {
    let mut scheduler = Scheduler::new(config()).unwrap();
    scheduler.add_group(group(0, vec![10, 11, 12], 0));
    let plan = scheduler.schedule();
    for sg in &plan.scheduled {
        scheduler.mark_group_processed(sg.request_id, sg.num_tokens);
    }

    // Simulate the sampled token.
    let seq_id = {
        let group = scheduler.get_group_mut(0).unwrap();
        let seq_id = group.sequences()[0].seq_id();
        group.sequence_mut(seq_id).unwrap().append_token(77, 0.0);
        seq_id
    };

    let plan = scheduler.schedule();
    assert_eq!(plan.scheduled[0].num_tokens, 1);

    let assembler = BatchAssembler::new(Device::Cpu);
    let inputs = assembler.assemble(&scheduler, &plan).unwrap();

    assert_eq!(inputs.batch_size(), 1);
    assert_eq!(inputs.max_context_len, 4);
    assert_eq!(inputs.seq_spans[0].seq_id, seq_id);

    // The decode row feeds the freshly generated token at its position.
    let ids: Vec<Vec<i64>> = inputs.input_ids.to_vec2().unwrap();
    assert_eq!(ids[0][0], 77);
    let positions: Vec<Vec<i64>> = inputs.position_ids.to_vec2().unwrap();
    assert_eq!(positions[0][0], 3);
}

#[test]
fn test_mixed_batch_spans_and_padding() {
    let mut scheduler = Scheduler::new(config()).unwrap();
    // One long and one short prompt produce different table widths.
    scheduler.add_group(group(0, (0..9).collect(), 0));
    scheduler.add_group(group(1, vec![50, 51], 1));
    let plan = scheduler.schedule();

    let assembler = BatchAssembler::new(Device::Cpu);
    let inputs = assembler.assemble(&scheduler, &plan).unwrap();

    assert_eq!(inputs.batch_size(), 11);
    assert_eq!(inputs.seq_spans.len(), 2);
    assert_eq!(inputs.seq_spans[0].num_rows, 9);
    assert_eq!(inputs.seq_spans[1].start_row, 9);
    assert_eq!(inputs.seq_spans[1].num_rows, 2);

    // Rows of the short sequence pad their block table with zeros.
    let tables: Vec<Vec<u32>> = inputs.block_tables.to_vec2().unwrap();
    let long_table_width = scheduler.get_group(0).unwrap().sequences()[0]
        .block_table()
        .num_blocks();
    assert_eq!(tables[0].len(), long_table_width);
    let short_blocks = scheduler.get_group(1).unwrap().sequences()[0]
        .block_table()
        .num_blocks();
    assert!(tables[9][short_blocks..].iter().all(|&b| b == 0));
}
