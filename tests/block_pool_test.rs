//! Integration tests for the block pool and block tables.

use paged_infer::core::block::BlockTable;
use paged_infer::core::block_pool::BlockPool;

#[test]
fn test_pool_creation() {
    let pool = BlockPool::new(1024, 16, false);

    assert_eq!(pool.num_blocks(), 1024);
    assert_eq!(pool.free_blocks(), 1024);
    assert_eq!(pool.allocated_blocks(), 0);
    assert_eq!(pool.block_size(), 16);
}

#[test]
fn test_allocation_is_atomic() {
    let mut pool = BlockPool::new(3, 16, false);

    let blocks = pool.allocate(2).unwrap();
    assert_eq!(blocks.len(), 2);

    // Requesting more than available leaves the pool untouched.
    assert!(pool.allocate(2).is_err());
    assert_eq!(pool.free_blocks(), 1);
    assert_eq!(pool.allocated_blocks(), 2);
}

#[test]
fn test_accounting_invariant_through_churn() {
    let mut pool = BlockPool::new(16, 8, false);

    let a = pool.allocate(5).unwrap();
    let b = pool.allocate(3).unwrap();
    pool.free_many(&a[1..4]);
    let _c = pool.allocate(6).unwrap();
    pool.free_many(&b);

    assert_eq!(pool.free_blocks() + pool.allocated_blocks(), 16);
}

#[test]
fn test_refcount_sum_matches_table_slots() {
    let mut pool = BlockPool::new(16, 4, false);

    let mut table_a = BlockTable::new(4);
    table_a.ensure_slots(&mut pool, 10).unwrap();
    let table_b = table_a.fork(&mut pool).unwrap();
    let mut table_c = BlockTable::new(4);
    table_c.ensure_slots(&mut pool, 4).unwrap();

    let total_slots = table_a.num_blocks() + table_b.num_blocks() + table_c.num_blocks();
    assert_eq!(pool.total_ref_count(), total_slots);

    // Copy-on-write keeps the invariant.
    let mut table_b = table_b;
    table_b.prepare_write_range(&mut pool, 8, 10).unwrap();
    let total_slots = table_a.num_blocks() + table_b.num_blocks() + table_c.num_blocks();
    assert_eq!(pool.total_ref_count(), total_slots);
}

#[test]
fn test_copy_on_write_isolates_writers() {
    let mut pool = BlockPool::new(8, 4, false);

    let mut parent = BlockTable::new(4);
    parent.ensure_slots(&mut pool, 8).unwrap();
    let mut child = parent.fork(&mut pool).unwrap();

    let copies = child.prepare_write_range(&mut pool, 6, 8).unwrap();
    assert_eq!(copies.len(), 1);

    // Writers never share a physical block.
    assert_ne!(child.get(1).unwrap(), parent.get(1).unwrap());
    // The untouched block is still shared.
    assert_eq!(child.get(0).unwrap(), parent.get(0).unwrap());
}

#[test]
fn test_shared_block_frees_on_last_release() {
    let mut pool = BlockPool::new(4, 4, false);

    let mut table = BlockTable::new(4);
    table.ensure_slots(&mut pool, 4).unwrap();
    let mut forked = table.fork(&mut pool).unwrap();

    table.release(&mut pool);
    assert_eq!(pool.allocated_blocks(), 1);

    forked.release(&mut pool);
    assert_eq!(pool.allocated_blocks(), 0);
    assert_eq!(pool.free_blocks(), 4);
}

#[test]
fn test_eviction_keeps_released_blocks_reclaimable() {
    let mut pool = BlockPool::new(4, 4, true);

    let blocks = pool.allocate(4).unwrap();
    pool.free(blocks[2]);
    pool.free(blocks[0]);

    // Released blocks count as free and are reclaimed LRU-first.
    assert_eq!(pool.free_blocks(), 2);
    assert_eq!(pool.allocate(1).unwrap()[0], blocks[2]);
    assert_eq!(pool.allocate(1).unwrap()[0], blocks[0]);
}

#[test]
fn test_reset_restores_initial_state() {
    let mut pool = BlockPool::new(8, 4, true);
    let blocks = pool.allocate(6).unwrap();
    pool.free_many(&blocks[..3]);

    pool.reset();
    assert_eq!(pool.free_blocks(), 8);
    assert_eq!(pool.allocated_blocks(), 0);
    assert_eq!(pool.allocate(8).unwrap().len(), 8);
}
