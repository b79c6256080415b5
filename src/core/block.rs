//! Block table abstraction for PagedAttention.
//!
//! PagedAttention divides the KV cache into fixed-size blocks, similar
//! to how operating systems manage virtual memory with pages. A
//! [`BlockTable`] is a sequence's page table: logical token positions
//! map onto physical blocks owned by the
//! [`BlockPool`](super::block_pool::BlockPool).

use crate::core::block_pool::{BlockCopy, BlockIndex, BlockPool};
use crate::error::{Error, Result};

/// Compute the number of blocks needed for a sequence of given length.
///
/// # Example
///
/// ```
/// use paged_infer::core::block::blocks_for_tokens;
///
/// assert_eq!(blocks_for_tokens(35, 16), 3);
/// assert_eq!(blocks_for_tokens(32, 16), 2);
/// assert_eq!(blocks_for_tokens(0, 16), 0);
/// ```
pub fn blocks_for_tokens(num_tokens: usize, block_size: usize) -> usize {
    num_tokens.div_ceil(block_size)
}

/// Maps a sequence's logical positions to physical block indices.
///
/// Token at position `p` is stored in:
/// - logical block `p / block_size`
/// - slot `p % block_size` within it
/// - physical block `block_ids[p / block_size]`
///
/// The table only holds indices; contents and reference counts live in
/// the pool.
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    /// Physical block indices in logical order.
    block_ids: Vec<BlockIndex>,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            block_size,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks mapped by this table.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Number of token slots covered by the mapped blocks.
    pub fn capacity(&self) -> usize {
        self.block_ids.len() * self.block_size
    }

    /// All physical block indices in logical order.
    pub fn physical_ids(&self) -> &[BlockIndex] {
        &self.block_ids
    }

    /// Physical block index for a logical block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockOutOfBounds`] if the logical block is not
    /// mapped.
    pub fn get(&self, logical_idx: usize) -> Result<BlockIndex> {
        self.block_ids
            .get(logical_idx)
            .copied()
            .ok_or(Error::BlockOutOfBounds {
                logical_idx,
                num_blocks: self.block_ids.len(),
            })
    }

    /// Absolute slot id for a logical token position.
    ///
    /// `slot = block_index * block_size + position % block_size`.
    pub fn physical_slot(&self, pos: usize) -> Result<u64> {
        let block = self.get(pos / self.block_size)?;
        Ok(block as u64 * self.block_size as u64 + (pos % self.block_size) as u64)
    }

    /// Grow the table until it covers `num_tokens` token slots.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] if the pool cannot satisfy the
    /// growth; the table is left unchanged in that case.
    pub fn ensure_slots(&mut self, pool: &mut BlockPool, num_tokens: usize) -> Result<()> {
        let needed = blocks_for_tokens(num_tokens, self.block_size);
        if needed > self.block_ids.len() {
            let fresh = pool.allocate(needed - self.block_ids.len())?;
            self.block_ids.extend(fresh);
        }
        Ok(())
    }

    /// Make the blocks covering positions `start..end` writable.
    ///
    /// Shared blocks in the range are replaced through copy-on-write;
    /// the returned copies must be performed by the executor before the
    /// forward pass writes into the range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] if a copy target cannot be
    /// allocated.
    pub fn prepare_write_range(
        &mut self,
        pool: &mut BlockPool,
        start: usize,
        end: usize,
    ) -> Result<Vec<BlockCopy>> {
        if start >= end {
            return Ok(Vec::new());
        }

        let mut copies = Vec::new();
        let first = start / self.block_size;
        let last = (end - 1) / self.block_size;
        for logical_idx in first..=last {
            let block = self.get(logical_idx)?;
            let (writable, copy) = pool.prepare_write(block)?;
            self.block_ids[logical_idx] = writable;
            if let Some(copy) = copy {
                copies.push(copy);
            }
        }
        Ok(copies)
    }

    /// Free trailing blocks that are no longer needed for `num_tokens`.
    pub fn trim(&mut self, pool: &mut BlockPool, num_tokens: usize) {
        let needed = blocks_for_tokens(num_tokens, self.block_size);
        while self.block_ids.len() > needed {
            if let Some(block) = self.block_ids.pop() {
                pool.free(block);
            }
        }
    }

    /// Duplicate the table for a forked sequence.
    ///
    /// Every shared block gains one reference; the fork must go through
    /// [`prepare_write_range`](Self::prepare_write_range) before
    /// writing.
    pub fn fork(&self, pool: &mut BlockPool) -> Result<BlockTable> {
        let mut block_ids = Vec::with_capacity(self.block_ids.len());
        for &block in &self.block_ids {
            block_ids.push(pool.fork(block)?);
        }
        Ok(BlockTable {
            block_ids,
            block_size: self.block_size,
        })
    }

    /// Release every block back to the pool and clear the table.
    pub fn release(&mut self, pool: &mut BlockPool) {
        for &block in &self.block_ids {
            pool.free(block);
        }
        self.block_ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_arithmetic() {
        let mut pool = BlockPool::new(8, 4, false);
        let mut table = BlockTable::new(4);
        table.ensure_slots(&mut pool, 10).unwrap();

        assert_eq!(table.num_blocks(), 3);
        for pos in 0..10 {
            let expected = table.get(pos / 4).unwrap() as u64 * 4 + (pos % 4) as u64;
            assert_eq!(table.physical_slot(pos).unwrap(), expected);
        }
        assert!(table.physical_slot(12).is_err());
    }

    #[test]
    fn test_fork_shares_blocks() {
        let mut pool = BlockPool::new(8, 4, false);
        let mut table = BlockTable::new(4);
        table.ensure_slots(&mut pool, 4).unwrap();

        let forked = table.fork(&mut pool).unwrap();
        assert_eq!(forked.physical_ids(), table.physical_ids());
        assert_eq!(pool.ref_count(table.get(0).unwrap()), Some(2));
    }

    #[test]
    fn test_prepare_write_range_copies_shared_tail() {
        let mut pool = BlockPool::new(8, 4, false);
        let mut table = BlockTable::new(4);
        table.ensure_slots(&mut pool, 8).unwrap();
        let mut forked = table.fork(&mut pool).unwrap();

        // Writing positions 4..6 only touches the second block.
        let copies = forked.prepare_write_range(&mut pool, 4, 6).unwrap();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].src, table.get(1).unwrap());
        assert_ne!(forked.get(1).unwrap(), table.get(1).unwrap());

        // The untouched first block stays shared.
        assert_eq!(forked.get(0).unwrap(), table.get(0).unwrap());
        assert_eq!(pool.ref_count(table.get(0).unwrap()), Some(2));
        assert_eq!(pool.ref_count(table.get(1).unwrap()), Some(1));
    }

    #[test]
    fn test_trim_frees_trailing_blocks() {
        let mut pool = BlockPool::new(8, 4, false);
        let mut table = BlockTable::new(4);
        table.ensure_slots(&mut pool, 12).unwrap();
        assert_eq!(pool.free_blocks(), 5);

        table.trim(&mut pool, 5);
        assert_eq!(table.num_blocks(), 2);
        assert_eq!(pool.free_blocks(), 6);
    }
}
