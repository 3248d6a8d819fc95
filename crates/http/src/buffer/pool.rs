//! Fixed-size block storage and the global lease/reclaim pool.

use std::sync::{Mutex, PoisonError};

/// Capacity of small-tier blocks, sized for typical header sections.
pub const SMALL_BLOCK_SIZE: usize = 4 * 1024;
/// Capacity of large-tier blocks, used for bulk payload staging.
pub const LARGE_BLOCK_SIZE: usize = 16 * 1024;

/// Free-list cap per tier; reclaims beyond this just drop the storage.
const MAX_POOLED_PER_TIER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Small,
    Large,
    /// One-off allocation above the large tier; never pooled.
    Oversize,
}

/// A single pooled byte block.
///
/// `start..end` bounds the valid data inside the fixed storage. Blocks are
/// linked by their position inside a [`BlockChain`](super::BlockChain);
/// cursors index into the storage with absolute offsets, so `start` only
/// moves forward when a chain compacts consumed bytes away.
#[derive(Debug)]
pub struct Block {
    data: Box<[u8]>,
    start: usize,
    end: usize,
    tier: Tier,
}

impl Block {
    fn with_capacity(capacity: usize, tier: Tier) -> Self {
        Self { data: vec![0u8; capacity].into_boxed_slice(), start: 0, end: 0, tier }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Offset of the first valid byte.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Offset one past the last valid byte.
    pub fn end(&self) -> usize {
        self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Bytes still writable behind the valid region.
    pub fn writable(&self) -> usize {
        self.data.len() - self.end
    }

    pub fn readable(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub fn writable_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.end..]
    }

    /// Marks `count` freshly written bytes as valid.
    pub fn commit(&mut self, count: usize) {
        debug_assert!(count <= self.writable());
        self.end += count;
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Advances `start` to `offset`, dropping the bytes before it.
    pub(crate) fn consume_to(&mut self, offset: usize) {
        debug_assert!(offset >= self.start && offset <= self.end);
        self.start = offset;
    }

    pub(crate) fn reset(&mut self) {
        self.start = 0;
        self.end = 0;
    }
}

/// Thread-safe pool of reusable blocks in two size tiers.
///
/// Leases never block and never fail: an empty free list allocates fresh
/// storage, and requests above the large tier get a dedicated block that is
/// dropped instead of pooled on reclaim.
#[derive(Debug)]
pub struct BufferPool {
    small_size: usize,
    large_size: usize,
    small: Mutex<Vec<Block>>,
    large: Mutex<Vec<Block>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_block_sizes(SMALL_BLOCK_SIZE, LARGE_BLOCK_SIZE)
    }

    /// Pool with custom tier capacities. Tests shrink these to force chains
    /// across many blocks.
    pub fn with_block_sizes(small_size: usize, large_size: usize) -> Self {
        debug_assert!(small_size > 0 && small_size <= large_size);
        Self { small_size, large_size, small: Mutex::new(Vec::new()), large: Mutex::new(Vec::new()) }
    }

    pub fn small_block_size(&self) -> usize {
        self.small_size
    }

    pub fn large_block_size(&self) -> usize {
        self.large_size
    }

    /// Returns a block with at least `min_size` writable bytes.
    pub fn lease(&self, min_size: usize) -> Block {
        if min_size <= self.small_size {
            self.lease_tier(&self.small, self.small_size, Tier::Small)
        } else if min_size <= self.large_size {
            self.lease_tier(&self.large, self.large_size, Tier::Large)
        } else {
            Block::with_capacity(min_size, Tier::Oversize)
        }
    }

    fn lease_tier(&self, free: &Mutex<Vec<Block>>, capacity: usize, tier: Tier) -> Block {
        let mut list = free.lock().unwrap_or_else(PoisonError::into_inner);
        list.pop().unwrap_or_else(|| Block::with_capacity(capacity, tier))
    }

    /// Returns a block to its tier. The caller must not retain cursors into
    /// the block afterwards.
    pub fn reclaim(&self, mut block: Block) {
        block.reset();
        let free = match block.tier {
            Tier::Small => &self.small,
            Tier::Large => &self.large,
            Tier::Oversize => return,
        };
        let mut list = free.lock().unwrap_or_else(PoisonError::into_inner);
        if list.len() < MAX_POOLED_PER_TIER {
            list.push(block);
        }
    }

    #[cfg(test)]
    pub(crate) fn pooled_counts(&self) -> (usize, usize) {
        let small = self.small.lock().unwrap_or_else(PoisonError::into_inner).len();
        let large = self.large.lock().unwrap_or_else(PoisonError::into_inner).len();
        (small, large)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_picks_the_smallest_fitting_tier() {
        let pool = BufferPool::new();
        assert_eq!(pool.lease(1).capacity(), SMALL_BLOCK_SIZE);
        assert_eq!(pool.lease(SMALL_BLOCK_SIZE).capacity(), SMALL_BLOCK_SIZE);
        assert_eq!(pool.lease(SMALL_BLOCK_SIZE + 1).capacity(), LARGE_BLOCK_SIZE);
        assert_eq!(pool.lease(LARGE_BLOCK_SIZE).capacity(), LARGE_BLOCK_SIZE);
    }

    #[test]
    fn oversize_lease_is_exact_and_never_pooled() {
        let pool = BufferPool::new();
        let block = pool.lease(LARGE_BLOCK_SIZE * 3);
        assert_eq!(block.capacity(), LARGE_BLOCK_SIZE * 3);
        pool.reclaim(block);
        assert_eq!(pool.pooled_counts(), (0, 0));
    }

    #[test]
    fn reclaim_resets_and_reuses_blocks() {
        let pool = BufferPool::with_block_sizes(16, 64);
        let mut block = pool.lease(8);
        block.writable_mut()[..5].copy_from_slice(b"hello");
        block.commit(5);
        assert_eq!(block.readable(), b"hello");

        pool.reclaim(block);
        assert_eq!(pool.pooled_counts(), (1, 0));

        let reused = pool.lease(8);
        assert!(reused.is_empty());
        assert_eq!(reused.writable(), 16);
        assert_eq!(pool.pooled_counts(), (0, 0));
    }

    #[test]
    fn fresh_lease_has_zeroed_bounds() {
        let pool = BufferPool::new();
        let block = pool.lease(100);
        assert_eq!((block.start(), block.end()), (0, 0));
        assert_eq!(block.writable(), block.capacity());
    }
}
