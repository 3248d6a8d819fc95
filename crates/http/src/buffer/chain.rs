//! Block chains and the cursor operations the parser scans with.

use bytes::{Bytes, BytesMut};

use super::pool::{Block, BufferPool};

/// A position inside a [`BlockChain`]: block index plus an absolute offset
/// into that block's storage.
///
/// Cursors are plain values; all operations live on the chain. A cursor stays
/// valid until the chain compacts or hands its blocks away, which owners only
/// do at consuming boundaries when no other cursor is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    block: usize,
    offset: usize,
}

/// An ordered chain of pooled blocks holding one logical byte string.
///
/// Block boundaries are invisible to cursor operations: `seek`, `take`,
/// `copy_to` and `distance` treat the chain as contiguous, skipping empty
/// blocks transparently. Only the copy operations touch byte contents;
/// scanning never moves data.
#[derive(Debug, Default)]
pub struct BlockChain {
    blocks: Vec<Block>,
}

impl BlockChain {
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    /// Total valid bytes across all blocks.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(Block::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(Block::is_empty)
    }

    /// Cursor at the first valid byte (equals [`end`](Self::end) when empty).
    pub fn begin(&self) -> Cursor {
        self.normalize(Cursor { block: 0, offset: self.blocks.first().map_or(0, Block::start) })
    }

    /// Cursor one past the last valid byte.
    pub fn end(&self) -> Cursor {
        Cursor { block: self.blocks.len(), offset: 0 }
    }

    pub fn is_end(&self, cursor: Cursor) -> bool {
        self.normalize(cursor).block == self.blocks.len()
    }

    /// Canonical form: skips exhausted and empty blocks so that a non-end
    /// cursor always points at a valid byte.
    fn normalize(&self, mut cursor: Cursor) -> Cursor {
        while cursor.block < self.blocks.len() {
            let block = &self.blocks[cursor.block];
            if cursor.offset < block.start() {
                cursor.offset = block.start();
            }
            if cursor.offset < block.end() {
                return cursor;
            }
            cursor.block += 1;
            cursor.offset = self.blocks.get(cursor.block).map_or(0, Block::start);
        }
        Cursor { block: self.blocks.len(), offset: 0 }
    }

    /// The byte at the cursor, without advancing.
    pub fn peek(&self, cursor: Cursor) -> Option<u8> {
        let cursor = self.normalize(cursor);
        self.blocks.get(cursor.block).map(|block| block.data()[cursor.offset])
    }

    /// Returns the byte at the cursor and advances past it.
    pub fn take(&self, cursor: &mut Cursor) -> Option<u8> {
        let normalized = self.normalize(*cursor);
        match self.blocks.get(normalized.block) {
            Some(block) => {
                let byte = block.data()[normalized.offset];
                *cursor = Cursor { block: normalized.block, offset: normalized.offset + 1 };
                Some(byte)
            }
            None => {
                *cursor = normalized;
                None
            }
        }
    }

    /// Advances the cursor to the first occurrence of any candidate byte and
    /// returns the byte that matched. Supports one to three candidates.
    ///
    /// Without a match the cursor is left at the chain end and `None` is
    /// returned; the caller decides whether that means "wait for more data".
    pub fn seek(&self, cursor: &mut Cursor, needles: &[u8]) -> Option<u8> {
        debug_assert!((1..=3).contains(&needles.len()));
        let first = needles[0];
        let second = needles.get(1).copied().unwrap_or(first);
        let third = needles.get(2).copied().unwrap_or(first);

        let mut current = self.normalize(*cursor);
        while let Some(block) = self.blocks.get(current.block) {
            let slice = &block.data()[current.offset..block.end()];
            if let Some(hit) = slice.iter().position(|&b| b == first || b == second || b == third) {
                current.offset += hit;
                *cursor = current;
                return Some(slice[hit]);
            }
            current = self.normalize(Cursor { block: current.block + 1, offset: 0 });
        }
        *cursor = current;
        None
    }

    /// Copies bytes from the cursor into `dst`, advancing the cursor.
    /// Returns the number of bytes copied (bounded by `dst` and by the
    /// valid bytes remaining).
    pub fn copy_to(&self, cursor: &mut Cursor, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        let mut current = self.normalize(*cursor);
        while copied < dst.len() {
            let Some(block) = self.blocks.get(current.block) else { break };
            let available = &block.data()[current.offset..block.end()];
            let n = available.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&available[..n]);
            copied += n;
            current.offset += n;
            current = self.normalize(current);
        }
        *cursor = current;
        copied
    }

    /// Advances the cursor by up to `count` bytes without copying; returns
    /// how far it actually moved.
    pub fn skip(&self, cursor: &mut Cursor, count: usize) -> usize {
        let mut skipped = 0;
        let mut current = self.normalize(*cursor);
        while skipped < count {
            let Some(block) = self.blocks.get(current.block) else { break };
            let n = (block.end() - current.offset).min(count - skipped);
            skipped += n;
            current.offset += n;
            current = self.normalize(current);
        }
        *cursor = current;
        skipped
    }

    /// Valid bytes between two cursors. `from` must not come after `to`.
    pub fn distance(&self, from: Cursor, to: Cursor) -> usize {
        let from = self.normalize(from);
        let to = self.normalize(to);
        debug_assert!((from.block, from.offset) <= (to.block, to.offset));

        if from.block == to.block {
            return to.offset - from.offset;
        }
        let mut total = self.blocks.get(from.block).map_or(0, |b| b.end() - from.offset);
        for block in &self.blocks[from.block + 1..to.block.min(self.blocks.len())] {
            total += block.len();
        }
        if let Some(block) = self.blocks.get(to.block) {
            total += to.offset - block.start();
        }
        total
    }

    /// Copies `[from, to)` out as owned bytes.
    pub fn copy_range(&self, from: Cursor, to: Cursor) -> Bytes {
        let len = self.distance(from, to);
        let mut out = BytesMut::with_capacity(len);
        let mut current = self.normalize(from);
        let mut remaining = len;
        while remaining > 0 {
            let Some(block) = self.blocks.get(current.block) else { break };
            let available = &block.data()[current.offset..block.end()];
            let n = available.len().min(remaining);
            out.extend_from_slice(&available[..n]);
            remaining -= n;
            current.offset += n;
            current = self.normalize(current);
        }
        out.freeze()
    }

    /// Appends a byte slice to the chain tail, leasing new blocks from the
    /// pool as the current tail fills. Large appends split across blocks of
    /// at most the pool's large tier size.
    pub fn append(&mut self, pool: &BufferPool, mut src: &[u8]) {
        while !src.is_empty() {
            if self.blocks.last().map_or(0, Block::writable) == 0 {
                self.blocks.push(pool.lease(src.len().min(pool.large_block_size())));
            }
            let tail = self
                .blocks
                .last_mut()
                .unwrap_or_else(|| unreachable!("tail ensured above"));
            let n = tail.writable().min(src.len());
            tail.writable_mut()[..n].copy_from_slice(&src[..n]);
            tail.commit(n);
            src = &src[n..];
        }
    }

    /// Overwrites already-valid bytes starting at the cursor, advancing it.
    /// Stops at the chain end; returns how many bytes were written.
    pub fn put(&mut self, cursor: &mut Cursor, mut src: &[u8]) -> usize {
        let mut written = 0;
        let mut current = self.normalize(*cursor);
        while !src.is_empty() {
            let Some(block) = self.blocks.get_mut(current.block) else { break };
            let end = block.end();
            if current.offset >= end {
                current = self.normalize(current);
                continue;
            }
            let n = (end - current.offset).min(src.len());
            block.data_mut()[current.offset..current.offset + n].copy_from_slice(&src[..n]);
            written += n;
            current.offset += n;
            src = &src[n..];
            current = self.normalize(current);
        }
        *cursor = current;
        written
    }

    /// Ensures the tail block has at least `min_size` writable bytes and
    /// returns that writable region. Fresh bytes must be committed with
    /// [`commit_tail`](Self::commit_tail).
    pub fn tail_reserve(&mut self, pool: &BufferPool, min_size: usize) -> &mut [u8] {
        if self.blocks.last().map_or(0, Block::writable) < min_size {
            self.blocks.push(pool.lease(min_size));
        }
        self.blocks
            .last_mut()
            .unwrap_or_else(|| unreachable!("tail ensured above"))
            .writable_mut()
    }

    /// Marks `count` bytes written into the reserved tail region as valid.
    pub fn commit_tail(&mut self, count: usize) {
        debug_assert!(!self.blocks.is_empty() || count == 0);
        if let Some(tail) = self.blocks.last_mut() {
            tail.commit(count);
        }
    }

    pub fn push_block(&mut self, block: Block) {
        self.blocks.push(block);
    }

    /// Hands every block over to the caller, leaving the chain empty.
    /// Outstanding cursors are invalidated.
    pub fn take_blocks(&mut self) -> Vec<Block> {
        std::mem::take(&mut self.blocks)
    }

    /// Returns blocks fully consumed before `read` to the pool and rebases
    /// `read` onto the compacted chain. Any other cursor is invalidated.
    pub fn compact(&mut self, pool: &BufferPool, read: &mut Cursor) {
        let normalized = self.normalize(*read);
        for block in self.blocks.drain(..normalized.block.min(self.blocks.len())) {
            pool.reclaim(block);
        }
        if let Some(head) = self.blocks.first_mut() {
            head.consume_to(normalized.offset);
            *read = Cursor { block: 0, offset: normalized.offset };
        } else {
            *read = Cursor::default();
        }
    }

    /// Readable slices in order, for vectored writes.
    pub fn slices(&self) -> impl Iterator<Item = &[u8]> {
        self.blocks.iter().filter(|block| !block.is_empty()).map(Block::readable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pool with tiny blocks so a short append spans several of them.
    fn tiny_pool() -> BufferPool {
        BufferPool::with_block_sizes(8, 16)
    }

    fn chain_with(pool: &BufferPool, data: &[u8]) -> BlockChain {
        let mut chain = BlockChain::new();
        chain.append(pool, data);
        chain
    }

    #[test]
    fn append_and_read_back_across_blocks() {
        let pool = tiny_pool();
        let payload: Vec<u8> = (0u8..=63).collect();
        let chain = chain_with(&pool, &payload);
        assert!(chain.blocks.len() >= 3, "payload should span several blocks");
        assert_eq!(chain.len(), payload.len());

        let mut cursor = chain.begin();
        let mut out = vec![0u8; payload.len()];
        assert_eq!(chain.copy_to(&mut cursor, &mut out), payload.len());
        assert_eq!(out, payload);
        assert!(chain.is_end(cursor));
        assert_eq!(chain.distance(chain.begin(), chain.end()), payload.len());
    }

    #[test]
    fn take_walks_block_boundaries() {
        let pool = tiny_pool();
        let chain = chain_with(&pool, b"abcdefghij");
        let mut cursor = chain.begin();
        let mut collected = Vec::new();
        while let Some(byte) = chain.take(&mut cursor) {
            collected.push(byte);
        }
        assert_eq!(collected, b"abcdefghij");
        assert_eq!(chain.take(&mut cursor), None);
    }

    #[test]
    fn seek_single_candidate_across_boundary() {
        let pool = tiny_pool();
        // 8-byte blocks put the needle in the second block.
        let chain = chain_with(&pool, b"aaaaaaaaaaXbb");
        let mut cursor = chain.begin();
        assert_eq!(chain.seek(&mut cursor, b"X"), Some(b'X'));
        assert_eq!(chain.distance(chain.begin(), cursor), 10);
        assert_eq!(chain.peek(cursor), Some(b'X'));
    }

    #[test]
    fn seek_reports_which_candidate_matched() {
        let pool = tiny_pool();
        let chain = chain_with(&pool, b"some data\r\nrest");
        let mut cursor = chain.begin();
        assert_eq!(chain.seek(&mut cursor, b"\r\n"), Some(b'\r'));

        let mut cursor = chain.begin();
        assert_eq!(chain.seek(&mut cursor, b"?\n "), Some(b' '));
        assert_eq!(chain.distance(chain.begin(), cursor), 4);
    }

    #[test]
    fn seek_without_match_rests_at_end() {
        let pool = tiny_pool();
        let chain = chain_with(&pool, b"no match here");
        let mut cursor = chain.begin();
        assert_eq!(chain.seek(&mut cursor, b"X"), None);
        assert!(chain.is_end(cursor));
    }

    #[test]
    fn copy_to_partial_then_resume() {
        let pool = tiny_pool();
        let chain = chain_with(&pool, b"hello world");
        let mut cursor = chain.begin();

        let mut first = [0u8; 5];
        assert_eq!(chain.copy_to(&mut cursor, &mut first), 5);
        assert_eq!(&first, b"hello");

        let mut rest = [0u8; 16];
        let n = chain.copy_to(&mut cursor, &mut rest);
        assert_eq!(&rest[..n], b" world");
        assert!(chain.is_end(cursor));
    }

    #[test]
    fn copy_range_extracts_middle() {
        let pool = tiny_pool();
        let chain = chain_with(&pool, b"GET /index.html HTTP/1.1");
        let mut from = chain.begin();
        chain.seek(&mut from, b" ");
        chain.take(&mut from);
        let mut to = from;
        chain.seek(&mut to, b" ");
        assert_eq!(chain.copy_range(from, to).as_ref(), b"/index.html");
    }

    #[test]
    fn put_overwrites_in_place() {
        let pool = tiny_pool();
        let mut chain = chain_with(&pool, b"xxxxxxxxxxxx");
        let mut cursor = chain.begin();
        chain.skip(&mut cursor, 2);
        let mut write = cursor;
        assert_eq!(chain.put(&mut write, b"0123456789"), 10);

        let collected = chain.copy_range(chain.begin(), chain.end());
        assert_eq!(collected.as_ref(), b"xx0123456789");
    }

    #[test]
    fn put_stops_at_chain_end() {
        let pool = tiny_pool();
        let mut chain = chain_with(&pool, b"abc");
        let mut cursor = chain.begin();
        assert_eq!(chain.put(&mut cursor, b"123456"), 3);
        assert!(chain.is_end(cursor));
    }

    #[test]
    fn skip_advances_without_copying() {
        let pool = tiny_pool();
        let chain = chain_with(&pool, b"0123456789abcdef");
        let mut cursor = chain.begin();
        assert_eq!(chain.skip(&mut cursor, 12), 12);
        assert_eq!(chain.peek(cursor), Some(b'c'));
        assert_eq!(chain.skip(&mut cursor, 100), 4);
        assert!(chain.is_end(cursor));
    }

    #[test]
    fn compact_reclaims_consumed_blocks() {
        let pool = tiny_pool();
        let mut chain = chain_with(&pool, &[7u8; 40]);
        let blocks_before = chain.blocks.len();
        assert!(blocks_before >= 3);

        let mut read = chain.begin();
        chain.skip(&mut read, 20);
        chain.compact(&pool, &mut read);

        assert!(chain.blocks.len() < blocks_before);
        assert_eq!(chain.distance(read, chain.end()), 20);
        let (small, large) = pool.pooled_counts();
        assert!(small + large > 0, "consumed blocks go back to the pool");
    }

    #[test]
    fn compact_of_fully_consumed_chain_empties_it() {
        let pool = tiny_pool();
        let mut chain = chain_with(&pool, b"done");
        let mut read = chain.end();
        chain.compact(&pool, &mut read);
        assert!(chain.is_empty());
        assert_eq!(read, Cursor::default());
        assert!(chain.is_end(read));
    }

    #[test]
    fn tail_reserve_leases_when_tail_is_tight() {
        let pool = tiny_pool();
        let mut chain = BlockChain::new();
        let writable = chain.tail_reserve(&pool, 4);
        writable[..3].copy_from_slice(b"abc");
        chain.commit_tail(3);
        assert_eq!(chain.len(), 3);

        // 8-byte block has 5 writable left; asking for more forces a lease.
        let _ = chain.tail_reserve(&pool, 6);
        assert_eq!(chain.blocks.len(), 2);
        chain.commit_tail(0);
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn empty_blocks_are_invisible_to_cursors() {
        let pool = tiny_pool();
        let mut chain = BlockChain::new();
        chain.append(&pool, b"ab");
        chain.push_block(pool.lease(4));
        let mut tail = pool.lease(4);
        tail.writable_mut()[..2].copy_from_slice(b"cd");
        tail.commit(2);
        chain.push_block(tail);

        let mut cursor = chain.begin();
        let mut out = [0u8; 4];
        assert_eq!(chain.copy_to(&mut cursor, &mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(chain.distance(chain.begin(), chain.end()), 4);
    }

    #[test]
    fn is_end_tracks_new_data() {
        let pool = tiny_pool();
        let mut chain = BlockChain::new();
        let cursor = chain.begin();
        assert!(chain.is_end(cursor));

        chain.append(&pool, b"x");
        assert!(!chain.is_end(cursor), "old end cursor sees newly appended data");
    }
}
