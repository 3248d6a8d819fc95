//! Pooled buffer management for connection I/O.
//!
//! Network receives land directly in fixed-size [`Block`]s leased from a
//! shared [`BufferPool`]; parsing and response framing walk the resulting
//! [`BlockChain`] with value-type [`Cursor`]s instead of copying bytes into
//! a contiguous backlog.
//!
//! # Architecture
//!
//! - [`BufferPool`]: global, thread-safe lease/reclaim of blocks in a small
//!   (4 KiB) and a large (16 KiB) tier, with one-off allocations above that.
//! - [`Block`]: fixed storage plus `start`/`end` bounds for the valid bytes.
//! - [`BlockChain`]: an ordered chain of blocks presenting one logical byte
//!   string; cursors scan it (`seek`, `take`, `copy_to`, `distance`) without
//!   the chain ever moving data around.
//!
//! Cursors are invalidated when their chain compacts consumed blocks away or
//! hands blocks to a writer; owners only do either at consuming boundaries,
//! so scanning code never observes a cursor going stale.

mod chain;
mod pool;

pub use chain::BlockChain;
pub use chain::Cursor;
pub use pool::Block;
pub use pool::BufferPool;
pub use pool::LARGE_BLOCK_SIZE;
pub use pool::SMALL_BLOCK_SIZE;
