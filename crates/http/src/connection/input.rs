//! The receive queue between a socket pump and the request parser.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::trace;

use crate::buffer::{Block, BlockChain, BufferPool, Cursor};
use crate::protocol::ParseError;

/// Single-producer / single-consumer byte queue over pooled blocks.
///
/// The receive pump leases a block with [`incoming_start`], fills it from the
/// socket, and attaches it with [`incoming_complete`]. The parser side scans
/// the buffered chain through [`consume`] and suspends on [`ready`] when it
/// has examined everything without making progress.
///
/// The producer never waits for the consumer; a transport failure is sticky
/// and surfaces from every later consumer await. A zero-byte completion with
/// the connection still open wakes nobody and does not mean end of stream;
/// only [`finish`] marks the remote side as done.
///
/// [`incoming_start`]: Self::incoming_start
/// [`incoming_complete`]: Self::incoming_complete
/// [`consume`]: Self::consume
/// [`ready`]: Self::ready
/// [`finish`]: Self::finish
#[derive(Debug)]
pub struct SocketInput {
    pool: Arc<BufferPool>,
    state: Mutex<InputState>,
    ready: Notify,
}

#[derive(Debug)]
struct InputState {
    chain: BlockChain,
    read_pos: Cursor,
    /// Cumulative bytes ever attached by the producer.
    received_total: u64,
    /// Watermark of bytes the consumer has looked at. `ready` only reports
    /// data when the producer has attached bytes beyond this point, so an
    /// incomplete parse does not spin on the same buffered prefix.
    examined_total: u64,
    completed: bool,
    failed: Option<(io::ErrorKind, String)>,
}

impl SocketInput {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            state: Mutex::new(InputState {
                chain: BlockChain::new(),
                read_pos: Cursor::default(),
                received_total: 0,
                examined_total: 0,
                completed: false,
                failed: None,
            }),
            ready: Notify::new(),
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Leases a block with at least `min_size` writable bytes for the next
    /// receive. Also compacts the chain when the consumer has caught up, so
    /// idle keep-alive connections do not pin consumed blocks.
    pub fn incoming_start(&self, min_size: usize) -> Block {
        {
            let mut state = self.lock();
            if state.chain.is_end(state.read_pos) {
                let mut read_pos = state.read_pos;
                state.chain.compact(&self.pool, &mut read_pos);
                state.read_pos = read_pos;
            }
        }
        self.pool.lease(min_size)
    }

    /// Attaches `count` received bytes (already committed into `block`).
    ///
    /// An `Err` records the transport failure. `count == 0` with `Ok` keeps
    /// the consumer suspended; the block goes straight back to the pool.
    pub fn incoming_complete(&self, block: Block, count: usize, result: io::Result<()>) {
        debug_assert_eq!(block.len(), count);
        let wake = {
            let mut state = self.lock();
            if count > 0 {
                state.chain.push_block(block);
                state.received_total += count as u64;
            } else {
                self.pool.reclaim(block);
            }
            if let Err(error) = result {
                trace!(cause = %error, "socket input recording transport failure");
                if state.failed.is_none() {
                    state.failed = Some((error.kind(), error.to_string()));
                }
                true
            } else {
                count > 0
            }
        };
        if wake {
            self.ready.notify_one();
        }
    }

    /// Marks the remote side as done sending (FIN). Buffered bytes stay
    /// readable; after they drain, consumer awaits report end of stream.
    pub fn finish(&self) {
        self.lock().completed = true;
        self.ready.notify_one();
    }

    /// Poisons the queue, e.g. on connection abort. Idempotent: the first
    /// recorded failure wins.
    pub fn fail(&self, kind: io::ErrorKind, reason: &str) {
        {
            let mut state = self.lock();
            if state.failed.is_none() {
                state.failed = Some((kind, reason.to_string()));
            }
        }
        self.ready.notify_one();
    }

    /// Suspends until bytes beyond the examined watermark arrive.
    ///
    /// Returns `Ok(true)` when unexamined data is buffered, `Ok(false)` on a
    /// drained end of stream, and the sticky failure as `Err`.
    pub async fn ready(&self) -> Result<bool, ParseError> {
        loop {
            {
                let state = self.lock();
                if let Some((kind, reason)) = &state.failed {
                    return Err(ParseError::io(io::Error::new(*kind, reason.clone())));
                }
                if state.received_total > state.examined_total {
                    return Ok(true);
                }
                if state.completed {
                    return Ok(false);
                }
            }
            self.ready.notified().await;
        }
    }

    /// Opens a consuming pass over the buffered bytes.
    ///
    /// The returned guard keeps the producer from attaching concurrently, so
    /// consumers must not hold it across an await point; scan, then call
    /// [`InputConsumer::complete`] (or drop the guard to leave state as-is).
    pub fn consume(&self) -> InputConsumer<'_> {
        InputConsumer { state: self.lock(), pool: &self.pool }
    }

    fn lock(&self) -> MutexGuard<'_, InputState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One synchronous consuming pass; see [`SocketInput::consume`].
#[derive(Debug)]
pub struct InputConsumer<'a> {
    state: MutexGuard<'a, InputState>,
    pool: &'a BufferPool,
}

impl InputConsumer<'_> {
    pub fn chain(&self) -> &BlockChain {
        &self.state.chain
    }

    /// Current read position: the first byte not yet consumed.
    pub fn read_pos(&self) -> Cursor {
        self.state.read_pos
    }

    /// True when the remote side finished sending.
    pub fn is_completed(&self) -> bool {
        self.state.completed
    }

    pub fn failure(&self) -> Option<io::Error> {
        self.state.failed.as_ref().map(|(kind, reason)| io::Error::new(*kind, reason.clone()))
    }

    /// Commits this pass: bytes before `consumed` are gone for good, bytes
    /// before `examined` do not count as "new" for the next [`ready`] await.
    ///
    /// `consumed` must not pass `examined`. Fully consumed blocks return to
    /// the pool here, which invalidates every cursor except the rebased read
    /// position.
    ///
    /// [`ready`]: SocketInput::ready
    pub fn complete(mut self, consumed: Cursor, examined: Cursor) {
        // distance() checks consumed <= examined in debug builds
        let _ = self.state.chain.distance(consumed, examined);
        let unexamined = self.state.chain.distance(examined, self.state.chain.end()) as u64;
        self.state.examined_total = self.state.received_total - unexamined;

        let mut read_pos = consumed;
        self.state.chain.compact(self.pool, &mut read_pos);
        self.state.read_pos = read_pos;
    }
}
