//! Write-behind socket output.
//!
//! Response bytes are queued here and pushed to the socket by a dedicated
//! writer task, so the application continues producing while earlier bytes
//! are still in flight. A write completes as soon as the unconfirmed
//! backlog fits the configured budget; only past the budget does the
//! producer wait for the socket to catch up. This keeps small responses
//! free of write latency while still applying backpressure to a producer
//! that outruns a slow peer.
//!
//! A transport failure is recorded once: the first error aborts the
//! connection, fails every pending completion, and every later write
//! returns an error wrapping that original failure.

use crate::buffer::{Block, BlockChain, BufferPool};
use crate::codec::{chunk_crlf, encode_chunk_frame};
use crate::protocol::SendError;
use bytes::Bytes;
use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How many unconfirmed bytes a write may leave behind before it has to
/// wait for the socket.
pub const DEFAULT_WRITE_BEHIND_BUDGET: usize = 65536;

/// Upper bound on scatter-gather segments per socket write.
const MAX_WRITE_VECTORS: usize = 64;

enum OutItem {
    /// Caller-owned bytes, typically response payload.
    Owned(Bytes),
    /// A pooled block produced by [`ProducingSession`], handed back to the
    /// pool once written.
    Pooled(Block),
}

impl OutItem {
    fn readable(&self) -> &[u8] {
        match self {
            OutItem::Owned(bytes) => bytes,
            OutItem::Pooled(block) => block.readable(),
        }
    }

    fn len(&self) -> usize {
        self.readable().len()
    }
}

/// A queued completion. `target` is the confirmed-byte watermark that
/// releases it: `enqueued - budget` for budgeted writes, the full
/// `enqueued` for flushes.
struct Waiter {
    target: u64,
    tx: oneshot::Sender<Result<(), SendError>>,
}

struct OutputState {
    queue: VecDeque<OutItem>,
    /// Bytes ever queued.
    enqueued_total: u64,
    /// Bytes the socket has accepted.
    confirmed_total: u64,
    waiters: Vec<Waiter>,
    /// Set by [`SocketOutput::end`]; no further payload is accepted.
    completed: bool,
    /// First transport failure; sticky.
    failed: Option<Arc<io::Error>>,
}

impl OutputState {
    fn check_writable(&self) -> Result<(), SendError> {
        if let Some(source) = &self.failed {
            return Err(SendError::aborted(source));
        }
        if self.completed {
            return Err(SendError::io(io::Error::new(
                io::ErrorKind::NotConnected,
                "output already ended",
            )));
        }
        Ok(())
    }
}

/// The write side of one connection. Shared between the producing task and
/// the writer task it spawns.
pub struct SocketOutput {
    pool: Arc<BufferPool>,
    budget: usize,
    state: Mutex<OutputState>,
    work: Notify,
    abort: CancellationToken,
}

impl SocketOutput {
    pub fn new(pool: Arc<BufferPool>, abort: CancellationToken) -> Self {
        Self::with_budget(pool, DEFAULT_WRITE_BEHIND_BUDGET, abort)
    }

    /// A `budget` of zero makes every budgeted write wait for full
    /// confirmation.
    pub fn with_budget(pool: Arc<BufferPool>, budget: usize, abort: CancellationToken) -> Self {
        Self {
            pool,
            budget,
            state: Mutex::new(OutputState {
                queue: VecDeque::new(),
                enqueued_total: 0,
                confirmed_total: 0,
                waiters: Vec::new(),
                completed: false,
                failed: None,
            }),
            work: Notify::new(),
            abort,
        }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn is_failed(&self) -> bool {
        self.lock().failed.is_some()
    }

    /// Spawns the writer task that owns the socket's write half.
    pub fn spawn_writer<W>(self: &Arc<Self>, writer: W) -> JoinHandle<()>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(writer_loop(this, writer))
    }

    /// Queues `data` for the socket.
    ///
    /// With `immediate` the call completes once the unconfirmed backlog is
    /// within the budget, waiting for the socket if necessary. Without it
    /// the bytes are queued and the call returns at once regardless of
    /// backlog.
    pub async fn write(&self, data: Bytes, immediate: bool) -> Result<(), SendError> {
        if data.is_empty() {
            return Ok(());
        }
        let rx = {
            let mut state = self.lock();
            state.check_writable()?;
            state.enqueued_total += data.len() as u64;
            state.queue.push_back(OutItem::Owned(data));
            self.register(&mut state, immediate)
        };
        self.work.notify_one();
        self.await_waiter(rx).await
    }

    /// Queues one chunk frame: size line, payload, and closing CRLF count
    /// as a single completion. Empty payload is a no-op so a zero-size
    /// chunk can never terminate the body early.
    pub async fn write_chunked(&self, data: Bytes) -> Result<(), SendError> {
        if data.is_empty() {
            return Ok(());
        }
        let rx = {
            let mut state = self.lock();
            state.check_writable()?;
            let header = encode_chunk_frame(data.len());
            state.enqueued_total += (header.len() + data.len() + 2) as u64;
            state.queue.push_back(OutItem::Owned(header));
            state.queue.push_back(OutItem::Owned(data));
            state.queue.push_back(OutItem::Owned(chunk_crlf()));
            self.register(&mut state, true)
        };
        self.work.notify_one();
        self.await_waiter(rx).await
    }

    /// Waits until every queued byte has been accepted by the socket.
    pub async fn flush(&self) -> Result<(), SendError> {
        let rx = {
            let mut state = self.lock();
            if let Some(source) = &state.failed {
                return Err(SendError::aborted(source));
            }
            if state.confirmed_total >= state.enqueued_total {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let target = state.enqueued_total;
            state.waiters.push(Waiter { target, tx });
            rx
        };
        self.work.notify_one();
        self.await_waiter(Some(rx)).await
    }

    /// Flushes everything queued, then lets the writer task shut the write
    /// half down. No payload is accepted afterwards.
    pub async fn end(&self) -> Result<(), SendError> {
        let rx = {
            let mut state = self.lock();
            if let Some(source) = &state.failed {
                return Err(SendError::aborted(source));
            }
            state.completed = true;
            if state.confirmed_total >= state.enqueued_total {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let target = state.enqueued_total;
                state.waiters.push(Waiter { target, tx });
                Some(rx)
            }
        };
        self.work.notify_one();
        self.await_waiter(rx).await
    }

    /// Starts a producing session: a private chain of pooled blocks the
    /// caller fills before handing them to the queue in one step.
    pub fn producing_start(&self) -> ProducingSession {
        ProducingSession { chain: BlockChain::new() }
    }

    /// Queues every block the session produced. One completion covers them
    /// all, following the same budget rules as [`SocketOutput::write`].
    pub async fn producing_complete(
        &self,
        session: ProducingSession,
        immediate: bool,
    ) -> Result<(), SendError> {
        let mut chain = session.chain;
        let blocks = chain.take_blocks();
        let rx = {
            let mut state = self.lock();
            if let Err(err) = state.check_writable() {
                drop(state);
                for block in blocks {
                    self.pool.reclaim(block);
                }
                return Err(err);
            }
            for block in blocks {
                if block.is_empty() {
                    self.pool.reclaim(block);
                    continue;
                }
                state.enqueued_total += block.len() as u64;
                state.queue.push_back(OutItem::Pooled(block));
            }
            self.register(&mut state, immediate)
        };
        self.work.notify_one();
        self.await_waiter(rx).await
    }

    /// Returns a session's blocks to the pool without writing them.
    pub fn producing_cancel(&self, session: ProducingSession) {
        let mut chain = session.chain;
        for block in chain.take_blocks() {
            self.pool.reclaim(block);
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutputState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(
        &self,
        state: &mut OutputState,
        immediate: bool,
    ) -> Option<oneshot::Receiver<Result<(), SendError>>> {
        if !immediate {
            return None;
        }
        let backlog = state.enqueued_total - state.confirmed_total;
        if backlog <= self.budget as u64 {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        state
            .waiters
            .push(Waiter { target: state.enqueued_total.saturating_sub(self.budget as u64), tx });
        Some(rx)
    }

    async fn await_waiter(
        &self,
        rx: Option<oneshot::Receiver<Result<(), SendError>>>,
    ) -> Result<(), SendError> {
        match rx {
            None => Ok(()),
            Some(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(SendError::io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "socket writer task exited",
                ))),
            },
        }
    }

    /// Records confirmed bytes and releases every waiter whose watermark is
    /// reached. Returns whether the queue is drained.
    fn confirm(&self, written: u64) -> bool {
        let (ready, drained) = {
            let mut state = self.lock();
            state.confirmed_total += written;
            let confirmed = state.confirmed_total;
            let (ready, keep) =
                state.waiters.drain(..).partition::<Vec<_>, _>(|w| w.target <= confirmed);
            state.waiters = keep;
            (ready, state.queue.is_empty())
        };
        for waiter in ready {
            let _ = waiter.tx.send(Ok(()));
        }
        drained
    }

    /// First failure wins: records the error, fails every pending waiter
    /// with it, drops queued bytes, and aborts the connection. Later calls
    /// are no-ops so the abort fires exactly once.
    fn fail_with(&self, error: io::Error) {
        let (waiters, shared) = {
            let mut state = self.lock();
            if state.failed.is_some() {
                return;
            }
            let shared = Arc::new(error);
            state.failed = Some(Arc::clone(&shared));
            state.completed = true;
            while let Some(item) = state.queue.pop_front() {
                if let OutItem::Pooled(block) = item {
                    self.pool.reclaim(block);
                }
            }
            (std::mem::take(&mut state.waiters), shared)
        };
        debug!("socket output failed: {shared}");
        for waiter in waiters {
            let _ = waiter.tx.send(Err(SendError::aborted(&shared)));
        }
        self.abort.cancel();
    }

    /// Completes all remaining waiters after a clean shutdown.
    fn finish_waiters(&self) {
        let waiters = {
            let mut state = self.lock();
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.tx.send(Ok(()));
        }
    }

    fn next_step(&self) -> Step {
        let mut state = self.lock();
        if state.failed.is_some() {
            return Step::Exit;
        }
        if !state.queue.is_empty() {
            return Step::Write(state.queue.drain(..).collect());
        }
        if state.completed { Step::Shutdown } else { Step::Idle }
    }

    #[cfg(test)]
    fn totals(&self) -> (u64, u64) {
        let state = self.lock();
        (state.enqueued_total, state.confirmed_total)
    }
}

enum Step {
    Write(Vec<OutItem>),
    Shutdown,
    Idle,
    Exit,
}

async fn writer_loop<W>(this: Arc<SocketOutput>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    loop {
        match this.next_step() {
            Step::Write(batch) => {
                let result = tokio::select! {
                    result = drive_batch(&this, &mut writer, &batch) => result,
                    () = this.abort.cancelled() => Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "connection aborted",
                    )),
                };
                for item in batch {
                    if let OutItem::Pooled(block) = item {
                        this.pool.reclaim(block);
                    }
                }
                match result {
                    Ok(()) => {
                        if this.confirm(0) {
                            if let Err(err) = writer.flush().await {
                                this.fail_with(err);
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        this.fail_with(err);
                        return;
                    }
                }
            }
            Step::Shutdown => {
                if let Err(err) = writer.shutdown().await {
                    debug!("socket shutdown failed: {err}");
                }
                this.finish_waiters();
                return;
            }
            Step::Idle => {
                tokio::select! {
                    () = this.work.notified() => {}
                    () = this.abort.cancelled() => {
                        this.fail_with(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "connection aborted",
                        ));
                        return;
                    }
                }
            }
            Step::Exit => return,
        }
    }
}

/// Writes every batch item, coalescing them into vectored writes and
/// confirming bytes after each socket write so waiters release as soon as
/// their watermark is reached, not only once the whole batch lands.
async fn drive_batch<W>(this: &SocketOutput, writer: &mut W, batch: &[OutItem]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut index = 0;
    let mut offset = 0;
    while index < batch.len() {
        let written = {
            let mut slices = Vec::with_capacity((batch.len() - index).min(MAX_WRITE_VECTORS));
            for (i, item) in batch.iter().enumerate().skip(index).take(MAX_WRITE_VECTORS) {
                let data = item.readable();
                let data = if i == index { &data[offset..] } else { data };
                slices.push(IoSlice::new(data));
            }
            writer.write_vectored(&slices).await?
        };
        if written == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes"));
        }
        let mut remaining = written;
        while remaining > 0 {
            let left = batch[index].len() - offset;
            if remaining >= left {
                remaining -= left;
                index += 1;
                offset = 0;
            } else {
                offset += remaining;
                remaining = 0;
            }
        }
        this.confirm(written as u64);
    }
    Ok(())
}

/// Pooled blocks being filled by the producing task before they enter the
/// write queue. Lives outside the output lock; there is one producer.
pub struct ProducingSession {
    chain: BlockChain,
}

impl ProducingSession {
    pub fn chain_mut(&mut self) -> &mut BlockChain {
        &mut self.chain
    }

    /// `io::Write` adapter so formatted text (status lines, headers) lands
    /// directly in pooled blocks.
    pub fn writer<'a>(&'a mut self, pool: &'a BufferPool) -> ChainWriter<'a> {
        ChainWriter { chain: &mut self.chain, pool }
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

pub struct ChainWriter<'a> {
    chain: &'a mut BlockChain,
    pool: &'a BufferPool,
}

impl io::Write for ChainWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.chain.append(self.pool, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
