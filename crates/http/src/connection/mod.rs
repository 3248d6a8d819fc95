//! Connection lifecycle: socket pumps on both ends, request processing in
//! between.
//!
//! # Architecture
//!
//! A [`Connection`] owns one accepted stream, split into halves:
//!
//! - the **receive pump** (a spawned task) leases pooled blocks, fills them
//!   from the read half and attaches them to the [`SocketInput`] queue;
//! - the **writer task** drains the [`SocketOutput`] queue to the write half
//!   with vectored writes, confirming bytes as the socket accepts them;
//! - [`Connection::serve`] drives the [`ServerContext`] request loop between
//!   the two queues until a request decides the connection is done.
//!
//! Both pumps watch the connection's cancellation token, so an abort from
//! either direction (transport failure, handler abort, server shutdown)
//! stops all three parties without a rendezvous.
//!
//! [`SocketInput`]: input::SocketInput
//! [`SocketOutput`]: output::SocketOutput

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::buffer::{BufferPool, SMALL_BLOCK_SIZE};
use crate::handler::Handler;
use crate::server::{DateService, ServerConfig};

mod body;
mod context;
mod input;
mod output;

pub use context::{ConnectionInfo, ServerContext};

pub(crate) use context::RequestOutcome;
pub(crate) use output::DEFAULT_WRITE_BEHIND_BUDGET;

use input::SocketInput;
use output::SocketOutput;

/// One accepted stream being served.
///
/// Dropping a `Connection` mid-serve leaks nothing: the pump tasks hold
/// their own handles on the queues and stop on cancellation or transport
/// end.
pub struct Connection {
    context: ServerContext,
    output: Arc<SocketOutput>,
    abort: CancellationToken,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Connection {
    /// Splits `stream` and starts the receive pump and writer task. The
    /// connection is idle until [`serve`](Self::serve) is called.
    ///
    /// Cancelling `abort` tears the connection down mid-request; the server
    /// hands every connection a child of its stop token so a stuck shutdown
    /// can cut them all loose at once.
    pub fn new<S>(
        info: ConnectionInfo,
        stream: S,
        date: Arc<DateService>,
        config: &ServerConfig,
        abort: CancellationToken,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let pool = Arc::new(BufferPool::new());
        let input = Arc::new(SocketInput::new(Arc::clone(&pool)));
        let output = Arc::new(SocketOutput::with_budget(
            pool,
            config.write_behind_budget,
            abort.clone(),
        ));
        let (read_half, write_half) = tokio::io::split(stream);
        let reader_task = spawn_receive_pump(Arc::clone(&input), read_half, abort.clone());
        let writer_task = output.spawn_writer(write_half);
        let context =
            ServerContext::new(info, input, Arc::clone(&output), abort.clone(), date, config);
        Self { context, output, abort, reader_task, writer_task }
    }

    /// Processes requests until the peer stops sending, a request closes the
    /// connection or something aborts it, then tears the pumps down.
    pub async fn serve<H>(mut self, handler: Arc<H>)
    where
        H: Handler + ?Sized,
    {
        loop {
            match self.context.process_request(handler.as_ref()).await {
                RequestOutcome::KeepAlive => {}
                RequestOutcome::Close => {
                    if let Err(err) = self.output.end().await {
                        debug!("connection close incomplete: {err}");
                    }
                    break;
                }
                RequestOutcome::Aborted => {
                    self.abort.cancel();
                    break;
                }
            }
        }
        self.shutdown().await;
    }

    /// Stops the pump tasks and waits them out. The writer has already
    /// drained or discarded its queue by the time this returns.
    async fn shutdown(self) {
        self.abort.cancel();
        let _ = self.reader_task.await;
        let _ = self.writer_task.await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connection_id", &self.context.connection_id())
            .finish_non_exhaustive()
    }
}

/// Reads the socket into pooled blocks until end of stream, transport
/// failure or cancellation, attaching each filled block to the input queue.
fn spawn_receive_pump<R>(
    input: Arc<SocketInput>,
    mut reader: R,
    abort: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let mut block = input.incoming_start(SMALL_BLOCK_SIZE);
            let read = tokio::select! {
                read = reader.read(block.writable_mut()) => read,
                () = abort.cancelled() => {
                    input.incoming_complete(
                        block,
                        0,
                        Err(io::Error::new(io::ErrorKind::ConnectionAborted, "connection aborted")),
                    );
                    return;
                }
            };
            match read {
                Ok(0) => {
                    input.incoming_complete(block, 0, Ok(()));
                    input.finish();
                    return;
                }
                Ok(count) => {
                    block.commit(count);
                    input.incoming_complete(block, count, Ok(()));
                }
                Err(err) => {
                    trace!(kind = ?err.kind(), "receive pump stopping on transport error");
                    input.incoming_complete(block, 0, Err(err));
                    return;
                }
            }
        }
    })
}
