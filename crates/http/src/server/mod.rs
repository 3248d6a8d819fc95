//! Listener setup, the accept loop and graceful stop.
//!
//! A [`Server`] is configured through [`Server::builder`], bound with
//! [`Server::start`] and stopped through its shutdown token or
//! [`RunningServer::stop`]. Stopping is graceful: accepting ends at once,
//! connections already being served get [`ServerConfig::shutdown_timeout`]
//! to finish before they are aborted.

mod address;
mod config;
mod date;
mod filter;

pub use address::{AddressError, ServerAddress};
pub use config::{ServerConfig, default_worker_threads};
pub use date::DateService;
pub use filter::{ConnectionFilter, Transport};

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, trace, warn};

use crate::connection::{Connection, ConnectionInfo};
use crate::handler::Handler;

/// Errors surfaced while building or starting a [`Server`].
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("at least one listening address must be set")]
    MissingAddress,
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("binding {address} failed, cause: {source}")]
    Bind { address: ServerAddress, source: io::Error },
    #[error("building the server runtime failed, cause: {0}")]
    Runtime(io::Error),
}

/// Configures a [`Server`] before it starts.
pub struct ServerBuilder {
    addresses: Vec<String>,
    config: ServerConfig,
    filter: Option<Arc<dyn ConnectionFilter>>,
}

impl ServerBuilder {
    fn new() -> Self {
        Self { addresses: Vec::new(), config: ServerConfig::default(), filter: None }
    }

    /// Adds a listening address in `scheme://host:port/` form; see
    /// [`ServerAddress`] for how hosts resolve.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.addresses.push(address.into());
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Installs a filter that wraps every accepted stream, the hook for TLS
    /// termination and similar collaborators.
    pub fn connection_filter(mut self, filter: impl ConnectionFilter + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn build(self) -> Result<Server, ServerError> {
        if self.addresses.is_empty() {
            return Err(ServerError::MissingAddress);
        }
        let addresses = self
            .addresses
            .iter()
            .map(|address| address.parse())
            .collect::<Result<Vec<ServerAddress>, _>>()?;
        Ok(Server {
            addresses,
            config: self.config,
            filter: self.filter,
            shutdown: CancellationToken::new(),
        })
    }
}

/// The engine entry point: binds the configured addresses and serves every
/// accepted connection with one [`Handler`].
pub struct Server {
    addresses: Vec<ServerAddress>,
    config: ServerConfig,
    filter: Option<Arc<dyn ConnectionFilter>>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Token that stops this server when cancelled, usable before and after
    /// [`start`](Self::start).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Binds every configured address and starts accepting connections.
    ///
    /// Must be called within a tokio runtime. The returned handle reports
    /// the bound addresses (useful with port `0`) and stops or waits out the
    /// server.
    pub async fn start<H>(self, handler: H) -> Result<RunningServer, ServerError>
    where
        H: Handler + 'static,
    {
        let Server { addresses, config, filter, shutdown } = self;
        let handler = Arc::new(handler);
        let date = Arc::new(DateService::new());

        let mut bound = Vec::with_capacity(addresses.len());
        let mut local_addrs = Vec::with_capacity(addresses.len());
        for address in addresses {
            let listener = TcpListener::bind(address.bind_addr())
                .await
                .map_err(|source| ServerError::Bind { address: address.clone(), source })?;
            let local = listener
                .local_addr()
                .map_err(|source| ServerError::Bind { address: address.clone(), source })?;
            info!(address = %address, local = %local, "listening");
            local_addrs.push(local);
            bound.push((address, listener));
        }

        let connections = TaskTracker::new();
        let connection_abort = CancellationToken::new();
        let next_id = Arc::new(AtomicU64::new(1));
        let acceptors = TaskTracker::new();
        for (address, listener) in bound {
            let acceptor = Acceptor {
                address,
                handler: Arc::clone(&handler),
                filter: filter.clone(),
                config: config.clone(),
                date: Arc::clone(&date),
                next_id: Arc::clone(&next_id),
                connections: connections.clone(),
                connection_abort: connection_abort.clone(),
                shutdown: shutdown.clone(),
            };
            acceptors.spawn(acceptor.run(listener));
        }
        acceptors.close();

        Ok(RunningServer {
            local_addrs,
            shutdown,
            connection_abort,
            acceptors,
            connections,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Builds a multi-thread runtime sized by
    /// [`ServerConfig::worker_threads`] and serves on it until the shutdown
    /// token is cancelled.
    pub fn run<H>(self, handler: H) -> Result<(), ServerError>
    where
        H: Handler + 'static,
    {
        let workers = self.config.worker_threads;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .enable_all()
            .build()
            .map_err(ServerError::Runtime)?;
        runtime.block_on(async {
            self.start(handler).await?.wait().await;
            Ok(())
        })
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server").field("addresses", &self.addresses).finish_non_exhaustive()
    }
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder").field("addresses", &self.addresses).finish_non_exhaustive()
    }
}

/// A started [`Server`]: the accept loops and the connections behind them.
pub struct RunningServer {
    local_addrs: Vec<SocketAddr>,
    shutdown: CancellationToken,
    connection_abort: CancellationToken,
    acceptors: TaskTracker,
    connections: TaskTracker,
    shutdown_timeout: Duration,
}

impl RunningServer {
    /// Addresses actually bound, with ephemeral ports resolved.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Token that stops this server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signals shutdown and waits for the server to finish.
    pub async fn stop(self) {
        self.shutdown.cancel();
        self.wait().await;
    }

    /// Waits until the server has stopped: accepting has ended and every
    /// connection finished, or was aborted once the grace period ran out.
    pub async fn wait(self) {
        self.acceptors.wait().await;
        self.connections.close();
        if timeout(self.shutdown_timeout, self.connections.wait()).await.is_err() {
            warn!(open = self.connections.len(), "graceful stop timed out, aborting connections");
            self.connection_abort.cancel();
            self.connections.wait().await;
        }
        info!("server stopped");
    }
}

impl fmt::Debug for RunningServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningServer")
            .field("local_addrs", &self.local_addrs)
            .finish_non_exhaustive()
    }
}

/// Accept loop state for one listener.
struct Acceptor<H: ?Sized> {
    address: ServerAddress,
    handler: Arc<H>,
    filter: Option<Arc<dyn ConnectionFilter>>,
    config: ServerConfig,
    date: Arc<DateService>,
    next_id: Arc<AtomicU64>,
    connections: TaskTracker,
    connection_abort: CancellationToken,
    shutdown: CancellationToken,
}

impl<H> Acceptor<H>
where
    H: Handler + ?Sized + 'static,
{
    /// Accepts until shutdown, spawning one serving task per connection.
    async fn run(self, listener: TcpListener) {
        loop {
            let accepted = select! {
                accepted = listener.accept() => accepted,
                () = self.shutdown.cancelled() => return,
            };
            let (stream, remote_addr) = match accepted {
                Ok(stream_and_addr) => stream_and_addr,
                Err(e) => {
                    warn!(cause = %e, "failed to accept");
                    continue;
                }
            };
            self.spawn_connection(stream, remote_addr);
        }
    }

    fn spawn_connection(&self, stream: TcpStream, remote_addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut info = ConnectionInfo::new(id, self.address.scheme());
        info.remote_addr = Some(remote_addr);
        info.local_addr = stream.local_addr().ok();
        trace!(connection = id, remote = %remote_addr, "connection accepted");

        let handler = Arc::clone(&self.handler);
        let filter = self.filter.clone();
        let date = Arc::clone(&self.date);
        let config = self.config.clone();
        let abort = self.connection_abort.child_token();
        self.connections.spawn(async move {
            match filter {
                Some(filter) => match filter.wrap(Box::new(stream), &info).await {
                    Ok(stream) => {
                        Connection::new(info, stream, date, &config, abort).serve(handler).await;
                    }
                    Err(e) => {
                        warn!(connection = id, "connection filter rejected the stream, cause: {e}");
                    }
                },
                None => Connection::new(info, stream, date, &config, abort).serve(handler).await,
            }
        });
    }
}
