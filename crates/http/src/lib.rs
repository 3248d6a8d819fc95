//! An asynchronous HTTP/1.x server engine
//!
//! This crate is the protocol core of a small HTTP server: pooled block
//! buffers, incremental parsing, request body framing and write-behind
//! response output, glued together by a per-connection serve loop. It has no
//! router, no middleware and no TLS; every parsed request goes to one
//! application callback, and what that callback writes goes back out on the
//! socket.
//!
//! # Features
//!
//! - HTTP/1.0 and HTTP/1.1 framing: `Content-Length` and chunked bodies,
//!   keep-alive and pipelining, `Expect: 100-continue`
//! - Pooled block buffers: socket reads and response serialization run over
//!   reused fixed-size blocks instead of per-request allocations
//! - Write-behind output: handlers keep producing while earlier bytes are
//!   still flushing, up to a per-connection budget
//! - Status, headers and lifecycle hooks stay mutable until the first body
//!   write forces the response head onto the wire
//! - Graceful stop with a grace period for in-flight requests
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use futures::FutureExt;
//! use petrel_http::connection::ServerContext;
//! use petrel_http::handler::make_handler;
//! use petrel_http::server::Server;
//! use tracing::Level;
//! use tracing_subscriber::FmtSubscriber;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
//!     tracing::subscriber::set_global_default(subscriber)?;
//!
//!     let handler = make_handler(|ctx: &mut ServerContext| {
//!         async move {
//!             let greeting = format!("hello from {}\r\n", ctx.path());
//!             ctx.write(Bytes::from(greeting)).await?;
//!             Ok(())
//!         }
//!         .boxed()
//!     });
//!
//!     let server = Server::builder().address("http://localhost:8080/").build()?;
//!     server.run(handler)?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - [`buffer`]: pooled fixed-size blocks and the chain/cursor views over them
//! - [`codec`]: incremental HTTP/1.x parsers and chunked framing
//! - [`protocol`]: protocol-level types and the error taxonomy
//! - [`connection`]: the per-connection engine: input queue, output queue
//!   and the serve loop that drives one request at a time
//! - [`handler`]: the application callback boundary
//! - [`server`]: listeners, the accept loop, configuration and graceful stop
//!
//! # Request lifecycle
//!
//! A receive pump reads the socket into pooled blocks and queues them on the
//! connection's input. The serve loop parses a request line and headers
//! straight out of that queue, decides body framing and keep-alive, and
//! calls the handler with a [`connection::ServerContext`]. The context reads
//! the request body on demand and writes the response through the output
//! queue, which serializes the head on the first write and lets body bytes
//! accumulate write-behind while a writer task flushes them. When the
//! handler returns, the response is completed (missing framing filled in,
//! declared lengths verified), the remaining request body is drained, and
//! the loop either goes around for the next pipelined request or closes.
//!
//! # Limitations
//!
//! - HTTP/1.x only; no HTTP/2 or HTTP/3
//! - No TLS in-tree: terminate it in a
//!   [`server::ConnectionFilter`] or a fronting proxy
//! - No routing or middleware; one handler serves the whole server
//! - Malformed requests are answered by closing the connection, never with
//!   a 400

pub mod buffer;
pub mod codec;
pub mod connection;
pub mod handler;
pub mod protocol;
pub mod server;

mod utils;
