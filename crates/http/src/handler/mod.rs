//! The boundary between the engine and application code.
//!
//! A [`Handler`] is called once per request with mutable access to the
//! connection's [`ServerContext`]; it reads the request through the context
//! and produces the response through it. [`make_handler`] adapts a plain
//! closure, for applications that do not want a named type:
//!
//! ```no_run
//! use futures::FutureExt;
//! use petrel_http::connection::ServerContext;
//! use petrel_http::handler::make_handler;
//!
//! let handler = make_handler(|ctx: &mut ServerContext| {
//!     async move {
//!         ctx.write(bytes::Bytes::from_static(b"hello")).await?;
//!         Ok(())
//!     }
//!     .boxed()
//! });
//! ```

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::connection::ServerContext;
use crate::protocol::BoxError;

/// Application entry point, called once per request.
///
/// Returning `Err` before anything was written produces a plain 500
/// response; returning `Err` after response bytes may have reached the peer
/// aborts the connection instead.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &mut ServerContext) -> Result<(), BoxError>;
}

#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: for<'a> Fn(&'a mut ServerContext) -> BoxFuture<'a, Result<(), BoxError>> + Send + Sync,
{
    async fn handle(&self, ctx: &mut ServerContext) -> Result<(), BoxError> {
        (self.f)(ctx).await
    }
}

/// Wraps a closure as a [`Handler`]. The closure returns a boxed future so
/// it can borrow the context it was handed.
pub fn make_handler<F>(f: F) -> HandlerFn<F>
where
    F: for<'a> Fn(&'a mut ServerContext) -> BoxFuture<'a, Result<(), BoxError>> + Send + Sync,
{
    HandlerFn { f }
}
