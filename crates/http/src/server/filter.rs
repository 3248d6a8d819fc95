//! Pluggable wrapping of accepted connections.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::connection::ConnectionInfo;

/// A byte stream a connection can be served over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Receives each accepted stream before the engine reads from it.
///
/// This is the seam for TLS termination or connection-level inspection: the
/// filter gets the raw stream, usually handshakes on it, and returns the
/// stream the engine should actually serve. Returning an error drops the
/// connection without a response.
#[async_trait]
pub trait ConnectionFilter: Send + Sync {
    async fn wrap(
        &self,
        stream: Box<dyn Transport>,
        info: &ConnectionInfo,
    ) -> io::Result<Box<dyn Transport>>;
}
