//! Request body reading.
//!
//! [`MessageBody`] wraps the socket input with the framing the request
//! negotiated: a fixed Content-Length, chunked transfer coding, no body at
//! all, or read-until-close for HTTP/1.0. The application reads through it
//! without knowing which strategy is active; the body reports end-of-body
//! as a zero-length read and surfaces connection aborts as I/O errors.

use crate::buffer::Cursor;
use crate::codec::{ChunkStep, ChunkedReader};
use crate::connection::input::SocketInput;
use crate::connection::output::SocketOutput;
use crate::protocol::{BodyKind, ParseError};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Scratch size for draining an unread body.
const DRAIN_BUF_SIZE: usize = 4096;

enum BodyProgress {
    Empty,
    Length { remaining: u64 },
    Chunked { decoder: ChunkedReader },
    UntilClose { finished: bool },
}

/// One request's body reader. Created per request and discarded on reset.
pub struct MessageBody {
    progress: BodyProgress,
    input: Arc<SocketInput>,
    output: Arc<SocketOutput>,
    abort: CancellationToken,
    send_continue: bool,
}

impl MessageBody {
    /// `expects_continue` schedules an interim `100 Continue` to be written
    /// right before the first read; a request whose body is never read
    /// never triggers it.
    pub fn new(
        kind: BodyKind,
        input: Arc<SocketInput>,
        output: Arc<SocketOutput>,
        expects_continue: bool,
        abort: CancellationToken,
    ) -> Self {
        let progress = match kind {
            BodyKind::Empty => BodyProgress::Empty,
            BodyKind::Length(n) => BodyProgress::Length { remaining: n },
            BodyKind::Chunked => BodyProgress::Chunked { decoder: ChunkedReader::new() },
            BodyKind::UntilClose => BodyProgress::UntilClose { finished: false },
        };
        let send_continue = expects_continue && !matches!(progress, BodyProgress::Empty);
        Self { progress, input, output, abort, send_continue }
    }

    pub fn is_consumed(&self) -> bool {
        match &self.progress {
            BodyProgress::Empty => true,
            BodyProgress::Length { remaining } => *remaining == 0,
            BodyProgress::Chunked { decoder } => decoder.is_finished(),
            BodyProgress::UntilClose { finished } => *finished,
        }
    }

    /// Reads body payload into `dst`, waiting for the socket when nothing
    /// is buffered. Returns `Ok(0)` at end of body. A connection abort
    /// fails the read with an I/O-kind error; a transport close before the
    /// framing completes is [`ParseError::UnexpectedEnd`].
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize, ParseError> {
        if dst.is_empty() || self.is_consumed() {
            return Ok(0);
        }
        self.check_aborted()?;
        self.send_continue_if_needed().await?;

        loop {
            let has_bytes = tokio::select! {
                ready = self.input.ready() => ready?,
                () = self.abort.cancelled() => return Err(aborted_error()),
            };
            if let Some(copied) = self.step(dst, has_bytes)? {
                return Ok(copied);
            }
        }
    }

    /// Non-waiting variant of [`MessageBody::read`]: copies only what is
    /// already buffered and returns `Ok(0)` when nothing is.
    pub fn try_read(&mut self, dst: &mut [u8]) -> Result<usize, ParseError> {
        if dst.is_empty() || self.is_consumed() {
            return Ok(0);
        }
        self.check_aborted()?;

        let (has_buffered, completed) = {
            let consumer = self.input.consume();
            if let Some(err) = consumer.failure() {
                return Err(ParseError::io(err));
            }
            let chain = consumer.chain();
            let buffered = chain.distance(consumer.read_pos(), chain.end()) > 0;
            (buffered, consumer.is_completed())
        };
        if !has_buffered && !completed {
            return Ok(0);
        }
        match self.step(dst, has_buffered)? {
            Some(copied) => Ok(copied),
            None => Ok(0),
        }
    }

    /// Consumes whatever remains of the body, discarding the bytes. Used
    /// before connection reuse when the application returned without
    /// reading to the end.
    pub async fn drain(&mut self) -> Result<(), ParseError> {
        if matches!(self.progress, BodyProgress::UntilClose { .. }) {
            // nothing to realign; a read-until-close connection never
            // carries another request
            return Ok(());
        }
        // discarding the body; inviting more of it with a 100 would be
        // pointless
        self.send_continue = false;
        let mut scratch = [0u8; DRAIN_BUF_SIZE];
        while self.read(&mut scratch).await? > 0 {}
        Ok(())
    }

    /// One consume pass against the buffered input. `Ok(None)` means no
    /// payload was produced and the caller should wait for more bytes.
    fn step(&mut self, dst: &mut [u8], has_bytes: bool) -> Result<Option<usize>, ParseError> {
        let consumer = self.input.consume();
        let chain = consumer.chain();
        let mut pos: Cursor = consumer.read_pos();

        match &mut self.progress {
            BodyProgress::Empty => Ok(Some(0)),
            BodyProgress::Length { remaining } => {
                if !has_bytes {
                    return Err(ParseError::UnexpectedEnd);
                }
                let cap = usize::try_from(*remaining).unwrap_or(usize::MAX).min(dst.len());
                let copied = chain.copy_to(&mut pos, &mut dst[..cap]);
                if copied == 0 {
                    let end = chain.end();
                    consumer.complete(pos, end);
                    return Ok(None);
                }
                *remaining -= copied as u64;
                consumer.complete(pos, pos);
                Ok(Some(copied))
            }
            BodyProgress::Chunked { decoder } => match decoder.decode(chain, &mut pos, dst) {
                Ok(ChunkStep::Data(copied)) => {
                    consumer.complete(pos, pos);
                    Ok(Some(copied))
                }
                Ok(ChunkStep::Finished) => {
                    consumer.complete(pos, pos);
                    Ok(Some(0))
                }
                Ok(ChunkStep::NeedMore) => {
                    if !has_bytes {
                        return Err(ParseError::UnexpectedEnd);
                    }
                    let end = chain.end();
                    consumer.complete(pos, end);
                    Ok(None)
                }
                Err(err) => Err(err),
            },
            BodyProgress::UntilClose { finished } => {
                if !has_bytes {
                    *finished = true;
                    return Ok(Some(0));
                }
                let copied = chain.copy_to(&mut pos, dst);
                consumer.complete(pos, pos);
                if copied == 0 { Ok(None) } else { Ok(Some(copied)) }
            }
        }
    }

    async fn send_continue_if_needed(&mut self) -> Result<(), ParseError> {
        if !self.send_continue {
            return Ok(());
        }
        // fire once, even if the write fails
        self.send_continue = false;
        self.output
            .write(Bytes::from_static(CONTINUE_RESPONSE), false)
            .await
            .map_err(|err| ParseError::io(io::Error::new(io::ErrorKind::BrokenPipe, err)))
    }

    fn check_aborted(&self) -> Result<(), ParseError> {
        if self.abort.is_cancelled() { Err(aborted_error()) } else { Ok(()) }
    }
}

pub(crate) fn aborted_error() -> ParseError {
    ParseError::io(io::Error::new(io::ErrorKind::ConnectionAborted, "request aborted"))
}
