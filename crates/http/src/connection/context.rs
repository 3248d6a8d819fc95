//! Per-request protocol state and response production for one connection.

use std::fmt;
use std::future::Future;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use http::header::{CONNECTION, CONTENT_LENGTH, DATE, SERVER, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};
use tokio::select;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::codec::{
    HeaderLimits, HeadersProgress, StartLineProgress, StartLineStatus, take_message_headers,
    take_start_line, terminal_chunk,
};
use crate::connection::body::{MessageBody, aborted_error};
use crate::connection::input::SocketInput;
use crate::connection::output::SocketOutput;
use crate::handler::Handler;
use crate::protocol::body::{BodyKind, last_transfer_encoding_is_chunked};
use crate::protocol::{
    BoxError, ParseError, RequestLine, SendError, connection_has_token, expects_continue,
    status_can_have_body,
};
use crate::server::{DateService, ServerConfig};

/// Value of the `Server` header added to responses that did not set one.
const SERVER_NAME: &str = "petrel";

/// A response lifecycle hook; see [`ServerContext::on_starting`].
type LifecycleHook = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

/// How one request left the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestOutcome {
    /// The connection can take another request.
    KeepAlive,
    /// Finish pending writes, then close the connection.
    Close,
    /// Tear the connection down without a graceful shutdown.
    Aborted,
}

/// Connection-scoped facts, fixed when the connection is accepted and
/// untouched by the per-request reset.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Server-assigned connection number, for correlating log lines.
    pub id: u64,
    /// Scheme of the listening address the connection arrived on.
    pub scheme: String,
    pub remote_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
}

impl ConnectionInfo {
    pub fn new(id: u64, scheme: impl Into<String>) -> Self {
        Self { id, scheme: scheme.into(), remote_addr: None, local_addr: None }
    }
}

/// Request/response state for the connection's current request.
///
/// A connection owns exactly one context and drives it once per request; the
/// handler borrows it for the duration of [`Handler::handle`]. The context
/// parses the request line and headers from the [`SocketInput`], frames the
/// request body, and produces the response head and body into the
/// [`SocketOutput`].
///
/// # Response framing
///
/// The response head is serialized lazily, on the first body write (or at
/// request end when nothing was written). Until then [`set_status`] and
/// [`response_headers_mut`] are free to change their minds. Framing is picked
/// from what the handler declared:
///
/// - a `Content-Length` header makes writes count against the declared size,
///   and finishing short of it is an error that aborts the connection;
/// - no declaration on an HTTP/1.1 request turns on chunked encoding;
/// - a handler-set `Transfer-Encoding: chunked` passes writes through
///   unframed (the handler produces the chunk syntax itself) and the
///   connection closes after the response;
/// - responses that ended without a single write go out as `Content-Length: 0`.
///
/// [`set_status`]: Self::set_status
/// [`response_headers_mut`]: Self::response_headers_mut
pub struct ServerContext {
    info: ConnectionInfo,
    input: Arc<SocketInput>,
    output: Arc<SocketOutput>,
    abort: CancellationToken,
    date: Arc<DateService>,
    header_limits: HeaderLimits,
    idle_timeout: Duration,
    drain_timeout: Duration,

    request: RequestLine,
    request_headers: HeaderMap,
    /// Header bytes consumed so far for the current request, carried across
    /// partial parses so the size cap spans resumptions.
    header_bytes: usize,
    keep_alive: bool,
    body: Option<MessageBody>,

    status: StatusCode,
    response_headers: HeaderMap,
    response_started: bool,
    mode: ResponseMode,
    /// Body writes are accepted and dropped (HEAD requests).
    discard_body: bool,

    on_starting: Vec<LifecycleHook>,
    on_completed: Vec<LifecycleHook>,
    hooks_fired: bool,
    /// First starting-hook failure; poisons later writes with its cause.
    hook_failure: Option<String>,
}

/// Response body framing, fixed once the head is serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseMode {
    /// Writes are counted against the declared length.
    ContentLength { declared: u64, written: u64 },
    /// The engine wraps every write in a chunk frame.
    Chunked,
    /// Writes pass through unframed; end of body is the connection closing.
    UntilClose,
    /// Writes are accepted and dropped.
    Discard,
}

impl ServerContext {
    pub(crate) fn new(
        info: ConnectionInfo,
        input: Arc<SocketInput>,
        output: Arc<SocketOutput>,
        abort: CancellationToken,
        date: Arc<DateService>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            info,
            input,
            output,
            abort,
            date,
            header_limits: config.header_limits,
            idle_timeout: config.keep_alive_timeout,
            drain_timeout: config.drain_timeout,
            request: RequestLine::default(),
            request_headers: HeaderMap::new(),
            header_bytes: 0,
            keep_alive: false,
            body: None,
            status: StatusCode::OK,
            response_headers: HeaderMap::new(),
            response_started: false,
            mode: ResponseMode::Discard,
            discard_body: false,
            on_starting: Vec::new(),
            on_completed: Vec::new(),
            hooks_fired: false,
            hook_failure: None,
        }
    }

    /// Parses one request, runs the handler over it and finishes the
    /// response. The returned outcome tells the connection loop whether to
    /// go around again.
    pub(crate) async fn process_request<H>(&mut self, handler: &H) -> RequestOutcome
    where
        H: Handler + ?Sized,
    {
        self.reset();

        let line = match timeout(self.idle_timeout, self.read_start_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => return RequestOutcome::Close,
            Ok(Err(err)) => return self.parse_failed(&err),
            Err(_) => {
                debug!(connection = self.info.id, "closing idle connection");
                return RequestOutcome::Close;
            }
        };
        self.request = line;

        match timeout(self.idle_timeout, self.read_headers()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return self.parse_failed(&err),
            Err(_) => {
                debug!(connection = self.info.id, "closing connection stalled mid-headers");
                return RequestOutcome::Close;
            }
        }

        if let Err(err) = self.prepare_body() {
            return self.parse_failed(&err);
        }

        trace!(
            connection = self.info.id,
            method = %self.request.method,
            path = %self.request.path,
            "request received"
        );

        if let Err(cause) = handler.handle(self).await {
            error!(connection = self.info.id, "handler failed, cause: {cause}");
            if self.response_started {
                // Too late for a clean error response: part of a payload may
                // already be on the wire.
                self.abort.cancel();
                self.fire_on_completed().await;
                return RequestOutcome::Aborted;
            }
            self.set_error_response();
        }

        if let Err(err) = self.produce_end().await {
            error!(connection = self.info.id, "finishing response failed, cause: {err}");
            self.abort.cancel();
            self.fire_on_completed().await;
            return RequestOutcome::Aborted;
        }

        self.fire_on_completed().await;

        if self.keep_alive {
            self.drain_request_body().await;
        }

        if self.abort.is_cancelled() || self.output.is_failed() {
            RequestOutcome::Aborted
        } else if self.keep_alive {
            RequestOutcome::KeepAlive
        } else {
            RequestOutcome::Close
        }
    }

    /// HTTP method of the current request.
    pub fn method(&self) -> &Method {
        &self.request.method
    }

    /// Decoded request path, percent escapes resolved.
    pub fn path(&self) -> &str {
        &self.request.path
    }

    /// Query string after `?`, undecoded, if the target had one.
    pub fn query(&self) -> Option<&str> {
        self.request.query.as_deref()
    }

    /// Request target exactly as it appeared on the wire.
    pub fn raw_target(&self) -> &Bytes {
        &self.request.target
    }

    pub fn version(&self) -> Version {
        self.request.version
    }

    /// Headers of the current request.
    pub fn headers(&self) -> &HeaderMap {
        &self.request_headers
    }

    pub fn connection_id(&self) -> u64 {
        self.info.id
    }

    /// Scheme of the address this connection was accepted on.
    pub fn scheme(&self) -> &str {
        &self.info.scheme
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.info.remote_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.info.local_addr
    }

    /// Reads request body payload into `dst`, suspending until data arrives.
    /// Returns `Ok(0)` at end of body.
    pub async fn read_body(&mut self, dst: &mut [u8]) -> Result<usize, ParseError> {
        match &mut self.body {
            Some(body) => body.read(dst).await,
            None => Ok(0),
        }
    }

    /// Like [`read_body`](Self::read_body) but never suspends: `Ok(0)` can
    /// also mean no payload is buffered right now.
    pub fn try_read_body(&mut self, dst: &mut [u8]) -> Result<usize, ParseError> {
        match &mut self.body {
            Some(body) => body.try_read(dst),
            None => Ok(0),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Sets the response status. Fails once the response head has been
    /// serialized.
    pub fn set_status(&mut self, status: StatusCode) -> Result<(), SendError> {
        if self.response_started {
            return Err(SendError::ResponseStarted);
        }
        self.status = status;
        Ok(())
    }

    /// Response headers to be sent. Mutations after the response head has
    /// started no longer reach the wire.
    pub fn response_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.response_headers
    }

    /// True once the response head has been handed to the output queue.
    pub fn response_started(&self) -> bool {
        self.response_started
    }

    /// Registers a hook to run right before the response head is serialized,
    /// while status and headers can still change. Hooks run in reverse
    /// registration order; a failing hook poisons the response and the
    /// request is answered with a plain 500 instead.
    pub fn on_starting<F, Fut>(&mut self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        if self.response_started {
            warn!(connection = self.info.id, "response already started, hook will never run");
            return;
        }
        self.on_starting.push(Box::new(move || hook().boxed()));
    }

    /// Registers a hook to run after the response has been produced, whether
    /// or not it succeeded. Hooks run in reverse registration order and
    /// failures are logged, not propagated.
    pub fn on_completed<F, Fut>(&mut self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.on_completed.push(Box::new(move || hook().boxed()));
    }

    /// Writes response body payload. The first write also serializes the
    /// response head. Completion means the bytes are queued within the
    /// connection's write-behind budget, not that the peer received them.
    pub async fn write(&mut self, data: Bytes) -> Result<(), SendError> {
        if let Some(reason) = &self.hook_failure {
            return Err(SendError::hook_failed(reason));
        }
        self.ensure_started(false).await?;
        if data.is_empty() {
            return Ok(());
        }
        match &mut self.mode {
            ResponseMode::ContentLength { declared, written } => {
                let len = data.len() as u64;
                let remaining = declared.saturating_sub(*written);
                if !self.discard_body && len > remaining {
                    let attempted = written.saturating_add(len);
                    return Err(SendError::content_length_mismatch(attempted, *declared));
                }
                *written = written.saturating_add(len);
                if self.discard_body { Ok(()) } else { self.output.write(data, true).await }
            }
            ResponseMode::Chunked => self.output.write_chunked(data).await,
            ResponseMode::UntilClose => self.output.write(data, true).await,
            ResponseMode::Discard => Ok(()),
        }
    }

    /// Serializes the response head if it has not started yet and waits
    /// until every queued response byte is confirmed written to the socket.
    pub async fn flush(&mut self) -> Result<(), SendError> {
        if let Some(reason) = &self.hook_failure {
            return Err(SendError::hook_failed(reason));
        }
        self.ensure_started(false).await?;
        self.output.flush().await
    }

    /// Aborts the connection: pending reads and writes fail and the socket
    /// is torn down without a graceful shutdown.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Clears per-request state. Connection-scoped state (socket queues,
    /// buffers, limits) stays untouched, and the header maps keep their
    /// allocations for the next request.
    fn reset(&mut self) {
        self.request = RequestLine::default();
        self.request_headers.clear();
        self.header_bytes = 0;
        self.keep_alive = false;
        self.body = None;
        self.status = StatusCode::OK;
        self.response_headers.clear();
        self.response_started = false;
        self.mode = ResponseMode::Discard;
        self.discard_body = false;
        self.on_starting.clear();
        self.on_completed.clear();
        self.hooks_fired = false;
        self.hook_failure = None;
    }

    /// A request that could not be parsed is dropped without an error
    /// response; answering garbage with 400s mostly feeds port scanners.
    fn parse_failed(&self, err: &ParseError) -> RequestOutcome {
        if err.is_io() {
            debug!(connection = self.info.id, "request read failed: {err}");
            RequestOutcome::Aborted
        } else {
            debug!(connection = self.info.id, "dropping connection after malformed request: {err}");
            RequestOutcome::Close
        }
    }

    /// Reads until a full request line is buffered. `Ok(None)` is a clean
    /// end of stream before the first request byte.
    async fn read_start_line(&mut self) -> Result<Option<RequestLine>, ParseError> {
        loop {
            let has_bytes = select! {
                ready = self.input.ready() => ready?,
                () = self.abort.cancelled() => return Err(aborted_error()),
            };
            let consumer = self.input.consume();
            let chain = consumer.chain();
            let mut pos = consumer.read_pos();
            match take_start_line(chain, &mut pos)? {
                StartLineProgress::Complete(line) => {
                    consumer.complete(pos, pos);
                    return Ok(Some(line));
                }
                StartLineProgress::Partial(status) => {
                    if !has_bytes {
                        return if status == StartLineStatus::Empty {
                            Ok(None)
                        } else {
                            Err(ParseError::UnexpectedEnd)
                        };
                    }
                    let begin = consumer.read_pos();
                    let end = chain.end();
                    consumer.complete(begin, end);
                }
            }
        }
    }

    /// Reads until the header section's closing blank line. Completed header
    /// lines are committed as they arrive; only the unfinished tail is
    /// re-scanned when more bytes come in.
    async fn read_headers(&mut self) -> Result<(), ParseError> {
        loop {
            let has_bytes = select! {
                ready = self.input.ready() => ready?,
                () = self.abort.cancelled() => return Err(aborted_error()),
            };
            let consumer = self.input.consume();
            let chain = consumer.chain();
            let mut pos = consumer.read_pos();
            let mut consumed = self.header_bytes;
            let progress = take_message_headers(
                chain,
                &mut pos,
                &self.header_limits,
                &mut consumed,
                &mut self.request_headers,
            )?;
            self.header_bytes = consumed;
            match progress {
                HeadersProgress::Complete => {
                    consumer.complete(pos, pos);
                    return Ok(());
                }
                HeadersProgress::Incomplete => {
                    if !has_bytes {
                        return Err(ParseError::UnexpectedEnd);
                    }
                    let end = chain.end();
                    consumer.complete(pos, end);
                }
            }
        }
    }

    /// Decides keep-alive and request body framing from the parsed headers.
    fn prepare_body(&mut self) -> Result<(), ParseError> {
        let version = self.request.version;
        self.keep_alive = if version == Version::HTTP_11 {
            !connection_has_token(&self.request_headers, "close")
        } else {
            connection_has_token(&self.request_headers, "keep-alive")
        };
        let kind = BodyKind::for_request(version, &self.request_headers, self.keep_alive)?;
        if kind == BodyKind::UntilClose {
            self.keep_alive = false;
        }
        self.discard_body = self.request.is_head();
        self.body = Some(MessageBody::new(
            kind,
            Arc::clone(&self.input),
            Arc::clone(&self.output),
            expects_continue(version, &self.request_headers),
            self.abort.clone(),
        ));
        Ok(())
    }

    /// Serializes the response head once. `completing` means the handler is
    /// done without having written a body, so an exact zero length can be
    /// declared instead of falling back to chunked encoding.
    async fn ensure_started(&mut self, completing: bool) -> Result<(), SendError> {
        if self.response_started {
            return Ok(());
        }
        self.fire_on_starting().await?;

        if connection_has_token(&self.response_headers, "close") {
            self.keep_alive = false;
        }

        let declared = parse_declared_length(&self.response_headers)?;
        self.mode = if !status_can_have_body(self.status) {
            ResponseMode::Discard
        } else if let Some(declared) = declared {
            ResponseMode::ContentLength { declared, written: 0 }
        } else if last_transfer_encoding_is_chunked(&self.response_headers) {
            // The handler frames the body itself; without a trusted length
            // the only safe end-of-response signal left is closing.
            self.keep_alive = false;
            ResponseMode::UntilClose
        } else if self.discard_body {
            ResponseMode::Discard
        } else if completing {
            self.response_headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
            ResponseMode::ContentLength { declared: 0, written: 0 }
        } else if self.request.version == Version::HTTP_11 {
            self.response_headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            ResponseMode::Chunked
        } else {
            self.keep_alive = false;
            ResponseMode::UntilClose
        };

        if !self.response_headers.contains_key(CONNECTION) {
            if self.request.version == Version::HTTP_11 {
                if !self.keep_alive {
                    self.response_headers.insert(CONNECTION, HeaderValue::from_static("close"));
                }
            } else if self.keep_alive {
                self.response_headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
            }
        }
        if !self.response_headers.contains_key(DATE) {
            self.response_headers.insert(DATE, self.date.header_value());
        }
        if !self.response_headers.contains_key(SERVER) {
            self.response_headers.insert(SERVER, HeaderValue::from_static(SERVER_NAME));
        }

        let mut session = self.output.producing_start();
        let head = {
            let mut writer = session.writer(self.output.pool());
            write_head(&mut writer, self.status, &self.response_headers)
        };
        if let Err(err) = head {
            self.output.producing_cancel(session);
            return Err(SendError::io(err));
        }
        self.output.producing_complete(session, false).await?;
        self.response_started = true;
        Ok(())
    }

    /// Finishes the response after the handler returned: serializes the head
    /// if nothing was written, closes the body framing and verifies a
    /// declared length was honored.
    async fn produce_end(&mut self) -> Result<(), SendError> {
        if self.hook_failure.is_some() && !self.response_started {
            self.set_error_response();
        }
        self.ensure_started(true).await?;
        match self.mode {
            ResponseMode::Chunked => self.output.write(terminal_chunk(), false).await,
            ResponseMode::ContentLength { declared, written } => {
                if written != declared && !self.discard_body {
                    error!(
                        connection = self.info.id,
                        written, declared, "response ended short of its declared content-length"
                    );
                    self.abort.cancel();
                    return Err(SendError::content_length_mismatch(written, declared));
                }
                Ok(())
            }
            ResponseMode::UntilClose | ResponseMode::Discard => Ok(()),
        }
    }

    /// Replaces whatever the handler half-prepared with a plain 500.
    fn set_error_response(&mut self) {
        self.status = StatusCode::INTERNAL_SERVER_ERROR;
        self.response_headers.clear();
    }

    /// Runs every starting hook, most recently registered first. One hook
    /// failing does not stop its siblings, but the first failure poisons the
    /// response: the pending write fails and so does every later one.
    async fn fire_on_starting(&mut self) -> Result<(), SendError> {
        if self.hooks_fired {
            return Ok(());
        }
        self.hooks_fired = true;
        let mut first_failure = None;
        while let Some(hook) = self.on_starting.pop() {
            if let Err(cause) = hook().await {
                error!(connection = self.info.id, "response starting hook failed, cause: {cause}");
                if first_failure.is_none() {
                    first_failure = Some(cause.to_string());
                }
            }
        }
        match first_failure {
            Some(reason) => {
                self.hook_failure = Some(reason.clone());
                Err(SendError::hook_failed(reason))
            }
            None => Ok(()),
        }
    }

    async fn fire_on_completed(&mut self) {
        while let Some(hook) = self.on_completed.pop() {
            if let Err(cause) = hook().await {
                error!(connection = self.info.id, "response completed hook failed, cause: {cause}");
            }
        }
    }

    /// Discards whatever is left of the request body so the next request
    /// starts at a frame boundary. Giving up (timeout or failure) downgrades
    /// the connection to close.
    async fn drain_request_body(&mut self) {
        let Some(body) = &mut self.body else {
            return;
        };
        if body.is_consumed() {
            return;
        }
        match timeout(self.drain_timeout, body.drain()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(connection = self.info.id, "request body drain failed: {err}");
                self.keep_alive = false;
            }
            Err(_) => {
                debug!(connection = self.info.id, "request body drain timed out");
                self.keep_alive = false;
            }
        }
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("connection_id", &self.info.id)
            .field("method", &self.request.method)
            .field("path", &self.request.path)
            .field("status", &self.status)
            .field("response_started", &self.response_started)
            .finish_non_exhaustive()
    }
}

/// Reads a declared response `Content-Length` set by the handler.
fn parse_declared_length(headers: &HeaderMap) -> Result<Option<u64>, SendError> {
    let Some(value) = headers.get(CONTENT_LENGTH) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| {
            SendError::io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid content-length in response headers",
            ))
        })
}

/// Serializes the status line and header section, CRLF terminated. The
/// status line always advertises HTTP/1.1; 1.0 peers accept it per RFC 9112
/// and everything version-specific is negotiated through headers instead.
fn write_head(dst: &mut impl Write, status: StatusCode, headers: &HeaderMap) -> io::Result<()> {
    write!(dst, "HTTP/1.1 {} {}\r\n", status.as_u16(), status.canonical_reason().unwrap_or(""))?;
    for (name, value) in headers {
        dst.write_all(name.as_str().as_bytes())?;
        dst.write_all(b": ")?;
        dst.write_all(value.as_bytes())?;
        dst.write_all(b"\r\n")?;
    }
    dst.write_all(b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::handler::make_handler;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncReadExt, DuplexStream, ReadHalf};
    use tokio::task::JoinHandle;

    struct Rig {
        ctx: ServerContext,
        input: Arc<SocketInput>,
        output: Arc<SocketOutput>,
        token: CancellationToken,
        client: ReadHalf<DuplexStream>,
        _writer_task: JoinHandle<()>,
    }

    fn rig() -> Rig {
        let pool = Arc::new(BufferPool::new());
        let token = CancellationToken::new();
        let input = Arc::new(SocketInput::new(Arc::clone(&pool)));
        let output = Arc::new(SocketOutput::new(Arc::clone(&pool), token.clone()));
        let (client, server) = tokio::io::duplex(256 * 1024);
        let (client, _client_write) = tokio::io::split(client);
        let (_, server_write) = tokio::io::split(server);
        let writer_task = output.spawn_writer(server_write);
        let ctx = ServerContext::new(
            ConnectionInfo::new(7, "http"),
            Arc::clone(&input),
            Arc::clone(&output),
            token.clone(),
            Arc::new(DateService::new()),
            &ServerConfig::default(),
        );
        Rig { ctx, input, output, token, client, _writer_task: writer_task }
    }

    fn push(input: &SocketInput, bytes: &[u8]) {
        let mut block = input.incoming_start(bytes.len());
        block.writable_mut()[..bytes.len()].copy_from_slice(bytes);
        block.commit(bytes.len());
        input.incoming_complete(block, bytes.len(), Ok(()));
    }

    /// Ends the output and reads everything the connection produced.
    async fn finish_and_read(mut rig: Rig) -> String {
        rig.output.end().await.unwrap();
        let mut bytes = Vec::new();
        rig.client.read_to_end(&mut bytes).await.unwrap();
        String::from_utf8(bytes).unwrap()
    }

    /// Reads what reached the client of an aborted connection.
    async fn read_after_abort(mut rig: Rig) -> String {
        let mut bytes = Vec::new();
        rig.client.read_to_end(&mut bytes).await.unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn bare_get_responds_with_zero_content_length() {
        let mut rig = rig();
        push(&rig.input, b"GET /hello?x=1 HTTP/1.1\r\nhost: a\r\n\r\n");
        let handler = make_handler(|ctx: &mut ServerContext| {
            async move {
                assert_eq!(ctx.method(), &Method::GET);
                assert_eq!(ctx.path(), "/hello");
                assert_eq!(ctx.query(), Some("x=1"));
                assert_eq!(ctx.version(), Version::HTTP_11);
                Ok(())
            }
            .boxed()
        });

        let outcome = rig.ctx.process_request(&handler).await;
        assert_eq!(outcome, RequestOutcome::KeepAlive);

        let response = finish_and_read(rig).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.contains("\r\ncontent-length: 0\r\n"), "{response}");
        assert!(response.contains("\r\ndate: "), "{response}");
        assert!(response.contains("\r\nserver: petrel\r\n"), "{response}");
        assert!(response.ends_with("\r\n\r\n"), "{response}");
    }

    #[tokio::test]
    async fn body_writes_default_to_chunked_encoding() {
        let mut rig = rig();
        push(&rig.input, b"GET / HTTP/1.1\r\n\r\n");
        let handler = make_handler(|ctx: &mut ServerContext| {
            async move {
                ctx.write(Bytes::from_static(b"hello ")).await?;
                ctx.write(Bytes::from_static(b"world")).await?;
                Ok(())
            }
            .boxed()
        });

        let outcome = rig.ctx.process_request(&handler).await;
        assert_eq!(outcome, RequestOutcome::KeepAlive);

        let response = finish_and_read(rig).await;
        assert!(response.contains("\r\ntransfer-encoding: chunked\r\n"), "{response}");
        let (_, body) = response.split_once("\r\n\r\n").unwrap();
        assert_eq!(body, "6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn declared_content_length_is_sent_verbatim() {
        let mut rig = rig();
        push(&rig.input, b"GET / HTTP/1.1\r\n\r\n");
        let handler = make_handler(|ctx: &mut ServerContext| {
            async move {
                ctx.response_headers_mut().insert(CONTENT_LENGTH, HeaderValue::from_static("11"));
                ctx.write(Bytes::from_static(b"hello world")).await?;
                Ok(())
            }
            .boxed()
        });

        let outcome = rig.ctx.process_request(&handler).await;
        assert_eq!(outcome, RequestOutcome::KeepAlive);

        let response = finish_and_read(rig).await;
        assert!(response.contains("\r\ncontent-length: 11\r\n"), "{response}");
        assert!(!response.contains("transfer-encoding"), "{response}");
        let (_, body) = response.split_once("\r\n\r\n").unwrap();
        assert_eq!(body, "hello world");
    }

    #[tokio::test]
    async fn finishing_short_of_content_length_aborts() {
        let mut rig = rig();
        push(&rig.input, b"GET / HTTP/1.1\r\n\r\n");
        let handler = make_handler(|ctx: &mut ServerContext| {
            async move {
                ctx.response_headers_mut().insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
                ctx.write(Bytes::from_static(b"ab")).await?;
                Ok(())
            }
            .boxed()
        });

        let outcome = rig.ctx.process_request(&handler).await;
        assert_eq!(outcome, RequestOutcome::Aborted);
        assert!(rig.token.is_cancelled());
    }

    #[tokio::test]
    async fn overrunning_content_length_fails_the_write() {
        let mut rig = rig();
        push(&rig.input, b"GET / HTTP/1.1\r\n\r\n");
        let handler = make_handler(|ctx: &mut ServerContext| {
            async move {
                ctx.response_headers_mut().insert(CONTENT_LENGTH, HeaderValue::from_static("3"));
                let err = ctx.write(Bytes::from_static(b"abcdef")).await.unwrap_err();
                assert!(matches!(err, SendError::ContentLengthMismatch { .. }));
                Err(err.into())
            }
            .boxed()
        });

        let outcome = rig.ctx.process_request(&handler).await;
        assert_eq!(outcome, RequestOutcome::Aborted);
    }

    #[tokio::test]
    async fn handler_error_before_writing_turns_into_500() {
        let mut rig = rig();
        push(&rig.input, b"GET / HTTP/1.1\r\n\r\n");
        let handler = make_handler(|ctx: &mut ServerContext| {
            async move {
                ctx.set_status(StatusCode::CREATED)?;
                ctx.response_headers_mut().insert("x-partial", HeaderValue::from_static("yes"));
                Err("boom".into())
            }
            .boxed()
        });

        let outcome = rig.ctx.process_request(&handler).await;
        assert_eq!(outcome, RequestOutcome::KeepAlive, "clean 500 keeps the connection");

        let response = finish_and_read(rig).await;
        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{response}");
        assert!(response.contains("\r\ncontent-length: 0\r\n"), "{response}");
        assert!(!response.contains("x-partial"), "abandoned headers must not leak: {response}");
    }

    #[tokio::test]
    async fn handler_error_after_flush_aborts_the_connection() {
        let mut rig = rig();
        push(&rig.input, b"GET / HTTP/1.1\r\n\r\n");
        let handler = make_handler(|ctx: &mut ServerContext| {
            async move {
                ctx.write(Bytes::from_static(b"partial")).await?;
                ctx.flush().await?;
                Err("late failure".into())
            }
            .boxed()
        });

        let outcome = rig.ctx.process_request(&handler).await;
        assert_eq!(outcome, RequestOutcome::Aborted);
        assert!(rig.token.is_cancelled());

        let on_wire = read_after_abort(rig).await;
        assert!(on_wire.contains("partial"), "flushed bytes reached the peer: {on_wire}");
        assert!(!on_wire.contains("500"), "no error response after a started body: {on_wire}");
    }

    #[tokio::test]
    async fn failing_starting_hook_poisons_the_response() {
        let mut rig = rig();
        push(&rig.input, b"GET / HTTP/1.1\r\n\r\n");
        let handler = make_handler(|ctx: &mut ServerContext| {
            async move {
                ctx.on_starting(|| async { Err(BoxError::from("hook refused")) });
                let err = ctx.write(Bytes::from_static(b"never sent")).await.unwrap_err();
                assert!(matches!(err, SendError::HookFailed { .. }));
                // every later write is poisoned too
                let err = ctx.write(Bytes::from_static(b"still not")).await.unwrap_err();
                assert!(matches!(err, SendError::HookFailed { .. }));
                Ok(())
            }
            .boxed()
        });

        let outcome = rig.ctx.process_request(&handler).await;
        assert_eq!(outcome, RequestOutcome::KeepAlive);

        let response = finish_and_read(rig).await;
        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{response}");
        assert!(!response.contains("never sent"), "{response}");
    }

    #[tokio::test]
    async fn completed_hooks_run_after_the_response() {
        let completed = Arc::new(AtomicBool::new(false));
        let mut rig = rig();
        push(&rig.input, b"GET / HTTP/1.1\r\n\r\n");
        let flag = Arc::clone(&completed);
        let handler = make_handler(move |ctx: &mut ServerContext| {
            let flag = Arc::clone(&flag);
            async move {
                let hook_flag = Arc::clone(&flag);
                ctx.on_completed(move || async move {
                    hook_flag.store(true, Ordering::SeqCst);
                    Ok(())
                });
                assert!(!flag.load(Ordering::SeqCst));
                Ok(())
            }
            .boxed()
        });

        let outcome = rig.ctx.process_request(&handler).await;
        assert_eq!(outcome, RequestOutcome::KeepAlive);
        assert!(completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn http10_request_without_token_closes() {
        let mut rig = rig();
        push(&rig.input, b"GET / HTTP/1.0\r\n\r\n");
        let handler = make_handler(|_: &mut ServerContext| async { Ok(()) }.boxed());

        let outcome = rig.ctx.process_request(&handler).await;
        assert_eq!(outcome, RequestOutcome::Close);

        let response = finish_and_read(rig).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(!response.contains("\r\nconnection:"), "{response}");
    }

    #[tokio::test]
    async fn http10_keep_alive_token_is_honored_and_echoed() {
        let mut rig = rig();
        push(&rig.input, b"GET / HTTP/1.0\r\nconnection: keep-alive\r\n\r\n");
        let handler = make_handler(|_: &mut ServerContext| async { Ok(()) }.boxed());

        let outcome = rig.ctx.process_request(&handler).await;
        assert_eq!(outcome, RequestOutcome::KeepAlive);

        let response = finish_and_read(rig).await;
        assert!(response.contains("\r\nconnection: keep-alive\r\n"), "{response}");
    }

    #[tokio::test]
    async fn connection_close_request_gets_a_close_response() {
        let mut rig = rig();
        push(&rig.input, b"GET / HTTP/1.1\r\nconnection: close\r\n\r\n");
        let handler = make_handler(|_: &mut ServerContext| async { Ok(()) }.boxed());

        let outcome = rig.ctx.process_request(&handler).await;
        assert_eq!(outcome, RequestOutcome::Close);

        let response = finish_and_read(rig).await;
        assert!(response.contains("\r\nconnection: close\r\n"), "{response}");
    }

    #[tokio::test]
    async fn head_response_carries_headers_but_no_body() {
        let mut rig = rig();
        push(&rig.input, b"HEAD /x HTTP/1.1\r\n\r\n");
        let handler = make_handler(|ctx: &mut ServerContext| {
            async move {
                ctx.response_headers_mut().insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
                ctx.write(Bytes::from_static(b"hello")).await?;
                Ok(())
            }
            .boxed()
        });

        let outcome = rig.ctx.process_request(&handler).await;
        assert_eq!(outcome, RequestOutcome::KeepAlive);

        let response = finish_and_read(rig).await;
        assert!(response.contains("\r\ncontent-length: 5\r\n"), "{response}");
        let (_, body) = response.split_once("\r\n\r\n").unwrap();
        assert_eq!(body, "", "HEAD responses carry no payload");
    }

    #[tokio::test]
    async fn pipelined_requests_are_isolated() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut rig = rig();
        push(&rig.input, b"GET /one HTTP/1.1\r\nx-first: 1\r\n\r\nGET /two HTTP/1.1\r\n\r\n");
        let paths = Arc::clone(&seen);
        let handler = make_handler(move |ctx: &mut ServerContext| {
            let paths = Arc::clone(&paths);
            async move {
                if ctx.path() == "/two" {
                    assert!(ctx.headers().get("x-first").is_none(), "headers leak across requests");
                }
                paths.lock().unwrap().push(ctx.path().to_string());
                Ok(())
            }
            .boxed()
        });

        assert_eq!(rig.ctx.process_request(&handler).await, RequestOutcome::KeepAlive);
        assert_eq!(rig.ctx.process_request(&handler).await, RequestOutcome::KeepAlive);
        assert_eq!(*seen.lock().unwrap(), ["/one", "/two"]);

        let response = finish_and_read(rig).await;
        assert_eq!(response.matches("HTTP/1.1 200 OK\r\n").count(), 2, "{response}");
    }

    #[tokio::test]
    async fn malformed_request_is_dropped_without_a_response() {
        let mut rig = rig();
        push(&rig.input, b"GET\x01BAD / HTTP/1.1\r\n\r\n");
        let handler = make_handler(|_: &mut ServerContext| {
            async { unreachable!("handler must not see a malformed request") }.boxed()
        });

        let outcome = rig.ctx.process_request(&handler).await;
        assert_eq!(outcome, RequestOutcome::Close);
        assert!(!rig.token.is_cancelled());

        let response = finish_and_read(rig).await;
        assert_eq!(response, "", "not a single response byte for garbage");
    }

    #[tokio::test]
    async fn disconnect_mid_headers_closes_quietly() {
        let mut rig = rig();
        push(&rig.input, b"GET / HTTP/1.1\r\nhost: trunc");
        rig.input.finish();
        let handler = make_handler(|_: &mut ServerContext| async { Ok(()) }.boxed());

        let outcome = rig.ctx.process_request(&handler).await;
        assert_eq!(outcome, RequestOutcome::Close);

        let response = finish_and_read(rig).await;
        assert_eq!(response, "");
    }

    #[tokio::test]
    async fn request_body_reaches_the_handler() {
        let mut rig = rig();
        push(&rig.input, b"POST /echo HTTP/1.1\r\ncontent-length: 5\r\n\r\nhello");
        let handler = make_handler(|ctx: &mut ServerContext| {
            async move {
                let mut collected = Vec::new();
                let mut buf = [0u8; 3];
                loop {
                    let n = ctx.read_body(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    collected.extend_from_slice(&buf[..n]);
                }
                assert_eq!(collected, b"hello");
                ctx.write(Bytes::from(collected)).await?;
                Ok(())
            }
            .boxed()
        });

        let outcome = rig.ctx.process_request(&handler).await;
        assert_eq!(outcome, RequestOutcome::KeepAlive);

        let response = finish_and_read(rig).await;
        let (_, body) = response.split_once("\r\n\r\n").unwrap();
        assert_eq!(body, "5\r\nhello\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn unread_body_is_drained_before_the_next_request() {
        let mut rig = rig();
        push(&rig.input, b"POST /a HTTP/1.1\r\ncontent-length: 3\r\n\r\nabcGET /b HTTP/1.1\r\n\r\n");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let paths = Arc::clone(&seen);
        let handler = make_handler(move |ctx: &mut ServerContext| {
            let paths = Arc::clone(&paths);
            async move {
                paths.lock().unwrap().push(ctx.path().to_string());
                Ok(())
            }
            .boxed()
        });

        assert_eq!(rig.ctx.process_request(&handler).await, RequestOutcome::KeepAlive);
        assert_eq!(rig.ctx.process_request(&handler).await, RequestOutcome::KeepAlive);
        assert_eq!(*seen.lock().unwrap(), ["/a", "/b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_times_out() {
        let mut rig = rig();
        let handler = make_handler(|_: &mut ServerContext| {
            async { unreachable!("no request ever arrives") }.boxed()
        });

        let outcome = rig.ctx.process_request(&handler).await;
        assert_eq!(outcome, RequestOutcome::Close);
    }
}
