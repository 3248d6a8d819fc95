use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Boxed error type carried by application handlers and lifecycle hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while reading or framing a request.
///
/// A parse error is terminal for its connection: the engine drops the socket
/// without writing any response bytes.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("start line exceeds the limit {max_size}")]
    TooLongStartLine { max_size: usize },

    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid http version")]
    InvalidVersion,

    #[error("invalid http method")]
    InvalidMethod,

    #[error("invalid request target: {reason}")]
    InvalidTarget { reason: String },

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("invalid chunked framing: {reason}")]
    InvalidChunk { reason: String },

    #[error("connection closed in the middle of a message")]
    UnexpectedEnd,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_long_start_line(max_size: usize) -> Self {
        Self::TooLongStartLine { max_size }
    }

    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_target<S: ToString>(str: S) -> Self {
        Self::InvalidTarget { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn invalid_chunk<S: ToString>(str: S) -> Self {
        Self::InvalidChunk { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// True when the failure came from the transport rather than from
    /// malformed request bytes.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

/// Errors raised while producing a response.
#[derive(Error, Debug)]
pub enum SendError {
    /// The connection was aborted; `source` is the failure that triggered the
    /// abort. Every write after the first failure reports the same cause.
    #[error("connection aborted: {source}")]
    Aborted { source: Arc<io::Error> },

    #[error("response already started")]
    ResponseStarted,

    /// A registered `on_starting` hook failed before the first flush, so the
    /// response this write belongs to can never be sent.
    #[error("response failed in on_starting hook: {reason}")]
    HookFailed { reason: String },

    /// The application wrote a different number of body bytes than the
    /// Content-Length it declared.
    #[error("content-length mismatch: wrote {written} of {declared} declared bytes")]
    ContentLengthMismatch { written: u64, declared: u64 },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn aborted(source: &Arc<io::Error>) -> Self {
        Self::Aborted { source: Arc::clone(source) }
    }

    pub fn hook_failed<S: ToString>(str: S) -> Self {
        Self::HookFailed { reason: str.to_string() }
    }

    pub fn content_length_mismatch(written: u64, declared: u64) -> Self {
        Self::ContentLengthMismatch { written, declared }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}
