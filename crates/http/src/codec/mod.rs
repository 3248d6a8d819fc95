//! Incremental HTTP/1.x parsers that run directly over pooled input blocks
//!
//! Every parser here takes a [`BlockChain`](crate::buffer::BlockChain) plus a
//! cursor instead of a contiguous byte slice, so a message split across
//! socket reads is parsed in place without reassembling it first. The shared
//! contract: a parser advances the caller's cursor only past bytes it fully
//! consumed, reports "need more input" without moving the cursor when a
//! construct is cut off mid-way, and returns a hard error for malformed
//! input.
//!
//! # Architecture
//!
//! - [`start_line`]: request line (method, target, version) with
//!   percent-decoding of the path
//! - [`headers`]: header section with obs-fold joining, duplicates, and
//!   count/size limits
//! - [`chunk`]: chunked transfer coding state machine for request bodies
//! - [`chunk_writer`]: chunked transfer coding framing for response bodies

pub mod chunk;
pub mod chunk_writer;
pub mod headers;
pub mod start_line;

pub use chunk::{ChunkStep, ChunkedReader};
pub use chunk_writer::{chunk_crlf, encode_chunk_frame, terminal_chunk};
pub use headers::{HeaderLimits, HeadersProgress, take_message_headers};
pub use start_line::{StartLineProgress, StartLineStatus, take_start_line};
