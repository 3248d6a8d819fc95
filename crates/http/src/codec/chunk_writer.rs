//! Chunk framing for outgoing bodies.
//!
//! The write side never copies payload bytes into a chunk frame; it emits
//! the size line, the caller's payload, and the trailing CRLF as separate
//! queue entries that the socket writer coalesces into one vectored write.

use bytes::Bytes;

/// Size line for a chunk of `len` payload bytes, e.g. `1A\r\n`.
pub fn encode_chunk_frame(len: usize) -> Bytes {
    Bytes::from(format!("{len:X}\r\n"))
}

/// CRLF closing a chunk's payload.
pub fn chunk_crlf() -> Bytes {
    Bytes::from_static(b"\r\n")
}

/// The zero-size chunk plus the final empty line ending a chunked body.
pub fn terminal_chunk() -> Bytes {
    Bytes::from_static(b"0\r\n\r\n")
}
