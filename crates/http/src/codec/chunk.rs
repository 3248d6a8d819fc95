//! Incremental decoder for chunked transfer encoding, driven by chain
//! cursors instead of a contiguous byte buffer.
//!
//! Follows [RFC 7230 Section 4.1](https://tools.ietf.org/html/rfc7230#section-4.1):
//! a hex size line with optional extensions, the chunk data with its CRLF,
//! a terminal zero chunk, optional trailer lines, and a final CRLF.

use crate::buffer::{BlockChain, Cursor};
use crate::protocol::ParseError;
use ChunkedStage::*;

/// Cap on skipped chunk-extension and trailer bytes, so a hostile peer
/// cannot stream framing overhead forever.
const MAX_SKIPPED_LINE_BYTES: usize = 16 * 1024;

/// One decoding step; see [`ChunkedReader::decode`].
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkStep {
    /// Copied this many payload bytes into the caller's buffer.
    Data(usize),
    /// The buffered bytes end mid-frame; wait for more input.
    NeedMore,
    /// The terminal chunk and its final CRLF have been consumed. The cursor
    /// rests exactly past the final LF; pipelined bytes after it are
    /// untouched.
    Finished,
}

/// State machine for decoding one chunked message body.
///
/// The reader owns nothing but its position in the grammar; the bytes stay
/// in the input chain, and every consumed framing byte advances the caller's
/// cursor so the connection can commit consumption incrementally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedReader {
    stage: ChunkedStage,
    remaining: u64,
    skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedStage {
    /// Read the chunk size in hex
    Size,
    /// Whitespace after the size digits
    SizeLws,
    /// Skip chunk extensions
    Extension,
    /// LF closing the size line
    SizeLf,
    /// Chunk payload bytes
    Body,
    /// CR after chunk payload
    BodyCr,
    /// LF after chunk payload
    BodyLf,
    /// Skip a trailer line
    Trailer,
    /// LF closing a trailer line
    TrailerLf,
    /// CR of the final empty line
    EndCr,
    /// LF of the final empty line
    EndLf,
    /// Terminal state
    End,
}

impl ChunkedReader {
    pub fn new() -> Self {
        Self { stage: Size, remaining: 0, skipped: 0 }
    }

    pub fn is_finished(&self) -> bool {
        self.stage == End
    }

    /// Advances the decode as far as the buffered bytes allow.
    ///
    /// Payload bytes are copied into `dst` (which must not be empty) and the
    /// call returns after the first non-empty copy so the caller can hand
    /// bytes upward promptly. Framing bytes advance `cursor` as they are
    /// consumed, even when the step ends in [`ChunkStep::NeedMore`].
    pub fn decode(
        &mut self,
        chain: &BlockChain,
        cursor: &mut Cursor,
        dst: &mut [u8],
    ) -> Result<ChunkStep, ParseError> {
        debug_assert!(!dst.is_empty());
        loop {
            if self.stage == End {
                return Ok(ChunkStep::Finished);
            }

            if self.stage == Body {
                let cap = usize::try_from(self.remaining).unwrap_or(usize::MAX).min(dst.len());
                let copied = chain.copy_to(cursor, &mut dst[..cap]);
                if copied == 0 {
                    return Ok(ChunkStep::NeedMore);
                }
                self.remaining -= copied as u64;
                if self.remaining == 0 {
                    self.stage = BodyCr;
                }
                return Ok(ChunkStep::Data(copied));
            }

            let Some(byte) = chain.take(cursor) else {
                return Ok(ChunkStep::NeedMore);
            };
            self.stage = self.step(byte)?;
        }
    }

    /// Consumes one framing byte and returns the next stage.
    fn step(&mut self, byte: u8) -> Result<ChunkedStage, ParseError> {
        match self.stage {
            Size => self.read_size(byte),
            SizeLws => match byte {
                // LWS can follow the size, but no more digits can come
                b'\t' | b' ' => Ok(SizeLws),
                b';' => Ok(Extension),
                b'\r' => Ok(SizeLf),
                _ => Err(ParseError::invalid_chunk("invalid chunk size linear white space")),
            },
            Extension => match byte {
                // Extensions "end" at the next CRLF; reject a bare LF so a
                // peer skipping the CR cannot smuggle one through.
                b'\r' => Ok(SizeLf),
                b'\n' => Err(ParseError::invalid_chunk("chunk extension contains newline")),
                _ => self.skip_one(Extension),
            },
            SizeLf => match byte {
                b'\n' if self.remaining == 0 => Ok(EndCr),
                b'\n' => Ok(Body),
                _ => Err(ParseError::invalid_chunk("invalid chunk size LF")),
            },
            Body => unreachable!("body stage handled by decode"),
            BodyCr => match byte {
                b'\r' => Ok(BodyLf),
                _ => Err(ParseError::invalid_chunk("invalid chunk body CR")),
            },
            BodyLf => match byte {
                b'\n' => Ok(Size),
                _ => Err(ParseError::invalid_chunk("invalid chunk body LF")),
            },
            Trailer => match byte {
                b'\r' => Ok(TrailerLf),
                _ => self.skip_one(Trailer),
            },
            TrailerLf => match byte {
                b'\n' => Ok(EndCr),
                _ => Err(ParseError::invalid_chunk("invalid trailer end LF")),
            },
            EndCr => match byte {
                b'\r' => Ok(EndLf),
                // not the final empty line: a trailer field follows
                _ => self.skip_one(Trailer),
            },
            EndLf => match byte {
                b'\n' => Ok(End),
                _ => Err(ParseError::invalid_chunk("invalid chunk end LF")),
            },
            End => Ok(End),
        }
    }

    fn read_size(&mut self, byte: u8) -> Result<ChunkedStage, ParseError> {
        macro_rules! or_overflow {
            ($e:expr) => {
                match $e {
                    Some(val) => val,
                    None => return Err(ParseError::invalid_chunk("chunk length overflows")),
                }
            };
        }

        let radix = 16;
        match byte {
            b @ b'0'..=b'9' => {
                self.remaining = or_overflow!(self.remaining.checked_mul(radix));
                self.remaining = or_overflow!(self.remaining.checked_add(u64::from(b - b'0')));
            }
            b @ b'a'..=b'f' => {
                self.remaining = or_overflow!(self.remaining.checked_mul(radix));
                self.remaining = or_overflow!(self.remaining.checked_add(u64::from(b + 10 - b'a')));
            }
            b @ b'A'..=b'F' => {
                self.remaining = or_overflow!(self.remaining.checked_mul(radix));
                self.remaining = or_overflow!(self.remaining.checked_add(u64::from(b + 10 - b'A')));
            }
            b'\t' | b' ' => return Ok(SizeLws),
            b';' => return Ok(Extension),
            b'\r' => return Ok(SizeLf),
            _ => return Err(ParseError::invalid_chunk("invalid chunk size")),
        }

        Ok(Size)
    }

    fn skip_one(&mut self, stay: ChunkedStage) -> Result<ChunkedStage, ParseError> {
        self.skipped += 1;
        if self.skipped > MAX_SKIPPED_LINE_BYTES {
            return Err(ParseError::invalid_chunk("chunk extension or trailer too long"));
        }
        Ok(stay)
    }
}

impl Default for ChunkedReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;

    fn chain_of(data: &[u8]) -> (BlockChain, Cursor) {
        // tiny blocks force frames across block boundaries
        let pool = BufferPool::with_block_sizes(8, 16);
        let mut chain = BlockChain::new();
        chain.append(&pool, data);
        let cursor = chain.begin();
        (chain, cursor)
    }

    fn decode_all(reader: &mut ChunkedReader, chain: &BlockChain, cursor: &mut Cursor) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            match reader.decode(chain, cursor, &mut buf).unwrap() {
                ChunkStep::Data(n) => out.extend_from_slice(&buf[..n]),
                ChunkStep::NeedMore | ChunkStep::Finished => return out,
            }
        }
    }

    #[test]
    fn basic_two_part_message() {
        let (chain, mut cursor) = chain_of(b"10\r\n1234567890abcdef\r\n0\r\n\r\n");
        let mut reader = ChunkedReader::new();

        let body = decode_all(&mut reader, &chain, &mut cursor);
        assert_eq!(body, b"1234567890abcdef");
        assert!(reader.is_finished());
        assert!(chain.is_end(cursor));
    }

    #[test]
    fn multiple_chunks_concatenate() {
        let (chain, mut cursor) = chain_of(b"5\r\nhello\r\n7\r\n, world\r\n0\r\n\r\n");
        let mut reader = ChunkedReader::new();
        assert_eq!(decode_all(&mut reader, &chain, &mut cursor), b"hello, world");
        assert!(reader.is_finished());
    }

    #[test]
    fn extensions_are_skipped() {
        let (chain, mut cursor) = chain_of(b"5;chunk-ext=value\r\nhello\r\n0\r\n\r\n");
        let mut reader = ChunkedReader::new();
        assert_eq!(decode_all(&mut reader, &chain, &mut cursor), b"hello");
        assert!(reader.is_finished());
    }

    #[test]
    fn trailers_are_skipped() {
        let (chain, mut cursor) = chain_of(b"5\r\nhello\r\n0\r\nTrailer: value\r\nAnother: x\r\n\r\n");
        let mut reader = ChunkedReader::new();
        assert_eq!(decode_all(&mut reader, &chain, &mut cursor), b"hello");
        assert!(reader.is_finished());
    }

    #[test]
    fn stops_exactly_at_terminal_chunk() {
        let (chain, mut cursor) = chain_of(b"3\r\nabc\r\n0\r\n\r\nGET /next HTTP/1.1\r\n");
        let mut reader = ChunkedReader::new();
        assert_eq!(decode_all(&mut reader, &chain, &mut cursor), b"abc");
        assert!(reader.is_finished());

        // pipelined bytes after the final LF are untouched
        let rest = chain.copy_range(cursor, chain.end());
        assert_eq!(rest.as_ref(), b"GET /next HTTP/1.1\r\n");
    }

    #[test]
    fn resumes_across_split_frames() {
        let pool = BufferPool::with_block_sizes(8, 16);
        let mut chain = BlockChain::new();
        chain.append(&pool, b"5\r");
        let mut cursor = chain.begin();
        let mut reader = ChunkedReader::new();
        let mut buf = [0u8; 16];

        assert_eq!(reader.decode(&chain, &mut cursor, &mut buf).unwrap(), ChunkStep::NeedMore);

        chain.append(&pool, b"\nhel");
        assert_eq!(reader.decode(&chain, &mut cursor, &mut buf).unwrap(), ChunkStep::Data(3));
        assert_eq!(&buf[..3], b"hel");

        chain.append(&pool, b"lo\r\n0\r\n\r\n");
        assert_eq!(reader.decode(&chain, &mut cursor, &mut buf).unwrap(), ChunkStep::Data(2));
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(reader.decode(&chain, &mut cursor, &mut buf).unwrap(), ChunkStep::Finished);
    }

    #[test]
    fn zero_length_message() {
        let (chain, mut cursor) = chain_of(b"0\r\n\r\n");
        let mut reader = ChunkedReader::new();
        let mut buf = [0u8; 4];
        assert_eq!(reader.decode(&chain, &mut cursor, &mut buf).unwrap(), ChunkStep::Finished);
        assert!(chain.is_end(cursor));
    }

    #[test]
    fn invalid_size_is_rejected() {
        let (chain, mut cursor) = chain_of(b"xyz\r\n");
        let mut reader = ChunkedReader::new();
        let mut buf = [0u8; 4];
        assert!(reader.decode(&chain, &mut cursor, &mut buf).is_err());
    }

    #[test]
    fn missing_crlf_after_data_is_rejected() {
        let (chain, mut cursor) = chain_of(b"5\r\nhelloBad");
        let mut reader = ChunkedReader::new();
        let mut buf = [0u8; 16];
        assert_eq!(reader.decode(&chain, &mut cursor, &mut buf).unwrap(), ChunkStep::Data(5));
        assert!(reader.decode(&chain, &mut cursor, &mut buf).is_err());
    }

    #[test]
    fn size_overflow_is_rejected() {
        let (chain, mut cursor) = chain_of(b"fffffffffffffffff\r\n");
        let mut reader = ChunkedReader::new();
        let mut buf = [0u8; 4];
        assert!(reader.decode(&chain, &mut cursor, &mut buf).is_err());
    }
}
