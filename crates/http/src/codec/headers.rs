//! Header section parsing over chain cursors.
//!
//! Headers are parsed one line at a time and committed incrementally: once a
//! line (including any obs-fold continuations) is complete, the cursor moves
//! past it and the line is never re-scanned. A call that runs out of bytes
//! mid-line leaves the cursor at that line's start and reports
//! [`HeadersProgress::Incomplete`].

use crate::buffer::{BlockChain, Cursor};
use crate::protocol::ParseError;
use crate::utils::ensure;
use http::header::{HeaderMap, HeaderName, HeaderValue};

/// Most header lines a single request may carry, duplicates included.
pub const MAX_HEADER_COUNT: usize = 64;

/// Upper bound on the whole header section in bytes.
pub const MAX_HEADERS_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct HeaderLimits {
    pub max_headers: usize,
    pub max_total_bytes: usize,
}

impl Default for HeaderLimits {
    fn default() -> Self {
        Self { max_headers: MAX_HEADER_COUNT, max_total_bytes: MAX_HEADERS_BYTES }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum HeadersProgress {
    /// The empty line closing the section has been consumed.
    Complete,
    /// More input is needed; committed lines stay committed.
    Incomplete,
}

/// Parses header lines starting at `cursor` until the blank line or until
/// the buffered bytes run out.
///
/// `consumed_bytes` accumulates the section size across calls so the byte
/// limit holds over the whole section, not per call. Folded continuation
/// lines (obs-fold) are joined into the previous value with a single space;
/// duplicate names are appended in arrival order.
pub fn take_message_headers(
    chain: &BlockChain,
    cursor: &mut Cursor,
    limits: &HeaderLimits,
    consumed_bytes: &mut usize,
    headers: &mut HeaderMap,
) -> Result<HeadersProgress, ParseError> {
    loop {
        let line_start = *cursor;
        let Some(first) = chain.peek(line_start) else {
            return partial(chain, line_start, limits, *consumed_bytes);
        };

        if first == b'\n' {
            return Err(ParseError::invalid_header("bare LF in header section"));
        }

        // blank line closes the section
        if first == b'\r' {
            let mut scan = line_start;
            chain.take(&mut scan);
            match chain.take(&mut scan) {
                None => return partial(chain, line_start, limits, *consumed_bytes),
                Some(b'\n') => {
                    *consumed_bytes += 2;
                    *cursor = scan;
                    return Ok(HeadersProgress::Complete);
                }
                Some(_) => return Err(ParseError::invalid_header("malformed end of headers")),
            }
        }

        let mut scan = line_start;
        let Some(hit) = chain.seek(&mut scan, b":\r\n") else {
            return partial(chain, line_start, limits, *consumed_bytes);
        };
        ensure!(hit == b':', ParseError::invalid_header("header line has no colon"));
        let name_end = scan;
        ensure!(
            chain.distance(line_start, name_end) > 0,
            ParseError::invalid_header("empty header name")
        );
        chain.take(&mut scan);

        // gather the value plus any obs-fold continuation lines before
        // committing anything
        let mut fragments: Vec<(Cursor, Cursor)> = Vec::new();
        loop {
            let value_start = scan;
            let Some(hit) = chain.seek(&mut scan, b"\r\n") else {
                return partial(chain, line_start, limits, *consumed_bytes);
            };
            ensure!(hit == b'\r', ParseError::invalid_header("bare LF in header value"));
            let value_end = scan;
            chain.take(&mut scan);
            match chain.take(&mut scan) {
                None => return partial(chain, line_start, limits, *consumed_bytes),
                Some(b'\n') => {}
                Some(_) => return Err(ParseError::invalid_header("header line missing LF")),
            }
            fragments.push((value_start, value_end));

            // a line starting with SP or HT continues the previous value
            match chain.peek(scan) {
                None => return partial(chain, line_start, limits, *consumed_bytes),
                Some(b' ' | b'\t') => continue,
                Some(_) => break,
            }
        }

        *consumed_bytes += chain.distance(line_start, scan);
        ensure!(
            *consumed_bytes <= limits.max_total_bytes,
            ParseError::too_large_header(*consumed_bytes, limits.max_total_bytes)
        );
        ensure!(headers.len() < limits.max_headers, ParseError::too_many_headers(limits.max_headers));

        let name_bytes = chain.copy_range(line_start, name_end);
        let name = HeaderName::from_bytes(&name_bytes)
            .map_err(|_| ParseError::invalid_header("invalid header name"))?;

        let mut value = Vec::new();
        for (from, to) in &fragments {
            let raw = chain.copy_range(*from, *to);
            let trimmed = trim_ows(&raw);
            if trimmed.is_empty() {
                continue;
            }
            if !value.is_empty() {
                value.push(b' ');
            }
            value.extend_from_slice(trimmed);
        }
        let value = HeaderValue::from_bytes(&value)
            .map_err(|_| ParseError::invalid_header("invalid header value"))?;

        headers.append(name, value);
        *cursor = scan;
    }
}

/// Unterminated input is only tolerable while the section still fits the
/// byte limit once the pending line is counted.
fn partial(
    chain: &BlockChain,
    line_start: Cursor,
    limits: &HeaderLimits,
    consumed: usize,
) -> Result<HeadersProgress, ParseError> {
    let pending = chain.distance(line_start, chain.end());
    ensure!(
        consumed + pending <= limits.max_total_bytes,
        ParseError::too_large_header(consumed + pending, limits.max_total_bytes)
    );
    Ok(HeadersProgress::Incomplete)
}

fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}
