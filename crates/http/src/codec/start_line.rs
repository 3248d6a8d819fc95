//! Request start line parsing over chain cursors.
//!
//! `GET /a/b?k=v HTTP/1.1\r\n` becomes a [`RequestLine`] with the method,
//! the raw target, the percent-decoded path, the undecoded query, and the
//! version. A partial line reports which component ran out of bytes so the
//! caller can log precisely where a slow request stalled.

use crate::buffer::{BlockChain, Cursor};
use crate::protocol::{ParseError, RequestLine};
use crate::utils::ensure;
use http::{Method, Version};

/// Upper bound on the start line, terminator included.
pub const MAX_START_LINE_BYTES: usize = 8 * 1024;

/// Which component of the start line was mid-parse when input ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartLineStatus {
    /// Not a single byte buffered yet.
    Empty,
    /// Method token has no terminating space yet.
    MethodIncomplete,
    /// Target has no terminating space yet.
    TargetIncomplete,
    /// Version has no terminating CR yet.
    VersionIncomplete,
    /// Everything parsed except the final LF.
    Incomplete,
}

#[derive(Debug)]
pub enum StartLineProgress {
    Complete(RequestLine),
    Partial(StartLineStatus),
}

/// Parses one request start line beginning at `cursor`.
///
/// On [`StartLineProgress::Complete`] the cursor is advanced past the
/// terminating CRLF; on a partial result the cursor is left untouched so the
/// same prefix can be re-scanned once more bytes arrive. Malformed lines are
/// hard errors, not partials.
pub fn take_start_line(
    chain: &BlockChain,
    cursor: &mut Cursor,
) -> Result<StartLineProgress, ParseError> {
    let begin = *cursor;
    if chain.is_end(begin) {
        return Ok(StartLineProgress::Partial(StartLineStatus::Empty));
    }

    let mut scan = begin;
    let Some(hit) = chain.seek(&mut scan, b" \r\n") else {
        return partial(chain, begin, StartLineStatus::MethodIncomplete);
    };
    ensure!(hit == b' ', ParseError::InvalidMethod);
    let method_end = scan;
    ensure!(chain.distance(begin, method_end) > 0, ParseError::InvalidMethod);
    let method_bytes = chain.copy_range(begin, method_end);
    let method = Method::from_bytes(&method_bytes).map_err(|_| ParseError::InvalidMethod)?;
    chain.take(&mut scan);

    let target_start = scan;
    let Some(hit) = chain.seek(&mut scan, b" \r\n") else {
        return partial(chain, begin, StartLineStatus::TargetIncomplete);
    };
    ensure!(hit == b' ', ParseError::invalid_target("request line has no version"));
    let target_end = scan;
    ensure!(
        chain.distance(target_start, target_end) > 0,
        ParseError::invalid_target("empty request target")
    );
    chain.take(&mut scan);

    // split the target at the first '?'; the query stays undecoded
    let mut query_scan = target_start;
    let (path_end, query) = match chain.seek(&mut query_scan, b"? ") {
        Some(b'?') => {
            let path_end = query_scan;
            chain.take(&mut query_scan);
            let raw = chain.copy_range(query_scan, target_end);
            let query = String::from_utf8(raw.to_vec())
                .map_err(|_| ParseError::invalid_target("query is not valid utf-8"))?;
            (path_end, Some(query))
        }
        _ => (target_end, None),
    };
    let path = decode_path(&chain.copy_range(target_start, path_end))?;

    let version_start = scan;
    let Some(hit) = chain.seek(&mut scan, b"\r\n") else {
        // "HTTP/1.1" is eight bytes; anything longer without a CR can
        // never become valid
        ensure!(
            chain.distance(version_start, chain.end()) <= 8,
            ParseError::InvalidVersion
        );
        return partial(chain, begin, StartLineStatus::VersionIncomplete);
    };
    ensure!(hit == b'\r', ParseError::InvalidVersion);
    let version = match chain.copy_range(version_start, scan).as_ref() {
        b"HTTP/1.1" => Version::HTTP_11,
        b"HTTP/1.0" => Version::HTTP_10,
        _ => return Err(ParseError::InvalidVersion),
    };
    chain.take(&mut scan);
    match chain.take(&mut scan) {
        None => return partial(chain, begin, StartLineStatus::Incomplete),
        Some(b'\n') => {}
        Some(_) => return Err(ParseError::InvalidVersion),
    }

    ensure!(
        chain.distance(begin, scan) <= MAX_START_LINE_BYTES,
        ParseError::too_long_start_line(MAX_START_LINE_BYTES)
    );

    let target = chain.copy_range(target_start, target_end);
    *cursor = scan;
    Ok(StartLineProgress::Complete(RequestLine { method, target, path, query, version }))
}

/// A partial line is only tolerable while it still fits the size cap.
fn partial(
    chain: &BlockChain,
    begin: Cursor,
    status: StartLineStatus,
) -> Result<StartLineProgress, ParseError> {
    ensure!(
        chain.distance(begin, chain.end()) <= MAX_START_LINE_BYTES,
        ParseError::too_long_start_line(MAX_START_LINE_BYTES)
    );
    Ok(StartLineProgress::Partial(status))
}

/// Decodes percent escapes in the path and validates the result as UTF-8.
/// `%2F` decodes to `/` like every other escape; routing above this layer
/// sees the decoded form.
fn decode_path(raw: &[u8]) -> Result<String, ParseError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let byte = raw[i];
        if byte == b'%' {
            ensure!(
                i + 2 < raw.len(),
                ParseError::invalid_target("truncated percent escape in path")
            );
            let decoded = (hex_digit(raw[i + 1])? << 4) | hex_digit(raw[i + 2])?;
            out.push(decoded);
            i += 3;
        } else {
            out.push(byte);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| ParseError::invalid_target("path is not valid utf-8"))
}

fn hex_digit(byte: u8) -> Result<u8, ParseError> {
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'a'..=b'f' => Ok(byte - b'a' + 10),
        b'A'..=b'F' => Ok(byte - b'A' + 10),
        _ => Err(ParseError::invalid_target("invalid percent escape in path")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;

    fn chain_of(data: &[u8]) -> (BlockChain, Cursor) {
        let pool = BufferPool::with_block_sizes(8, 16);
        let mut chain = BlockChain::new();
        chain.append(&pool, data);
        let cursor = chain.begin();
        (chain, cursor)
    }

    fn parse(data: &[u8]) -> Result<StartLineProgress, ParseError> {
        let (chain, mut cursor) = chain_of(data);
        take_start_line(&chain, &mut cursor)
    }

    fn parse_complete(data: &[u8]) -> RequestLine {
        match parse(data).unwrap() {
            StartLineProgress::Complete(line) => line,
            StartLineProgress::Partial(status) => panic!("unexpected partial: {status:?}"),
        }
    }

    #[test]
    fn plain_get_line() {
        let line = parse_complete(b"GET /a/b HTTP/1.1\r\n");
        assert_eq!(line.method, Method::GET);
        assert_eq!(line.target.as_ref(), b"/a/b");
        assert_eq!(line.path, "/a/b");
        assert_eq!(line.query, None);
        assert_eq!(line.version, Version::HTTP_11);
    }

    #[test]
    fn query_is_split_off_undecoded() {
        let line = parse_complete(b"GET /search?q=%20x&lang=en HTTP/1.0\r\n");
        assert_eq!(line.path, "/search");
        assert_eq!(line.query.as_deref(), Some("q=%20x&lang=en"));
        assert_eq!(line.target.as_ref(), b"/search?q=%20x&lang=en");
        assert_eq!(line.version, Version::HTTP_10);
    }

    #[test]
    fn path_percent_escapes_are_decoded() {
        let line = parse_complete(b"GET /caf%C3%A9/a%2Fb HTTP/1.1\r\n");
        assert_eq!(line.path, "/caf\u{e9}/a/b");
        assert_eq!(line.target.as_ref(), b"/caf%C3%A9/a%2Fb");
    }

    #[test]
    fn cursor_advances_past_crlf_on_complete() {
        let (chain, mut cursor) = chain_of(b"GET / HTTP/1.1\r\nHost: x\r\n");
        let progress = take_start_line(&chain, &mut cursor).unwrap();
        assert!(matches!(progress, StartLineProgress::Complete(_)));
        assert_eq!(chain.copy_range(cursor, chain.end()).as_ref(), b"Host: x\r\n");
    }

    #[test]
    fn partial_statuses_name_the_stalled_component() {
        let cases: &[(&[u8], StartLineStatus)] = &[
            (b"", StartLineStatus::Empty),
            (b"GE", StartLineStatus::MethodIncomplete),
            (b"GET /pa", StartLineStatus::TargetIncomplete),
            (b"GET /pa HTTP/1.", StartLineStatus::VersionIncomplete),
            (b"GET /pa HTTP/1.1\r", StartLineStatus::Incomplete),
        ];
        for (input, expected) in cases {
            let (chain, mut cursor) = chain_of(input);
            let begin = cursor;
            match take_start_line(&chain, &mut cursor).unwrap() {
                StartLineProgress::Partial(status) => assert_eq!(status, *expected),
                StartLineProgress::Complete(line) => panic!("unexpected complete: {line:?}"),
            }
            // partial never moves the cursor
            assert_eq!(cursor, begin);
        }
    }

    #[test]
    fn unknown_version_is_rejected() {
        assert!(matches!(parse(b"GET / HTTP/2.0\r\n"), Err(ParseError::InvalidVersion)));
        assert!(matches!(parse(b"GET / SPDY/3.1\r\n"), Err(ParseError::InvalidVersion)));
    }

    #[test]
    fn bare_lf_terminator_is_rejected() {
        assert!(parse(b"GET / HTTP/1.1\n").is_err());
    }

    #[test]
    fn missing_components_are_rejected() {
        assert!(matches!(parse(b"GET\r\n"), Err(ParseError::InvalidMethod)));
        assert!(parse(b"GET /\r\n").is_err());
        assert!(parse(b"GET  HTTP/1.1\r\n").is_err());
    }

    #[test]
    fn bad_percent_escape_is_rejected() {
        assert!(parse(b"GET /a%zzb HTTP/1.1\r\n").is_err());
        assert!(parse(b"GET /a%2 HTTP/1.1\r\n").is_err());
    }

    #[test]
    fn oversized_line_is_rejected_even_before_terminator() {
        let mut line = Vec::from(&b"GET /"[..]);
        line.resize(MAX_START_LINE_BYTES + 10, b'a');
        let err = parse(&line).unwrap_err();
        assert!(matches!(err, ParseError::TooLongStartLine { .. }));
    }
}
