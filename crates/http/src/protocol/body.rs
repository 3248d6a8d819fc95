//! Request body framing rules.

use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Version};

use super::error::ParseError;

/// How the bytes of a message body are delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// No body bytes belong to this message.
    Empty,
    /// Exactly this many body bytes follow the header section.
    Length(u64),
    /// The body is chunk-encoded and ends at the terminal zero chunk.
    Chunked,
    /// The body runs until the peer closes the connection (HTTP/1.0 only).
    UntilClose,
}

impl BodyKind {
    /// Picks the framing strategy for a request, in precedence order:
    /// `Transfer-Encoding` ending in `chunked`, then a valid
    /// `Content-Length`, then version defaults.
    ///
    /// `request_keep_alive` is the keep-alive decision derived from the
    /// request headers alone; a non-keep-alive HTTP/1.0 request without
    /// explicit framing reads until close.
    pub fn for_request(
        version: Version,
        headers: &HeaderMap,
        request_keep_alive: bool,
    ) -> Result<BodyKind, ParseError> {
        if headers.contains_key(TRANSFER_ENCODING) {
            return if last_transfer_encoding_is_chunked(headers) {
                Ok(BodyKind::Chunked)
            } else {
                Err(ParseError::invalid_header("transfer-encoding does not end in chunked"))
            };
        }

        if let Some(length) = parse_content_length(headers)? {
            return Ok(if length == 0 { BodyKind::Empty } else { BodyKind::Length(length) });
        }

        match version {
            Version::HTTP_11 => Ok(BodyKind::Empty),
            _ if request_keep_alive => Ok(BodyKind::Empty),
            _ => Ok(BodyKind::UntilClose),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, BodyKind::Empty)
    }

    /// The known body length, when the framing fixes one.
    pub fn length(&self) -> Option<u64> {
        match self {
            BodyKind::Empty => Some(0),
            BodyKind::Length(n) => Some(*n),
            _ => None,
        }
    }
}

/// True when the final encoding across all `Transfer-Encoding` values is
/// `chunked`. Earlier tokens (`gzip, chunked`) are not interpreted here;
/// only the last one decides the framing.
pub(crate) fn last_transfer_encoding_is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter(|token| !token.trim().is_empty())
        .next_back()
        .map(|token| token.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

/// Parses `Content-Length`, tolerating repeated identical values and
/// rejecting everything else that is ambiguous or malformed.
fn parse_content_length(headers: &HeaderMap) -> Result<Option<u64>, ParseError> {
    let mut result: Option<u64> = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let text = value
            .to_str()
            .map_err(|_| ParseError::invalid_content_length("not ascii"))?
            .trim();
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::invalid_content_length(format!("malformed value {text:?}")));
        }
        let parsed: u64 = text
            .parse()
            .map_err(|_| ParseError::invalid_content_length("value overflows u64"))?;
        match result {
            None => result = Some(parsed),
            Some(existing) if existing == parsed => {}
            Some(existing) => {
                return Err(ParseError::invalid_content_length(format!(
                    "conflicting values {existing} and {parsed}"
                )));
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let headers = headers(&[("transfer-encoding", "chunked"), ("content-length", "10")]);
        let kind = BodyKind::for_request(Version::HTTP_11, &headers, true).unwrap();
        assert_eq!(kind, BodyKind::Chunked);
    }

    #[test]
    fn chunked_must_be_last_encoding() {
        let ok = headers(&[("transfer-encoding", "gzip, chunked")]);
        assert_eq!(BodyKind::for_request(Version::HTTP_11, &ok, true).unwrap(), BodyKind::Chunked);

        let bad = headers(&[("transfer-encoding", "chunked, gzip")]);
        assert!(BodyKind::for_request(Version::HTTP_11, &bad, true).is_err());
    }

    #[test]
    fn content_length_zero_is_empty() {
        let headers = headers(&[("content-length", "0")]);
        let kind = BodyKind::for_request(Version::HTTP_11, &headers, true).unwrap();
        assert_eq!(kind, BodyKind::Empty);
    }

    #[test]
    fn repeated_identical_content_length_is_tolerated() {
        let headers = headers(&[("content-length", "42"), ("content-length", "42")]);
        let kind = BodyKind::for_request(Version::HTTP_11, &headers, true).unwrap();
        assert_eq!(kind, BodyKind::Length(42));
    }

    #[test]
    fn conflicting_content_length_is_rejected() {
        let headers = headers(&[("content-length", "42"), ("content-length", "7")]);
        assert!(BodyKind::for_request(Version::HTTP_11, &headers, true).is_err());
    }

    #[test]
    fn malformed_content_length_is_rejected() {
        for bad in ["abc", "-1", "1 2", "+5", ""] {
            let mut map = HeaderMap::new();
            map.append(CONTENT_LENGTH, HeaderValue::from_str(bad).unwrap());
            assert!(BodyKind::for_request(Version::HTTP_11, &map, true).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn http10_without_framing_reads_until_close() {
        let kind = BodyKind::for_request(Version::HTTP_10, &HeaderMap::new(), false).unwrap();
        assert_eq!(kind, BodyKind::UntilClose);

        let kind = BodyKind::for_request(Version::HTTP_10, &HeaderMap::new(), true).unwrap();
        assert_eq!(kind, BodyKind::Empty);
    }

    #[test]
    fn http11_without_framing_is_empty() {
        let kind = BodyKind::for_request(Version::HTTP_11, &HeaderMap::new(), true).unwrap();
        assert_eq!(kind, BodyKind::Empty);
    }
}
