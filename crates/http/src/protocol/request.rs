//! Parsed request-line data and header predicates.

use bytes::Bytes;
use http::header::{CONNECTION, EXPECT};
use http::{HeaderMap, Method, Version};

/// The result of parsing a request start line.
///
/// `path` has percent-escapes decoded; `target` keeps the raw bytes exactly
/// as received, and `query` is the raw substring after the first `?` (without
/// the `?` itself).
#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: Method,
    pub target: Bytes,
    pub path: String,
    pub query: Option<String>,
    pub version: Version,
}

impl RequestLine {
    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }
}

impl Default for RequestLine {
    /// `GET / HTTP/1.1`, the placeholder before a request line is parsed.
    fn default() -> Self {
        Self {
            method: Method::GET,
            target: Bytes::from_static(b"/"),
            path: String::from("/"),
            query: None,
            version: Version::HTTP_11,
        }
    }
}

/// True when any `Connection` header value contains `token` as a
/// comma-separated element (case-insensitive).
///
/// `Connection: keep-alive, TE` matches `keep-alive`; `Connection: close`
/// does not match `clo`.
pub fn connection_has_token(headers: &HeaderMap, token: &str) -> bool {
    headers.get_all(CONNECTION).iter().any(|value| {
        value
            .to_str()
            .map(|s| s.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}

/// True when the request carries `Expect: 100-continue` and is HTTP/1.1.
///
/// HTTP/1.0 clients may send the header but must not rely on the interim
/// response, so the expectation is only honored on 1.1.
pub fn expects_continue(version: Version, headers: &HeaderMap) -> bool {
    version == Version::HTTP_11
        && headers
            .get(EXPECT)
            .and_then(|value| value.to_str().ok())
            .map(|s| s.trim().eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
}
