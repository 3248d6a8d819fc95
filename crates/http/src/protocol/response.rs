//! Response status rules.

use http::StatusCode;

/// True when a response with this status is allowed to carry a body.
///
/// 101 (switching protocols), 204, 205 and 304 responses are always
/// body-less; for them the engine neither auto-appends `Content-Length: 0`
/// nor switches to chunked framing.
pub fn status_can_have_body(status: StatusCode) -> bool {
    !matches!(status.as_u16(), 101 | 204 | 205 | 304)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bodyless_statuses() {
        assert!(!status_can_have_body(StatusCode::SWITCHING_PROTOCOLS));
        assert!(!status_can_have_body(StatusCode::NO_CONTENT));
        assert!(!status_can_have_body(StatusCode::RESET_CONTENT));
        assert!(!status_can_have_body(StatusCode::NOT_MODIFIED));
    }

    #[test]
    fn ordinary_statuses_can_have_body() {
        assert!(status_can_have_body(StatusCode::OK));
        assert!(status_can_have_body(StatusCode::CREATED));
        assert!(status_can_have_body(StatusCode::NOT_FOUND));
        assert!(status_can_have_body(StatusCode::INTERNAL_SERVER_ERROR));
    }
}
