//! Date header value management.
//!
//! Formatting an RFC 7231 date per response is wasted work under load; this
//! service formats it once and refreshes it from a background task, so every
//! response samples a pre-built header value.

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::HeaderValue;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Maintains the current `Date` header value, refreshed periodically.
///
/// The background task is aborted when the service drops, so a stopped
/// server leaves no timer behind.
pub struct DateService {
    current: Arc<ArcSwap<Bytes>>,
    handle: tokio::task::JoinHandle<()>,
}

impl DateService {
    /// Must be called within a tokio runtime.
    pub fn new() -> Self {
        Self::with_update_interval(Duration::from_millis(800))
    }

    fn with_update_interval(update_interval: Duration) -> Self {
        let current = Arc::new(ArcSwap::from_pointee(format_now()));
        let current_arc = Arc::clone(&current);

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(update_interval).await;
                current_arc.store(Arc::new(format_now()));
            }
        });

        DateService { current, handle }
    }

    /// The current date as a ready-to-append header value.
    pub fn header_value(&self) -> HeaderValue {
        let date = self.current.load().as_ref().clone();
        // SAFETY: the bytes come from `httpdate`, which only emits visible
        // ASCII
        unsafe { HeaderValue::from_maybe_shared_unchecked(date) }
    }
}

impl Default for DateService {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DateService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DateService").finish_non_exhaustive()
    }
}

impl Drop for DateService {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn format_now() -> Bytes {
    Bytes::from(httpdate::fmt_http_date(SystemTime::now()))
}
