//! Server tuning knobs and their defaults.

use std::time::Duration;

use crate::codec::HeaderLimits;
use crate::connection::DEFAULT_WRITE_BEHIND_BUDGET;

/// Tuning knobs shared by every connection of a [`Server`].
///
/// The defaults are meant for a server sitting behind untrusted clients:
/// bounded header sizes, a keep-alive idle timeout and a cap on unconfirmed
/// response bytes per connection.
///
/// [`Server`]: crate::server::Server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of runtime worker threads. Defaults to half the logical cores,
    /// clamped to `1..=16`.
    pub worker_threads: usize,
    /// Response bytes a connection may queue ahead of socket confirmation
    /// before writes start waiting.
    pub write_behind_budget: usize,
    /// Caps on header count and total header bytes per request.
    pub header_limits: HeaderLimits,
    /// How long an idle keep-alive connection may sit between requests, and
    /// how long a started request may stall mid-headers.
    pub keep_alive_timeout: Duration,
    /// How long to spend discarding an unread request body before giving up
    /// and closing the connection instead.
    pub drain_timeout: Duration,
    /// Grace period a stopping server gives in-flight connections before
    /// aborting them.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            write_behind_budget: DEFAULT_WRITE_BEHIND_BUDGET,
            header_limits: HeaderLimits::default(),
            keep_alive_timeout: Duration::from_secs(75),
            drain_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Half the logical cores, clamped to `1..=16`. Request processing is mostly
/// I/O bound, so more threads than this just adds scheduler churn.
pub fn default_worker_threads() -> usize {
    (num_cpus::get() / 2).clamp(1, 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_threads_stay_in_bounds() {
        let n = default_worker_threads();
        assert!((1..=16).contains(&n));
    }

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(config.write_behind_budget, 64 * 1024);
        assert_eq!(config.keep_alive_timeout, Duration::from_secs(75));
        assert!(config.drain_timeout < config.keep_alive_timeout);
    }
}
