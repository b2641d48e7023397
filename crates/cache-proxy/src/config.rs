//! Tunable constants, resolved from compiled-in defaults overlaid by
//! environment variables.
//!
//! This follows the same "env var with a parsed-and-defaulted fallback" idiom
//! this crate's own singletons use elsewhere (a missing or unparseable
//! variable silently falls back to the default rather than erroring) — the
//! difference here is that [`Config`] is a plain value type, not a
//! `OnceLock` global, so tests and multiple server instances can each hold
//! their own.

use std::time::Duration;

use crate::buffer::{DEFAULT_INITIAL_CAPACITY, MAX_RESPONSE_SIZE};
use crate::cache::{CACHE_TTL, MAX_CACHE_SIZE};

/// The proxy's compile-time defaults, overridable via environment variables
/// or (on the CLI binary) command-line flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port the listener binds to.
    pub port: u16,
    /// `listen()` backlog.
    pub listen_backlog: i32,
    /// Maximum number of distinct URLs held in the cache at once.
    pub max_cache_size: usize,
    /// Per-buffer ceiling, in bytes.
    pub max_response_size: usize,
    /// Time a cache entry remains eligible for hits after insertion.
    pub cache_ttl: Duration,
    /// Starting allocation for a freshly created [`crate::buffer::StreamBuffer`].
    pub initial_buffer_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 80,
            listen_backlog: 50,
            max_cache_size: MAX_CACHE_SIZE,
            max_response_size: MAX_RESPONSE_SIZE,
            cache_ttl: CACHE_TTL,
            initial_buffer_capacity: DEFAULT_INITIAL_CAPACITY,
        }
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Config {
    /// Build a [`Config`] starting from [`Config::default`] and overlaying
    /// any recognized environment variables on top.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parsed("CACHE_PROXY_PORT").unwrap_or(defaults.port),
            listen_backlog: env_parsed("CACHE_PROXY_BACKLOG").unwrap_or(defaults.listen_backlog),
            max_cache_size: env_parsed("CACHE_PROXY_MAX_CACHE_SIZE").unwrap_or(defaults.max_cache_size),
            max_response_size: env_parsed("CACHE_PROXY_MAX_RESPONSE_SIZE_BYTES")
                .unwrap_or(defaults.max_response_size),
            cache_ttl: env_parsed::<u64>("CACHE_PROXY_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
            initial_buffer_capacity: env_parsed("CACHE_PROXY_INITIAL_BUFFER_CAPACITY")
                .unwrap_or(defaults.initial_buffer_capacity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_spec_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 80);
        assert_eq!(cfg.listen_backlog, 50);
        assert_eq!(cfg.max_cache_size, 50);
        assert_eq!(cfg.max_response_size, 100 * 1024 * 1024);
        assert_eq!(cfg.cache_ttl, Duration::from_secs(300));
        assert_eq!(cfg.initial_buffer_capacity, 16 * 1024);
    }

    #[test]
    fn test_from_env_falls_back_to_defaults_when_unset() {
        // This test relies on these vars not being set in the test process
        // environment; the crate never sets them itself.
        std::env::remove_var("CACHE_PROXY_PORT");
        let cfg = Config::from_env();
        assert_eq!(cfg.port, Config::default().port);
    }
}
