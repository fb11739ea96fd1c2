//! Configuration management for Tabulite
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (TABULITE_* prefix, highest precedence)
//! 2. tabulite.local.toml (gitignored, local overrides)
//! 3. tabulite.toml (git-tracked, project config)
//! 4. ~/.config/tabulite/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::DataLayout;

/// Main Tabulite configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TabuliteConfig {
    pub server: ServerConfig,
    pub failover: FailoverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Top-level data directory; the commit-log and meta-log layout
    /// hangs off this root.
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".tabulite/data"),
        }
    }
}

/// Range-server failure recovery tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// How long the master waits for a disconnected server to come back
    /// before declaring it lost and starting recovery.
    pub grace_period_ms: u64,

    /// Back-off between attempts to acquire a failed server's lock file.
    pub connection_retry_interval_ms: u64,

    /// Default deadline for recovery RPCs.
    pub request_timeout_ms: u64,

    /// Player-side flush threshold across all ranges, in bytes.
    pub flush_limit_aggregate: usize,

    /// Player-side flush threshold for a single range, in bytes.
    pub flush_limit_per_range: usize,

    /// End-to-end deadline for one replay attempt.
    pub replay_timeout_ms: u64,

    /// Maximum attempts for one recover-ranges operation before it
    /// completes with an error.
    pub retry_cap: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 30_000,
            connection_retry_interval_ms: 3_000,
            request_timeout_ms: 60_000,
            flush_limit_aggregate: 4 * 1024 * 1024,
            flush_limit_per_range: 1024 * 1024,
            replay_timeout_ms: 600_000,
            retry_cap: 12,
        }
    }
}

impl FailoverConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn connection_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connection_retry_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn replay_timeout(&self) -> Duration {
        Duration::from_millis(self.replay_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = TabuliteConfig::default();
        assert!(config.failover.grace_period() > Duration::ZERO);
        assert!(config.failover.flush_limit_per_range <= config.failover.flush_limit_aggregate);
        assert!(config.failover.retry_cap > 0);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = TabuliteConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: TabuliteConfig = toml::from_str(&text).unwrap();
        assert_eq!(
            parsed.failover.replay_timeout_ms,
            config.failover.replay_timeout_ms
        );
        assert_eq!(parsed.server.data_dir, config.server.data_dir);
    }
}
