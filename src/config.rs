//! Worker configuration.
//!
//! Nested `serde`-derived structs with a `Default` impl per concern. This
//! crate is embedded directly by a Rust application, so there is no
//! `from_json`/JS bridge here, only plain construction and `validate()`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for a [`crate::worker::Worker`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub pool: PoolConfig,
    pub store: StoreConfig,
    /// How often the application should send `Command::Heartbeat`.
    pub heartbeat_interval: std::time::Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            store: StoreConfig::default(),
            heartbeat_interval: std::time::Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.pool.validate()?;
        self.store.validate()?;
        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat_interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Timeouts and retry policy for [`crate::pool::RelayPool`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Socket open / ping-reply timeout.
    pub relay_timeout: std::time::Duration,
    /// EOSE wait / publish timeout.
    pub response_timeout: std::time::Duration,
    /// Coalescing window for post-EOSE streaming flushes.
    pub streaming_buffer_window: std::time::Duration,
    /// Close a socket idle longer than this with no subscription targeting it.
    pub idle_timeout: Option<std::time::Duration>,
    /// A streaming socket silent this long is ping-checked for zombie status.
    pub ping_idle_threshold: std::time::Duration,
    /// Cap on the exponential backoff delay.
    pub backoff_cap: std::time::Duration,
    /// Consecutive failures before a relay is given up on for this session.
    pub max_retries: u32,
    /// Bounded ring size for `PoolState`'s log history.
    pub log_ring_capacity: usize,
    /// Expected `Command::Heartbeat` cadence, used only to detect a clock
    /// jump (the process was suspended for longer than this). Should match
    /// `WorkerConfig::heartbeat_interval`.
    pub heartbeat_interval_hint: std::time::Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            relay_timeout: std::time::Duration::from_secs(5),
            response_timeout: std::time::Duration::from_secs(8),
            streaming_buffer_window: std::time::Duration::from_secs(2),
            idle_timeout: None,
            ping_idle_threshold: std::time::Duration::from_secs(55),
            backoff_cap: std::time::Duration::from_secs(16),
            max_retries: 31,
            log_ring_capacity: 200,
            heartbeat_interval_hint: std::time::Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.relay_timeout.is_zero() {
            return Err("relay_timeout must be greater than 0".to_string());
        }
        if self.max_retries == 0 {
            return Err("max_retries must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Backoff delay after `k` consecutive connect/close failures without an
    /// intervening EOSE: `2^(ceil(log2(k+1))-1)` seconds, capped at
    /// `backoff_cap` — the schedule runs 1, 2, 2, 4, 4, 4, 4, 8, ..., capped
    /// at 16s by default.
    pub fn backoff_for(&self, k: u32) -> std::time::Duration {
        let k = k.max(1) as f64;
        let level = ((k + 1.0).log2().ceil() as i64 - 1).max(0) as u32;
        let secs = 1u64.checked_shl(level).unwrap_or(u64::MAX);
        std::time::Duration::from_secs(secs).min(self.backoff_cap)
    }
}

/// Where a [`crate::store::LocalStore`] persists its SQLite database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorePath {
    Memory,
    File(PathBuf),
}

/// Configuration for [`crate::store::LocalStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: StorePath,
    /// Skip `Verifier::verify` on save (trusted-source fast path).
    pub skip_verification: bool,
    /// Retain `sig` in the stored blob instead of stripping it.
    pub keep_signatures: bool,
    /// Create the `events_fts` virtual table and its sync triggers.
    pub enable_fts: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: StorePath::Memory,
            skip_verification: false,
            keep_signatures: true,
            enable_fts: false,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), String> {
        if let StorePath::File(path) = &self.path {
            if path.as_os_str().is_empty() {
                return Err("store file path must not be empty".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(WorkerConfig::default().validate().is_ok());
    }

    #[test]
    fn backoff_matches_schedule() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.backoff_for(1).as_secs(), 1);
        assert_eq!(cfg.backoff_for(2).as_secs(), 2);
        assert_eq!(cfg.backoff_for(3).as_secs(), 2);
        assert_eq!(cfg.backoff_for(4).as_secs(), 4);
        assert_eq!(cfg.backoff_for(7).as_secs(), 4);
        assert_eq!(cfg.backoff_for(8).as_secs(), 8);
        assert_eq!(cfg.backoff_for(1000).as_secs(), 16);
    }

    #[test]
    fn rejects_zero_heartbeat() {
        let mut cfg = WorkerConfig::default();
        cfg.heartbeat_interval = std::time::Duration::from_secs(0);
        assert!(cfg.validate().is_err());
    }
}
