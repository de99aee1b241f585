//! Configuration Module
//!
//! Engine configuration ([`CacheConfig`]) plus server configuration loaded
//! from environment variables for the demo binary.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::TimeDelta;

use crate::cache::{Clock, SystemClock};
use crate::error::{CacheError, Result};

// == Cache Config ==
/// Tuning knobs for a cache engine instance.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum total size cost; `None` means unlimited (and entries need no
    /// size).
    pub size_limit: Option<i64>,
    /// Fraction of the current size removed when the limit is breached.
    /// Must lie in `[0, 1]`.
    pub compaction_percentage: f64,
    /// Minimum interval between background expiration scans.
    pub expiration_scan_frequency: TimeDelta,
    /// Time source; swap in a manual clock for deterministic tests.
    pub clock: Arc<dyn Clock>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size_limit: None,
            compaction_percentage: 0.05,
            expiration_scan_frequency: TimeDelta::seconds(60),
            clock: Arc::new(SystemClock),
        }
    }
}

impl CacheConfig {
    /// Sets a total size cap.
    pub fn with_size_limit(mut self, limit: i64) -> Self {
        self.size_limit = Some(limit);
        self
    }

    /// Sets the compaction fraction.
    pub fn with_compaction_percentage(mut self, percentage: f64) -> Self {
        self.compaction_percentage = percentage;
        self
    }

    /// Sets the minimum interval between expiration scans.
    pub fn with_expiration_scan_frequency(mut self, frequency: TimeDelta) -> Self {
        self.expiration_scan_frequency = frequency;
        self
    }

    /// Swaps the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// `InvalidArgument` for a negative size limit or a compaction
    /// percentage outside `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if let Some(limit) = self.size_limit {
            if limit < 0 {
                return Err(CacheError::InvalidArgument(
                    "size limit must be non-negative".to_string(),
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.compaction_percentage) {
            return Err(CacheError::InvalidArgument(
                "compaction percentage must be between 0 and 1 inclusive".to_string(),
            ));
        }
        Ok(())
    }
}

// == Server Config ==
/// Demo server configuration parameters.
///
/// All values can be configured via environment variables with sensible
/// defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port
    pub server_port: u16,
    /// Default TTL in seconds for entries stored without explicit TTL
    pub default_ttl: u64,
    /// Background expiration-scan task interval in seconds
    pub cleanup_interval: u64,
    /// Optional total size cap for the cache (bytes of stored values)
    pub size_limit: Option<i64>,
    /// Optional backing-store root directory override
    pub storage_dir: Option<PathBuf>,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    /// - `DEFAULT_TTL` - Default TTL in seconds (default: 300)
    /// - `CLEANUP_INTERVAL` - Scan task frequency in seconds (default: 60)
    /// - `SIZE_LIMIT` - Total size cap in bytes (default: unlimited)
    /// - `STORAGE_DIR` - Backing store directory (default: per-user data dir)
    pub fn from_env() -> Self {
        Self {
            server_port: env::var("SERVER_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            default_ttl: env::var("DEFAULT_TTL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            cleanup_interval: env::var("CLEANUP_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            size_limit: env::var("SIZE_LIMIT").ok().and_then(|v| v.parse().ok()),
            storage_dir: env::var("STORAGE_DIR").ok().map(PathBuf::from),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 3000,
            default_ttl: 300,
            cleanup_interval: 60,
            size_limit: None,
            storage_dir: None,
        }
    }
}
