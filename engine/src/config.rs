//! Configuration for the sync engine.
//!
//! Every knob has a default, so a config file only needs the fields it
//! changes:
//!
//! ```toml
//! base_url = "https://api.example.com"
//! batch_size = 25
//! default_strategy = "server_wins"
//!
//! [retry]
//! max_attempts = 5
//! ```

use crate::{error::Result, ConflictStrategy, Error, SchemaVersion};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for sync cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the sync endpoint; `/sync/pull` and `/sync/push` are appended.
    pub base_url: String,
    /// Maximum operations per push request.
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// Period of the auto-sync timer.
    pub auto_sync_interval_minutes: u64,
    /// `auto_sync` does nothing if the last successful sync is more recent than this.
    pub min_auto_sync_interval_secs: u64,
    /// Strategy applied when a conflict is detected.
    pub default_strategy: ConflictStrategy,
    /// Time bound on each pull/push request.
    pub request_timeout_secs: u64,
    pub schema_version: SchemaVersion,
    /// Treat a `poor` link as good enough to sync.
    pub sync_on_poor_connection: bool,
    /// How long synced operations are kept before cleanup.
    pub retention_days: u64,
    pub health: HealthThresholds,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            batch_size: 50,
            retry: RetryPolicy::default(),
            auto_sync_interval_minutes: 15,
            min_auto_sync_interval_secs: 5 * 60,
            default_strategy: ConflictStrategy::Manual,
            request_timeout_secs: 30,
            schema_version: 1,
            sync_on_poor_connection: true,
            retention_days: 7,
            health: HealthThresholds::default(),
        }
    }
}

impl SyncConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let input = std::fs::read_to_string(path)?;
        Self::from_toml_str(&input)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config("backoff_multiplier must be >= 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config("request_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_default_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn with_auto_sync_interval_minutes(mut self, minutes: u64) -> Self {
        self.auto_sync_interval_minutes = minutes;
        self
    }

    pub fn with_min_auto_sync_interval(mut self, interval: Duration) -> Self {
        self.min_auto_sync_interval_secs = interval.as_secs();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_sync_on_poor_connection(mut self, enabled: bool) -> Self {
        self.sync_on_poor_connection = enabled;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn min_auto_sync_interval(&self) -> Duration {
        Duration::from_secs(self.min_auto_sync_interval_secs)
    }

    pub fn auto_sync_interval(&self) -> Duration {
        Duration::from_secs(self.auto_sync_interval_minutes.saturating_mul(60))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(24 * 3600))
    }
}

/// Exponential backoff between attempts of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Default `max_retries` of new operations.
    pub max_attempts: u32,
    pub backoff_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Cap on any single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 5 * 60 * 1_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_backoff_delay(mut self, delay: Duration) -> Self {
        self.backoff_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// `min(backoff_delay × multiplier^attempts, max_delay)`.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(i32::MAX as u32) as i32;
        let delay = self.backoff_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Limits used to derive the sync health signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// Consecutive failed cycles that turn health to `error`.
    pub error_count: u32,
    /// Hours without a successful sync before health turns to `warning`.
    pub stale_after_hours: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            error_count: 3,
            stale_after_hours: 24,
        }
    }
}
