//! Classifier and engine configuration

use provenant_store::StorageLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Failure classifier settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Matched against failure messages to detect rate limiting
    pub rate_limit_pattern: String,
    /// Free disk below this marks a disk-space failure
    pub min_disk_bytes: u64,
    pub retry_attempts: u32,
    /// Backoff base for network failures
    pub network_retry_delay_ms: u64,
    /// Backoff base for rate-limit failures
    pub rate_limit_retry_delay_ms: u64,
    /// Duration assumed for nodes without a recorded one
    pub default_node_duration_ms: u64,
    /// Let the strategy ledger override default strategies
    pub adaptive: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            rate_limit_pattern: r"(?i)rate.?limit|too many requests|\b429\b".to_string(),
            min_disk_bytes: 1024 * 1024 * 1024,
            retry_attempts: 3,
            network_retry_delay_ms: 1_000,
            rate_limit_retry_delay_ms: 5_000,
            default_node_duration_ms: 1_000,
            adaptive: true,
        }
    }
}

impl ClassifierConfig {
    #[must_use]
    pub fn with_rate_limit_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.rate_limit_pattern = pattern.into();
        self
    }

    #[must_use]
    pub fn with_min_disk_bytes(mut self, bytes: u64) -> Self {
        self.min_disk_bytes = bytes;
        self
    }

    /// Set both backoff bases
    #[must_use]
    pub fn with_retry_delays(mut self, network: Duration, rate_limit: Duration) -> Self {
        self.network_retry_delay_ms = u64::try_from(network.as_millis()).unwrap_or(u64::MAX);
        self.rate_limit_retry_delay_ms = u64::try_from(rate_limit.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_adaptive(mut self, adaptive: bool) -> Self {
        self.adaptive = adaptive;
        self
    }
}

/// Recovery engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Bound on each re-invocation of a step
    pub step_timeout_ms: u64,
    /// Level for `recovery/{attempt_id}` records
    pub record_level: StorageLevel,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 60_000,
            record_level: StorageLevel::Database,
        }
    }
}

impl RecoveryConfig {
    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_record_level(mut self, level: StorageLevel) -> Self {
        self.record_level = level;
        self
    }

    #[inline]
    #[must_use]
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}
