//! Pipeline configuration types
//!
//! This module defines the configuration the core pipeline needs. Loading it
//! from a file and resolving credentials is handled by the application layer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What gets written for each captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// One raw record per frame
    #[default]
    Raw,
    /// One record per decoded signal; unknown IDs are skipped
    Decoded,
    /// Raw record followed by decoded records
    Both,
}

impl OperatingMode {
    pub fn writes_raw(self) -> bool {
        matches!(self, OperatingMode::Raw | OperatingMode::Both)
    }

    pub fn decodes(self) -> bool {
        matches!(self, OperatingMode::Decoded | OperatingMode::Both)
    }
}

impl std::str::FromStr for OperatingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(OperatingMode::Raw),
            "decoded" => Ok(OperatingMode::Decoded),
            "both" => Ok(OperatingMode::Both),
            other => Err(format!("unknown mode '{}' (expected raw, decoded or both)", other)),
        }
    }
}

/// Batch Buffer bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Flush when this many records are buffered
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Flush when the oldest buffered record is this old (milliseconds)
    #[serde(default = "default_max_batch_age_ms")]
    pub max_batch_age_ms: u64,

    /// Hard ceiling; the oldest record is evicted beyond this
    #[serde(default = "default_max_buffered_records")]
    pub max_buffered_records: usize,
}

fn default_max_batch_size() -> usize {
    200
}

fn default_max_batch_age_ms() -> u64 {
    1000
}

fn default_max_buffered_records() -> usize {
    50_000
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_batch_age_ms: default_max_batch_age_ms(),
            max_buffered_records: default_max_buffered_records(),
        }
    }
}

impl BatchConfig {
    pub fn max_batch_age(&self) -> Duration {
        Duration::from_millis(self.max_batch_age_ms)
    }

    /// Ceiling actually enforced: never below one full batch
    pub fn effective_ceiling(&self) -> usize {
        self.max_buffered_records.max(self.max_batch_size).max(1)
    }
}

/// Durable Writer retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total write attempts per batch before it is dropped
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,

    /// Delay after the first failed attempt (milliseconds)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on any single delay (milliseconds)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_retry_ceiling() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: default_retry_ceiling(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay to wait after the given failed attempt (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }
}

/// Configuration for the pipeline controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Vehicle/pack identifier stamped on every record
    pub car_id: String,

    /// Optional static `source` tag on every written line
    #[serde(default)]
    pub source_tag: Option<String>,

    #[serde(default)]
    pub mode: OperatingMode,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Bound on a single Frame Source read (milliseconds)
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Re-open attempts after the adapter port closes
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    /// Delay between re-open attempts (milliseconds)
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Bound on the final flush at shutdown (milliseconds)
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Interval between summary log lines (seconds, 0 = disabled)
    #[serde(default = "default_stats_interval_s")]
    pub stats_interval_s: u64,
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_delay_ms() -> u64 {
    2000
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

fn default_stats_interval_s() -> u64 {
    60
}

impl PipelineConfig {
    /// Create a configuration with default settings
    pub fn new(car_id: impl Into<String>) -> Self {
        Self {
            car_id: car_id.into(),
            source_tag: None,
            mode: OperatingMode::default(),
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            read_timeout_ms: default_read_timeout_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            stats_interval_s: default_stats_interval_s(),
        }
    }

    /// Builder method: set the operating mode
    pub fn with_mode(mut self, mode: OperatingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Builder method: tag written lines with `source=<tag>`
    pub fn with_source_tag(mut self, tag: impl Into<String>) -> Self {
        self.source_tag = Some(tag.into());
        self
    }

    /// Builder method: set batch bounds
    pub fn with_batch(mut self, max_batch_size: usize, max_batch_age: Duration) -> Self {
        self.batch.max_batch_size = max_batch_size;
        self.batch.max_batch_age_ms = max_batch_age.as_millis() as u64;
        self
    }

    /// Builder method: set the buffer hard ceiling
    pub fn with_buffer_ceiling(mut self, max_buffered_records: usize) -> Self {
        self.batch.max_buffered_records = max_buffered_records;
        self
    }

    /// Builder method: set the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Builder method: set the read timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder method: set reconnect policy
    pub fn with_reconnect(mut self, attempts: u32, delay: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Builder method: set drain timeout
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_s > 0).then(|| Duration::from_secs(self.stats_interval_s))
    }
}
