//! Configuration for the delivery pipeline
//!
//! Each struct is one section of the service TOML file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest accepted `max_records`. One batch is one ledger transaction.
pub const MAX_BATCH_RECORDS: usize = 100_000;

/// When a batch is flushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Flush as soon as this many records are pending (default: 10)
    pub max_records: usize,
    /// Flush when no record has arrived for this long (default: 3s)
    #[serde(rename = "max_delay_ms", with = "duration_millis")]
    pub max_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_records: 10,
            max_delay: Duration::from_millis(3000),
        }
    }
}

impl BatchConfig {
    pub fn new(max_records: usize, max_delay: Duration) -> Self {
        BatchConfig {
            max_records,
            max_delay,
        }
    }

    /// Capacity of the producer queue: twice the batch size, within what a
    /// tokio channel can hold.
    pub fn queue_capacity(&self) -> usize {
        self.max_records
            .saturating_mul(2)
            .clamp(1, tokio::sync::Semaphore::MAX_PERMITS)
    }
}

/// Retry behaviour for a failed transaction.
///
/// `attempts` loop iterations each sleep `i * backoff_unit` and reconnect
/// after a failure; one last attempt follows the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    #[serde(rename = "backoff_unit_ms", with = "duration_millis")]
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 5,
            backoff_unit: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Total number of `exec_all` calls a batch may cost.
    pub fn max_calls(&self) -> u32 {
        self.attempts.saturating_add(1)
    }

    /// Sleep before reconnecting after the failure of loop attempt `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(attempt)
    }

    /// No sleeping, for tests.
    pub fn immediate(attempts: u32) -> Self {
        RetryPolicy {
            attempts,
            backoff_unit: Duration::ZERO,
        }
    }
}

/// How the target database is named.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// strftime pattern evaluated in UTC (default: `log_%Y_%m`)
    pub pattern: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig {
            pattern: "log_%Y_%m".to_string(),
        }
    }
}

/// Scheduled rotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RotationConfig {
    /// Zero disables the scheduler.
    #[serde(rename = "interval_ms", with = "duration_millis")]
    pub interval: Duration,
}

impl RotationConfig {
    pub fn enabled(&self) -> bool {
        !self.interval.is_zero()
    }
}

/// Serde helper for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
