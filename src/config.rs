//! Storage configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Lowest queue poll interval we accept without `allow_unsafe_values`. Going
/// below this turns the dequeue wait loop into a busy poll against the
/// database.
const MINIMUM_QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Configuration for the durable storage layer.
///
/// All durations deserialize from humantime strings (`"15s"`, `"30m"`).
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Schema (namespace) that owns every granary table.
    #[serde(default = "default_schema_name")]
    pub schema_name: String,

    /// Upper bound on how long an idle dequeue loop sleeps before re-checking
    /// the queue table, absent any wake-up signal.
    #[serde(default = "default_queue_poll_interval", with = "humantime_serde")]
    pub queue_poll_interval: Duration,

    /// How long a fetched-but-unfinished queue entry stays invisible before
    /// it is treated as abandoned and re-offered to workers.
    #[serde(default = "default_invisibility_timeout", with = "humantime_serde")]
    pub invisibility_timeout: Duration,

    /// How long maintenance workers wait for the cluster-wide lock before
    /// concluding another server owns the sweep.
    #[serde(default = "default_distributed_lock_timeout", with = "humantime_serde")]
    pub distributed_lock_timeout: Duration,

    /// Pause between full passes of the expiration manager.
    #[serde(
        default = "default_job_expiration_check_interval",
        with = "humantime_serde"
    )]
    pub job_expiration_check_interval: Duration,

    /// Pause between full passes of the counters aggregator.
    #[serde(
        default = "default_counters_aggregate_interval",
        with = "humantime_serde"
    )]
    pub counters_aggregate_interval: Duration,

    /// Number of expired rows deleted per batch during a sweep.
    #[serde(default = "default_delete_expired_batch_size")]
    pub delete_expired_batch_size: i64,

    /// Select the pessimistic (row-locking) dequeue strategy when true, the
    /// optimistic (version-counter) strategy when false.
    #[serde(default = "default_use_native_transactions")]
    pub use_native_transactions: bool,

    /// Subscribe to the database's change-notification channel so idle
    /// workers wake without waiting out a poll interval.
    #[serde(default)]
    pub enable_long_polling: bool,

    /// Bypass the minimum-poll-interval floor. Intended for tests.
    #[serde(default)]
    pub allow_unsafe_values: bool,
}

fn default_schema_name() -> String {
    "granary".to_string()
}

fn default_queue_poll_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_invisibility_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_distributed_lock_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_job_expiration_check_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_counters_aggregate_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_delete_expired_batch_size() -> i64 {
    1000
}

fn default_use_native_transactions() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            schema_name: default_schema_name(),
            queue_poll_interval: default_queue_poll_interval(),
            invisibility_timeout: default_invisibility_timeout(),
            distributed_lock_timeout: default_distributed_lock_timeout(),
            job_expiration_check_interval: default_job_expiration_check_interval(),
            counters_aggregate_interval: default_counters_aggregate_interval(),
            delete_expired_batch_size: default_delete_expired_batch_size(),
            use_native_transactions: default_use_native_transactions(),
            enable_long_polling: false,
            allow_unsafe_values: false,
        }
    }
}

impl StorageConfig {
    /// Check every recognized option, naming the offending field on failure.
    pub fn validate(&self) -> Result<()> {
        if self.schema_name.is_empty() || self.schema_name.contains('"') {
            return Err(Error::configuration(
                "schema_name must be a non-empty identifier without quotes",
            ));
        }

        positive(self.invisibility_timeout, "invisibility_timeout")?;
        positive(self.distributed_lock_timeout, "distributed_lock_timeout")?;
        positive(
            self.job_expiration_check_interval,
            "job_expiration_check_interval",
        )?;
        positive(
            self.counters_aggregate_interval,
            "counters_aggregate_interval",
        )?;
        positive(self.queue_poll_interval, "queue_poll_interval")?;

        if !self.allow_unsafe_values && self.queue_poll_interval < MINIMUM_QUEUE_POLL_INTERVAL {
            return Err(Error::configuration(format!(
                "queue_poll_interval of {:?} is below the suggested minimum of {:?}; \
                 set allow_unsafe_values to override",
                self.queue_poll_interval, MINIMUM_QUEUE_POLL_INTERVAL
            )));
        }

        if self.delete_expired_batch_size <= 0 {
            return Err(Error::configuration(format!(
                "delete_expired_batch_size must be positive, got {}",
                self.delete_expired_batch_size
            )));
        }

        Ok(())
    }
}

fn positive(value: Duration, field: &str) -> Result<()> {
    if value.is_zero() {
        return Err(Error::configuration(format!(
            "{field} must be positive, got {value:?}"
        )));
    }
    Ok(())
}
