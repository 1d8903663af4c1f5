//! Queue configuration
//!
//! All tunables are fixed at startup and passed into the queue by value;
//! nothing reads the environment at dispatch time. [`QueueConfig::from_env`]
//! applies `MEMEX_QUEUE_*` overrides once, at construction.

use std::time::Duration;

use serde::Serialize;

/// Configuration for the operation queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// CPU utilization ceiling (percent) above which non-critical work is
    /// not admitted
    pub max_cpu_percent: f32,

    /// RAM utilization ceiling (percent) above which non-critical work is
    /// not admitted
    pub max_ram_percent: f32,

    /// Interval between admission re-checks while waiting for resources
    pub resource_poll_interval: Duration,

    /// Maximum time a selected item waits for resource admission before
    /// the attempt is counted as a failure
    pub max_resource_wait: Duration,

    /// Total attempts allowed before an item moves to the dead letter queue
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_retry_delay: Duration,

    /// Cap applied to the exponential backoff
    pub max_retry_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Jitter factor (0-1) added on top of the computed backoff to avoid
    /// retry storms
    pub jitter_factor: f64,

    /// Time budget granted to an in-flight operation before it is NACKed
    pub lease_timeout: Duration,

    /// Time a pending item must wait in a lane before it is promoted one
    /// priority tier
    pub age_promotion_threshold: Duration,

    /// Maximum number of dead letter entries retained (oldest evicted first)
    pub dlq_max_size: usize,

    /// Dead letter entries older than this are pruned lazily on read
    pub dlq_retention: Duration,

    /// How long a resource snapshot stays valid before re-sampling
    pub metrics_cache_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_cpu_percent: 70.0,
            max_ram_percent: 80.0,
            resource_poll_interval: Duration::from_millis(500),
            max_resource_wait: Duration::from_secs(30),
            max_retries: 3,
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            lease_timeout: Duration::from_secs(120),
            age_promotion_threshold: Duration::from_secs(30),
            dlq_max_size: 100,
            dlq_retention: Duration::from_secs(24 * 3600),
            metrics_cache_ttl: Duration::from_secs(1),
        }
    }
}

impl QueueConfig {
    /// Build a configuration from defaults with `MEMEX_QUEUE_*` environment
    /// overrides applied. Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_cpu_percent: env_or("MEMEX_QUEUE_MAX_CPU_PERCENT", defaults.max_cpu_percent),
            max_ram_percent: env_or("MEMEX_QUEUE_MAX_RAM_PERCENT", defaults.max_ram_percent),
            resource_poll_interval: Duration::from_millis(env_or(
                "MEMEX_QUEUE_RESOURCE_POLL_MS",
                defaults.resource_poll_interval.as_millis() as u64,
            )),
            max_resource_wait: Duration::from_millis(env_or(
                "MEMEX_QUEUE_MAX_RESOURCE_WAIT_MS",
                defaults.max_resource_wait.as_millis() as u64,
            )),
            max_retries: env_or("MEMEX_QUEUE_MAX_RETRIES", defaults.max_retries),
            base_retry_delay: Duration::from_millis(env_or(
                "MEMEX_QUEUE_BASE_RETRY_DELAY_MS",
                defaults.base_retry_delay.as_millis() as u64,
            )),
            max_retry_delay: Duration::from_millis(env_or(
                "MEMEX_QUEUE_MAX_RETRY_DELAY_MS",
                defaults.max_retry_delay.as_millis() as u64,
            )),
            backoff_multiplier: env_or(
                "MEMEX_QUEUE_BACKOFF_MULTIPLIER",
                defaults.backoff_multiplier,
            ),
            jitter_factor: env_or("MEMEX_QUEUE_JITTER_FACTOR", defaults.jitter_factor),
            lease_timeout: Duration::from_millis(env_or(
                "MEMEX_QUEUE_LEASE_TIMEOUT_MS",
                defaults.lease_timeout.as_millis() as u64,
            )),
            age_promotion_threshold: Duration::from_millis(env_or(
                "MEMEX_QUEUE_AGE_PROMOTION_MS",
                defaults.age_promotion_threshold.as_millis() as u64,
            )),
            dlq_max_size: env_or("MEMEX_QUEUE_DLQ_MAX_SIZE", defaults.dlq_max_size),
            dlq_retention: Duration::from_secs(env_or(
                "MEMEX_QUEUE_DLQ_RETENTION_SECS",
                defaults.dlq_retention.as_secs(),
            )),
            metrics_cache_ttl: Duration::from_millis(env_or(
                "MEMEX_QUEUE_METRICS_CACHE_MS",
                defaults.metrics_cache_ttl.as_millis() as u64,
            )),
        }
    }

    /// Serializable view of the active configuration, reported in stats.
    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            max_cpu_percent: self.max_cpu_percent,
            max_ram_percent: self.max_ram_percent,
            max_retries: self.max_retries,
            base_retry_delay_ms: self.base_retry_delay.as_millis() as u64,
            max_retry_delay_ms: self.max_retry_delay.as_millis() as u64,
            backoff_multiplier: self.backoff_multiplier,
            lease_timeout_ms: self.lease_timeout.as_millis() as u64,
            age_promotion_ms: self.age_promotion_threshold.as_millis() as u64,
            dlq_max_size: self.dlq_max_size,
        }
    }
}

/// Active-configuration echo included in [`QueueStats`](crate::QueueStats).
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub max_cpu_percent: f32,
    pub max_ram_percent: f32,
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub lease_timeout_ms: u64,
    pub age_promotion_ms: u64,
    pub dlq_max_size: usize,
}

fn env_or<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = QueueConfig::default();
        assert_eq!(config.max_cpu_percent, 70.0);
        assert_eq!(config.max_ram_percent, 80.0);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff_multiplier, 2.0);
        assert!(config.base_retry_delay < config.max_retry_delay);
        assert!(config.dlq_max_size > 0);
    }

    #[test]
    fn test_env_override_and_fallback() {
        std::env::set_var("MEMEX_QUEUE_MAX_RETRIES", "7");
        std::env::set_var("MEMEX_QUEUE_MAX_CPU_PERCENT", "not-a-number");
        let config = QueueConfig::from_env();
        assert_eq!(config.max_retries, 7);
        // Unparseable values fall back to the default
        assert_eq!(config.max_cpu_percent, 70.0);
        std::env::remove_var("MEMEX_QUEUE_MAX_RETRIES");
        std::env::remove_var("MEMEX_QUEUE_MAX_CPU_PERCENT");
    }

    #[test]
    fn test_summary_round_trips_to_json() {
        let summary = QueueConfig::default().summary();
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["max_retries"], 3);
        assert_eq!(json["lease_timeout_ms"], 120_000);
    }
}
