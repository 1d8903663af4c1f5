//! Shared helpers for queue integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use memex_queue::{OperationQueue, QueueConfig, RawSample, SystemProbe};

pub type SharedSample = Arc<Mutex<Option<RawSample>>>;

/// Probe returning whatever the shared slot currently holds, so tests can
/// change system utilization mid-flight.
pub struct FakeProbe {
    sample: SharedSample,
}

impl SystemProbe for FakeProbe {
    fn sample(&mut self) -> Option<RawSample> {
        *self.sample.lock().unwrap()
    }
}

pub fn raw(cpu_percent: f32, ram_percent: f32) -> RawSample {
    let total = 16 * 1024 * 1024 * 1024u64;
    RawSample {
        cpu_percent,
        used_ram_bytes: (total as f64 * ram_percent as f64 / 100.0) as u64,
        total_ram_bytes: total,
        load_avg_1m: 0.5,
    }
}

pub fn shared_sample(cpu_percent: f32, ram_percent: f32) -> SharedSample {
    Arc::new(Mutex::new(Some(raw(cpu_percent, ram_percent))))
}

/// Deterministic, fast-cycling configuration: no jitter, no snapshot
/// caching, millisecond-scale delays.
pub fn test_config() -> QueueConfig {
    QueueConfig {
        resource_poll_interval: Duration::from_millis(10),
        max_resource_wait: Duration::from_millis(100),
        max_retries: 3,
        base_retry_delay: Duration::from_millis(10),
        max_retry_delay: Duration::from_millis(200),
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
        lease_timeout: Duration::from_secs(2),
        age_promotion_threshold: Duration::from_secs(60),
        metrics_cache_ttl: Duration::ZERO,
        ..QueueConfig::default()
    }
}

pub fn queue_with(config: QueueConfig, sample: &SharedSample) -> OperationQueue {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    OperationQueue::with_probe(
        config,
        Box::new(FakeProbe {
            sample: Arc::clone(sample),
        }),
    )
}

/// Queue on a quiet system (2% CPU, 10% RAM: even Idle work is admitted).
pub fn quiet_queue(config: QueueConfig) -> (OperationQueue, SharedSample) {
    let sample = shared_sample(2.0, 10.0);
    let queue = queue_with(config, &sample);
    (queue, sample)
}
