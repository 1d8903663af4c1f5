//! Resource monitoring and admission policy
//!
//! Samples OS-level CPU and RAM utilization (with a short-lived cache so
//! back-to-back admission checks do not re-sample) and decides whether a
//! priority tier may start work right now. If sampling becomes unavailable
//! the monitor degrades to admitting everything: availability of the host
//! daemon must never depend on monitoring succeeding.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::System;
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::queue_types::Priority;

/// CPU ceiling for the Idle tier, stricter than the general ceiling.
pub const IDLE_CPU_CEILING_PERCENT: f32 = 5.0;

/// RAM ceiling for the Idle tier.
pub const IDLE_RAM_CEILING_PERCENT: f32 = 15.0;

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// One raw utilization reading from the underlying system.
#[derive(Debug, Clone, Copy)]
pub struct RawSample {
    pub cpu_percent: f32,
    pub used_ram_bytes: u64,
    pub total_ram_bytes: u64,
    pub load_avg_1m: f64,
}

/// Source of raw utilization readings.
///
/// The default implementation is [`SysinfoProbe`]; hosts and tests can
/// inject their own (e.g. a fixed sample) via
/// [`OperationQueue::with_probe`](crate::OperationQueue::with_probe).
pub trait SystemProbe: Send {
    /// Take one reading, or `None` if sampling is unavailable.
    fn sample(&mut self) -> Option<RawSample>;
}

/// Probe backed by `sysinfo`. CPU utilization is the delta between two
/// consecutive refreshes, so the very first reading reports 0% rather than
/// a skewed single-shot value.
pub struct SysinfoProbe {
    sys: System,
    first_sample: bool,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            sys: System::new_all(),
            first_sample: true,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn sample(&mut self) -> Option<RawSample> {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let total = self.sys.total_memory();
        if total == 0 {
            return None;
        }

        let cpu_percent = if self.first_sample {
            self.first_sample = false;
            0.0
        } else {
            self.sys.global_cpu_info().cpu_usage()
        };

        Some(RawSample {
            cpu_percent,
            used_ram_bytes: self.sys.used_memory(),
            total_ram_bytes: total,
            load_avg_1m: System::load_average().one,
        })
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of system utilization.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub ram_percent: f32,
    pub free_ram_mb: u64,
    pub total_ram_mb: u64,
    pub load_avg_1m: f64,
    #[serde(skip)]
    pub sampled_at: Instant,
}

impl ResourceSnapshot {
    fn from_raw(raw: RawSample, now: Instant) -> Self {
        let ram_percent = if raw.total_ram_bytes > 0 {
            (raw.used_ram_bytes as f64 / raw.total_ram_bytes as f64 * 100.0) as f32
        } else {
            0.0
        };
        let total_ram_mb = raw.total_ram_bytes / (1024 * 1024);
        let free_ram_mb = raw.total_ram_bytes.saturating_sub(raw.used_ram_bytes) / (1024 * 1024);
        Self {
            cpu_percent: raw.cpu_percent,
            ram_percent,
            free_ram_mb,
            total_ram_mb,
            load_avg_1m: raw.load_avg_1m,
            sampled_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

struct MonitorState {
    probe: Box<dyn SystemProbe>,
    cached: Option<ResourceSnapshot>,
    degraded_logged: bool,
}

/// Samples system utilization and applies the tier admission policy.
pub struct ResourceMonitor {
    state: Mutex<MonitorState>,
    max_cpu_percent: f32,
    max_ram_percent: f32,
    cache_ttl: Duration,
    poll_interval: Duration,
}

impl ResourceMonitor {
    /// Create a monitor using the default `sysinfo` probe.
    pub fn new(config: &QueueConfig) -> Self {
        Self::with_probe(config, Box::new(SysinfoProbe::new()))
    }

    /// Create a monitor with an injected probe.
    pub fn with_probe(config: &QueueConfig, probe: Box<dyn SystemProbe>) -> Self {
        Self {
            state: Mutex::new(MonitorState {
                probe,
                cached: None,
                degraded_logged: false,
            }),
            max_cpu_percent: config.max_cpu_percent,
            max_ram_percent: config.max_ram_percent,
            cache_ttl: config.metrics_cache_ttl,
            poll_interval: config.resource_poll_interval,
        }
    }

    /// Latest resource snapshot, re-sampling only when the cache has
    /// expired. Returns `None` when the probe is unavailable.
    pub fn sample(&self) -> Option<ResourceSnapshot> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        if let Some(cached) = state.cached {
            if now.duration_since(cached.sampled_at) < self.cache_ttl {
                return Some(cached);
            }
        }

        match state.probe.sample() {
            Some(raw) => {
                let snapshot = ResourceSnapshot::from_raw(raw, now);
                state.cached = Some(snapshot);
                state.degraded_logged = false;
                Some(snapshot)
            }
            None => {
                if !state.degraded_logged {
                    warn!("Resource sampling unavailable, admitting all work");
                    state.degraded_logged = true;
                }
                state.cached = None;
                None
            }
        }
    }

    /// Whether work at the given tier may start now.
    ///
    /// Critical is never blocked. When sampling is unavailable the policy
    /// degrades to admitting everything.
    pub fn can_execute(&self, priority: Priority) -> bool {
        if priority == Priority::Critical {
            return true;
        }

        let Some(snapshot) = self.sample() else {
            return true;
        };

        if snapshot.cpu_percent > self.max_cpu_percent
            || snapshot.ram_percent > self.max_ram_percent
        {
            return false;
        }

        if priority == Priority::Idle {
            return snapshot.cpu_percent < IDLE_CPU_CEILING_PERCENT
                && snapshot.ram_percent < IDLE_RAM_CEILING_PERCENT;
        }

        true
    }

    /// Poll [`Self::can_execute`] until admissible or `max_wait` elapses.
    /// Returns whether admission was granted.
    pub async fn wait_for_admission(&self, priority: Priority, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            if self.can_execute(priority) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(
                    "Admission wait for {} priority exceeded {:?}",
                    priority, max_wait
                );
                return false;
            }
            let remaining = deadline - now;
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Probe returning a shared, settable sample and counting calls.
    struct FakeProbe {
        sample: Arc<Mutex<Option<RawSample>>>,
        calls: Arc<AtomicUsize>,
    }

    impl SystemProbe for FakeProbe {
        fn sample(&mut self) -> Option<RawSample> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.sample.lock().unwrap()
        }
    }

    fn raw(cpu: f32, ram_percent: f32) -> RawSample {
        let total = 16 * 1024 * 1024 * 1024u64;
        RawSample {
            cpu_percent: cpu,
            used_ram_bytes: (total as f64 * ram_percent as f64 / 100.0) as u64,
            total_ram_bytes: total,
            load_avg_1m: 1.0,
        }
    }

    fn monitor_with(
        cpu: f32,
        ram: f32,
        cache_ttl: Duration,
    ) -> (ResourceMonitor, Arc<Mutex<Option<RawSample>>>, Arc<AtomicUsize>) {
        let sample = Arc::new(Mutex::new(Some(raw(cpu, ram))));
        let calls = Arc::new(AtomicUsize::new(0));
        let config = QueueConfig {
            metrics_cache_ttl: cache_ttl,
            resource_poll_interval: Duration::from_millis(5),
            ..QueueConfig::default()
        };
        let probe = FakeProbe {
            sample: sample.clone(),
            calls: calls.clone(),
        };
        (
            ResourceMonitor::with_probe(&config, Box::new(probe)),
            sample,
            calls,
        )
    }

    #[test]
    fn test_critical_is_never_blocked() {
        let (monitor, _, _) = monitor_with(99.0, 99.0, Duration::ZERO);
        assert!(monitor.can_execute(Priority::Critical));
        assert!(!monitor.can_execute(Priority::High));
    }

    #[test]
    fn test_general_ceilings_gate_non_critical_tiers() {
        let (monitor, sample, _) = monitor_with(50.0, 50.0, Duration::ZERO);
        assert!(monitor.can_execute(Priority::High));
        assert!(monitor.can_execute(Priority::Medium));
        assert!(monitor.can_execute(Priority::Low));

        *sample.lock().unwrap() = Some(raw(75.0, 50.0));
        assert!(!monitor.can_execute(Priority::High));

        *sample.lock().unwrap() = Some(raw(50.0, 85.0));
        assert!(!monitor.can_execute(Priority::Low));
    }

    #[test]
    fn test_idle_tier_is_stricter_than_general_ceilings() {
        // Below the 70/80 ceilings but above the 5/15 idle ceilings
        let (monitor, sample, _) = monitor_with(10.0, 10.0, Duration::ZERO);
        assert!(monitor.can_execute(Priority::Low));
        assert!(!monitor.can_execute(Priority::Idle));

        *sample.lock().unwrap() = Some(raw(2.0, 10.0));
        assert!(monitor.can_execute(Priority::Idle));

        *sample.lock().unwrap() = Some(raw(2.0, 20.0));
        assert!(!monitor.can_execute(Priority::Idle));
    }

    #[test]
    fn test_degrades_to_admit_when_probe_fails() {
        let (monitor, sample, _) = monitor_with(0.0, 0.0, Duration::ZERO);
        *sample.lock().unwrap() = None;
        assert!(monitor.sample().is_none());
        assert!(monitor.can_execute(Priority::Idle));
        assert!(monitor.can_execute(Priority::Low));
    }

    #[test]
    fn test_snapshot_cache_avoids_resampling() {
        let (monitor, _, calls) = monitor_with(10.0, 10.0, Duration::from_secs(60));
        monitor.sample();
        monitor.sample();
        monitor.sample();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_ttl_resamples_every_call() {
        let (monitor, _, calls) = monitor_with(10.0, 10.0, Duration::ZERO);
        monitor.sample();
        monitor.sample();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_snapshot_ram_math() {
        let (monitor, _, _) = monitor_with(10.0, 50.0, Duration::ZERO);
        let snapshot = monitor.sample().unwrap();
        assert!((snapshot.ram_percent - 50.0).abs() < 0.5);
        assert_eq!(snapshot.total_ram_mb, 16 * 1024);
        assert_eq!(snapshot.free_ram_mb, 8 * 1024);
    }

    #[tokio::test]
    async fn test_wait_for_admission_times_out_then_recovers() {
        let (monitor, sample, _) = monitor_with(99.0, 99.0, Duration::ZERO);
        let admitted = monitor
            .wait_for_admission(Priority::High, Duration::from_millis(30))
            .await;
        assert!(!admitted);

        *sample.lock().unwrap() = Some(raw(10.0, 10.0));
        let admitted = monitor
            .wait_for_admission(Priority::High, Duration::from_millis(100))
            .await;
        assert!(admitted);
    }

    #[test]
    fn test_sysinfo_probe_first_sample_reports_zero_cpu() {
        let mut probe = SysinfoProbe::new();
        if let Some(first) = probe.sample() {
            assert_eq!(first.cpu_percent, 0.0);
            assert!(first.total_ram_bytes > 0);
        }
    }
}
