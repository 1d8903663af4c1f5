//! Shared types for the operation queue
//!
//! The queue item record is the single source of truth for an operation's
//! state; lane structures hold ids only. The submitted operation is stored
//! type-erased and re-invocable so the dispatcher can retry it, while the
//! caller's typed result travels through a oneshot channel resolved from
//! inside the erased closure.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::ConfigSummary;
use crate::error::QueueError;
use crate::resource_monitor::ResourceSnapshot;

/// Priority tiers, highest first. Lower numeric value = higher priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
    Idle = 4,
}

impl Priority {
    /// Number of tiers (and lanes).
    pub const COUNT: usize = 5;

    /// All tiers in dispatch order, highest priority first.
    pub const ALL: [Priority; Priority::COUNT] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::Idle,
    ];

    /// Lane index for this tier.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The next-higher tier; Critical stays Critical.
    pub fn promoted(self) -> Priority {
        match self {
            Priority::Critical | Priority::High => Priority::Critical,
            Priority::Medium => Priority::High,
            Priority::Low => Priority::Medium,
            Priority::Idle => Priority::Low,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::Idle => "idle",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    DeadLettered,
}

// ---------------------------------------------------------------------------
// Erased operation plumbing
// ---------------------------------------------------------------------------

/// Boxed future produced by one invocation of a queued operation.
/// `Err` carries the failure message used for retry bookkeeping.
pub type OperationFuture = Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send>>;

/// Re-invocable, type-erased operation. On success the closure resolves the
/// caller's typed oneshot internally before returning `Ok`.
pub(crate) type ErasedOperation = Arc<dyn Fn() -> OperationFuture + Send + Sync>;

/// Rejects the caller's future with a terminal error. Idempotent: the
/// underlying oneshot sender is taken on first use.
pub(crate) type RejectFn = Arc<dyn Fn(QueueError) + Send + Sync>;

/// Caller-side future for a submitted operation.
///
/// Resolves with the operation's result once it completes, or with the
/// terminal [`QueueError`] if it is permanently failed, cleared, or the
/// queue shuts down.
pub struct OperationHandle<T> {
    rx: oneshot::Receiver<std::result::Result<T, QueueError>>,
}

impl<T> OperationHandle<T> {
    pub(crate) fn new(rx: oneshot::Receiver<std::result::Result<T, QueueError>>) -> Self {
        Self { rx }
    }
}

impl<T> Future for OperationHandle<T> {
    type Output = std::result::Result<T, QueueError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(|res| match res {
            Ok(inner) => inner,
            // Sender dropped without resolving: the queue itself went away.
            Err(_) => Err(QueueError::Shutdown),
        })
    }
}

// ---------------------------------------------------------------------------
// Queue item record
// ---------------------------------------------------------------------------

/// One unit of queued work. Mutated only by the dispatcher and the
/// ACK/NACK handlers it invokes.
pub(crate) struct QueueItem {
    pub id: Uuid,
    /// Current tier; may be raised by aging.
    pub priority: Priority,
    /// Tier at submission, reported in dead letter entries.
    pub original_priority: Priority,
    pub operation: ErasedOperation,
    pub reject: RejectFn,
    pub status: ItemStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Earliest instant a retried item becomes eligible again.
    pub next_retry_at: Option<Instant>,
    pub enqueued_at: Instant,
    pub enqueued_wall: DateTime<Utc>,
    /// Aging clock baseline; reset on each promotion so an item climbs at
    /// most one tier per threshold period.
    pub last_promoted_at: Option<Instant>,
    pub started_at: Option<Instant>,
    pub lease_expires_at: Option<Instant>,
}

impl QueueItem {
    pub fn new(priority: Priority, operation: ErasedOperation, reject: RejectFn) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority,
            original_priority: priority,
            operation,
            reject,
            status: ItemStatus::Pending,
            retry_count: 0,
            last_error: None,
            next_retry_at: None,
            enqueued_at: Instant::now(),
            enqueued_wall: Utc::now(),
            last_promoted_at: None,
            started_at: None,
            lease_expires_at: None,
        }
    }

    /// Transition to Processing and stamp the lease.
    pub fn begin_attempt(&mut self, now: Instant, lease: Duration) {
        self.status = ItemStatus::Processing;
        self.started_at = Some(now);
        self.lease_expires_at = Some(now + lease);
    }

    /// Transition back to Pending with a backoff deadline after a failure.
    pub fn schedule_retry(&mut self, next_retry_at: Instant, error: String) {
        self.status = ItemStatus::Pending;
        self.last_error = Some(error);
        self.next_retry_at = Some(next_retry_at);
        self.started_at = None;
        self.lease_expires_at = None;
    }

    /// Whether any retry delay has elapsed.
    pub fn retry_eligible(&self, now: Instant) -> bool {
        match self.next_retry_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Time waited in the current tier, for aging decisions.
    pub fn lane_age(&self, now: Instant) -> Duration {
        let baseline = self.last_promoted_at.unwrap_or(self.enqueued_at);
        now.saturating_duration_since(baseline)
    }

    /// Raise the item one tier and reset the aging clock.
    pub fn promote(&mut self, now: Instant) {
        self.priority = self.priority.promoted();
        self.last_promoted_at = Some(now);
    }
}

// Manual Debug: the operation and reject closures are not Debug.
impl fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueItem")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("original_priority", &self.original_priority)
            .field("status", &self.status)
            .field("retry_count", &self.retry_count)
            .field("last_error", &self.last_error)
            .field("next_retry_at", &self.next_retry_at)
            .field("started_at", &self.started_at)
            .field("lease_expires_at", &self.lease_expires_at)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Pending item counts per tier.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TierCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub idle: usize,
}

impl TierCounts {
    pub fn total(&self) -> usize {
        self.critical + self.high + self.medium + self.low + self.idle
    }
}

/// Point-in-time queue statistics, serializable for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queued: TierCounts,
    pub total_queued: usize,
    pub in_flight: usize,
    pub awaiting_retry: usize,
    pub lifetime_retries: u64,
    pub completed: u64,
    pub dead_lettered: u64,
    pub fast_path_hits: u64,
    pub dead_letter_size: usize,
    pub dispatcher_running: bool,
    pub avg_wait_ms: f64,
    pub resources: Option<ResourceSnapshot>,
    pub config: ConfigSummary,
}

/// Test helper: an inert item with a no-op operation and rejection.
#[cfg(test)]
pub(crate) fn noop_item(priority: Priority) -> QueueItem {
    let operation: ErasedOperation = Arc::new(|| {
        let fut: OperationFuture = Box::pin(async { Ok(()) });
        fut
    });
    let reject: RejectFn = Arc::new(|_| {});
    QueueItem::new(priority, operation, reject)
}

/// Caller result slot: holds the oneshot sender until the first resolution.
pub(crate) type CompletionSlot<T> = Arc<Mutex<Option<oneshot::Sender<std::result::Result<T, QueueError>>>>>;
