//! Operation queue: public API, dispatcher loop, and ACK/NACK protocol
//!
//! A single dispatcher loop (reentrancy-guarded, started on demand) drains
//! the priority lanes: lease sweep, aging, selection, resource admission,
//! execution under a lease timer, then ACK or NACK. Queue state lives
//! behind one std mutex that is never held across an await; the fast-path
//! emptiness check shares that mutex, which closes the inline-execution
//! race against a finishing dispatcher pass.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::dead_letter::{DeadLetterEntry, DeadLetterQueue};
use crate::error::QueueError;
use crate::lanes::PriorityLanes;
use crate::queue_types::{
    CompletionSlot, ErasedOperation, ItemStatus, OperationFuture, OperationHandle, Priority,
    QueueItem, QueueStats, RejectFn,
};
use crate::resource_monitor::{ResourceMonitor, SystemProbe};

#[derive(Debug, Default)]
struct Counters {
    completed: u64,
    dead_lettered: u64,
    lifetime_retries: u64,
    fast_path_hits: u64,
    total_wait_ms: u64,
}

struct QueueState {
    lanes: PriorityLanes,
    /// In-flight bookkeeping: item id to lease deadline.
    in_flight: HashMap<Uuid, Instant>,
    dlq: DeadLetterQueue,
    dispatcher_running: bool,
    shutting_down: bool,
    counters: Counters,
}

struct QueueCore {
    config: QueueConfig,
    monitor: ResourceMonitor,
    /// Never held across an await.
    state: Mutex<QueueState>,
    notify: tokio::sync::Notify,
    shutdown: CancellationToken,
}

/// Resource-gated, priority-ordered admission queue for background
/// operations.
///
/// One explicitly constructed instance per scope; clones share the same
/// queue. Operations are submitted with [`enqueue`](Self::enqueue) (or the
/// tier shorthands) and their results surface through the returned
/// [`OperationHandle`].
#[derive(Clone)]
pub struct OperationQueue {
    core: Arc<QueueCore>,
}

impl OperationQueue {
    /// Create a queue sampling real system utilization via `sysinfo`.
    pub fn new(config: QueueConfig) -> Self {
        let monitor = ResourceMonitor::new(&config);
        Self::with_monitor(config, monitor)
    }

    /// Create a queue with an injected resource probe.
    pub fn with_probe(config: QueueConfig, probe: Box<dyn SystemProbe>) -> Self {
        let monitor = ResourceMonitor::with_probe(&config, probe);
        Self::with_monitor(config, monitor)
    }

    fn with_monitor(config: QueueConfig, monitor: ResourceMonitor) -> Self {
        let state = QueueState {
            lanes: PriorityLanes::new(),
            in_flight: HashMap::new(),
            dlq: DeadLetterQueue::new(config.dlq_max_size, config.dlq_retention),
            dispatcher_running: false,
            shutting_down: false,
            counters: Counters::default(),
        };
        Self {
            core: Arc::new(QueueCore {
                config,
                monitor,
                state: Mutex::new(state),
                notify: tokio::sync::Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.core.config
    }

    /// Submit an operation at the given priority.
    ///
    /// Never fails synchronously for queueing reasons: every failure
    /// surfaces through the returned handle. The operation must be
    /// re-invocable because the dispatcher retries it on failure; each
    /// invocation returns a fresh future.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue<T, F, Fut>(&self, operation: F, priority: Priority) -> OperationHandle<T>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, String>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let slot: CompletionSlot<T> = Arc::new(Mutex::new(Some(tx)));
        let handle = OperationHandle::new(rx);

        let operation = Arc::new(operation);
        let erased: ErasedOperation = {
            let slot = Arc::clone(&slot);
            Arc::new(move || {
                let operation = Arc::clone(&operation);
                let slot = Arc::clone(&slot);
                let fut: OperationFuture = Box::pin(async move {
                    match operation().await {
                        Ok(value) => {
                            if let Some(tx) = slot.lock().unwrap().take() {
                                let _ = tx.send(Ok(value));
                            }
                            Ok(())
                        }
                        Err(message) => Err(message),
                    }
                });
                fut
            })
        };
        let reject: RejectFn = Arc::new(move |error| {
            if let Some(tx) = slot.lock().unwrap().take() {
                let _ = tx.send(Err(error));
            }
        });

        let item = QueueItem::new(priority, erased, reject);

        let spawn_dispatcher;
        {
            let mut st = self.core.state.lock().unwrap();
            if st.shutting_down {
                (item.reject)(QueueError::Shutdown);
                return handle;
            }

            // Fast path: nothing queued, nothing in flight, resources
            // allow right now. Checked under the state lock together with
            // the in-flight registration.
            if st.lanes.is_empty()
                && st.in_flight.is_empty()
                && self.core.monitor.can_execute(priority)
            {
                let deadline = Instant::now() + self.core.config.lease_timeout;
                st.in_flight.insert(item.id, deadline);
                st.counters.fast_path_hits += 1;
                drop(st);
                self.spawn_fast_path(item);
                return handle;
            }

            debug!("Enqueued operation {} at {} priority", item.id, priority);
            st.lanes.insert(item);
            spawn_dispatcher = !st.dispatcher_running;
            if spawn_dispatcher {
                st.dispatcher_running = true;
            }
        }

        if spawn_dispatcher {
            tokio::spawn(dispatch_loop(Arc::clone(&self.core)));
        }
        self.core.notify.notify_one();
        handle
    }

    /// Submit at Critical priority (never blocked by admission).
    pub fn critical<T, F, Fut>(&self, operation: F) -> OperationHandle<T>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, String>> + Send + 'static,
    {
        self.enqueue(operation, Priority::Critical)
    }

    /// Submit at High priority.
    pub fn high<T, F, Fut>(&self, operation: F) -> OperationHandle<T>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, String>> + Send + 'static,
    {
        self.enqueue(operation, Priority::High)
    }

    /// Submit at Medium priority.
    pub fn medium<T, F, Fut>(&self, operation: F) -> OperationHandle<T>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, String>> + Send + 'static,
    {
        self.enqueue(operation, Priority::Medium)
    }

    /// Submit at Low priority.
    pub fn low<T, F, Fut>(&self, operation: F) -> OperationHandle<T>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, String>> + Send + 'static,
    {
        self.enqueue(operation, Priority::Low)
    }

    /// Submit at Idle priority (runs only on a quiet system).
    pub fn idle<T, F, Fut>(&self, operation: F) -> OperationHandle<T>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, String>> + Send + 'static,
    {
        self.enqueue(operation, Priority::Idle)
    }

    fn spawn_fast_path(&self, item: QueueItem) {
        let core = Arc::clone(&self.core);
        let lease = core.config.lease_timeout;
        tokio::spawn(async move {
            debug!("Fast path execution for operation {}", item.id);
            let wait_ms = item.enqueued_at.elapsed().as_millis() as u64;
            let outcome = tokio::time::timeout(lease, (item.operation)()).await;
            {
                let mut st = core.state.lock().unwrap();
                st.in_flight.remove(&item.id);
                match outcome {
                    Ok(Ok(())) => {
                        // Fast-path waits are near zero but still count as
                        // samples, so avg_wait_ms stays a true mean over
                        // every completion
                        st.counters.completed += 1;
                        st.counters.total_wait_ms += wait_ms;
                    }
                    // Fast-path failures go straight to the caller, no retry
                    Ok(Err(message)) => {
                        (item.reject)(QueueError::OperationFailed(message));
                    }
                    Err(_) => {
                        (item.reject)(QueueError::LeaseTimeout {
                            lease_ms: lease.as_millis() as u64,
                        });
                    }
                }
            }
            // Wake the dispatcher: queued work waits on the fast-path item
            core.notify.notify_one();
        });
    }

    /// Reject every pending item with a queue-cleared error and empty the
    /// lanes. In-flight items are unaffected. Returns the rejection count.
    pub fn clear_queue(&self) -> usize {
        let drained = { self.core.state.lock().unwrap().lanes.drain_pending() };
        for item in &drained {
            (item.reject)(QueueError::QueueCleared);
        }
        let count = drained.len();
        if count > 0 {
            info!("Queue cleared, rejected {} pending operations", count);
        }
        count
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> QueueStats {
        let resources = self.core.monitor.sample();
        let mut st = self.core.state.lock().unwrap();
        let now = Instant::now();
        let queued = st.lanes.pending_counts();
        let dead_letter_size = st.dlq.len(Utc::now());
        QueueStats {
            total_queued: queued.total(),
            queued,
            in_flight: st.in_flight.len(),
            awaiting_retry: st.lanes.awaiting_retry(now),
            lifetime_retries: st.counters.lifetime_retries,
            completed: st.counters.completed,
            dead_lettered: st.counters.dead_lettered,
            fast_path_hits: st.counters.fast_path_hits,
            dead_letter_size,
            dispatcher_running: st.dispatcher_running,
            avg_wait_ms: if st.counters.completed > 0 {
                st.counters.total_wait_ms as f64 / st.counters.completed as f64
            } else {
                0.0
            },
            resources,
            config: self.core.config.summary(),
        }
    }

    /// Pruned view of the dead letter queue, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.core.state.lock().unwrap().dlq.snapshot(Utc::now())
    }

    /// Wipe the dead letter queue, returning the number of entries dropped.
    pub fn clear_dead_letters(&self) -> usize {
        self.core.state.lock().unwrap().dlq.clear()
    }

    /// Graceful shutdown: reject pending items, stop the dispatcher, and
    /// wait (bounded by the lease timeout) for the in-flight operation.
    pub async fn shutdown(&self) {
        info!("Shutting down operation queue");
        {
            self.core.state.lock().unwrap().shutting_down = true;
        }
        let rejected = self.clear_queue();
        if rejected > 0 {
            warn!("{} pending operations rejected during shutdown", rejected);
        }
        self.core.shutdown.cancel();
        self.core.notify.notify_one();

        let drain = async {
            loop {
                {
                    let st = self.core.state.lock().unwrap();
                    if st.in_flight.is_empty() && !st.dispatcher_running {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        if tokio::time::timeout(self.core.config.lease_timeout, drain)
            .await
            .is_err()
        {
            warn!("In-flight operation did not finish before shutdown timeout");
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

enum Step {
    Run(Uuid, Priority),
    Sleep(Instant),
    Stop,
}

async fn dispatch_loop(core: Arc<QueueCore>) {
    debug!("Dispatcher started");
    loop {
        if core.shutdown.is_cancelled() {
            core.state.lock().unwrap().dispatcher_running = false;
            debug!("Dispatcher stopped by shutdown");
            break;
        }

        sweep_expired_leases(&core);

        let step = {
            let mut st = core.state.lock().unwrap();
            let now = Instant::now();
            let promoted = st
                .lanes
                .age_pending(now, core.config.age_promotion_threshold);
            if promoted > 0 {
                debug!("Aging pass promoted {} operations", promoted);
            }
            if let Some(deadline) = st.in_flight.values().min().copied() {
                // Execution is serialized: a fast-path operation is still
                // running. Wake when it finishes or its lease expires.
                Step::Sleep(deadline)
            } else {
                match st.lanes.select_next(now) {
                    Some(id) => {
                        // Selection just returned this id, the record is there
                        let priority = st
                            .lanes
                            .get(&id)
                            .map(|item| item.priority)
                            .unwrap_or(Priority::Medium);
                        Step::Run(id, priority)
                    }
                    None => match st.lanes.earliest_retry_at(now) {
                        Some(at) => Step::Sleep(at),
                        None => {
                            // No pending work at all. Clearing the flag and
                            // the emptiness check happen under one lock, so a
                            // racing enqueue either sees the flag still set
                            // or respawns.
                            st.dispatcher_running = false;
                            Step::Stop
                        }
                    },
                }
            }
        };

        match step {
            Step::Stop => {
                debug!("Dispatcher idle, stopping");
                break;
            }
            Step::Sleep(at) => {
                tokio::select! {
                    _ = core.notify.notified() => {}
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {}
                    _ = core.shutdown.cancelled() => {}
                }
                continue;
            }
            Step::Run(id, priority) => {
                let wait_started = Instant::now();
                let admitted = core
                    .monitor
                    .wait_for_admission(priority, core.config.max_resource_wait)
                    .await;
                if !admitted {
                    let waited_ms = wait_started.elapsed().as_millis() as u64;
                    warn!(
                        "Operation {} not admitted within {}ms at {} priority",
                        id, waited_ms, priority
                    );
                    nack(&core, id, QueueError::ResourceTimeout { waited_ms });
                    continue;
                }

                let op = {
                    let mut guard = core.state.lock().unwrap();
                    let st = &mut *guard;
                    match st.lanes.get_mut(&id) {
                        Some(item) if item.status == ItemStatus::Pending => {
                            let now = Instant::now();
                            item.begin_attempt(now, core.config.lease_timeout);
                            let op = Arc::clone(&item.operation);
                            let deadline = now + core.config.lease_timeout;
                            st.in_flight.insert(id, deadline);
                            Some(op)
                        }
                        // Cleared while waiting for admission
                        _ => None,
                    }
                };
                let Some(op) = op else {
                    continue;
                };

                let lease = core.config.lease_timeout;
                match tokio::time::timeout(lease, op()).await {
                    Ok(Ok(())) => ack(&core, id),
                    Ok(Err(message)) => nack(&core, id, QueueError::OperationFailed(message)),
                    Err(_) => nack(
                        &core,
                        id,
                        QueueError::LeaseTimeout {
                            lease_ms: lease.as_millis() as u64,
                        },
                    ),
                }

                // Yield between items so the dispatcher does not monopolize
                // the runtime under a deep queue of instant operations.
                tokio::task::yield_now().await;
            }
        }
    }
}

/// Reclaim in-flight bookkeeping whose lease has expired. The dispatcher's
/// own item is enforced by the timeout race around its await; entries
/// found here belong to fast-path tasks that died without cleaning up.
fn sweep_expired_leases(core: &Arc<QueueCore>) {
    let reclaimable: Vec<Uuid> = {
        let mut st = core.state.lock().unwrap();
        let now = Instant::now();
        let expired: Vec<Uuid> = st
            .in_flight
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut reclaimable = Vec::new();
        for id in expired {
            st.in_flight.remove(&id);
            match st.lanes.get(&id) {
                Some(item) if item.status == ItemStatus::Processing => reclaimable.push(id),
                // No record: fast-path bookkeeping, nothing left to do
                _ => {}
            }
        }
        reclaimable
    };

    let lease_ms = core.config.lease_timeout.as_millis() as u64;
    for id in reclaimable {
        warn!("Reclaiming operation {} whose lease expired", id);
        nack(core, id, QueueError::LeaseTimeout { lease_ms });
    }
}

/// Success acknowledgment: the item leaves every structure and the
/// latency counters are updated. The caller's future was already resolved
/// from inside the operation closure.
fn ack(core: &Arc<QueueCore>, id: Uuid) {
    let mut st = core.state.lock().unwrap();
    st.in_flight.remove(&id);
    if let Some(item) = st.lanes.remove(&id) {
        let wait_ms = item
            .started_at
            .map(|started| started.duration_since(item.enqueued_at).as_millis() as u64)
            .unwrap_or(0);
        st.counters.completed += 1;
        st.counters.total_wait_ms += wait_ms;
        debug!(
            "Operation {} completed (waited {}ms, {} retries)",
            id, wait_ms, item.retry_count
        );
    }
}

/// Failure acknowledgment: schedule a backoff retry, or move the item to
/// the dead letter queue once attempts are exhausted.
fn nack(core: &Arc<QueueCore>, id: Uuid, error: QueueError) {
    let message = error.to_string();
    let should_notify = {
        let mut guard = core.state.lock().unwrap();
        let st = &mut *guard;
        st.in_flight.remove(&id);

        let attempts = {
            let Some(item) = st.lanes.get_mut(&id) else {
                return;
            };
            item.retry_count += 1;
            item.last_error = Some(message.clone());
            item.retry_count
        };

        if attempts >= core.config.max_retries || st.shutting_down {
            let Some(item) = st.lanes.remove(&id) else {
                return;
            };
            if st.shutting_down && attempts < core.config.max_retries {
                (item.reject)(QueueError::Shutdown);
                return;
            }
            let entry = DeadLetterEntry {
                id,
                priority: item.original_priority,
                enqueued_at: item.enqueued_wall,
                failed_at: Utc::now(),
                retry_count: attempts,
                last_error: message.clone(),
            };
            st.dlq.push(entry);
            st.counters.dead_lettered += 1;
            (item.reject)(QueueError::RetryExhausted {
                attempts,
                last_error: message.clone(),
            });
            error!(
                "Operation {} moved to dead letter queue after {} attempts: {}",
                id, attempts, message
            );
            false
        } else {
            let delay = retry_delay(&core.config, attempts);
            let Some(item) = st.lanes.get_mut(&id) else {
                return;
            };
            item.schedule_retry(Instant::now() + delay, message.clone());
            st.counters.lifetime_retries += 1;
            warn!(
                "Operation {} failed (attempt {}/{}), retrying in {:?}: {}",
                id, attempts, core.config.max_retries, delay, message
            );
            true
        }
    };

    if should_notify {
        core.notify.notify_one();
    }
}

/// Exponential backoff: `base * multiplier^(attempts-1)`, capped at the
/// configured maximum, with optional jitter on top.
fn retry_delay(config: &QueueConfig, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1);
    let base = config.base_retry_delay.as_secs_f64();
    let mut delay = base * config.backoff_multiplier.powi(exponent as i32);
    delay = delay.min(config.max_retry_delay.as_secs_f64());
    if config.jitter_factor > 0.0 {
        let jitter = delay * config.jitter_factor * rand::thread_rng().gen::<f64>();
        delay += jitter;
    }
    Duration::from_secs_f64(delay)
}
