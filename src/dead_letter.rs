//! Dead letter queue
//!
//! Bounded, time-retained record of permanently failed operations. Entries
//! are inspection records only: the operation closure is not retained past
//! failure, so re-running a dead-lettered operation means resubmitting it.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::queue_types::Priority;

/// Terminal failure record. Immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    /// Priority at submission time, before any aging.
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: String,
}

pub(crate) struct DeadLetterQueue {
    entries: VecDeque<DeadLetterEntry>,
    max_size: usize,
    retention: chrono::Duration,
}

impl DeadLetterQueue {
    pub fn new(max_size: usize, retention: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            max_size,
            retention: chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::days(36500)),
        }
    }

    /// Append an entry, evicting the oldest when at capacity. A zero
    /// capacity retains nothing.
    pub fn push(&mut self, entry: DeadLetterEntry) {
        if self.max_size == 0 {
            warn!(
                "Dead letter queue capacity is zero, dropping entry {}",
                entry.id
            );
            return;
        }
        while self.entries.len() >= self.max_size {
            if let Some(evicted) = self.entries.pop_front() {
                warn!(
                    "Dead letter queue full ({} entries), evicting oldest entry {}",
                    self.max_size, evicted.id
                );
            } else {
                break;
            }
        }
        self.entries.push_back(entry);
    }

    /// Drop entries older than the retention window. Called lazily on read.
    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.retention;
        while let Some(front) = self.entries.front() {
            if front.failed_at < cutoff {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Pruned view of all entries, oldest first.
    pub fn snapshot(&mut self, now: DateTime<Utc>) -> Vec<DeadLetterEntry> {
        self.prune(now);
        self.entries.iter().cloned().collect()
    }

    /// Pruned entry count.
    pub fn len(&mut self, now: DateTime<Utc>) -> usize {
        self.prune(now);
        self.entries.len()
    }

    /// Remove all entries, returning how many were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}
