//! Priority lanes: five FIFO queues with aging and selection
//!
//! Records are the single source of truth; lanes hold ids only. A pending
//! item lives in exactly one lane, keyed by its current priority. Items
//! stay in their lane while processing (the id is removed on ACK or on the
//! move to the dead letter queue), which preserves a retried item's FIFO
//! position while letting healthy later arrivals overtake it during its
//! backoff window.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use crate::queue_types::{ItemStatus, Priority, QueueItem, TierCounts};

pub(crate) struct PriorityLanes {
    lanes: [VecDeque<Uuid>; Priority::COUNT],
    records: HashMap<Uuid, QueueItem>,
}

impl PriorityLanes {
    pub fn new() -> Self {
        Self {
            lanes: std::array::from_fn(|_| VecDeque::new()),
            records: HashMap::new(),
        }
    }

    /// Append an item to the tail of its tier's lane.
    pub fn insert(&mut self, item: QueueItem) {
        self.lanes[item.priority.index()].push_back(item.id);
        self.records.insert(item.id, item);
    }

    pub fn get(&self, id: &Uuid) -> Option<&QueueItem> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut QueueItem> {
        self.records.get_mut(id)
    }

    /// Remove an item entirely: record and lane position.
    pub fn remove(&mut self, id: &Uuid) -> Option<QueueItem> {
        let item = self.records.remove(id)?;
        let lane = &mut self.lanes[item.priority.index()];
        if let Some(pos) = lane.iter().position(|queued| queued == id) {
            lane.remove(pos);
        }
        Some(item)
    }

    /// No live items at all (pending or processing).
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Aging pass: promote pending items that have waited past the
    /// threshold one tier, relocating them to the tail of the higher lane.
    /// The aging clock resets on promotion, so an item climbs at most one
    /// tier per threshold period regardless of how often selection runs.
    pub fn age_pending(&mut self, now: Instant, threshold: Duration) -> usize {
        let mut promoted = 0;

        // Critical (lane 0) never ages further.
        for lane_idx in 1..Priority::COUNT {
            let due: Vec<Uuid> = self.lanes[lane_idx]
                .iter()
                .filter(|id| {
                    self.records.get(id).is_some_and(|item| {
                        item.status == ItemStatus::Pending && item.lane_age(now) >= threshold
                    })
                })
                .copied()
                .collect();

            for id in due {
                if let Some(pos) = self.lanes[lane_idx].iter().position(|queued| *queued == id) {
                    self.lanes[lane_idx].remove(pos);
                }
                if let Some(item) = self.records.get_mut(&id) {
                    let from = item.priority;
                    item.promote(now);
                    self.lanes[item.priority.index()].push_back(id);
                    promoted += 1;
                    debug!(
                        "Aged operation {} from {} to {} priority",
                        id, from, item.priority
                    );
                }
            }
        }

        promoted
    }

    /// Highest-priority, oldest pending item whose retry delay has elapsed.
    pub fn select_next(&self, now: Instant) -> Option<Uuid> {
        for lane in &self.lanes {
            for id in lane {
                if let Some(item) = self.records.get(id) {
                    if item.status == ItemStatus::Pending && item.retry_eligible(now) {
                        return Some(*id);
                    }
                }
            }
        }
        None
    }

    /// Earliest future retry deadline among pending items, used to
    /// reschedule the dispatcher when everything is backoff-delayed.
    pub fn earliest_retry_at(&self, now: Instant) -> Option<Instant> {
        self.records
            .values()
            .filter(|item| item.status == ItemStatus::Pending)
            .filter_map(|item| item.next_retry_at)
            .filter(|at| *at > now)
            .min()
    }

    /// Remove and return every pending item, leaving processing items (and
    /// their lane positions) untouched.
    pub fn drain_pending(&mut self) -> Vec<QueueItem> {
        let pending_ids: Vec<Uuid> = self
            .records
            .values()
            .filter(|item| item.status == ItemStatus::Pending)
            .map(|item| item.id)
            .collect();

        pending_ids
            .into_iter()
            .filter_map(|id| self.remove(&id))
            .collect()
    }

    pub fn pending_counts(&self) -> TierCounts {
        let mut counts = TierCounts::default();
        for item in self.records.values() {
            if item.status != ItemStatus::Pending {
                continue;
            }
            match item.priority {
                Priority::Critical => counts.critical += 1,
                Priority::High => counts.high += 1,
                Priority::Medium => counts.medium += 1,
                Priority::Low => counts.low += 1,
                Priority::Idle => counts.idle += 1,
            }
        }
        counts
    }

    /// Pending items currently inside a retry backoff window.
    pub fn awaiting_retry(&self, now: Instant) -> usize {
        self.records
            .values()
            .filter(|item| item.status == ItemStatus::Pending && !item.retry_eligible(now))
            .count()
    }
}
