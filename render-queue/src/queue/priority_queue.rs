//! Four-tier FIFO queue of waiting job ids.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::time::Instant;

use super::job::JobId;
use crate::domain::Priority;

/// A waiting job. Retries under backoff carry a `ready_at` and are skipped
/// until it passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub ready_at: Option<Instant>,
}

impl QueueEntry {
    fn is_ready(&self, now: Instant) -> bool {
        self.ready_at.is_none_or(|at| at <= now)
    }
}

/// Per-tier queue depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    pub urgent: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl QueueDepths {
    pub fn get(&self, priority: Priority) -> usize {
        match priority {
            Priority::Urgent => self.urgent,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }

    pub fn total(&self) -> usize {
        self.urgent + self.high + self.normal + self.low
    }
}

/// One FIFO per [`Priority`], scanned in [`Priority::DISPATCH_ORDER`].
#[derive(Debug, Default)]
pub struct PriorityQueueSet {
    tiers: [VecDeque<QueueEntry>; 4],
}

impl PriorityQueueSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail of the job's tier.
    pub fn enqueue(&mut self, job_id: JobId, priority: Priority) {
        self.tiers[priority.index()].push_back(QueueEntry {
            job_id,
            ready_at: None,
        });
    }

    /// Put a retried job back at the head of its tier.
    pub fn requeue_front(&mut self, job_id: JobId, priority: Priority, ready_at: Option<Instant>) {
        self.tiers[priority.index()].push_front(QueueEntry { job_id, ready_at });
    }

    /// Pop the head of the highest non-empty tier.
    pub fn dequeue_next(&mut self) -> Option<(JobId, Priority)> {
        Priority::DISPATCH_ORDER.into_iter().find_map(|priority| {
            self.tiers[priority.index()]
                .pop_front()
                .map(|entry| (entry.job_id, priority))
        })
    }

    /// Pop the first entry that is ready at `now`, scanning tiers in
    /// dispatch order and each tier front to back.
    pub fn dequeue_next_ready(&mut self, now: Instant) -> Option<(JobId, Priority)> {
        for priority in Priority::DISPATCH_ORDER {
            let tier = &mut self.tiers[priority.index()];
            if let Some(pos) = tier.iter().position(|entry| entry.is_ready(now)) {
                return tier.remove(pos).map(|entry| (entry.job_id, priority));
            }
        }
        None
    }

    /// Remove a waiting job wherever it sits.
    pub fn remove(&mut self, job_id: &str) -> Option<Priority> {
        for priority in Priority::DISPATCH_ORDER {
            let tier = &mut self.tiers[priority.index()];
            if let Some(pos) = tier.iter().position(|entry| entry.job_id == job_id) {
                tier.remove(pos);
                return Some(priority);
            }
        }
        None
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.tiers
            .iter()
            .any(|tier| tier.iter().any(|entry| entry.job_id == job_id))
    }

    pub fn depth(&self, priority: Priority) -> usize {
        self.tiers[priority.index()].len()
    }

    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            urgent: self.depth(Priority::Urgent),
            high: self.depth(Priority::High),
            normal: self.depth(Priority::Normal),
            low: self.depth(Priority::Low),
        }
    }

    pub fn total(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Ids waiting in `priority`, head first.
    pub fn ids(&self, priority: Priority) -> impl Iterator<Item = &str> {
        self.tiers[priority.index()]
            .iter()
            .map(|entry| entry.job_id.as_str())
    }
}
