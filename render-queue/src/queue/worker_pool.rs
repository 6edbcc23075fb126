//! Worker slots and their job bindings.
//!
//! A slot is a unit of processing capacity. It is either idle or bound to
//! exactly one job, and a job is bound to at most one slot. The pool does
//! not run anything itself; the dispatcher binds jobs and spawns the work.

use std::time::Duration;
use tokio::time::Instant;

use super::job::JobId;
use crate::{Error, Result};

/// Identifier of a worker slot, e.g. `worker-0` or `dynamic-worker-3`.
pub type SlotId = String;

#[derive(Debug, Clone)]
pub struct Slot {
    pub id: SlotId,
    pub job: Option<JobId>,
    /// Added by the resource monitor rather than at startup.
    pub dynamic: bool,
    /// When the slot last became idle.
    pub idle_since: Instant,
}

impl Slot {
    fn new(id: SlotId, dynamic: bool) -> Self {
        Self {
            id,
            job: None,
            dynamic,
            idle_since: Instant::now(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.job.is_none()
    }
}

#[derive(Debug)]
pub struct WorkerPool {
    slots: Vec<Slot>,
    next_dynamic: usize,
}

impl WorkerPool {
    /// Create a pool with `size` static slots.
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size)
                .map(|i| Slot::new(format!("worker-{}", i), false))
                .collect(),
            next_dynamic: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_idle()).count()
    }

    pub fn available_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_idle()).count()
    }

    /// First idle slot in creation order.
    pub fn idle_slot(&self) -> Option<SlotId> {
        self.slots.iter().find(|s| s.is_idle()).map(|s| s.id.clone())
    }

    /// Bind `job_id` to an idle slot.
    pub fn bind(&mut self, slot_id: &str, job_id: &str) -> Result<()> {
        if self.slot_for(job_id).is_some() {
            return Err(Error::validation(format!(
                "Job {} is already bound to a worker",
                job_id
            )));
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.id == slot_id)
            .ok_or_else(|| Error::not_found("Worker slot", slot_id))?;
        if let Some(current) = &slot.job {
            return Err(Error::validation(format!(
                "Worker {} is busy with job {}",
                slot_id, current
            )));
        }
        slot.job = Some(job_id.to_string());
        Ok(())
    }

    /// Mark a slot idle, returning the job it held.
    pub fn release(&mut self, slot_id: &str) -> Option<JobId> {
        let slot = self.slots.iter_mut().find(|s| s.id == slot_id)?;
        let job = slot.job.take();
        if job.is_some() {
            slot.idle_since = Instant::now();
        }
        job
    }

    /// Slot currently holding `job_id`.
    pub fn slot_for(&self, job_id: &str) -> Option<&str> {
        self.slots
            .iter()
            .find(|s| s.job.as_deref() == Some(job_id))
            .map(|s| s.id.as_str())
    }

    /// Append `count` dynamic slots and return their ids.
    pub fn grow(&mut self, count: usize) -> Vec<SlotId> {
        (0..count)
            .map(|_| {
                let id = format!("dynamic-worker-{}", self.next_dynamic);
                self.next_dynamic += 1;
                self.slots.push(Slot::new(id.clone(), true));
                id
            })
            .collect()
    }

    /// Retire dynamic slots idle for at least `idle_for`, never dropping
    /// below `min_slots`. Static slots are never removed.
    pub fn shrink_idle(&mut self, idle_for: Duration, min_slots: usize, now: Instant) -> Vec<SlotId> {
        let mut removed = Vec::new();
        let mut remaining = self.slots.len();
        self.slots.retain(|slot| {
            let expired = slot.dynamic
                && slot.is_idle()
                && now.saturating_duration_since(slot.idle_since) >= idle_for;
            if expired && remaining > min_slots {
                remaining -= 1;
                removed.push(slot.id.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_pool() {
        let pool = WorkerPool::new(3);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.available_count(), 3);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.idle_slot().as_deref(), Some("worker-0"));
    }

    #[test]
    fn test_bind_and_release() {
        let mut pool = WorkerPool::new(2);
        pool.bind("worker-0", "job-a").unwrap();
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.slot_for("job-a"), Some("worker-0"));
        assert_eq!(pool.idle_slot().as_deref(), Some("worker-1"));

        assert!(pool.bind("worker-0", "job-b").is_err());
        assert!(pool.bind("worker-1", "job-a").is_err());
        assert!(matches!(pool.bind("worker-9", "job-b"), Err(Error::NotFound { .. })));

        assert_eq!(pool.release("worker-0"), Some("job-a".to_string()));
        assert_eq!(pool.release("worker-0"), None);
        assert_eq!(pool.available_count(), 2);
    }

    #[test]
    fn test_grow_names_dynamic_slots() {
        let mut pool = WorkerPool::new(1);
        let added = pool.grow(2);
        assert_eq!(added, ["dynamic-worker-0", "dynamic-worker-1"]);
        assert_eq!(pool.len(), 3);
        assert!(pool.slots()[1].dynamic);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrink_idle_keeps_static_and_busy_slots() {
        let mut pool = WorkerPool::new(1);
        pool.grow(3);
        pool.bind("dynamic-worker-1", "job-a").unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        let removed = pool.shrink_idle(Duration::from_secs(5), 1, Instant::now());
        assert_eq!(removed, ["dynamic-worker-0", "dynamic-worker-2"]);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.slot_for("job-a"), Some("dynamic-worker-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrink_respects_minimum_and_idle_time() {
        let mut pool = WorkerPool::new(1);
        pool.grow(2);

        let removed = pool.shrink_idle(Duration::from_secs(5), 1, Instant::now());
        assert!(removed.is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        let removed = pool.shrink_idle(Duration::from_secs(5), 2, Instant::now());
        assert_eq!(removed.len(), 1);
        assert_eq!(pool.len(), 2);
    }
}
