//! Periodic resource monitor.
//!
//! Expands the worker pool while the backlog is above the high-water mark,
//! retires idle dynamic slots, and requests memory reclamation when the
//! process grows past its threshold. It only looks at aggregate state:
//! queue depths, slot counts and resident memory.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use super::priority_queue::QueueDepths;
use super::service::Shared;
use super::worker_pool::{SlotId, WorkerPool};
use crate::config::{MonitorConfig, PoolConfig};

/// Slots added and removed by one rebalance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolAdjustment {
    pub added: Vec<SlotId>,
    pub removed: Vec<SlotId>,
}

impl PoolAdjustment {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Outcome of one monitor check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReport {
    pub queue_depths: QueueDepths,
    pub active_jobs: usize,
    pub worker_count: usize,
    pub adjustment: PoolAdjustment,
    pub resident_bytes: Option<u64>,
    pub memory_pressure: bool,
}

pub struct ResourceMonitor {
    monitor: MonitorConfig,
    pool: PoolConfig,
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ResourceMonitor {
    pub fn new(monitor: MonitorConfig, pool: PoolConfig) -> Self {
        Self {
            monitor,
            pool,
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    pub fn check_interval(&self) -> Duration {
        self.monitor.check_interval()
    }

    pub fn memory_threshold(&self) -> u64 {
        self.monitor.memory_threshold_bytes
    }

    /// Slots to add for the current load, capped at `max_workers`.
    pub fn growth_for(&self, queued: usize, active: usize, slots: usize) -> usize {
        if queued <= self.monitor.queue_high_water || active >= self.pool.max_workers {
            return 0;
        }
        self.pool
            .growth_step
            .min(self.pool.max_workers.saturating_sub(slots))
    }

    /// Grow or shrink `pool` for a backlog of `queued` jobs.
    pub fn rebalance(&self, pool: &mut WorkerPool, queued: usize, now: Instant) -> PoolAdjustment {
        let grow_by = self.growth_for(queued, pool.active_count(), pool.len());
        let added = if grow_by > 0 {
            pool.grow(grow_by)
        } else {
            Vec::new()
        };

        let removed = match self.pool.idle_shrink_after() {
            Some(idle_for) if queued == 0 => pool.shrink_idle(idle_for, self.pool.min_workers, now),
            _ => Vec::new(),
        };

        PoolAdjustment { added, removed }
    }

    /// Resident memory of this process in bytes.
    pub fn resident_memory(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let bytes = system.process(pid).map(|p| p.memory());
        debug!(resident_bytes = ?bytes, "Sampled process memory");
        bytes
    }

    /// Resident memory when it exceeds the threshold.
    pub fn memory_pressure(&self) -> Option<u64> {
        self.resident_memory()
            .filter(|&bytes| bytes > self.monitor.memory_threshold_bytes)
    }
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("monitor", &self.monitor)
            .field("pool", &self.pool)
            .field("pid", &self.pid)
            .finish()
    }
}

/// Run a resource check every check interval until shutdown.
pub(crate) fn spawn_monitor(shared: Arc<Shared>, handle: &Handle) -> JoinHandle<()> {
    handle.spawn(async move {
        let mut tick = tokio::time::interval(shared.monitor.check_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        tick.tick().await;

        loop {
            tokio::select! {
                _ = shared.shutdown.cancelled() => {
                    debug!("Resource monitor shutting down");
                    break;
                }
                _ = tick.tick() => {
                    shared.check_resources();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(min: usize, max: usize) -> ResourceMonitor {
        ResourceMonitor::new(
            MonitorConfig::default(),
            PoolConfig {
                min_workers: min,
                max_workers: max,
                growth_step: 2,
                idle_shrink_secs: 60,
            },
        )
    }

    #[test]
    fn test_growth_requires_backlog_above_high_water() {
        let monitor = monitor(3, 8);
        assert_eq!(monitor.growth_for(10, 3, 3), 0);
        assert_eq!(monitor.growth_for(11, 3, 3), 2);
    }

    #[test]
    fn test_growth_capped_at_max() {
        let monitor = monitor(3, 8);
        assert_eq!(monitor.growth_for(50, 7, 7), 1);
        assert_eq!(monitor.growth_for(50, 8, 8), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebalance_grows_then_shrinks() {
        let monitor = monitor(3, 8);
        let mut pool = WorkerPool::new(3);
        for (i, slot) in ["worker-0", "worker-1", "worker-2"].iter().enumerate() {
            pool.bind(slot, &format!("job-{}", i)).unwrap();
        }

        let adjustment = monitor.rebalance(&mut pool, 12, Instant::now());
        assert_eq!(adjustment.added, ["dynamic-worker-0", "dynamic-worker-1"]);
        assert_eq!(pool.len(), 5);

        // Backlog drained: dynamic slots retire after the idle window
        let adjustment = monitor.rebalance(&mut pool, 0, Instant::now());
        assert!(adjustment.is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        let adjustment = monitor.rebalance(&mut pool, 0, Instant::now());
        assert_eq!(adjustment.removed.len(), 2);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_memory_sampling() {
        let mut config = MonitorConfig::default();
        config.memory_threshold_bytes = 0;
        let monitor = ResourceMonitor::new(config, PoolConfig::default());

        let resident = monitor.resident_memory();
        assert!(resident.is_some_and(|bytes| bytes > 0));
        assert!(monitor.memory_pressure().is_some());
    }
}
