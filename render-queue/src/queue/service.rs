//! The render queue service.
//!
//! [`RenderQueue`] is a cheap, cloneable handle. All mutable queue state
//! (tiers, worker slots, job records) lives behind one mutex so that every
//! status change moves a job between containers atomically: a job is
//! waiting in exactly one tier, bound to exactly one slot, or terminal.
//! Events are always published after the lock is released.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::dispatcher;
use super::job::{JobId, JobRecord, JobStatus, JobSubmission};
use super::priority_queue::{PriorityQueueSet, QueueDepths};
use super::processors::{ProcessorRegistry, Renderer, SimulatedRenderer};
use super::progress::{
    OwnerSubscription, ProgressListener, ProgressPublisher, ProgressSink, ProgressSnapshot,
    RenderEvent,
};
use super::resource::{self, ResourceMonitor, ResourceReport};
use super::retry::RetryHandler;
use super::worker_pool::WorkerPool;
use crate::config::RenderQueueConfig;
use crate::{Error, Result};

/// Aggregate queue status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queue_depths_by_priority: QueueDepths,
    pub active_job_count: usize,
    pub available_worker_count: usize,
    pub worker_count: usize,
}

impl QueueStatus {
    pub fn queued_total(&self) -> usize {
        self.queue_depths_by_priority.total()
    }
}

pub(crate) struct QueueState {
    pub(crate) tiers: PriorityQueueSet,
    pub(crate) pool: WorkerPool,
    pub(crate) jobs: HashMap<JobId, JobRecord>,
    pub(crate) cancel_tokens: HashMap<JobId, CancellationToken>,
}

impl QueueState {
    fn status(&self) -> QueueStatus {
        QueueStatus {
            queue_depths_by_priority: self.tiers.depths(),
            active_job_count: self.pool.active_count(),
            available_worker_count: self.pool.available_count(),
            worker_count: self.pool.len(),
        }
    }
}

pub(crate) struct Shared {
    pub(crate) config: RenderQueueConfig,
    pub(crate) state: Mutex<QueueState>,
    pub(crate) publisher: ProgressPublisher,
    pub(crate) processors: ProcessorRegistry,
    pub(crate) renderer: Arc<dyn Renderer>,
    pub(crate) retry: RetryHandler,
    pub(crate) monitor: ResourceMonitor,
    /// Wakes the dispatcher on submission and slot release.
    pub(crate) notify: Notify,
    pub(crate) shutdown: CancellationToken,
    /// In-flight job tasks.
    pub(crate) tracker: TaskTracker,
    /// Set once by `start`.
    pub(crate) runtime: OnceLock<Handle>,
}

impl Shared {
    /// Snapshot and broadcast `events`. Call inside the critical section
    /// that produced them.
    pub(crate) fn record_all(&self, events: &[RenderEvent]) {
        for event in events {
            self.publisher.record(event);
        }
    }

    /// Run listeners for events already recorded. Call after the state
    /// lock is released.
    pub(crate) fn deliver_all(&self, events: &[RenderEvent]) {
        for event in events {
            self.publisher.deliver(event);
        }
    }

    /// One resource monitor pass.
    pub(crate) fn check_resources(&self) -> ResourceReport {
        let (queue_depths, active_jobs, worker_count, adjustment) = {
            let mut state = self.state.lock();
            let depths = state.tiers.depths();
            let adjustment = self
                .monitor
                .rebalance(&mut state.pool, depths.total(), Instant::now());
            (
                depths,
                state.pool.active_count(),
                state.pool.len(),
                adjustment,
            )
        };

        if !adjustment.added.is_empty() {
            info!(
                backlog = queue_depths.total(),
                workers = worker_count,
                "Added dynamic workers {:?}",
                adjustment.added
            );
            self.notify.notify_one();
        }
        if !adjustment.removed.is_empty() {
            info!(
                workers = worker_count,
                "Retired idle dynamic workers {:?}",
                adjustment.removed
            );
        }

        self.publisher.purge_expired();
        self.purge_terminal(self.config.progress.snapshot_ttl());

        let resident_bytes = self.monitor.resident_memory();
        let threshold = self.monitor.memory_threshold();
        let memory_pressure = resident_bytes.is_some_and(|bytes| bytes > threshold);
        if let Some(bytes) = resident_bytes
            && memory_pressure
        {
            warn!(
                resident_mb = bytes / (1024 * 1024),
                threshold_mb = threshold / (1024 * 1024),
                "Memory usage above threshold, requesting reclamation"
            );
            self.publisher.emit(RenderEvent::ReclaimMemory {
                resident_bytes: bytes,
                threshold_bytes: threshold,
            });
        }

        debug!(
            urgent = queue_depths.urgent,
            high = queue_depths.high,
            normal = queue_depths.normal,
            low = queue_depths.low,
            active = active_jobs,
            workers = worker_count,
            "Queue status"
        );

        ResourceReport {
            queue_depths,
            active_jobs,
            worker_count,
            adjustment,
            resident_bytes,
            memory_pressure,
        }
    }

    pub(crate) fn purge_terminal(&self, older_than: Duration) -> usize {
        let Some(cutoff) = chrono::TimeDelta::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };

        let purged: Vec<JobId> = {
            let mut state = self.state.lock();
            let expired: Vec<JobId> = state
                .jobs
                .values()
                .filter(|job| job.is_terminal() && job.completed_at.is_some_and(|at| at < cutoff))
                .map(|job| job.id.clone())
                .collect();
            for id in &expired {
                state.jobs.remove(id);
            }
            expired
        };

        for id in &purged {
            self.publisher.forget(id);
        }
        if !purged.is_empty() {
            info!("Purged {} finished jobs", purged.len());
        }
        purged.len()
    }
}

impl ProgressSink for Shared {
    fn on_progress(&self, job_id: &str, owner_id: &str, attempt: u32, progress: u8) {
        let event = {
            let mut state = self.state.lock();
            let Some(job) = state.jobs.get_mut(job_id) else {
                return;
            };
            // Stale reports from an earlier attempt are ignored
            if job.status != JobStatus::Processing || job.attempt() != attempt {
                return;
            }
            job.progress = job.progress.max(progress);
            let event = RenderEvent::Progress {
                job_id: job_id.to_string(),
                owner_id: owner_id.to_string(),
                status: job.status,
                progress,
            };
            self.publisher.record(&event);
            event
        };
        self.publisher.deliver(&event);
    }
}

/// Handle to a running (or not yet started) render queue.
#[derive(Clone)]
pub struct RenderQueue {
    shared: Arc<Shared>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RenderQueue {
    /// Queue with the built-in processors and the simulated renderer.
    pub fn new(config: RenderQueueConfig) -> Result<Self> {
        let renderer = Arc::new(SimulatedRenderer::new(&config.render));
        Self::with_components(config, ProcessorRegistry::with_defaults(), renderer)
    }

    /// Queue with the built-in processors driving `renderer`.
    pub fn with_renderer(config: RenderQueueConfig, renderer: Arc<dyn Renderer>) -> Result<Self> {
        Self::with_components(config, ProcessorRegistry::with_defaults(), renderer)
    }

    pub fn with_components(
        config: RenderQueueConfig,
        processors: ProcessorRegistry,
        renderer: Arc<dyn Renderer>,
    ) -> Result<Self> {
        config.validate()?;

        let shared = Shared {
            state: Mutex::new(QueueState {
                tiers: PriorityQueueSet::new(),
                pool: WorkerPool::new(config.pool.min_workers),
                jobs: HashMap::new(),
                cancel_tokens: HashMap::new(),
            }),
            publisher: ProgressPublisher::new(&config.progress),
            processors,
            renderer,
            retry: RetryHandler::new(config.retry.clone()),
            monitor: ResourceMonitor::new(config.monitor.clone(), config.pool.clone()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            runtime: OnceLock::new(),
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Start the dispatcher and resource monitor on the current runtime.
    pub fn start(&self) -> Result<()> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Other(format!("Render queue must start inside a Tokio runtime: {}", e)))?;
        if self.shared.shutdown.is_cancelled() {
            return Err(Error::invalid_transition("stopped", "running"));
        }
        if self.shared.runtime.set(handle.clone()).is_err() {
            return Err(Error::invalid_transition("running", "running"));
        }

        let mut tasks = self.tasks.lock();
        tasks.push(dispatcher::spawn_dispatcher(Arc::clone(&self.shared), &handle));
        tasks.push(resource::spawn_monitor(Arc::clone(&self.shared), &handle));

        let pool = &self.shared.config.pool;
        info!(
            workers = pool.min_workers,
            max_workers = pool.max_workers,
            processors = ?self.shared.processors.registered_types(),
            "Render queue started"
        );
        Ok(())
    }

    /// Stop dispatching and wait for in-flight jobs to settle.
    ///
    /// Queued jobs stay queued; nothing new is dispatched afterwards.
    pub async fn shutdown(&self) {
        info!("Stopping render queue");
        self.shared.shutdown.cancel();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Render queue background task failed: {}", e);
            }
        }

        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        info!("Render queue stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.runtime.get().is_some() && !self.shared.shutdown.is_cancelled()
    }

    /// Validate and enqueue a job, returning its id.
    pub fn add_job(&self, submission: JobSubmission) -> Result<JobId> {
        if self.shared.shutdown.is_cancelled() {
            return Err(Error::Other("Render queue is shut down".to_string()));
        }
        submission.validate()?;

        let job = JobRecord::from_submission(submission, self.shared.retry.policy().max_retries);
        let job_id = job.id.clone();
        let events = [
            RenderEvent::Queued {
                job_id: job.id.clone(),
                owner_id: job.owner_id.clone(),
                job_type: job.job_type,
                priority: job.priority,
            },
            RenderEvent::Progress {
                job_id: job.id.clone(),
                owner_id: job.owner_id.clone(),
                status: JobStatus::Queued,
                progress: 0,
            },
        ];

        {
            let mut state = self.shared.state.lock();
            state.tiers.enqueue(job.id.clone(), job.priority);
            info!(
                "Enqueued job {} of type {} with {} priority",
                job.id, job.job_type, job.priority
            );
            state.jobs.insert(job.id.clone(), job);
            self.shared.record_all(&events);
        }

        self.shared.deliver_all(&events);
        dispatcher::dispatch_pass(&self.shared);
        Ok(job_id)
    }

    /// Current record of a job, if known.
    pub fn get_job_status(&self, job_id: &str) -> Option<JobRecord> {
        self.shared.state.lock().jobs.get(job_id).cloned()
    }

    /// Latest published snapshot of a job.
    pub fn get_progress(&self, job_id: &str) -> Option<ProgressSnapshot> {
        self.shared.publisher.snapshot(job_id)
    }

    /// Cancel a job.
    ///
    /// Queued jobs are removed and cancelled immediately. Running jobs are
    /// signalled and end as `cancelled` once the processor yields. Returns
    /// `false` for unknown or finished jobs and for repeated requests.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let events = {
            let mut state = self.shared.state.lock();
            let QueueState {
                tiers,
                jobs,
                cancel_tokens,
                ..
            } = &mut *state;
            let Some(job) = jobs.get_mut(job_id) else {
                return false;
            };

            match job.status {
                JobStatus::Queued => {
                    tiers.remove(job_id);
                    if let Err(e) = job.transition_to(JobStatus::Cancelled) {
                        warn!("Failed to cancel job {}: {}", job_id, e);
                        return false;
                    }
                    info!("Job {} cancelled", job_id);
                    let events = [
                        RenderEvent::Progress {
                            job_id: job_id.to_string(),
                            owner_id: job.owner_id.clone(),
                            status: JobStatus::Cancelled,
                            progress: job.progress,
                        },
                        RenderEvent::Cancelled {
                            job_id: job_id.to_string(),
                            owner_id: job.owner_id.clone(),
                        },
                    ];
                    self.shared.record_all(&events);
                    events
                }
                JobStatus::Processing if !job.cancel_requested => {
                    job.cancel_requested = true;
                    if let Some(token) = cancel_tokens.get(job_id) {
                        token.cancel();
                    }
                    info!("Cancellation requested for running job {}", job_id);
                    return true;
                }
                _ => return false,
            }
        };

        self.shared.deliver_all(&events);
        true
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        self.shared.state.lock().status()
    }

    /// Most recent jobs of `owner_id`, newest first.
    pub fn jobs_for_owner(&self, owner_id: &str, limit: usize) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = {
            let state = self.shared.state.lock();
            state
                .jobs
                .values()
                .filter(|job| job.owner_id == owner_id)
                .cloned()
                .collect()
        };
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        jobs
    }

    /// Drop a finished job's record and snapshot.
    pub fn evict_job(&self, job_id: &str) -> Result<JobRecord> {
        let job = {
            let mut state = self.shared.state.lock();
            let status = state
                .jobs
                .get(job_id)
                .map(|job| job.status)
                .ok_or_else(|| Error::not_found("Job", job_id))?;
            if !status.is_terminal() {
                return Err(Error::invalid_transition(status, "evicted"));
            }
            state
                .jobs
                .remove(job_id)
                .ok_or_else(|| Error::not_found("Job", job_id))?
        };
        self.shared.publisher.forget(job_id);
        debug!("Evicted job {}", job_id);
        Ok(job)
    }

    /// Drop finished jobs that completed more than `older_than` ago.
    pub fn purge_terminal(&self, older_than: Duration) -> usize {
        self.shared.purge_terminal(older_than)
    }

    /// Run one resource monitor pass now.
    pub fn optimize_resources(&self) -> ResourceReport {
        self.shared.check_resources()
    }

    /// Run one dispatch pass now, returning how many jobs started.
    pub fn dispatch_pending(&self) -> usize {
        dispatcher::dispatch_pass(&self.shared)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RenderEvent> {
        self.shared.publisher.subscribe()
    }

    pub fn subscribe_owner(&self, owner_id: impl Into<String>) -> OwnerSubscription {
        self.shared.publisher.subscribe_owner(owner_id)
    }

    pub fn register_listener(&self, listener: Arc<dyn ProgressListener>) {
        self.shared.publisher.register_listener(listener);
    }

    pub fn config(&self) -> &RenderQueueConfig {
        &self.shared.config
    }
}

impl std::fmt::Debug for RenderQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderQueue")
            .field("status", &self.get_queue_status())
            .field("running", &self.is_running())
            .finish()
    }
}
