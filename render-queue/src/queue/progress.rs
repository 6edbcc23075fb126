//! Progress events, snapshots and per-job reporters.
//!
//! Every state change and progress report goes through
//! [`ProgressPublisher`], which records the latest snapshot for pull-based
//! readers and then fans the event out to broadcast subscribers and
//! registered listeners. Delivery is best effort: a lagging subscriber or a
//! failing listener never blocks or fails the job.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::job::{JobId, JobOutput, JobStatus, JobType};
use crate::config::ProgressConfig;
use crate::domain::Priority;

/// Event delivered to subscribers. Job events are scoped to the owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RenderEvent {
    Queued {
        job_id: JobId,
        owner_id: String,
        job_type: JobType,
        priority: Priority,
    },
    Progress {
        job_id: JobId,
        owner_id: String,
        status: JobStatus,
        progress: u8,
    },
    Completed {
        job_id: JobId,
        owner_id: String,
        output: JobOutput,
    },
    Failed {
        job_id: JobId,
        owner_id: String,
        error: String,
        attempts: u32,
    },
    Cancelled {
        job_id: JobId,
        owner_id: String,
    },
    /// Resident memory crossed the configured threshold.
    ReclaimMemory {
        resident_bytes: u64,
        threshold_bytes: u64,
    },
}

impl RenderEvent {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Queued { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id, .. } => Some(job_id),
            Self::ReclaimMemory { .. } => None,
        }
    }

    pub fn owner_id(&self) -> Option<&str> {
        match self {
            Self::Queued { owner_id, .. }
            | Self::Progress { owner_id, .. }
            | Self::Completed { owner_id, .. }
            | Self::Failed { owner_id, .. }
            | Self::Cancelled { owner_id, .. } => Some(owner_id),
            Self::ReclaimMemory { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::Progress { .. } => "progress",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
            Self::ReclaimMemory { .. } => "reclaim_memory",
        }
    }
}

/// Last known state of a job, kept for readers that missed the push.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredSnapshot {
    snapshot: ProgressSnapshot,
    stored_at: Instant,
}

/// Synchronous push target, e.g. a websocket room bridge.
///
/// Implementations must return quickly; errors are logged and dropped.
pub trait ProgressListener: Send + Sync {
    fn name(&self) -> &str {
        "listener"
    }

    fn deliver(&self, event: &RenderEvent) -> crate::Result<()>;
}

pub struct ProgressPublisher {
    event_tx: broadcast::Sender<RenderEvent>,
    listeners: RwLock<Vec<Arc<dyn ProgressListener>>>,
    snapshots: DashMap<JobId, StoredSnapshot>,
    snapshot_ttl: Duration,
}

impl ProgressPublisher {
    pub fn new(config: &ProgressConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            event_tx,
            listeners: RwLock::new(Vec::new()),
            snapshots: DashMap::new(),
            snapshot_ttl: config.snapshot_ttl(),
        }
    }

    /// Record a status/progress change and emit a `Progress` event.
    pub fn publish(&self, job_id: &str, owner_id: &str, status: JobStatus, progress: u8) {
        self.emit(RenderEvent::Progress {
            job_id: job_id.to_string(),
            owner_id: owner_id.to_string(),
            status,
            progress,
        });
    }

    /// Record an event and deliver it to listeners.
    pub fn emit(&self, event: RenderEvent) {
        self.record(&event);
        self.deliver(&event);
    }

    /// Refresh the job's snapshot for `Progress` events and push the event
    /// to broadcast subscribers.
    ///
    /// Never calls listeners, so it is safe under the queue state lock.
    /// State changes are recorded inside the critical section that made
    /// them; snapshots and the event stream then follow state order.
    pub fn record(&self, event: &RenderEvent) {
        if let RenderEvent::Progress {
            job_id,
            status,
            progress,
            ..
        } = event
        {
            self.record_snapshot(job_id, *status, *progress);
        }

        // No receivers is fine
        let _ = self.event_tx.send(event.clone());
    }

    /// Hand an event to every registered listener.
    ///
    /// A listener that fails or panics is logged and skipped; the rest
    /// still receive the event.
    pub fn deliver(&self, event: &RenderEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            match panic::catch_unwind(AssertUnwindSafe(|| listener.deliver(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    listener = listener.name(),
                    event = event.name(),
                    job_id = event.job_id().unwrap_or("-"),
                    "Progress listener failed: {}",
                    e
                ),
                Err(payload) => error!(
                    listener = listener.name(),
                    event = event.name(),
                    job_id = event.job_id().unwrap_or("-"),
                    "Progress listener panicked: {}",
                    panic_message(payload.as_ref())
                ),
            }
        }
    }

    pub fn record_snapshot(&self, job_id: &str, status: JobStatus, progress: u8) {
        self.snapshots.insert(
            job_id.to_string(),
            StoredSnapshot {
                snapshot: ProgressSnapshot {
                    job_id: job_id.to_string(),
                    status,
                    progress,
                    updated_at: Utc::now(),
                },
                stored_at: Instant::now(),
            },
        );
    }

    /// Latest snapshot, unless it has outlived the TTL.
    pub fn snapshot(&self, job_id: &str) -> Option<ProgressSnapshot> {
        let entry = self.snapshots.get(job_id)?;
        if entry.stored_at.elapsed() >= self.snapshot_ttl {
            return None;
        }
        Some(entry.snapshot.clone())
    }

    /// Drop snapshots older than the TTL.
    pub fn purge_expired(&self) -> usize {
        let before = self.snapshots.len();
        let ttl = self.snapshot_ttl;
        self.snapshots.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        let purged = before.saturating_sub(self.snapshots.len());
        if purged > 0 {
            debug!("Purged {} expired progress snapshots", purged);
        }
        purged
    }

    pub fn forget(&self, job_id: &str) {
        self.snapshots.remove(job_id);
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RenderEvent> {
        self.event_tx.subscribe()
    }

    /// Receive only events for `owner_id`.
    pub fn subscribe_owner(&self, owner_id: impl Into<String>) -> OwnerSubscription {
        OwnerSubscription {
            owner_id: owner_id.into(),
            rx: self.event_tx.subscribe(),
        }
    }

    pub fn register_listener(&self, listener: Arc<dyn ProgressListener>) {
        debug!(listener = listener.name(), "Registered progress listener");
        self.listeners.write().push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return s;
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s;
    }
    "<non-string payload>"
}

/// Broadcast receiver filtered to one owner's job events.
pub struct OwnerSubscription {
    owner_id: String,
    rx: broadcast::Receiver<RenderEvent>,
}

impl OwnerSubscription {
    /// Next event for this owner, or `None` once the queue is dropped.
    /// Missed events are skipped; readers should fall back to snapshots.
    pub async fn recv(&mut self) -> Option<RenderEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.owner_id() == Some(self.owner_id.as_str()) => {
                    return Some(event);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(owner_id = %self.owner_id, "Owner subscription lagged by {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }
}

/// Receives progress reports from a [`ProgressReporter`].
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, job_id: &str, owner_id: &str, attempt: u32, progress: u8);
}

/// Handle a processor uses to report progress for one attempt.
///
/// Values are clamped to 100 and reports that would move progress
/// backwards are dropped.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    owner_id: String,
    attempt: u32,
    last: Arc<Mutex<Option<u8>>>,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl ProgressReporter {
    pub fn new(
        job_id: impl Into<JobId>,
        owner_id: impl Into<String>,
        attempt: u32,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            owner_id: owner_id.into(),
            attempt,
            last: Arc::new(Mutex::new(None)),
            sink: Some(sink),
        }
    }

    /// A reporter that only tracks values.
    pub fn noop(job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: job_id.into(),
            owner_id: String::new(),
            attempt: 1,
            last: Arc::new(Mutex::new(None)),
            sink: None,
        }
    }

    /// Report progress. Returns whether the value was forwarded.
    pub fn report(&self, progress: u8) -> bool {
        let progress = progress.min(100);
        {
            let mut last = self.last.lock();
            if let Some(previous) = *last
                && progress <= previous
            {
                if progress < previous {
                    debug!(
                        job_id = %self.job_id,
                        "Dropping regressive progress {} (last {})",
                        progress,
                        previous
                    );
                }
                return false;
            }
            *last = Some(progress);
        }
        if let Some(sink) = &self.sink {
            sink.on_progress(&self.job_id, &self.owner_id, self.attempt, progress);
        }
        true
    }

    /// Last forwarded value.
    pub fn current(&self) -> u8 {
        self.last.lock().unwrap_or(0)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job_id", &self.job_id)
            .field("attempt", &self.attempt)
            .field("current", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn publisher(ttl_secs: u64) -> ProgressPublisher {
        ProgressPublisher::new(&ProgressConfig {
            snapshot_ttl_secs: ttl_secs,
            event_capacity: 16,
        })
    }

    #[derive(Default)]
    struct RecordingSink {
        reports: Mutex<Vec<u8>>,
    }

    impl ProgressSink for RecordingSink {
        fn on_progress(&self, _job_id: &str, _owner_id: &str, _attempt: u32, progress: u8) {
            self.reports.lock().push(progress);
        }
    }

    struct FailingListener {
        calls: AtomicUsize,
    }

    impl ProgressListener for FailingListener {
        fn name(&self) -> &str {
            "failing"
        }

        fn deliver(&self, _event: &RenderEvent) -> crate::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Other("socket closed".to_string()))
        }
    }

    #[test]
    fn test_reporter_is_monotonic_and_clamped() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = ProgressReporter::new("job-1", "user-1", 1, sink.clone());

        assert!(reporter.report(0));
        assert!(reporter.report(40));
        assert!(!reporter.report(20));
        assert!(!reporter.report(40));
        assert!(reporter.report(250));
        assert!(!reporter.report(99));

        assert_eq!(*sink.reports.lock(), vec![0, 40, 100]);
        assert_eq!(reporter.current(), 100);
    }

    #[test]
    fn test_noop_reporter() {
        let reporter = ProgressReporter::noop("job-1");
        assert!(reporter.report(10));
        assert_eq!(reporter.current(), 10);
    }

    #[tokio::test]
    async fn test_publish_updates_snapshot_and_broadcasts() {
        let publisher = publisher(60);
        let mut rx = publisher.subscribe();

        publisher.publish("job-1", "user-1", JobStatus::Processing, 30);

        let snapshot = publisher.snapshot("job-1").unwrap();
        assert_eq!(snapshot.status, JobStatus::Processing);
        assert_eq!(snapshot.progress, 30);

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            RenderEvent::Progress {
                job_id: "job-1".to_string(),
                owner_id: "user-1".to_string(),
                status: JobStatus::Processing,
                progress: 30,
            }
        );
    }

    #[tokio::test]
    async fn test_owner_subscription_filters() {
        let publisher = publisher(60);
        let mut mine = publisher.subscribe_owner("user-1");

        publisher.publish("job-a", "user-2", JobStatus::Queued, 0);
        publisher.emit(RenderEvent::ReclaimMemory {
            resident_bytes: 1,
            threshold_bytes: 0,
        });
        publisher.publish("job-b", "user-1", JobStatus::Queued, 0);

        let event = mine.recv().await.unwrap();
        assert_eq!(event.job_id(), Some("job-b"));
        assert_eq!(mine.owner_id(), "user-1");
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_stop_delivery() {
        let publisher = publisher(60);
        let listener = Arc::new(FailingListener {
            calls: AtomicUsize::new(0),
        });
        publisher.register_listener(listener.clone());
        let mut rx = publisher.subscribe();

        publisher.publish("job-1", "user-1", JobStatus::Processing, 10);
        publisher.publish("job-1", "user-1", JobStatus::Processing, 20);

        assert_eq!(listener.calls.load(Ordering::SeqCst), 2);
        assert_eq!(publisher.listener_count(), 1);
        assert!(rx.recv().await.is_ok());
        assert!(rx.recv().await.is_ok());
    }

    struct PanickingListener;

    impl ProgressListener for PanickingListener {
        fn deliver(&self, _event: &RenderEvent) -> crate::Result<()> {
            panic!("listener bug");
        }
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let publisher = publisher(60);
        let healthy = Arc::new(FailingListener {
            calls: AtomicUsize::new(0),
        });
        publisher.register_listener(Arc::new(PanickingListener));
        publisher.register_listener(healthy.clone());

        publisher.publish("job-1", "user-1", JobStatus::Processing, 10);
        publisher.publish("job-1", "user-1", JobStatus::Processing, 20);

        assert_eq!(healthy.calls.load(Ordering::SeqCst), 2);
        assert_eq!(publisher.snapshot("job-1").unwrap().progress, 20);
    }

    #[test]
    fn test_record_skips_listeners() {
        let publisher = publisher(60);
        let listener = Arc::new(FailingListener {
            calls: AtomicUsize::new(0),
        });
        publisher.register_listener(listener.clone());
        let mut rx = publisher.subscribe();

        let event = RenderEvent::Progress {
            job_id: "job-1".to_string(),
            owner_id: "user-1".to_string(),
            status: JobStatus::Queued,
            progress: 0,
        };
        publisher.record(&event);

        assert_eq!(listener.calls.load(Ordering::SeqCst), 0);
        assert_eq!(publisher.snapshot("job-1").unwrap().status, JobStatus::Queued);
        assert_eq!(rx.try_recv().unwrap(), event);

        publisher.deliver(&event);
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_expiry() {
        let publisher = publisher(10);
        publisher.publish("old", "user-1", JobStatus::Completed, 100);

        tokio::time::advance(Duration::from_secs(6)).await;
        publisher.publish("new", "user-1", JobStatus::Queued, 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(publisher.snapshot("old").is_none());
        assert!(publisher.snapshot("new").is_some());

        assert_eq!(publisher.purge_expired(), 1);
        assert_eq!(publisher.snapshot_count(), 1);

        publisher.forget("new");
        assert_eq!(publisher.snapshot_count(), 0);
    }
}
