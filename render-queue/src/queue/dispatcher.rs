//! Dispatcher loop and per-job execution.
//!
//! The dispatcher wakes on a fixed tick, on new submissions and on slot
//! release. Each pass binds idle slots to the highest-priority ready jobs
//! and spawns one task per job. A job task runs its processor under the
//! configured deadline, then settles the outcome (complete, retry, fail or
//! cancel) and releases its slot in the same critical section.

use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::{JobId, JobOutput, JobRecord, JobStatus};
use super::processors::ProcessContext;
use super::progress::{ProgressReporter, ProgressSink, RenderEvent};
use super::retry::RetryDecision;
use super::service::{QueueState, Shared};
use super::worker_pool::SlotId;
use crate::ProcessError;

/// A job bound to a slot, ready to spawn.
struct Dispatched {
    slot_id: SlotId,
    job: JobRecord,
    token: CancellationToken,
}

pub(crate) fn spawn_dispatcher(shared: Arc<Shared>, handle: &Handle) -> JoinHandle<()> {
    handle.spawn(async move {
        let poll_interval = shared.config.dispatcher.poll_interval();
        let mut tick = tokio::time::interval(poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(poll_interval_ms = poll_interval.as_millis() as u64, "Dispatcher started");

        loop {
            tokio::select! {
                _ = shared.shutdown.cancelled() => {
                    debug!("Dispatcher shutting down");
                    break;
                }
                _ = shared.notify.notified() => {}
                _ = tick.tick() => {}
            }

            let started = dispatch_pass(&shared);
            if started > 0 {
                debug!("Dispatched {} jobs", started);
            }
        }
    })
}

/// Bind idle slots to ready jobs and spawn them. No-op before `start` and
/// after shutdown.
pub(crate) fn dispatch_pass(shared: &Arc<Shared>) -> usize {
    let Some(handle) = shared.runtime.get() else {
        return 0;
    };
    if shared.shutdown.is_cancelled() {
        return 0;
    }

    let dispatched = {
        let mut state = shared.state.lock();
        take_ready_jobs(shared, &mut state)
    };

    // Every bound job gets its task, and with it a slot guard, before any
    // listener code runs
    let events: Vec<RenderEvent> =
        dispatched.iter().map(|item| progress_event(&item.job)).collect();
    for item in dispatched {
        shared
            .tracker
            .spawn_on(run_job(Arc::clone(shared), item), handle);
    }
    shared.deliver_all(&events);
    events.len()
}

fn take_ready_jobs(shared: &Shared, state: &mut QueueState) -> Vec<Dispatched> {
    let now = Instant::now();
    let mut dispatched = Vec::new();

    while let Some(slot_id) = state.pool.idle_slot() {
        let Some((job_id, priority)) = state.tiers.dequeue_next_ready(now) else {
            break;
        };
        let QueueState {
            tiers,
            pool,
            jobs,
            cancel_tokens,
        } = &mut *state;

        let Some(job) = jobs.get_mut(&job_id) else {
            warn!("Dropping queue entry for unknown job {}", job_id);
            continue;
        };
        if job.status != JobStatus::Queued {
            warn!("Skipping job {} in state {}", job_id, job.status);
            continue;
        }
        if let Err(e) = pool.bind(&slot_id, &job_id) {
            error!("Failed to bind job {} to {}: {}", job_id, slot_id, e);
            tiers.requeue_front(job_id, priority, None);
            break;
        }
        if let Err(e) = job.transition_to(JobStatus::Processing) {
            error!("Failed to start job {}: {}", job_id, e);
            pool.release(&slot_id);
            continue;
        }

        debug!(job_id = %job_id, worker = %slot_id, priority = %priority, "Dispatching job");
        shared.publisher.record(&progress_event(job));
        let token = CancellationToken::new();
        cancel_tokens.insert(job_id, token.clone());
        dispatched.push(Dispatched {
            slot_id,
            job: job.clone(),
            token,
        });
    }

    dispatched
}

/// Settles the job if its task ends without reaching `finish`.
struct SlotGuard {
    shared: Arc<Shared>,
    slot_id: SlotId,
    job_id: JobId,
    armed: bool,
}

impl SlotGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            error!(job_id = %self.job_id, worker = %self.slot_id, "Job task ended abnormally");
            finish(
                &self.shared,
                &self.slot_id,
                &self.job_id,
                Err(ProcessError::transient("Job task ended abnormally")),
                Duration::ZERO,
            );
        }
    }
}

async fn run_job(shared: Arc<Shared>, dispatched: Dispatched) {
    let Dispatched {
        slot_id,
        job,
        token,
    } = dispatched;
    let mut guard = SlotGuard {
        shared: Arc::clone(&shared),
        slot_id: slot_id.clone(),
        job_id: job.id.clone(),
        armed: true,
    };

    info!(
        job_id = %job.id,
        worker = %slot_id,
        job_type = %job.job_type,
        attempt = job.attempt(),
        max_retries = job.max_retries,
        "Worker started processing job"
    );

    let started = Instant::now();
    let outcome = execute(&shared, &job, token).await;
    guard.disarm();
    finish(&shared, &slot_id, &job.id, outcome, started.elapsed());
}

async fn execute(
    shared: &Arc<Shared>,
    job: &JobRecord,
    token: CancellationToken,
) -> Result<JobOutput, ProcessError> {
    let processor = shared.processors.get(job.job_type).ok_or_else(|| {
        ProcessError::validation(format!("No processor registered for {} jobs", job.job_type))
    })?;

    let sink: Arc<dyn ProgressSink> = Arc::clone(shared) as Arc<dyn ProgressSink>;
    let reporter = ProgressReporter::new(job.id.clone(), job.owner_id.clone(), job.attempt(), sink);
    let ctx = ProcessContext::new(reporter, token, Arc::clone(&shared.renderer));

    let attempt = processor.process(job, &ctx);
    let mut output = match shared.config.dispatcher.job_timeout() {
        Some(limit) => tokio::time::timeout(limit, attempt).await.map_err(|_| {
            ProcessError::timeout(format!(
                "Job exceeded processing deadline of {}s",
                limit.as_secs()
            ))
        })??,
        None => attempt.await?,
    };

    if output.thumbnail_path.is_none()
        && let Some(video) = output.file_paths.first()
    {
        match shared.renderer.thumbnail(video).await {
            Ok(path) => output.thumbnail_path = Some(path),
            Err(e) => warn!(job_id = %job.id, "Thumbnail generation failed: {}", e),
        }
    }

    Ok(output)
}

/// Apply an attempt's outcome and free its slot atomically.
fn finish(
    shared: &Shared,
    slot_id: &str,
    job_id: &str,
    outcome: Result<JobOutput, ProcessError>,
    elapsed: Duration,
) {
    let events = {
        let mut state = shared.state.lock();
        let events = settle(shared, &mut state, slot_id, job_id, outcome, elapsed);
        shared.record_all(&events);
        events
    };

    shared.deliver_all(&events);
    shared.notify.notify_one();
}

fn settle(
    shared: &Shared,
    state: &mut QueueState,
    slot_id: &str,
    job_id: &str,
    outcome: Result<JobOutput, ProcessError>,
    elapsed: Duration,
) -> Vec<RenderEvent> {
    let QueueState {
        tiers,
        pool,
        jobs,
        cancel_tokens,
    } = state;
    pool.release(slot_id);
    cancel_tokens.remove(job_id);

    let Some(job) = jobs.get_mut(job_id) else {
        warn!("Job {} finished on {} but is no longer tracked", job_id, slot_id);
        return Vec::new();
    };

    // A cancel request wins over a late success
    let outcome = match outcome {
        Ok(_) if job.cancel_requested => Err(ProcessError::cancelled(format!(
            "Job {} was cancelled",
            job_id
        ))),
        other => other,
    };

    let error = match outcome {
        Ok(output) => return complete(job, output, elapsed),
        Err(error) => error,
    };

    match shared.retry.on_failure(job, &error) {
        Ok(RetryDecision::Requeue { delay, .. }) => {
            let ready_at = (!delay.is_zero()).then(|| Instant::now() + delay);
            tiers.requeue_front(job.id.clone(), job.priority, ready_at);
            vec![progress_event(job)]
        }
        Ok(RetryDecision::Fail { attempts }) => vec![
            progress_event(job),
            RenderEvent::Failed {
                job_id: job.id.clone(),
                owner_id: job.owner_id.clone(),
                error: error.to_string(),
                attempts,
            },
        ],
        Ok(RetryDecision::Cancel) => vec![
            progress_event(job),
            RenderEvent::Cancelled {
                job_id: job.id.clone(),
                owner_id: job.owner_id.clone(),
            },
        ],
        Err(e) => {
            error!("Failed to settle job {}: {}", job_id, e);
            Vec::new()
        }
    }
}

fn complete(job: &mut JobRecord, output: JobOutput, elapsed: Duration) -> Vec<RenderEvent> {
    if let Err(e) = job.transition_to(JobStatus::Completed) {
        error!("Failed to complete job {}: {}", job.id, e);
        return Vec::new();
    }
    job.output = Some(output.clone());
    info!("Job {} completed in {:.2}s", job.id, elapsed.as_secs_f64());

    vec![
        progress_event(job),
        RenderEvent::Completed {
            job_id: job.id.clone(),
            owner_id: job.owner_id.clone(),
            output,
        },
    ]
}

fn progress_event(job: &JobRecord) -> RenderEvent {
    RenderEvent::Progress {
        job_id: job.id.clone(),
        owner_id: job.owner_id.clone(),
        status: job.status,
        progress: job.progress,
    }
}
