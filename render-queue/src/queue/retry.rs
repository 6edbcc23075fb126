//! Failure handling for processing attempts.

use std::time::Duration;
use tracing::{error, info, warn};

use super::job::{JobRecord, JobStatus};
use crate::domain::RetryPolicy;
use crate::{ErrorKind, ProcessError, Result};

/// What to do with a job whose attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the job back at the head of its tier after `delay`.
    Requeue { attempt: u32, delay: Duration },
    /// Retry budget exhausted or failure not retryable.
    Fail { attempts: u32 },
    /// Cancellation was requested while the attempt ran.
    Cancel,
}

#[derive(Debug, Clone)]
pub struct RetryHandler {
    policy: RetryPolicy,
}

impl RetryHandler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Apply a failed attempt to `job` (currently `Processing`).
    ///
    /// Increments `retry_count` for every real failure, then either moves
    /// the job back to `Queued` with progress reset, or finalizes it as
    /// `Failed` with the error message recorded.
    pub fn on_failure(&self, job: &mut JobRecord, error: &ProcessError) -> Result<RetryDecision> {
        // A processor may observe its own token without a pending request
        if job.cancel_requested || error.kind == ErrorKind::Cancelled {
            job.transition_to(JobStatus::Cancelled)?;
            info!("Job {} cancelled during attempt {}", job.id, job.attempt());
            return Ok(RetryDecision::Cancel);
        }

        job.retry_count += 1;
        let retryable = error.is_retryable() || self.policy.retry_non_retryable;

        if retryable && job.retry_count < job.max_retries {
            job.transition_to(JobStatus::Queued)?;
            let delay = self.policy.delay_for_attempt(job.retry_count - 1);
            warn!(
                job_id = %job.id,
                kind = %error.kind,
                attempt = job.retry_count,
                max_retries = job.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Job attempt failed, retrying: {}",
                error
            );
            return Ok(RetryDecision::Requeue {
                attempt: job.retry_count + 1,
                delay,
            });
        }

        job.transition_to(JobStatus::Failed)?;
        job.error_message = Some(error.to_string());
        error!(
            job_id = %job.id,
            kind = %error.kind,
            attempts = job.retry_count,
            "Job failed permanently: {}",
            error
        );
        Ok(RetryDecision::Fail {
            attempts: job.retry_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::JobType;
    use crate::queue::job::tests::submission;

    fn processing_job(max_retries: u32) -> JobRecord {
        let mut job =
            JobRecord::from_submission(submission(JobType::Export).with_max_retries(max_retries), 3);
        job.transition_to(JobStatus::Processing).unwrap();
        job
    }

    #[test]
    fn test_transient_failure_requeues() {
        let handler = RetryHandler::new(RetryPolicy::default());
        let mut job = processing_job(3);
        job.progress = 70;

        let decision = handler
            .on_failure(&mut job, &ProcessError::transient("encoder crashed"))
            .unwrap();

        assert_eq!(
            decision,
            RetryDecision::Requeue {
                attempt: 2,
                delay: Duration::ZERO
            }
        );
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.progress, 0);
        assert!(job.error_message.is_none());
    }

    #[test]
    fn test_exhausted_budget_fails() {
        let handler = RetryHandler::new(RetryPolicy::default());
        let mut job = processing_job(3);
        let err = ProcessError::transient("encoder crashed");

        for _ in 0..2 {
            assert!(matches!(
                handler.on_failure(&mut job, &err).unwrap(),
                RetryDecision::Requeue { .. }
            ));
            job.transition_to(JobStatus::Processing).unwrap();
        }

        let decision = handler.on_failure(&mut job, &err).unwrap();
        assert_eq!(decision, RetryDecision::Fail { attempts: 3 });
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 3);
        assert_eq!(job.error_message.as_deref(), Some("encoder crashed"));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_validation_failure_is_final() {
        let handler = RetryHandler::new(RetryPolicy::default());
        let mut job = processing_job(3);

        let decision = handler
            .on_failure(&mut job, &ProcessError::validation("Unknown preset: VHS"))
            .unwrap();

        assert_eq!(decision, RetryDecision::Fail { attempts: 1 });
        assert_eq!(job.retry_count, 1);
    }

    #[test]
    fn test_retry_non_retryable_override() {
        let policy = RetryPolicy {
            retry_non_retryable: true,
            ..Default::default()
        };
        let handler = RetryHandler::new(policy);
        let mut job = processing_job(3);

        let decision = handler
            .on_failure(&mut job, &ProcessError::validation("flaky input"))
            .unwrap();
        assert!(matches!(decision, RetryDecision::Requeue { .. }));
    }

    #[test]
    fn test_cancel_requested_finalizes_as_cancelled() {
        let handler = RetryHandler::new(RetryPolicy::default());
        let mut job = processing_job(3);
        job.cancel_requested = true;

        let decision = handler
            .on_failure(&mut job, &ProcessError::transient("interrupted"))
            .unwrap();

        assert_eq!(decision, RetryDecision::Cancel);
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.retry_count, 0);
        assert!(job.error_message.is_none());
    }

    #[test]
    fn test_single_attempt_budget_fails_immediately() {
        let handler = RetryHandler::new(RetryPolicy::default());
        let mut job = processing_job(1);
        let decision = handler
            .on_failure(&mut job, &ProcessError::timeout("deadline"))
            .unwrap();
        assert_eq!(decision, RetryDecision::Fail { attempts: 1 });
        assert_eq!(job.retry_count, job.max_retries);
    }

    #[test]
    fn test_backoff_delay() {
        let policy = RetryPolicy {
            use_jitter: false,
            ..RetryPolicy::default().with_backoff(Duration::from_millis(100))
        };
        let handler = RetryHandler::new(policy);
        let mut job = processing_job(5);
        let err = ProcessError::resource("out of encoder sessions");

        let first = handler.on_failure(&mut job, &err).unwrap();
        job.transition_to(JobStatus::Processing).unwrap();
        let second = handler.on_failure(&mut job, &err).unwrap();

        assert_eq!(
            first,
            RetryDecision::Requeue {
                attempt: 2,
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            second,
            RetryDecision::Requeue {
                attempt: 3,
                delay: Duration::from_millis(200)
            }
        );
    }
}
