//! Processor trait and related types.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::renderer::Renderer;
use crate::ProcessError;
use crate::queue::job::{JobOutput, JobRecord, JobType};
use crate::queue::progress::ProgressReporter;

/// Per-attempt context handed to a processor.
#[derive(Clone)]
pub struct ProcessContext {
    reporter: ProgressReporter,
    cancel_token: CancellationToken,
    renderer: Arc<dyn Renderer>,
}

impl ProcessContext {
    pub fn new(
        reporter: ProgressReporter,
        cancel_token: CancellationToken,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self {
            reporter,
            cancel_token,
            renderer,
        }
    }

    /// Report progress (0-100). Regressions are dropped.
    pub fn report(&self, progress: u8) {
        self.reporter.report(progress);
    }

    /// Fail with `Cancelled` if cancellation was requested.
    ///
    /// Processors call this between stages; cancellation is cooperative.
    pub fn checkpoint(&self) -> Result<(), ProcessError> {
        if self.cancel_token.is_cancelled() {
            return Err(ProcessError::cancelled(format!(
                "Job {} was cancelled",
                self.reporter.job_id()
            )));
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn renderer(&self) -> &dyn Renderer {
        self.renderer.as_ref()
    }

    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }
}

/// Executes one [`JobType`].
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// The job type this processor handles.
    fn job_type(&self) -> JobType;

    /// Human-readable name for logs.
    fn name(&self) -> &'static str;

    /// Run one attempt of `job`.
    async fn process(&self, job: &JobRecord, ctx: &ProcessContext)
    -> Result<JobOutput, ProcessError>;
}
