//! Preview processor: one fast low-fidelity render.

use async_trait::async_trait;

use super::renderer::RenderRequest;
use super::traits::{JobProcessor, ProcessContext};
use crate::ProcessError;
use crate::queue::job::{JobOutput, JobRecord, JobType};

#[derive(Debug, Default)]
pub struct PreviewProcessor;

impl PreviewProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobProcessor for PreviewProcessor {
    fn job_type(&self) -> JobType {
        JobType::Preview
    }

    fn name(&self) -> &'static str {
        "PreviewProcessor"
    }

    async fn process(
        &self,
        job: &JobRecord,
        ctx: &ProcessContext,
    ) -> Result<JobOutput, ProcessError> {
        ctx.checkpoint()?;
        ctx.report(50);
        let artifact = ctx
            .renderer()
            .render(&RenderRequest::for_job(job).as_preview())
            .await?;
        Ok(artifact.into())
    }
}
