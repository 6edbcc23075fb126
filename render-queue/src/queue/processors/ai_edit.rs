//! AI edit processor: analyze, apply instructions, render.

use async_trait::async_trait;
use tracing::debug;

use super::renderer::RenderRequest;
use super::traits::{JobProcessor, ProcessContext};
use crate::ProcessError;
use crate::queue::job::{JobOutput, JobRecord, JobType};

const ANALYZED: u8 = 20;
const EDITING: u8 = 40;

/// Progress after applying instruction `index` of `count`.
///
/// Spreads 40..=100 evenly over the instructions. The final render keeps
/// the reported value at 100 until the job completes.
pub fn instruction_progress(index: usize, count: usize) -> u8 {
    if count == 0 {
        return EDITING;
    }
    let done = (index + 1).min(count);
    EDITING + (60 * done / count) as u8
}

#[derive(Debug, Default)]
pub struct AiEditProcessor;

impl AiEditProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobProcessor for AiEditProcessor {
    fn job_type(&self) -> JobType {
        JobType::AiEdit
    }

    fn name(&self) -> &'static str {
        "AiEditProcessor"
    }

    async fn process(
        &self,
        job: &JobRecord,
        ctx: &ProcessContext,
    ) -> Result<JobOutput, ProcessError> {
        let renderer = ctx.renderer();

        ctx.checkpoint()?;
        ctx.report(ANALYZED);
        renderer.analyze(job).await?;

        ctx.checkpoint()?;
        ctx.report(EDITING);

        let instructions = &job.input_data.editing_instructions;
        for (i, instruction) in instructions.iter().enumerate() {
            ctx.checkpoint()?;
            renderer.apply_instruction(job, instruction).await?;
            ctx.report(instruction_progress(i, instructions.len()));
        }
        debug!(job_id = %job.id, "Applied {} editing instructions", instructions.len());

        ctx.checkpoint()?;
        let artifact = renderer.render(&RenderRequest::for_job(job)).await?;
        Ok(artifact.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_progress() {
        assert_eq!(instruction_progress(0, 0), 40);
        assert_eq!(instruction_progress(0, 1), 100);
        assert_eq!(instruction_progress(0, 3), 60);
        assert_eq!(instruction_progress(1, 3), 80);
        assert_eq!(instruction_progress(2, 3), 100);
        assert_eq!(instruction_progress(0, 7), 48);
        assert_eq!(instruction_progress(9, 3), 100);
    }
}
