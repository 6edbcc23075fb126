//! Export processor: multi-pass encode with a named preset.

use async_trait::async_trait;

use super::renderer::RenderRequest;
use super::traits::{JobProcessor, ProcessContext};
use crate::ProcessError;
use crate::queue::job::{JobOutput, JobRecord, JobType};
use crate::queue::presets::find_preset;

/// Encode passes; progress advances 10 points per pass.
const PASSES: u32 = 10;

#[derive(Debug, Default)]
pub struct ExportProcessor;

impl ExportProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobProcessor for ExportProcessor {
    fn job_type(&self) -> JobType {
        JobType::Export
    }

    fn name(&self) -> &'static str {
        "ExportProcessor"
    }

    async fn process(
        &self,
        job: &JobRecord,
        ctx: &ProcessContext,
    ) -> Result<JobOutput, ProcessError> {
        let preset_name = &job.input_data.output_settings.preset;
        let preset = find_preset(preset_name)
            .ok_or_else(|| ProcessError::validation(format!("Unknown preset: {}", preset_name)))?;

        let mut request = RenderRequest::for_job(job);
        request.preset = preset.name.to_string();

        for pass in 0..PASSES {
            ctx.checkpoint()?;
            ctx.report((pass * 100 / PASSES) as u8);
            ctx.renderer().encode_pass(&request, pass, PASSES).await?;
        }

        ctx.checkpoint()?;
        let artifact = ctx.renderer().render(&request).await?;
        Ok(artifact.into())
    }
}
