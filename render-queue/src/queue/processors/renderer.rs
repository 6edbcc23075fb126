//! Render backend abstraction.
//!
//! Processors drive a [`Renderer`] through analysis, edit application,
//! encoding and thumbnail extraction. The bundled [`SimulatedRenderer`]
//! stands in for a real video engine: it sleeps for each stage and
//! reports artifacts sized from the preset bitrate.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::ProcessError;
use crate::config::RenderConfig;
use crate::queue::job::{
    EditingInstruction, JobId, JobOutput, JobRecord, JobType, OutputFormat, RenderQuality,
};
use crate::queue::presets::{PREVIEW_PRESET, find_preset};

/// Parameters for one encode.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub job_id: JobId,
    pub job_type: JobType,
    pub format: OutputFormat,
    pub preset: String,
    pub quality: RenderQuality,
    pub include_audio: bool,
    pub preview: bool,
    pub duration_secs: f64,
}

impl RenderRequest {
    pub fn for_job(job: &JobRecord) -> Self {
        let settings = &job.input_data.output_settings;
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type,
            format: settings.format,
            preset: settings.preset.clone(),
            quality: settings.quality,
            include_audio: settings.include_audio,
            preview: false,
            duration_secs: job
                .estimated_duration_secs
                .unwrap_or_else(|| job.job_type.nominal_duration_secs()),
        }
    }

    /// Downgrade to a low-fidelity preview encode.
    pub fn as_preview(mut self) -> Self {
        self.preview = true;
        self.preset = PREVIEW_PRESET.to_string();
        self.quality = RenderQuality::Preview;
        self
    }
}

/// A file written by the renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedArtifact {
    pub path: String,
    pub duration_secs: f64,
    pub size_bytes: u64,
}

impl From<RenderedArtifact> for JobOutput {
    fn from(artifact: RenderedArtifact) -> Self {
        JobOutput {
            file_paths: vec![artifact.path],
            thumbnail_path: None,
            duration_secs: artifact.duration_secs,
            size_bytes: artifact.size_bytes,
        }
    }
}

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Inspect the project and sequence before editing.
    async fn analyze(&self, job: &JobRecord) -> Result<(), ProcessError>;

    async fn apply_instruction(
        &self,
        job: &JobRecord,
        instruction: &EditingInstruction,
    ) -> Result<(), ProcessError>;

    /// Encode pass `pass` of `passes` for a multi-pass export.
    async fn encode_pass(
        &self,
        request: &RenderRequest,
        pass: u32,
        passes: u32,
    ) -> Result<(), ProcessError>;

    /// Produce the final output file.
    async fn render(&self, request: &RenderRequest) -> Result<RenderedArtifact, ProcessError>;

    /// Extract a thumbnail next to `video_path`, returning its path.
    async fn thumbnail(&self, video_path: &str) -> Result<String, ProcessError>;
}

/// Output path for a render: `<dir>/<job_id>[_preview].<ext>`.
pub fn output_path(output_dir: &Path, request: &RenderRequest) -> PathBuf {
    let suffix = if request.preview { "_preview" } else { "" };
    output_dir.join(format!(
        "{}{}.{}",
        request.job_id,
        suffix,
        request.format.extension()
    ))
}

/// Thumbnail path for a video: same stem with `_thumb.jpg`.
pub fn thumbnail_path(video_path: &str) -> String {
    let path = Path::new(video_path);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| video_path.to_string());
    path.with_file_name(format!("{}_thumb.jpg", stem))
        .to_string_lossy()
        .into_owned()
}

/// Renderer that simulates work with timed sleeps.
#[derive(Debug, Clone)]
pub struct SimulatedRenderer {
    output_dir: PathBuf,
    stage_delay: Duration,
}

impl SimulatedRenderer {
    pub fn new(config: &RenderConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            stage_delay: config.stage_delay(),
        }
    }

    /// Renderer with no simulated latency.
    pub fn instant(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            stage_delay: Duration::ZERO,
        }
    }

    async fn work(&self, units: u32) {
        if !self.stage_delay.is_zero() {
            tokio::time::sleep(self.stage_delay * units).await;
        }
    }
}

#[async_trait]
impl Renderer for SimulatedRenderer {
    async fn analyze(&self, job: &JobRecord) -> Result<(), ProcessError> {
        debug!(
            job_id = %job.id,
            project = %job.input_data.project_path,
            sequence = %job.input_data.sequence_name,
            "Analyzing sequence"
        );
        self.work(4).await;
        Ok(())
    }

    async fn apply_instruction(
        &self,
        job: &JobRecord,
        instruction: &EditingInstruction,
    ) -> Result<(), ProcessError> {
        debug!(
            job_id = %job.id,
            kind = ?instruction.kind,
            timestamp = instruction.timestamp,
            "Applying editing instruction"
        );
        self.work(1).await;
        Ok(())
    }

    async fn encode_pass(
        &self,
        request: &RenderRequest,
        pass: u32,
        passes: u32,
    ) -> Result<(), ProcessError> {
        debug!(job_id = %request.job_id, "Encode pass {}/{}", pass + 1, passes);
        self.work(2).await;
        Ok(())
    }

    async fn render(&self, request: &RenderRequest) -> Result<RenderedArtifact, ProcessError> {
        let preset = find_preset(&request.preset)
            .ok_or_else(|| ProcessError::validation(format!("Unknown preset: {}", request.preset)))?;

        self.work(if request.preview { 2 } else { 6 }).await;

        let path = output_path(&self.output_dir, request);
        debug!(job_id = %request.job_id, path = %path.display(), preset = preset.name, "Rendered output");
        Ok(RenderedArtifact {
            path: path.to_string_lossy().into_owned(),
            duration_secs: request.duration_secs,
            size_bytes: preset.estimated_size_bytes(request.duration_secs, request.include_audio),
        })
    }

    async fn thumbnail(&self, video_path: &str) -> Result<String, ProcessError> {
        self.work(1).await;
        Ok(thumbnail_path(video_path))
    }
}
