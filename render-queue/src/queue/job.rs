//! Render job records and submissions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::presets::find_preset;
use crate::domain::Priority;
use crate::{Error, Result};

/// Queue-assigned job identifier.
pub type JobId = String;

/// Generate a fresh job id.
pub fn new_job_id() -> JobId {
    format!("job_{}", Uuid::new_v4().simple())
}

/// Kind of render work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    /// Apply AI-derived editing instructions, then render.
    AiEdit,
    /// Full-quality render with a named preset.
    Export,
    /// Fast low-fidelity render.
    Preview,
}

impl JobType {
    pub const ALL: [JobType; 3] = [Self::AiEdit, Self::Export, Self::Preview];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AiEdit => "ai-edit",
            Self::Export => "export",
            Self::Preview => "preview",
        }
    }

    /// Nominal output length used when nothing better is known.
    pub fn nominal_duration_secs(&self) -> f64 {
        match self {
            Self::AiEdit => 120.0,
            Self::Export => 300.0,
            Self::Preview => 60.0,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Legal lifecycle edges. `Processing -> Queued` is a retry.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Processing, Queued)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Mp4,
    Mov,
    Avi,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mov => "mov",
            Self::Avi => "avi",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderQuality {
    Draft,
    Preview,
    #[default]
    High,
    Master,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSettings {
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default)]
    pub quality: RenderQuality,
    #[serde(default = "default_true")]
    pub include_audio: bool,
    /// Opaque encoder overrides passed through to the renderer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_settings: Option<serde_json::Value>,
}

fn default_preset() -> String {
    "1080p".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            format: OutputFormat::default(),
            preset: default_preset(),
            quality: RenderQuality::default(),
            include_audio: true,
            custom_settings: None,
        }
    }
}

impl OutputSettings {
    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = preset.into();
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstructionKind {
    Cut,
    Transition,
    Effect,
    Audio,
}

/// A single timeline edit produced by the AI assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditingInstruction {
    #[serde(rename = "type")]
    pub kind: InstructionKind,
    /// Position on the timeline in seconds.
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl EditingInstruction {
    pub fn new(kind: InstructionKind, timestamp: f64) -> Self {
        Self {
            kind,
            timestamp,
            duration: None,
            parameters: serde_json::Value::Null,
        }
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputData {
    pub project_path: String,
    pub sequence_name: String,
    #[serde(default)]
    pub output_settings: OutputSettings,
    #[serde(default)]
    pub editing_instructions: Vec<EditingInstruction>,
}

impl InputData {
    pub fn new(project_path: impl Into<String>, sequence_name: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            sequence_name: sequence_name.into(),
            output_settings: OutputSettings::default(),
            editing_instructions: Vec::new(),
        }
    }

    pub fn with_output_settings(mut self, settings: OutputSettings) -> Self {
        self.output_settings = settings;
        self
    }

    pub fn with_instructions(mut self, instructions: Vec<EditingInstruction>) -> Self {
        self.editing_instructions = instructions;
        self
    }
}

/// Artifacts produced by a successful job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutput {
    pub file_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<String>,
    pub duration_secs: f64,
    pub size_bytes: u64,
}

/// A request to render something, before the queue assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmission {
    pub owner_id: String,
    pub channel_id: String,
    pub project_id: String,
    pub sequence_id: String,
    pub job_type: JobType,
    #[serde(default)]
    pub priority: Priority,
    pub input_data: InputData,
    /// Overrides the queue's default retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub estimated_duration_secs: Option<f64>,
}

impl JobSubmission {
    pub fn new(
        owner_id: impl Into<String>,
        channel_id: impl Into<String>,
        project_id: impl Into<String>,
        sequence_id: impl Into<String>,
        job_type: JobType,
        input_data: InputData,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            channel_id: channel_id.into(),
            project_id: project_id.into(),
            sequence_id: sequence_id.into(),
            job_type,
            priority: Priority::default(),
            input_data,
            max_retries: None,
            estimated_duration_secs: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Reject submissions that could never render.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("ownerId", &self.owner_id),
            ("channelId", &self.channel_id),
            ("projectId", &self.project_id),
            ("sequenceId", &self.sequence_id),
            ("inputData.projectPath", &self.input_data.project_path),
            ("inputData.sequenceName", &self.input_data.sequence_name),
        ] {
            if value.trim().is_empty() {
                return Err(Error::validation(format!("{} must not be empty", field)));
            }
        }

        let preset = &self.input_data.output_settings.preset;
        if find_preset(preset).is_none() {
            return Err(Error::validation(format!("Unknown preset: {}", preset)));
        }

        for (i, instruction) in self.input_data.editing_instructions.iter().enumerate() {
            if !instruction.timestamp.is_finite() || instruction.timestamp < 0.0 {
                return Err(Error::validation(format!(
                    "editingInstructions[{}].timestamp must be a non-negative number",
                    i
                )));
            }
            if let Some(duration) = instruction.duration
                && (!duration.is_finite() || duration <= 0.0)
            {
                return Err(Error::validation(format!(
                    "editingInstructions[{}].duration must be positive",
                    i
                )));
            }
        }

        // A job gets at least one attempt; retry_count never exceeds the budget
        if self.max_retries == Some(0) {
            return Err(Error::validation("maxRetries must be at least 1"));
        }

        if let Some(estimate) = self.estimated_duration_secs
            && (!estimate.is_finite() || estimate < 0.0)
        {
            return Err(Error::validation("estimatedDurationSecs must be non-negative"));
        }

        Ok(())
    }
}

/// Authoritative state of one submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub owner_id: String,
    pub channel_id: String,
    pub project_id: String,
    pub sequence_id: String,
    pub job_type: JobType,
    pub priority: Priority,
    pub status: JobStatus,
    /// 0..=100
    pub progress: u8,
    pub input_data: InputData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JobOutput>,
    /// Set only when the job ends in `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_duration_secs: Option<f64>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl JobRecord {
    pub fn from_submission(submission: JobSubmission, default_max_retries: u32) -> Self {
        Self {
            id: new_job_id(),
            owner_id: submission.owner_id,
            channel_id: submission.channel_id,
            project_id: submission.project_id,
            sequence_id: submission.sequence_id,
            job_type: submission.job_type,
            priority: submission.priority,
            status: JobStatus::Queued,
            progress: 0,
            input_data: submission.input_data,
            output: None,
            error_message: None,
            retry_count: 0,
            max_retries: submission.max_retries.unwrap_or(default_max_retries),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            estimated_duration_secs: submission.estimated_duration_secs,
            cancel_requested: false,
        }
    }

    /// Move to `next`, stamping lifecycle timestamps.
    pub fn transition_to(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid_transition(self.status, next));
        }
        match next {
            JobStatus::Processing => {
                self.started_at = Some(Utc::now());
                self.progress = 0;
            }
            JobStatus::Queued => self.progress = 0,
            JobStatus::Completed => {
                self.progress = 100;
                self.completed_at = Some(Utc::now());
            }
            JobStatus::Failed | JobStatus::Cancelled => self.completed_at = Some(Utc::now()),
        }
        self.status = next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 1-based number of the current (or next) processing attempt.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    /// Seconds between submission and first dispatch.
    pub fn queue_wait_secs(&self) -> Option<f64> {
        self.started_at
            .map(|started| (started - self.created_at).num_milliseconds() as f64 / 1000.0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn submission(job_type: JobType) -> JobSubmission {
        JobSubmission::new(
            "user-1",
            "channel-1",
            "project-1",
            "sequence-1",
            job_type,
            InputData::new("/projects/demo.prproj", "Main Sequence"),
        )
    }

    #[test]
    fn test_job_id_format() {
        let id = new_job_id();
        assert!(id.starts_with("job_"));
        assert_eq!(id.len(), 4 + 32);
        assert_ne!(id, new_job_id());
    }

    #[test]
    fn test_status_transitions() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(JobStatus::Queued));
            assert!(!terminal.can_transition_to(JobStatus::Processing));
        }
    }

    #[test]
    fn test_record_lifecycle() {
        let mut job = JobRecord::from_submission(submission(JobType::Export), 3);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.attempt(), 1);

        job.transition_to(JobStatus::Processing).unwrap();
        assert!(job.started_at.is_some());
        assert!(job.queue_wait_secs().unwrap() >= 0.0);

        job.progress = 40;
        job.transition_to(JobStatus::Completed).unwrap();
        assert_eq!(job.progress, 100);
        assert!(job.completed_at.is_some());

        let err = job.transition_to(JobStatus::Processing).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_submission_max_retries_override() {
        let job = JobRecord::from_submission(submission(JobType::Preview).with_max_retries(1), 3);
        assert_eq!(job.max_retries, 1);
    }

    #[test]
    fn test_validation_rejects_zero_retry_budget() {
        let err = submission(JobType::Export).with_max_retries(0).validate().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("maxRetries"));
        assert!(submission(JobType::Export).with_max_retries(1).validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_empty_owner() {
        let mut sub = submission(JobType::Export);
        sub.owner_id = "  ".to_string();
        let err = sub.validate().unwrap_err();
        assert!(err.to_string().contains("ownerId"));
    }

    #[test]
    fn test_validation_rejects_unknown_preset() {
        let mut sub = submission(JobType::Export);
        sub.input_data.output_settings.preset = "8K".to_string();
        let err = sub.validate().unwrap_err();
        assert!(err.to_string().contains("Unknown preset: 8K"));
    }

    #[test]
    fn test_validation_rejects_bad_instruction() {
        let mut sub = submission(JobType::AiEdit);
        sub.input_data.editing_instructions =
            vec![EditingInstruction::new(InstructionKind::Cut, 1.0).with_duration(0.0)];
        assert!(sub.validate().is_err());

        sub.input_data.editing_instructions =
            vec![EditingInstruction::new(InstructionKind::Effect, -2.0)];
        assert!(sub.validate().is_err());

        sub.input_data.editing_instructions =
            vec![EditingInstruction::new(InstructionKind::Audio, 2.0).with_duration(1.5)];
        assert!(sub.validate().is_ok());
    }

    #[test]
    fn test_submission_wire_format() {
        let json = r#"{
            "ownerId": "u1",
            "channelId": "c1",
            "projectId": "p1",
            "sequenceId": "s1",
            "jobType": "ai-edit",
            "priority": "urgent",
            "inputData": {
                "projectPath": "/p.prproj",
                "sequenceName": "Seq",
                "outputSettings": {"format": "mov", "preset": "TikTok", "quality": "draft"},
                "editingInstructions": [
                    {"type": "cut", "timestamp": 1.5, "parameters": {"keep": false}}
                ]
            }
        }"#;
        let sub: JobSubmission = serde_json::from_str(json).unwrap();
        assert_eq!(sub.job_type, JobType::AiEdit);
        assert_eq!(sub.priority, Priority::Urgent);
        assert_eq!(sub.input_data.output_settings.format, OutputFormat::Mov);
        assert!(sub.input_data.output_settings.include_audio);
        assert_eq!(sub.input_data.editing_instructions[0].kind, InstructionKind::Cut);
        assert!(sub.validate().is_ok());
    }
}
