//! Render queue for AI-assisted editing jobs.
//!
//! The queue is responsible for:
//! - Holding submitted jobs in four priority tiers
//! - Binding waiting jobs to a bounded pool of worker slots
//! - Running ai-edit, export and preview processors with deadlines
//! - Retrying failed attempts up to each job's retry budget
//! - Publishing progress to subscribers and keeping pull snapshots
//! - Growing and shrinking the pool with the backlog

mod dispatcher;
mod job;
mod presets;
mod priority_queue;
mod processors;
mod progress;
mod resource;
mod retry;
mod service;
mod worker_pool;

pub use job::{
    EditingInstruction, InputData, InstructionKind, JobId, JobOutput, JobRecord, JobStatus,
    JobSubmission, JobType, OutputFormat, OutputSettings, RenderQuality, new_job_id,
};
pub use presets::{PREVIEW_PRESET, RESOLUTION_PRESETS, ResolutionPreset, find_preset, preset_names};
pub use priority_queue::{PriorityQueueSet, QueueDepths, QueueEntry};
pub use processors::{
    AiEditProcessor, ExportProcessor, JobProcessor, PreviewProcessor, ProcessContext,
    ProcessorRegistry, RenderRequest, RenderedArtifact, Renderer, SimulatedRenderer,
    instruction_progress, output_path, thumbnail_path,
};
pub use progress::{
    OwnerSubscription, ProgressListener, ProgressPublisher, ProgressReporter, ProgressSink,
    ProgressSnapshot, RenderEvent,
};
pub use resource::{PoolAdjustment, ResourceMonitor, ResourceReport};
pub use retry::{RetryDecision, RetryHandler};
pub use service::{QueueStatus, RenderQueue};
pub use worker_pool::{Slot, SlotId, WorkerPool};
