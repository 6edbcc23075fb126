//! Job processors, one per job type.

mod ai_edit;
mod export;
mod preview;
mod renderer;
mod traits;

pub use ai_edit::{AiEditProcessor, instruction_progress};
pub use export::ExportProcessor;
pub use preview::PreviewProcessor;
pub use renderer::{
    RenderRequest, RenderedArtifact, Renderer, SimulatedRenderer, output_path, thumbnail_path,
};
pub use traits::{JobProcessor, ProcessContext};

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::job::JobType;

/// Maps each job type to the processor that runs it.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<JobType, Arc<dyn JobProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in ai-edit, export and preview processors.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AiEditProcessor::new()));
        registry.register(Arc::new(ExportProcessor::new()));
        registry.register(Arc::new(PreviewProcessor::new()));
        registry
    }

    /// Register a processor, replacing any previous one for its type.
    pub fn register(&mut self, processor: Arc<dyn JobProcessor>) {
        let job_type = processor.job_type();
        info!("Registered processor {} for {} jobs", processor.name(), job_type);
        self.processors.insert(job_type, processor);
    }

    pub fn with(mut self, processor: Arc<dyn JobProcessor>) -> Self {
        self.register(processor);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobProcessor>> {
        self.processors.get(&job_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<JobType> {
        JobType::ALL
            .into_iter()
            .filter(|t| self.processors.contains_key(t))
            .collect()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}
