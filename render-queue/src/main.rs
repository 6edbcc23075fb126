use render_queue::config::RenderQueueConfig;
use render_queue::domain::Priority;
use render_queue::logging;
use render_queue::queue::{
    EditingInstruction, InputData, InstructionKind, JobSubmission, JobType, OutputSettings,
    RenderEvent, RenderQueue,
};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let log_dir = std::env::var("RENDER_QUEUE_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let (log_handle, _log_guard) = logging::init_logging(&log_dir)?;

    let background = CancellationToken::new();
    log_handle.spawn_retention(background.clone());

    let config = RenderQueueConfig::from_env()?;
    let queue = RenderQueue::new(config)?;
    queue.start()?;

    let mut events = queue.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event @ RenderEvent::Progress { .. }) => {
                    debug!(target: "render_queue::events", "{}", serde_json::to_string(&event).unwrap_or_default())
                }
                Ok(event) => {
                    info!(target: "render_queue::events", "{}", serde_json::to_string(&event).unwrap_or_default())
                }
                Err(RecvError::Lagged(skipped)) => warn!("Event log lagged by {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if std::env::var("RENDER_QUEUE_DEMO").is_ok_and(|v| v == "1") {
        submit_demo_jobs(&queue)?;
    }

    info!("render-queue running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    queue.shutdown().await;
    background.cancel();
    event_log.abort();

    Ok(())
}

fn submit_demo_jobs(queue: &RenderQueue) -> anyhow::Result<()> {
    let input = InputData::new("/projects/demo.prproj", "Main Sequence");

    let edit = queue.add_job(
        JobSubmission::new(
            "demo-user",
            "demo-channel",
            "demo-project",
            "seq-1",
            JobType::AiEdit,
            input.clone().with_instructions(vec![
                EditingInstruction::new(InstructionKind::Cut, 12.0),
                EditingInstruction::new(InstructionKind::Transition, 30.5).with_duration(1.0),
                EditingInstruction::new(InstructionKind::Audio, 45.0),
            ]),
        )
        .with_priority(Priority::High),
    )?;

    let export = queue.add_job(JobSubmission::new(
        "demo-user",
        "demo-channel",
        "demo-project",
        "seq-1",
        JobType::Export,
        input
            .clone()
            .with_output_settings(OutputSettings::default().with_preset("TikTok")),
    ))?;

    let preview = queue.add_job(
        JobSubmission::new(
            "demo-user",
            "demo-channel",
            "demo-project",
            "seq-1",
            JobType::Preview,
            input,
        )
        .with_priority(Priority::Urgent),
    )?;

    info!("Submitted demo jobs {}, {}, {}", edit, export, preview);
    Ok(())
}
