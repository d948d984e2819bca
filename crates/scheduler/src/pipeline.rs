//! Per-item pipeline: extract → encode → generate → persist

use crate::backend::{Backends, FrameLimits, GenerationRequest, ModelHandle};
use crate::context::RunContext;
use crate::state::PipelineStage;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use video_caption_common::{DeviceId, Generation, MediaItem, ProcessingError, Result, RunSettings};

const PREVIEW_CHARS: usize = 200;
const FOOTER_RULE_WIDTH: usize = 60;

/// Outcome of one processed item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub video: String,
    pub success: bool,
    pub error: Option<String>,
    pub caption_preview: Option<String>,
    pub output_path: Option<PathBuf>,
    pub worker_id: usize,
}

impl ItemResult {
    pub(crate) fn failed(item: &MediaItem, worker_id: usize, error: String) -> Self {
        Self {
            video: item.name().to_string(),
            success: false,
            error: Some(error),
            caption_preview: None,
            output_path: None,
            worker_id,
        }
    }
}

/// How a pipeline execution ended. Cancelled items produce no result.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Finished(ItemResult),
    Cancelled,
}

/// One item bound to one worker
pub struct PipelineJob {
    pub worker_id: usize,
    pub device: DeviceId,
    pub item: MediaItem,
    pub handle: Option<ModelHandle>,
    pub settings: Arc<RunSettings>,
    /// Run uses more than one worker (adds the worker line to the footer)
    pub parallel: bool,
}

/// Runs the stage machine for one item against one model handle
#[derive(Clone)]
pub struct PipelineExecutor {
    ctx: Arc<RunContext>,
    backends: Backends,
}

impl PipelineExecutor {
    #[must_use]
    pub fn new(ctx: Arc<RunContext>, backends: Backends) -> Self {
        Self { ctx, backends }
    }

    /// Process one item. Stage errors are captured in the result, never returned.
    pub async fn run(&self, job: PipelineJob, cancel: CancellationToken) -> PipelineOutcome {
        let worker_id = job.worker_id;
        match self.run_stages(&job, &cancel).await {
            Ok(Some(result)) => {
                self.transition(worker_id, PipelineStage::Done);
                PipelineOutcome::Finished(result)
            }
            Ok(None) => {
                debug!("Worker {} cancelled {}", worker_id, job.item.name());
                PipelineOutcome::Cancelled
            }
            Err(e) => {
                let message = e.to_string();
                warn!(
                    "Worker {} error processing {}: {}",
                    worker_id,
                    job.item.name(),
                    message
                );
                self.ctx.update(|s| {
                    s.set_worker_stage(worker_id, PipelineStage::Failed);
                    if let Some(worker) = s.workers.get_mut(worker_id) {
                        worker.last_error = Some(message.clone());
                    }
                });
                PipelineOutcome::Finished(ItemResult::failed(&job.item, worker_id, message))
            }
        }
    }

    fn transition(&self, worker_id: usize, stage: PipelineStage) {
        self.ctx.update(|s| s.set_worker_stage(worker_id, stage));
    }

    /// `Ok(None)` when cancellation was observed between stages
    async fn run_stages(
        &self,
        job: &PipelineJob,
        cancel: &CancellationToken,
    ) -> Result<Option<ItemResult>> {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let handle = job.handle.clone().ok_or_else(|| {
            ProcessingError::Generation(format!("No model loaded on {}", job.device))
        })?;

        self.transition(job.worker_id, PipelineStage::Extracting);
        let extractor = self.backends.extractor.clone();
        let path = job.item.path().to_path_buf();
        let limits = FrameLimits::from(job.settings.as_ref());
        let frames = blocking(move || extractor.extract(&path, limits)).await?;

        if cancel.is_cancelled() {
            return Ok(None);
        }
        self.transition(job.worker_id, PipelineStage::Encoding);
        self.transition(job.worker_id, PipelineStage::Generating);

        let request = GenerationRequest::from(job.settings.as_ref());
        let generation = blocking(move || handle.generate(&frames, &request)).await?;

        self.ctx
            .record_tokens(generation.output_tokens, generation.tokens_per_sec);
        let vram = self.backends.memory_used_gb();
        self.ctx.update(|s| s.vram_used_gb = vram);

        if cancel.is_cancelled() {
            return Ok(None);
        }
        self.transition(job.worker_id, PipelineStage::Persisting);

        let footer = job.settings.include_metadata.then(|| {
            metadata_footer(
                &job.item,
                job.parallel.then(|| (job.worker_id, &job.device)),
                &generation,
            )
        });
        let item = job.item.clone();
        let caption = generation.caption.clone();
        let output_path = blocking(move || persist_caption(&item, &caption, footer.as_deref())).await?;

        Ok(Some(ItemResult {
            video: job.item.name().to_string(),
            success: true,
            error: None,
            caption_preview: Some(preview(&generation.caption)),
            output_path: Some(output_path),
            worker_id: job.worker_id,
        }))
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProcessingError::Other(anyhow::anyhow!("stage task failed: {e}")))?
}

/// Write the caption next to the source item, returning the file path
pub fn persist_caption(item: &MediaItem, caption: &str, footer: Option<&str>) -> Result<PathBuf> {
    let path = item.caption_path();
    let mut contents = String::with_capacity(caption.len() + footer.map_or(0, str::len));
    contents.push_str(caption);
    if let Some(footer) = footer {
        contents.push_str(footer);
    }
    std::fs::write(&path, contents)?;
    Ok(path)
}

/// Metadata block appended after two blank lines. `worker` is set for
/// multi-worker runs only.
#[must_use]
pub fn metadata_footer(
    item: &MediaItem,
    worker: Option<(usize, &DeviceId)>,
    generation: &Generation,
) -> String {
    let rule = "=".repeat(FOOTER_RULE_WIDTH);
    let mut footer = String::new();
    // Writing to a String cannot fail
    let _ = write!(footer, "\n\n{rule}\nMETADATA\n{rule}\n");
    let _ = writeln!(footer, "Video: {}", item.name());
    if let Some((id, device)) = worker {
        let _ = writeln!(footer, "Worker: {id} ({device})");
    }
    let _ = writeln!(footer, "Frames processed: {}", generation.num_frames);
    let _ = writeln!(footer, "Output tokens: {}", generation.output_tokens);
    let _ = writeln!(footer, "Tokens/sec: {:.1}", generation.tokens_per_sec);
    footer
}

fn preview(caption: &str) -> String {
    if caption.chars().count() > PREVIEW_CHARS {
        let head: String = caption.chars().take(PREVIEW_CHARS).collect();
        format!("{head}...")
    } else {
        caption.to_string()
    }
}
