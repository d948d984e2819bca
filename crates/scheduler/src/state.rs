//! Run and worker state, and the immutable snapshots published from it

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use video_caption_common::DeviceId;

/// Lifecycle stage of the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Idle,
    LoadingModel,
    Processing,
    Complete,
    Error,
}

/// Substage reported to observers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Substage {
    #[default]
    Idle,
    ExtractingFrames,
    Encoding,
    Generating,
}

/// Position of one item in the per-item pipeline.
///
/// Transitions are strictly ordered; the attached fractions are progress hints,
/// not measured proportions of stage duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Pending,
    Extracting,
    Encoding,
    Generating,
    Persisting,
    Done,
    Failed,
}

impl PipelineStage {
    #[must_use]
    pub fn progress(self) -> f64 {
        match self {
            Self::Pending => 0.0,
            Self::Extracting => 0.2,
            Self::Encoding => 0.4,
            Self::Generating => 0.5,
            Self::Persisting => 0.9,
            Self::Done | Self::Failed => 1.0,
        }
    }

    #[must_use]
    pub fn substage(self) -> Substage {
        match self {
            Self::Pending | Self::Extracting => Substage::ExtractingFrames,
            Self::Encoding => Substage::Encoding,
            Self::Generating | Self::Persisting => Substage::Generating,
            Self::Done | Self::Failed => Substage::Idle,
        }
    }
}

/// Mutable record for one concurrency slot
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub worker_id: usize,
    pub device: DeviceId,
    pub current_video: Option<String>,
    pub substage: Substage,
    pub substage_progress: f64,
    pub is_busy: bool,
    pub last_error: Option<String>,
}

impl WorkerState {
    #[must_use]
    pub fn new(worker_id: usize, device: DeviceId) -> Self {
        Self {
            worker_id,
            device,
            current_video: None,
            substage: Substage::Idle,
            substage_progress: 0.0,
            is_busy: false,
            last_error: None,
        }
    }

    /// Bind an item to this worker
    pub fn assign(&mut self, item_name: &str) {
        self.is_busy = true;
        self.current_video = Some(item_name.to_string());
        self.enter(PipelineStage::Pending);
    }

    pub fn enter(&mut self, stage: PipelineStage) {
        self.substage = stage.substage();
        self.substage_progress = stage.progress();
    }

    /// Return to idle once the item settled (success, failure or cancellation)
    pub fn release(&mut self) {
        self.is_busy = false;
        self.current_video = None;
        self.substage = Substage::Idle;
        self.substage_progress = 0.0;
    }

    fn to_progress(&self) -> WorkerProgress {
        WorkerProgress {
            worker_id: self.worker_id,
            device: self.device.clone(),
            current_video: self.current_video.clone(),
            substage: self.substage,
            substage_progress: self.substage_progress,
            last_error: self.last_error.clone(),
        }
    }
}

/// Token accounting shared by concurrently finishing pipelines.
/// Guarded by its own lock, independent of the run lock.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TokenCounter {
    pub tokens_generated: u64,
    pub tokens_per_sec: f64,
}

impl TokenCounter {
    pub fn record(&mut self, output_tokens: u64, tokens_per_sec: f64) {
        self.tokens_generated += output_tokens;
        self.tokens_per_sec = tokens_per_sec;
    }
}

/// Global mutable run record. One instance lives for the engine's lifetime;
/// fields are overwritten when the next run starts.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub stage: Stage,
    pub current_video: Option<String>,
    pub video_index: usize,
    pub total_videos: usize,
    pub completed_videos: usize,
    pub model_loaded: bool,
    pub model_id: Option<String>,
    pub devices_loaded: Vec<DeviceId>,
    pub vram_used_gb: f64,
    pub substage: Substage,
    pub substage_progress: f64,
    pub error_message: Option<String>,
    pub batch_size: usize,
    pub workers: Vec<WorkerState>,
    started_at: Option<Instant>,
    frozen_elapsed: Option<Duration>,
}

impl RunState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            batch_size: 1,
            ..Default::default()
        }
    }

    /// Restart the elapsed-time anchor
    pub fn start_clock(&mut self) {
        self.started_at = Some(Instant::now());
        self.frozen_elapsed = None;
    }

    /// Freeze elapsed time at its current value
    pub fn stop_clock(&mut self) {
        if let Some(started) = self.started_at {
            self.frozen_elapsed = Some(started.elapsed());
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        match (self.frozen_elapsed, self.started_at) {
            (Some(frozen), _) => frozen,
            (None, Some(started)) => started.elapsed(),
            (None, None) => Duration::ZERO,
        }
    }

    /// Move a worker to a pipeline stage. A single-worker run mirrors the
    /// worker into the top-level substage fields.
    pub fn set_worker_stage(&mut self, worker_id: usize, stage: PipelineStage) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.enter(stage);
            if self.batch_size == 1 {
                self.substage = worker.substage;
                self.substage_progress = worker.substage_progress;
            }
        }
    }

    /// Bind an item to a worker and make it the run's current item
    pub fn assign_worker(&mut self, worker_id: usize, index: usize, item_name: &str) {
        self.video_index = index;
        self.current_video = Some(item_name.to_string());
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.assign(item_name);
        }
        self.set_worker_stage(worker_id, PipelineStage::Pending);
    }

    /// Mark a worker idle again
    pub fn release_worker(&mut self, worker_id: usize) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.release();
            if self.batch_size == 1 {
                self.substage = Substage::Idle;
                self.substage_progress = 0.0;
            }
        }
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.workers.iter().filter(|w| w.is_busy).count()
    }

    /// Immutable point-in-time copy
    #[must_use]
    pub fn snapshot(&self, tokens: TokenCounter) -> ProgressSnapshot {
        let running = self.frozen_elapsed.is_none();
        ProgressSnapshot {
            stage: self.stage,
            current_video: self.current_video.clone(),
            video_index: self.video_index,
            total_videos: self.total_videos,
            completed_videos: self.completed_videos,
            tokens_generated: tokens.tokens_generated,
            tokens_per_sec: tokens.tokens_per_sec,
            model_loaded: self.model_loaded,
            model_id: self.model_id.clone(),
            devices_loaded: self.devices_loaded.clone(),
            vram_used_gb: self.vram_used_gb,
            substage: self.substage,
            substage_progress: self.substage_progress.clamp(0.0, 1.0),
            error_message: self.error_message.clone(),
            elapsed_time: self.elapsed().as_secs_f64(),
            batch_size: self.batch_size,
            workers: self.workers.iter().map(WorkerState::to_progress).collect(),
            clock: self.started_at.filter(|_| running),
        }
    }
}

/// Per-worker view inside a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProgress {
    pub worker_id: usize,
    pub device: DeviceId,
    pub current_video: Option<String>,
    pub substage: Substage,
    pub substage_progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Immutable copy of the run state pushed to observers and returned by `status()`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub stage: Stage,
    pub current_video: Option<String>,
    pub video_index: usize,
    pub total_videos: usize,
    pub completed_videos: usize,
    pub tokens_generated: u64,
    pub tokens_per_sec: f64,
    pub model_loaded: bool,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub devices_loaded: Vec<DeviceId>,
    pub vram_used_gb: f64,
    pub substage: Substage,
    pub substage_progress: f64,
    pub error_message: Option<String>,
    pub elapsed_time: f64,
    pub batch_size: usize,
    pub workers: Vec<WorkerProgress>,
    #[serde(skip)]
    pub(crate) clock: Option<Instant>,
}

impl ProgressSnapshot {
    /// Recompute `elapsed_time` for a snapshot read after publication
    #[must_use]
    pub fn refreshed(mut self) -> Self {
        if let Some(started) = self.clock {
            self.elapsed_time = started.elapsed().as_secs_f64();
        }
        self
    }
}
