//! Collaborator interfaces the scheduler drives but does not implement.
//!
//! Frame decoding, model loading and inference are blocking operations and are
//! always called from the blocking thread pool. Device queries are expected to
//! be cheap snapshots and are called inline.

use std::path::Path;
use std::sync::Arc;
use video_caption_common::{DeviceId, FrameBatch, Generation, Result, RunSettings};

/// A model copy resident on one device
pub trait CaptionModel: Send + Sync {
    /// Device the weights live on
    fn device(&self) -> &DeviceId;

    /// Produce a caption for the sampled frames
    fn generate(&self, frames: &FrameBatch, request: &GenerationRequest) -> Result<Generation>;
}

/// Handle lent out by the model pool. Pipelines only ever hold a shared reference.
pub type ModelHandle = Arc<dyn CaptionModel>;

/// Loads model copies onto devices
pub trait ModelLoader: Send + Sync {
    fn load(&self, settings: &RunSettings, device: &DeviceId) -> Result<ModelHandle>;

    /// Release allocator caches after handles are dropped
    fn clear_cache(&self) {}
}

/// Samples frames from a media file
pub trait FrameExtractor: Send + Sync {
    fn extract(&self, path: &Path, limits: FrameLimits) -> Result<FrameBatch>;
}

/// Static and live information about one accelerator
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub device: DeviceId,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub utilization_percent: Option<u32>,
}

/// Reports accelerator inventory and memory usage
pub trait DeviceMonitor: Send + Sync {
    /// One snapshot of every device, memory usage included
    fn devices(&self) -> Vec<DeviceInfo>;
}

/// Monitor for hosts without accelerators
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDevices;

impl DeviceMonitor for NoDevices {
    fn devices(&self) -> Vec<DeviceInfo> {
        Vec::new()
    }
}

/// Frame sampling bounds taken from the run settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_frames: u32,
    pub frame_size: u32,
}

impl From<&RunSettings> for FrameLimits {
    fn from(settings: &RunSettings) -> Self {
        Self {
            max_frames: settings.max_frames,
            frame_size: settings.frame_size,
        }
    }
}

/// Inputs to a generation call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl From<&RunSettings> for GenerationRequest {
    fn from(settings: &RunSettings) -> Self {
        Self {
            prompt: settings.prompt.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
        }
    }
}

/// Bundle of collaborators handed to the scheduler
#[derive(Clone)]
pub struct Backends {
    pub loader: Arc<dyn ModelLoader>,
    pub extractor: Arc<dyn FrameExtractor>,
    pub monitor: Arc<dyn DeviceMonitor>,
}

impl Backends {
    pub fn new(
        loader: Arc<dyn ModelLoader>,
        extractor: Arc<dyn FrameExtractor>,
        monitor: Arc<dyn DeviceMonitor>,
    ) -> Self {
        Self {
            loader,
            extractor,
            monitor,
        }
    }

    /// Sum of allocated accelerator memory across every device, in GiB
    #[must_use]
    pub fn memory_used_gb(&self) -> f64 {
        let total: u64 = self
            .monitor
            .devices()
            .iter()
            .map(|d| d.memory_used_bytes)
            .sum();
        bytes_to_gb(total)
    }
}

pub(crate) fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}
