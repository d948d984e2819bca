//! Common types and utilities for video captioning

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod settings;

pub use settings::{DeviceKind, Dtype, RunSettings, SettingsUpdate};

/// File extension of persisted captions
pub const OUTPUT_EXTENSION: &str = "txt";

/// Upper bound on concurrently used accelerator devices
pub const MAX_BATCH_SIZE: usize = 8;

/// Processing errors
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Frame extraction failed: {0}")]
    FrameExtraction(String),

    #[error("Caption generation failed: {0}")]
    Generation(String),

    #[error("Model load failed on {device}: {reason}")]
    ModelLoad { device: String, reason: String },

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    ImageError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<image::ImageError> for ProcessingError {
    fn from(err: image::ImageError) -> Self {
        ProcessingError::ImageError(err.to_string())
    }
}

impl From<serde_json::Error> for ProcessingError {
    fn from(err: serde_json::Error) -> Self {
        ProcessingError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProcessingError {
    fn from(err: serde_yaml::Error) -> Self {
        ProcessingError::Serialization(err.to_string())
    }
}

/// Result type for processing operations
pub type Result<T> = std::result::Result<T, ProcessingError>;

/// One media file queued for captioning
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaItem {
    path: PathBuf,
    name: String,
}

impl MediaItem {
    /// Create an item from a path; the name is the final path component
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self { path, name }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File name without extension
    #[must_use]
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }

    /// Caption file written next to the source: same directory, same stem
    #[must_use]
    pub fn caption_path(&self) -> PathBuf {
        let parent = self.path.parent().unwrap_or_else(|| Path::new(""));
        parent.join(format!("{}.{}", self.stem(), OUTPUT_EXTENSION))
    }
}

/// Accelerator device identifier, e.g. `cuda:0` or `cpu`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn cuda(index: usize) -> Self {
        Self(format!("cuda:{index}"))
    }

    #[must_use]
    pub fn cpu() -> Self {
        Self("cpu".to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ordinal of a CUDA device, `None` for CPU
    #[must_use]
    pub fn index(&self) -> Option<usize> {
        self.0.strip_prefix("cuda:").and_then(|i| i.parse().ok())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata describing the video a frame batch was sampled from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoMeta {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub frame_count: Option<u64>,
    pub duration: Option<f64>,
}

/// Frames sampled from one media item
#[derive(Debug, Clone, Default)]
pub struct FrameBatch {
    pub frames: Vec<RgbImage>,
    pub meta: VideoMeta,
}

impl FrameBatch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Caption text plus generation statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub caption: String,
    pub output_tokens: u64,
    pub tokens_per_sec: f64,
    pub num_frames: usize,
}
