//! Video Caption Scheduler - job scheduling and progress engine
//!
//! Runs a batch of media items through a fixed per-item pipeline
//! (extract frames, encode, generate, persist) on one or more model copies,
//! one worker per device, while publishing progress snapshots to observers.
//!
//! Model inference, frame decoding and device discovery are supplied by the
//! host through the traits in [`backend`].

pub mod backend;
pub mod context;
pub mod emitter;
pub mod error;
pub mod model_pool;
pub mod pipeline;
pub mod resources;
pub mod scheduler;
pub mod state;

pub use backend::{
    Backends, CaptionModel, DeviceInfo, DeviceMonitor, FrameExtractor, FrameLimits,
    GenerationRequest, ModelHandle, ModelLoader, NoDevices,
};
pub use context::RunContext;
pub use emitter::{ProgressEmitter, DEFAULT_OBSERVER_CAPACITY};
pub use error::SchedulerError;
pub use model_pool::{ModelPool, NO_DEVICE_AVAILABLE};
pub use pipeline::{
    metadata_footer, persist_caption, ItemResult, PipelineExecutor, PipelineJob, PipelineOutcome,
};
pub use resources::{GpuMetrics, ResourceMonitor, ResourceSnapshot, SystemInfo};
pub use scheduler::{ModelStatus, Scheduler, StartAck};
pub use state::{
    PipelineStage, ProgressSnapshot, RunState, Stage, Substage, TokenCounter, WorkerProgress,
    WorkerState,
};
