//! Error types for the scheduler

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    /// A run (or model load) already holds the run lock
    #[error("already processing")]
    AlreadyRunning,

    #[error("no items")]
    NoItems,

    #[error("Model load failed: {0}")]
    ModelLoad(String),

    /// Stop requested before any model copy finished loading
    #[error("stopped")]
    Stopped,

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}
