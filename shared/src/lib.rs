//! Shared data structures and utilities for the container task orchestration system
//!
//! This crate contains the wire types exchanged between the master and its
//! workers, the task and worker data model, configuration structures, and
//! utilities used by both binaries.

pub mod api;
pub mod config;
pub mod defaults;
pub mod params;
pub mod task;
pub mod utils;
pub mod worker;

// Re-export commonly used types for convenience
pub use config::{MasterConfig, WorkerConfig};
pub use params::ParameterBundle;
pub use task::{ResourceRequest, Task, TaskStatus, TaskType};
pub use utils::{current_timestamp, validate_worker_id};
pub use worker::{WorkerInfo, WorkerUsage};

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the orchestration system
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Scheduling error: {0}")]
    Scheduling(String),

    #[error("Task execution error: {0}")]
    TaskExecution(String),

    #[error("Validation error: {0}")]
    Validation(String),
}
