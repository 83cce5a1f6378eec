//! Error types for the browser task engine.

use std::time::Duration;

use uuid::Uuid;

use crate::tasks::model::TaskStatus;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Invalid task request: {0}")]
    InvalidRequest(String),

    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} already exists")]
    Duplicate { id: Uuid },

    #[error("Task {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {id} already finished with status {status}")]
    AlreadyTerminal { id: Uuid, status: TaskStatus },

    #[error("Execution queue is closed")]
    QueueClosed,
}

/// Automation session errors.
///
/// `Launch` and `Disconnected` mean the session itself is unusable and must
/// be discarded; every other variant is a failure of a single step.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to launch automation session: {0}")]
    Launch(String),

    #[error("{action} timed out after {timeout:?}")]
    Timeout { action: String, timeout: Duration },

    #[error("Element not found: {selector}")]
    ElementNotFound { selector: String },

    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("{action} failed: {reason}")]
    ActionFailed { action: String, reason: String },

    #[error("Automation session disconnected: {0}")]
    Disconnected(String),
}

impl SessionError {
    /// Whether the session that produced this error can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Launch(_) | Self::Disconnected(_))
    }
}

/// Artifact storage errors.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Artifact {id} not found")]
    NotFound { id: Uuid },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors turning a request into an ordered list of steps.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("No actions could be derived from the instruction; supply a url or explicit steps")]
    NoActions,

    #[error("Too many steps: {count} > {max}")]
    TooManySteps { count: usize, max: usize },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
