//! Error types for the compartment runtime.

use thiserror::Error;

/// Outcome of a failed task.
///
/// `Interrupted` is the cancellation signal: it is never isolated by the
/// compartment loop and always ends the thread that observes it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task interrupted")]
    Interrupted,

    #[error("Task failed: {0}")]
    Failed(String),

    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Convenience constructor for a plain failure.
    pub fn failed(reason: impl Into<String>) -> Self {
        TaskError::Failed(reason.into())
    }

    /// Check if this error is the cancellation signal.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, TaskError::Interrupted)
    }
}

/// Errors raised by compartments and compartment groups.
#[derive(Error, Debug)]
pub enum CompartmentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Event of size {size} can never fit below the lock watermark {limit}")]
    EventTooLarge { size: usize, limit: usize },

    #[error("Compartment {0} is already started")]
    AlreadyStarted(String),

    #[error("Compartment {0} is stopped")]
    Stopped(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CompartmentError>;

pub type TaskResult<T> = std::result::Result<T, TaskError>;
