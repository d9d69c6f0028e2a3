//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur while driving the container engine.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container command ran but reported failure.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The container command did not finish before its deadline.
    #[error("container {command} timed out after {seconds}s")]
    TimedOut { command: String, seconds: u64 },

    /// Failed to parse container output.
    #[error("failed to parse container output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
