//! Error types for queue client operations.

use crate::connection::Verb;
use crate::task::{TaskId, TaskStatus};
use thiserror::Error;

/// Comprehensive error type for all queue client operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Cannot {operation} task {task_id}: task is already {status}")]
    InvalidTransition {
        task_id: TaskId,
        status: TaskStatus,
        operation: &'static str,
    },

    #[error("Server returned no rows for {verb}")]
    EmptyResult { verb: Verb },

    #[error("Malformed response for {verb}: expected at least {expected} fields, got {actual}")]
    MalformedResponse {
        verb: Verb,
        expected: usize,
        actual: usize,
    },

    #[error("Malformed {field} field in {verb} response")]
    InvalidField { verb: Verb, field: &'static str },

    #[error("Connection does not provide required capability: {capability}")]
    Capability { capability: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Statistics parsing failed: {0}")]
    StatsParse(#[from] StatsParseError),

    #[error("Transport failure: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl QueueError {
    /// Wrap an error raised by the underlying connection.
    ///
    /// The original error is kept as the source so callers can downcast it.
    pub fn transport<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Transport(error.into())
    }

    /// Check if error is transient and the call may be retried by the caller
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Configuration(_) => false,
            Self::InvalidTransition { .. } => false,
            Self::EmptyResult { .. } => false,
            Self::MalformedResponse { .. } => false,
            Self::InvalidField { .. } => false,
            Self::Capability { .. } => false,
            Self::Serialization(_) => false,
            Self::StatsParse(_) => false,
            Self::Transport(_) => true,
        }
    }
}

/// Configuration errors, raised at construction time
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(error: config::ConfigError) -> Self {
        match error {
            config::ConfigError::NotFound(key) => Self::Missing { key },
            other => Self::Parsing {
                message: other.to_string(),
            },
        }
    }
}

/// Errors during payload serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Payload could not be encoded: {message}")]
    Encode { message: String },

    #[error("Payload could not be decoded: {message}")]
    Decode { message: String },
}

/// Errors while rebuilding the per-tube statistics view
#[derive(Debug, Error)]
pub enum StatsParseError {
    #[error("Statistics key '{key}' does not match space<N>.<tube>.<metric>")]
    UnrecognizedKey { key: String },

    #[error("Statistics key '{key}' has a non-numeric space '{space}'")]
    InvalidSpace { key: String, space: String },

    #[error("Statistics key '{key}' decomposes into {segments} segments")]
    UnexpectedSegments { key: String, segments: usize },

    #[error("Statistics row has an odd number of fields ({fields})")]
    UnpairedField { fields: usize },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
