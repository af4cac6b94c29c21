//! Error types surfaced by the engine to its callers

use serde::{Serialize, Serializer};
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Navigation into a missing folder or lookup of an unknown item/task.
    #[error("Not found: {0}")]
    NotFound(String),
    /// The storage adapter failed, or there is no active storage connection.
    #[error("Backend failure: {0}")]
    BackendFailure(String),
    /// Malformed request, e.g. an empty key list for a bulk operation.
    #[error("Invalid request: {0}")]
    ValidationFailure(String),
    #[error("Task runner is shut down")]
    RunnerClosed,
    /// The local database failed.
    #[error("Local storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        EngineError::NotFound(what.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        EngineError::BackendFailure(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        EngineError::ValidationFailure(message.into())
    }
}

// Database helpers return boxed errors; anything that reaches the public API
// through `?` on them is a local storage problem.
impl From<Box<dyn std::error::Error + Send + Sync>> for EngineError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        EngineError::Storage(err.to_string())
    }
}

// The IPC layer expects plain error strings.
impl Serialize for EngineError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}
