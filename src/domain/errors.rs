//! Domain errors for the stackbot control loop.

use thiserror::Error;

use super::models::Primitive;

/// Domain-level errors raised by ports and control-loop components.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Robot error during {operation}: {message}")]
    Robot { operation: String, message: String },

    #[error("No valid {0} location in value map")]
    NoValidAction(Primitive),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

impl DomainError {
    /// Build a robot error for the named port operation.
    pub fn robot(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Robot {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for DomainError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Errors that terminate a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Hard stop requested by operator after {iterations} iterations")]
    HardStop { iterations: u64 },

    #[error("Action task failed: {0}")]
    ActionTask(String),
}
