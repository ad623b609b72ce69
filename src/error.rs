//! Error types for the A2A reliability core.

use crate::config::ConfigurationError;
use crate::messaging::MessagingError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum A2aError {
    #[error("Messaging error: {0}")]
    MessagingError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Timeout error: {0}")]
    Timeout(String),
    #[error("Circuit breaker open: {0}")]
    CircuitBreakerOpen(String),
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },
    #[error("Invalid task transition for {task_id}: {from} -> {to}")]
    InvalidTaskTransition {
        task_id: String,
        from: String,
        to: String,
    },
    #[error("Alert not found: {0}")]
    AlertNotFound(String),
    #[error("Alert definition not found: {0}")]
    AlertDefinitionNotFound(String),
    #[error("Component not registered: {0}")]
    ComponentNotFound(String),
    #[error("Persistence error: {0}")]
    PersistenceError(String),
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<MessagingError> for A2aError {
    fn from(error: MessagingError) -> Self {
        match error {
            MessagingError::Timeout { .. } => A2aError::Timeout(error.to_string()),
            other => A2aError::MessagingError(other.to_string()),
        }
    }
}

impl From<ConfigurationError> for A2aError {
    fn from(error: ConfigurationError) -> Self {
        A2aError::ConfigurationError(error.to_string())
    }
}

impl From<serde_json::Error> for A2aError {
    fn from(error: serde_json::Error) -> Self {
        A2aError::ValidationError(format!("JSON serialization error: {error}"))
    }
}

pub type A2aResult<T> = std::result::Result<T, A2aError>;
