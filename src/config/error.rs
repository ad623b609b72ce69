//! Errors raised while loading and validating node configuration.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// An explicitly requested file does not exist
    #[error("No configuration file at {}", format_paths(.searched_paths))]
    ConfigFileNotFound { searched_paths: Vec<PathBuf> },

    /// A source could not be read, parsed or deserialized
    #[error("Could not load configuration: {error}")]
    LoadError { error: String },

    /// A field holds a value outside its allowed range
    #[error("{field} = {value} is not allowed: {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },

    /// Sections are individually valid but inconsistent with each other
    #[error("Invalid configuration: {error}")]
    ValidationError { error: String },

    /// An `A2A__*` variable referenced a key that does not exist
    #[error("Environment override {key} rejected: {reason}")]
    EnvironmentOverrideError { key: String, reason: String },
}

impl ConfigurationError {
    pub fn config_file_not_found(searched_paths: Vec<PathBuf>) -> Self {
        Self::ConfigFileNotFound { searched_paths }
    }

    pub fn load_error<E: std::fmt::Display>(error: E) -> Self {
        Self::LoadError {
            error: error.to_string(),
        }
    }

    /// `field` is the dotted path, e.g. `task_manager.max_concurrent_tasks`
    pub fn invalid_value(field: impl Into<String>, value: impl ToString, context: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            context: context.into(),
        }
    }

    pub fn validation_error(error: impl Into<String>) -> Self {
        Self::ValidationError {
            error: error.into(),
        }
    }
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(error: config::ConfigError) -> Self {
        match error {
            config::ConfigError::NotFound(key) => Self::EnvironmentOverrideError {
                reason: "no such setting".to_string(),
                key,
            },
            other => Self::load_error(other),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;
