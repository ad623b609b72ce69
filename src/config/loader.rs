//! Configuration Loader
//!
//! Layered loading on top of the `config` crate:
//! 1. `{dir}/a2a.toml` (optional base file)
//! 2. `{dir}/a2a.{environment}.toml` (optional environment overlay)
//! 3. `A2A__SECTION__FIELD` environment variables
//!
//! The merged result is deserialized into [`A2aConfig`] and validated.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::{Config, Environment, File};
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::A2aConfig;

/// Base name of configuration files
pub const CONFIG_FILE_STEM: &str = "a2a";
/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "A2A";
/// Directory searched when `A2A_CONFIG_DIR` is not set
pub const DEFAULT_CONFIG_DIR: &str = "config";

/// Loaded, validated configuration plus the environment it was loaded for
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: A2aConfig,
    environment: String,
}

impl ConfigManager {
    /// Detect environment from `A2A_ENV`, then `APP_ENV`, defaulting to "development"
    pub fn detect_environment() -> String {
        std::env::var("A2A_ENV")
            .or_else(|_| std::env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    /// Load from `A2A_CONFIG_DIR` (or `./config`) for the detected environment
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        let dir = std::env::var("A2A_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR));
        let environment = Self::detect_environment();
        Self::load_from_dir(&dir, &environment).map(Arc::new)
    }

    /// Load every layer rooted at `dir` for `environment`
    pub fn load_from_dir(dir: &Path, environment: &str) -> ConfigResult<ConfigManager> {
        let base = dir.join(format!("{CONFIG_FILE_STEM}.toml"));
        let overlay = dir.join(format!("{CONFIG_FILE_STEM}.{environment}.toml"));

        info!(
            config_dir = %dir.display(),
            environment = %environment,
            base_present = base.exists(),
            overlay_present = overlay.exists(),
            "Loading configuration"
        );

        let settings = Config::builder()
            .add_source(File::from(base).required(false))
            .add_source(File::from(overlay).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: A2aConfig = settings.try_deserialize()?;
        config.validate()?;

        debug!(service_id = %config.service.service_id, "Configuration validated");

        Ok(Self {
            config,
            environment: environment.to_string(),
        })
    }

    /// Load a single explicit file, which must exist, plus environment overrides
    pub fn load_from_file(path: &Path) -> ConfigResult<ConfigManager> {
        if !path.exists() {
            return Err(ConfigurationError::config_file_not_found(vec![
                path.to_path_buf()
            ]));
        }

        let settings = Config::builder()
            .add_source(File::from(path.to_path_buf()).required(true))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: A2aConfig = settings.try_deserialize()?;
        config.validate()?;

        Ok(Self {
            config,
            environment: Self::detect_environment(),
        })
    }

    /// Wrap an already-built configuration (tests, embedding)
    pub fn from_config(config: A2aConfig, environment: impl Into<String>) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            environment: environment.into(),
        })
    }

    pub fn config(&self) -> &A2aConfig {
        &self.config
    }

    pub fn into_config(self) -> A2aConfig {
        self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_directory_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::load_from_dir(&dir.path().join("absent"), "test").unwrap();

        assert_eq!(manager.environment(), "test");
        assert_eq!(manager.config().task_manager.max_retries, 3);
    }

    #[test]
    fn test_environment_overlay_wins_over_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a2a.toml"),
            "[task_manager]\nmax_retries = 7\nmax_concurrent_tasks = 4\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("a2a.staging.toml"),
            "[task_manager]\nmax_retries = 1\n",
        )
        .unwrap();

        let manager = ConfigManager::load_from_dir(dir.path(), "staging").unwrap();
        assert_eq!(manager.config().task_manager.max_retries, 1);
        assert_eq!(manager.config().task_manager.max_concurrent_tasks, 4);

        let manager = ConfigManager::load_from_dir(dir.path(), "production").unwrap();
        assert_eq!(manager.config().task_manager.max_retries, 7);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a2a.toml");
        std::fs::write(&path, "[health]\ncheck_interval_ms = 0\n").unwrap();

        assert!(matches!(
            ConfigManager::load_from_file(&path),
            Err(ConfigurationError::InvalidValue { .. })
        ));
        assert!(matches!(
            ConfigManager::load_from_file(&dir.path().join("nope.toml")),
            Err(ConfigurationError::ConfigFileNotFound { .. })
        ));
    }
}
