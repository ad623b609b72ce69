//! Layered configuration loading from TOML files

use std::fs;
use std::time::Duration;

use a2a_core::config::{ConfigManager, ConfigurationError};
use a2a_core::orchestration::LoadBalancingStrategy;
use tempfile::TempDir;

const BASE: &str = r#"
[service]
service_id = "orders-node"
capabilities = ["orders", "billing"]

[task_manager]
max_concurrent_tasks = 4
task_timeout_ms = 10000

[load_balancer]
default_strategy = "LEAST_BUSY"

[health]
publish_reports = false

[circuit_breakers]
failure_threshold = 5

[circuit_breakers.components.payments]
failure_threshold = 2
reset_timeout_ms = 5000

[logging]
level = "debug"
format = "json"
"#;

const TEST_OVERLAY: &str = r#"
[task_manager]
max_concurrent_tasks = 1

[health]
publish_reports = true
"#;

fn config_dir(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().expect("temp dir");
    for (name, contents) in files {
        fs::write(dir.path().join(name), contents).expect("write config file");
    }
    dir
}

#[test]
fn test_base_file_and_environment_overlay_merge() {
    let dir = config_dir(&[("a2a.toml", BASE), ("a2a.test.toml", TEST_OVERLAY)]);

    let manager = ConfigManager::load_from_dir(dir.path(), "test").unwrap();
    let config = manager.config();

    assert_eq!(manager.environment(), "test");
    assert_eq!(config.service.service_id, "orders-node");
    assert_eq!(config.service.capabilities, vec!["orders", "billing"]);
    // overlay wins (publish_reports flips back on), untouched base keys survive
    assert_eq!(config.task_manager.max_concurrent_tasks, 1);
    assert_eq!(config.task_manager.task_timeout(), Duration::from_secs(10));
    assert!(config.health.publish_reports);
    assert_eq!(config.load_balancer.default_strategy, LoadBalancingStrategy::LeastBusy);
    assert_eq!(config.logging.format, "json");

    let payments = config
        .circuit_breakers
        .defaults()
        .merged(&config.circuit_breakers.components["payments"]);
    assert_eq!(payments.failure_threshold, 2);
    assert_eq!(payments.reset_timeout, Duration::from_secs(5));
}

#[test]
fn test_missing_overlay_uses_base_only() {
    let dir = config_dir(&[("a2a.toml", BASE)]);

    let manager = ConfigManager::load_from_dir(dir.path(), "production").unwrap();
    assert_eq!(manager.config().task_manager.max_concurrent_tasks, 4);
    assert!(!manager.config().health.publish_reports);
}

#[test]
fn test_empty_directory_yields_defaults() {
    let dir = config_dir(&[]);

    let manager = ConfigManager::load_from_dir(dir.path(), "development").unwrap();
    assert_eq!(manager.config().service.service_id, "a2a-node");
    assert_eq!(manager.config().transport.provider, "in_memory");
}

#[test]
fn test_invalid_values_are_rejected() {
    let dir = config_dir(&[(
        "a2a.toml",
        "[task_manager]\nmax_concurrent_tasks = 0\n",
    )]);

    let error = ConfigManager::load_from_dir(dir.path(), "development").unwrap_err();
    assert!(matches!(error, ConfigurationError::InvalidValue { .. }));
    assert!(error.to_string().contains("task_manager.max_concurrent_tasks"));
}

#[test]
fn test_explicit_file_must_exist() {
    let dir = config_dir(&[]);

    let error = ConfigManager::load_from_file(&dir.path().join("missing.toml")).unwrap_err();
    assert!(matches!(error, ConfigurationError::ConfigFileNotFound { .. }));
}

#[test]
fn test_explicit_file_is_loaded() {
    let dir = config_dir(&[("node.toml", BASE)]);

    let manager = ConfigManager::load_from_file(&dir.path().join("node.toml")).unwrap();
    assert_eq!(manager.config().service.service_id, "orders-node");
}
