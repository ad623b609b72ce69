//! # Configuration
//!
//! Node configuration, one section per component. Every field carries a default
//! so a node starts with no configuration file at all; durations are stored as
//! `*_ms` integers and exposed through `Duration` accessors.
//!
//! Loading (files + environment overrides) lives in [`loader`].

pub mod error;
pub mod loader;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::orchestration::load_balancer::LoadBalancingStrategy;
use crate::resilience::{CircuitBreakerConfig, CircuitBreakerOverrides};

/// Root configuration for an A2A node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct A2aConfig {
    pub service: ServiceConfig,
    pub transport: TransportConfig,
    pub circuit_breakers: CircuitBreakerSettings,
    pub task_manager: TaskManagerConfig,
    pub load_balancer: LoadBalancerConfig,
    pub health: HealthConfig,
    pub alerts: AlertsConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

impl A2aConfig {
    /// Validate every section, reporting the first problem found
    pub fn validate(&self) -> ConfigResult<()> {
        self.service.validate()?;
        self.transport.validate()?;
        self.circuit_breakers
            .defaults()
            .validate()
            .map_err(|e| ConfigurationError::validation_error(format!("circuit_breakers: {e}")))?;
        for (component, overrides) in &self.circuit_breakers.components {
            self.circuit_breakers
                .defaults()
                .merged(overrides)
                .validate()
                .map_err(|e| {
                    ConfigurationError::validation_error(format!(
                        "circuit_breakers.components.{component}: {e}"
                    ))
                })?;
        }
        self.task_manager.validate()?;
        self.load_balancer.validate()?;
        self.health.validate()?;
        self.alerts.validate()?;
        self.persistence.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

fn require_positive(field: &str, value: u64) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigurationError::invalid_value(
            field,
            value,
            "must be greater than zero",
        ));
    }
    Ok(())
}

/// Identity of this node on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub service_id: String,
    pub capabilities: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_id: "a2a-node".to_string(),
            capabilities: Vec::new(),
        }
    }
}

impl ServiceConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.service_id.trim().is_empty() {
            return Err(ConfigurationError::invalid_value(
                "service.service_id",
                &self.service_id,
                "must not be empty",
            ));
        }
        Ok(())
    }
}

/// Transport connection and reconnect policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// `in_memory` or `nats`
    pub provider: String,
    pub url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            provider: "in_memory".to_string(),
            url: "nats://127.0.0.1:4222".to_string(),
            max_reconnect_attempts: 10,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            request_timeout_ms: 5_000,
        }
    }
}

impl TransportConfig {
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        match self.provider.as_str() {
            "in_memory" | "nats" => {}
            other => {
                return Err(ConfigurationError::invalid_value(
                    "transport.provider",
                    other,
                    "expected one of: in_memory, nats",
                ))
            }
        }
        require_positive("transport.reconnect_base_delay_ms", self.reconnect_base_delay_ms)?;
        require_positive("transport.request_timeout_ms", self.request_timeout_ms)?;
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "transport.reconnect_max_delay_ms",
                self.reconnect_max_delay_ms,
                "must be at least reconnect_base_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Process-wide breaker defaults plus per-component overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_success_threshold: u32,
    pub call_timeout_ms: u64,
    pub monitor_interval_ms: u64,
    pub components: HashMap<String, CircuitBreakerOverrides>,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            reset_timeout_ms: defaults.reset_timeout.as_millis() as u64,
            half_open_success_threshold: defaults.half_open_success_threshold,
            call_timeout_ms: defaults.call_timeout.as_millis() as u64,
            monitor_interval_ms: defaults.monitor_interval.as_millis() as u64,
            components: HashMap::new(),
        }
    }
}

impl CircuitBreakerSettings {
    /// Default breaker configuration described by this section
    pub fn defaults(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
            half_open_success_threshold: self.half_open_success_threshold,
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            monitor_interval: Duration::from_millis(self.monitor_interval_ms),
        }
    }
}

/// Task execution limits and retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskManagerConfig {
    pub max_concurrent_tasks: usize,
    /// Tasks queued locally once the concurrency cap is reached
    pub backlog_capacity: usize,
    pub task_timeout_ms: u64,
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            backlog_capacity: 100,
            task_timeout_ms: 30_000,
            max_retries: 3,
            initial_retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

impl TaskManagerConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        require_positive(
            "task_manager.max_concurrent_tasks",
            self.max_concurrent_tasks as u64,
        )?;
        require_positive("task_manager.task_timeout_ms", self.task_timeout_ms)?;
        if !(self.backoff_factor >= 1.0 && self.backoff_factor.is_finite()) {
            return Err(ConfigurationError::invalid_value(
                "task_manager.backoff_factor",
                self.backoff_factor,
                "must be a finite number >= 1.0",
            ));
        }
        if self.max_retry_delay_ms < self.initial_retry_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "task_manager.max_retry_delay_ms",
                self.max_retry_delay_ms,
                "must be at least initial_retry_delay_ms",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub default_strategy: LoadBalancingStrategy,
    /// Period of this node's own `system.load` report
    pub report_interval_ms: u64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            default_strategy: LoadBalancingStrategy::default(),
            report_interval_ms: 10_000,
        }
    }
}

impl LoadBalancerConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        require_positive("load_balancer.report_interval_ms", self.report_interval_ms)
    }
}

/// Health monitor reporting cadence and per-component check defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub report_interval_ms: u64,
    pub check_interval_ms: u64,
    pub check_timeout_ms: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    /// Publish each periodic snapshot on `system.health`
    pub publish_reports: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: 60_000,
            check_interval_ms: 30_000,
            check_timeout_ms: 5_000,
            retry_count: 3,
            retry_delay_ms: 5_000,
            publish_reports: true,
        }
    }
}

impl HealthConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        require_positive("health.report_interval_ms", self.report_interval_ms)?;
        require_positive("health.check_interval_ms", self.check_interval_ms)?;
        require_positive("health.check_timeout_ms", self.check_timeout_ms)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub check_interval_ms: u64,
    pub max_alert_history: usize,
    /// Resolved alerts older than this are dropped with their history
    pub resolved_retention_ms: u64,
    /// Upper bound on resolved alerts kept, oldest dropped first
    pub max_resolved_alerts: usize,
    /// Base subject for the pub/sub notification channel
    pub subject: String,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 60_000,
            max_alert_history: 100,
            resolved_retention_ms: 3_600_000,
            max_resolved_alerts: 500,
            subject: "alerts".to_string(),
        }
    }
}

impl AlertsConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn resolved_retention(&self) -> Duration {
        Duration::from_millis(self.resolved_retention_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        require_positive("alerts.check_interval_ms", self.check_interval_ms)?;
        require_positive("alerts.max_alert_history", self.max_alert_history as u64)?;
        require_positive("alerts.resolved_retention_ms", self.resolved_retention_ms)?;
        require_positive("alerts.max_resolved_alerts", self.max_resolved_alerts as u64)?;
        if self.subject.is_empty() {
            return Err(ConfigurationError::invalid_value(
                "alerts.subject",
                "",
                "must not be empty",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Retry sweep cadence
    pub retry_interval_ms: u64,
    /// A record left `processing` this long counts as a failed delivery
    pub ack_timeout_ms: u64,
    pub namespace: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 1_000,
            ack_timeout_ms: 30_000,
            namespace: crate::constants::PERSISTENCE_NAMESPACE.to_string(),
        }
    }
}

impl PersistenceConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        require_positive("persistence.retry_interval_ms", self.retry_interval_ms)?;
        require_positive("persistence.ack_timeout_ms", self.ack_timeout_ms)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingConfig {
    fn validate(&self) -> ConfigResult<()> {
        match self.format.as_str() {
            "pretty" | "json" => Ok(()),
            other => Err(ConfigurationError::invalid_value(
                "logging.format",
                other,
                "expected one of: pretty, json",
            )),
        }
    }
}
