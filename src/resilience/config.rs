//! # Circuit Breaker Configuration
//!
//! Per-breaker settings, presets, and the partial overrides a caller may
//! layer on top of process-wide defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,

    /// Time since the last failure before an open circuit probes recovery
    pub reset_timeout: Duration,

    /// Consecutive successes in half-open state needed to close circuit
    pub half_open_success_threshold: u32,

    /// Per-call deadline; exceeding it counts as a failure
    pub call_timeout: Duration,

    /// Cadence of the open -> half-open check
    pub monitor_interval: Duration,
}

impl CircuitBreakerConfig {
    /// Preset for calls to external model providers
    pub fn for_external_api() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(45),
            half_open_success_threshold: 2,
            call_timeout: Duration::from_secs(60),
            monitor_interval: Duration::from_secs(5),
        }
    }

    /// Preset for key/value store operations
    pub fn for_storage() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(15),
            half_open_success_threshold: 2,
            call_timeout: Duration::from_secs(5),
            monitor_interval: Duration::from_secs(1),
        }
    }

    /// Apply overrides, keeping every unset field
    pub fn merged(&self, overrides: &CircuitBreakerOverrides) -> Self {
        Self {
            failure_threshold: overrides.failure_threshold.unwrap_or(self.failure_threshold),
            reset_timeout: overrides
                .reset_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.reset_timeout),
            half_open_success_threshold: overrides
                .half_open_success_threshold
                .unwrap_or(self.half_open_success_threshold),
            call_timeout: overrides
                .call_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.call_timeout),
            monitor_interval: overrides
                .monitor_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(self.monitor_interval),
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.failure_threshold > 100 {
            return Err("failure_threshold should not exceed 100".to_string());
        }

        if self.reset_timeout.is_zero() {
            return Err("reset_timeout must be greater than 0".to_string());
        }

        if self.half_open_success_threshold == 0 {
            return Err("half_open_success_threshold must be greater than 0".to_string());
        }

        if self.call_timeout.is_zero() {
            return Err("call_timeout must be greater than 0".to_string());
        }

        if self.monitor_interval.is_zero() {
            return Err("monitor_interval must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_success_threshold: 2,
            call_timeout: Duration::from_secs(10),
            monitor_interval: Duration::from_secs(1),
        }
    }
}

/// Partial configuration merged over registry defaults for one breaker id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerOverrides {
    pub failure_threshold: Option<u32>,
    pub reset_timeout_ms: Option<u64>,
    pub half_open_success_threshold: Option<u32>,
    pub call_timeout_ms: Option<u64>,
    pub monitor_interval_ms: Option<u64>,
}

impl CircuitBreakerOverrides {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn failure_threshold(mut self, value: u32) -> Self {
        self.failure_threshold = Some(value);
        self
    }

    pub fn reset_timeout(mut self, value: Duration) -> Self {
        self.reset_timeout_ms = Some(value.as_millis() as u64);
        self
    }

    pub fn half_open_success_threshold(mut self, value: u32) -> Self {
        self.half_open_success_threshold = Some(value);
        self
    }

    pub fn call_timeout(mut self, value: Duration) -> Self {
        self.call_timeout_ms = Some(value.as_millis() as u64);
        self
    }

    pub fn monitor_interval(mut self, value: Duration) -> Self {
        self.monitor_interval_ms = Some(value.as_millis() as u64);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_unset_fields() {
        let defaults = CircuitBreakerConfig::default();
        let overrides = CircuitBreakerOverrides::default()
            .failure_threshold(2)
            .call_timeout(Duration::from_millis(250));

        let merged = defaults.merged(&overrides);
        assert_eq!(merged.failure_threshold, 2);
        assert_eq!(merged.call_timeout, Duration::from_millis(250));
        assert_eq!(merged.reset_timeout, defaults.reset_timeout);
        assert_eq!(
            merged.half_open_success_threshold,
            defaults.half_open_success_threshold
        );
    }

    #[test]
    fn test_validate() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        assert!(CircuitBreakerConfig::for_storage().validate().is_ok());

        let invalid = CircuitBreakerConfig {
            half_open_success_threshold: 0,
            ..Default::default()
        };
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_overrides_from_toml_table() {
        let overrides: CircuitBreakerOverrides =
            serde_json::from_value(serde_json::json!({"failure_threshold": 9})).unwrap();
        assert_eq!(overrides.failure_threshold, Some(9));
        assert!(overrides.reset_timeout_ms.is_none());
        assert!(CircuitBreakerOverrides::default().is_empty());
    }
}
