//! Health status types shared by the monitor, its checks and `system.health`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Component or system health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Unhealthy => "UNHEALTHY",
            HealthStatus::Unknown => "UNKNOWN",
        }
    }

    /// Numeric value recorded as a metric (higher is worse, unknown is -1)
    pub fn metric_value(&self) -> f64 {
        match self {
            HealthStatus::Healthy => 0.0,
            HealthStatus::Degraded => 1.0,
            HealthStatus::Unhealthy => 2.0,
            HealthStatus::Unknown => -1.0,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate component statuses: any UNHEALTHY wins, then any DEGRADED;
/// UNKNOWN only when every component (or none at all) is UNKNOWN.
pub fn aggregate_status<I>(statuses: I) -> HealthStatus
where
    I: IntoIterator<Item = HealthStatus>,
{
    let mut any_degraded = false;
    let mut all_unknown = true;

    for status in statuses {
        match status {
            HealthStatus::Unhealthy => return HealthStatus::Unhealthy,
            HealthStatus::Degraded => {
                any_degraded = true;
                all_unknown = false;
            }
            HealthStatus::Healthy => all_unknown = false,
            HealthStatus::Unknown => {}
        }
    }

    if any_degraded {
        HealthStatus::Degraded
    } else if all_unknown {
        HealthStatus::Unknown
    } else {
        HealthStatus::Healthy
    }
}

/// What a health check reports when it completes
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub message: String,
    pub details: Option<Value>,
}

impl ComponentHealth {
    pub fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
        }
    }

    pub fn healthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Healthy, message)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Degraded, message)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unhealthy, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Latest check result for one component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub component_id: String,
    pub component_type: String,
    pub status: HealthStatus,
    pub last_checked: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl HealthCheckResult {
    pub fn unknown(component_id: &str, component_type: &str) -> Self {
        Self {
            component_id: component_id.to_string(),
            component_type: component_type.to_string(),
            status: HealthStatus::Unknown,
            last_checked: Utc::now(),
            message: "Not yet checked".to_string(),
            details: None,
        }
    }
}

/// Snapshot of every component plus the aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealthStatus {
    pub service_id: String,
    pub status: HealthStatus,
    pub components: BTreeMap<String, HealthCheckResult>,
    pub timestamp: DateTime<Utc>,
}

impl SystemHealthStatus {
    pub fn count_by_status(&self, status: HealthStatus) -> usize {
        self.components
            .values()
            .filter(|c| c.status == status)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use HealthStatus::*;

    #[test]
    fn test_aggregation_examples() {
        assert_eq!(aggregate_status([Healthy, Degraded]), Degraded);
        assert_eq!(aggregate_status([Unknown, Unknown]), Unknown);
        assert_eq!(aggregate_status([Unknown, Healthy]), Healthy);
        assert_eq!(aggregate_status([Degraded, Unhealthy, Healthy]), Unhealthy);
        assert_eq!(aggregate_status([Unknown, Degraded]), Degraded);
        assert_eq!(aggregate_status([]), Unknown);
    }

    #[test]
    fn test_wire_format() {
        let result = HealthCheckResult::unknown("transport", "messaging");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["componentId"], "transport");
        assert_eq!(value["status"], "UNKNOWN");
        assert!(value.get("details").is_none());
    }
}
