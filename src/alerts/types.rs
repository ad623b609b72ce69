//! Alert definitions, live alerts and their history entries.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::ALERT_EPSILON;
use crate::health::HealthStatus;

/// Alert severity; the lowercase name is the pub/sub subject suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Muted,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "ACTIVE",
            AlertStatus::Acknowledged => "ACKNOWLEDGED",
            AlertStatus::Muted => "MUTED",
            AlertStatus::Resolved => "RESOLVED",
        }
    }

    /// Anything but resolved still occupies its definition's slot
    pub fn is_open(&self) -> bool {
        !matches!(self, AlertStatus::Resolved)
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    MetricThreshold,
    HealthStatus,
    ErrorRate,
    Latency,
    Throughput,
    Custom,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::MetricThreshold => "METRIC_THRESHOLD",
            TriggerType::HealthStatus => "HEALTH_STATUS",
            TriggerType::ErrorRate => "ERROR_RATE",
            TriggerType::Latency => "LATENCY",
            TriggerType::Throughput => "THROUGHPUT",
            TriggerType::Custom => "CUSTOM",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComparisonOperator {
    #[default]
    GreaterThan,
    LessThan,
    Equals,
    NotEquals,
}

impl ComparisonOperator {
    /// Compare `actual` against `threshold`; equality is within [`ALERT_EPSILON`]
    pub fn compare(&self, actual: f64, threshold: f64) -> bool {
        match self {
            ComparisonOperator::GreaterThan => actual > threshold,
            ComparisonOperator::LessThan => actual < threshold,
            ComparisonOperator::Equals => (actual - threshold).abs() < ALERT_EPSILON,
            ComparisonOperator::NotEquals => (actual - threshold).abs() >= ALERT_EPSILON,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            ComparisonOperator::GreaterThan => ">",
            ComparisonOperator::LessThan => "<",
            ComparisonOperator::Equals => "==",
            ComparisonOperator::NotEquals => "!=",
        }
    }
}

/// Trigger condition. Which optional fields apply depends on the trigger type:
/// `metric` for `METRIC_THRESHOLD`, `component_id`/`status` for
/// `HEALTH_STATUS` and `evaluator` for `CUSTOM`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertCondition {
    pub operator: ComparisonOperator,
    pub threshold: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    /// Component to watch; `None` watches the system status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<HealthStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluator: Option<String>,
}

impl AlertCondition {
    pub fn threshold(operator: ComparisonOperator, threshold: f64) -> Self {
        Self {
            operator,
            threshold,
            ..Default::default()
        }
    }

    pub fn metric(metric: impl Into<String>, operator: ComparisonOperator, threshold: f64) -> Self {
        Self {
            metric: Some(metric.into()),
            ..Self::threshold(operator, threshold)
        }
    }

    /// Fires while the watched status equals `status`
    pub fn health(component_id: Option<String>, status: HealthStatus) -> Self {
        Self {
            operator: ComparisonOperator::Equals,
            component_id,
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn custom(evaluator: impl Into<String>) -> Self {
        Self {
            evaluator: Some(evaluator.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelType {
    Console,
    Event,
    PubSub,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationChannel {
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Base subject override for `PUB_SUB`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

fn default_true() -> bool {
    true
}

impl NotificationChannel {
    pub fn console() -> Self {
        Self::of(ChannelType::Console)
    }

    pub fn event() -> Self {
        Self::of(ChannelType::Event)
    }

    pub fn pub_sub(subject: Option<String>) -> Self {
        Self {
            subject,
            ..Self::of(ChannelType::PubSub)
        }
    }

    fn of(channel_type: ChannelType) -> Self {
        Self {
            channel_type,
            enabled: true,
            subject: None,
        }
    }
}

/// Static alert configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub severity: AlertSeverity,
    pub trigger_type: TriggerType,
    pub condition: AlertCondition,
    #[serde(default)]
    pub notification_channels: Vec<NotificationChannel>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_resolve: bool,
    /// Milliseconds an ACTIVE alert must go untriggered before auto-resolving
    #[serde(default = "default_auto_resolve_after")]
    pub auto_resolve_after: u64,
}

fn default_auto_resolve_after() -> u64 {
    300_000
}

impl AlertDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        severity: AlertSeverity,
        trigger_type: TriggerType,
        condition: AlertCondition,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            severity,
            trigger_type,
            condition,
            notification_channels: vec![NotificationChannel::console(), NotificationChannel::event()],
            enabled: true,
            auto_resolve: false,
            auto_resolve_after: default_auto_resolve_after(),
        }
    }

    pub fn with_channels(mut self, channels: Vec<NotificationChannel>) -> Self {
        self.notification_channels = channels;
        self
    }

    pub fn with_auto_resolve(mut self, after: Duration) -> Self {
        self.auto_resolve = true;
        self.auto_resolve_after = after.as_millis() as u64;
        self
    }

    pub fn auto_resolve_after(&self) -> Duration {
        Duration::from_millis(self.auto_resolve_after)
    }
}

/// Live alert instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub definition_id: String,
    pub name: String,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertHistoryEntry {
    pub alert_id: String,
    pub status: AlertStatus,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}
