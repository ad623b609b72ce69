//! Threshold and health alerting with lifecycle tracking and notification.

pub mod evaluator;
pub mod manager;
pub mod types;

pub use evaluator::{custom_evaluator_fn, evaluate_metric_definition, health_condition_met, CustomEvaluator, Evaluation};
pub use manager::{AlertEvent, AlertManager};
pub use types::{
    Alert, AlertCondition, AlertDefinition, AlertHistoryEntry, AlertSeverity, AlertStatus,
    ChannelType, ComparisonOperator, NotificationChannel, TriggerType,
};
