//! Condition evaluation for each trigger type.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::alerts::types::{AlertCondition, AlertDefinition, ComparisonOperator, TriggerType};
use crate::error::{A2aError, A2aResult};
use crate::health::HealthStatus;
use crate::services::{metric_names, MetricsCollector};

/// Outcome of evaluating one definition
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub triggered: bool,
    pub value: Option<f64>,
    pub message: String,
}

impl Evaluation {
    pub fn triggered(value: Option<f64>, message: impl Into<String>) -> Self {
        Self {
            triggered: true,
            value,
            message: message.into(),
        }
    }

    pub fn clear(value: Option<f64>) -> Self {
        Self {
            triggered: false,
            value,
            message: String::new(),
        }
    }
}

/// Evaluator for `CUSTOM` definitions, registered by name
#[async_trait]
pub trait CustomEvaluator: Send + Sync {
    async fn evaluate(&self, definition: &AlertDefinition) -> A2aResult<Evaluation>;
}

struct FnEvaluator<F>(F);

#[async_trait]
impl<F, Fut> CustomEvaluator for FnEvaluator<F>
where
    F: Fn(AlertDefinition) -> Fut + Send + Sync,
    Fut: Future<Output = A2aResult<Evaluation>> + Send,
{
    async fn evaluate(&self, definition: &AlertDefinition) -> A2aResult<Evaluation> {
        (self.0)(definition.clone()).await
    }
}

pub fn custom_evaluator_fn<F, Fut>(f: F) -> Arc<dyn CustomEvaluator>
where
    F: Fn(AlertDefinition) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = A2aResult<Evaluation>> + Send + 'static,
{
    Arc::new(FnEvaluator(f))
}

fn compare(definition: &AlertDefinition, label: &str, value: f64) -> Evaluation {
    let condition = &definition.condition;
    if condition.operator.compare(value, condition.threshold) {
        Evaluation::triggered(
            Some(value),
            format!(
                "{}: {label} {value:.4} {} {}",
                definition.name,
                condition.operator.symbol(),
                condition.threshold
            ),
        )
    } else {
        Evaluation::clear(Some(value))
    }
}

/// Evaluate a metric-driven definition against live metrics.
///
/// `HEALTH_STATUS` definitions are event driven and `CUSTOM` ones need a
/// registered evaluator; both are rejected here.
pub async fn evaluate_metric_definition(
    definition: &AlertDefinition,
    metrics: &dyn MetricsCollector,
) -> A2aResult<Evaluation> {
    match definition.trigger_type {
        TriggerType::MetricThreshold => {
            let name = definition.condition.metric.as_deref().ok_or_else(|| {
                A2aError::ValidationError(format!(
                    "Alert definition '{}' has no metric name",
                    definition.id
                ))
            })?;
            let snapshot = metrics.get_metrics_snapshot().await;
            // a metric nobody has reported yet cannot breach
            Ok(match snapshot.metric(name) {
                Some(value) => compare(definition, name, value),
                None => Evaluation::clear(None),
            })
        }
        TriggerType::ErrorRate => {
            let snapshot = metrics.get_metrics_snapshot().await;
            Ok(compare(definition, metric_names::ERROR_RATE, snapshot.error_rate))
        }
        TriggerType::Latency => {
            let latency = metrics.get_average_latency().await;
            Ok(compare(definition, metric_names::AVERAGE_LATENCY, latency))
        }
        TriggerType::Throughput => {
            let throughput = metrics.get_throughput().await;
            Ok(compare(definition, metric_names::THROUGHPUT, throughput))
        }
        TriggerType::HealthStatus | TriggerType::Custom => Err(A2aError::ValidationError(format!(
            "Alert definition '{}' ({}) is not metric driven",
            definition.id, definition.trigger_type
        ))),
    }
}

/// Whether a health condition fires for the observed status.
///
/// With a target status the operator selects equality or inequality; without
/// one the status's metric value is compared against the threshold.
pub fn health_condition_met(condition: &AlertCondition, observed: HealthStatus) -> bool {
    match condition.status {
        Some(target) => match condition.operator {
            ComparisonOperator::NotEquals => observed != target,
            _ => observed == target,
        },
        None => condition
            .operator
            .compare(observed.metric_value(), condition.threshold),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::types::AlertSeverity;
    use crate::services::InMemoryMetricsCollector;
    use std::time::Duration;

    fn definition(trigger_type: TriggerType, condition: AlertCondition) -> AlertDefinition {
        AlertDefinition::new("def", "Def", AlertSeverity::Warning, trigger_type, condition)
    }

    #[tokio::test]
    async fn test_error_rate_threshold() {
        let metrics = InMemoryMetricsCollector::new();
        metrics.record_message(Duration::from_millis(10));
        metrics.record_error();

        let def = definition(
            TriggerType::ErrorRate,
            AlertCondition::threshold(ComparisonOperator::GreaterThan, 0.25),
        );
        let evaluation = evaluate_metric_definition(&def, &metrics).await.unwrap();
        assert!(evaluation.triggered);
        assert!(evaluation.message.contains("errorRate"));
    }

    #[tokio::test]
    async fn test_missing_metric_never_fires() {
        let metrics = InMemoryMetricsCollector::new();
        let def = definition(
            TriggerType::MetricThreshold,
            AlertCondition::metric("queue.depth", ComparisonOperator::LessThan, 100.0),
        );
        let evaluation = evaluate_metric_definition(&def, &metrics).await.unwrap();
        assert!(!evaluation.triggered);
        assert_eq!(evaluation.value, None);

        metrics.set_gauge("queue.depth", 3.0);
        assert!(evaluate_metric_definition(&def, &metrics).await.unwrap().triggered);
    }

    #[tokio::test]
    async fn test_health_definitions_are_not_metric_driven() {
        let metrics = InMemoryMetricsCollector::new();
        let def = definition(
            TriggerType::HealthStatus,
            AlertCondition::health(None, HealthStatus::Unhealthy),
        );
        assert!(evaluate_metric_definition(&def, &metrics).await.is_err());
    }

    #[test]
    fn test_health_condition() {
        let condition = AlertCondition::health(None, HealthStatus::Unhealthy);
        assert!(health_condition_met(&condition, HealthStatus::Unhealthy));
        assert!(!health_condition_met(&condition, HealthStatus::Degraded));

        // metric value: DEGRADED = 1, UNHEALTHY = 2
        let condition = AlertCondition::threshold(ComparisonOperator::GreaterThan, 0.5);
        assert!(health_condition_met(&condition, HealthStatus::Degraded));
        assert!(!health_condition_met(&condition, HealthStatus::Healthy));
    }
}
