//! # Standard Health Checks
//!
//! Factories for the checks every node registers: transport connectivity,
//! circuit breaker state and registry-reported service status. Custom checks
//! are built from closures with [`health_check_fn`].

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::error::A2aResult;
use crate::health::types::{ComponentHealth, HealthStatus};
use crate::messaging::{ConnectionState, MessageTransport};
use crate::resilience::{CircuitBreaker, CircuitState};
use crate::services::{ServiceRegistry, ServiceStatus};

/// A component health probe. An `Err` counts as a failed check.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> A2aResult<ComponentHealth>;
}

struct FnHealthCheck<F>(F);

#[async_trait]
impl<F, Fut> HealthCheck for FnHealthCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = A2aResult<ComponentHealth>> + Send,
{
    async fn check(&self) -> A2aResult<ComponentHealth> {
        (self.0)().await
    }
}

pub fn health_check_fn<F, Fut>(f: F) -> Arc<dyn HealthCheck>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = A2aResult<ComponentHealth>> + Send + 'static,
{
    Arc::new(FnHealthCheck(f))
}

/// Connected is healthy, (re)connecting degraded, anything else unhealthy
pub fn transport_check(transport: Arc<MessageTransport>) -> Arc<dyn HealthCheck> {
    health_check_fn(move || {
        let transport = Arc::clone(&transport);
        async move {
            let state = transport.connection_state();
            let health = match state {
                ConnectionState::Connected if transport.is_connected() => {
                    ComponentHealth::healthy("Transport connected")
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    ComponentHealth::degraded("Transport reconnecting")
                }
                ConnectionState::Failed => {
                    ComponentHealth::unhealthy("Transport reconnect attempts exhausted")
                }
                _ => ComponentHealth::unhealthy("Transport disconnected"),
            };
            Ok(health.with_details(json!({
                "state": state,
                "subscriptions": transport.subscription_count(),
            })))
        }
    })
}

/// Map a breaker state onto health: closed, half-open, open
pub fn circuit_breaker_status(state: CircuitState) -> HealthStatus {
    match state {
        CircuitState::Closed => HealthStatus::Healthy,
        CircuitState::HalfOpen => HealthStatus::Degraded,
        CircuitState::Open => HealthStatus::Unhealthy,
    }
}

pub fn circuit_breaker_check(breaker: Arc<CircuitBreaker>) -> Arc<dyn HealthCheck> {
    health_check_fn(move || {
        let breaker = Arc::clone(&breaker);
        async move {
            let metrics = breaker.metrics();
            let status = circuit_breaker_status(metrics.state);
            Ok(ComponentHealth::new(
                status,
                format!("Circuit breaker '{}' is {}", breaker.name(), metrics.state),
            )
            .with_details(json!({
                "state": metrics.state,
                "consecutiveFailures": metrics.consecutive_failures,
                "failureRate": metrics.failure_rate(),
                "totalCalls": metrics.calls,
            })))
        }
    })
}

/// Registry status of `service_id`; an unregistered service is unknown
pub fn service_status_check(
    registry: Arc<dyn ServiceRegistry>,
    service_id: impl Into<String>,
) -> Arc<dyn HealthCheck> {
    let service_id = service_id.into();
    health_check_fn(move || {
        let registry = Arc::clone(&registry);
        let service_id = service_id.clone();
        async move {
            let health = match registry.get_service_status(&service_id).await {
                Some(ServiceStatus::Online) => ComponentHealth::healthy("Service online"),
                Some(ServiceStatus::Degraded) => ComponentHealth::degraded("Service degraded"),
                Some(ServiceStatus::Offline) => ComponentHealth::unhealthy("Service offline"),
                Some(ServiceStatus::Unknown) => {
                    ComponentHealth::new(HealthStatus::Unknown, "Service status unknown")
                }
                None => ComponentHealth::new(HealthStatus::Unknown, "Service not registered"),
            };
            Ok(health)
        }
    })
}
