//! Component health checks and the aggregating health monitor.

pub mod checks;
pub mod monitor;
pub mod types;

pub use checks::{
    circuit_breaker_check, circuit_breaker_status, health_check_fn, service_status_check,
    transport_check, HealthCheck,
};
pub use monitor::{ComponentRegistration, HealthEvent, HealthMonitor, SYSTEM_STATUS_METRIC};
pub use types::{
    aggregate_status, ComponentHealth, HealthCheckResult, HealthStatus, SystemHealthStatus,
};
