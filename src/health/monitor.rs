//! # Health Monitor
//!
//! Runs each registered component's check on its own ticker and aggregates the
//! results into a system status.
//!
//! A check races its timeout. Success resets the component's failure counter and
//! replaces its stored result. Failure (error, panic or timeout) increments the
//! counter; reaching `retry_count` forces the component `UNHEALTHY` and resets
//! the counter, otherwise one retry is scheduled after `retry_delay`.
//!
//! The system status is recomputed after every component update and changes are
//! emitted as [`HealthEvent::SystemStatusChanged`] and recorded as the
//! `health.system_status` metric. A separate report ticker emits the full
//! snapshot and, when enabled, publishes it on `system.health`.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HealthConfig;
use crate::error::{A2aError, A2aResult};
use crate::events::EventBus;
use crate::health::checks::HealthCheck;
use crate::health::types::{
    aggregate_status, ComponentHealth, HealthCheckResult, HealthStatus, SystemHealthStatus,
};
use crate::messaging::{subjects, Message, MessagePayload, MessageTransport};
use crate::services::MetricsCollector;
use crate::utils::Ticker;

/// Metric recorded on every system status change
pub const SYSTEM_STATUS_METRIC: &str = "health.system_status";

/// Health monitor events
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    StatusChanged {
        component_id: String,
        previous: HealthStatus,
        current: HealthStatus,
        result: HealthCheckResult,
    },
    SystemStatusChanged {
        previous: HealthStatus,
        current: HealthStatus,
    },
    CheckFailed {
        component_id: String,
        error: String,
        consecutive_failures: u32,
    },
    Report(SystemHealthStatus),
}

/// Component registration. Unset timings fall back to the monitor's config.
#[derive(Clone)]
pub struct ComponentRegistration {
    pub component_id: String,
    pub component_type: String,
    pub check: Arc<dyn HealthCheck>,
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub retry_count: Option<u32>,
    pub retry_delay: Option<Duration>,
}

impl std::fmt::Debug for ComponentRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistration")
            .field("component_id", &self.component_id)
            .field("component_type", &self.component_type)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("retry_count", &self.retry_count)
            .field("retry_delay", &self.retry_delay)
            .finish()
    }
}

impl ComponentRegistration {
    pub fn new(
        component_id: impl Into<String>,
        component_type: impl Into<String>,
        check: Arc<dyn HealthCheck>,
    ) -> Self {
        Self {
            component_id: component_id.into(),
            component_type: component_type.into(),
            check,
            interval: None,
            timeout: None,
            retry_count: None,
            retry_delay: None,
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }
}

struct ComponentEntry {
    component_type: String,
    check: Arc<dyn HealthCheck>,
    timeout: Duration,
    retry_count: u32,
    retry_delay: Duration,
    consecutive_failures: u32,
    retry_pending: bool,
    result: HealthCheckResult,
    ticker: Option<Ticker>,
}

/// Aggregating health monitor for one node
pub struct HealthMonitor {
    service_id: String,
    config: HealthConfig,
    transport: Option<Arc<MessageTransport>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
    components: DashMap<String, ComponentEntry>,
    system_status: RwLock<HealthStatus>,
    report_ticker: Mutex<Option<Ticker>>,
    shutdown: CancellationToken,
    events: EventBus<HealthEvent>,
    self_ref: Weak<Self>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("service_id", &self.service_id)
            .field("components", &self.components.len())
            .field("system_status", &*self.system_status.read())
            .finish()
    }
}

impl HealthMonitor {
    pub fn new(
        service_id: impl Into<String>,
        config: HealthConfig,
        transport: Option<Arc<MessageTransport>>,
        metrics: Option<Arc<dyn MetricsCollector>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            service_id: service_id.into(),
            config,
            transport,
            metrics,
            components: DashMap::new(),
            system_status: RwLock::new(HealthStatus::Unknown),
            report_ticker: Mutex::new(None),
            shutdown: CancellationToken::new(),
            events: EventBus::new("health_monitor"),
            self_ref: self_ref.clone(),
        })
    }

    pub fn events(&self) -> &EventBus<HealthEvent> {
        &self.events
    }

    pub fn system_status(&self) -> HealthStatus {
        *self.system_status.read()
    }

    pub fn component_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.components.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn component_result(&self, component_id: &str) -> Option<HealthCheckResult> {
        self.components
            .get(component_id)
            .map(|entry| entry.result.clone())
    }

    /// Register a component and start its check ticker. Re-registering an id
    /// replaces the previous registration.
    pub fn register_component(&self, registration: ComponentRegistration) {
        let component_id = registration.component_id.clone();
        let interval = registration
            .interval
            .unwrap_or_else(|| self.config.check_interval());

        let ticker = self.self_ref.upgrade().and_then(|monitor| {
            tokio::runtime::Handle::try_current().ok()?;
            let id = component_id.clone();
            Some(Ticker::spawn_with_token(
                format!("health:{component_id}"),
                interval,
                self.shutdown.child_token(),
                move || {
                    let monitor = Arc::clone(&monitor);
                    let id = id.clone();
                    async move {
                        if let Err(e) = monitor.check_component_health(&id).await {
                            debug!(component = %id, error = %e, "Scheduled health check skipped");
                        }
                    }
                },
            ))
        });

        let entry = ComponentEntry {
            result: HealthCheckResult::unknown(&component_id, &registration.component_type),
            component_type: registration.component_type,
            check: registration.check,
            timeout: registration
                .timeout
                .unwrap_or_else(|| self.config.check_timeout()),
            retry_count: registration.retry_count.unwrap_or(self.config.retry_count),
            retry_delay: registration
                .retry_delay
                .unwrap_or_else(|| self.config.retry_delay()),
            consecutive_failures: 0,
            retry_pending: false,
            ticker,
        };

        if let Some(previous) = self.components.insert(component_id.clone(), entry) {
            if let Some(ticker) = previous.ticker {
                ticker.stop();
            }
        }
        info!(
            component = %component_id,
            interval_ms = interval.as_millis() as u64,
            "Health component registered"
        );
    }

    /// Stop checking a component and drop its result
    pub async fn unregister_component(&self, component_id: &str) -> bool {
        let Some((_, entry)) = self.components.remove(component_id) else {
            return false;
        };
        if let Some(ticker) = entry.ticker {
            ticker.stop();
        }
        self.recompute_system_status().await;
        true
    }

    /// Run one check for `component_id`, returning its stored result afterwards
    pub async fn check_component_health(&self, component_id: &str) -> A2aResult<HealthCheckResult> {
        let (check, timeout) = {
            let entry = self
                .components
                .get(component_id)
                .ok_or_else(|| A2aError::ComponentNotFound(component_id.to_string()))?;
            (Arc::clone(&entry.check), entry.timeout)
        };

        let outcome = tokio::time::timeout(timeout, AssertUnwindSafe(check.check()).catch_unwind()).await;
        let outcome: Result<ComponentHealth, String> = match outcome {
            Ok(Ok(Ok(health))) => Ok(health),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(_)) => Err("health check panicked".to_string()),
            Err(_) => Err(format!("health check timed out after {}ms", timeout.as_millis())),
        };

        match outcome {
            Ok(health) => self.record_success(component_id, health).await,
            Err(error) => self.record_failure(component_id, error).await,
        }
    }

    /// Check every registered component once
    pub async fn check_all_components(&self) {
        for component_id in self.component_ids() {
            if let Err(e) = self.check_component_health(&component_id).await {
                debug!(component = %component_id, error = %e, "Health check skipped");
            }
        }
    }

    async fn record_success(
        &self,
        component_id: &str,
        health: ComponentHealth,
    ) -> A2aResult<HealthCheckResult> {
        let (previous, result) = {
            let mut entry = self
                .components
                .get_mut(component_id)
                .ok_or_else(|| A2aError::ComponentNotFound(component_id.to_string()))?;
            entry.consecutive_failures = 0;
            let previous = entry.result.status;
            entry.result = HealthCheckResult {
                component_id: component_id.to_string(),
                component_type: entry.component_type.clone(),
                status: health.status,
                last_checked: Utc::now(),
                message: health.message,
                details: health.details,
            };
            (previous, entry.result.clone())
        };

        debug!(component = %component_id, status = %result.status, "Health check completed");
        self.after_update(component_id, previous, &result).await;
        Ok(result)
    }

    async fn record_failure(&self, component_id: &str, error: String) -> A2aResult<HealthCheckResult> {
        let (failures, forced, retry_delay) = {
            let mut entry = self
                .components
                .get_mut(component_id)
                .ok_or_else(|| A2aError::ComponentNotFound(component_id.to_string()))?;
            entry.consecutive_failures += 1;
            let failures = entry.consecutive_failures;

            if failures >= entry.retry_count {
                entry.consecutive_failures = 0;
                let previous = entry.result.status;
                entry.result = HealthCheckResult {
                    component_id: component_id.to_string(),
                    component_type: entry.component_type.clone(),
                    status: HealthStatus::Unhealthy,
                    last_checked: Utc::now(),
                    message: format!("Health check failed: {error}"),
                    details: None,
                };
                (failures, Some((previous, entry.result.clone())), None)
            } else if entry.retry_pending {
                (failures, None, None)
            } else {
                entry.retry_pending = true;
                (failures, None, Some(entry.retry_delay))
            }
        };

        warn!(
            component = %component_id,
            error = %error,
            consecutive_failures = failures,
            "Health check failed"
        );
        self.events.emit(HealthEvent::CheckFailed {
            component_id: component_id.to_string(),
            error,
            consecutive_failures: failures,
        });

        if let Some(delay) = retry_delay {
            self.schedule_retry(component_id.to_string(), delay);
        }

        match forced {
            Some((previous, result)) => {
                error!(component = %component_id, "Component marked unhealthy after repeated check failures");
                self.after_update(component_id, previous, &result).await;
                Ok(result)
            }
            None => self
                .component_result(component_id)
                .ok_or_else(|| A2aError::ComponentNotFound(component_id.to_string())),
        }
    }

    fn schedule_retry(&self, component_id: String, delay: Duration) {
        let Some(monitor) = self.self_ref.upgrade() else {
            return;
        };
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(mut entry) = monitor.components.get_mut(&component_id) {
                        entry.retry_pending = false;
                    } else {
                        return;
                    }
                    debug!(component = %component_id, "Retrying failed health check");
                    if let Err(e) = monitor.check_component_health(&component_id).await {
                        debug!(component = %component_id, error = %e, "Health check retry skipped");
                    }
                }
            }
        });
    }

    async fn after_update(&self, component_id: &str, previous: HealthStatus, result: &HealthCheckResult) {
        if previous != result.status {
            info!(
                component = %component_id,
                from = %previous,
                to = %result.status,
                "Component health changed"
            );
            self.events.emit(HealthEvent::StatusChanged {
                component_id: component_id.to_string(),
                previous,
                current: result.status,
                result: result.clone(),
            });
        }
        self.recompute_system_status().await;
    }

    /// Recompute the aggregate, emitting and recording a change
    pub async fn recompute_system_status(&self) -> HealthStatus {
        let current = aggregate_status(self.components.iter().map(|e| e.result.status));
        let previous = {
            let mut status = self.system_status.write();
            std::mem::replace(&mut *status, current)
        };

        if previous != current {
            info!(from = %previous, to = %current, "System health changed");
            self.events.emit(HealthEvent::SystemStatusChanged { previous, current });

            if let Some(metrics) = &self.metrics {
                let tags = HashMap::from([
                    ("service".to_string(), self.service_id.clone()),
                    ("from".to_string(), previous.to_string()),
                    ("to".to_string(), current.to_string()),
                ]);
                metrics
                    .record_custom_metric(SYSTEM_STATUS_METRIC, current.metric_value(), tags)
                    .await;
            }
        }
        current
    }

    /// Current snapshot of every component
    pub fn get_system_health(&self) -> SystemHealthStatus {
        let components: BTreeMap<String, HealthCheckResult> = self
            .components
            .iter()
            .map(|e| (e.key().clone(), e.result.clone()))
            .collect();
        SystemHealthStatus {
            service_id: self.service_id.clone(),
            status: self.system_status(),
            components,
            timestamp: Utc::now(),
        }
    }

    /// Emit the snapshot and publish it on `system.health` when enabled
    pub async fn report_health_status(&self) -> SystemHealthStatus {
        let snapshot = self.get_system_health();
        self.events.emit(HealthEvent::Report(snapshot.clone()));

        if self.config.publish_reports {
            if let Some(transport) = &self.transport {
                let published = match Message::new(MessagePayload::HealthStatus(snapshot.clone())) {
                    Ok(message) => transport.publish(subjects::SYSTEM_HEALTH, message).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = published {
                    warn!(error = %e, "Failed to publish health report");
                }
            }
        }

        debug!(status = %snapshot.status, components = snapshot.components.len(), "Health report emitted");
        snapshot
    }

    /// Start the periodic report ticker
    pub fn start(&self) {
        let mut report_ticker = self.report_ticker.lock();
        if report_ticker.is_some() {
            return;
        }
        let Some(monitor) = self.self_ref.upgrade() else {
            return;
        };
        *report_ticker = Some(Ticker::spawn_with_token(
            "health:report",
            self.config.report_interval(),
            self.shutdown.child_token(),
            move || {
                let monitor = Arc::clone(&monitor);
                async move {
                    monitor.report_health_status().await;
                }
            },
        ));
        info!(
            report_interval_ms = self.config.report_interval_ms,
            "Health monitor started"
        );
    }

    /// Stop every ticker and pending retry and wait for the loops to exit
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let report_ticker = self.report_ticker.lock().take();
        if let Some(ticker) = report_ticker {
            ticker.shutdown().await;
        }

        let tickers: Vec<Ticker> = self
            .components
            .iter_mut()
            .filter_map(|mut e| e.ticker.take())
            .collect();
        for ticker in tickers {
            ticker.shutdown().await;
        }
        info!("Health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::checks::health_check_fn;
    use crate::services::InMemoryMetricsCollector;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fixed(status: HealthStatus) -> Arc<dyn HealthCheck> {
        health_check_fn(move || async move { Ok(ComponentHealth::new(status, "fixed")) })
    }

    fn monitor() -> Arc<HealthMonitor> {
        HealthMonitor::new("node", HealthConfig::default(), None, None)
    }

    #[tokio::test]
    async fn test_system_status_follows_components() {
        let monitor = monitor();
        let mut events = monitor.events().subscribe();

        monitor.register_component(ComponentRegistration::new("a", "test", fixed(HealthStatus::Healthy)));
        monitor.register_component(ComponentRegistration::new("b", "test", fixed(HealthStatus::Degraded)));
        assert_eq!(monitor.recompute_system_status().await, HealthStatus::Unknown);

        monitor.check_component_health("a").await.unwrap();
        assert_eq!(monitor.system_status(), HealthStatus::Healthy);
        monitor.check_component_health("b").await.unwrap();
        assert_eq!(monitor.system_status(), HealthStatus::Degraded);

        let mut system_changes = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let HealthEvent::SystemStatusChanged { current, .. } = event {
                system_changes.push(current);
            }
        }
        assert_eq!(system_changes, vec![HealthStatus::Healthy, HealthStatus::Degraded]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_force_unhealthy() {
        let monitor = monitor();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let failing = health_check_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err(A2aError::Internal("probe failed".into())) }
        });
        monitor.register_component(
            ComponentRegistration::new("db", "storage", failing)
                .interval(Duration::from_secs(3600))
                .retry_count(2)
                .retry_delay(Duration::from_millis(100)),
        );

        let result = monitor.check_component_health("db").await.unwrap();
        assert_eq!(result.status, HealthStatus::Unknown);

        // the scheduled retry is the second failure
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let result = monitor.component_result("db").unwrap();
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(monitor.system_status(), HealthStatus::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_timeout_counts_as_failure() {
        let monitor = monitor();
        let slow = health_check_fn(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(ComponentHealth::healthy("late"))
        });
        monitor.register_component(
            ComponentRegistration::new("slow", "test", slow)
                .timeout(Duration::from_millis(50))
                .retry_count(1),
        );

        let result = monitor.check_component_health("slow").await.unwrap();
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.message.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_drives_checks() {
        let monitor = monitor();
        monitor.register_component(
            ComponentRegistration::new("a", "test", fixed(HealthStatus::Healthy))
                .interval(Duration::from_secs(1)),
        );
        assert_eq!(monitor.component_result("a").unwrap().status, HealthStatus::Unknown);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(monitor.component_result("a").unwrap().status, HealthStatus::Healthy);
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_change_records_metric() {
        let metrics = Arc::new(InMemoryMetricsCollector::new());
        let monitor = HealthMonitor::new(
            "node",
            HealthConfig::default(),
            None,
            Some(metrics.clone() as Arc<dyn MetricsCollector>),
        );
        monitor.register_component(ComponentRegistration::new("a", "test", fixed(HealthStatus::Unhealthy)));
        monitor.check_component_health("a").await.unwrap();

        let samples = metrics.custom_samples(SYSTEM_STATUS_METRIC);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, HealthStatus::Unhealthy.metric_value());

        let report = monitor.report_health_status().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.count_by_status(HealthStatus::Unhealthy), 1);
    }
}
