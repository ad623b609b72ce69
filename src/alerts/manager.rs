//! # Alert Manager
//!
//! Evaluates alert definitions and owns the alert lifecycle.
//!
//! Metric-driven definitions are evaluated on a `check_interval` ticker;
//! `HEALTH_STATUS` definitions react to [`HealthEvent`]s instead. A definition
//! has at most one open alert at a time. Re-triggering an open alert bumps its
//! `count` and appends history:
//!
//! - `ACTIVE` and `ACKNOWLEDGED` alerts absorb the trigger without notifying.
//! - A `MUTED` alert absorbs it until the mute expires, after which the
//!   trigger reactivates the alert and notifies again.
//!
//! Resolving frees the definition's slot so the next trigger opens a new alert.
//! Resolved alerts are kept for `resolved_retention_ms`, and at most
//! `max_resolved_alerts` of them, before they and their history are dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerts::evaluator::{
    evaluate_metric_definition, health_condition_met, CustomEvaluator, Evaluation,
};
use crate::alerts::types::{
    Alert, AlertDefinition, AlertHistoryEntry, AlertSeverity, AlertStatus, ChannelType,
    TriggerType,
};
use crate::config::AlertsConfig;
use crate::error::{A2aError, A2aResult};
use crate::events::EventBus;
use crate::health::{HealthEvent, HealthMonitor, HealthStatus};
use crate::messaging::{subjects, Message, MessagePayload, MessageTransport};
use crate::services::MetricsCollector;
use crate::utils::Ticker;

/// Alert lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum AlertEvent {
    /// A new alert opened, or a muted one reactivated
    Triggered(Alert),
    /// An open alert absorbed another trigger
    Repeated(Alert),
    Acknowledged(Alert),
    Muted(Alert),
    Resolved(Alert),
    DefinitionAdded(String),
    DefinitionRemoved(String),
    EvaluationFailed { definition_id: String, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TriggerOutcome {
    Opened,
    Reactivated,
    Repeated,
}

#[derive(Debug, Default)]
struct AlertState {
    alerts: HashMap<String, Alert>,
    /// definition id -> open alert id
    open: HashMap<String, String>,
    history: HashMap<String, VecDeque<AlertHistoryEntry>>,
    /// resolved alert ids, oldest resolution first
    resolved: VecDeque<String>,
}

impl AlertState {
    fn record(&mut self, alert: &Alert, message: impl Into<String>, capacity: usize) {
        let entries = self.history.entry(alert.id.clone()).or_default();
        entries.push_back(AlertHistoryEntry {
            alert_id: alert.id.clone(),
            status: alert.status,
            timestamp: alert.updated_at,
            message: message.into(),
        });
        while entries.len() > capacity.max(1) {
            entries.pop_front();
        }
    }

    fn next_alert_id(&self, definition_id: &str, now: DateTime<Utc>) -> String {
        let base = format!("{definition_id}-{}", now.timestamp_millis());
        if !self.alerts.contains_key(&base) {
            return base;
        }
        (1..)
            .map(|n| format!("{base}-{n}"))
            .find(|id| !self.alerts.contains_key(id))
            .unwrap_or(base)
    }

    fn trigger(
        &mut self,
        definition: &AlertDefinition,
        message: String,
        details: Option<Value>,
        now: DateTime<Utc>,
        capacity: usize,
    ) -> (Alert, TriggerOutcome) {
        let open_id = self.open.get(&definition.id).cloned();
        if let Some(alert) = open_id.and_then(|id| self.alerts.get_mut(&id)) {
            alert.count += 1;
            alert.updated_at = now;
            if details.is_some() {
                alert.details = details;
            }

            let mute_expired = alert.status == AlertStatus::Muted
                && alert.muted_until.map_or(true, |until| until <= now);
            let (outcome, note) = if mute_expired {
                alert.status = AlertStatus::Active;
                alert.muted_until = None;
                alert.message = message;
                (TriggerOutcome::Reactivated, "Alert reactivated after mute expired".to_string())
            } else {
                (
                    TriggerOutcome::Repeated,
                    format!("Alert triggered again (count: {})", alert.count),
                )
            };

            let alert = alert.clone();
            self.record(&alert, note, capacity);
            return (alert, outcome);
        }

        let alert = Alert {
            id: self.next_alert_id(&definition.id, now),
            definition_id: definition.id.clone(),
            name: definition.name.clone(),
            severity: definition.severity,
            status: AlertStatus::Active,
            message,
            created_at: now,
            updated_at: now,
            count: 1,
            details,
            acknowledged_by: None,
            muted_until: None,
            resolved_at: None,
        };
        self.alerts.insert(alert.id.clone(), alert.clone());
        self.open.insert(definition.id.clone(), alert.id.clone());
        self.record(&alert, "Alert triggered", capacity);
        (alert, TriggerOutcome::Opened)
    }

    /// Drop resolved alerts, history included, that were resolved before
    /// `now - retention` or fall outside the newest `max_resolved`
    fn prune_resolved(&mut self, now: DateTime<Utc>, retention: Duration, max_resolved: usize) -> usize {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| now.checked_sub_signed(r))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut pruned = 0;
        while let Some(oldest) = self.resolved.front() {
            let expired = self
                .alerts
                .get(oldest)
                .and_then(|alert| alert.resolved_at)
                .map_or(true, |resolved_at| resolved_at < cutoff);
            if !expired && self.resolved.len() <= max_resolved {
                break;
            }
            if let Some(id) = self.resolved.pop_front() {
                self.alerts.remove(&id);
                self.history.remove(&id);
                pruned += 1;
            }
        }
        pruned
    }

    /// Apply `change` to an open alert
    fn transition<F>(&mut self, alert_id: &str, capacity: usize, change: F) -> A2aResult<Alert>
    where
        F: FnOnce(&mut Alert) -> String,
    {
        let alert = self
            .alerts
            .get_mut(alert_id)
            .ok_or_else(|| A2aError::AlertNotFound(alert_id.to_string()))?;
        if !alert.status.is_open() {
            return Err(A2aError::ValidationError(format!(
                "Alert {alert_id} is already resolved"
            )));
        }
        let note = change(alert);
        let alert = alert.clone();
        if !alert.status.is_open() {
            self.open.remove(&alert.definition_id);
            self.resolved.push_back(alert.id.clone());
        }
        self.record(&alert, note, capacity);
        Ok(alert)
    }
}

/// Evaluates definitions and tracks alerts for one node
pub struct AlertManager {
    config: AlertsConfig,
    metrics: Arc<dyn MetricsCollector>,
    transport: Option<Arc<MessageTransport>>,
    definitions: DashMap<String, AlertDefinition>,
    custom_evaluators: DashMap<String, Arc<dyn CustomEvaluator>>,
    state: Mutex<AlertState>,
    events: EventBus<AlertEvent>,
    check_ticker: Mutex<Option<Ticker>>,
    health_listener: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    self_ref: Weak<Self>,
}

impl std::fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AlertManager")
            .field("definitions", &self.definitions.len())
            .field("alerts", &state.alerts.len())
            .field("open", &state.open.len())
            .finish()
    }
}

impl AlertManager {
    pub fn new(
        config: AlertsConfig,
        metrics: Arc<dyn MetricsCollector>,
        transport: Option<Arc<MessageTransport>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            metrics,
            transport,
            definitions: DashMap::new(),
            custom_evaluators: DashMap::new(),
            state: Mutex::new(AlertState::default()),
            events: EventBus::new("alert_manager"),
            check_ticker: Mutex::new(None),
            health_listener: Mutex::new(None),
            shutdown: CancellationToken::new(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn events(&self) -> &EventBus<AlertEvent> {
        &self.events
    }

    // ---- definitions ----

    /// Add or replace a definition
    pub fn add_alert_definition(&self, definition: AlertDefinition) -> A2aResult<()> {
        if definition.id.is_empty() {
            return Err(A2aError::ValidationError(
                "Alert definition id must not be empty".to_string(),
            ));
        }
        match definition.trigger_type {
            TriggerType::MetricThreshold if definition.condition.metric.is_none() => {
                return Err(A2aError::ValidationError(format!(
                    "METRIC_THRESHOLD definition '{}' needs a metric name",
                    definition.id
                )));
            }
            TriggerType::Custom if definition.condition.evaluator.is_none() => {
                return Err(A2aError::ValidationError(format!(
                    "CUSTOM definition '{}' needs an evaluator name",
                    definition.id
                )));
            }
            _ => {}
        }

        let id = definition.id.clone();
        debug!(definition_id = %id, trigger_type = %definition.trigger_type, "Alert definition added");
        self.definitions.insert(id.clone(), definition);
        self.events.emit(AlertEvent::DefinitionAdded(id));
        Ok(())
    }

    /// Remove a definition. Its open alert, if any, stays until resolved.
    pub fn remove_alert_definition(&self, definition_id: &str) -> bool {
        let removed = self.definitions.remove(definition_id).is_some();
        if removed {
            self.events
                .emit(AlertEvent::DefinitionRemoved(definition_id.to_string()));
        }
        removed
    }

    pub fn set_definition_enabled(&self, definition_id: &str, enabled: bool) -> A2aResult<()> {
        let mut definition = self
            .definitions
            .get_mut(definition_id)
            .ok_or_else(|| A2aError::AlertDefinitionNotFound(definition_id.to_string()))?;
        definition.enabled = enabled;
        Ok(())
    }

    pub fn get_alert_definition(&self, definition_id: &str) -> Option<AlertDefinition> {
        self.definitions.get(definition_id).map(|d| d.clone())
    }

    pub fn list_alert_definitions(&self) -> Vec<AlertDefinition> {
        let mut definitions: Vec<AlertDefinition> =
            self.definitions.iter().map(|d| d.clone()).collect();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        definitions
    }

    pub fn register_custom_evaluator(&self, name: impl Into<String>, evaluator: Arc<dyn CustomEvaluator>) {
        self.custom_evaluators.insert(name.into(), evaluator);
    }

    // ---- queries ----

    pub fn get_alert(&self, alert_id: &str) -> Option<Alert> {
        self.state.lock().alerts.get(alert_id).cloned()
    }

    /// The open alert for a definition, whatever its status
    pub fn open_alert_for(&self, definition_id: &str) -> Option<Alert> {
        let state = self.state.lock();
        state
            .open
            .get(definition_id)
            .and_then(|id| state.alerts.get(id))
            .cloned()
    }

    /// Alerts currently ACTIVE, oldest first
    pub fn get_active_alerts(&self) -> Vec<Alert> {
        self.alerts_where(|a| a.status == AlertStatus::Active)
    }

    pub fn get_alerts_by_status(&self, status: AlertStatus) -> Vec<Alert> {
        self.alerts_where(|a| a.status == status)
    }

    fn alerts_where(&self, predicate: impl Fn(&Alert) -> bool) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .state
            .lock()
            .alerts
            .values()
            .filter(|a| predicate(a))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        alerts
    }

    pub fn get_alert_history(&self, alert_id: &str) -> Vec<AlertHistoryEntry> {
        self.state
            .lock()
            .history
            .get(alert_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ---- lifecycle ----

    /// Raise (or re-raise) the alert for `definition_id`
    pub async fn trigger_alert(
        &self,
        definition_id: &str,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> A2aResult<Alert> {
        let definition = self
            .get_alert_definition(definition_id)
            .ok_or_else(|| A2aError::AlertDefinitionNotFound(definition_id.to_string()))?;

        let (alert, outcome) = self.state.lock().trigger(
            &definition,
            message.into(),
            details,
            Utc::now(),
            self.config.max_alert_history,
        );

        match outcome {
            TriggerOutcome::Opened | TriggerOutcome::Reactivated => {
                info!(
                    alert_id = %alert.id,
                    definition_id = %definition.id,
                    severity = %alert.severity,
                    reactivated = outcome == TriggerOutcome::Reactivated,
                    "Alert triggered"
                );
                self.events.emit(AlertEvent::Triggered(alert.clone()));
                self.notify(&definition, &alert).await;
            }
            TriggerOutcome::Repeated => {
                debug!(alert_id = %alert.id, count = alert.count, status = %alert.status, "Alert triggered again");
                self.events.emit(AlertEvent::Repeated(alert.clone()));
            }
        }
        Ok(alert)
    }

    pub fn resolve_alert(&self, alert_id: &str, message: Option<&str>) -> A2aResult<Alert> {
        let note = message.unwrap_or("Alert resolved").to_string();
        let now = Utc::now();
        let (alert, pruned) = {
            let mut state = self.state.lock();
            let alert = state.transition(alert_id, self.config.max_alert_history, |alert| {
                alert.status = AlertStatus::Resolved;
                alert.resolved_at = Some(now);
                alert.muted_until = None;
                alert.updated_at = now;
                note
            })?;
            let pruned = state.prune_resolved(
                now,
                self.config.resolved_retention(),
                self.config.max_resolved_alerts,
            );
            (alert, pruned)
        };
        if pruned > 0 {
            debug!(pruned = pruned, "Dropped old resolved alerts");
        }
        info!(alert_id = %alert.id, "Alert resolved");
        self.events.emit(AlertEvent::Resolved(alert.clone()));
        Ok(alert)
    }

    pub fn acknowledge_alert(&self, alert_id: &str, acknowledged_by: Option<&str>) -> A2aResult<Alert> {
        let by = acknowledged_by.map(str::to_string);
        let alert = self
            .state
            .lock()
            .transition(alert_id, self.config.max_alert_history, |alert| {
                alert.status = AlertStatus::Acknowledged;
                alert.muted_until = None;
                alert.updated_at = Utc::now();
                alert.acknowledged_by = by.clone();
                match by {
                    Some(who) => format!("Alert acknowledged by {who}"),
                    None => "Alert acknowledged".to_string(),
                }
            })?;
        info!(alert_id = %alert.id, "Alert acknowledged");
        self.events.emit(AlertEvent::Acknowledged(alert.clone()));
        Ok(alert)
    }

    /// Silence an alert for `duration`; a trigger after that reactivates it
    pub fn mute_alert(&self, alert_id: &str, duration: Duration) -> A2aResult<Alert> {
        let alert = self
            .state
            .lock()
            .transition(alert_id, self.config.max_alert_history, |alert| {
                let now = Utc::now();
                let until = chrono::Duration::from_std(duration)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                alert.status = AlertStatus::Muted;
                alert.muted_until = Some(until);
                alert.updated_at = now;
                format!("Alert muted until {}", until.to_rfc3339())
            })?;
        info!(alert_id = %alert.id, muted_for_ms = duration.as_millis() as u64, "Alert muted");
        self.events.emit(AlertEvent::Muted(alert.clone()));
        Ok(alert)
    }

    pub fn check_auto_resolve(&self) -> Vec<Alert> {
        self.check_auto_resolve_at(Utc::now())
    }

    /// Resolve ACTIVE alerts whose definition auto-resolves and whose last
    /// trigger is older than `auto_resolve_after` as of `now`
    pub fn check_auto_resolve_at(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let due: Vec<(String, Duration)> = {
            let state = self.state.lock();
            state
                .alerts
                .values()
                .filter(|alert| alert.status == AlertStatus::Active)
                .filter_map(|alert| {
                    let definition = self.definitions.get(&alert.definition_id)?;
                    if !definition.auto_resolve {
                        return None;
                    }
                    let quiet = (now - alert.updated_at).to_std().ok()?;
                    (quiet > definition.auto_resolve_after())
                        .then(|| (alert.id.clone(), definition.auto_resolve_after()))
                })
                .collect()
        };

        due.into_iter()
            .filter_map(|(alert_id, after)| {
                let note = format!("Auto-resolved after {}ms without a trigger", after.as_millis());
                self.resolve_alert(&alert_id, Some(&note)).ok()
            })
            .collect()
    }

    /// Drop resolved alerts past the retention window as of `now`
    pub fn prune_resolved_alerts_at(&self, now: DateTime<Utc>) -> usize {
        let pruned = self.state.lock().prune_resolved(
            now,
            self.config.resolved_retention(),
            self.config.max_resolved_alerts,
        );
        if pruned > 0 {
            debug!(pruned = pruned, "Dropped old resolved alerts");
        }
        pruned
    }

    // ---- evaluation ----

    async fn evaluate(&self, definition: &AlertDefinition) -> A2aResult<Evaluation> {
        if definition.trigger_type == TriggerType::Custom {
            let name = definition.condition.evaluator.as_deref().unwrap_or_default();
            let evaluator = self
                .custom_evaluators
                .get(name)
                .map(|e| Arc::clone(e.value()))
                .ok_or_else(|| {
                    A2aError::ValidationError(format!("No custom evaluator registered as '{name}'"))
                })?;
            return evaluator.evaluate(definition).await;
        }
        evaluate_metric_definition(definition, self.metrics.as_ref()).await
    }

    /// Evaluate every enabled metric-driven definition once, then sweep
    /// auto-resolution and expired resolved alerts. Returns the alerts
    /// triggered by this pass.
    pub async fn check_alerts(&self) -> Vec<Alert> {
        let definitions: Vec<AlertDefinition> = self
            .list_alert_definitions()
            .into_iter()
            .filter(|d| d.enabled && d.trigger_type != TriggerType::HealthStatus)
            .collect();

        let mut triggered = Vec::new();
        for definition in definitions {
            match self.evaluate(&definition).await {
                Ok(evaluation) if evaluation.triggered => {
                    let details = evaluation.value.map(|value| json!({ "value": value }));
                    match self
                        .trigger_alert(&definition.id, evaluation.message, details)
                        .await
                    {
                        Ok(alert) => triggered.push(alert),
                        // removed while this pass was running
                        Err(e) => debug!(definition_id = %definition.id, error = %e, "Alert not triggered"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(definition_id = %definition.id, error = %e, "Alert evaluation failed");
                    self.events.emit(AlertEvent::EvaluationFailed {
                        definition_id: definition.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        self.check_auto_resolve();
        self.prune_resolved_alerts_at(Utc::now());
        triggered
    }

    /// Evaluate `HEALTH_STATUS` definitions against a health monitor event
    pub async fn handle_health_event(&self, event: &HealthEvent) -> Vec<Alert> {
        let (component_id, observed) = match event {
            HealthEvent::StatusChanged {
                component_id,
                current,
                ..
            } => (Some(component_id.as_str()), *current),
            HealthEvent::SystemStatusChanged { current, .. } => (None, *current),
            _ => return Vec::new(),
        };

        let definitions: Vec<AlertDefinition> = self
            .list_alert_definitions()
            .into_iter()
            .filter(|d| {
                d.enabled
                    && d.trigger_type == TriggerType::HealthStatus
                    && d.condition.component_id.as_deref() == component_id
                    && health_condition_met(&d.condition, observed)
            })
            .collect();

        let mut triggered = Vec::new();
        for definition in definitions {
            let message = health_message(&definition, component_id, observed);
            let details = json!({
                "componentId": component_id,
                "status": observed,
            });
            match self.trigger_alert(&definition.id, message, Some(details)).await {
                Ok(alert) => triggered.push(alert),
                Err(e) => debug!(definition_id = %definition.id, error = %e, "Alert not triggered"),
            }
        }
        triggered
    }

    async fn notify(&self, definition: &AlertDefinition, alert: &Alert) {
        for channel in definition.notification_channels.iter().filter(|c| c.enabled) {
            match channel.channel_type {
                ChannelType::Console => log_alert(alert),
                // subscribers already saw AlertEvent::Triggered
                ChannelType::Event => {}
                ChannelType::PubSub => {
                    let Some(transport) = &self.transport else {
                        debug!(alert_id = %alert.id, "No transport for pub/sub alert channel");
                        continue;
                    };
                    let base = channel.subject.as_deref().unwrap_or(&self.config.subject);
                    let subject = subjects::alert_subject(base, alert.severity.as_str());
                    let published = match Message::new(MessagePayload::AlertNotification(alert.clone())) {
                        Ok(message) => transport.publish(&subject, message).await.map(|_| ()),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = published {
                        warn!(alert_id = %alert.id, subject = %subject, error = %e, "Failed to publish alert");
                    }
                }
            }
        }
    }

    // ---- background loops ----

    /// Start the evaluation ticker and, when given, follow a health monitor
    pub fn start(&self, health: Option<&HealthMonitor>) {
        let mut check_ticker = self.check_ticker.lock();
        if check_ticker.is_some() {
            return;
        }

        let weak = self.self_ref.clone();
        *check_ticker = Some(Ticker::spawn_with_token(
            "alerts:check",
            self.config.check_interval(),
            self.shutdown.child_token(),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.check_alerts().await;
                    }
                }
            },
        ));

        if let Some(health) = health {
            *self.health_listener.lock() = Some(self.spawn_health_listener(health));
        }
        info!(
            check_interval_ms = self.config.check_interval_ms,
            definitions = self.definitions.len(),
            "Alert manager started"
        );
    }

    fn spawn_health_listener(&self, health: &HealthMonitor) -> JoinHandle<()> {
        let mut receiver = health.events().subscribe();
        let weak = self.self_ref.clone();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(event) => {
                            let Some(manager) = weak.upgrade() else { break };
                            manager.handle_health_event(&event).await;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped = skipped, "Alert manager lagged behind health events");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ticker = self.check_ticker.lock().take();
        if let Some(ticker) = ticker {
            ticker.shutdown().await;
        }
        let listener = self.health_listener.lock().take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                error!(error = %e, "Health listener ended abnormally");
            }
        }
        info!("Alert manager stopped");
    }
}

fn health_message(definition: &AlertDefinition, component_id: Option<&str>, observed: HealthStatus) -> String {
    match component_id {
        Some(id) => format!("{}: component {id} is {observed}", definition.name),
        None => format!("{}: system is {observed}", definition.name),
    }
}

fn log_alert(alert: &Alert) {
    match alert.severity {
        AlertSeverity::Info => info!(alert_id = %alert.id, count = alert.count, "ALERT {}", alert.message),
        AlertSeverity::Warning => warn!(alert_id = %alert.id, count = alert.count, "ALERT {}", alert.message),
        AlertSeverity::Error | AlertSeverity::Critical => {
            error!(alert_id = %alert.id, severity = %alert.severity, count = alert.count, "ALERT {}", alert.message)
        }
    }
}
