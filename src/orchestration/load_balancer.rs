//! # Load Balancer
//!
//! Chooses a service for a task. Eligible services are `ONLINE`, not excluded,
//! carry every required capability and, when a task type is given, the
//! `task.{type}` capability. Eligible services are ordered by id; with none the
//! selection is `None`, with exactly one it is returned without consulting the
//! strategy.
//!
//! ## Strategies
//!
//! - **RoundRobin**: per task type counter modulo the eligible count
//! - **LeastBusy**: lowest `queue*10 + cpu*0.5 + memory*0.3 + errorRate*20`;
//!   a service that never reported load wins immediately
//! - **Random**: uniform pick
//! - **ConsistentHash**: 31-multiplier string hash of the routing key
//! - **CapabilityMatch**: `matching*1000 - total`, favoring specialized services.
//!   Every eligible service already holds `task.{type}`, so among equal matches
//!   the one advertising fewer capabilities wins
//!
//! ## Load reports
//!
//! Every node publishes its own [`ServiceLoadMetrics`] on `system.load` from a
//! ticker started with [`LoadBalancer::start_load_reporting`]; every balancer
//! records the reports it receives, last writer wins.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::LoadBalancerConfig;
use crate::constants::{task_capability, DEFAULT_ROUTING_KEY};
use crate::error::A2aResult;
use crate::messaging::{
    handler_fn, subjects, Message, MessagePayload, MessageTransport, MessagingResult,
    ServiceLoadPayload, SubscribeOptions, TaskAssignPayload,
};
use crate::orchestration::types::{ServiceLoadMetrics, TaskInfo};
use crate::services::{ServiceInfo, ServiceRegistry, ServiceStatus};
use crate::utils::Ticker;

/// Service selection algorithm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    LeastBusy,
    Random,
    ConsistentHash,
    CapabilityMatch,
}

impl LoadBalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancingStrategy::RoundRobin => "ROUND_ROBIN",
            LoadBalancingStrategy::LeastBusy => "LEAST_BUSY",
            LoadBalancingStrategy::Random => "RANDOM",
            LoadBalancingStrategy::ConsistentHash => "CONSISTENT_HASH",
            LoadBalancingStrategy::CapabilityMatch => "CAPABILITY_MATCH",
        }
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selection criteria
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionOptions {
    pub task_type: Option<String>,
    pub required_capabilities: Vec<String>,
    pub excluded_services: Vec<String>,
    /// Overrides the balancer's default strategy
    pub strategy: Option<LoadBalancingStrategy>,
    /// Key for consistent hashing; falls back to the task type
    pub routing_key: Option<String>,
}

impl SelectionOptions {
    pub fn for_task_type(task_type: impl Into<String>) -> Self {
        Self {
            task_type: Some(task_type.into()),
            ..Default::default()
        }
    }

    pub fn with_strategy(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn require(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    pub fn exclude(mut self, service_id: impl Into<String>) -> Self {
        self.excluded_services.push(service_id.into());
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    fn counter_key(&self) -> &str {
        self.task_type.as_deref().unwrap_or(DEFAULT_ROUTING_KEY)
    }

    fn routing_key(&self) -> &str {
        self.routing_key
            .as_deref()
            .or(self.task_type.as_deref())
            .unwrap_or(DEFAULT_ROUTING_KEY)
    }
}

/// 32-bit string hash: `hash = hash * 31 + unit` over UTF-16 code units,
/// wrapping like a signed 32-bit integer
pub fn string_hash(key: &str) -> i32 {
    key.encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as i32))
}

/// Bucket of `key` among `count` services
pub fn consistent_hash_index(key: &str, count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    let hash = (string_hash(key) as i64).unsigned_abs();
    (hash % count as u64) as usize
}

/// Service selector backed by a [`ServiceRegistry`] and `system.load` reports
#[derive(Debug)]
pub struct LoadBalancer {
    registry: Arc<dyn ServiceRegistry>,
    transport: Arc<MessageTransport>,
    default_strategy: LoadBalancingStrategy,
    counters: Mutex<HashMap<String, u64>>,
    load: DashMap<String, ServiceLoadMetrics>,
    load_subscription: Mutex<Option<String>>,
    reporter: Mutex<Option<Ticker>>,
}

impl LoadBalancer {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        transport: Arc<MessageTransport>,
        config: &LoadBalancerConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            default_strategy: config.default_strategy,
            counters: Mutex::new(HashMap::new()),
            load: DashMap::new(),
            load_subscription: Mutex::new(None),
            reporter: Mutex::new(None),
        }
    }

    pub fn default_strategy(&self) -> LoadBalancingStrategy {
        self.default_strategy
    }

    /// Subscribe to `system.load` so load reports feed `LeastBusy`
    pub async fn start(self: &Arc<Self>) -> MessagingResult<()> {
        if self.load_subscription.lock().is_some() {
            return Ok(());
        }

        let balancer = Arc::downgrade(self);
        let subscription_id = self
            .transport
            .subscribe(
                subjects::SYSTEM_LOAD,
                handler_fn(move |message: Message| {
                    let balancer = balancer.clone();
                    async move {
                        let Some(balancer) = balancer.upgrade() else {
                            return Ok(());
                        };
                        if let MessagePayload::ServiceLoad(ServiceLoadPayload {
                            service_id,
                            metrics,
                        }) = message.decode_payload()?
                        {
                            balancer.update_service_load(&service_id, metrics);
                        }
                        Ok(())
                    }
                }),
                SubscribeOptions::default(),
            )
            .await?;

        *self.load_subscription.lock() = Some(subscription_id);
        info!(strategy = %self.default_strategy, "Load balancer started");
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(reporter) = self.reporter.lock().take() {
            reporter.stop();
        }
        if let Some(subscription_id) = self.load_subscription.lock().take() {
            if let Err(e) = self.transport.unsubscribe(&subscription_id) {
                warn!(error = %e, "Failed to unsubscribe load balancer from system.load");
            }
        }
    }

    /// Record a load report, last writer wins
    pub fn update_service_load(&self, service_id: &str, metrics: ServiceLoadMetrics) {
        debug!(
            service_id = %service_id,
            score = metrics.load_score(),
            "Service load updated"
        );
        self.load.insert(service_id.to_string(), metrics);
    }

    /// Publish this node's load on `system.load`
    pub async fn report_load(
        &self,
        service_id: &str,
        metrics: ServiceLoadMetrics,
    ) -> MessagingResult<String> {
        let message = Message::new(MessagePayload::ServiceLoad(ServiceLoadPayload {
            service_id: service_id.to_string(),
            metrics,
        }))?;
        self.transport.publish(subjects::SYSTEM_LOAD, message).await
    }

    /// Sample this node's load with `sample` every `period`, record it locally
    /// and publish it on `system.load`. Replaces a previous reporter.
    pub fn start_load_reporting<F, Fut>(
        self: &Arc<Self>,
        service_id: impl Into<String>,
        period: Duration,
        mut sample: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ServiceLoadMetrics> + Send + 'static,
    {
        let service_id = service_id.into();
        let balancer = Arc::downgrade(self);
        let ticker = Ticker::spawn("load_balancer:report", period, move || {
            let balancer = balancer.clone();
            let service_id = service_id.clone();
            let sampled = sample();
            async move {
                let Some(balancer) = balancer.upgrade() else {
                    return;
                };
                let mut metrics = sampled.await;
                metrics.last_updated = Utc::now();
                balancer.update_service_load(&service_id, metrics.clone());
                if let Err(e) = balancer.report_load(&service_id, metrics).await {
                    warn!(service_id = %service_id, error = %e, "Failed to publish load report");
                }
            }
        });
        if let Some(previous) = self.reporter.lock().replace(ticker) {
            previous.stop();
        }
    }

    pub fn load_snapshot(&self) -> HashMap<String, ServiceLoadMetrics> {
        self.load
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Eligible services ordered by id
    pub async fn eligible_services(&self, options: &SelectionOptions) -> Vec<ServiceInfo> {
        let task_capability = options.task_type.as_deref().map(task_capability);
        let mut services: Vec<ServiceInfo> = self
            .registry
            .get_all_services()
            .await
            .into_iter()
            .filter(|s| s.status == ServiceStatus::Online)
            .filter(|s| !options.excluded_services.contains(&s.id))
            .filter(|s| {
                options
                    .required_capabilities
                    .iter()
                    .all(|c| s.has_capability(c))
            })
            .filter(|s| {
                task_capability
                    .as_deref()
                    .map_or(true, |c| s.has_capability(c))
            })
            .collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        services
    }

    pub async fn select_service_for_task(&self, options: &SelectionOptions) -> Option<ServiceInfo> {
        let mut services = self.eligible_services(options).await;
        match services.len() {
            0 => {
                debug!(task_type = ?options.task_type, "No eligible service");
                return None;
            }
            1 => return services.pop(),
            _ => {}
        }

        let strategy = options.strategy.unwrap_or(self.default_strategy);
        let index = match strategy {
            LoadBalancingStrategy::RoundRobin => self.round_robin(options.counter_key(), services.len()),
            LoadBalancingStrategy::LeastBusy => self.least_busy(&services),
            LoadBalancingStrategy::Random => rand::rng().random_range(0..services.len()),
            LoadBalancingStrategy::ConsistentHash => {
                consistent_hash_index(options.routing_key(), services.len())
            }
            LoadBalancingStrategy::CapabilityMatch => {
                capability_match(&services, &options.required_capabilities)
            }
        };

        let selected = services.swap_remove(index);
        debug!(
            service_id = %selected.id,
            strategy = %strategy,
            task_type = ?options.task_type,
            "Service selected"
        );
        Some(selected)
    }

    /// Select a service and publish `task.assign` naming it.
    ///
    /// Returns the chosen service, or `None` (nothing published) when no
    /// service is eligible.
    pub async fn assign_task(
        &self,
        task: &TaskInfo,
        options: &SelectionOptions,
    ) -> A2aResult<Option<ServiceInfo>> {
        let mut options = options.clone();
        if options.task_type.is_none() {
            options.task_type = Some(task.task_type.clone());
        }
        let strategy = options.strategy.unwrap_or(self.default_strategy);

        let Some(service) = self.select_service_for_task(&options).await else {
            warn!(task_id = %task.task_id, task_type = %task.task_type, "Task could not be assigned");
            return Ok(None);
        };

        let mut assigned = task.clone();
        assigned.assigned_to = Some(service.id.clone());
        let message = Message::new(MessagePayload::TaskAssign(TaskAssignPayload {
            task: assigned,
            assigned_to: service.id.clone(),
            reason: strategy.as_str().to_string(),
        }))?;
        self.transport.publish(subjects::TASK_ASSIGN, message).await?;

        info!(
            task_id = %task.task_id,
            service_id = %service.id,
            strategy = %strategy,
            "Task assigned"
        );
        Ok(Some(service))
    }

    fn round_robin(&self, key: &str, count: usize) -> usize {
        let mut counters = self.counters.lock();
        let counter = counters.entry(key.to_string()).or_insert(0);
        let index = (*counter % count as u64) as usize;
        *counter = counter.wrapping_add(1);
        index
    }

    fn least_busy(&self, services: &[ServiceInfo]) -> usize {
        let mut best: Option<(usize, f64)> = None;
        for (index, service) in services.iter().enumerate() {
            let Some(metrics) = self.load.get(&service.id) else {
                return index;
            };
            let score = metrics.load_score();
            if best.map_or(true, |(_, lowest)| score < lowest) {
                best = Some((index, score));
            }
        }
        best.map(|(index, _)| index).unwrap_or(0)
    }
}

fn capability_match(services: &[ServiceInfo], required: &[String]) -> usize {
    let mut best: Option<(usize, i64)> = None;
    for (index, service) in services.iter().enumerate() {
        let matching = required.iter().filter(|c| service.has_capability(c)).count() as i64;
        let score = matching * 1000 - service.capabilities.len() as i64;
        if best.map_or(true, |(_, top)| score > top) {
            best = Some((index, score));
        }
    }
    best.map(|(index, _)| index).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::messaging::InMemoryBroker;
    use crate::services::InMemoryServiceRegistry;

    async fn balancer_with(services: Vec<ServiceInfo>) -> LoadBalancer {
        let registry = Arc::new(InMemoryServiceRegistry::new());
        for service in services {
            registry.register_service(service).await.unwrap();
        }
        let transport = MessageTransport::new(
            "lb-test",
            InMemoryBroker::new().connector(),
            TransportConfig::default(),
        );
        transport.connect().await.unwrap();
        LoadBalancer::new(registry, transport, &LoadBalancerConfig::default())
    }

    fn echo_service(id: &str) -> ServiceInfo {
        ServiceInfo::new(id, vec!["task.echo".to_string()])
    }

    #[test]
    fn test_string_hash_matches_java_style_hash() {
        assert_eq!(string_hash(""), 0);
        assert_eq!(string_hash("a"), 97);
        assert_eq!(string_hash("ab"), 97 * 31 + 98);
        // wraps like a signed 32-bit integer
        assert_eq!(string_hash("polygenelubricants"), i32::MIN);
        assert_eq!(consistent_hash_index("polygenelubricants", 3), 2);
    }

    #[tokio::test]
    async fn test_eligibility_filters() {
        let balancer = balancer_with(vec![
            echo_service("a"),
            echo_service("b").with_status(ServiceStatus::Offline),
            ServiceInfo::new("c", vec!["task.other".to_string()]),
            ServiceInfo::new("d", vec!["task.echo".to_string(), "gpu".to_string()]),
        ])
        .await;

        let eligible: Vec<String> = balancer
            .eligible_services(&SelectionOptions::for_task_type("echo"))
            .await
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(eligible, vec!["a", "d"]);

        let selected = balancer
            .select_service_for_task(&SelectionOptions::for_task_type("echo").require("gpu"))
            .await
            .unwrap();
        assert_eq!(selected.id, "d");

        let selected = balancer
            .select_service_for_task(&SelectionOptions::for_task_type("echo").exclude("a").exclude("d"))
            .await;
        assert!(selected.is_none());
    }

    #[tokio::test]
    async fn test_round_robin_visits_each_service_once_per_cycle() {
        let balancer =
            balancer_with(vec![echo_service("a"), echo_service("b"), echo_service("c")]).await;
        let options = SelectionOptions::for_task_type("echo");

        let mut picks = Vec::new();
        for _ in 0..6 {
            picks.push(balancer.select_service_for_task(&options).await.unwrap().id);
        }
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_least_busy_prefers_unreported_then_lowest_score() {
        let balancer = balancer_with(vec![echo_service("a"), echo_service("b")]).await;
        let options =
            SelectionOptions::for_task_type("echo").with_strategy(LoadBalancingStrategy::LeastBusy);

        balancer.update_service_load(
            "a",
            ServiceLoadMetrics {
                queue_length: 1,
                ..Default::default()
            },
        );
        assert_eq!(balancer.select_service_for_task(&options).await.unwrap().id, "b");

        balancer.update_service_load(
            "b",
            ServiceLoadMetrics {
                queue_length: 3,
                ..Default::default()
            },
        );
        assert_eq!(balancer.select_service_for_task(&options).await.unwrap().id, "a");
    }

    #[tokio::test]
    async fn test_capability_match_prefers_specialized_service() {
        let balancer = balancer_with(vec![
            ServiceInfo::new("general", vec!["nlp".into(), "vision".into(), "audio".into()]),
            ServiceInfo::new("special", vec!["nlp".into()]),
        ])
        .await;
        let options = SelectionOptions::default()
            .require("nlp")
            .with_strategy(LoadBalancingStrategy::CapabilityMatch);

        assert_eq!(
            balancer.select_service_for_task(&options).await.unwrap().id,
            "special"
        );
    }

    #[tokio::test]
    async fn test_capability_match_breaks_handler_coverage_ties() {
        let balancer = balancer_with(vec![
            ServiceInfo::new("broad", vec!["task.echo".into(), "task.reverse".into()]),
            ServiceInfo::new("narrow", vec!["task.echo".into()]),
        ])
        .await;
        let options = SelectionOptions::for_task_type("echo")
            .with_strategy(LoadBalancingStrategy::CapabilityMatch);

        for _ in 0..3 {
            assert_eq!(
                balancer.select_service_for_task(&options).await.unwrap().id,
                "narrow"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_reporting_records_and_stops() {
        let balancer = Arc::new(balancer_with(vec![echo_service("a")]).await);
        balancer.start().await.unwrap();
        balancer.start_load_reporting("lb-test", Duration::from_secs(1), || async {
            ServiceLoadMetrics {
                queue_length: 4,
                ..Default::default()
            }
        });

        assert!(balancer.load_snapshot().is_empty());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let snapshot = balancer.load_snapshot();
        assert_eq!(snapshot["lb-test"].queue_length, 4);

        balancer.stop();
        balancer.load.clear();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(balancer.load_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_consistent_hash_is_stable() {
        let balancer =
            balancer_with(vec![echo_service("a"), echo_service("b"), echo_service("c")]).await;
        let options = SelectionOptions::for_task_type("echo")
            .with_strategy(LoadBalancingStrategy::ConsistentHash)
            .with_routing_key("customer-42");

        let first = balancer.select_service_for_task(&options).await.unwrap().id;
        for _ in 0..5 {
            assert_eq!(balancer.select_service_for_task(&options).await.unwrap().id, first);
        }
        let expected = ["a", "b", "c"][consistent_hash_index("customer-42", 3)];
        assert_eq!(first, expected);
    }
}
