use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::alerts::AlertManager;
use crate::config::{A2aConfig, ConfigManager};
use crate::error::{A2aError, A2aResult};
use crate::health::{
    circuit_breaker_check, service_status_check, transport_check, ComponentRegistration,
    HealthMonitor,
};
use crate::logging::log_error;
use crate::messaging::{MessageTransport, PubSubConnector};
use crate::orchestration::{LoadBalancer, TaskManager};
use crate::persistence::MessagePersistence;
use crate::resilience::CircuitBreakerRegistry;
use crate::services::{
    InMemoryKeyValueStore, InMemoryMetricsCollector, InMemoryServiceRegistry, KeyValueStore,
    MetricsCollector, ServiceInfo, ServiceRegistry,
};

/// External services a node consumes
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn ServiceRegistry>,
    pub metrics: Arc<dyn MetricsCollector>,
    pub store: Arc<dyn KeyValueStore>,
    /// Set when `registry` is the bundled in-memory one, which then follows
    /// `system.register` announcements
    pub local_registry: Option<Arc<InMemoryServiceRegistry>>,
}

impl Collaborators {
    /// Process-local registry, metrics and store
    pub fn in_memory() -> Self {
        let registry = Arc::new(InMemoryServiceRegistry::new());
        Self {
            registry: registry.clone() as Arc<dyn ServiceRegistry>,
            metrics: Arc::new(InMemoryMetricsCollector::new()),
            store: Arc::new(InMemoryKeyValueStore::new()),
            local_registry: Some(registry),
        }
    }
}

/// Every component of one node, built once at startup and passed explicitly
///
/// Construction follows dependency order (transport, breakers, persistence,
/// load balancer, task manager, health monitor, alert manager). The load
/// balancer publishes this node's task load on `system.load` on its own ticker.
/// [`SystemContext::shutdown`] tears down in reverse.
pub struct SystemContext {
    /// Node instance id
    pub system_id: Uuid,
    pub config: A2aConfig,
    pub transport: Arc<MessageTransport>,
    pub circuit_breakers: Arc<CircuitBreakerRegistry>,
    pub persistence: Arc<MessagePersistence>,
    pub load_balancer: Arc<LoadBalancer>,
    pub task_manager: Arc<TaskManager>,
    pub health_monitor: Arc<HealthMonitor>,
    pub alert_manager: Arc<AlertManager>,
    pub collaborators: Collaborators,
}

impl std::fmt::Debug for SystemContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemContext")
            .field("system_id", &self.system_id)
            .field("service_id", &self.config.service.service_id)
            .field("transport", &self.transport.connection_state())
            .field("circuit_breakers", &self.circuit_breakers.len())
            .finish()
    }
}

impl SystemContext {
    /// Load configuration for the detected environment and bootstrap
    pub async fn new(
        connector: Arc<dyn PubSubConnector>,
        collaborators: Collaborators,
    ) -> A2aResult<Self> {
        let config_manager = ConfigManager::load()?;
        Self::from_config(config_manager, connector, collaborators).await
    }

    pub async fn from_config(
        config_manager: Arc<ConfigManager>,
        connector: Arc<dyn PubSubConnector>,
        collaborators: Collaborators,
    ) -> A2aResult<Self> {
        info!(environment = %config_manager.environment(), "Initializing SystemContext from configuration");
        Self::bootstrap(config_manager.config().clone(), connector, collaborators).await
    }

    /// Connect, build every component and start its background loops
    pub async fn bootstrap(
        config: A2aConfig,
        connector: Arc<dyn PubSubConnector>,
        collaborators: Collaborators,
    ) -> A2aResult<Self> {
        config.validate()?;
        let service_id = config.service.service_id.clone();

        let transport = MessageTransport::new(&service_id, connector, config.transport.clone());
        transport.connect().await.map_err(|e| {
            log_error("system_context", "connect", &e.to_string(), Some(&service_id));
            A2aError::from(e)
        })?;

        let circuit_breakers = Arc::new(CircuitBreakerRegistry::from_settings(
            &config.circuit_breakers,
        ));
        for id in config.circuit_breakers.components.keys() {
            circuit_breakers.get_or_create(id, None);
        }

        let persistence = MessagePersistence::new(
            Arc::clone(&transport),
            Arc::clone(&collaborators.store),
            config.persistence.clone(),
        );
        persistence.start().await?;

        let load_balancer = Arc::new(LoadBalancer::new(
            Arc::clone(&collaborators.registry),
            Arc::clone(&transport),
            &config.load_balancer,
        ));
        load_balancer.start().await?;

        let task_manager = TaskManager::new(
            Arc::clone(&transport),
            config.service.capabilities.clone(),
            config.task_manager.clone(),
        );
        task_manager.set_load_balancer(Arc::clone(&load_balancer));
        task_manager.start().await?;

        let reporting_tasks = Arc::downgrade(&task_manager);
        let reporting_metrics = Arc::clone(&collaborators.metrics);
        load_balancer.start_load_reporting(
            &service_id,
            config.load_balancer.report_interval(),
            move || {
                let tasks = reporting_tasks.clone();
                let metrics = Arc::clone(&reporting_metrics);
                async move {
                    let snapshot = metrics.get_metrics_snapshot().await;
                    let mut load = tasks
                        .upgrade()
                        .map(|tasks| tasks.load_metrics())
                        .unwrap_or_default();
                    load.error_rate = snapshot.error_rate;
                    load.average_response_time = snapshot.average_latency;
                    load
                }
            },
        );

        let health_monitor = HealthMonitor::new(
            &service_id,
            config.health.clone(),
            Some(Arc::clone(&transport)),
            Some(Arc::clone(&collaborators.metrics)),
        );
        health_monitor.register_component(ComponentRegistration::new(
            "transport",
            "transport",
            transport_check(Arc::clone(&transport)),
        ));
        for id in circuit_breakers.list() {
            if let Some(breaker) = circuit_breakers.get(&id) {
                health_monitor.register_component(ComponentRegistration::new(
                    format!("circuit_breaker:{id}"),
                    "circuit_breaker",
                    circuit_breaker_check(breaker),
                ));
            }
        }
        health_monitor.register_component(ComponentRegistration::new(
            format!("service:{service_id}"),
            "service",
            service_status_check(Arc::clone(&collaborators.registry), &service_id),
        ));
        health_monitor.start();

        let alert_manager = AlertManager::new(
            config.alerts.clone(),
            Arc::clone(&collaborators.metrics),
            Some(Arc::clone(&transport)),
        );
        alert_manager.start(Some(&health_monitor));

        let context = Self {
            system_id: Uuid::new_v4(),
            config,
            transport,
            circuit_breakers,
            persistence,
            load_balancer,
            task_manager,
            health_monitor,
            alert_manager,
            collaborators,
        };
        if let Some(registry) = &context.collaborators.local_registry {
            registry.listen(&context.transport).await?;
        }
        context.register_self().await?;

        info!(
            system_id = %context.system_id,
            service_id = %service_id,
            "SystemContext bootstrapped"
        );
        Ok(context)
    }

    /// Register this node with the local registry and announce it to peers
    async fn register_self(&self) -> A2aResult<()> {
        let service = ServiceInfo::new(
            self.config.service.service_id.clone(),
            self.task_manager.capabilities(),
        );

        self.collaborators
            .registry
            .register_service(service.clone())
            .await?;
        InMemoryServiceRegistry::announce(&self.transport, service).await?;
        Ok(())
    }

    /// Re-announce this node, e.g. after registering new task handlers
    pub async fn announce(&self) -> A2aResult<()> {
        self.register_self().await
    }

    /// Stop every component in reverse construction order
    pub async fn shutdown(&self) {
        info!(system_id = %self.system_id, "Shutting down SystemContext");
        self.alert_manager.shutdown().await;
        self.health_monitor.shutdown().await;
        self.task_manager.shutdown().await;
        self.load_balancer.stop();
        self.persistence.shutdown().await;
        self.circuit_breakers.stop_all_monitors();
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "Transport did not disconnect cleanly");
        }
        info!(system_id = %self.system_id, "SystemContext stopped");
    }
}
