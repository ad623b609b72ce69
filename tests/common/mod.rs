//! Shared helpers for integration tests: fast node configuration, multi-node
//! clusters on one in-memory broker, and polling waits.

#![allow(dead_code)]

pub mod strategies;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use a2a_core::config::{A2aConfig, TransportConfig};
use a2a_core::messaging::{InMemoryBroker, MessageTransport};
use a2a_core::orchestration::{task_handler_fn, TaskInfo};
use a2a_core::services::ServiceRegistry;
use a2a_core::system_context::{Collaborators, SystemContext};

/// Default ceiling for [`wait_for`]
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Node configuration with short intervals so background loops act quickly
pub fn fast_config(service_id: &str) -> A2aConfig {
    let mut config = A2aConfig::default();
    config.service.service_id = service_id.to_string();
    config.persistence.retry_interval_ms = 50;
    config.persistence.ack_timeout_ms = 2_000;
    config.health.retry_delay_ms = 50;
    config.task_manager.initial_retry_delay_ms = 20;
    config.task_manager.max_retry_delay_ms = 200;
    config.load_balancer.report_interval_ms = 100;
    config
}

/// Connected transport on `broker`
pub async fn connected_transport(broker: &InMemoryBroker, source: &str) -> Arc<MessageTransport> {
    let transport = MessageTransport::new(source, broker.connector(), TransportConfig::default());
    transport
        .connect()
        .await
        .expect("in-memory transport should connect");
    transport
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Several nodes sharing one broker
pub struct TestCluster {
    pub broker: InMemoryBroker,
    pub nodes: Vec<SystemContext>,
}

impl TestCluster {
    /// Bootstrap one node per id, each with its own in-memory collaborators
    pub async fn start(service_ids: &[&str]) -> Self {
        let broker = InMemoryBroker::new();
        let mut nodes = Vec::with_capacity(service_ids.len());
        for service_id in service_ids {
            let node = SystemContext::bootstrap(
                fast_config(service_id),
                broker.connector(),
                Collaborators::in_memory(),
            )
            .await
            .expect("node should bootstrap");
            nodes.push(node);
        }
        Self { broker, nodes }
    }

    pub fn node(&self, service_id: &str) -> &SystemContext {
        self.nodes
            .iter()
            .find(|n| n.config.service.service_id == service_id)
            .unwrap_or_else(|| panic!("no node {service_id}"))
    }

    /// Register an `echo` handler on every node and announce until every
    /// registry sees every node with the `task.echo` capability
    pub async fn with_echo_everywhere(self) -> Self {
        for node in &self.nodes {
            node.task_manager.register_task_handler(
                "echo",
                task_handler_fn(|task: TaskInfo| async move { Ok(task.parameters) }),
            );
        }
        for node in &self.nodes {
            node.announce().await.expect("announce should publish");
        }

        let expected = self.nodes.len();
        for node in &self.nodes {
            let registry = Arc::clone(&node.collaborators.registry);
            let converged = wait_for(WAIT_TIMEOUT, || {
                let registry = Arc::clone(&registry);
                async move {
                    registry
                        .get_all_services()
                        .await
                        .iter()
                        .filter(|s| s.has_capability("task.echo"))
                        .count()
                        == expected
                }
            })
            .await;
            assert!(converged, "registries never converged");
        }
        self
    }

    pub async fn shutdown(&self) {
        for node in self.nodes.iter().rev() {
            node.shutdown().await;
        }
    }
}
