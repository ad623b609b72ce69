//! # Service Registry
//!
//! Directory of known services and their capabilities. The load balancer reads
//! it to find eligible targets; the health monitor reads service status.
//! [`InMemoryServiceRegistry`] is the bundled implementation; it can follow
//! peer announcements on `system.register`.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{A2aError, A2aResult};
use crate::events::EventBus;
use crate::messaging::{
    handler_fn, subjects, Message, MessagePayload, MessageTransport, MessagingResult,
    ServiceRegisterPayload, SubscribeOptions,
};

/// Availability of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Online,
    Degraded,
    Offline,
    Unknown,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceStatus::Online => "ONLINE",
            ServiceStatus::Degraded => "DEGRADED",
            ServiceStatus::Offline => "OFFLINE",
            ServiceStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Registered service description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub status: ServiceStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ServiceInfo {
    pub fn new(id: impl Into<String>, capabilities: Vec<String>) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            name: id.clone(),
            id,
            capabilities,
            status: ServiceStatus::Online,
            metadata: HashMap::new(),
            registered_at: now,
            last_seen: now,
        }
    }

    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Status transition of a registered service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatusChange {
    pub service_id: String,
    pub previous: Option<ServiceStatus>,
    pub current: ServiceStatus,
}

/// Service directory consumed by the load balancer and health monitor
#[async_trait]
pub trait ServiceRegistry: Send + Sync + Debug {
    async fn get_all_services(&self) -> Vec<ServiceInfo>;

    async fn get_service(&self, service_id: &str) -> Option<ServiceInfo>;

    async fn get_service_status(&self, service_id: &str) -> Option<ServiceStatus>;

    /// Stream of status changes
    fn status_changes(&self) -> broadcast::Receiver<ServiceStatusChange>;

    async fn register_service(&self, service: ServiceInfo) -> A2aResult<()>;
}

/// In-process service registry with a capability index
#[derive(Debug)]
pub struct InMemoryServiceRegistry {
    services: DashMap<String, ServiceInfo>,
    capability_index: DashMap<String, BTreeSet<String>>,
    changes: EventBus<ServiceStatusChange>,
}

impl Default for InMemoryServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            capability_index: DashMap::new(),
            changes: EventBus::new("service_registry"),
        }
    }

    /// Update a service's status, emitting a change when it differs
    pub fn set_status(&self, service_id: &str, status: ServiceStatus) -> A2aResult<()> {
        let previous = {
            let mut entry = self
                .services
                .get_mut(service_id)
                .ok_or_else(|| A2aError::ComponentNotFound(service_id.to_string()))?;
            let previous = entry.status;
            entry.status = status;
            entry.last_seen = Utc::now();
            previous
        };

        if previous != status {
            info!(service_id = %service_id, from = %previous, to = %status, "Service status changed");
            self.changes.emit(ServiceStatusChange {
                service_id: service_id.to_string(),
                previous: Some(previous),
                current: status,
            });
        }
        Ok(())
    }

    pub fn unregister_service(&self, service_id: &str) -> bool {
        let Some((_, service)) = self.services.remove(service_id) else {
            return false;
        };
        self.unindex(&service);
        self.changes.emit(ServiceStatusChange {
            service_id: service_id.to_string(),
            previous: Some(service.status),
            current: ServiceStatus::Offline,
        });
        true
    }

    /// Ids of services advertising `capability`, sorted
    pub fn find_by_capability(&self, capability: &str) -> Vec<String> {
        self.capability_index
            .get(capability)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Register every service announced on `system.register`
    pub async fn listen(
        self: &Arc<Self>,
        transport: &Arc<MessageTransport>,
    ) -> MessagingResult<String> {
        let registry = Arc::clone(self);
        transport
            .subscribe(
                subjects::SYSTEM_REGISTER,
                handler_fn(move |message: Message| {
                    let registry = Arc::clone(&registry);
                    async move {
                        if let MessagePayload::ServiceRegister(ServiceRegisterPayload { service }) =
                            message.decode_payload()?
                        {
                            registry.insert(service);
                        }
                        Ok(())
                    }
                }),
                SubscribeOptions::default(),
            )
            .await
    }

    /// Announce a service to peers on `system.register`
    pub async fn announce(
        transport: &Arc<MessageTransport>,
        service: ServiceInfo,
    ) -> MessagingResult<String> {
        let message = Message::new(MessagePayload::ServiceRegister(ServiceRegisterPayload {
            service,
        }))?;
        transport.publish(subjects::SYSTEM_REGISTER, message).await
    }

    fn insert(&self, service: ServiceInfo) {
        let service_id = service.id.clone();
        let current = service.status;
        let previous = self.services.get(&service_id).map(|s| s.status);

        if let Some(old) = self.services.get(&service_id).map(|s| s.clone()) {
            self.unindex(&old);
        }
        for capability in &service.capabilities {
            self.capability_index
                .entry(capability.clone())
                .or_default()
                .insert(service_id.clone());
        }
        self.services.insert(service_id.clone(), service);

        debug!(service_id = %service_id, status = %current, "Service registered");
        if previous != Some(current) {
            self.changes.emit(ServiceStatusChange {
                service_id,
                previous,
                current,
            });
        }
    }

    fn unindex(&self, service: &ServiceInfo) {
        for capability in &service.capabilities {
            if let Some(mut ids) = self.capability_index.get_mut(capability) {
                ids.remove(&service.id);
            }
        }
        self.capability_index.retain(|_, ids| !ids.is_empty());
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryServiceRegistry {
    async fn get_all_services(&self) -> Vec<ServiceInfo> {
        let mut services: Vec<ServiceInfo> =
            self.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        services
    }

    async fn get_service(&self, service_id: &str) -> Option<ServiceInfo> {
        self.services.get(service_id).map(|s| s.clone())
    }

    async fn get_service_status(&self, service_id: &str) -> Option<ServiceStatus> {
        self.services.get(service_id).map(|s| s.status)
    }

    fn status_changes(&self) -> broadcast::Receiver<ServiceStatusChange> {
        self.changes.subscribe()
    }

    async fn register_service(&self, service: ServiceInfo) -> A2aResult<()> {
        if service.id.trim().is_empty() {
            return Err(A2aError::ValidationError(
                "service id must not be empty".to_string(),
            ));
        }
        self.insert(service);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_capability_index() {
        let registry = InMemoryServiceRegistry::new();
        registry
            .register_service(ServiceInfo::new("b", vec!["task.echo".into()]))
            .await
            .unwrap();
        registry
            .register_service(ServiceInfo::new("a", vec!["task.echo".into(), "gpu".into()]))
            .await
            .unwrap();

        assert_eq!(registry.find_by_capability("task.echo"), vec!["a", "b"]);
        assert_eq!(registry.find_by_capability("gpu"), vec!["a"]);

        let ids: Vec<String> = registry
            .get_all_services()
            .await
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        // Re-registering with fewer capabilities drops stale index entries
        registry
            .register_service(ServiceInfo::new("a", vec!["task.echo".into()]))
            .await
            .unwrap();
        assert!(registry.find_by_capability("gpu").is_empty());
    }

    #[tokio::test]
    async fn test_status_changes_are_broadcast() {
        let registry = InMemoryServiceRegistry::new();
        registry
            .register_service(ServiceInfo::new("svc", vec![]))
            .await
            .unwrap();
        let mut changes = registry.status_changes();

        registry.set_status("svc", ServiceStatus::Online).unwrap();
        registry.set_status("svc", ServiceStatus::Offline).unwrap();

        let change = changes.recv().await.unwrap();
        assert_eq!(change.previous, Some(ServiceStatus::Online));
        assert_eq!(change.current, ServiceStatus::Offline);
        assert_eq!(
            registry.get_service_status("svc").await,
            Some(ServiceStatus::Offline)
        );
        assert!(registry.set_status("missing", ServiceStatus::Online).is_err());
    }
}
