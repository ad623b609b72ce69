//! # Collaborator Services
//!
//! Interfaces the core consumes from its surroundings (service directory,
//! metrics source, durable key/value store), each with an in-memory
//! implementation so a node can run standalone.

pub mod kv_store;
pub mod metrics_collector;
pub mod service_registry;

pub use kv_store::{glob_matches, InMemoryKeyValueStore, KeyValueStore, ListOptions, StoreOptions};
pub use metrics_collector::{
    metric_names, CustomMetric, InMemoryMetricsCollector, MetricsCollector, MetricsSnapshot,
};
pub use service_registry::{
    InMemoryServiceRegistry, ServiceInfo, ServiceRegistry, ServiceStatus, ServiceStatusChange,
};
