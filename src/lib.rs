#![allow(clippy::doc_markdown)] // Allow technical terms like NATS, JSON in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # A2A Core
//!
//! Reliability layer for agent-to-agent messaging over publish/subscribe.
//!
//! ## Overview
//!
//! Independent service processes exchange typed JSON messages over named
//! subjects. This crate provides the components each node runs on top of that
//! transport so task distribution between nodes stays fault tolerant and
//! observable. Components never share mutable state across processes; they
//! talk through messages and through each other's narrow public APIs.
//!
//! ## Module Organization
//!
//! - [`messaging`] - Message envelope, pub/sub providers and the reconnecting transport
//! - [`resilience`] - Circuit breaker state machine and per-id registry
//! - [`persistence`] - Durable at-least-once delivery with a fixed retry schedule
//! - [`orchestration`] - Task lifecycle manager, retry backoff and load balancing
//! - [`health`] - Component health checks and system status aggregation
//! - [`alerts`] - Threshold and health alerting with lifecycle tracking
//! - [`services`] - Collaborator interfaces (service registry, metrics, key/value store)
//! - [`system_context`] - Explicit construction and teardown of a whole node
//! - [`config`] - Layered TOML and environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a2a_core::config::A2aConfig;
//! use a2a_core::messaging::InMemoryBroker;
//! use a2a_core::orchestration::{task_handler_fn, CreateTaskOptions, TaskInfo};
//! use a2a_core::system_context::{Collaborators, SystemContext};
//! use serde_json::json;
//!
//! # async fn example() -> a2a_core::A2aResult<()> {
//! let broker = InMemoryBroker::new();
//! let context = SystemContext::bootstrap(
//!     A2aConfig::default(),
//!     broker.connector(),
//!     Collaborators::in_memory(),
//! )
//! .await?;
//!
//! context.task_manager.register_task_handler(
//!     "echo",
//!     task_handler_fn(|task: TaskInfo| async move { Ok(task.parameters) }),
//! );
//! let task = context
//!     .task_manager
//!     .create_task("echo", json!({"x": 1}), CreateTaskOptions::default())
//!     .await?;
//! println!("created {}", task.task_id);
//!
//! context.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod alerts;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod health;
pub mod logging;
pub mod messaging;
pub mod orchestration;
pub mod persistence;
pub mod resilience;
pub mod services;
pub mod system_context;
pub mod utils;

pub use config::{A2aConfig, ConfigManager, ConfigurationError};
pub use error::{A2aError, A2aResult};
pub use events::EventBus;
pub use messaging::{Message, MessagePayload, MessageTransport, MessagingError};
pub use system_context::{Collaborators, SystemContext};
