//! # Resilience Module
//!
//! Circuit breakers protecting calls to unreliable collaborators, plus the
//! registry that owns them and the metrics they expose.

pub mod circuit_breaker;
pub mod config;
pub mod metrics;
pub mod registry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitEvent, CircuitState};
pub use config::{CircuitBreakerConfig, CircuitBreakerOverrides};
pub use metrics::{CircuitBreakerMetrics, RegistryMetrics};
pub use registry::CircuitBreakerRegistry;
