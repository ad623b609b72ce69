//! # System Constants
//!
//! Wire-level and protocol constants shared by every node. Values here must
//! agree across peers, which is why they are not configurable.

use std::time::Duration;

/// Maximum delivery attempts for a persisted message before it is marked failed
pub const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Delay before the next delivery attempt, indexed by attempts already made.
/// The last entry repeats past the end of the table.
pub const PERSISTENCE_RETRY_DELAYS: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(30),
    Duration::from_secs(60),
];

/// Key/value namespace holding persisted messages
pub const PERSISTENCE_NAMESPACE: &str = "a2a.persistence";

/// Key prefix for persisted message records
pub const PERSISTENCE_KEY_PREFIX: &str = "message:";

/// Capability prefix a service advertises for each task type it executes
pub const TASK_CAPABILITY_PREFIX: &str = "task.";

/// Routing key used when a task carries neither a routing key nor a type
pub const DEFAULT_ROUTING_KEY: &str = "default";

/// Tolerance for floating point equality in alert conditions
pub const ALERT_EPSILON: f64 = 1e-6;

/// Task error codes
pub mod task_error_codes {
    pub const NO_HANDLER: &str = "NO_HANDLER";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const HANDLER_ERROR: &str = "HANDLER_ERROR";
    pub const HANDLER_PANIC: &str = "HANDLER_PANIC";
}

/// Capability required for a task type under the `task.{type}` convention
pub fn task_capability(task_type: &str) -> String {
    format!("{TASK_CAPABILITY_PREFIX}{task_type}")
}

/// Retry delay for a persisted message after `attempts` failed deliveries
pub fn persistence_retry_delay(attempts: u32) -> Duration {
    let index = (attempts.saturating_sub(1) as usize).min(PERSISTENCE_RETRY_DELAYS.len() - 1);
    PERSISTENCE_RETRY_DELAYS[index]
}
