use a2a_core::health::HealthStatus;
use proptest::prelude::*;

/// Any component health status
pub fn health_status_strategy() -> impl Strategy<Value = HealthStatus> {
    prop_oneof![
        Just(HealthStatus::Healthy),
        Just(HealthStatus::Degraded),
        Just(HealthStatus::Unhealthy),
        Just(HealthStatus::Unknown),
    ]
}

/// Dot-separated subject with one to four lowercase tokens
pub fn subject_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z][a-z0-9_]{0,7}", 1..5).prop_map(|tokens| tokens.join("."))
}

/// Routing keys, including non-ASCII text
pub fn routing_key_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-zA-Z0-9_-]{0,32}",
        "\\PC{0,16}",
    ]
}

/// (initial_ms, factor, max_ms) triples for a task retry policy
pub fn backoff_strategy() -> impl Strategy<Value = (u64, f64, u64)> {
    (1u64..5_000, 1.0f64..4.0, 1u64..120_000)
}
