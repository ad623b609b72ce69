mod common;

use std::time::Duration;

use a2a_core::constants::{persistence_retry_delay, MAX_RETRY_ATTEMPTS, PERSISTENCE_RETRY_DELAYS};
use a2a_core::health::{aggregate_status, HealthStatus};
use a2a_core::messaging::subjects::{is_valid_publish_subject, subject_matches};
use a2a_core::orchestration::{consistent_hash_index, RetryPolicy};
use common::strategies::*;
use proptest::prelude::*;

proptest! {
    /// Retry delays start at the initial delay, never shrink, and never pass the cap
    #[test]
    fn task_backoff_is_monotonic_and_capped(
        (initial_ms, factor, max_ms) in backoff_strategy(),
        retry_count in 0u32..40,
    ) {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            backoff_factor: factor,
        };

        let delay = policy.delay_for(retry_count);
        prop_assert!(delay <= policy.max_delay);
        prop_assert!(policy.delay_for(retry_count + 1) >= delay);
        prop_assert_eq!(policy.delay_for(0), Duration::from_millis(initial_ms.min(max_ms)));
    }

    /// Any unhealthy component makes the whole system unhealthy, regardless of order
    #[test]
    fn unhealthy_component_dominates(
        mut statuses in prop::collection::vec(health_status_strategy(), 0..12),
        position in any::<prop::sample::Index>(),
    ) {
        let index = position.index(statuses.len() + 1);
        statuses.insert(index, HealthStatus::Unhealthy);
        prop_assert_eq!(aggregate_status(statuses.iter().copied()), HealthStatus::Unhealthy);
    }

    /// Aggregation ignores component order
    #[test]
    fn aggregation_is_order_independent(
        statuses in prop::collection::vec(health_status_strategy(), 0..12),
    ) {
        let forward = aggregate_status(statuses.iter().copied());
        let backward = aggregate_status(statuses.iter().rev().copied());
        prop_assert_eq!(forward, backward);

        let all_unknown = statuses.iter().all(|s| *s == HealthStatus::Unknown);
        prop_assert_eq!(forward == HealthStatus::Unknown, all_unknown);
    }

    /// Hash routing always lands on an existing service, and always the same one
    #[test]
    fn consistent_hash_index_is_in_range_and_stable(
        key in routing_key_strategy(),
        count in 1usize..64,
    ) {
        let index = consistent_hash_index(&key, count);
        prop_assert!(index < count);
        prop_assert_eq!(index, consistent_hash_index(&key, count));
    }

    /// Persisted-message retry delays come from the fixed table and never shrink
    #[test]
    fn persistence_delays_follow_the_table(attempts in 1u32..=MAX_RETRY_ATTEMPTS + 3) {
        let delay = persistence_retry_delay(attempts);
        prop_assert!(PERSISTENCE_RETRY_DELAYS.contains(&delay));
        prop_assert!(persistence_retry_delay(attempts + 1) >= delay);
    }

    /// Publishable subjects match themselves and the tail wildcard
    #[test]
    fn subjects_match_themselves(subject in subject_strategy()) {
        prop_assert!(is_valid_publish_subject(&subject));
        prop_assert!(subject_matches(&subject, &subject));
        prop_assert!(subject_matches(">", &subject));

        let first = subject.split('.').next().unwrap_or_default();
        let has_tail = subject.contains('.');
        let tail_pattern = format!("{first}.>");
        prop_assert_eq!(subject_matches(&tail_pattern, &subject), has_tail);
    }
}

#[test]
fn empty_system_is_unknown() {
    assert_eq!(aggregate_status(std::iter::empty()), HealthStatus::Unknown);
}
