//! # Circuit Breaker Metrics
//!
//! Snapshots of breaker counters, one per breaker and one aggregated over a
//! registry. The health monitor's breaker checks read them, and so do
//! operators inspecting a node.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resilience::CircuitState;

/// Closed breakers below this many calls are healthy regardless of failures
const MIN_CALLS_FOR_RATE: u64 = 10;
/// Failure rate at which a closed breaker stops counting as healthy
const UNHEALTHY_FAILURE_RATE: f64 = 0.1;

/// Counters of a single breaker at the moment it was sampled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    /// Calls that reached the operation; rejections are not calls
    pub calls: u64,
    pub successes: u64,
    /// Failed calls, timeouts included
    pub failures: u64,
    pub timeouts: u64,
    pub rejections: u64,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub mean_latency: Duration,
}

impl CircuitBreakerMetrics {
    pub fn failure_rate(&self) -> f64 {
        ratio(self.failures, self.calls)
    }

    pub fn success_rate(&self) -> f64 {
        ratio(self.successes, self.calls)
    }

    /// Open is unhealthy; closed is unhealthy once enough calls show a high
    /// failure rate. Half-open counts as healthy while it probes.
    pub fn is_healthy(&self) -> bool {
        match self.state {
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
            CircuitState::Closed => {
                self.calls < MIN_CALLS_FOR_RATE || self.failure_rate() < UNHEALTHY_FAILURE_RATE
            }
        }
    }
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            calls: 0,
            successes: 0,
            failures: 0,
            timeouts: 0,
            rejections: 0,
            consecutive_failures: 0,
            half_open_successes: 0,
            mean_latency: Duration::ZERO,
        }
    }
}

impl fmt::Display for CircuitBreakerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} calls={} failures={} timeouts={} rejected={} mean_latency={}ms",
            self.state,
            self.calls,
            self.failures,
            self.timeouts,
            self.rejections,
            self.mean_latency.as_millis()
        )
    }
}

/// Metrics of every breaker in a registry, keyed by breaker id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryMetrics {
    pub breakers: BTreeMap<String, CircuitBreakerMetrics>,
    pub collected_at: DateTime<Utc>,
}

impl RegistryMetrics {
    pub fn collect<I>(breakers: I) -> Self
    where
        I: IntoIterator<Item = (String, CircuitBreakerMetrics)>,
    {
        Self {
            breakers: breakers.into_iter().collect(),
            collected_at: Utc::now(),
        }
    }

    pub fn state_counts(&self) -> HashMap<CircuitState, usize> {
        self.breakers
            .values()
            .fold(HashMap::new(), |mut counts, metrics| {
                *counts.entry(metrics.state).or_insert(0) += 1;
                counts
            })
    }

    /// Ids of unhealthy breakers in id order
    pub fn unhealthy(&self) -> Vec<&str> {
        self.breakers
            .iter()
            .filter(|(_, metrics)| !metrics.is_healthy())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Share of healthy breakers; an empty registry scores 1.0
    pub fn health_score(&self) -> f64 {
        if self.breakers.is_empty() {
            return 1.0;
        }
        let unhealthy = self.unhealthy().len();
        (self.breakers.len() - unhealthy) as f64 / self.breakers.len() as f64
    }

    /// Failures over calls across all breakers
    pub fn failure_rate(&self) -> f64 {
        let (failures, calls) = self
            .breakers
            .values()
            .fold((0, 0), |(f, c), m| (f + m.failures, c + m.calls));
        ratio(failures, calls)
    }
}

impl fmt::Display for RegistryMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts = self.state_counts();
        let count = |state| counts.get(&state).copied().unwrap_or(0);
        write!(
            f,
            "breakers={} closed={} open={} half_open={} health={:.2} failure_rate={:.3}",
            self.breakers.len(),
            count(CircuitState::Closed),
            count(CircuitState::Open),
            count(CircuitState::HalfOpen),
            self.health_score(),
            self.failure_rate()
        )
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}
