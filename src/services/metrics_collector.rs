//! # Metrics Collector
//!
//! Live metrics read by alert evaluation and written by the health monitor.
//! [`InMemoryMetricsCollector`] keeps counters and gauges in process and derives
//! latency, error rate and throughput over a sliding window.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::trace;

/// Well-known metric names resolvable through [`MetricsSnapshot::metric`]
pub mod metric_names {
    pub const MESSAGE_COUNT: &str = "messageCount";
    pub const ERROR_COUNT: &str = "errorCount";
    pub const ERROR_RATE: &str = "errorRate";
    pub const AVERAGE_LATENCY: &str = "averageLatency";
    pub const THROUGHPUT: &str = "throughput";
}

/// Window over which throughput is computed
pub const DEFAULT_THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

/// Point-in-time view of every metric
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub timestamp: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub error_count: u64,
    /// Errors per message, 0.0..=1.0
    pub error_rate: f64,
    /// Milliseconds
    pub average_latency: f64,
    /// Messages per second over the throughput window
    pub throughput: f64,
    #[serde(default)]
    pub gauges: HashMap<String, f64>,
    #[serde(default)]
    pub custom: HashMap<String, f64>,
}

impl MetricsSnapshot {
    /// Resolve a metric by name: well-known names first, then gauges, then
    /// the latest custom value
    pub fn metric(&self, name: &str) -> Option<f64> {
        match name {
            metric_names::MESSAGE_COUNT => Some(self.message_count as f64),
            metric_names::ERROR_COUNT => Some(self.error_count as f64),
            metric_names::ERROR_RATE => Some(self.error_rate),
            metric_names::AVERAGE_LATENCY => Some(self.average_latency),
            metric_names::THROUGHPUT => Some(self.throughput),
            other => self
                .gauges
                .get(other)
                .or_else(|| self.custom.get(other))
                .copied(),
        }
    }
}

/// A recorded custom metric sample
#[derive(Debug, Clone, PartialEq)]
pub struct CustomMetric {
    pub name: String,
    pub value: f64,
    pub tags: HashMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

/// Metrics source consumed by alerting and health reporting
#[async_trait]
pub trait MetricsCollector: Send + Sync + Debug {
    async fn get_metrics_snapshot(&self) -> MetricsSnapshot;

    /// Average latency in milliseconds
    async fn get_average_latency(&self) -> f64;

    /// Messages per second
    async fn get_throughput(&self) -> f64;

    async fn record_custom_metric(&self, name: &str, value: f64, tags: HashMap<String, String>);
}

#[derive(Debug, Default)]
struct CollectorState {
    message_count: u64,
    error_count: u64,
    total_latency_ms: f64,
    latency_samples: u64,
    recent: VecDeque<Instant>,
    gauges: HashMap<String, f64>,
    custom: HashMap<String, Vec<CustomMetric>>,
}

/// Process-local metrics collector
#[derive(Debug)]
pub struct InMemoryMetricsCollector {
    state: Mutex<CollectorState>,
    window: Duration,
    max_samples_per_metric: usize,
}

impl Default for InMemoryMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMetricsCollector {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_THROUGHPUT_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            state: Mutex::new(CollectorState::default()),
            window,
            max_samples_per_metric: 1000,
        }
    }

    /// Record one processed message and its latency
    pub fn record_message(&self, latency: Duration) {
        let mut state = self.state.lock();
        state.message_count += 1;
        state.total_latency_ms += latency.as_secs_f64() * 1000.0;
        state.latency_samples += 1;
        state.recent.push_back(Instant::now());
        Self::prune(&mut state.recent, self.window);
    }

    /// Record one failed message
    pub fn record_error(&self) {
        let mut state = self.state.lock();
        state.message_count += 1;
        state.error_count += 1;
        state.recent.push_back(Instant::now());
        Self::prune(&mut state.recent, self.window);
    }

    pub fn set_gauge(&self, name: impl Into<String>, value: f64) {
        self.state.lock().gauges.insert(name.into(), value);
    }

    /// Every retained sample of a custom metric, oldest first
    pub fn custom_samples(&self, name: &str) -> Vec<CustomMetric> {
        self.state
            .lock()
            .custom
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn reset(&self) {
        *self.state.lock() = CollectorState::default();
    }

    fn prune(recent: &mut VecDeque<Instant>, window: Duration) {
        let now = Instant::now();
        while let Some(front) = recent.front() {
            if now.duration_since(*front) > window {
                recent.pop_front();
            } else {
                break;
            }
        }
    }

    fn average_latency(state: &CollectorState) -> f64 {
        if state.latency_samples == 0 {
            0.0
        } else {
            state.total_latency_ms / state.latency_samples as f64
        }
    }

    fn throughput(&self, state: &mut CollectorState) -> f64 {
        Self::prune(&mut state.recent, self.window);
        let seconds = self.window.as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }
        state.recent.len() as f64 / seconds
    }
}

#[async_trait]
impl MetricsCollector for InMemoryMetricsCollector {
    async fn get_metrics_snapshot(&self) -> MetricsSnapshot {
        let mut state = self.state.lock();
        let throughput = self.throughput(&mut state);
        let error_rate = if state.message_count == 0 {
            0.0
        } else {
            state.error_count as f64 / state.message_count as f64
        };

        MetricsSnapshot {
            timestamp: Some(Utc::now()),
            message_count: state.message_count,
            error_count: state.error_count,
            error_rate,
            average_latency: Self::average_latency(&state),
            throughput,
            gauges: state.gauges.clone(),
            custom: state
                .custom
                .iter()
                .filter_map(|(name, samples)| samples.last().map(|s| (name.clone(), s.value)))
                .collect(),
        }
    }

    async fn get_average_latency(&self) -> f64 {
        Self::average_latency(&self.state.lock())
    }

    async fn get_throughput(&self) -> f64 {
        let mut state = self.state.lock();
        self.throughput(&mut state)
    }

    async fn record_custom_metric(&self, name: &str, value: f64, tags: HashMap<String, String>) {
        trace!(metric = %name, value = value, "Recording custom metric");
        let mut state = self.state.lock();
        let samples = state.custom.entry(name.to_string()).or_default();
        samples.push(CustomMetric {
            name: name.to_string(),
            value,
            tags,
            recorded_at: Utc::now(),
        });
        if samples.len() > self.max_samples_per_metric {
            let excess = samples.len() - self.max_samples_per_metric;
            samples.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_derives_rates() {
        let collector = InMemoryMetricsCollector::new();
        collector.record_message(Duration::from_millis(100));
        collector.record_message(Duration::from_millis(300));
        collector.record_error();
        collector.record_error();

        let snapshot = collector.get_metrics_snapshot().await;
        assert_eq!(snapshot.message_count, 4);
        assert_eq!(snapshot.error_count, 2);
        assert!((snapshot.error_rate - 0.5).abs() < 1e-9);
        assert!((snapshot.average_latency - 200.0).abs() < 1e-9);
        assert!((collector.get_average_latency().await - 200.0).abs() < 1e-9);
        assert_eq!(snapshot.metric(metric_names::ERROR_RATE), Some(0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_window_slides() {
        let collector = InMemoryMetricsCollector::with_window(Duration::from_secs(10));
        for _ in 0..20 {
            collector.record_message(Duration::from_millis(1));
        }
        assert!((collector.get_throughput().await - 2.0).abs() < 1e-9);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(collector.get_throughput().await, 0.0);
    }

    #[tokio::test]
    async fn test_custom_metrics_and_gauges_resolve_by_name() {
        let collector = InMemoryMetricsCollector::new();
        collector.set_gauge("queueDepth", 12.0);
        collector
            .record_custom_metric("health.system_status", 1.0, HashMap::new())
            .await;
        collector
            .record_custom_metric("health.system_status", 2.0, HashMap::new())
            .await;

        let snapshot = collector.get_metrics_snapshot().await;
        assert_eq!(snapshot.metric("queueDepth"), Some(12.0));
        assert_eq!(snapshot.metric("health.system_status"), Some(2.0));
        assert_eq!(snapshot.metric("missing"), None);
        assert_eq!(collector.custom_samples("health.system_status").len(), 2);
    }
}
