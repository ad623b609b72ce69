//! # Circuit Breaker Implementation
//!
//! Fault isolation for arbitrary async operations. Three states:
//! Closed (normal operation), Open (failing fast) and Half-Open (probing recovery).
//!
//! Edges:
//! - Closed -> Open once consecutive failures reach `failure_threshold`
//! - Open -> Half-Open on a monitor tick after `reset_timeout` has passed since the last failure
//! - Half-Open -> Closed after `half_open_success_threshold` consecutive successes
//! - Half-Open -> Open on any failure

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::events::EventBus;
use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};
use crate::utils::Ticker;

/// Lock-free counters for call outcomes
#[derive(Debug, Default)]
struct AtomicCallMetrics {
    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    timeout_count: AtomicU64,
    rejected_count: AtomicU64,
    total_duration_nanos: AtomicU64,
}

impl AtomicCallMetrics {
    #[inline]
    fn record(&self, duration: Duration, success: bool) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }
        self.total_duration_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }
}

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - calls flow, the first failure reopens
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, rejecting all calls
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Operation exceeded the per-call timeout (recorded as a failure)
    #[error("Operation timed out after {timeout_ms}ms for {component}")]
    Timeout { component: String, timeout_ms: u64 },

    /// Operation failed and was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, CircuitBreakerError::CircuitOpen { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CircuitBreakerError::Timeout { .. })
    }
}

/// Events emitted by circuit breakers
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitEvent {
    StateChanged {
        breaker_id: String,
        from: CircuitState,
        to: CircuitState,
    },
    Success {
        breaker_id: String,
        duration: Duration,
    },
    Failure {
        breaker_id: String,
        error: String,
        duration: Duration,
    },
    Rejected {
        breaker_id: String,
    },
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_failure: Option<Instant>,
}

type Transition = Option<(CircuitState, CircuitState)>;

/// Core circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Breaker id for logging and metrics
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    metrics: AtomicCallMetrics,
    events: EventBus<CircuitEvent>,
    monitor: Mutex<Option<Ticker>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with its own event bus
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_events(name, config, EventBus::new("circuit_breaker"))
    }

    /// Create a breaker that reports on a shared event bus
    pub fn with_events(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        events: EventBus<CircuitEvent>,
    ) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            reset_timeout_ms = config.reset_timeout.as_millis() as u64,
            half_open_success_threshold = config.half_open_success_threshold,
            "Circuit breaker initialized"
        );

        Self {
            name,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                last_failure: None,
            }),
            metrics: AtomicCallMetrics::default(),
            events,
            monitor: Mutex::new(None),
        }
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus<CircuitEvent> {
        &self.events
    }

    /// Execute an operation with circuit breaker protection.
    ///
    /// Fails with `CircuitOpen` without invoking `operation` while open.
    /// Otherwise the operation is raced against `call_timeout`.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        if self.state() == CircuitState::Open {
            self.metrics.rejected_count.fetch_add(1, Ordering::Relaxed);
            debug!(component = %self.name, "Call rejected, circuit open");
            self.events.emit(CircuitEvent::Rejected {
                breaker_id: self.name.clone(),
            });
            return Err(CircuitBreakerError::CircuitOpen {
                component: self.name.clone(),
            });
        }

        let start = Instant::now();
        match tokio::time::timeout(self.config.call_timeout, operation()).await {
            Ok(Ok(value)) => {
                self.record_success(start.elapsed());
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure(start.elapsed(), e.to_string());
                Err(CircuitBreakerError::OperationFailed(e))
            }
            Err(_) => {
                self.metrics.timeout_count.fetch_add(1, Ordering::Relaxed);
                let timeout_ms = self.config.call_timeout.as_millis() as u64;
                self.record_failure(start.elapsed(), format!("timed out after {timeout_ms}ms"));
                Err(CircuitBreakerError::Timeout {
                    component: self.name.clone(),
                    timeout_ms,
                })
            }
        }
    }

    fn record_success(&self, duration: Duration) {
        self.metrics.record(duration, true);

        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.half_open_success_threshold {
                        Self::transition(&mut inner, CircuitState::Closed)
                    } else {
                        None
                    }
                }
                CircuitState::Open => {
                    // Call started before the circuit opened
                    None
                }
            }
        };

        debug!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            "Operation succeeded"
        );
        self.events.emit(CircuitEvent::Success {
            breaker_id: self.name.clone(),
            duration,
        });
        self.announce(transition);
    }

    fn record_failure(&self, duration: Duration, error: String) {
        self.metrics.record(duration, false);

        let transition = {
            let mut inner = self.inner.lock();
            inner.last_failure = Some(Instant::now());
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        Self::transition(&mut inner, CircuitState::Open)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => Self::transition(&mut inner, CircuitState::Open),
                CircuitState::Open => None,
            }
        };

        warn!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            error = %error,
            "Operation failed"
        );
        self.events.emit(CircuitEvent::Failure {
            breaker_id: self.name.clone(),
            error,
            duration,
        });
        self.announce(transition);
    }

    /// Move to `to`, resetting the counters that belong to the new state
    fn transition(inner: &mut BreakerState, to: CircuitState) -> Transition {
        let from = inner.state;
        if from == to {
            return None;
        }
        inner.state = to;
        inner.half_open_successes = 0;
        if to != CircuitState::Open {
            inner.consecutive_failures = 0;
        }
        Some((from, to))
    }

    fn announce(&self, transition: Transition) {
        let Some((from, to)) = transition else {
            return;
        };

        match to {
            CircuitState::Open => error!(
                component = %self.name,
                from = %from,
                failure_threshold = self.config.failure_threshold,
                reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                "Circuit breaker opened (failing fast)"
            ),
            CircuitState::HalfOpen => info!(
                component = %self.name,
                success_threshold = self.config.half_open_success_threshold,
                "Circuit breaker half-open (testing recovery)"
            ),
            CircuitState::Closed => info!(
                component = %self.name,
                from = %from,
                "Circuit breaker closed (recovered)"
            ),
        }

        self.events.emit(CircuitEvent::StateChanged {
            breaker_id: self.name.clone(),
            from,
            to,
        });
    }

    /// Monitor tick: move Open -> Half-Open once `reset_timeout` has passed since the last failure
    pub fn check_state(&self) -> CircuitState {
        let (transition, state) = {
            let mut inner = self.inner.lock();
            let due = inner.state == CircuitState::Open
                && inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() > self.config.reset_timeout);
            let transition = if due {
                Self::transition(&mut inner, CircuitState::HalfOpen)
            } else {
                None
            };
            (transition, inner.state)
        };
        self.announce(transition);
        state
    }

    /// Administrative override. Counters are reset; forcing Open restarts the reset timeout.
    pub fn force_state(&self, state: CircuitState) {
        warn!(component = %self.name, state = %state, "Circuit breaker state forced");
        let transition = {
            let mut inner = self.inner.lock();
            let transition = Self::transition(&mut inner, state);
            inner.consecutive_failures = 0;
            inner.half_open_successes = 0;
            inner.last_failure = (state == CircuitState::Open).then(Instant::now);
            transition
        };
        self.announce(transition);
    }

    /// Return to Closed with all counters cleared
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            let transition = Self::transition(&mut inner, CircuitState::Closed);
            inner.consecutive_failures = 0;
            inner.half_open_successes = 0;
            inner.last_failure = None;
            transition
        };
        info!(component = %self.name, "Circuit breaker reset");
        self.announce(transition);
    }

    /// Start the periodic `check_state` ticker. Requires a tokio runtime.
    pub fn start_monitor(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        *monitor = Some(Ticker::spawn(
            format!("circuit_breaker:{}", self.name),
            self.config.monitor_interval,
            move || {
                if let Some(breaker) = weak.upgrade() {
                    breaker.check_state();
                }
                async {}
            },
        ));
    }

    pub fn stop_monitor(&self) {
        if let Some(ticker) = self.monitor.lock().take() {
            ticker.stop();
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let (state, consecutive_failures, half_open_successes) = {
            let inner = self.inner.lock();
            (
                inner.state,
                inner.consecutive_failures,
                inner.half_open_successes,
            )
        };

        let calls = self.metrics.total_calls.load(Ordering::Relaxed);
        let total_nanos = self.metrics.total_duration_nanos.load(Ordering::Relaxed);

        CircuitBreakerMetrics {
            state,
            calls,
            successes: self.metrics.success_count.load(Ordering::Relaxed),
            failures: self.metrics.failure_count.load(Ordering::Relaxed),
            timeouts: self.metrics.timeout_count.load(Ordering::Relaxed),
            rejections: self.metrics.rejected_count.load(Ordering::Relaxed),
            consecutive_failures,
            half_open_successes,
            mean_latency: Duration::from_nanos(total_nanos.checked_div(calls).unwrap_or(0)),
        }
    }

    /// Closed with a low failure rate
    pub fn is_healthy(&self) -> bool {
        self.metrics().is_healthy()
    }
}

impl Drop for CircuitBreaker {
    fn drop(&mut self) {
        if let Some(ticker) = self.monitor.get_mut().take() {
            ticker.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_millis(100),
            half_open_success_threshold: 2,
            call_timeout: Duration::from_millis(50),
            monitor_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_circuit_breaker_normal_operation() {
        let circuit = CircuitBreaker::new("test", config());

        assert_eq!(circuit.state(), CircuitState::Closed);

        let result = circuit.execute(|| async { Ok::<_, String>("success") }).await;
        assert!(result.is_ok());

        let metrics = circuit.metrics();
        assert_eq!(metrics.calls, 1);
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.failures, 0);
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_on_failures() {
        let circuit = CircuitBreaker::new("test", config());

        let _ = circuit.execute(|| async { Err::<String, _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Closed);

        let _ = circuit.execute(|| async { Err::<String, _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        let mut invoked = false;
        let result = circuit
            .execute(|| {
                invoked = true;
                async { Ok::<_, String>("should not execute") }
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
        assert!(!invoked);
        assert_eq!(circuit.metrics().rejections, 1);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let circuit = CircuitBreaker::new("test", config());

        let _ = circuit.execute(|| async { Err::<(), _>("error") }).await;
        let _ = circuit.execute(|| async { Ok::<_, String>(()) }).await;
        let _ = circuit.execute(|| async { Err::<(), _>("error") }).await;

        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.metrics().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let circuit = CircuitBreaker::new("test", config());

        for _ in 0..2 {
            let result = circuit
                .execute(|| async {
                    sleep(Duration::from_secs(1)).await;
                    Ok::<_, String>(())
                })
                .await;
            assert!(matches!(result, Err(CircuitBreakerError::Timeout { .. })));
        }

        assert_eq!(circuit.state(), CircuitState::Open);
        assert_eq!(circuit.metrics().timeouts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_recovery_cycle() {
        let circuit = CircuitBreaker::new("test", config());
        for _ in 0..2 {
            let _ = circuit.execute(|| async { Err::<(), _>("error") }).await;
        }
        assert_eq!(circuit.state(), CircuitState::Open);

        // Not yet due
        assert_eq!(circuit.check_state(), CircuitState::Open);

        sleep(Duration::from_millis(150)).await;
        assert_eq!(circuit.check_state(), CircuitState::HalfOpen);

        let _ = circuit.execute(|| async { Ok::<_, String>(()) }).await;
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        let _ = circuit.execute(|| async { Ok::<_, String>(()) }).await;
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let circuit = CircuitBreaker::new("test", config());
        circuit.force_state(CircuitState::Open);
        sleep(Duration::from_millis(150)).await;
        circuit.check_state();
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        let _ = circuit.execute(|| async { Err::<(), _>("still broken") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_moves_open_to_half_open() {
        let circuit = Arc::new(CircuitBreaker::new("test", config()));
        let mut events = circuit.events().subscribe();
        circuit.start_monitor();

        circuit.force_state(CircuitState::Open);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        let mut transitions = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CircuitEvent::StateChanged { to, .. } = event {
                transitions.push(to);
            }
        }
        assert_eq!(transitions, vec![CircuitState::Open, CircuitState::HalfOpen]);

        circuit.stop_monitor();
        assert!(!circuit.is_monitoring());
    }

    #[tokio::test]
    async fn test_reset_clears_counters() {
        let circuit = CircuitBreaker::new("test", config());
        let _ = circuit.execute(|| async { Err::<(), _>("error") }).await;
        circuit.force_state(CircuitState::Open);
        circuit.reset();

        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.metrics().consecutive_failures, 0);
    }
}
