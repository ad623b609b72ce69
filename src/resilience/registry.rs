//! # Circuit Breaker Registry
//!
//! One breaker per id, created lazily on first use with per-id overrides merged
//! onto process-wide defaults. All breakers report on the registry's shared
//! event bus.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::events::EventBus;
use crate::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerOverrides,
    CircuitEvent, CircuitState, RegistryMetrics,
};

/// Registry of circuit breakers keyed by id
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    circuit_breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    defaults: CircuitBreakerConfig,
    /// Overrides applied when an id is first created without explicit overrides
    configured_overrides: HashMap<String, CircuitBreakerOverrides>,
    events: EventBus<CircuitEvent>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self::with_overrides(defaults, HashMap::new())
    }

    /// Registry with per-id overrides taken from configuration
    pub fn with_overrides(
        defaults: CircuitBreakerConfig,
        configured_overrides: HashMap<String, CircuitBreakerOverrides>,
    ) -> Self {
        info!(
            failure_threshold = defaults.failure_threshold,
            configured_components = configured_overrides.len(),
            "Initializing circuit breaker registry"
        );
        Self {
            circuit_breakers: RwLock::new(HashMap::new()),
            defaults,
            configured_overrides,
            events: EventBus::new("circuit_breakers"),
        }
    }

    pub fn from_settings(settings: &crate::config::CircuitBreakerSettings) -> Self {
        Self::with_overrides(settings.defaults(), settings.components.clone())
    }

    pub fn events(&self) -> &EventBus<CircuitEvent> {
        &self.events
    }

    pub fn defaults(&self) -> &CircuitBreakerConfig {
        &self.defaults
    }

    /// Get the breaker for `id`, creating it with `overrides` if absent.
    ///
    /// Overrides only apply at creation; an existing breaker is returned as is.
    /// The monitor ticker starts when called inside a tokio runtime.
    pub fn get_or_create(
        &self,
        id: &str,
        overrides: Option<&CircuitBreakerOverrides>,
    ) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.circuit_breakers.read().get(id) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.circuit_breakers.write();

        // Double-check: another caller may have created it
        if let Some(breaker) = breakers.get(id) {
            return Arc::clone(breaker);
        }

        let config = match overrides.or_else(|| self.configured_overrides.get(id)) {
            Some(overrides) => {
                let merged = self.defaults.merged(overrides);
                if let Err(reason) = merged.validate() {
                    warn!(
                        component = id,
                        reason = %reason,
                        "Invalid circuit breaker overrides, using defaults"
                    );
                    self.defaults.clone()
                } else {
                    merged
                }
            }
            None => self.defaults.clone(),
        };

        let breaker = Arc::new(CircuitBreaker::with_events(
            id,
            config,
            self.events.clone(),
        ));
        if tokio::runtime::Handle::try_current().is_ok() {
            breaker.start_monitor();
        } else {
            warn!(component = id, "No async runtime, breaker monitor not started");
        }

        breakers.insert(id.to_string(), Arc::clone(&breaker));

        info!(
            component = id,
            total_circuit_breakers = breakers.len(),
            "Created new circuit breaker"
        );

        breaker
    }

    pub fn get(&self, id: &str) -> Option<Arc<CircuitBreaker>> {
        self.circuit_breakers.read().get(id).cloned()
    }

    /// Stop the breaker's monitor and evict it
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.circuit_breakers.write().remove(id);
        match removed {
            Some(breaker) => {
                breaker.stop_monitor();
                info!(component = id, "Removed circuit breaker");
                true
            }
            None => false,
        }
    }

    /// All breaker ids, sorted
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.circuit_breakers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.circuit_breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_component_metrics(&self, id: &str) -> Option<CircuitBreakerMetrics> {
        self.get(id).map(|breaker| breaker.metrics())
    }

    pub fn get_system_metrics(&self) -> RegistryMetrics {
        RegistryMetrics::collect(
            self.snapshot()
                .into_iter()
                .map(|(id, breaker)| (id, breaker.metrics())),
        )
    }

    pub fn get_state_summary(&self) -> HashMap<CircuitState, usize> {
        self.get_system_metrics().state_counts()
    }

    pub fn system_health_score(&self) -> f64 {
        self.get_system_metrics().health_score()
    }

    /// Force open all circuit breakers (emergency stop)
    pub fn force_open_all(&self) {
        warn!("Forcing all circuit breakers open (emergency stop)");
        for (_, breaker) in self.snapshot() {
            breaker.force_state(CircuitState::Open);
        }
    }

    /// Reset every breaker to closed
    pub fn reset_all(&self) {
        warn!("Resetting all circuit breakers");
        for (_, breaker) in self.snapshot() {
            breaker.reset();
        }
    }

    /// Stop every monitor ticker (shutdown)
    pub fn stop_all_monitors(&self) {
        for (_, breaker) in self.snapshot() {
            breaker.stop_monitor();
        }
    }

    fn snapshot(&self) -> Vec<(String, Arc<CircuitBreaker>)> {
        self.circuit_breakers
            .read()
            .iter()
            .map(|(id, breaker)| (id.clone(), Arc::clone(breaker)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_get_or_create_is_lazy_and_shared() {
        let registry = CircuitBreakerRegistry::default();
        assert!(registry.is_empty());

        let a = registry.get_or_create("llm", None);
        let b = registry.get_or_create("llm", None);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.list(), vec!["llm".to_string()]);
        assert!(a.is_monitoring());
    }

    #[tokio::test]
    async fn test_overrides_merge_onto_defaults() {
        let registry = CircuitBreakerRegistry::default();
        let overrides = CircuitBreakerOverrides::default().failure_threshold(1);
        let breaker = registry.get_or_create("flaky", Some(&overrides));

        assert_eq!(breaker.config().failure_threshold, 1);
        assert_eq!(
            breaker.config().reset_timeout,
            CircuitBreakerConfig::default().reset_timeout
        );
    }

    #[tokio::test]
    async fn test_configured_overrides_apply_by_id() {
        let mut configured = HashMap::new();
        configured.insert(
            "store".to_string(),
            CircuitBreakerOverrides::default().reset_timeout(Duration::from_secs(3)),
        );
        let registry = CircuitBreakerRegistry::with_overrides(Default::default(), configured);

        assert_eq!(
            registry.get_or_create("store", None).config().reset_timeout,
            Duration::from_secs(3)
        );
    }

    #[tokio::test]
    async fn test_remove_stops_monitor() {
        let registry = CircuitBreakerRegistry::default();
        let breaker = registry.get_or_create("llm", None);

        assert!(registry.remove("llm"));
        assert!(!breaker.is_monitoring());
        assert!(!registry.remove("llm"));
        assert!(registry.get("llm").is_none());
    }

    #[tokio::test]
    async fn test_force_open_all_and_reset_all() {
        let registry = CircuitBreakerRegistry::default();
        registry.get_or_create("a", None);
        registry.get_or_create("b", None);

        registry.force_open_all();
        assert_eq!(registry.get_state_summary()[&CircuitState::Open], 2);
        assert_eq!(registry.system_health_score(), 0.0);

        registry.reset_all();
        assert_eq!(registry.get_state_summary()[&CircuitState::Closed], 2);
    }
}
