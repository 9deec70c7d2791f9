//! Per-endpoint breakers and the broken-endpoint set fed by their transitions.

use super::circuit_breaker::{
    CircuitBreaker, CircuitBreakerListener, CircuitBreakerPolicy, CircuitBreakerState,
    CircuitBreakerStateEvent,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

type EndpointKey = (String, String);

fn key(service: &str, endpoint: &str) -> EndpointKey {
    (service.to_string(), endpoint.to_string())
}

/// Endpoints excluded from selection until a deadline.
///
/// Selection consults this set instead of calling `acquire()` on every
/// candidate; entries simply expire once their deadline passes.
#[derive(Debug, Default)]
pub struct BrokenEndpoints {
    until: RwLock<HashMap<EndpointKey, Instant>>,
}

impl BrokenEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, service: &str, endpoint: &str, until: Instant) {
        self.until
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key(service, endpoint), until);
    }

    pub fn unmark(&self, service: &str, endpoint: &str) {
        self.until
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key(service, endpoint));
    }

    pub fn is_broken(&self, service: &str, endpoint: &str, now: Instant) -> bool {
        self.until
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key(service, endpoint))
            .map(|until| now < *until)
            .unwrap_or(false)
    }

    /// Endpoints of `service` still broken at `now`.
    pub fn broken(&self, service: &str, now: Instant) -> Vec<String> {
        self.until
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|((s, _), until)| s == service && now < **until)
            .map(|((_, e), _)| e.clone())
            .collect()
    }
}

impl CircuitBreakerListener for BrokenEndpoints {
    fn on_state_change(&self, event: &CircuitBreakerStateEvent) {
        match (event.to, event.wait_until) {
            (CircuitBreakerState::Open, Some(until)) => {
                self.mark(&event.service, &event.endpoint, until)
            }
            (CircuitBreakerState::Open, None) => {}
            _ => self.unmark(&event.service, &event.endpoint),
        }
    }
}

/// Breakers keyed by (service, endpoint), created on first use.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<EndpointKey, Arc<CircuitBreaker>>>,
    broken: Arc<BrokenEndpoints>,
    listeners: RwLock<Vec<Arc<dyn CircuitBreakerListener>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            broken: Arc::new(BrokenEndpoints::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Listener attached to every breaker created from now on.
    pub fn register_listener(&self, listener: Arc<dyn CircuitBreakerListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn broken(&self) -> &Arc<BrokenEndpoints> {
        &self.broken
    }

    pub fn is_broken(&self, service: &str, endpoint: &str, now: Instant) -> bool {
        self.broken.is_broken(service, endpoint, now)
    }

    /// Breaker for the endpoint under `policy`.
    ///
    /// Returns `None` when no policy applies or it is disabled. A breaker
    /// built from a different policy is replaced, which starts it closed.
    pub fn get_or_create(
        &self,
        service: &str,
        endpoint: &str,
        policy: Option<&CircuitBreakerPolicy>,
    ) -> Option<Arc<CircuitBreaker>> {
        let policy = policy.filter(|p| p.enabled)?;
        let k = key(service, endpoint);
        if let Some(existing) = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&k)
        {
            if existing.policy() == policy {
                return Some(Arc::clone(existing));
            }
        }

        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = breakers.get(&k) {
            if existing.policy() == policy {
                return Some(Arc::clone(existing));
            }
        }
        let breaker = Arc::new(CircuitBreaker::for_endpoint(
            service,
            endpoint,
            policy.clone(),
        ));
        breaker.register_listener(self.broken.clone());
        for listener in self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            breaker.register_listener(Arc::clone(listener));
        }
        if breakers.insert(k, Arc::clone(&breaker)).is_some() {
            self.broken.unmark(service, endpoint);
        }
        Some(breaker)
    }

    pub fn get(&self, service: &str, endpoint: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key(service, endpoint))
            .cloned()
    }

    pub fn remove(&self, service: &str, endpoint: &str) -> Option<Arc<CircuitBreaker>> {
        self.broken.unmark(service, endpoint);
        self.breakers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key(service, endpoint))
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
