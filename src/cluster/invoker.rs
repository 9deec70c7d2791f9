//! The retry/failover invocation loop.

use super::balancer::{Candidate, LoadBalancer, ShortestResponseBalancer};
use super::{ClusterAdapter, Endpoint, OutboundInvocation};
use crate::counter::maintenance::{CounterMaintenance, LiveEndpoints};
use crate::counter::{Counter, CounterRegistry, CounterStats, ServiceCounter};
use crate::failover::{split_address, AddressFailover, AddressTable};
use crate::policy::{ClusterInvokerType, ClusterPolicy, GovernanceConfig, PolicyRegistry};
use crate::resilience::{
    CircuitBreaker, CircuitBreakerListener, CircuitBreakerRegistry, CircuitBreakerSnapshot,
    RateLimiter, RateLimiterSnapshot,
};
use crate::{Error, ErrorContext, RejectKind, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Read-only view of one (endpoint, operation) pair.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub service: String,
    pub endpoint: String,
    pub operation: String,
    pub counter: CounterStats,
    /// Absent when no breaker has been created for the endpoint.
    pub breaker: Option<CircuitBreakerSnapshot>,
    pub broken: bool,
}

/// Last routed endpoint ids per service; feeds counter cleanup.
#[derive(Debug, Default)]
struct RouteBook {
    routes: RwLock<HashMap<String, HashSet<String>>>,
}

impl RouteBook {
    fn record(&self, service: &str, endpoints: &[Endpoint]) {
        let unchanged = |routes: &HashMap<String, HashSet<String>>| {
            routes.get(service).is_some_and(|known| {
                known.len() == endpoints.len() && endpoints.iter().all(|e| known.contains(&e.id))
            })
        };
        if unchanged(&self.routes.read().unwrap_or_else(|e| e.into_inner())) {
            return;
        }
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        if !unchanged(&routes) {
            let ids = endpoints.iter().map(|e| e.id.clone()).collect();
            routes.insert(service.to_string(), ids);
        }
    }
}

impl LiveEndpoints for RouteBook {
    fn live_endpoints(&self, service: &str) -> Option<HashSet<String>> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(service)
            .cloned()
    }
}

enum Step<T> {
    Done(T),
    Cancelled,
    TimedOut,
}

/// Releases an admitted slot when the attempt ends without an outcome.
struct CallGuard<'a> {
    counter: &'a Counter,
    permit: Option<&'a CircuitBreaker>,
    armed: bool,
}

impl CallGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.counter.release();
            if let Some(breaker) = self.permit {
                breaker.release_permission();
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending::<()>().await,
    }
}

/// Estimate inflated while the endpoint's breaker is warming up.
fn effective_estimate(estimate: u64, recovery_factor: f64) -> u64 {
    if recovery_factor >= 1.0 {
        return estimate;
    }
    (estimate.max(1) as f64 / recovery_factor).ceil() as u64
}

pub struct ClusterInvokerBuilder<A: ClusterAdapter> {
    adapter: Arc<A>,
    counters: Option<Arc<CounterRegistry>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    balancer: Arc<dyn LoadBalancer>,
    policies: Option<Arc<PolicyRegistry>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    failover: Option<Arc<dyn AddressFailover>>,
    listeners: Vec<Arc<dyn CircuitBreakerListener>>,
}

impl<A: ClusterAdapter> ClusterInvokerBuilder<A> {
    pub fn new(adapter: Arc<A>) -> Self {
        Self {
            adapter,
            counters: None,
            breakers: None,
            balancer: Arc::new(ShortestResponseBalancer),
            policies: None,
            rate_limiter: None,
            failover: None,
            listeners: Vec::new(),
        }
    }

    /// Apply a loaded configuration document: counter timings, policies,
    /// rate limit and address table.
    pub fn with_config(mut self, config: &GovernanceConfig) -> Result<Self> {
        self.counters = Some(Arc::new(CounterRegistry::with_config(config.counter.clone())));
        self.policies = Some(Arc::new(PolicyRegistry::from_config(config)?));
        self.rate_limiter = config
            .rate_limit
            .clone()
            .map(|cfg| Arc::new(RateLimiter::new(cfg)));
        if !config.addresses.is_empty() {
            self.failover = Some(Arc::new(AddressTable::new(config.addresses.clone())));
        }
        Ok(self)
    }

    /// Share counters with other invokers.
    pub fn with_counters(mut self, counters: Arc<CounterRegistry>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn with_balancer(mut self, balancer: Arc<dyn LoadBalancer>) -> Self {
        self.balancer = balancer;
        self
    }

    pub fn with_policies(mut self, policies: Arc<PolicyRegistry>) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_address_failover(mut self, failover: Arc<dyn AddressFailover>) -> Self {
        self.failover = Some(failover);
        self
    }

    pub fn with_breaker_listener(mut self, listener: Arc<dyn CircuitBreakerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> ClusterInvoker<A> {
        let breakers = self.breakers.unwrap_or_default();
        for listener in self.listeners {
            breakers.register_listener(listener);
        }
        ClusterInvoker {
            adapter: self.adapter,
            counters: self.counters.unwrap_or_default(),
            breakers,
            balancer: self.balancer,
            policies: self.policies,
            rate_limiter: self.rate_limiter,
            failover: self.failover,
            routes: Arc::new(RouteBook::default()),
            sticky: RwLock::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        }
    }
}

/// Governs outbound calls of one adapter.
///
/// Shared across tasks; every piece of per-call state lives in the
/// [`OutboundInvocation`]. Attempts of one invocation are strictly
/// sequential.
pub struct ClusterInvoker<A: ClusterAdapter> {
    adapter: Arc<A>,
    counters: Arc<CounterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    balancer: Arc<dyn LoadBalancer>,
    policies: Option<Arc<PolicyRegistry>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    failover: Option<Arc<dyn AddressFailover>>,
    routes: Arc<RouteBook>,
    sticky: RwLock<HashMap<String, String>>,
    destroyed: AtomicBool,
}

impl<A: ClusterAdapter> ClusterInvoker<A> {
    pub fn builder(adapter: A) -> ClusterInvokerBuilder<A> {
        ClusterInvokerBuilder::new(Arc::new(adapter))
    }

    pub fn new(adapter: A) -> Self {
        Self::builder(adapter).build()
    }

    pub fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    pub fn counters(&self) -> &Arc<CounterRegistry> {
        &self.counters
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Build the per-call context, resolving the policy when none is given:
    /// configured policy for (service, path), then the adapter default.
    pub fn invocation(
        &self,
        request: A::Request,
        policy: Option<ClusterPolicy>,
    ) -> OutboundInvocation<A::Request> {
        let service = self.adapter.service(&request);
        let operation = self.adapter.operation(&request);
        let policy = match policy {
            Some(p) => Arc::new(p),
            None => self
                .policies
                .as_ref()
                .and_then(|r| r.lookup(&service, &operation.path))
                .unwrap_or_else(|| Arc::new(self.adapter.default_policy(&request))),
        };
        OutboundInvocation::new(request, policy, service, operation)
    }

    pub async fn execute(
        &self,
        request: A::Request,
        policy: Option<ClusterPolicy>,
    ) -> Result<A::Response> {
        let mut invocation = self.invocation(request, policy);
        self.execute_with(&mut invocation, &CancellationToken::new())
            .await
    }

    /// Run the pipeline for a prepared invocation.
    ///
    /// Firing `cancel` stops further attempts; an attempt not yet issued
    /// leaves counters and breakers untouched.
    pub async fn execute_with(
        &self,
        inv: &mut OutboundInvocation<A::Request>,
        cancel: &CancellationToken,
    ) -> Result<A::Response> {
        if self.is_destroyed() {
            return Err(self.reject(inv, RejectKind::Unready, "cluster has been destroyed"));
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(limiter) = &self.rate_limiter {
            if !limiter.try_acquire().await {
                return Err(self.reject(inv, RejectKind::RateLimit, "cluster rate limit exceeded"));
            }
        }

        let endpoints = self.route(inv).await?;
        let policy = Arc::clone(inv.policy());
        let retry = policy.retry_policy.clone().unwrap_or_default();
        let deadline = policy.timeout().and_then(|t| inv.started_at().checked_add(t));
        let service = self.counters.service(inv.service());
        let op_key = inv.operation().key();
        let mut denied: Option<RejectKind> = None;
        let mut last_error: Option<Error> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                return Err(self.timed_out(inv, last_error));
            }

            // FILTER
            let now = Instant::now();
            let (healthy, broken): (Vec<&Endpoint>, Vec<&Endpoint>) = endpoints
                .iter()
                .filter(|e| !inv.is_excluded(&e.id))
                .partition(|e| !self.breakers.is_broken(inv.service(), &e.id, now));
            let (candidates, forced) = if !healthy.is_empty() {
                (healthy, false)
            } else if policy.allow_broken_fallback && !broken.is_empty() {
                debug!(
                    service = inv.service(),
                    broken = broken.len(),
                    "no healthy endpoint left, falling back to broken ones"
                );
                (broken, true)
            } else {
                return Err(match last_error {
                    Some(source) => self.exhausted(inv, source),
                    None => self.reject(
                        inv,
                        denied.unwrap_or(RejectKind::NoProvider),
                        "no endpoint available",
                    ),
                });
            };

            // SELECT
            let chosen = self.select(inv, &candidates, &service, &op_key).clone();

            // GATE
            let counter = service.endpoint(&chosen.id).counter(&op_key);
            if !counter.begin(policy.max_concurrency) {
                debug!(
                    service = inv.service(),
                    endpoint = chosen.id.as_str(),
                    "endpoint at concurrency ceiling"
                );
                inv.skipped.push(chosen.id.clone());
                denied = Some(RejectKind::Limit);
                continue;
            }
            let breaker = self.breakers.get_or_create(
                inv.service(),
                &chosen.id,
                policy.circuit_breaker.as_ref(),
            );
            let permit = match &breaker {
                Some(b) if !forced => {
                    if !b.acquire() {
                        counter.release();
                        debug!(
                            service = inv.service(),
                            endpoint = chosen.id.as_str(),
                            "circuit breaker refused permit"
                        );
                        inv.skipped.push(chosen.id.clone());
                        denied = Some(RejectKind::CircuitBreak);
                        continue;
                    }
                    Some(&**b)
                }
                _ => None,
            };

            // INVOKE
            inv.attempts += 1;
            inv.endpoint = Some(chosen.clone());
            let mut guard = CallGuard {
                counter: &*counter,
                permit,
                armed: true,
            };
            let started = Instant::now();
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                _ = sleep_until(deadline) => Step::TimedOut,
                r = self.adapter.invoke(inv.request(), &chosen) => Step::Done(r),
            };
            let elapsed = started.elapsed();

            // CLASSIFY
            let err = match step {
                Step::Cancelled => return Err(Error::Cancelled),
                Step::TimedOut => return Err(self.timed_out(inv, last_error)),
                Step::Done(Ok(resp)) => {
                    counter.end(elapsed, true);
                    guard.disarm();
                    if let Some(b) = &breaker {
                        b.on_success(elapsed);
                    }
                    if policy.sticky {
                        self.remember_sticky(inv, &chosen.id);
                    }
                    debug!(
                        service = inv.service(),
                        endpoint = chosen.id.as_str(),
                        attempt = inv.attempts,
                        duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                        "outbound call succeeded"
                    );
                    return Ok(resp);
                }
                Step::Done(Err(err)) => err,
            };
            counter.end(elapsed, false);
            guard.disarm();
            if let Some(b) = &breaker {
                b.on_error(elapsed, &err);
            }
            inv.attempted.push(chosen.id.clone());
            inv.last_failure = Some(err.to_string());

            // RETRY / FAIL
            let retryable = self.adapter.is_retryable(&err)
                || retry.is_retryable_error(
                    self.adapter.error_code(&err).as_deref(),
                    self.adapter.error_name(&err).as_deref(),
                );
            let eligible = retryable
                && policy.invoke_type == ClusterInvokerType::Failover
                && retry.retry > 0
                && retry.is_retryable_method(inv.operation().method.as_deref());
            let error = self
                .adapter
                .create_exception(err, inv.request(), &chosen, retryable);
            if !eligible {
                debug!(
                    service = inv.service(),
                    endpoint = chosen.id.as_str(),
                    attempt = inv.attempts,
                    retryable,
                    "outbound call failed, not retrying"
                );
                return Err(error);
            }
            if !retry.allows(inv.attempts) {
                return Err(self.exhausted(inv, error));
            }
            debug!(
                service = inv.service(),
                endpoint = chosen.id.as_str(),
                attempt = inv.attempts,
                duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                "retrying outbound call on another endpoint"
            );
            last_error = Some(error);

            let interval = retry.interval();
            if !interval.is_zero() {
                let pause = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Step::Cancelled,
                    _ = sleep_until(deadline) => Step::TimedOut,
                    _ = tokio::time::sleep(interval) => Step::Done(()),
                };
                match pause {
                    Step::Cancelled => return Err(Error::Cancelled),
                    Step::TimedOut => return Err(self.timed_out(inv, last_error)),
                    Step::Done(()) => {}
                }
            }
        }
    }

    async fn route(&self, inv: &OutboundInvocation<A::Request>) -> Result<Vec<Endpoint>> {
        let mut endpoints = self.adapter.route(inv.request()).await?;
        if let Some(failover) = &self.failover {
            for endpoint in &mut endpoints {
                let Some(target) = failover.failover(&endpoint.address()) else {
                    continue;
                };
                match split_address(&target) {
                    Some((host, port)) => {
                        endpoint.host = host;
                        endpoint.port = port;
                    }
                    None => warn!(
                        endpoint = endpoint.id.as_str(),
                        target = target.as_str(),
                        "ignoring malformed failover address"
                    ),
                }
            }
        }
        self.routes.record(inv.service(), &endpoints);
        Ok(endpoints)
    }

    fn select<'a>(
        &self,
        inv: &OutboundInvocation<A::Request>,
        candidates: &[&'a Endpoint],
        service: &ServiceCounter,
        op_key: &str,
    ) -> &'a Endpoint {
        if inv.policy().sticky {
            if let Some(id) = self.sticky_target(inv) {
                if let Some(ep) = candidates.iter().find(|e| e.id == id) {
                    let permits = self
                        .breakers
                        .get(inv.service(), &id)
                        .map(|b| b.is_call_permitted())
                        .unwrap_or(true);
                    if permits {
                        return *ep;
                    }
                }
            }
        }

        let scored: Vec<Candidate<'a>> = candidates
            .iter()
            .map(|&endpoint| {
                let estimate = service
                    .get_endpoint(&endpoint.id)
                    .and_then(|e| e.get_counter(op_key))
                    .map(|c| c.estimate_response())
                    .unwrap_or(0);
                let factor = self
                    .breakers
                    .get(inv.service(), &endpoint.id)
                    .map(|b| b.recovery_factor())
                    .unwrap_or(1.0);
                Candidate {
                    endpoint,
                    estimate: effective_estimate(estimate, factor),
                }
            })
            .collect();
        let idx = self.balancer.select(&scored).unwrap_or(0).min(scored.len() - 1);
        scored[idx].endpoint
    }

    fn sticky_target(&self, inv: &OutboundInvocation<A::Request>) -> Option<String> {
        inv.sticky_id().map(str::to_string).or_else(|| {
            self.sticky
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(inv.service())
                .cloned()
        })
    }

    fn remember_sticky(&self, inv: &mut OutboundInvocation<A::Request>, endpoint_id: &str) {
        inv.sticky_id = Some(endpoint_id.to_string());
        self.sticky
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(inv.service().to_string(), endpoint_id.to_string());
    }

    fn reject(
        &self,
        inv: &OutboundInvocation<A::Request>,
        kind: RejectKind,
        message: &str,
    ) -> Error {
        warn!(
            service = inv.service(),
            path = inv.operation().path.as_str(),
            reason = %kind,
            "outbound call rejected"
        );
        Error::reject_with_context(
            kind,
            message,
            ErrorContext::new()
                .with_service(inv.service())
                .with_details(inv.operation().key())
                .with_source("cluster_invoker"),
        )
    }

    fn exhausted(&self, inv: &OutboundInvocation<A::Request>, source: Error) -> Error {
        warn!(
            service = inv.service(),
            attempts = inv.attempts,
            attempted = ?inv.attempted(),
            "retry exhausted"
        );
        Error::RetryExhausted {
            attempts: inv.attempts,
            source: Box::new(source),
        }
    }

    fn timed_out(&self, inv: &OutboundInvocation<A::Request>, last: Option<Error>) -> Error {
        let elapsed_ms = u64::try_from(inv.elapsed().as_millis()).unwrap_or(u64::MAX);
        warn!(
            service = inv.service(),
            attempts = inv.attempts,
            elapsed_ms,
            "retry timeout"
        );
        Error::RetryTimeout {
            attempts: inv.attempts,
            elapsed_ms,
            source: last.map(Box::new),
        }
    }

    /// Refuse all further calls with [`RejectKind::Unready`].
    pub fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            self.sticky
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
            info!(balancer = self.balancer.name(), "cluster invoker destroyed");
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Counter and breaker figures of every endpoint seen for `service`.
    /// Reading them mutates nothing.
    pub fn endpoint_stats(&self, service: &str) -> Vec<EndpointStats> {
        let Some(sc) = self.counters.get_service(service) else {
            return Vec::new();
        };
        let now = Instant::now();
        let mut stats = Vec::new();
        for endpoint in sc.endpoints() {
            let breaker = self
                .breakers
                .get(service, endpoint.id())
                .map(|b| b.snapshot());
            let broken = self.breakers.is_broken(service, endpoint.id(), now);
            for (operation, counter) in endpoint.counters() {
                stats.push(EndpointStats {
                    service: service.to_string(),
                    endpoint: endpoint.id().to_string(),
                    operation,
                    counter: counter.stats(),
                    breaker: breaker.clone(),
                    broken,
                });
            }
        }
        stats.sort_by(|a, b| (&a.endpoint, &a.operation).cmp(&(&b.endpoint, &b.operation)));
        stats
    }

    /// Bucket level of the cluster-wide rate limiter, if one is configured.
    pub async fn rate_limit_snapshot(&self) -> Option<RateLimiterSnapshot> {
        match &self.rate_limiter {
            Some(limiter) => Some(limiter.snapshot().await),
            None => None,
        }
    }

    /// Maintenance over this invoker's counters, evicting endpoints that
    /// dropped out of routing.
    pub fn maintenance(&self) -> CounterMaintenance {
        CounterMaintenance::new(Arc::clone(&self.counters))
            .with_live_endpoints(self.routes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_estimate_inflates_while_recovering() {
        assert_eq!(effective_estimate(40, 1.0), 40);
        assert_eq!(effective_estimate(40, 0.5), 80);
        // an idle endpoint still loses to a warm one while recovering
        assert_eq!(effective_estimate(0, 0.1), 10);
    }

    #[test]
    fn test_route_book_tracks_last_routing() {
        let book = RouteBook::default();
        assert!(book.live_endpoints("order").is_none());
        book.record("order", &[Endpoint::new("a", 1), Endpoint::new("b", 2)]);
        book.record("order", &[Endpoint::new("b", 2)]);
        let live = book.live_endpoints("order").unwrap();
        assert_eq!(live.len(), 1);
        assert!(live.contains("b:2"));
    }

    #[test]
    fn test_route_book_replaces_only_on_change() {
        let book = RouteBook::default();
        book.record("order", &[Endpoint::new("a", 1), Endpoint::new("b", 2)]);
        book.record("order", &[Endpoint::new("b", 2), Endpoint::new("a", 1)]);
        assert_eq!(book.live_endpoints("order").unwrap().len(), 2);

        // same size, different member
        book.record("order", &[Endpoint::new("a", 1), Endpoint::new("c", 3)]);
        let live = book.live_endpoints("order").unwrap();
        assert!(live.contains("c:3"));
        assert!(!live.contains("b:2"));
    }
}
