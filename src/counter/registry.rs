//! Two-level counter registry: service → endpoint → operation.

use super::{Counter, CounterConfig};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::debug;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn millis_since(epoch: Instant, now: Instant) -> u64 {
    u64::try_from(now.saturating_duration_since(epoch).as_millis()).unwrap_or(u64::MAX)
}

/// Looks up `key`, inserting `make()` only if no other writer got there first.
fn get_or_insert<V>(
    map: &RwLock<HashMap<String, Arc<V>>>,
    key: &str,
    make: impl FnOnce() -> V,
) -> Arc<V> {
    if let Some(v) = read(map).get(key) {
        return Arc::clone(v);
    }
    let mut guard = write(map);
    Arc::clone(
        guard
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(make())),
    )
}

/// Owns every [`ServiceCounter`] of one embedding process.
///
/// Constructed explicitly and shared through `Arc`; there is no global instance.
#[derive(Debug)]
pub struct CounterRegistry {
    config: CounterConfig,
    epoch: Instant,
    services: RwLock<HashMap<String, Arc<ServiceCounter>>>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::with_config(CounterConfig::default())
    }

    pub fn with_config(config: CounterConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            services: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CounterConfig {
        &self.config
    }

    /// Get or create the counters of `service`.
    pub fn service(&self, service: &str) -> Arc<ServiceCounter> {
        get_or_insert(&self.services, service, || {
            ServiceCounter::new(
                service,
                self.epoch,
                self.config.jittered_snapshot_interval(),
            )
        })
    }

    /// Existing counters of `service`, without creating them.
    pub fn get_service(&self, service: &str) -> Option<Arc<ServiceCounter>> {
        read(&self.services).get(service).cloned()
    }

    pub fn services(&self) -> Vec<Arc<ServiceCounter>> {
        read(&self.services).values().cloned().collect()
    }

    /// Drop every counter of `service`.
    pub fn remove_service(&self, service: &str) -> Option<Arc<ServiceCounter>> {
        write(&self.services).remove(service)
    }
}

impl Default for CounterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters of one logical service, one [`EndpointCounter`] per backend instance.
#[derive(Debug)]
pub struct ServiceCounter {
    name: String,
    epoch: Instant,
    snapshot_period: Duration,
    next_snapshot_ms: AtomicU64,
    last_cleanup_ms: AtomicU64,
    cleaning: AtomicBool,
    endpoints: RwLock<HashMap<String, Arc<EndpointCounter>>>,
}

impl ServiceCounter {
    fn new(name: &str, epoch: Instant, snapshot_period: Duration) -> Self {
        let now = millis_since(epoch, Instant::now());
        let period_ms = u64::try_from(snapshot_period.as_millis()).unwrap_or(u64::MAX);
        Self {
            name: name.to_string(),
            epoch,
            snapshot_period,
            next_snapshot_ms: AtomicU64::new(now.saturating_add(period_ms)),
            last_cleanup_ms: AtomicU64::new(now),
            cleaning: AtomicBool::new(false),
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The jittered rotation period assigned to this service.
    pub fn snapshot_period(&self) -> Duration {
        self.snapshot_period
    }

    /// Get or create the counters of `endpoint_id`, refreshing its access time.
    pub fn endpoint(&self, endpoint_id: &str) -> Arc<EndpointCounter> {
        let endpoint = get_or_insert(&self.endpoints, endpoint_id, || {
            EndpointCounter::new(endpoint_id, self.epoch)
        });
        endpoint.touch(Instant::now());
        endpoint
    }

    /// Existing counters of `endpoint_id`; does not refresh the access time.
    pub fn get_endpoint(&self, endpoint_id: &str) -> Option<Arc<EndpointCounter>> {
        read(&self.endpoints).get(endpoint_id).cloned()
    }

    pub fn endpoints(&self) -> Vec<Arc<EndpointCounter>> {
        read(&self.endpoints).values().cloned().collect()
    }

    pub fn endpoint_count(&self) -> usize {
        read(&self.endpoints).len()
    }

    /// Rotate the snapshot of every counter of this service.
    pub fn snapshot_all(&self) {
        for endpoint in self.endpoints() {
            endpoint.snapshot_all();
        }
    }

    /// Rotate snapshots if this service's period has elapsed at `now`.
    pub fn rotate_if_due(&self, now: Instant) -> bool {
        let now_ms = millis_since(self.epoch, now);
        let due = self.next_snapshot_ms.load(Ordering::Acquire);
        if now_ms < due {
            return false;
        }
        let period_ms = u64::try_from(self.snapshot_period.as_millis()).unwrap_or(u64::MAX);
        // Only the caller that moves the deadline forward does the rotation.
        if self
            .next_snapshot_ms
            .compare_exchange(
                due,
                now_ms.saturating_add(period_ms),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        self.snapshot_all();
        true
    }

    /// Evict counters of endpoints that left `live` and have been idle for
    /// at least `config.keep_time()`.
    ///
    /// Runs only when `config.cleanup_interval()` has elapsed since the last
    /// run and some registered endpoint is actually missing from `live`; a
    /// CAS guard keeps concurrent callers from overlapping. Returns the
    /// number of evicted endpoints.
    pub fn try_cleanup(&self, live: &HashSet<String>, config: &CounterConfig, now: Instant) -> usize {
        let now_ms = millis_since(self.epoch, now);
        let last = self.last_cleanup_ms.load(Ordering::Acquire);
        let interval_ms = u64::try_from(config.cleanup_interval().as_millis()).unwrap_or(u64::MAX);
        if now_ms.saturating_sub(last) < interval_ms {
            return 0;
        }
        let any_gone = read(&self.endpoints).keys().any(|id| !live.contains(id));
        if !any_gone {
            return 0;
        }
        if self
            .cleaning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }

        let keep = config.keep_time();
        let removed = {
            let mut endpoints = write(&self.endpoints);
            let before = endpoints.len();
            endpoints.retain(|id, counter| live.contains(id) || counter.idle(now) < keep);
            before - endpoints.len()
        };
        self.last_cleanup_ms.store(now_ms, Ordering::Release);
        self.cleaning.store(false, Ordering::Release);

        debug!(
            service = self.name.as_str(),
            removed,
            remaining = self.endpoint_count(),
            "endpoint counter cleanup finished"
        );
        removed
    }
}

/// Counters of one backend instance, one [`Counter`] per operation key.
#[derive(Debug)]
pub struct EndpointCounter {
    id: String,
    epoch: Instant,
    access_ms: AtomicU64,
    counters: RwLock<HashMap<String, Arc<Counter>>>,
}

impl EndpointCounter {
    fn new(id: &str, epoch: Instant) -> Self {
        Self {
            id: id.to_string(),
            epoch,
            access_ms: AtomicU64::new(millis_since(epoch, Instant::now())),
            counters: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get or create the counter for `operation_key`, refreshing the access time.
    pub fn counter(&self, operation_key: &str) -> Arc<Counter> {
        self.touch(Instant::now());
        get_or_insert(&self.counters, operation_key, Counter::new)
    }

    /// Existing counter for `operation_key`; does not refresh the access time.
    pub fn get_counter(&self, operation_key: &str) -> Option<Arc<Counter>> {
        read(&self.counters).get(operation_key).cloned()
    }

    /// All (operation key, counter) pairs.
    pub fn counters(&self) -> Vec<(String, Arc<Counter>)> {
        read(&self.counters)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    pub fn snapshot_all(&self) {
        for counter in read(&self.counters).values() {
            counter.snapshot();
        }
    }

    pub(crate) fn touch(&self, now: Instant) {
        self.access_ms
            .fetch_max(millis_since(self.epoch, now), Ordering::AcqRel);
    }

    /// Time since the last lookup.
    pub fn idle(&self, now: Instant) -> Duration {
        let now_ms = millis_since(self.epoch, now);
        Duration::from_millis(now_ms.saturating_sub(self.access_ms.load(Ordering::Acquire)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn config(cleanup_ms: u64, keep_ms: u64) -> CounterConfig {
        CounterConfig {
            cleanup_interval_ms: cleanup_ms,
            keep_time_ms: keep_ms,
            ..CounterConfig::default()
        }
    }

    #[test]
    fn test_lookup_returns_same_instances() {
        let registry = CounterRegistry::new();
        let a = registry.service("order").endpoint("10.0.0.1:80").counter("/create");
        let b = registry.service("order").endpoint("10.0.0.1:80").counter("/create");
        assert!(Arc::ptr_eq(&a, &b));

        let other = registry.service("order").endpoint("10.0.0.2:80").counter("/create");
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(registry.service("order").endpoint_count(), 2);
    }

    #[test]
    fn test_get_does_not_create() {
        let registry = CounterRegistry::new();
        assert!(registry.get_service("order").is_none());
        let service = registry.service("order");
        assert!(service.get_endpoint("a").is_none());
        service.endpoint("a");
        assert!(service.get_endpoint("a").is_some());
        assert!(service.get_endpoint("a").unwrap().get_counter("/x").is_none());
    }

    #[test]
    fn test_cleanup_evicts_only_gone_and_idle() {
        let registry = CounterRegistry::new();
        let service = registry.service("order");
        service.endpoint("a");
        service.endpoint("b");
        service.endpoint("c");

        let later = Instant::now() + Duration::from_secs(120);
        let removed = service.try_cleanup(&live(&["a"]), &config(0, 60_000), later);
        assert_eq!(removed, 2);
        assert!(service.get_endpoint("a").is_some());
        assert!(service.get_endpoint("b").is_none());
    }

    #[test]
    fn test_cleanup_keeps_recently_accessed() {
        let registry = CounterRegistry::new();
        let service = registry.service("order");
        service.endpoint("a");
        service.endpoint("b");

        let now = Instant::now() + Duration::from_millis(10);
        let removed = service.try_cleanup(&live(&["a"]), &config(0, 60_000), now);
        assert_eq!(removed, 0);
        assert_eq!(service.endpoint_count(), 2);
    }

    #[test]
    fn test_cleanup_debounced_by_interval() {
        let registry = CounterRegistry::new();
        let service = registry.service("order");
        service.endpoint("a");

        let soon = Instant::now() + Duration::from_secs(1);
        assert_eq!(service.try_cleanup(&live(&[]), &config(60_000, 0), soon), 0);
        assert_eq!(service.endpoint_count(), 1);

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(service.try_cleanup(&live(&[]), &config(60_000, 0), later), 1);
    }

    #[test]
    fn test_cleanup_skipped_when_nothing_gone() {
        let registry = CounterRegistry::new();
        let service = registry.service("order");
        service.endpoint("a");
        let later = Instant::now() + Duration::from_secs(600);
        assert_eq!(service.try_cleanup(&live(&["a"]), &config(0, 0), later), 0);
    }

    #[test]
    fn test_cleanup_guard_blocks_overlap() {
        let registry = CounterRegistry::new();
        let service = registry.service("order");
        service.endpoint("a");
        service.cleaning.store(true, Ordering::Release);
        let later = Instant::now() + Duration::from_secs(600);
        assert_eq!(service.try_cleanup(&live(&[]), &config(0, 0), later), 0);
        assert_eq!(service.endpoint_count(), 1);
    }

    #[test]
    fn test_rotate_if_due() {
        let registry = CounterRegistry::new();
        let service = registry.service("order");
        let counter = service.endpoint("a").counter("/x");
        counter.begin(0);
        counter.end(Duration::from_millis(50), true);
        assert_eq!(counter.estimate_response(), 50);

        assert!(!service.rotate_if_due(Instant::now()));
        assert_eq!(counter.estimate_response(), 50);

        let later = Instant::now() + service.snapshot_period() + Duration::from_millis(5);
        assert!(service.rotate_if_due(later));
        assert_eq!(counter.estimate_response(), 0);
        // next deadline moved forward
        assert!(!service.rotate_if_due(later));
    }
}
