//! 计数器模块：按端点/操作统计并发、耗时与成功率，为负载均衡提供响应时间估计。
//!
//! # Counter Module
//!
//! Lock-free per-endpoint, per-operation call accounting.
//!
//! ## Overview
//!
//! Every outbound call is bracketed by [`Counter::begin`] and [`Counter::end`].
//! The counters feed two consumers:
//! - endpoint selection, through [`Counter::estimate_response`]
//! - observability, through [`Counter::stats`]
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Counter`] | Atomic accumulator for one (service, endpoint, operation) |
//! | [`CounterSnapshot`] | Immutable baseline for since-snapshot averages |
//! | [`registry`] | Two-level registry: service → endpoint → operation |
//! | [`maintenance`] | Background snapshot rotation and stale-endpoint cleanup |
//!
//! ```rust
//! use outbound_governance::counter::Counter;
//! use std::time::Duration;
//!
//! let counter = Counter::new();
//! if counter.begin(100) {
//!     // ... issue the call ...
//!     counter.end(Duration::from_millis(12), true);
//! }
//! assert_eq!(counter.total(), 1);
//! ```

pub mod maintenance;
pub mod registry;

pub use registry::{CounterRegistry, EndpointCounter, ServiceCounter};

use arc_swap::ArcSwap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimum observation window before a throughput figure is reported.
const MIN_TPS_WINDOW: Duration = Duration::from_millis(1000);

/// Builds the counter key for an operation: the path, optionally qualified by method.
pub fn operation_key(path: &str, method: Option<&str>) -> String {
    match method {
        Some(m) if !m.is_empty() => format!("{}#{}", path, m),
        _ => path.to_string(),
    }
}

/// Immutable capture of the success totals at rotation time.
#[derive(Debug, Clone)]
pub struct CounterSnapshot {
    succeeded: u64,
    succeeded_elapsed_ms: u64,
    taken_at: Instant,
}

impl CounterSnapshot {
    fn capture(counter: &Counter) -> Self {
        Self {
            succeeded: counter.succeeded(),
            succeeded_elapsed_ms: counter.succeeded_elapsed_ms(),
            taken_at: Instant::now(),
        }
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded
    }

    pub fn succeeded_elapsed_ms(&self) -> u64 {
        self.succeeded_elapsed_ms
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// Point-in-time, serializable view of a [`Counter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterStats {
    pub active: i64,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total_elapsed_ms: u64,
    pub failed_elapsed_ms: u64,
    pub max_elapsed_ms: u64,
    pub succeeded_max_elapsed_ms: u64,
    pub failed_max_elapsed_ms: u64,
    pub succeeded_average_elapsed_ms: u64,
    pub estimate_response_ms: u64,
}

/// Atomic call accumulator for one (service, endpoint, operation).
///
/// `total == succeeded + failed` holds for every observation: the succeeded
/// figures are derived rather than stored. `active` never goes negative and,
/// when [`begin`](Self::begin) is given a positive ceiling, never exceeds it.
#[derive(Debug)]
pub struct Counter {
    active: AtomicI64,
    total: AtomicU64,
    failed: AtomicU64,
    total_elapsed_ms: AtomicU64,
    failed_elapsed_ms: AtomicU64,
    max_elapsed_ms: AtomicU64,
    failed_max_elapsed_ms: AtomicU64,
    succeeded_max_elapsed_ms: AtomicU64,
    snapshot: ArcSwap<CounterSnapshot>,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            active: AtomicI64::new(0),
            total: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_elapsed_ms: AtomicU64::new(0),
            failed_elapsed_ms: AtomicU64::new(0),
            max_elapsed_ms: AtomicU64::new(0),
            failed_max_elapsed_ms: AtomicU64::new(0),
            succeeded_max_elapsed_ms: AtomicU64::new(0),
            snapshot: ArcSwap::from_pointee(CounterSnapshot {
                succeeded: 0,
                succeeded_elapsed_ms: 0,
                taken_at: Instant::now(),
            }),
        }
    }

    /// Try to admit one more in-flight call.
    ///
    /// `max_concurrency <= 0` means unbounded. Returns `false` without
    /// touching `active` when the ceiling (or the saturation sentinel
    /// `i64::MAX`) has been reached.
    pub fn begin(&self, max_concurrency: i64) -> bool {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current == i64::MAX || (max_concurrency > 0 && current >= max_concurrency) {
                return false;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Complete a call admitted by [`begin`](Self::begin).
    pub fn end(&self, elapsed: Duration, succeeded: bool) {
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.decrement_active();
        // failed is bumped before total so that a concurrent reader never
        // sees more successes than really happened.
        if !succeeded {
            self.failed.fetch_add(1, Ordering::AcqRel);
            self.failed_elapsed_ms.fetch_add(elapsed_ms, Ordering::AcqRel);
            update_max(&self.failed_max_elapsed_ms, elapsed_ms);
        }
        self.total.fetch_add(1, Ordering::AcqRel);
        self.total_elapsed_ms.fetch_add(elapsed_ms, Ordering::AcqRel);
        update_max(&self.max_elapsed_ms, elapsed_ms);
        if succeeded {
            update_max(&self.succeeded_max_elapsed_ms, elapsed_ms);
        }
    }

    /// Give back an admission whose call never produced an outcome
    /// (cancelled or timed out mid-flight). Only `active` changes.
    pub fn release(&self) {
        self.decrement_active();
    }

    fn decrement_active(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                if v > 0 {
                    Some(v - 1)
                } else {
                    None
                }
            });
    }

    /// Replace the since-snapshot baseline with the current success totals.
    pub fn snapshot(&self) {
        self.snapshot.store(Arc::new(CounterSnapshot::capture(self)));
    }

    /// Current since-snapshot baseline.
    pub fn current_snapshot(&self) -> Arc<CounterSnapshot> {
        self.snapshot.load_full()
    }

    pub fn active(&self) -> i64 {
        self.active.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }

    pub fn succeeded(&self) -> u64 {
        self.total().saturating_sub(self.failed())
    }

    pub fn total_elapsed_ms(&self) -> u64 {
        self.total_elapsed_ms.load(Ordering::Acquire)
    }

    pub fn failed_elapsed_ms(&self) -> u64 {
        self.failed_elapsed_ms.load(Ordering::Acquire)
    }

    pub fn succeeded_elapsed_ms(&self) -> u64 {
        self.total_elapsed_ms()
            .saturating_sub(self.failed_elapsed_ms())
    }

    pub fn max_elapsed_ms(&self) -> u64 {
        self.max_elapsed_ms.load(Ordering::Acquire)
    }

    pub fn failed_max_elapsed_ms(&self) -> u64 {
        self.failed_max_elapsed_ms.load(Ordering::Acquire)
    }

    pub fn succeeded_max_elapsed_ms(&self) -> u64 {
        self.succeeded_max_elapsed_ms.load(Ordering::Acquire)
    }

    /// Lifetime average latency of successful calls (ms), 0 before any success.
    pub fn succeeded_average_elapsed_ms(&self) -> u64 {
        average(self.succeeded_elapsed_ms(), self.succeeded())
    }

    /// Lifetime average latency of failed calls (ms), 0 before any failure.
    pub fn failed_average_elapsed_ms(&self) -> u64 {
        average(self.failed_elapsed_ms(), self.failed())
    }

    /// Average latency of successful calls since the last snapshot (ms).
    pub fn succeeded_average_elapsed_since_snapshot_ms(&self) -> u64 {
        let snap = self.snapshot.load();
        let succeeded = self.succeeded().saturating_sub(snap.succeeded);
        let elapsed = self
            .succeeded_elapsed_ms()
            .saturating_sub(snap.succeeded_elapsed_ms);
        average(elapsed, succeeded)
    }

    /// Response time a new request would observe if routed here (ms).
    ///
    /// Recent average latency scaled by the concurrency the request would
    /// join: `avg_since_snapshot * (active + 1)`. Returns 0 while no call has
    /// succeeded since the last snapshot.
    pub fn estimate_response(&self) -> u64 {
        let avg = self.succeeded_average_elapsed_since_snapshot_ms();
        if avg == 0 {
            return 0;
        }
        let concurrency = u64::try_from(self.active().max(0)).unwrap_or(0);
        avg.saturating_mul(concurrency.saturating_add(1))
    }

    /// Successful calls per second since the last snapshot.
    pub fn average_tps(&self) -> u64 {
        self.average_tps_at(Instant::now())
    }

    /// Same as [`average_tps`](Self::average_tps) evaluated at `now`.
    /// Windows shorter than one second report 0.
    pub fn average_tps_at(&self, now: Instant) -> u64 {
        let snap = self.snapshot.load();
        let window = now.saturating_duration_since(snap.taken_at);
        if window < MIN_TPS_WINDOW {
            return 0;
        }
        let succeeded = self.succeeded().saturating_sub(snap.succeeded);
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        succeeded.saturating_mul(1000) / window_ms
    }

    pub fn stats(&self) -> CounterStats {
        CounterStats {
            active: self.active(),
            total: self.total(),
            succeeded: self.succeeded(),
            failed: self.failed(),
            total_elapsed_ms: self.total_elapsed_ms(),
            failed_elapsed_ms: self.failed_elapsed_ms(),
            max_elapsed_ms: self.max_elapsed_ms(),
            succeeded_max_elapsed_ms: self.succeeded_max_elapsed_ms(),
            failed_max_elapsed_ms: self.failed_max_elapsed_ms(),
            succeeded_average_elapsed_ms: self.succeeded_average_elapsed_ms(),
            estimate_response_ms: self.estimate_response(),
        }
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

fn average(sum: u64, count: u64) -> u64 {
    if count == 0 {
        0
    } else {
        sum / count
    }
}

/// Raise `cell` to `value` if it is greater; retries until the CAS lands or
/// another writer has already stored something at least as large.
fn update_max(cell: &AtomicU64, value: u64) {
    let mut current = cell.load(Ordering::Acquire);
    while value > current {
        match cell.compare_exchange_weak(current, value, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

/// Timings for snapshot rotation and stale-counter eviction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    /// Lower bound of the per-service snapshot period.
    pub snapshot_interval_min_ms: u64,
    /// Upper bound (exclusive) of the per-service snapshot period.
    pub snapshot_interval_max_ms: u64,
    /// Minimum time between two cleanup runs of one service.
    pub cleanup_interval_ms: u64,
    /// How long a vanished endpoint's counters survive without access.
    pub keep_time_ms: u64,
    /// Granularity of the maintenance timer.
    pub tick_ms: u64,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_min_ms: 20_000,
            snapshot_interval_max_ms: 30_000,
            cleanup_interval_ms: 60_000,
            keep_time_ms: 300_000,
            tick_ms: 1_000,
        }
    }
}

impl CounterConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn keep_time(&self) -> Duration {
        Duration::from_millis(self.keep_time_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    /// Pick a period in `[min, max)` so services do not rotate in lockstep.
    pub fn jittered_snapshot_interval(&self) -> Duration {
        let min = self.snapshot_interval_min_ms;
        let max = self.snapshot_interval_max_ms;
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_begin_respects_ceiling() {
        let counter = Counter::new();
        assert!(counter.begin(2));
        assert!(counter.begin(2));
        assert!(!counter.begin(2));
        assert_eq!(counter.active(), 2);

        counter.end(Duration::from_millis(5), true);
        assert!(counter.begin(2));
    }

    #[test]
    fn test_begin_unbounded_never_rejects() {
        let counter = Counter::new();
        for _ in 0..1_000 {
            assert!(counter.begin(0));
        }
        for _ in 0..1_000 {
            assert!(counter.begin(-1));
        }
        assert_eq!(counter.active(), 2_000);
    }

    #[test]
    fn test_begin_rejects_at_saturation() {
        let counter = Counter::new();
        counter.active.store(i64::MAX, Ordering::Release);
        assert!(!counter.begin(0));
        assert_eq!(counter.active(), i64::MAX);
    }

    #[test]
    fn test_end_accounts_success_and_failure() {
        let counter = Counter::new();
        counter.begin(0);
        counter.begin(0);
        counter.begin(0);
        counter.end(Duration::from_millis(10), true);
        counter.end(Duration::from_millis(30), true);
        counter.end(Duration::from_millis(100), false);

        assert_eq!(counter.active(), 0);
        assert_eq!(counter.total(), 3);
        assert_eq!(counter.failed(), 1);
        assert_eq!(counter.succeeded(), 2);
        assert_eq!(counter.total(), counter.succeeded() + counter.failed());
        assert_eq!(counter.succeeded_elapsed_ms(), 40);
        assert_eq!(counter.succeeded_average_elapsed_ms(), 20);
        assert_eq!(counter.failed_average_elapsed_ms(), 100);
        assert_eq!(counter.max_elapsed_ms(), 100);
        assert_eq!(counter.succeeded_max_elapsed_ms(), 30);
        assert_eq!(counter.failed_max_elapsed_ms(), 100);
    }

    #[test]
    fn test_active_never_negative() {
        let counter = Counter::new();
        counter.end(Duration::from_millis(1), true);
        counter.release();
        assert_eq!(counter.active(), 0);
        assert_eq!(counter.total(), 1);
    }

    #[test]
    fn test_release_only_touches_active() {
        let counter = Counter::new();
        assert!(counter.begin(1));
        counter.release();
        assert_eq!(counter.active(), 0);
        assert_eq!(counter.total(), 0);
        assert!(counter.begin(1));
    }

    #[test]
    fn test_estimate_response_zero_without_success_since_snapshot() {
        let counter = Counter::new();
        assert_eq!(counter.estimate_response(), 0);

        counter.begin(0);
        counter.end(Duration::from_millis(40), true);
        assert_eq!(counter.estimate_response(), 40);

        counter.snapshot();
        assert_eq!(counter.estimate_response(), 0);

        counter.begin(0);
        counter.end(Duration::from_millis(10), false);
        assert_eq!(counter.estimate_response(), 0);
    }

    #[test]
    fn test_estimate_response_scales_with_concurrency() {
        let counter = Counter::new();
        counter.begin(0);
        counter.end(Duration::from_millis(20), true);
        counter.begin(0);
        counter.end(Duration::from_millis(40), true);
        // avg 30ms, 2 in flight + the new request
        counter.begin(0);
        counter.begin(0);
        assert_eq!(counter.estimate_response(), 90);
    }

    #[test]
    fn test_average_since_snapshot_ignores_history() {
        let counter = Counter::new();
        for _ in 0..10 {
            counter.begin(0);
            counter.end(Duration::from_millis(500), true);
        }
        counter.snapshot();
        counter.begin(0);
        counter.end(Duration::from_millis(10), true);
        assert_eq!(counter.succeeded_average_elapsed_since_snapshot_ms(), 10);
        assert_eq!(counter.succeeded_average_elapsed_ms(), 5010 / 11);
    }

    #[test]
    fn test_average_tps_requires_one_second_window() {
        let counter = Counter::new();
        for _ in 0..5 {
            counter.begin(0);
            counter.end(Duration::from_millis(1), true);
        }
        let taken_at = counter.current_snapshot().taken_at();
        assert_eq!(counter.average_tps_at(taken_at + Duration::from_millis(999)), 0);
        assert_eq!(counter.average_tps_at(taken_at + Duration::from_millis(2_500)), 2);
    }

    #[test]
    fn test_update_max_keeps_largest() {
        let cell = AtomicU64::new(10);
        update_max(&cell, 5);
        assert_eq!(cell.load(Ordering::Acquire), 10);
        update_max(&cell, 25);
        assert_eq!(cell.load(Ordering::Acquire), 25);
    }

    #[test]
    fn test_concurrent_begin_end_no_lost_updates() {
        let counter = Arc::new(Counter::new());
        let mut handles = vec![];
        for t in 0..8u64 {
            let c = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for i in 0..500u64 {
                    assert!(c.begin(0));
                    c.end(Duration::from_millis(t * 10 + i % 7), i % 5 != 0);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.total(), 4_000);
        assert_eq!(counter.failed(), 800);
        assert_eq!(counter.active(), 0);
        assert_eq!(counter.max_elapsed_ms(), 76);
    }

    #[test]
    fn test_operation_key() {
        assert_eq!(operation_key("/order/create", None), "/order/create");
        assert_eq!(operation_key("/order/create", Some("POST")), "/order/create#POST");
        assert_eq!(operation_key("/order/create", Some("")), "/order/create");
    }

    #[test]
    fn test_jittered_interval_collapses_to_min_without_spread() {
        let config = CounterConfig {
            snapshot_interval_min_ms: 500,
            snapshot_interval_max_ms: 500,
            ..CounterConfig::default()
        };
        assert_eq!(config.jittered_snapshot_interval(), Duration::from_millis(500));
        let inverted = CounterConfig {
            snapshot_interval_max_ms: 100,
            ..config
        };
        assert_eq!(inverted.jittered_snapshot_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_jittered_interval_in_range() {
        let config = CounterConfig::default();
        for _ in 0..100 {
            let d = config.jittered_snapshot_interval();
            assert!(d >= Duration::from_millis(20_000));
            assert!(d < Duration::from_millis(30_000));
        }
    }
}
