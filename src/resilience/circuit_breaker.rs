use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerState::Closed => write!(f, "closed"),
            CircuitBreakerState::HalfOpen => write!(f, "half_open"),
            CircuitBreakerState::Open => write!(f, "open"),
        }
    }
}

/// Immutable breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerPolicy {
    pub enabled: bool,
    /// Number of most recent outcomes evaluated while closed.
    pub sliding_window_size: u32,
    /// Outcomes required in the window before the rates are trusted.
    pub minimum_calls: u32,
    /// Failure percentage (0–100) at or above which the breaker opens.
    pub failure_rate_threshold: f32,
    /// Slow-call percentage (0–100) at or above which the breaker opens.
    pub slow_call_rate_threshold: f32,
    /// Calls at least this long count as slow.
    pub slow_call_duration_ms: u64,
    /// Time spent open before trial calls are let through.
    pub wait_duration_in_open_ms: u64,
    /// Trial calls admitted while half-open; the decision waits for all of them.
    pub permitted_calls_in_half_open: u32,
    /// Warm-up period after closing during which selection weight ramps back up.
    pub recover_duration_ms: u64,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            sliding_window_size: 100,
            minimum_calls: 10,
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_ms: 10_000,
            wait_duration_in_open_ms: 60_000,
            permitted_calls_in_half_open: 10,
            recover_duration_ms: 0,
        }
    }
}

impl CircuitBreakerPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sliding_window_size(mut self, size: u32) -> Self {
        self.sliding_window_size = size;
        self
    }

    pub fn with_minimum_calls(mut self, calls: u32) -> Self {
        self.minimum_calls = calls;
        self
    }

    pub fn with_failure_rate_threshold(mut self, percent: f32) -> Self {
        self.failure_rate_threshold = percent;
        self
    }

    pub fn with_slow_call_rate_threshold(mut self, percent: f32) -> Self {
        self.slow_call_rate_threshold = percent;
        self
    }

    pub fn with_slow_call_duration(mut self, duration: Duration) -> Self {
        self.slow_call_duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_wait_duration_in_open(mut self, duration: Duration) -> Self {
        self.wait_duration_in_open_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_permitted_calls_in_half_open(mut self, calls: u32) -> Self {
        self.permitted_calls_in_half_open = calls;
        self
    }

    pub fn with_recover_duration(mut self, duration: Duration) -> Self {
        self.recover_duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn slow_call_duration(&self) -> Duration {
        Duration::from_millis(self.slow_call_duration_ms)
    }

    pub fn wait_duration_in_open(&self) -> Duration {
        Duration::from_millis(self.wait_duration_in_open_ms)
    }

    pub fn recover_duration(&self) -> Duration {
        Duration::from_millis(self.recover_duration_ms)
    }

    /// Check for values the state machine cannot work with.
    pub fn validate(&self) -> Result<(), String> {
        if self.sliding_window_size == 0 {
            return Err("sliding_window_size must be > 0".into());
        }
        if self.minimum_calls > self.sliding_window_size {
            return Err(format!(
                "minimum_calls ({}) must not exceed sliding_window_size ({})",
                self.minimum_calls, self.sliding_window_size
            ));
        }
        if self.permitted_calls_in_half_open == 0 {
            return Err("permitted_calls_in_half_open must be > 0".into());
        }
        for (name, v) in [
            ("failure_rate_threshold", self.failure_rate_threshold),
            ("slow_call_rate_threshold", self.slow_call_rate_threshold),
        ] {
            if !(v > 0.0 && v <= 100.0) {
                return Err(format!("{} must be in (0, 100], got {}", name, v));
            }
        }
        Ok(())
    }
}

/// State transition notification.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStateEvent {
    pub service: String,
    pub endpoint: String,
    pub from: CircuitBreakerState,
    pub to: CircuitBreakerState,
    /// Set when `to` is `Open`: the instant trial calls become possible.
    pub wait_until: Option<Instant>,
}

pub trait CircuitBreakerListener: Send + Sync {
    fn on_state_change(&self, event: &CircuitBreakerStateEvent);
}

impl<F> CircuitBreakerListener for F
where
    F: Fn(&CircuitBreakerStateEvent) + Send + Sync,
{
    fn on_state_change(&self, event: &CircuitBreakerStateEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitBreakerState,
    pub buffered_calls: u32,
    pub failed_calls: u32,
    pub slow_calls: u32,
    pub failure_rate: f32,
    pub slow_call_rate: f32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
    /// Half-open permits not yet handed out.
    pub half_open_permits: u32,
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    failed: bool,
    slow: bool,
}

#[derive(Debug)]
struct State {
    state: CircuitBreakerState,
    window: VecDeque<Outcome>,
    failed: u32,
    slow: u32,
    open_until: Option<Instant>,
    half_open_permits: u32,
    recovering_since: Option<Instant>,
}

impl State {
    fn reset_window(&mut self) {
        self.window.clear();
        self.failed = 0;
        self.slow = 0;
    }

    fn push(&mut self, outcome: Outcome, capacity: usize) {
        if self.window.len() >= capacity {
            if let Some(old) = self.window.pop_front() {
                self.failed -= old.failed as u32;
                self.slow -= old.slow as u32;
            }
        }
        self.failed += outcome.failed as u32;
        self.slow += outcome.slow as u32;
        self.window.push_back(outcome);
    }

    fn rates(&self) -> (f32, f32) {
        let n = self.window.len();
        if n == 0 {
            return (0.0, 0.0);
        }
        let n = n as f32;
        (
            self.failed as f32 * 100.0 / n,
            self.slow as f32 * 100.0 / n,
        )
    }
}

/// Per-endpoint breaker: CLOSED → OPEN → HALF_OPEN → CLOSED | OPEN.
///
/// - CLOSED evaluates a count-based sliding window once `minimum_calls`
///   outcomes are buffered.
/// - OPEN refuses permits until the wait duration has elapsed.
/// - HALF_OPEN hands out exactly `permitted_calls_in_half_open` permits and
///   decides once that many outcomes are in.
///
/// Nothing here returns an error or panics; a missing breaker is treated as
/// "always permit" by callers.
pub struct CircuitBreaker {
    service: String,
    endpoint: String,
    policy: CircuitBreakerPolicy,
    state: Mutex<State>,
    listeners: RwLock<Vec<Arc<dyn CircuitBreakerListener>>>,
}

impl CircuitBreaker {
    pub fn new(policy: CircuitBreakerPolicy) -> Self {
        Self::for_endpoint("", "", policy)
    }

    pub fn for_endpoint(
        service: impl Into<String>,
        endpoint: impl Into<String>,
        policy: CircuitBreakerPolicy,
    ) -> Self {
        let capacity = policy.sliding_window_size.max(1) as usize;
        Self {
            service: service.into(),
            endpoint: endpoint.into(),
            policy,
            state: Mutex::new(State {
                state: CircuitBreakerState::Closed,
                window: VecDeque::with_capacity(capacity),
                failed: 0,
                slow: 0,
                open_until: None,
                half_open_permits: 0,
                recovering_since: None,
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn policy(&self) -> &CircuitBreakerPolicy {
        &self.policy
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register_listener(&self, listener: Arc<dyn CircuitBreakerListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    fn notify(&self, event: Option<CircuitBreakerStateEvent>) {
        let Some(event) = event else { return };
        info!(
            service = event.service.as_str(),
            endpoint = event.endpoint.as_str(),
            from = %event.from,
            to = %event.to,
            "circuit breaker state changed"
        );
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener.on_state_change(&event);
        }
    }

    fn transition(
        &self,
        st: &mut State,
        to: CircuitBreakerState,
        now: Instant,
    ) -> Option<CircuitBreakerStateEvent> {
        let from = st.state;
        if from == to {
            return None;
        }
        st.state = to;
        st.reset_window();
        match to {
            CircuitBreakerState::Open => {
                let wait = self.policy.wait_duration_in_open();
                st.open_until = now
                    .checked_add(wait)
                    .or_else(|| now.checked_add(Duration::from_secs(u64::from(u32::MAX))));
                st.half_open_permits = 0;
                st.recovering_since = None;
            }
            CircuitBreakerState::HalfOpen => {
                st.open_until = None;
                st.half_open_permits = self.policy.permitted_calls_in_half_open;
            }
            CircuitBreakerState::Closed => {
                st.open_until = None;
                st.half_open_permits = 0;
                st.recovering_since = (self.policy.recover_duration_ms > 0).then_some(now);
            }
        }
        Some(CircuitBreakerStateEvent {
            service: self.service.clone(),
            endpoint: self.endpoint.clone(),
            from,
            to,
            wait_until: st.open_until,
        })
    }

    /// Ask for a call permit; `false` means fail fast without calling.
    pub fn acquire(&self) -> bool {
        let now = Instant::now();
        let mut event = None;
        let permitted = {
            let mut st = self.lock();
            if st.state == CircuitBreakerState::Open {
                match st.open_until {
                    Some(until) if now < until => {}
                    _ => event = self.transition(&mut st, CircuitBreakerState::HalfOpen, now),
                }
            }
            match st.state {
                CircuitBreakerState::Closed => true,
                CircuitBreakerState::Open => false,
                CircuitBreakerState::HalfOpen => {
                    if st.half_open_permits > 0 {
                        st.half_open_permits -= 1;
                        true
                    } else {
                        false
                    }
                }
            }
        };
        self.notify(event);
        permitted
    }

    /// Hand back a permit whose call will never report an outcome.
    ///
    /// Only HALF_OPEN tracks permits; elsewhere this is a no-op.
    pub fn release_permission(&self) {
        let mut st = self.lock();
        if st.state == CircuitBreakerState::HalfOpen {
            let outstanding = self
                .policy
                .permitted_calls_in_half_open
                .saturating_sub(st.window.len() as u32);
            st.half_open_permits = (st.half_open_permits + 1).min(outstanding);
        }
    }

    /// Current state as stored; OPEN stays OPEN until `acquire` moves it.
    pub fn state(&self) -> CircuitBreakerState {
        self.lock().state
    }

    /// Whether `acquire` would hand out a permit right now, without taking one.
    pub fn is_call_permitted(&self) -> bool {
        let now = Instant::now();
        let st = self.lock();
        match st.state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open => st.open_until.map(|u| now >= u).unwrap_or(true),
            CircuitBreakerState::HalfOpen => st.half_open_permits > 0,
        }
    }

    pub fn on_success(&self, duration: Duration) {
        self.on_result(duration, true);
    }

    pub fn on_error(&self, duration: Duration, error: &(dyn std::error::Error + 'static)) {
        debug!(
            endpoint = self.endpoint.as_str(),
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "circuit breaker recorded error"
        );
        self.on_result(duration, false);
    }

    /// Record one outcome; may trip or settle the breaker.
    pub fn on_result(&self, duration: Duration, succeeded: bool) {
        let now = Instant::now();
        let outcome = Outcome {
            failed: !succeeded,
            slow: duration >= self.policy.slow_call_duration(),
        };
        let event = {
            let mut st = self.lock();
            match st.state {
                // Late results from calls admitted before the trip.
                CircuitBreakerState::Open => None,
                CircuitBreakerState::Closed => {
                    let capacity = self.policy.sliding_window_size.max(1) as usize;
                    st.push(outcome, capacity);
                    if st.window.len() >= self.policy.minimum_calls.max(1) as usize
                        && self.breached(&st)
                    {
                        self.transition(&mut st, CircuitBreakerState::Open, now)
                    } else {
                        None
                    }
                }
                CircuitBreakerState::HalfOpen => {
                    let permitted = self.policy.permitted_calls_in_half_open.max(1) as usize;
                    st.push(outcome, permitted);
                    if st.window.len() >= permitted {
                        let to = if self.breached(&st) {
                            CircuitBreakerState::Open
                        } else {
                            CircuitBreakerState::Closed
                        };
                        self.transition(&mut st, to, now)
                    } else {
                        None
                    }
                }
            }
        };
        self.notify(event);
    }

    fn breached(&self, st: &State) -> bool {
        let (failure_rate, slow_rate) = st.rates();
        failure_rate >= self.policy.failure_rate_threshold
            || slow_rate >= self.policy.slow_call_rate_threshold
    }

    /// Selection weight multiplier in `(0, 1]` while warming up after closing.
    pub fn recovery_factor(&self) -> f64 {
        self.recovery_factor_at(Instant::now())
    }

    pub fn recovery_factor_at(&self, now: Instant) -> f64 {
        let st = self.lock();
        let Some(since) = st.recovering_since else {
            return 1.0;
        };
        let total = self.policy.recover_duration();
        let elapsed = now.saturating_duration_since(since);
        if total.is_zero() || elapsed >= total {
            return 1.0;
        }
        (elapsed.as_secs_f64() / total.as_secs_f64()).max(0.1)
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = Instant::now();
        let st = self.lock();
        let (failure_rate, slow_call_rate) = st.rates();
        let open_remaining_ms = match (st.state, st.open_until) {
            (CircuitBreakerState::Open, Some(until)) if until > now => {
                Some(u64::try_from((until - now).as_millis()).unwrap_or(u64::MAX))
            }
            _ => None,
        };
        CircuitBreakerSnapshot {
            state: st.state,
            buffered_calls: st.window.len() as u32,
            failed_calls: st.failed,
            slow_calls: st.slow,
            failure_rate,
            slow_call_rate,
            open_remaining_ms,
            half_open_permits: st.half_open_permits,
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service", &self.service)
            .field("endpoint", &self.endpoint)
            .field("policy", &self.policy)
            .finish()
    }
}
