//! 弹性模式模块：按端点熔断、熔断端点集合以及集群级限流。
//!
//! # Resilience Primitives Module
//!
//! Call gating for the cluster pipeline.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Sliding-window breaker per endpoint |
//! | [`registry`] | Breakers keyed by (service, endpoint) and the broken-endpoint set |
//! | [`rate_limiter`] | Token bucket limiting a whole cluster |
//!
//! ## Circuit Breaker
//!
//! - **Closed**: calls pass; outcomes fill the sliding window
//! - **Open**: failure or slow-call rate crossed its threshold; permits are refused
//! - **Half-Open**: a fixed number of trial calls decide between closed and open
//!
//! ```rust
//! use outbound_governance::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerPolicy};
//! use std::time::Duration;
//!
//! let policy = CircuitBreakerPolicy::new()
//!     .with_minimum_calls(5)
//!     .with_wait_duration_in_open(Duration::from_secs(30));
//! let breaker = CircuitBreaker::new(policy);
//!
//! if breaker.acquire() {
//!     // Make the call...
//!     breaker.on_success(Duration::from_millis(12));
//! }
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod registry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerListener, CircuitBreakerPolicy, CircuitBreakerSnapshot,
    CircuitBreakerState, CircuitBreakerStateEvent,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterSnapshot};
pub use registry::{BrokenEndpoints, CircuitBreakerRegistry};
