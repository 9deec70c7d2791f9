//! # outbound-governance
//!
//! 出站调用治理：按端点计数、熔断、失败转移重试与基于响应时间估计的选址。
//!
//! Adaptive governance for outbound calls: per-endpoint accounting, circuit
//! breaking, retry/failover and response-time-aware endpoint selection.
//!
//! ## Overview
//!
//! Every outbound call goes through one pipeline:
//!
//! 1. **Route**: the adapter supplies candidate endpoints
//! 2. **Filter**: endpoints already tried, or marked broken by their breaker, are dropped
//! 3. **Select**: the lowest estimated response time wins (or the sticky endpoint)
//! 4. **Invoke**: the adapter performs one transport attempt
//! 5. **Classify**: counters and breakers record the outcome
//! 6. **Retry/Fail**: the policy decides whether another endpoint is tried
//!
//! Transports plug in through [`ClusterAdapter`]; their errors stay opaque
//! and are classified only through the adapter's predicate.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use outbound_governance::cluster::{ClusterAdapter, ClusterInvoker, Endpoint, OperationInfo};
//! use outbound_governance::policy::{ClusterPolicy, RetryPolicy};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl ClusterAdapter for Echo {
//!     type Request = String;
//!     type Response = String;
//!     type Error = std::io::Error;
//!
//!     fn service(&self, _request: &String) -> String {
//!         "echo".to_string()
//!     }
//!
//!     fn operation(&self, request: &String) -> OperationInfo {
//!         OperationInfo::new(request.clone())
//!     }
//!
//!     async fn route(&self, _request: &String) -> outbound_governance::Result<Vec<Endpoint>> {
//!         Ok(vec![Endpoint::new("10.0.0.1", 8080), Endpoint::new("10.0.0.2", 8080)])
//!     }
//!
//!     async fn invoke(&self, request: &String, endpoint: &Endpoint) -> std::io::Result<String> {
//!         Ok(format!("{} from {}", request, endpoint))
//!     }
//!
//!     fn is_retryable(&self, _error: &std::io::Error) -> bool {
//!         true
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> outbound_governance::Result<()> {
//!     let invoker = ClusterInvoker::new(Echo);
//!     let policy = ClusterPolicy::failover(RetryPolicy::new(2));
//!     let reply = invoker.execute("/ping".to_string(), Some(policy)).await?;
//!     println!("{reply}");
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`counter`] | Lock-free call counters, their registry and background maintenance |
//! | [`resilience`] | Circuit breakers, the broken-endpoint set and rate limiting |
//! | [`policy`] | Retry and cluster policies, loading and path matching |
//! | [`cluster`] | Adapter contract, invocation context, balancers and the invoker |
//! | [`failover`] | Address failover table |
//! | [`error`] | Error taxonomy: rejections, retry terminations, transport errors |

pub mod cluster;
pub mod counter;
pub mod failover;
pub mod policy;
pub mod resilience;

// Re-export main types for convenience
pub use cluster::{
    ClusterAdapter, ClusterInvoker, ClusterInvokerBuilder, Endpoint, EndpointStats,
    OperationInfo, OutboundInvocation,
};
pub use counter::{Counter, CounterConfig, CounterRegistry};
pub use policy::{ClusterInvokerType, ClusterPolicy, GovernanceConfig, PolicyRegistry, RetryPolicy};
pub use resilience::{CircuitBreaker, CircuitBreakerPolicy, CircuitBreakerState};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext, RejectKind};
