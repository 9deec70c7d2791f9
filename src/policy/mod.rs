//! 治理策略模块：重试、集群调用方式与熔断配置，以及策略加载与路径匹配。
//!
//! # Policy Module
//!
//! Declarative, immutable policy snapshots consumed by the cluster pipeline.
//! Policies are pure data: the only logic here is eligibility testing and
//! validation. They are shared as `Arc<ClusterPolicy>` and re-read on every
//! invocation, never mutated by it.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`RetryPolicy`] | Retry count, interval, timeout and eligibility sets |
//! | [`ClusterPolicy`] | Failover/failfast, stickiness, breaker and concurrency settings |
//! | [`loader`] | JSON/YAML loading and the hot-swappable [`PolicyRegistry`] |
//! | [`matcher`] | Path lookup with optional wildcard fallback |

pub mod loader;
pub mod matcher;

pub use loader::{GovernanceConfig, PolicyLoader, PolicyRegistry, ServicePolicy};
pub use matcher::PathMatcher;

use crate::resilience::circuit_breaker::CircuitBreakerPolicy;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// How the pipeline reacts to a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterInvokerType {
    /// Retry on another endpoint within the retry budget.
    #[default]
    Failover,
    /// Surface the first failure.
    Failfast,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub retry: u32,
    /// Pause between attempts.
    pub interval_ms: u64,
    /// Budget for the whole call including retries; 0 means none.
    pub timeout_ms: u64,
    /// Methods (e.g. HTTP verbs) eligible for retry; empty means all.
    pub methods: BTreeSet<String>,
    /// Error codes that make a failure retryable regardless of the adapter.
    pub error_codes: BTreeSet<String>,
    /// Error type names that make a failure retryable regardless of the adapter.
    pub exceptions: BTreeSet<String>,
}

impl RetryPolicy {
    pub fn new(retry: u32) -> Self {
        Self {
            retry,
            ..Self::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = methods
            .into_iter()
            .map(|m| m.into().to_ascii_uppercase())
            .collect();
        self
    }

    pub fn with_error_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.error_codes = codes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_exceptions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exceptions = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// Whether another attempt fits after `attempts` completed ones.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts <= self.retry
    }

    /// Case-insensitive method check; an empty set admits everything and a
    /// request without a method is only admitted by an empty set.
    pub fn is_retryable_method(&self, method: Option<&str>) -> bool {
        if self.methods.is_empty() {
            return true;
        }
        match method {
            Some(m) => self.methods.iter().any(|x| x.eq_ignore_ascii_case(m)),
            None => false,
        }
    }

    /// `true` when the failure's code or type name is listed explicitly.
    pub fn is_retryable_error(&self, code: Option<&str>, name: Option<&str>) -> bool {
        code.map(|c| self.error_codes.contains(c)).unwrap_or(false)
            || name.map(|n| self.exceptions.contains(n)).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterPolicy {
    #[serde(rename = "type")]
    pub invoke_type: ClusterInvokerType,
    pub retry_policy: Option<RetryPolicy>,
    /// Prefer the session's previous endpoint while it stays healthy.
    pub sticky: bool,
    pub circuit_breaker: Option<CircuitBreakerPolicy>,
    /// Fall back to broken endpoints when nothing healthy is left.
    pub allow_broken_fallback: bool,
    /// Per-endpoint in-flight ceiling; 0 or negative means unbounded.
    pub max_concurrency: i64,
}

impl Default for ClusterPolicy {
    fn default() -> Self {
        Self {
            invoke_type: ClusterInvokerType::Failover,
            retry_policy: None,
            sticky: false,
            circuit_breaker: None,
            allow_broken_fallback: true,
            max_concurrency: 0,
        }
    }
}

impl ClusterPolicy {
    pub fn failover(retry: RetryPolicy) -> Self {
        Self {
            invoke_type: ClusterInvokerType::Failover,
            retry_policy: Some(retry),
            ..Self::default()
        }
    }

    pub fn failfast() -> Self {
        Self {
            invoke_type: ClusterInvokerType::Failfast,
            ..Self::default()
        }
    }

    pub fn with_sticky(mut self, sticky: bool) -> Self {
        self.sticky = sticky;
        self
    }

    pub fn with_circuit_breaker(mut self, policy: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker = Some(policy);
        self
    }

    pub fn with_broken_fallback(mut self, allow: bool) -> Self {
        self.allow_broken_fallback = allow;
        self
    }

    pub fn with_max_concurrency(mut self, max: i64) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Configured retries; 0 without a retry policy.
    pub fn retries(&self) -> u32 {
        self.retry_policy.as_ref().map(|r| r.retry).unwrap_or(0)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.retry_policy.as_ref().and_then(RetryPolicy::timeout)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(cb) = &self.circuit_breaker {
            cb.validate().map_err(|msg| {
                Error::configuration_with_context(
                    msg,
                    ErrorContext::new()
                        .with_details("circuit_breaker")
                        .with_source("policy_validator"),
                )
            })?;
        }
        if let Some(retry) = &self.retry_policy {
            if retry.methods.iter().any(|m| m.trim().is_empty()) {
                return Err(Error::configuration_with_context(
                    "retry method names must not be blank",
                    ErrorContext::new()
                        .with_details("retry_policy.methods")
                        .with_source("policy_validator"),
                ));
            }
        }
        Ok(())
    }
}
