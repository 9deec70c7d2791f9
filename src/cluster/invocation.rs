//! Per-call mutable context.

use super::{Endpoint, OperationInfo};
use crate::policy::ClusterPolicy;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State of one logical outbound call across all of its attempts.
///
/// Owned by the calling task. `attempted` only grows while the call runs;
/// it holds the ids of endpoints that were invoked and failed. Endpoints
/// refused by their breaker or concurrency ceiling go to `skipped` instead.
#[derive(Debug)]
pub struct OutboundInvocation<R> {
    request: R,
    policy: Arc<ClusterPolicy>,
    service: String,
    operation: OperationInfo,
    pub(crate) attempted: Vec<String>,
    pub(crate) skipped: Vec<String>,
    pub(crate) endpoint: Option<Endpoint>,
    pub(crate) attempts: u32,
    pub(crate) sticky_id: Option<String>,
    pub(crate) last_failure: Option<String>,
    started_at: Instant,
}

impl<R> OutboundInvocation<R> {
    pub fn new(
        request: R,
        policy: Arc<ClusterPolicy>,
        service: impl Into<String>,
        operation: OperationInfo,
    ) -> Self {
        Self {
            request,
            policy,
            service: service.into(),
            operation,
            attempted: Vec::new(),
            skipped: Vec::new(),
            endpoint: None,
            attempts: 0,
            sticky_id: None,
            last_failure: None,
            started_at: Instant::now(),
        }
    }

    /// Pin the call to a session's endpoint when the policy is sticky.
    pub fn with_sticky_id(mut self, endpoint_id: impl Into<String>) -> Self {
        self.sticky_id = Some(endpoint_id.into());
        self
    }

    pub fn request(&self) -> &R {
        &self.request
    }

    pub fn into_request(self) -> R {
        self.request
    }

    pub fn policy(&self) -> &Arc<ClusterPolicy> {
        &self.policy
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn operation(&self) -> &OperationInfo {
        &self.operation
    }

    /// Endpoint ids invoked and failed, in attempt order.
    pub fn attempted(&self) -> &[String] {
        &self.attempted
    }

    /// Endpoint ids refused by a breaker or a concurrency ceiling.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// Endpoint of the most recent attempt.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Transport attempts issued so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn sticky_id(&self) -> Option<&str> {
        self.sticky_id.as_deref()
    }

    /// Message of the most recent failed attempt.
    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub(crate) fn is_excluded(&self, endpoint_id: &str) -> bool {
        self.attempted.iter().any(|id| id == endpoint_id)
            || self.skipped.iter().any(|id| id == endpoint_id)
    }
}
