//! 集群调用模块：路由、过滤、选址、调用、分类与重试的出站调用流水线。
//!
//! # Cluster Module
//!
//! The outbound invocation pipeline: ROUTE → FILTER → SELECT → INVOKE →
//! CLASSIFY → RETRY/FAIL.
//!
//! ## Overview
//!
//! Transport specifics live behind [`ClusterAdapter`]. The pipeline itself
//! only knows endpoints, counters, breakers and policies; adapter errors stay
//! opaque and are classified through the adapter's own predicate.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ClusterAdapter`] | Routing, invocation and failure classification for one transport |
//! | [`OutboundInvocation`] | Per-call context: request, policy snapshot, attempted endpoints |
//! | [`ClusterInvoker`] | The retry/failover loop wired to counters and breakers |
//! | [`balancer`] | Endpoint selection strategies |

pub mod balancer;
pub mod invocation;
pub mod invoker;

pub use balancer::{Candidate, LoadBalancer, RoundRobinBalancer, ShortestResponseBalancer};
pub use invocation::OutboundInvocation;
pub use invoker::{ClusterInvoker, ClusterInvokerBuilder, EndpointStats};

use crate::counter::operation_key;
use crate::policy::ClusterPolicy;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One addressable instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Stable identity; counters, breakers and `attempted` are keyed by it.
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Endpoint {
    /// Endpoint identified by its `host:port` address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            id: join_host_port(&host, port),
            host,
            port,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// `host:port`, with IPv6 hosts in brackets (`[::1]:80`).
    pub fn address(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id == self.address() {
            f.write_str(&self.id)
        } else {
            write!(f, "{}@{}", self.id, self.address())
        }
    }
}

/// The operation a request targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationInfo {
    pub path: String,
    /// Transport verb (e.g. `GET`), if the transport has one.
    pub method: Option<String>,
}

impl OperationInfo {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Counter key of this operation.
    pub fn key(&self) -> String {
        operation_key(&self.path, self.method.as_deref())
    }
}

/// Transport seam of the pipeline.
///
/// Implementations are shared across concurrent invocations and must be
/// `Send + Sync`. `invoke` owns transport-level cancellation: the pipeline
/// drops its future when the caller cancels.
#[async_trait]
pub trait ClusterAdapter: Send + Sync {
    type Request: Send + Sync;
    type Response: Send;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Logical service the request belongs to.
    fn service(&self, request: &Self::Request) -> String;

    fn operation(&self, request: &Self::Request) -> OperationInfo;

    /// Candidate endpoints for the request. An empty list is not an error.
    async fn route(&self, request: &Self::Request) -> Result<Vec<Endpoint>>;

    /// One transport attempt. Endpoint-reported failures are errors too.
    async fn invoke(
        &self,
        request: &Self::Request,
        endpoint: &Endpoint,
    ) -> std::result::Result<Self::Response, Self::Error>;

    fn is_retryable(&self, error: &Self::Error) -> bool;

    /// Code matched against `RetryPolicy::error_codes`.
    fn error_code(&self, _error: &Self::Error) -> Option<String> {
        None
    }

    /// Type name matched against `RetryPolicy::exceptions`.
    fn error_name(&self, _error: &Self::Error) -> Option<String> {
        None
    }

    /// Convert a terminal adapter failure into the caller-facing error.
    fn create_exception(
        &self,
        error: Self::Error,
        request: &Self::Request,
        endpoint: &Endpoint,
        retryable: bool,
    ) -> Error {
        Error::transport(
            error,
            retryable,
            ErrorContext::new()
                .with_service(self.service(request))
                .with_endpoint(endpoint.id.clone())
                .with_source("cluster_invoker"),
        )
    }

    /// Policy used when no configured policy matches the request.
    fn default_policy(&self, _request: &Self::Request) -> ClusterPolicy {
        ClusterPolicy::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_identity() {
        let ep = Endpoint::new("10.0.0.1", 8080);
        assert_eq!(ep.id, "10.0.0.1:8080");
        assert_eq!(ep.to_string(), "10.0.0.1:8080");

        let named = Endpoint::new("10.0.0.1", 8080)
            .with_id("node-a")
            .with_metadata("zone", "eu-1");
        assert_eq!(named.to_string(), "node-a@10.0.0.1:8080");
        assert_eq!(named.metadata.get("zone").map(String::as_str), Some("eu-1"));
    }

    #[test]
    fn test_ipv6_address_is_bracketed() {
        let ep = Endpoint::new("::1", 80);
        assert_eq!(ep.address(), "[::1]:80");
        assert_eq!(ep.id, "[::1]:80");
        assert_eq!(ep.to_string(), "[::1]:80");
        assert_eq!(Endpoint::new("[fe80::2]", 9000).address(), "[fe80::2]:9000");
    }

    #[test]
    fn test_operation_key() {
        assert_eq!(OperationInfo::new("/order").key(), "/order");
        assert_eq!(
            OperationInfo::new("/order").with_method("GET").key(),
            "/order#GET"
        );
    }
}
