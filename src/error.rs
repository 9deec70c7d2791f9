use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Structured error context attached to governance errors.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Logical service the call targeted (e.g., "order-service")
    pub service: Option<String>,
    /// Endpoint id the failure is attributed to, if any
    pub endpoint: Option<String>,
    /// Additional context about the error
    pub details: Option<String>,
    /// Component that raised the error (e.g., "cluster_invoker", "policy_loader")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Reasons a call is refused before any transport attempt is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    /// The cluster has been torn down.
    Unready,
    /// No endpoint is eligible for selection.
    NoProvider,
    /// Every remaining endpoint refused a circuit-breaker permit.
    CircuitBreak,
    /// Every remaining endpoint is at its concurrency ceiling.
    Limit,
    /// The cluster-wide rate limiter has no token available.
    RateLimit,
    /// A policy decided the call must not leave this process.
    Escape,
}

impl RejectKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unready => "unready",
            Self::NoProvider => "no_provider",
            Self::CircuitBreak => "circuit_break",
            Self::Limit => "limit",
            Self::RateLimit => "rate_limit",
            Self::Escape => "escape",
        }
    }
}

impl fmt::Display for RejectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Unified error type for the governance pipeline.
///
/// Three families are kept apart: rejections (we never called anyone),
/// retry terminations (we called and gave up), and transport errors (opaque
/// adapter failures, classified only through the adapter's predicate).
#[derive(Debug, Error)]
pub enum Error {
    #[error("Rejected ({kind}): {message}{}", format_context(.context))]
    Reject {
        kind: RejectKind,
        message: String,
        context: ErrorContext,
    },

    #[error("Retry exhausted after {attempts} attempt(s): {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Retry timeout after {elapsed_ms}ms ({attempts} attempt(s))")]
    RetryTimeout {
        attempts: u32,
        elapsed_ms: u64,
        #[source]
        source: Option<Box<Error>>,
    },

    #[error("Transport error: {message}{}", format_context(.context))]
    Transport {
        message: String,
        retryable: bool,
        context: ErrorContext,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Invocation cancelled")]
    Cancelled,

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref service) = ctx.service {
        parts.push(format!("service: {}", service));
    }
    if let Some(ref endpoint) = ctx.endpoint {
        parts.push(format!("endpoint: {}", endpoint));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    pub fn reject(kind: RejectKind, msg: impl Into<String>) -> Self {
        Self::reject_with_context(kind, msg, ErrorContext::new())
    }

    pub fn reject_with_context(
        kind: RejectKind,
        msg: impl Into<String>,
        context: ErrorContext,
    ) -> Self {
        Error::Reject {
            kind,
            message: msg.into(),
            context,
        }
    }

    /// Wrap an adapter-native error without inspecting it.
    pub fn transport<E>(err: E, retryable: bool, context: ErrorContext) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Transport {
            message: err.to_string(),
            retryable,
            context,
            source: Some(Box::new(err)),
        }
    }

    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// `true` for pre-invocation rejections.
    pub fn is_reject(&self) -> bool {
        matches!(self, Error::Reject { .. })
    }

    /// `true` for errors raised after the retry loop terminated.
    pub fn is_retry(&self) -> bool {
        matches!(
            self,
            Error::RetryExhausted { .. } | Error::RetryTimeout { .. }
        )
    }

    pub fn reject_kind(&self) -> Option<RejectKind> {
        match self {
            Error::Reject { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// The last real failure behind a retry termination, or `self`.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::RetryExhausted { source, .. } => source.root_cause(),
            Error::RetryTimeout {
                source: Some(source),
                ..
            } => source.root_cause(),
            other => other,
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Reject { context, .. }
            | Error::Transport { context, .. }
            | Error::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_display_includes_context() {
        let err = Error::reject_with_context(
            RejectKind::NoProvider,
            "no endpoint available",
            ErrorContext::new()
                .with_service("order-service")
                .with_source("cluster_invoker"),
        );
        let text = err.to_string();
        assert!(text.contains("no_provider"));
        assert!(text.contains("service: order-service"));
        assert!(text.contains("source: cluster_invoker"));
        assert!(err.is_reject());
        assert!(!err.is_retry());
        assert_eq!(err.reject_kind(), Some(RejectKind::NoProvider));
    }

    #[test]
    fn test_root_cause_unwraps_retry_errors() {
        let cause = Error::transport(
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
            true,
            ErrorContext::new().with_endpoint("10.0.0.1:20880"),
        );
        let err = Error::RetryExhausted {
            attempts: 3,
            source: Box::new(cause),
        };
        assert!(err.is_retry());
        match err.root_cause() {
            Error::Transport { message, context, .. } => {
                assert_eq!(message, "reset");
                assert_eq!(context.endpoint.as_deref(), Some("10.0.0.1:20880"));
            }
            other => panic!("unexpected root cause: {other:?}"),
        }
    }

    #[test]
    fn test_timeout_without_cause_is_its_own_root() {
        let err = Error::RetryTimeout {
            attempts: 0,
            elapsed_ms: 10,
            source: None,
        };
        assert!(matches!(err.root_cause(), Error::RetryTimeout { .. }));
    }
}
