//! Policy loading from JSON/YAML files and a hot-swappable policy table.
//!
//! ```yaml
//! wildcard_fallback: true
//! counter:
//!   keep_time_ms: 300000
//! services:
//!   order-service:
//!     default:
//!       type: failover
//!       retry_policy: { retry: 2, interval_ms: 50 }
//!     paths:
//!       "/order/create": { type: failfast }
//!       "/order/*":
//!         retry_policy: { retry: 1, methods: [GET] }
//! ```

use super::{ClusterPolicy, PathMatcher};
use crate::counter::CounterConfig;
use crate::resilience::rate_limiter::RateLimiterConfig;
use crate::{Error, ErrorContext, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Policies of one logical service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicePolicy {
    /// Applies when no path pattern matches.
    pub default: Option<ClusterPolicy>,
    /// Keyed by exact path, `prefix/*` or `*`.
    pub paths: HashMap<String, ClusterPolicy>,
}

/// Top-level governance configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Allow `prefix/*` and `*` patterns to answer lookups that miss exactly.
    pub wildcard_fallback: bool,
    pub counter: CounterConfig,
    pub rate_limit: Option<RateLimiterConfig>,
    /// Address failover table: old address → replacement.
    pub addresses: HashMap<String, String>,
    pub services: HashMap<String, ServicePolicy>,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            wildcard_fallback: true,
            counter: CounterConfig::default(),
            rate_limit: None,
            addresses: HashMap::new(),
            services: HashMap::new(),
        }
    }
}

impl GovernanceConfig {
    /// Validate every policy, naming the offending service and path.
    pub fn validate(&self) -> Result<()> {
        for (service, sp) in &self.services {
            let entries = sp
                .default
                .iter()
                .map(|p| ("<default>", p))
                .chain(sp.paths.iter().map(|(k, p)| (k.as_str(), p)));
            for (path, policy) in entries {
                policy.validate().map_err(|e| {
                    Error::configuration_with_context(
                        e.to_string(),
                        ErrorContext::new()
                            .with_service(service.clone())
                            .with_details(format!("path: {}", path))
                            .with_source("policy_loader"),
                    )
                })?;
            }
        }
        if let Some(rl) = &self.rate_limit {
            if !rl.rps.is_finite() || rl.rps < 0.0 || rl.burst < 1.0 {
                return Err(Error::configuration_with_context(
                    format!("invalid rate limit: rps={} burst={}", rl.rps, rl.burst),
                    ErrorContext::new().with_source("policy_loader"),
                ));
            }
        }
        Ok(())
    }
}

/// Reads [`GovernanceConfig`] documents.
pub struct PolicyLoader;

impl PolicyLoader {
    /// Load and validate a file; `.json` is parsed as JSON, anything else as YAML.
    pub fn from_path(path: impl AsRef<Path>) -> Result<GovernanceConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("Failed to read policy file: {}", e),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("policy_loader"),
            )
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_yaml_str(&content)
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<GovernanceConfig> {
        let config: GovernanceConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<GovernanceConfig> {
        let config: GovernanceConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug)]
struct ServiceTable {
    default: Option<Arc<ClusterPolicy>>,
    paths: PathMatcher<Arc<ClusterPolicy>>,
}

#[derive(Debug, Default)]
struct PolicyTable {
    services: HashMap<String, ServiceTable>,
}

impl PolicyTable {
    fn build(config: &GovernanceConfig) -> Self {
        let services = config
            .services
            .iter()
            .map(|(name, sp)| {
                let table = ServiceTable {
                    default: sp.default.clone().map(Arc::new),
                    paths: PathMatcher::new(
                        sp.paths
                            .iter()
                            .map(|(k, v)| (k.clone(), Arc::new(v.clone()))),
                        config.wildcard_fallback,
                    ),
                };
                (name.clone(), table)
            })
            .collect();
        Self { services }
    }
}

/// Hot-reloadable policy table.
///
/// Readers get an `Arc<ClusterPolicy>` snapshot; [`reload`](Self::reload)
/// swaps the whole table atomically, so a lookup never sees a half-applied
/// configuration.
pub struct PolicyRegistry {
    table: ArcSwap<PolicyTable>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(PolicyTable::default()),
        }
    }

    pub fn from_config(config: &GovernanceConfig) -> Result<Self> {
        let registry = Self::new();
        registry.reload(config)?;
        Ok(registry)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_config(&PolicyLoader::from_path(path)?)
    }

    /// Validate `config` and replace the whole table with it.
    pub fn reload(&self, config: &GovernanceConfig) -> Result<()> {
        config.validate()?;
        self.table.store(Arc::new(PolicyTable::build(config)));
        info!(services = config.services.len(), "governance policies reloaded");
        Ok(())
    }

    /// Policy for `path` of `service`, falling back to the service default.
    pub fn lookup(&self, service: &str, path: &str) -> Option<Arc<ClusterPolicy>> {
        let table = self.table.load();
        let st = table.services.get(service)?;
        st.paths
            .lookup(path)
            .or(st.default.as_ref())
            .cloned()
    }

    pub fn services(&self) -> Vec<String> {
        self.table.load().services.keys().cloned().collect()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ClusterInvokerType;

    const YAML: &str = r#"
wildcard_fallback: true
counter:
  keep_time_ms: 1000
services:
  order-service:
    default:
      type: failover
      retry_policy: { retry: 2, interval_ms: 50 }
    paths:
      "/order/create": { type: failfast }
      "/order/*":
        retry_policy: { retry: 1, methods: [GET] }
"#;

    #[test]
    fn test_yaml_loading() {
        let config = PolicyLoader::from_yaml_str(YAML).unwrap();
        assert_eq!(config.counter.keep_time_ms, 1000);
        assert_eq!(config.counter.tick_ms, 1000);
        let svc = &config.services["order-service"];
        assert_eq!(svc.default.as_ref().unwrap().retries(), 2);
        assert_eq!(svc.paths.len(), 2);
    }

    #[test]
    fn test_registry_lookup_order() {
        let registry = PolicyRegistry::from_config(&PolicyLoader::from_yaml_str(YAML).unwrap())
            .unwrap();
        let exact = registry.lookup("order-service", "/order/create").unwrap();
        assert_eq!(exact.invoke_type, ClusterInvokerType::Failfast);

        let prefix = registry.lookup("order-service", "/order/list").unwrap();
        assert_eq!(prefix.retries(), 1);

        let fallback = registry.lookup("order-service", "/user/get").unwrap();
        assert_eq!(fallback.retries(), 2);

        assert!(registry.lookup("payment-service", "/pay").is_none());
    }

    #[test]
    fn test_wildcard_disabled_uses_default() {
        let mut config = PolicyLoader::from_yaml_str(YAML).unwrap();
        config.wildcard_fallback = false;
        let registry = PolicyRegistry::from_config(&config).unwrap();
        let policy = registry.lookup("order-service", "/order/list").unwrap();
        assert_eq!(policy.retries(), 2);
    }

    #[test]
    fn test_reload_swaps_table() {
        let registry = PolicyRegistry::new();
        assert!(registry.lookup("order-service", "/x").is_none());
        registry
            .reload(&PolicyLoader::from_yaml_str(YAML).unwrap())
            .unwrap();
        let before = registry.lookup("order-service", "/x").unwrap();

        registry.reload(&GovernanceConfig::default()).unwrap();
        assert!(registry.lookup("order-service", "/x").is_none());
        // snapshots handed out earlier stay valid
        assert_eq!(before.retries(), 2);
    }

    #[test]
    fn test_invalid_policy_rejected_with_location() {
        let yaml = r#"
services:
  order-service:
    paths:
      "/bad":
        circuit_breaker: { sliding_window_size: 0 }
"#;
        let err = PolicyLoader::from_yaml_str(yaml).unwrap_err();
        match err {
            Error::Configuration { context, .. } => {
                assert_eq!(context.service.as_deref(), Some("order-service"));
                assert_eq!(context.details.as_deref(), Some("path: /bad"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_minimum_calls_beyond_window_rejected() {
        let yaml = r#"
services:
  order-service:
    paths:
      "/order/*":
        circuit_breaker: { sliding_window_size: 5, minimum_calls: 10 }
"#;
        let err = PolicyLoader::from_yaml_str(yaml).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("minimum_calls"), "{message}");
        assert!(message.contains("circuit_breaker"), "{message}");
        match err {
            Error::Configuration { context, .. } => {
                assert_eq!(context.service.as_deref(), Some("order-service"));
                assert_eq!(context.details.as_deref(), Some("path: /order/*"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_json_loading() {
        let json = r#"{ "services": { "svc": { "default": { "type": "failfast" } } } }"#;
        let config = PolicyLoader::from_json_str(json).unwrap();
        assert!(config.wildcard_fallback);
        assert_eq!(
            config.services["svc"].default.as_ref().unwrap().invoke_type,
            ClusterInvokerType::Failfast
        );
    }

    #[test]
    fn test_malformed_yaml_is_yaml_error() {
        let err = PolicyLoader::from_yaml_str("services: [").unwrap_err();
        assert!(matches!(err, Error::Yaml(_)));
    }
}
