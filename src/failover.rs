//! 地址故障转移：将失效地址映射到替代地址。
//!
//! Address failover: rewrite routed endpoint addresses through a replacement
//! table. Endpoint ids are left alone so counters and breakers keep their
//! history across a switch.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub trait AddressFailover: Send + Sync {
    /// Replacement for `address` (`host:port`), if one is configured.
    fn failover(&self, address: &str) -> Option<String>;
}

impl<F> AddressFailover for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn failover(&self, address: &str) -> Option<String> {
        self(address)
    }
}

/// Hot-swappable `old address → new address` table.
#[derive(Debug)]
pub struct AddressTable {
    table: ArcSwap<HashMap<String, String>>,
}

impl AddressTable {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self {
            table: ArcSwap::from_pointee(entries),
        }
    }

    /// Replace the whole table, logging every address whose target changed.
    pub fn replace(&self, entries: HashMap<String, String>) {
        let previous = self.table.swap(Arc::new(entries));
        let current = self.table.load();
        for (from, to) in current.iter() {
            if previous.get(from) != Some(to) {
                info!(from = from.as_str(), to = to.as_str(), "address failover switched");
            }
        }
        for from in previous.keys().filter(|k| !current.contains_key(*k)) {
            info!(from = from.as_str(), "address failover removed");
        }
    }

    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AddressTable {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl AddressFailover for AddressTable {
    fn failover(&self, address: &str) -> Option<String> {
        self.table.load().get(address).cloned()
    }
}

/// Split `host:port`; IPv6 hosts may be bracketed.
pub(crate) fn split_address(address: &str) -> Option<(String, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_lookup_and_replace() {
        let table = AddressTable::new(HashMap::from([(
            "10.0.0.1:80".to_string(),
            "10.0.1.1:80".to_string(),
        )]));
        assert_eq!(table.failover("10.0.0.1:80").as_deref(), Some("10.0.1.1:80"));
        assert_eq!(table.failover("10.0.0.2:80"), None);

        table.replace(HashMap::from([(
            "10.0.0.2:80".to_string(),
            "10.0.1.2:80".to_string(),
        )]));
        assert_eq!(table.failover("10.0.0.1:80"), None);
        assert_eq!(table.failover("10.0.0.2:80").as_deref(), Some("10.0.1.2:80"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_closure_failover() {
        let f = |addr: &str| (addr == "a:1").then(|| "b:2".to_string());
        assert_eq!(f.failover("a:1").as_deref(), Some("b:2"));
        assert_eq!(f.failover("c:3"), None);
    }

    #[test]
    fn test_split_address() {
        assert_eq!(split_address("10.0.0.1:80"), Some(("10.0.0.1".to_string(), 80)));
        assert_eq!(split_address("[::1]:8080"), Some(("::1".to_string(), 8080)));
        assert_eq!(split_address("nohost"), None);
        assert_eq!(split_address(":80"), None);
        assert_eq!(split_address("host:notaport"), None);
    }
}
