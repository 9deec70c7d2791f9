//! Operation-path lookup.
//!
//! Patterns are either exact paths, prefix patterns ending in `/*`, or the
//! catch-all `*`. Lookup order: exact, longest matching prefix, catch-all.
//! With wildcard fallback disabled only exact paths match.

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct PathMatcher<T> {
    exact: HashMap<String, T>,
    prefixes: Vec<(String, T)>,
    any: Option<T>,
    wildcard_fallback: bool,
}

impl<T> PathMatcher<T> {
    pub fn new<I>(entries: I, wildcard_fallback: bool) -> Self
    where
        I: IntoIterator<Item = (String, T)>,
    {
        let mut exact = HashMap::new();
        let mut prefixes = Vec::new();
        let mut any = None;
        for (pattern, value) in entries {
            if pattern == "*" {
                any = Some(value);
            } else if let Some(prefix) = pattern.strip_suffix("/*") {
                prefixes.push((prefix.to_string(), value));
            } else {
                exact.insert(pattern, value);
            }
        }
        // longest prefix first
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self {
            exact,
            prefixes,
            any,
            wildcard_fallback,
        }
    }

    pub fn lookup(&self, path: &str) -> Option<&T> {
        if let Some(v) = self.exact.get(path) {
            return Some(v);
        }
        if !self.wildcard_fallback {
            return None;
        }
        self.prefixes
            .iter()
            .find(|(prefix, _)| {
                path.strip_prefix(prefix.as_str())
                    .map(|rest| rest.is_empty() || rest.starts_with('/'))
                    .unwrap_or(false)
            })
            .map(|(_, v)| v)
            .or(self.any.as_ref())
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.prefixes.len() + usize::from(self.any.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(wildcard: bool) -> PathMatcher<&'static str> {
        PathMatcher::new(
            [
                ("/order/create".to_string(), "exact"),
                ("/order/*".to_string(), "order"),
                ("/order/item/*".to_string(), "item"),
                ("*".to_string(), "any"),
            ],
            wildcard,
        )
    }

    #[test]
    fn test_exact_wins() {
        assert_eq!(matcher(true).lookup("/order/create"), Some(&"exact"));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let m = matcher(true);
        assert_eq!(m.lookup("/order/item/42"), Some(&"item"));
        assert_eq!(m.lookup("/order/cancel"), Some(&"order"));
        assert_eq!(m.lookup("/order"), Some(&"order"));
    }

    #[test]
    fn test_prefix_respects_segment_boundary() {
        assert_eq!(matcher(true).lookup("/orders/list"), Some(&"any"));
    }

    #[test]
    fn test_without_wildcard_only_exact() {
        let m = matcher(false);
        assert_eq!(m.lookup("/order/create"), Some(&"exact"));
        assert_eq!(m.lookup("/order/cancel"), None);
        assert_eq!(m.lookup("/anything"), None);
        assert_eq!(m.len(), 4);
    }
}
