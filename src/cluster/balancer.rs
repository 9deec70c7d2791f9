//! Endpoint selection strategies.

use super::Endpoint;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A selectable endpoint and its effective response-time estimate in ms.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub endpoint: &'a Endpoint,
    pub estimate: u64,
}

pub trait LoadBalancer: Send + Sync {
    /// Index of the chosen candidate; `None` only for an empty slice.
    fn select(&self, candidates: &[Candidate<'_>]) -> Option<usize>;

    fn name(&self) -> &'static str;
}

/// Lowest estimated response wins; ties go to the earliest candidate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShortestResponseBalancer;

impl LoadBalancer for ShortestResponseBalancer {
    fn select(&self, candidates: &[Candidate<'_>]) -> Option<usize> {
        // min_by_key keeps the first of equal keys
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.estimate)
            .map(|(i, _)| i)
    }

    fn name(&self) -> &'static str {
        "shortest_response"
    }
}

/// Cycles through candidates regardless of their estimates.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    cursor: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select(&self, candidates: &[Candidate<'_>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Vec<Endpoint> {
        (1..=3).map(|i| Endpoint::new(format!("10.0.0.{i}"), 80)).collect()
    }

    #[test]
    fn test_shortest_response_picks_minimum() {
        let eps = endpoints();
        let candidates: Vec<_> = eps
            .iter()
            .zip([30, 10, 20])
            .map(|(endpoint, estimate)| Candidate { endpoint, estimate })
            .collect();
        assert_eq!(ShortestResponseBalancer.select(&candidates), Some(1));
    }

    #[test]
    fn test_shortest_response_ties_are_stable() {
        let eps = endpoints();
        let candidates: Vec<_> = eps
            .iter()
            .map(|endpoint| Candidate { endpoint, estimate: 0 })
            .collect();
        for _ in 0..10 {
            assert_eq!(ShortestResponseBalancer.select(&candidates), Some(0));
        }
        assert_eq!(ShortestResponseBalancer.select(&[]), None);
    }

    #[test]
    fn test_round_robin_cycles() {
        let eps = endpoints();
        let candidates: Vec<_> = eps
            .iter()
            .map(|endpoint| Candidate { endpoint, estimate: 0 })
            .collect();
        let rr = RoundRobinBalancer::new();
        let picks: Vec<_> = (0..6).filter_map(|_| rr.select(&candidates)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(rr.select(&[]), None);
    }
}
