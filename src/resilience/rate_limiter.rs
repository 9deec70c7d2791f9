use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub rps: f64,
    pub burst: f64,
    pub tokens: f64,
    /// Estimated wait time until a token is available (ms), if currently empty.
    pub estimated_wait_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Tokens per second; 0 disables limiting.
    pub rps: f64,
    /// Maximum burst size (tokens).
    pub burst: f64,
}

impl RateLimiterConfig {
    pub fn from_rps(rps: f64) -> Option<Self> {
        if !rps.is_finite() || rps < 0.0 {
            return None;
        }
        Some(Self {
            rps,
            burst: rps.max(1.0),
        })
    }

    pub fn new() -> Self {
        Self {
            rps: 100.0,
            burst: 100.0,
        }
    }

    pub fn with_burst(mut self, tokens: u32) -> Self {
        self.burst = tokens as f64;
        self
    }

    pub fn with_rps(mut self, rps: f64) -> Self {
        self.rps = rps;
        self
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct State {
    tokens: f64,
    last: Instant,
}

/// Token-bucket limiter guarding a whole cluster.
///
/// Checked with [`try_acquire`](Self::try_acquire): an empty bucket turns
/// into a rate-limit rejection rather than a wait.
#[derive(Debug)]
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        let state = Mutex::new(State {
            tokens: cfg.burst,
            last: Instant::now(),
        });
        Self { cfg, state }
    }

    fn refill(cfg: &RateLimiterConfig, st: &mut State) {
        let now = Instant::now();
        let elapsed = now.duration_since(st.last).as_secs_f64();
        if elapsed > 0.0 {
            st.tokens = (st.tokens + elapsed * cfg.rps).min(cfg.burst);
            st.last = now;
        }
    }

    /// Take a token if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        if self.cfg.rps <= 0.0 {
            return true;
        }
        let mut st = self.state.lock().await;
        Self::refill(&self.cfg, &mut st);
        if st.tokens >= 1.0 {
            st.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Bucket level after refilling; reported by the invoker's observability view.
    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        let mut st = self.state.lock().await;
        let mut estimated_wait_ms = None;
        if self.cfg.rps > 0.0 {
            Self::refill(&self.cfg, &mut st);
            if st.tokens < 1.0 {
                estimated_wait_ms = Some(((1.0 - st.tokens) / self.cfg.rps * 1000.0) as u64);
            }
        }
        RateLimiterSnapshot {
            rps: self.cfg.rps,
            burst: self.cfg.burst,
            tokens: st.tokens,
            estimated_wait_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_config_from_rps() {
        let config = RateLimiterConfig::from_rps(0.5).unwrap();
        assert_eq!(config.rps, 0.5);
        assert_eq!(config.burst, 1.0);
        assert!(RateLimiterConfig::from_rps(-1.0).is_none());
        assert!(RateLimiterConfig::from_rps(f64::NAN).is_none());
    }

    #[tokio::test]
    async fn test_try_acquire_drains_burst() {
        let limiter = RateLimiter::new(RateLimiterConfig::new().with_burst(3).with_rps(1.0));
        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
        assert!(limiter.snapshot().await.estimated_wait_ms.is_some());
    }

    #[tokio::test]
    async fn test_zero_rps_is_unlimited() {
        let limiter = RateLimiter::new(RateLimiterConfig::from_rps(0.0).unwrap());
        for _ in 0..100 {
            assert!(limiter.try_acquire().await);
        }
    }

    #[tokio::test]
    async fn test_refill_over_time() {
        let limiter = RateLimiter::new(RateLimiterConfig::new().with_burst(1).with_rps(100.0));
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(limiter.try_acquire().await);
    }
}
