//! Process-global token bucket gating every exchange request.
//!
//! On exhaustion the caller gets `Throttled` and defers the operation to the
//! next cycle; the bucket never blocks a cycle.

use std::sync::Mutex;
use std::time::Instant;

use crate::config::TransportConfig;
use crate::error::{LirabotError, Result};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: `rps` refill rate with a `burst` ceiling.
#[derive(Debug)]
pub struct RateLimiter {
    rps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(rps: u32, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            rps: rps.max(1) as f64,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(cfg: &TransportConfig) -> Self {
        Self::new(cfg.rate_limit_rps, cfg.rate_limit_burst)
    }

    /// Take one token, or fail with `Throttled` if the bucket is empty.
    pub fn acquire(&self, operation: &str) -> Result<()> {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");

        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rps).min(self.burst);
        state.last_refill = Instant::now();

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            Err(LirabotError::Throttled(format!(
                "rate limit exhausted for {}",
                operation
            )))
        }
    }

    /// Remaining capacity, for logging.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rps).min(self.burst);
        state.last_refill = Instant::now();
        state.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_tokens_then_throttled() {
        let limiter = RateLimiter::new(1, 3);
        for i in 0..3 {
            assert!(limiter.acquire("op").is_ok(), "token {} should be granted", i);
        }
        let err = limiter.acquire("submit").unwrap_err();
        assert!(matches!(err, LirabotError::Throttled(_)));
        assert!(err.to_string().contains("submit"));
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(1000, 1);
        assert!(limiter.acquire("op").is_ok());
        assert!(limiter.acquire("op").is_err());
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(limiter.acquire("op").is_ok(), "should refill at 1000 rps");
    }

    #[test]
    fn refill_never_exceeds_burst() {
        let limiter = RateLimiter::new(1000, 2);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(limiter.available() <= 2.0);
    }
}
