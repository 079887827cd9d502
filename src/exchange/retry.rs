//! Bounded retry with exponential backoff and full jitter.
//!
//! Only read calls are retried here. Write calls must never be blindly
//! resubmitted; an ambiguous write outcome goes through the reconcile path
//! in the execution engine instead.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::TransportConfig;
use crate::error::{LirabotError, Result};

/// Retry budget derived from transport config.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(cfg: &TransportConfig) -> Self {
        Self {
            max_retries: cfg.rest_max_retries,
            base_delay_ms: cfg.rest_base_delay_ms,
            max_delay_ms: cfg.rest_max_delay_ms,
        }
    }

    /// Full-jitter backoff: uniform in `[0, min(max, base * 2^attempt)]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.max_delay_ms);
        let jittered = rand::thread_rng().gen_range(0..=exp.max(1));
        Duration::from_millis(jittered)
    }
}

/// A `Retry-After` hint from the exchange, in seconds.
pub fn retry_after_delay(retry_after_secs: Option<u64>, fallback: Duration) -> Duration {
    match retry_after_secs {
        Some(secs) => Duration::from_secs(secs),
        None => fallback,
    }
}

/// Run a fallible read operation with the policy's retry budget. Retries
/// only on retryable transport kinds; everything else propagates.
pub async fn with_retries<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(LirabotError::Transport {
                kind,
                message,
                retry_after_secs,
            }) if kind.is_retryable() => {
                if attempt >= policy.max_retries {
                    return Err(LirabotError::Transport {
                        kind,
                        message,
                        retry_after_secs,
                    });
                }
                let delay =
                    retry_after_delay(retry_after_secs, policy.delay_for_attempt(attempt));
                warn!(
                    operation,
                    attempt,
                    kind = %kind,
                    delay_ms = delay.as_millis() as u64,
                    "transport error; backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(other) => return Err(other),
        }
    }
}
