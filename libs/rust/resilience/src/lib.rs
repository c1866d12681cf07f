//! Retry with exponential backoff, shared by the coordinator round loop and client registration.
use std::future::Future;
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, IntCounter};
use rand::{thread_rng, Rng};
use tracing::{debug, warn};

static RETRY_ATTEMPTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("fedround_resilience_retry_attempts_total", "Total retry attempts executed")
        .expect("retry counter registers once")
});

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 5, base_delay: Duration::from_millis(50), max_delay: Duration::from_millis(1500), jitter: 0.25 }
    }
}

impl RetryConfig {
    /// Deterministic backoff for the given zero-based retry attempt: `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = 2f64.powi(attempt.min(30) as i32);
        std::cmp::min(self.base_delay.mul_f64(exp), self.max_delay)
    }

    /// Backoff with the configured jitter applied on top.
    pub fn jittered_backoff(&self, attempt: usize) -> Duration {
        let delay = self.backoff(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let jitter_ms = (delay.as_millis() as f64 * self.jitter.min(1.0)) as i64;
        let offset: i64 = thread_rng().gen_range(-jitter_ms..=jitter_ms);
        Duration::from_millis((delay.as_millis() as i64 + offset).max(0) as u64)
    }
}

pub async fn retry_async<F, Fut, T, E>(cfg: &RetryConfig, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        RETRY_ATTEMPTS.inc();
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= cfg.max_retries => {
                warn!(attempt, error = %e, "retries exhausted");
                return Err(e);
            }
            Err(e) => {
                let delay = cfg.jittered_backoff(attempt);
                debug!(attempt, ?delay, error = %e, "retrying after backoff");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let cfg = RetryConfig { max_retries: 5, base_delay: Duration::from_millis(10), max_delay: Duration::from_millis(50), jitter: 0.0 };
        assert_eq!(cfg.backoff(0), Duration::from_millis(10));
        assert_eq!(cfg.backoff(1), Duration::from_millis(20));
        assert_eq!(cfg.backoff(2), Duration::from_millis(40));
        assert_eq!(cfg.backoff(3), Duration::from_millis(50));
        assert_eq!(cfg.jittered_backoff(3), Duration::from_millis(50));
    }

    #[test]
    fn jitter_stays_in_band() {
        let cfg = RetryConfig { max_retries: 1, base_delay: Duration::from_millis(100), max_delay: Duration::from_secs(1), jitter: 0.5 };
        for _ in 0..50 {
            let d = cfg.jittered_backoff(0);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(150), "{d:?}");
        }
    }

    #[tokio::test]
    async fn test_retry_eventual_success() {
        let cfg = RetryConfig { max_retries: 3, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(10), jitter: 0.0 };
        let mut attempts = 0;
        let res: Result<usize, &str> = retry_async(&cfg, |_i| {
            attempts += 1;
            let current = attempts;
            async move {
                if current < 3 { Err("fail") } else { Ok(42) }
            }
        })
        .await;
        assert_eq!(res.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let cfg = RetryConfig { max_retries: 2, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(2), jitter: 0.0 };
        let mut attempts = 0;
        let res: Result<(), String> = retry_async(&cfg, |i| {
            attempts += 1;
            async move { Err(format!("attempt {i}")) }
        })
        .await;
        assert_eq!(res.unwrap_err(), "attempt 2");
        assert_eq!(attempts, 3);
    }
}
