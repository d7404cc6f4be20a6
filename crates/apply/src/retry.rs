//! Exponential backoff with jitter for store calls that may fail transiently.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first (0 = unbounded)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self { max_attempts: attempts, ..Default::default() }
    }

    /// Zero delays; for tests.
    pub fn immediate(attempts: u32) -> Self {
        Self { max_attempts: attempts, initial_delay: Duration::ZERO, max_delay: Duration::ZERO, backoff_multiplier: 1.0 }
    }
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the attempt budget runs out. Returns the last error and the
/// number of attempts made.
pub async fn retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, (E, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;
    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        if !should_retry(&err) {
            debug!(operation = %operation_name, attempt, error = %err, "not retryable");
            return Err((err, attempt));
        }
        if config.max_attempts > 0 && attempt >= config.max_attempts {
            warn!(operation = %operation_name, attempt, error = %err, "retry budget exhausted");
            return Err((err, attempt));
        }
        // 0.5x..1.5x jitter
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let sleep_for = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
        debug!(operation = %operation_name, attempt, error = %err, delay_ms = sleep_for.as_millis() as u64, "retrying");
        if !sleep_for.is_zero() {
            tokio::time::sleep(sleep_for).await;
        }
        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_after_retryable_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let res: Result<u32, (String, u32)> = retry_if(&RetryConfig::immediate(5), "op", |_| true, || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(format!("fail {}", n)) } else { Ok(n) }
            }
        })
        .await;
        assert_eq!(res, Ok(3));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_on_non_retryable() {
        let res: Result<(), (&str, u32)> =
            retry_if(&RetryConfig::immediate(5), "op", |e: &&str| *e != "fatal", || async { Err("fatal") }).await;
        assert_eq!(res, Err(("fatal", 1)));
    }

    #[tokio::test]
    async fn respects_budget() {
        let res: Result<(), (&str, u32)> =
            retry_if(&RetryConfig::immediate(4), "op", |_| true, || async { Err("again") }).await;
        assert_eq!(res, Err(("again", 4)));
    }
}
