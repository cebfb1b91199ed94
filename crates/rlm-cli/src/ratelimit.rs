//! Request pacing toward the model API: a minimum interval between calls and
//! exponential backoff for retryable failures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Minimum spacing between request starts (milliseconds).
    pub min_interval_ms: u64,
    /// Retries after the first attempt (0 = run once).
    pub max_retries: u32,
    /// First backoff delay; doubles per retry (milliseconds).
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 200,
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
        }
    }
}

/// Serializes request starts through a single async mutex.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    last_start: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            last_start: Mutex::new(None),
        }
    }

    /// Wait until at least `min_interval_ms` has passed since the previous
    /// request started, then claim the slot.
    pub async fn wait(&self) {
        let mut last = self.last_start.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + Duration::from_millis(self.config.min_interval_ms);
            tokio::time::sleep_until(ready_at).await;
        }
        *last = Some(Instant::now());
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self
            .config
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.config.backoff_max_ms);
        Duration::from_millis(ms)
    }

    /// Run `op` under the limiter, retrying errors `retryable` accepts.
    ///
    /// Returns the last error together with the number of attempts made.
    pub async fn run<T, E, F, Fut>(
        &self,
        mut op: F,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, (E, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.config.max_retries + 1;
        let mut attempt = 1;
        loop {
            self.wait().await;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max_attempts && retryable(&e) => {
                    let delay = self.backoff(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn limiter(min_interval_ms: u64, max_retries: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            min_interval_ms,
            max_retries,
            backoff_base_ms: 100,
            backoff_max_ms: 250,
        })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let l = limiter(0, 3);
        assert_eq!(l.backoff(1), Duration::from_millis(100));
        assert_eq!(l.backoff(2), Duration::from_millis(200));
        assert_eq!(l.backoff(3), Duration::from_millis(250));
        assert_eq!(l.backoff(40), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_spaces_requests() {
        let l = limiter(1_000, 0);
        let start = Instant::now();
        l.wait().await;
        l.wait().await;
        l.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(2_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_retryable_errors() {
        let l = limiter(0, 3);
        let calls = AtomicU32::new(0);
        let result: Result<u32, (String, u32)> = l
            .run(
                || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err("busy".to_string())
                    } else {
                        Ok(n)
                    }
                },
                |_| true,
            )
            .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_fatal_error() {
        let l = limiter(0, 3);
        let calls = AtomicU32::new(0);
        let result: Result<(), (String, u32)> = l
            .run(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("bad request".to_string())
                },
                |e| e != "bad request",
            )
            .await;
        assert_eq!(result, Err(("bad request".to_string(), 1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
