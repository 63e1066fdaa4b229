//! Exponential backoff for transient failures of remote calls.

use std::future::Future;
use std::time::Duration;

use log::warn;
use serde::Deserialize;

/// How often and how patiently a remote call is retried.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Retries after the first attempt. `0` disables retrying.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Upper bound of a single attempt.
    pub call_timeout_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 20_000,
            call_timeout_ms: 120_000,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry as i32);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the policy runs out of retries.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &BackoffPolicy, is_transient: impl Fn(&E) -> bool, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output=Result<T, E>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if retry < policy.max_retries && is_transient(&err) => {
                let delay = policy.delay_for(retry);
                warn!("transient failure ({}), retrying in {:?} ({}/{})", err, delay, retry + 1, policy.max_retries);
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod test_retry {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::{retry_with_backoff, BackoffPolicy};

    fn fast_policy(max_retries: u32) -> BackoffPolicy {
        BackoffPolicy { max_retries, initial_delay_ms: 1, max_delay_ms: 2, ..Default::default() }
    }

    #[test]
    fn test_delay_growth() {
        let policy = BackoffPolicy { initial_delay_ms: 100, multiplier: 2.0, max_delay_ms: 350, ..Default::default() };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let result: Result<u32, String> = retry_with_backoff(&fast_policy(3), |_| true, move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < 2 { Err(format!("flaky {}", n)) } else { Ok(n) }
        }).await;
        assert_eq!(result, Ok(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let result: Result<(), String> = retry_with_backoff(&fast_policy(2), |_| true, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("down".to_string())
        }).await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let fatal_attempts = AtomicU32::new(0);
        let counter = &fatal_attempts;
        let result: Result<(), String> = retry_with_backoff(&fast_policy(5), |e: &String| e != "fatal", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("fatal".to_string())
        }).await;
        assert_eq!(result, Err("fatal".to_string()));
        assert_eq!(fatal_attempts.load(Ordering::SeqCst), 1);
    }
}
