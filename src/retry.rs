use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::hypervisor::HypervisorError;

/// Exponential backoff for calls that may hit a transient outage.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Runs `call` until it succeeds, fails with a non-retryable error, or the
    /// attempts are spent. Each attempt is bounded by `timeout`.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        timeout: Duration,
        mut call: F,
    ) -> Result<T, HypervisorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HypervisorError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match with_deadline(timeout, call()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.delay_for(attempt);
                    debug!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying hypervisor call after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Bounds a hypervisor call; expiry counts as the cluster being unreachable.
pub async fn with_deadline<T, Fut>(timeout: Duration, call: Fut) -> Result<T, HypervisorError>
where
    Fut: Future<Output = Result<T, HypervisorError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(HypervisorError::Unreachable(format!(
            "call did not complete within {}ms",
            timeout.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(30), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn retries_only_unreachable() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(4)
            .run("start", Duration::from_secs(1), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HypervisorError::Rejected("bad storage".into()))
            })
            .await;
        assert!(matches!(result, Err(HypervisorError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = AtomicU32::new(0);
        let result = fast_policy(4)
            .run("start", Duration::from_secs(1), || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(HypervisorError::Unreachable("down".into()))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(3)
            .run("stop", Duration::from_secs(1), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HypervisorError::Unreachable("down".into()))
            })
            .await;
        assert!(matches!(result, Err(HypervisorError::Unreachable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn deadline_maps_to_unreachable() {
        let result: Result<(), _> = with_deadline(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(HypervisorError::Unreachable(_))));
    }
}
