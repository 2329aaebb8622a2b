use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::errors::Result;

/// Capped exponential backoff settings for one operation.
///
/// Delays grow as `min_delay * multiplier^(n-1)` for the n-th retry, clamped
/// to `max_delay`. The policy is a plain value so callers (and tests) can
/// inspect the exact schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub multiplier: f64,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Envelope shared by the transfer, cleanup and foundation-script steps.
    pub fn transfer() -> Self {
        Self {
            max_attempts: 5,
            multiplier: 1.5,
            min_delay: Duration::from_secs(20),
            max_delay: Duration::from_secs(300),
        }
    }

    /// Delay before the n-th retry (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1) as i32;
        let secs = self.min_delay.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// The closure receives the current retry count (0 on the first attempt) so
/// callers can surface it in their own logs. The last error is re-raised
/// unchanged once `max_attempts` attempts have failed.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry_count: u32 = 0;
    loop {
        match operation(retry_count).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                retry_count += 1;
                if retry_count >= policy.max_attempts {
                    warn!(
                        "{op_name} failed after {} attempt(s): {err}",
                        policy.max_attempts
                    );
                    return Err(err);
                }
                let delay = policy.delay_for(retry_count);
                warn!(
                    "{op_name} failed: {err}. Retry count: {retry_count}, next attempt in {}s",
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DbtapError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            multiplier: 1.5,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_delays_grow_and_clamp() {
        let policy = RetryPolicy::transfer();
        assert_eq!(policy.delay_for(1), Duration::from_secs(20));
        assert_eq!(policy.delay_for(2), Duration::from_secs(30));
        assert_eq!(policy.delay_for(3), Duration::from_secs(45));
        assert!(policy.delay_for(20) <= Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_policy(&fast_policy(5), "copy", |_retry| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(DbtapError::CopyTransient("TransfersFailed=1".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reraises_last_error() {
        let result: Result<()> = retry_with_policy(&fast_policy(3), "copy", |_retry| async {
            Err(DbtapError::CopyTransient("always down".into()))
        })
        .await;
        match result {
            Err(DbtapError::CopyTransient(msg)) => assert_eq!(msg, "always down"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_count_passed_to_operation() {
        let mut seen = Vec::new();
        let _ = retry_with_policy(&fast_policy(3), "copy", |retry| {
            seen.push(retry);
            async move { Err::<(), _>(DbtapError::CopyTransient("x".into())) }
        })
        .await;
        assert_eq!(seen, vec![0, 1, 2]);
    }
}
