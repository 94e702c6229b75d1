use std::future::Future;
use std::time::Duration;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Upper bound on a single attempt.
    pub timeout: Duration,
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each retry after it.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, retry: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }
}

/// Runs `operation` under the policy's timeout, retrying transient failures.
///
/// Non-transient errors (malformed output, rejected requests) are returned
/// on first occurrence.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut retry = 0;

    loop {
        let result = match tokio::time::timeout(policy.timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout_error()),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && retry < policy.max_retries => {
                retry += 1;
                let delay = policy.delay(retry);

                tracing::warn!(
                    operation = name,
                    retry,
                    ?delay,
                    code = err.code,
                    "transient failure, retrying"
                );

                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                tracing::warn!(
                    operation = name,
                    code = err.code,
                    message = %err.message,
                    "giving up"
                );
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
fn quick_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        timeout: Duration::from_millis(100),
        max_retries,
        backoff: Duration::from_millis(1),
    }
}

#[test]
fn backoff_doubles() {
    let policy = RetryPolicy::default();

    assert_eq!(policy.delay(1), Duration::from_millis(500));
    assert_eq!(policy.delay(2), Duration::from_millis(1000));
    assert_eq!(policy.delay(3), Duration::from_millis(2000));
}

#[test]
fn backoff_saturates() {
    let policy = RetryPolicy {
        backoff: Duration::from_secs(u64::MAX / 2),
        ..RetryPolicy::default()
    };

    assert_eq!(policy.delay(3), Duration::MAX);
    assert_eq!(policy.delay(u32::MAX), Duration::MAX);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let count = AtomicU32::new(0);
    let attempts = &count;

    let result = with_retry(&quick_policy(2), "test", move || async move {
        if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(Error::upstream_error())
        } else {
            Ok("done")
        }
    })
    .await;

    tokio_test::assert_ok!(result);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retries_are_bounded() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let count = AtomicU32::new(0);
    let attempts = &count;

    let result: Result<(), Error> = with_retry(&quick_policy(2), "test", move || async move {
        attempts.fetch_add(1, Ordering::SeqCst);
        Err(Error::upstream_error())
    })
    .await;

    assert_eq!(result.unwrap_err(), Error::upstream_error());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn malformed_output_is_not_retried() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let count = AtomicU32::new(0);
    let attempts = &count;

    let result: Result<(), Error> = with_retry(&quick_policy(5), "test", move || async move {
        attempts.fetch_add(1, Ordering::SeqCst);
        Err(Error::malformed_output_error("not json"))
    })
    .await;

    assert!(result.unwrap_err().is_malformed_output_error());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn slow_attempts_time_out() {
    let result: Result<(), Error> = with_retry(&quick_policy(0), "test", move || async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    })
    .await;

    assert_eq!(result.unwrap_err(), Error::timeout_error());
}
