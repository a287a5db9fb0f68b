//! Bounded retries for hardware waits.
//!
//! Every wait on an instrument is bounded by a timeout and retried a small number
//! of times. Only transient failures ([`DaqError::is_transient`]) are retried; the
//! final failure is returned to the caller with the attempt count filled in.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::error::{DaqError, DaqResult};

/// Defines a policy for retrying an operation.
///
/// # Example
///
/// ```rust
/// use daq_orchestrator::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     backoff_delay: Duration::from_millis(200),
/// };
/// assert_eq!(RetryPolicy::default().max_attempts, 3);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Zero behaves like one.
    pub max_attempts: u32,

    /// Constant delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    /// 3 attempts with 100ms between them.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no delay.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::ZERO,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempts run out.
///
/// `op` receives the 1-based attempt number. A final [`DaqError::Timeout`] reports
/// the number of attempts actually made.
pub async fn retry_async<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> DaqResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = DaqResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                warn!(operation, attempt, error = %err, "transient failure, retrying");
                sleep(policy.backoff_delay).await;
                attempt += 1;
            }
            Err(DaqError::Timeout {
                operation, timeout, ..
            }) => {
                return Err(DaqError::Timeout {
                    operation,
                    attempts: attempt,
                    timeout,
                })
            }
            Err(err) => return Err(err),
        }
    }
}

/// Bound a single wait, mapping expiry to [`DaqError::Timeout`].
pub async fn with_timeout<T, Fut>(duration: Duration, operation: &str, fut: Fut) -> DaqResult<T>
where
    Fut: Future<Output = DaqResult<T>>,
{
    match timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(DaqError::Timeout {
            operation: operation.to_string(),
            attempts: 1,
            timeout: duration,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let value = retry_async(&fast(), "probe", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(DaqError::Io(std::io::ErrorKind::TimedOut.into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: DaqResult<()> = retry_async(&fast(), "probe", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DaqError::incompatible("COM1", "garbage")) }
        })
        .await;
        assert!(result.unwrap_err().is_incompatible());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_reports_attempts() {
        let result: DaqResult<()> = retry_async(&fast(), "read", |_| {
            with_timeout(Duration::from_millis(5), "read", async {
                sleep(Duration::from_secs(1)).await;
                Ok(())
            })
        })
        .await;
        match result {
            Err(DaqError::Timeout { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
