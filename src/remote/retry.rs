use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::progress::ensure_active;

/// exponential backoff with multiplicative jitter
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// default policy for write operations
    pub fn writes() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }

    /// default policy for read operations
    pub fn reads() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// delay before re-attempting after `attempt` failures:
    /// `base * factor^attempt`, jittered by [0.85, 1.15], capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        let jitter = rand::thread_rng().gen_range(0.85..=1.15);
        let capped = (exp * jitter).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

/// run an operation under the retry policy
///
/// only retryable error classes re-attempt; everything else surfaces
/// immediately. cancellation is checked before every attempt.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        ensure_active(cancel)?;

        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    op = op_name,
                    attempt,
                    ?delay,
                    error = %e,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, NetworkErrorKind};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> Error {
        Error::Network {
            kind: NetworkErrorKind::Transient,
            message: "flaky".into(),
        }
    }

    #[test]
    fn test_delay_growth_and_cap() {
        let policy = RetryPolicy::writes();
        let d0 = policy.delay_for(0);
        assert!(d0 >= Duration::from_millis(425) && d0 <= Duration::from_millis(575));

        // far attempts hit the cap regardless of jitter
        let d20 = policy.delay_for(20);
        assert!(d20 <= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = with_retry(&RetryPolicy::reads(), &cancel, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<()> = with_retry(&RetryPolicy::writes(), &cancel, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_surfaces_immediately() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<()> = with_retry(&RetryPolicy::writes(), &cancel, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(Error::Auth {
                    kind: crate::error::AuthErrorKind::Permission,
                    message: "denied".into(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Auth { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<()> =
            with_retry(&RetryPolicy::writes(), &cancel, "test", || async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
