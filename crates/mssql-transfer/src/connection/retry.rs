//! Bounded retry around single database round trips.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::classify::classify;
use crate::error::{Result, TransferError};

/// Retry policy for one query or one write transaction.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// exhausts the attempt budget. Exhaustion escalates to
    /// [`TransferError::TransientQuery`].
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !classify(&e).is_retryable() {
                        return Err(e);
                    }
                    if attempt >= self.attempts {
                        return Err(TransferError::TransientQuery {
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    }
                    warn!(
                        "Transient error during {}, retry {}/{}: {}",
                        what,
                        attempt,
                        self.attempts - 1,
                        e
                    );
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> TransferError {
        TransferError::Job("connection reset by peer".into())
    }

    #[tokio::test]
    async fn test_succeeds_after_transient() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let result = policy
            .run("read", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(transient())
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_escalates_after_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let result: Result<()> = policy
            .run("read", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(TransferError::TransientQuery { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected TransientQuery, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let result: Result<()> = policy
            .run("read", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransferError::Job("Invalid object name 'dbo.NOPE'".into()))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(TransferError::Job(_))));
    }
}
