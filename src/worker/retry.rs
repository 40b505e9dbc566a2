use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Fixed-backoff retry budget for file transfers.
///
/// `num_tries` guarded attempts are made, each failure logged and followed by
/// `sleep_time`; one final attempt then runs unguarded so its error reaches the
/// caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub num_tries: u32,
    pub sleep_time: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            num_tries: 10,
            sleep_time: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(num_tries: u32, sleep_time: Duration) -> Self {
        Self {
            num_tries,
            sleep_time,
        }
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        for attempt in 1..=self.num_tries {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!(
                        what,
                        attempt,
                        num_tries = self.num_tries,
                        error = %e,
                        "Transfer failed, retrying"
                    );
                    tokio::time::sleep(self.sleep_time).await;
                }
            }
        }
        op().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tracing_test::traced_test;

    fn transfer_error() -> TransportError {
        TransportError::Transfer {
            local: PathBuf::from("r0.inp"),
            remote: "/tmp/r0/r0.inp".to_string(),
            reason: "connection reset".to_string(),
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn exhausted_budget_makes_one_final_attempt() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(3, Duration::ZERO);

        let result: Result<()> = policy
            .run("put r0.inp", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transfer_error())
            })
            .await;

        assert!(matches!(result, Err(TransportError::Transfer { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        logs_assert(|lines: &[&str]| {
            let retries = lines
                .iter()
                .filter(|line| line.contains("Transfer failed, retrying"))
                .count();
            if retries == 3 {
                Ok(())
            } else {
                Err(format!("expected 3 logged retries, got {}", retries))
            }
        });
    }

    #[tokio::test]
    async fn success_stops_retrying() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(5, Duration::ZERO);

        let result = policy
            .run("get r0.out", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(transfer_error())
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_tries_is_a_single_unguarded_attempt() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(0, Duration::ZERO);

        let result: Result<()> = policy
            .run("put", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transfer_error())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_between_attempts() {
        let policy = RetryPolicy::new(2, Duration::from_secs(10));
        let start = tokio::time::Instant::now();

        let _: Result<()> = policy.run("put", || async { Err(transfer_error()) }).await;

        assert!(start.elapsed() >= Duration::from_secs(20));
    }
}
