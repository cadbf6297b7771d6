use anyhow::{Result, anyhow};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::warn;

/// Rolling-failure circuit breaker.
///
/// After `threshold` consecutive failures the breaker opens for `open_for`;
/// while open every call is rejected without touching the protected
/// operation. Once `open_for` elapses a single trial call is let through;
/// success closes the breaker, failure reopens it.
pub struct CircuitBreaker {
    threshold: u32,
    open_for: Duration,
    state: Mutex<BreakerState>,
}

#[derive(Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_for: Duration) -> Self {
        Self {
            threshold,
            open_for,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Returns an error while the breaker is open.
    pub fn check(&self) -> Result<()> {
        let state = self.lock();
        match state.opened_at {
            Some(opened) if opened.elapsed() < self.open_for => Err(anyhow!(
                "circuit breaker open, retrying in {:?}",
                self.open_for.saturating_sub(opened.elapsed())
            )),
            // half-open: allow a trial call
            _ => Ok(()),
        }
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.lock();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold {
            state.opened_at = Some(Instant::now());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded retry with per-attempt timeout, used in front of the version
/// probe together with its [`CircuitBreaker`].
#[derive(Clone, Copy, Debug)]
pub struct FaultPolicy {
    pub attempts: u32,
    pub delay: Duration,
    pub timeout: Duration,
}

impl FaultPolicy {
    /// Run `op` at most `attempts` times, each bounded by `timeout`, waiting
    /// `delay` between attempts. Failures are recorded on the breaker as a
    /// single unit of work; an open breaker rejects the call up front.
    pub async fn run<T, F, Fut>(&self, breaker: &CircuitBreaker, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        breaker.check()?;

        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match tokio::time::timeout(self.timeout, op()).await {
                Ok(Ok(value)) => {
                    breaker.record_success();
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    warn!(attempt, max = self.attempts, "operation failed: {e}");
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(
                        attempt,
                        max = self.attempts,
                        "operation timed out after {:?}",
                        self.timeout
                    );
                    last_error = Some(anyhow!("operation timed out after {:?}", self.timeout));
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.delay).await;
            }
        }

        breaker.record_failure();
        Err(last_error.unwrap_or_else(|| anyhow!("operation failed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> FaultPolicy {
        FaultPolicy {
            attempts: 3,
            delay: Duration::from_millis(1),
            timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_succeeds_first_attempt() {
        let breaker = CircuitBreaker::new(10, Duration::from_secs(30));
        let calls = AtomicU32::new(0);

        let result = policy()
            .run(&breaker, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, anyhow::Error>(42) }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let breaker = CircuitBreaker::new(10, Duration::from_secs(30));
        let calls = AtomicU32::new(0);

        let result = policy()
            .run(&breaker, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(anyhow!("transient"))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let breaker = CircuitBreaker::new(10, Duration::from_secs(30));
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy()
            .run(&breaker, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("down")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(30));
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            let _: Result<()> = policy()
                .run(&breaker, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(anyhow!("down")) }
                })
                .await;
        }
        let before = calls.load(Ordering::SeqCst);

        // breaker is open now, op must not run
        let result: Result<()> = policy()
            .run(&breaker, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("down")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn test_breaker_half_open_allows_trial() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        assert!(breaker.check().is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.check().is_ok(), "breaker should half-open");

        breaker.record_success();
        assert!(breaker.check().is_ok());
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new(10, Duration::from_secs(30));
        let short = FaultPolicy {
            attempts: 1,
            delay: Duration::from_millis(1),
            timeout: Duration::from_millis(10),
        };

        let result: Result<()> = short
            .run(&breaker, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(result.is_err());
    }
}
