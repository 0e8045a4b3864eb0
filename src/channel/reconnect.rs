//! Bounded reconnect strategy.
//!
//! A [`ReconnectPolicy`] tries an operation up to `max_attempts` times,
//! sleeping `backoff(attempt)` after each failed attempt except the last,
//! and gives up quietly by returning `None`. Cancellation interrupts both the
//! attempt and the wait.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Delay after the numbered (1-based) failed attempt.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Max attempts plus a backoff function.
#[derive(Clone)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    backoff: BackoffFn,
}

impl std::fmt::Debug for ReconnectPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("first_backoff", &self.backoff(1))
            .finish_non_exhaustive()
    }
}

impl ReconnectPolicy {
    /// Policy with an arbitrary backoff function.
    pub fn new<F>(max_attempts: u32, backoff: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self {
            max_attempts,
            backoff: Arc::new(backoff),
        }
    }

    /// `step × attempt` between attempts.
    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        Self::new(max_attempts, move |attempt| step.saturating_mul(attempt))
    }

    /// The mirror policy from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::linear(config.mirror_max_attempts, config.mirror_backoff())
    }

    /// Attempts made before giving up.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        (self.backoff)(attempt)
    }

    /// Run `op` until it succeeds, the attempts run out, or `cancel` fires.
    ///
    /// `op` receives the 1-based attempt number. Failures are logged, never
    /// returned.
    pub async fn run<T, E, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Option<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        for attempt in 1..=self.max_attempts {
            let result = tokio::select! {
                () = cancel.cancelled() => return None,
                result = op(attempt) => result,
            };

            match result {
                Ok(value) => return Some(value),
                Err(e) => {
                    log::warn!("Attempt {attempt}/{} failed: {e}", self.max_attempts);
                }
            }

            if attempt < self.max_attempts {
                let delay = self.backoff(attempt);
                log::debug!("Retrying in {delay:?}");
                tokio::select! {
                    () = cancel.cancelled() => return None,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }

        log::info!("Giving up after {} attempt(s)", self.max_attempts);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    #[test]
    fn test_linear_backoff() {
        let policy = ReconnectPolicy::linear(3, Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let policy = ReconnectPolicy::linear(3, Duration::from_millis(10));
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Option<()> = policy
            .run(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("refused") }
            })
            .await;

        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 10ms after attempt 1, 20ms after attempt 2, nothing after the last.
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_returns_first_success() {
        let policy = ReconnectPolicy::linear(3, Duration::from_millis(5));
        let result = policy
            .run(&CancellationToken::new(), |attempt| async move {
                if attempt < 2 {
                    Err("not yet")
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result, Some(2));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let policy = ReconnectPolicy::linear(3, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result: Option<()> = policy
            .run(&cancel, |_| async { Err::<(), _>("refused") })
            .await;
        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
