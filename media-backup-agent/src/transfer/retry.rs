//! Retry policy and the pacing clock used between uploads.

use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per file, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound of the random delay added to a server rate-limit hint
    pub rate_limit_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            rate_limit_jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt number `attempt` (1-based): 1s, 2s, 4s ...
    /// capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// The server hint plus up to `rate_limit_jitter` extra.
    pub fn rate_limit_wait(&self, retry_after: Duration) -> Duration {
        let jitter_ms = self.rate_limit_jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        retry_after + Duration::from_millis(extra)
    }
}

/// Source of every sleep the uploader performs.
#[async_trait]
pub trait Pacer: Send + Sync {
    /// Sleep for `duration` unless `cancel` fires first. Returns `false`
    /// when the wait was cut short by cancellation.
    async fn pause(&self, duration: Duration, cancel: &CancellationToken) -> bool;
}

/// Real wall-clock pacing
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioPacer;

#[async_trait]
impl Pacer for TokioPacer {
    async fn pause(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = cancel.cancelled() => false,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let policy = RetryPolicy::default();
        let waits: Vec<u64> = (1..=5).map(|n| policy.backoff(n).as_secs()).collect();
        assert_eq!(waits, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_backoff_capped_and_monotonic() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 1..=64 {
            let wait = policy.backoff(attempt);
            assert!(wait >= previous);
            assert!(wait <= Duration::from_secs(60));
            previous = wait;
        }
        assert_eq!(policy.backoff(7), Duration::from_secs(60));
    }

    #[test]
    fn test_rate_limit_wait_never_below_hint() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let wait = policy.rate_limit_wait(Duration::from_secs(7));
            assert!(wait >= Duration::from_secs(7));
            assert!(wait <= Duration::from_secs(8));
        }

        let exact = RetryPolicy {
            rate_limit_jitter: Duration::ZERO,
            ..RetryPolicy::default()
        };
        assert_eq!(exact.rate_limit_wait(Duration::from_secs(3)), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_tokio_pacer_stops_on_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(!TokioPacer.pause(Duration::from_secs(3600), &token).await);

        let fresh = CancellationToken::new();
        assert!(TokioPacer.pause(Duration::from_millis(1), &fresh).await);
    }
}
