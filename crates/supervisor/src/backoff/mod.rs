//! Delays between service relaunches and setup retries.
//!
//! A crashing service waits one second before its first relaunch. Every
//! further relaunch doubles the delay until it reaches one minute. The
//! restart supervisor resets the delay once a run has stayed up long enough.
use std::time::Duration;

/// Yields the delay before each retry.
#[async_trait::async_trait]
pub trait BackoffStrategy: Send {
    /// Starts over from the shortest delay.
    fn reset(&mut self);
    /// Returns the delay before the next retry and advances the strategy.
    fn next_duration(&mut self) -> Duration;
    /// Sleeps for `next_duration`.
    async fn wait(&mut self) {
        tokio::time::sleep(self.next_duration()).await
    }
}

/// Doubles the delay after every retry, starting at `base` and never
/// exceeding `cap`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffStrategy {
    base: Duration,
    cap: Duration,
    previous: Option<Duration>,
}

impl Default for ExponentialBackoffStrategy {
    /// One second, doubling up to one minute, as used for supervised services.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl ExponentialBackoffStrategy {
    /// Creates a strategy starting at `base`, never exceeding `cap`.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            previous: None,
        }
    }
}

impl BackoffStrategy for ExponentialBackoffStrategy {
    fn reset(&mut self) {
        self.previous = None;
    }

    fn next_duration(&mut self) -> Duration {
        let next = match self.previous {
            None => self.base,
            Some(previous) => previous.saturating_mul(2),
        }
        .min(self.cap);
        self.previous = Some(next);
        next
    }
}
