//! Bounded fixed-interval polling with an injectable clock.

use crate::config::RetryConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

/// Source of wall-clock time and sleeping.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Real time backed by chrono and the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A fixed number of checks separated by a fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.attempts, Duration::from_millis(config.interval_ms))
    }

    /// Total time spent sleeping if every check fails.
    pub fn budget(&self) -> Duration {
        self.interval * self.attempts.saturating_sub(1)
    }

    /// Run `check` until it returns true or the attempts are exhausted.
    /// Sleeps only between attempts, never after the last one.
    pub async fn poll_until<F, Fut>(&self, clock: &dyn Clock, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for attempt in 1..=self.attempts {
            if check().await {
                return true;
            }
            if attempt < self.attempts {
                tracing::debug!(attempt, attempts = self.attempts, "Condition not met, retrying");
                clock.sleep(self.interval).await;
            }
        }
        false
    }
}
