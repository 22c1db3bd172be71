use exponential_backoff::Backoff;
use std::time::Duration;

/// Capped exponential backoff between attempts of a retried operation.
#[derive(Debug, Clone)]
pub struct Retry {
    attempt: u32,
    max_attempts: u32,
    max: Duration,
    backoff: Backoff,
}

impl Retry {
    pub fn new(max_attempts: u32, min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            attempt: 0,
            max_attempts,
            max,
            backoff: backoff(min, max),
        }
    }

    pub fn from_config(config: &crate::Config, max_attempts: u32) -> Self {
        Self::new(max_attempts, config.retry_backoff, config.retry_backoff_max)
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Record a failed attempt, returning the delay before the next one
    /// or None if attempts are exhausted.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt > self.max_attempts {
            return None;
        }
        let delay = self.backoff.next(self.attempt).unwrap_or(self.max);
        Some(delay.min(self.max))
    }

    /// Like `next_backoff`, but sleeps and returns false if attempts are exhausted.
    pub async fn wait(&mut self) -> bool {
        match self.next_backoff() {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                true
            }
            None => false,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Delay before the `attempt`'th retry of a batch or request, without tracking state.
pub fn delay(config: &crate::Config, attempt: u32) -> Duration {
    let max = config.retry_backoff_max.max(config.retry_backoff);
    backoff(config.retry_backoff, max)
        .next(attempt.max(1))
        .unwrap_or(max)
        .min(max)
}

fn backoff(min: Duration, max: Duration) -> Backoff {
    let mut backoff = Backoff::new(u32::MAX, min, Some(max));
    backoff.set_factor(2);
    backoff.set_jitter(0.2);
    backoff
}
