use std::time::Duration;
use tokio::time::Instant;

/// Exponential retry delay for one tracker's queue
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    failures: u32,
    retry_at: Option<Instant>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            failures: 0,
            retry_at: None,
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures,
    /// without jitter
    pub fn base_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(31));
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Records a failure and returns the delay until the retry
    pub fn fail(&mut self, now: Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let base = self.base_delay(self.failures);
        // Up to 10 % jitter so independent queues do not retry in lockstep
        let jitter = base.mul_f64(rand::random::<f64>() * 0.1);
        let delay = (base + jitter).min(self.max);
        self.retry_at = Some(now + delay);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.retry_at = None;
    }

    /// Makes the queue due again while keeping the failure count, so the
    /// next failure still backs off further
    pub fn disarm(&mut self) {
        self.retry_at = None;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Whether an unforced flush may try this queue at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| now >= at)
    }
}
