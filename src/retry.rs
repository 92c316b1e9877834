use std::time::Duration;

/// Backoff and give-up decisions applied by workers on job failure.
/// Transient and permanent failures share the same attempt counter; the
/// remote side does not signal the distinction reliably enough to act on.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// delay = base * 2^attempts, with the exponent saturating at 31.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        self.base_delay.mul_f64(2f64.powi(attempts.min(31) as i32))
    }

    /// A job failing with `attempts` prior to this failure is requeued
    /// while attempts < max_retries, so a job is tried 1 + max_retries
    /// times in total before it is abandoned.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_retries
    }
}
