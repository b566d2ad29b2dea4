use std::time::Duration;

const BACKOFF_FACTOR: u32 = 2;

/// Poll delay that grows while cycles keep failing.
#[derive(Debug, Clone)]
pub struct RetryState {
    base_delay: Duration,
    max_delay: Duration,
    consecutive_failures: u32,
}

impl RetryState {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            consecutive_failures: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn current_delay(&self) -> Duration {
        if self.consecutive_failures == 0 {
            return self.base_delay;
        }

        let factor = BACKOFF_FACTOR.saturating_pow(self.consecutive_failures - 1);
        let delay_secs = self.base_delay.as_secs().saturating_mul(factor as u64);

        Duration::from_secs(delay_secs).min(self.max_delay)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_in_backoff(&self) -> bool {
        self.consecutive_failures > 0
    }
}
