use std::time::Duration;

pub const DEFAULT_BACKOFF_COEFFICIENT: f64 = 2.0;

/// Retry policy applied to every dispatched operation.
///
/// With `maximum_attempts = None` the call retries until its own timeout
/// expires; the timeout is then the only bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub maximum_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            maximum_interval: Duration::from_secs(10),
            backoff_coefficient: DEFAULT_BACKOFF_COEFFICIENT,
            maximum_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let coefficient = if self.backoff_coefficient > 0.0 {
            self.backoff_coefficient
        } else {
            DEFAULT_BACKOFF_COEFFICIENT
        };
        let factor = coefficient.powi(attempt.saturating_sub(1).min(64) as i32);
        let secs = self.initial_interval.as_secs_f64() * factor;
        let capped = secs.min(self.maximum_interval.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    pub fn is_exhausted(&self, attempts_made: u32) -> bool {
        match self.maximum_attempts {
            Some(max) if max > 0 => attempts_made >= max,
            _ => false,
        }
    }
}
