use tokio::time::Duration;

/// Retry policy for coordination calls.
///
/// Attempts are unbounded; the per-attempt delay grows geometrically up to
/// `max_delay`. A session that stays suspended longer than
/// `session_timeout` is declared lost.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    pub session_timeout: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt.min(16));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2,
            session_timeout: Duration::from_secs(30),
        }
    }
}
