use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Linear backoff: `start`, then `start + step`, ... capped at `max`,
/// for at most `attempts` tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub attempts: u32,
    pub start: Duration,
    pub step: Duration,
    pub max: Duration,
}

impl Backoff {
    pub const fn new(attempts: u32, start_secs: u64, step_secs: u64, max_secs: u64) -> Self {
        Self {
            attempts,
            start: Duration::from_secs(start_secs),
            step: Duration::from_secs(step_secs),
            max: Duration::from_secs(max_secs),
        }
    }

    /// Delay to wait after failed attempt `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.start
            .saturating_add(self.step.saturating_mul(attempt))
            .min(self.max)
    }
}

/// Run `op` until it succeeds or the backoff runs out of attempts; the last
/// error is returned.
pub async fn retry_with_backoff<T, F, Fut>(backoff: Backoff, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 < backoff.attempts => {
                let delay = backoff.delay(attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    what,
                    attempt + 1,
                    backoff.attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!("{} failed after {} attempts: {}", what, attempt + 1, e);
                return Err(e);
            }
        }
    }
}

/// Wall-clock format used for commit timestamps
pub fn format_timestamp(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}
