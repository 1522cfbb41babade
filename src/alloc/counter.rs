use std::sync::Arc;

use crate::coord::CoordClient;
use crate::error::{PipelineError, Result};

/// Named integer with an upper bound, shared through the coordination
/// service and updated by compare-and-swap.
pub struct QuotaCounter {
    coord: Arc<CoordClient>,
    path: String,
    max: i64,
}

impl QuotaCounter {
    /// Open the counter at `path`, creating it at zero when absent
    pub async fn new(coord: Arc<CoordClient>, path: &str, max: i64) -> Result<Self> {
        match coord.create(path, b"0").await {
            Ok(()) | Err(PipelineError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
        Ok(Self {
            coord,
            path: path.to_string(),
            max,
        })
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    pub fn set_max(&mut self, max: i64) {
        self.max = max;
    }

    pub async fn value(&self) -> Result<i64> {
        Ok(self.read().await?.0)
    }

    /// Apply `delta` and return the new value.
    ///
    /// Increments beyond `max` fail with `OverQuota`; decrements never do
    /// and never take the value below zero.
    pub async fn adjust(&self, delta: i64) -> Result<i64> {
        loop {
            let (value, version) = self.read().await?;
            let mut proposed = value;
            if value > 0 || delta > 0 {
                proposed = value.saturating_add(delta);
            }
            if proposed > self.max && delta > 0 {
                return Err(PipelineError::OverQuota {
                    name: self.path.clone(),
                    proposed,
                    max: self.max,
                });
            }
            let proposed = proposed.max(0);

            match self
                .coord
                .update(&self.path, proposed.to_string().as_bytes(), Some(version))
                .await
            {
                Ok(_) => return Ok(proposed),
                Err(PipelineError::BadVersion(_)) => {
                    tracing::debug!("Counter {} changed underneath, retrying", self.path);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn read(&self) -> Result<(i64, i64)> {
        let node = self
            .coord
            .read(&self.path)
            .await?
            .ok_or_else(|| PipelineError::NotFound(self.path.clone()))?;
        let text = String::from_utf8_lossy(&node.value);
        let value = text.trim().parse::<i64>().map_err(|e| {
            PipelineError::Serialization(format!("counter {} holds {:?}: {}", self.path, text, e))
        })?;
        Ok((value, node.version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{memory::MemoryBackend, retry::RetryPolicy};
    use tokio_test::{assert_err, assert_ok};

    async fn counter(max: i64) -> QuotaCounter {
        let coord = CoordClient::connect(Arc::new(MemoryBackend::new()), "/fp", RetryPolicy::default())
            .await
            .unwrap();
        coord.counter("vn-count", max).await.unwrap()
    }

    #[tokio::test]
    async fn test_increment_until_quota() {
        let c = counter(2).await;
        assert_eq!(assert_ok!(c.adjust(1).await), 1);
        assert_eq!(assert_ok!(c.adjust(1).await), 2);
        let err = assert_err!(c.adjust(1).await);
        assert_eq!(err.kind(), "over_quota");
        assert_eq!(assert_ok!(c.value().await), 2);
    }

    #[tokio::test]
    async fn test_corrupt_counter_is_an_error() {
        let c = counter(10).await;
        let node = c.coord.read(&c.path).await.unwrap().unwrap();
        c.coord.update(&c.path, b"garbage", Some(node.version)).await.unwrap();

        let err = assert_err!(c.adjust(1).await);
        assert_eq!(err.kind(), "serialization");
        assert_eq!(assert_err!(c.value().await).kind(), "serialization");
        let raw = c.coord.read_string(&c.path).await.unwrap();
        assert_eq!(raw.as_deref(), Some("garbage"));
    }

    #[tokio::test]
    async fn test_decrement_never_over_quota_or_negative() {
        let mut c = counter(5).await;
        c.adjust(3).await.unwrap();
        c.set_max(1);
        assert_eq!(c.adjust(-1).await.unwrap(), 2);
        assert_eq!(c.adjust(-10).await.unwrap(), 0);
        assert_eq!(c.adjust(-1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bounds_hold_over_sequence() {
        let c = counter(4).await;
        for delta in [1, 2, -1, 3, 1, -5, 2, 2, 1] {
            let _ = c.adjust(delta).await;
            let v = c.value().await.unwrap();
            assert!((0..=4).contains(&v), "value {} out of bounds", v);
        }
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_serialized() {
        let coord = CoordClient::connect(Arc::new(MemoryBackend::new()), "/fp", RetryPolicy::default())
            .await
            .unwrap();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let coord = coord.clone();
            tasks.push(tokio::spawn(async move {
                let c = coord.counter("shared", 100).await.unwrap();
                c.adjust(1).await.unwrap()
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(coord.counter("shared", 100).await.unwrap().value().await.unwrap(), 8);
    }
}
