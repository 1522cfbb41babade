use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::{Duration, Instant};

use super::{CoordBackend, Node};
use crate::error::Result;

/// Aggregated latency for one coordination operation
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct OpTimes {
    pub count: u64,
    pub errors: u64,
    pub total_micros: u64,
    pub max_micros: u64,
}

/// In-process response-time table, readable over the HTTP API
#[derive(Default)]
pub struct ResponseTimes {
    ops: Mutex<BTreeMap<&'static str, OpTimes>>,
}

impl ResponseTimes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, op: &'static str, elapsed: Duration, failed: bool) {
        let micros = elapsed.as_micros().min(u64::MAX as u128) as u64;
        let mut ops = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = ops.entry(op).or_default();
        entry.count += 1;
        entry.total_micros = entry.total_micros.saturating_add(micros);
        entry.max_micros = entry.max_micros.max(micros);
        if failed {
            entry.errors += 1;
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, OpTimes> {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }
}

/// Middleware that times every call on the wrapped backend.
///
/// Latency goes to the `coord_op_seconds` histogram and to the shared
/// [`ResponseTimes`] table. Only retryable failures count as errors;
/// `NodeExists` and `BadVersion` are ordinary answers.
pub struct InstrumentedBackend {
    inner: Arc<dyn CoordBackend>,
    times: Arc<ResponseTimes>,
}

impl InstrumentedBackend {
    pub fn new(inner: Arc<dyn CoordBackend>, times: Arc<ResponseTimes>) -> Self {
        Self { inner, times }
    }

    async fn timed<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = fut.await;
        let elapsed = start.elapsed();
        let failed = matches!(&result, Err(e) if e.is_retryable());

        metrics::histogram!("coord_op_seconds", "op" => op).record(elapsed.as_secs_f64());
        if failed {
            metrics::counter!("coord_op_errors_total", "op" => op).increment(1);
        }
        self.times.record(op, elapsed, failed);
        result
    }
}

#[async_trait]
impl CoordBackend for InstrumentedBackend {
    async fn ping(&self) -> Result<()> {
        self.timed("ping", self.inner.ping()).await
    }

    async fn create(&self, path: &str, value: &[u8], owner: Option<u64>) -> Result<()> {
        self.timed("create", self.inner.create(path, value, owner)).await
    }

    async fn read(&self, path: &str) -> Result<Option<Node>> {
        self.timed("read", self.inner.read(path)).await
    }

    async fn update(&self, path: &str, value: &[u8], version: Option<i64>) -> Result<i64> {
        self.timed("update", self.inner.update(path, value, version)).await
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        self.timed("delete", self.inner.delete(path, recursive)).await
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.timed("children", self.inner.children(path)).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.timed("exists", self.inner.exists(path)).await
    }

    async fn release_owner(&self, owner: u64) -> Result<usize> {
        self.timed("release_owner", self.inner.release_owner(owner)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::memory::MemoryBackend;

    #[tokio::test]
    async fn test_records_each_operation() {
        let times = Arc::new(ResponseTimes::new());
        let backend = InstrumentedBackend::new(Arc::new(MemoryBackend::new()), times.clone());

        backend.create("/a", b"1", None).await.unwrap();
        backend.read("/a").await.unwrap();
        backend.read("/b").await.unwrap();
        let _ = backend.create("/a", b"2", None).await;

        let snap = times.snapshot();
        assert_eq!(snap["create"].count, 2);
        assert_eq!(snap["create"].errors, 0);
        assert_eq!(snap["read"].count, 2);
    }

    #[tokio::test]
    async fn test_counts_unavailable_as_error() {
        let times = Arc::new(ResponseTimes::new());
        let memory = Arc::new(MemoryBackend::new());
        memory.set_available(false);
        let backend = InstrumentedBackend::new(memory, times.clone());

        assert!(backend.ping().await.is_err());
        assert_eq!(times.snapshot()["ping"].errors, 1);
    }
}
