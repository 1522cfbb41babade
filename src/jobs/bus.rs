use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

use crate::error::{PipelineError, Result};

/// A consumer bound to one (exchange, routing key). Dropping the receiver
/// does not unbind it; call [`MessageBus::unsubscribe`].
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Topic-style broker used between the dispatcher and job workers
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<()>;

    async fn subscribe(&self, exchange: &str, routing_key: &str) -> Result<Subscription>;

    async fn unsubscribe(&self, id: u64);
}

type Binding = (String, String);

struct Consumer {
    id: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// In-process bus. Routing keys match exactly; a message with no bound
/// consumer is dropped, as a broker drops it with no queue bound.
/// Several consumers on one key share messages round-robin.
#[derive(Default)]
pub struct LocalBus {
    bindings: Mutex<HashMap<Binding, Vec<Consumer>>>,
    next_id: AtomicU64,
    cursor: AtomicUsize,
    fail_publishes: AtomicUsize,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` publishes fail
    pub fn fail_next_publishes(&self, n: usize) {
        self.fail_publishes.store(n, Ordering::SeqCst);
    }

    pub fn consumer_count(&self, exchange: &str, routing_key: &str) -> usize {
        let bindings = self.bindings.lock().unwrap_or_else(PoisonError::into_inner);
        bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<()> {
        let injected = self
            .fail_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PipelineError::PushTransportFailure(format!(
                "broker rejected publish to {}/{}",
                exchange, routing_key
            )));
        }

        let mut bindings = self.bindings.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (exchange.to_string(), routing_key.to_string());
        let Some(consumers) = bindings.get_mut(&key) else {
            tracing::debug!("No consumer bound to {}/{}, dropping message", exchange, routing_key);
            return Ok(());
        };
        consumers.retain(|c| !c.tx.is_closed());
        if consumers.is_empty() {
            return Ok(());
        }
        let pick = self.cursor.fetch_add(1, Ordering::Relaxed) % consumers.len();
        if consumers[pick].tx.send(body).is_err() {
            tracing::warn!("Consumer {} on {}/{} went away", consumers[pick].id, exchange, routing_key);
        }
        Ok(())
    }

    async fn subscribe(&self, exchange: &str, routing_key: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut bindings = self.bindings.lock().unwrap_or_else(PoisonError::into_inner);
        bindings
            .entry((exchange.to_string(), routing_key.to_string()))
            .or_default()
            .push(Consumer { id, tx });
        Ok(Subscription { id, rx })
    }

    async fn unsubscribe(&self, id: u64) {
        let mut bindings = self.bindings.lock().unwrap_or_else(PoisonError::into_inner);
        for consumers in bindings.values_mut() {
            consumers.retain(|c| c.id != id);
        }
        // auto-delete
        bindings.retain(|_, consumers| !consumers.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exact_key_routing() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe("ex", "job.status.1").await.unwrap();
        let mut b = bus.subscribe("ex", "job.status.2").await.unwrap();

        bus.publish("ex", "job.status.1", b"one".to_vec()).await.unwrap();
        assert_eq!(a.rx.recv().await.unwrap(), b"one");
        assert!(b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_binding() {
        let bus = LocalBus::new();
        let sub = bus.subscribe("ex", "k").await.unwrap();
        assert_eq!(bus.consumer_count("ex", "k"), 1);
        bus.unsubscribe(sub.id).await;
        assert_eq!(bus.consumer_count("ex", "k"), 0);
        // no consumer: dropped, not an error
        bus.publish("ex", "k", vec![1]).await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_publish_failures() {
        let bus = LocalBus::new();
        bus.fail_next_publishes(1);
        assert!(bus.publish("ex", "k", vec![]).await.is_err());
        assert!(bus.publish("ex", "k", vec![]).await.is_ok());
    }
}
