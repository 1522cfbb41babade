use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Event types streamed to WebSocket clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PushStarted,
    PushSucceeded,
    PushRetry,
    PushFailed,
    PushSkipped,
    FabricReconciled,
    IntentUpdated,
}

/// Event message
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

/// Payload for device push events
#[derive(Debug, Clone, Serialize)]
pub struct PushPayload {
    pub uuid: String,
    pub name: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byte_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Payload for fabric reconcile events
#[derive(Debug, Clone, Serialize)]
pub struct FabricPayload {
    pub name: String,
    pub status: String,
    pub devices: usize,
}

/// Hub fans events out to every connected client. Events are dropped when
/// nobody is listening.
pub struct Hub {
    tx: broadcast::Sender<String>,
    client_count: Arc<RwLock<usize>>,
}

impl Hub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            client_count: Arc::new(RwLock::new(0)),
        }
    }

    pub async fn broadcast_event(&self, event: Event) {
        let data = match serde_json::to_string(&event) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!("Error serializing event: {}", e);
                return;
            }
        };

        let count = *self.client_count.read().await;
        if count > 0 || self.tx.receiver_count() > 0 {
            if let Err(e) = self.tx.send(data) {
                tracing::warn!("Error broadcasting event: {}", e);
            } else {
                tracing::debug!("Broadcasting {:?} to {} clients", event.event_type, count);
            }
        }
    }

    pub async fn broadcast_push(&self, event_type: EventType, payload: PushPayload) {
        self.broadcast_event(Event {
            event_type,
            payload: serde_json::to_value(payload).unwrap_or_default(),
        })
        .await;
    }

    pub async fn broadcast_fabric(&self, name: &str, status: &str, devices: usize) {
        self.broadcast_event(Event {
            event_type: EventType::FabricReconciled,
            payload: serde_json::to_value(FabricPayload {
                name: name.to_string(),
                status: status.to_string(),
                devices,
            })
            .unwrap_or_default(),
        })
        .await;
    }

    pub async fn client_count(&self) -> usize {
        *self.client_count.read().await
    }

    /// Raw event stream, as sent to WebSocket clients
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    async fn increment_clients(&self) {
        let mut count = self.client_count.write().await;
        *count += 1;
        tracing::info!("WebSocket client connected. Total clients: {}", *count);
    }

    async fn decrement_clients(&self) {
        let mut count = self.client_count.write().await;
        *count = count.saturating_sub(1);
        tracing::info!("WebSocket client disconnected. Total clients: {}", *count);
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (mut sender, mut receiver) = socket.split();

    hub.increment_clients().await;
    let mut rx = hub.subscribe();

    let send_task = tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    // Drain client frames to notice disconnects
    let recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            if msg.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    hub.decrement_clients().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_event_shape() {
        let hub = Hub::new();
        let mut rx = hub.subscribe();
        hub.broadcast_push(
            EventType::PushSucceeded,
            PushPayload {
                uuid: "pr-1".into(),
                name: "leaf1".into(),
                state: "SUCCESS".into(),
                byte_count: Some(512),
                message: None,
            },
        )
        .await;

        let v: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(v["type"], "push_succeeded");
        assert_eq!(v["payload"]["byte_count"], 512);
        assert!(v["payload"].get("message").is_none());
    }

    #[tokio::test]
    async fn test_no_listeners_is_fine() {
        let hub = Hub::new();
        hub.broadcast_fabric("fab1", "success", 3).await;
        assert_eq!(hub.client_count().await, 0);
    }
}
