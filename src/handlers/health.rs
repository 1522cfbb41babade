use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::coord::instrument::OpTimes;
use crate::AppState;

pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "session": state.coord.state(),
        "fabrics": state.coordinator.fabric_names(),
        "devices": state.engine.statuses().len(),
    }))
}

/// Per-operation latency of the coordination store
pub async fn coord_response_times(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, OpTimes>> {
    Json(state.coord.response_times())
}

/// WebSocket upgrade for the push event stream
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    match &state.ws_hub {
        Some(hub) => crate::events::ws_handler(ws, State(hub.clone())).await,
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
