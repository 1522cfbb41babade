use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::AppState;

/// Build the application router with all routes
pub fn build(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health::health))
        // Push state
        .route("/api/devices", get(handlers::devices::list_devices))
        .route("/api/devices/:uuid", get(handlers::devices::get_device))
        .route("/api/devices/:uuid/abstract-config", get(handlers::devices::get_abstract_config))
        // Fabrics
        .route("/api/fabrics/:name", get(handlers::fabrics::get_fabric))
        .route("/api/fabrics/:name/reconcile", post(handlers::fabrics::reconcile_fabric))
        // Northbound intent
        .route("/api/intent", post(handlers::intent::submit_intent))
        // Coordination store
        .route("/api/coord/response-times", get(handlers::health::coord_response_times))
        // Push event stream
        .route("/ws", get(handlers::health::ws_upgrade))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
