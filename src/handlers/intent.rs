use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

use super::ApiError;

#[derive(Serialize)]
pub struct IntentResponse {
    pub objects: usize,
    pub fabrics: Vec<String>,
}

/// Validate and install a new intent snapshot. Nothing changes on error.
pub async fn submit_intent(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<Json<IntentResponse>, ApiError> {
    let objects = state.install_intent_document(&body).await?;
    Ok(Json(IntentResponse {
        objects,
        fabrics: state.coordinator.fabric_names(),
    }))
}
