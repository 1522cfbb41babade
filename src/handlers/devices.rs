use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::push::DeviceStatus;
use crate::AppState;

use super::ApiError;

/// Push state and commit stats of every router seen so far
pub async fn list_devices(State(state): State<Arc<AppState>>) -> Json<Vec<DeviceStatus>> {
    Json(state.engine.statuses())
}

/// Push state and commit stats of one router
pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> Result<Json<DeviceStatus>, ApiError> {
    let status = state
        .engine
        .status(&uuid)
        .ok_or_else(|| ApiError::not_found("device"))?;
    Ok(Json(status))
}

/// Last abstract config handed to the job worker for a router
pub async fn get_abstract_config(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let document = state
        .engine
        .last_document(&uuid)
        .ok_or_else(|| ApiError::not_found("abstract config"))?;
    Ok(Json(document))
}
