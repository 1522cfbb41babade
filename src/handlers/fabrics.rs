use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::fabric::FabricStatus;
use crate::AppState;

use super::ApiError;

#[derive(Debug, Default, Deserialize)]
pub struct ReconcileQuery {
    #[serde(default)]
    pub force: bool,
}

/// Status of the last reconcile pass over a fabric
pub async fn get_fabric(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<FabricStatus>, ApiError> {
    let status = state
        .coordinator
        .fabric_status(&name)
        .ok_or_else(|| ApiError::not_found("fabric status"))?;
    Ok(Json(status))
}

/// Run a reconcile pass now; `?force=true` pushes unchanged configs too
pub async fn reconcile_fabric(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<ReconcileQuery>,
) -> Result<Json<FabricStatus>, ApiError> {
    tracing::info!("Reconcile of {} requested (force={})", name, query.force);
    let status = state.coordinator.reconcile(&name, query.force).await?;
    Ok(Json(status))
}
