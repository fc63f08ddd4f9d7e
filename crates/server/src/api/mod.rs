use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use coordinator::album::AlbumSource;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{DeviceId, GroupId},
    error::{ApiError, ErrorCode},
};
use storage::Storage;
use tracing::warn;

/// Header frames use to identify themselves on asset lookups.
pub const MACHINE_HEADER: &str = "machine";

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) storage: Storage,
    pub(crate) albums: Arc<dyn AlbumSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentAsset {
    pub group_id: GroupId,
    pub position: i64,
    pub asset_index: usize,
    pub asset_id: String,
    pub album_url: String,
}

type ApiFailure = (StatusCode, Json<ApiError>);

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/asset", get(current_asset))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, ApiFailure> {
    state.storage.health_check().await.map_err(internal)?;
    Ok("ok")
}

async fn current_asset(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<CurrentAsset>, ApiFailure> {
    let raw = headers
        .get(MACHINE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| failure(StatusCode::BAD_REQUEST, ErrorCode::Validation, "missing machine header"))?;
    let device_id = DeviceId::parse(raw.trim())
        .map_err(|e| failure(StatusCode::BAD_REQUEST, ErrorCode::Validation, e.to_string()))?;

    let device = state
        .storage
        .get_device(&device_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("device is not provisioned"))?;
    let group_id = device
        .group_id
        .ok_or_else(|| not_found("device has no group"))?;
    let group = state
        .storage
        .get_group(group_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("group not found"))?;

    let asset_ids = state
        .albums
        .asset_ids(&group.album_id)
        .await
        .map_err(|error| {
            warn!(%group_id, album_id = %group.album_id, %error, "album listing failed");
            failure(StatusCode::BAD_GATEWAY, ErrorCode::Upstream, error.to_string())
        })?;
    let asset_index = group
        .current_asset_index(asset_ids.len())
        .ok_or_else(|| not_found("album has no assets"))?;
    let asset_id = asset_ids
        .get(asset_index)
        .cloned()
        .ok_or_else(|| not_found("album has no assets"))?;

    Ok(Json(CurrentAsset {
        group_id,
        position: group.current_asset,
        asset_index,
        asset_id,
        album_url: group.album_url,
    }))
}

fn failure(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> ApiFailure {
    (status, Json(ApiError::new(code, message)))
}

fn not_found(message: &str) -> ApiFailure {
    failure(StatusCode::NOT_FOUND, ErrorCode::NotFound, message)
}

fn internal(error: anyhow::Error) -> ApiFailure {
    failure(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::Internal,
        error.to_string(),
    )
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
