//! Zone endpoints

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use uuid::Uuid;

use crate::{models::*, ApiResult, ApiState};

pub fn router() -> Router<Arc<ApiState>> {
    Router::new()
        .route("/", get(list_zones).post(create_zone))
        .route("/:id", get(get_zone))
        .route("/:id/offline", post(mark_offline))
        .route("/:id/maintenance", post(set_maintenance))
}

/// Register a zone
#[utoipa::path(
    post,
    path = "/zones",
    request_body = ZoneCreate,
    responses(
        (status = 201, description = "Zone registered", body = Zone),
        (status = 409, description = "Zone name taken", body = ErrorResponse)
    ),
    tag = "zones"
)]
pub async fn create_zone(
    State(state): State<Arc<ApiState>>,
    Json(input): Json<ZoneCreate>,
) -> ApiResult<(StatusCode, Json<ApiResponse<Zone>>)> {
    let zone = state.core.zones.register_zone(input.into())?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(zone.into()))))
}

/// List zones
#[utoipa::path(
    get,
    path = "/zones",
    responses((status = 200, description = "All zones", body = [Zone])),
    tag = "zones"
)]
pub async fn list_zones(State(state): State<Arc<ApiState>>) -> Json<ApiResponse<Vec<Zone>>> {
    Json(ApiResponse::success(state.core.zones.zones().into_iter().map(Into::into).collect()))
}

/// Get zone by ID
#[utoipa::path(
    get,
    path = "/zones/{id}",
    params(("id" = Uuid, Path,)),
    responses(
        (status = 200, body = Zone),
        (status = 404, body = ErrorResponse)
    ),
    tag = "zones"
)]
pub async fn get_zone(State(state): State<Arc<ApiState>>, Path(id): Path<Uuid>) -> ApiResult<Json<ApiResponse<Zone>>> {
    Ok(Json(ApiResponse::success(state.core.zones.zone(id)?.into())))
}

/// Take a zone offline
#[utoipa::path(
    post,
    path = "/zones/{id}/offline",
    params(("id" = Uuid, Path,)),
    request_body = ZoneOffline,
    responses((status = 200, body = Zone), (status = 404, body = ErrorResponse)),
    tag = "zones"
)]
pub async fn mark_offline(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(input): Json<ZoneOffline>,
) -> ApiResult<Json<ApiResponse<Zone>>> {
    let zone = state.core.zones.mark_offline(id, &input.reason)?;
    Ok(Json(ApiResponse::success(zone.into())))
}

/// Enter or leave maintenance
#[utoipa::path(
    post,
    path = "/zones/{id}/maintenance",
    params(("id" = Uuid, Path,)),
    request_body = ZoneMaintenance,
    responses((status = 200, body = Zone), (status = 404, body = ErrorResponse)),
    tag = "zones"
)]
pub async fn set_maintenance(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(input): Json<ZoneMaintenance>,
) -> ApiResult<Json<ApiResponse<Zone>>> {
    let zone = state.core.zones.set_maintenance(id, input.enabled)?;
    Ok(Json(ApiResponse::success(zone.into())))
}
