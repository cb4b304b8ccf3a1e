//! Scaling group endpoints

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use uuid::Uuid;

use crate::{models::*, ApiResult, ApiState};

pub fn router() -> Router<Arc<ApiState>> {
    Router::new()
        .route("/", get(list_groups).post(create_group))
        .route("/:id", get(get_group))
        .route("/:id/decisions", get(list_decisions))
}

/// Create a scaling group and launch its desired capacity
#[utoipa::path(
    post,
    path = "/scaling-groups",
    request_body = ScalingGroupCreate,
    responses(
        (status = 201, description = "Scaling group created", body = ScalingGroupView),
        (status = 400, description = "Invalid bounds or policy", body = ErrorResponse)
    ),
    tag = "scaling-groups"
)]
pub async fn create_group(
    State(state): State<Arc<ApiState>>,
    Json(input): Json<ScalingGroupCreate>,
) -> ApiResult<(StatusCode, Json<ApiResponse<ScalingGroupView>>)> {
    let group = state.core.scaling.create_group(input.into()).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(group.into()))))
}

/// List scaling groups
#[utoipa::path(
    get,
    path = "/scaling-groups",
    responses((status = 200, body = [ScalingGroupView])),
    tag = "scaling-groups"
)]
pub async fn list_groups(State(state): State<Arc<ApiState>>) -> Json<ApiResponse<Vec<ScalingGroupView>>> {
    Json(ApiResponse::success(state.core.scaling.groups().into_iter().map(Into::into).collect()))
}

/// Get scaling group by ID
#[utoipa::path(
    get,
    path = "/scaling-groups/{id}",
    params(("id" = Uuid, Path,)),
    responses((status = 200, body = ScalingGroupView), (status = 404, body = ErrorResponse)),
    tag = "scaling-groups"
)]
pub async fn get_group(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<ScalingGroupView>>> {
    Ok(Json(ApiResponse::success(state.core.scaling.group(id)?.into())))
}

/// Scaling decisions of a group, oldest first
#[utoipa::path(
    get,
    path = "/scaling-groups/{id}/decisions",
    params(("id" = Uuid, Path,)),
    responses((status = 200, body = [ScalingDecisionView]), (status = 404, body = ErrorResponse)),
    tag = "scaling-groups"
)]
pub async fn list_decisions(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<Vec<ScalingDecisionView>>>> {
    state.core.scaling.group(id)?;
    let decisions = state.core.scaling.decisions(Some(id)).into_iter().map(Into::into).collect();
    Ok(Json(ApiResponse::success(decisions)))
}
