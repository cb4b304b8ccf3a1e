//! Deployment endpoints

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use uuid::Uuid;

use crate::{models::*, ApiResult, ApiState};

pub fn router() -> Router<Arc<ApiState>> {
    Router::new()
        .route("/", get(list_deployments).post(create_deployment))
        .route("/:id", get(get_deployment))
        .route("/:id/rollback", post(rollback_deployment))
}

/// Start a deployment
#[utoipa::path(
    post,
    path = "/deployments",
    request_body = DeploymentCreate,
    responses(
        (status = 202, description = "Deployment started", body = Deployment),
        (status = 404, description = "No load balancer serves the service", body = ErrorResponse),
        (status = 409, description = "Service already deploying", body = ErrorResponse)
    ),
    tag = "deployments"
)]
pub async fn create_deployment(
    State(state): State<Arc<ApiState>>,
    Json(input): Json<DeploymentCreate>,
) -> ApiResult<(StatusCode, Json<ApiResponse<Deployment>>)> {
    let session = state.core.deployments.start(input.into())?;
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(session.into()))))
}

/// List deployments
#[utoipa::path(
    get,
    path = "/deployments",
    responses((status = 200, body = [Deployment])),
    tag = "deployments"
)]
pub async fn list_deployments(State(state): State<Arc<ApiState>>) -> Json<ApiResponse<Vec<Deployment>>> {
    Json(ApiResponse::success(state.core.deployments.sessions().into_iter().map(Into::into).collect()))
}

/// Get deployment by ID
#[utoipa::path(
    get,
    path = "/deployments/{id}",
    params(("id" = Uuid, Path,)),
    responses((status = 200, body = Deployment), (status = 404, body = ErrorResponse)),
    tag = "deployments"
)]
pub async fn get_deployment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<Deployment>>> {
    Ok(Json(ApiResponse::success(state.core.deployments.session(id)?.into())))
}

/// Roll a deployment back to its pre-deployment target set
#[utoipa::path(
    post,
    path = "/deployments/{id}/rollback",
    params(("id" = Uuid, Path,)),
    responses(
        (status = 202, description = "Rollback requested or done", body = Deployment),
        (status = 404, body = ErrorResponse),
        (status = 409, description = "Deployment already completed", body = ErrorResponse)
    ),
    tag = "deployments"
)]
pub async fn rollback_deployment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<ApiResponse<Deployment>>)> {
    let session = state.core.deployments.rollback(id).await?;
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(session.into()))))
}
