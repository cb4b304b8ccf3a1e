//! Load balancer endpoints

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use uuid::Uuid;

use dnsaas_availability::LoadBalancerSpec;

use crate::{models::*, ApiResult, ApiState};

pub fn router() -> Router<Arc<ApiState>> {
    Router::new()
        .route("/", get(list_load_balancers).post(create_load_balancer))
        .route("/:id", get(get_load_balancer))
        .route("/:id/targets", post(add_target))
        .route("/:id/targets/:target_id/drain", post(drain_target))
}

/// Create a load balancer
#[utoipa::path(
    post,
    path = "/load-balancers",
    request_body = LoadBalancerCreate,
    responses((status = 201, description = "Load balancer created", body = LoadBalancerView)),
    tag = "load-balancers"
)]
pub async fn create_load_balancer(
    State(state): State<Arc<ApiState>>,
    Json(input): Json<LoadBalancerCreate>,
) -> ApiResult<(StatusCode, Json<ApiResponse<LoadBalancerView>>)> {
    let lb = state.core.balancers.create(LoadBalancerSpec {
        name: input.name,
        algorithm: input.algorithm,
        listeners: input.listeners,
    })?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(LoadBalancerView::from(lb.as_ref())))))
}

/// List load balancers
#[utoipa::path(
    get,
    path = "/load-balancers",
    responses((status = 200, body = [LoadBalancerView])),
    tag = "load-balancers"
)]
pub async fn list_load_balancers(State(state): State<Arc<ApiState>>) -> Json<ApiResponse<Vec<LoadBalancerView>>> {
    Json(ApiResponse::success(
        state.core.balancers.list().iter().map(|lb| LoadBalancerView::from(lb.as_ref())).collect(),
    ))
}

/// Get load balancer by ID
#[utoipa::path(
    get,
    path = "/load-balancers/{id}",
    params(("id" = Uuid, Path,)),
    responses((status = 200, body = LoadBalancerView), (status = 404, body = ErrorResponse)),
    tag = "load-balancers"
)]
pub async fn get_load_balancer(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<LoadBalancerView>>> {
    let lb = state.core.balancers.get(id)?;
    Ok(Json(ApiResponse::success(LoadBalancerView::from(lb.as_ref()))))
}

/// Register a target; it receives traffic once its health checks pass
#[utoipa::path(
    post,
    path = "/load-balancers/{id}/targets",
    params(("id" = Uuid, Path,)),
    request_body = TargetCreate,
    responses(
        (status = 202, description = "Target registered, pending health checks", body = Target),
        (status = 404, body = ErrorResponse)
    ),
    tag = "load-balancers"
)]
pub async fn add_target(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(input): Json<TargetCreate>,
) -> ApiResult<(StatusCode, Json<ApiResponse<Target>>)> {
    let lb = state.core.balancers.get(id)?;
    let target = lb.add_target(input.into())?;
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(Target::from_target(target, 0)))))
}

/// Drain a target
#[utoipa::path(
    post,
    path = "/load-balancers/{id}/targets/{target_id}/drain",
    params(("id" = Uuid, Path,), ("target_id" = Uuid, Path,)),
    responses((status = 202, body = Target), (status = 404, body = ErrorResponse)),
    tag = "load-balancers"
)]
pub async fn drain_target(
    State(state): State<Arc<ApiState>>,
    Path((id, target_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<(StatusCode, Json<ApiResponse<Target>>)> {
    let lb = state.core.balancers.get(id)?;
    lb.drain_target(target_id)?;
    let target = lb
        .target(target_id)
        .ok_or_else(|| dnsaas_common::AvailabilityError::not_found("target", target_id))?;
    let in_flight = lb.in_flight(target_id);
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(Target::from_target(target, in_flight)))))
}
