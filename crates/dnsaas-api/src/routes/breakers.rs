//! Circuit breaker endpoints

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;

use dnsaas_common::AvailabilityError;

use crate::{models::*, ApiResult, ApiState};

pub fn router() -> Router<Arc<ApiState>> {
    Router::new()
        .route("/", get(list_breakers))
        .route("/:service/reset", post(reset_breaker))
}

/// List circuit breakers
#[utoipa::path(
    get,
    path = "/circuit-breakers",
    responses((status = 200, body = [CircuitBreakerView])),
    tag = "circuit-breakers"
)]
pub async fn list_breakers(State(state): State<Arc<ApiState>>) -> Json<ApiResponse<Vec<CircuitBreakerView>>> {
    Json(ApiResponse::success(state.core.breakers.snapshots().into_iter().map(Into::into).collect()))
}

/// Force a breaker closed
#[utoipa::path(
    post,
    path = "/circuit-breakers/{service}/reset",
    params(("service" = String, Path,)),
    responses((status = 200, body = CircuitBreakerView), (status = 404, body = ErrorResponse)),
    tag = "circuit-breakers"
)]
pub async fn reset_breaker(
    State(state): State<Arc<ApiState>>,
    Path(service): Path<String>,
) -> ApiResult<Json<ApiResponse<CircuitBreakerView>>> {
    let breaker = state
        .core
        .breakers
        .get(&service)
        .ok_or_else(|| AvailabilityError::not_found("circuit breaker", &service))?;
    breaker.reset("operator reset");
    Ok(Json(ApiResponse::success(breaker.snapshot().into())))
}
