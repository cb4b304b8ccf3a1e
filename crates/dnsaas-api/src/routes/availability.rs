//! Availability report endpoint

use axum::extract::State;
use axum::Json;
use std::sync::Arc;

use crate::{models::*, ApiState};

/// System availability across active zones
#[utoipa::path(
    get,
    path = "/availability",
    responses((status = 200, description = "Availability report", body = AvailabilityReport)),
    tag = "availability"
)]
pub async fn get_availability(State(state): State<Arc<ApiState>>) -> Json<ApiResponse<AvailabilityReport>> {
    Json(ApiResponse::success(state.core.calculator.calculate().into()))
}
