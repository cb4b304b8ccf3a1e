//! API error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use dnsaas_common::AvailabilityError;

use crate::models::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] AvailabilityError),
    #[error("bad request: {0}")]
    BadRequest(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Core(e) => match e {
                AvailabilityError::DuplicateZone(_)
                | AvailabilityError::ConflictingDeployment { .. }
                | AvailabilityError::InvalidState(_)
                | AvailabilityError::Cancelled => StatusCode::CONFLICT,
                AvailabilityError::NotFound { .. } => StatusCode::NOT_FOUND,
                AvailabilityError::InvalidConfig(_) | AvailabilityError::ScalingBoundsViolation { .. } => {
                    StatusCode::BAD_REQUEST
                }
                AvailabilityError::NoHealthyTarget { .. }
                | AvailabilityError::CircuitOpen { .. }
                | AvailabilityError::TargetUnhealthy(_)
                | AvailabilityError::ProbeTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
                AvailabilityError::Provider(_) => StatusCode::BAD_GATEWAY,
                AvailabilityError::DeploymentStepFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Core(e) => e.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), "Request failed: {}", self);
        } else {
            tracing::debug!(code = self.code(), "Request rejected: {}", self);
        }
        (status, Json(ApiResponse::<()>::error(self.code(), &self.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        let conflict = ApiError::from(AvailabilityError::ConflictingDeployment {
            service: "dns-api".into(),
            active: Uuid::new_v4(),
        });
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
        assert_eq!(conflict.code(), "CONFLICTING_DEPLOYMENT");

        let missing = ApiError::from(AvailabilityError::not_found("zone", Uuid::new_v4()));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let down = ApiError::from(AvailabilityError::NoHealthyTarget { service: "dns-api".into() });
        assert_eq!(down.status(), StatusCode::SERVICE_UNAVAILABLE);

        let provider = ApiError::from(AvailabilityError::Provider("quota".into()));
        assert_eq!(provider.status(), StatusCode::BAD_GATEWAY);
    }
}
