//! Error types for the availability core

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Availability core error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AvailabilityError {
    /// Probe did not answer within the probe timeout
    #[error("probe timed out for {target}")]
    ProbeTimeout { target: String },

    /// Target failed its health check
    #[error("target {0} is unhealthy")]
    TargetUnhealthy(Uuid),

    /// No routable target for a service
    #[error("no healthy target for service {service}")]
    NoHealthyTarget { service: String },

    /// Circuit breaker is rejecting calls
    #[error("circuit open for {service}, retry at {retry_at}")]
    CircuitOpen {
        service: String,
        retry_at: DateTime<Utc>,
    },

    /// Computed capacity fell outside group bounds
    #[error("scaling bounds violated: proposed {proposed}, allowed [{min}, {max}]")]
    ScalingBoundsViolation { proposed: i64, min: u32, max: u32 },

    /// A deployment step failed
    #[error("deployment step `{step}` failed: {reason}")]
    DeploymentStepFailure { step: String, reason: String },

    /// Service already has a deployment in flight
    #[error("service {service} already has deployment {active} in progress")]
    ConflictingDeployment { service: String, active: Uuid },

    /// Zone name already registered
    #[error("zone `{0}` already registered")]
    DuplicateZone(String),

    /// Lookup miss
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Rejected input or configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not allowed in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Operation stopped by a cancellation signal
    #[error("operation cancelled")]
    Cancelled,

    /// External provisioning/metrics collaborator failed
    #[error("provider error: {0}")]
    Provider(String),
}

impl AvailabilityError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProbeTimeout { .. } => "PROBE_TIMEOUT",
            Self::TargetUnhealthy(_) => "TARGET_UNHEALTHY",
            Self::NoHealthyTarget { .. } => "NO_HEALTHY_TARGET",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::ScalingBoundsViolation { .. } => "SCALING_BOUNDS_VIOLATION",
            Self::DeploymentStepFailure { .. } => "DEPLOYMENT_STEP_FAILURE",
            Self::ConflictingDeployment { .. } => "CONFLICTING_DEPLOYMENT",
            Self::DuplicateZone(_) => "DUPLICATE_ZONE",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Cancelled => "CANCELLED",
            Self::Provider(_) => "PROVIDER_ERROR",
        }
    }

    /// Transient errors are retried on the next cycle instead of surfaced
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ProbeTimeout { .. } | Self::TargetUnhealthy(_))
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound { kind, id: id.to_string() }
    }
}

/// Result type for the availability core
pub type AvailabilityResult<T> = Result<T, AvailabilityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        let err = AvailabilityError::NoHealthyTarget { service: "dns-api".into() };
        assert_eq!(err.code(), "NO_HEALTHY_TARGET");
        assert_eq!(err.to_string(), "no healthy target for service dns-api");

        let err = AvailabilityError::not_found("zone", "z-1");
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(err.to_string(), "zone z-1 not found");
    }

    #[test]
    fn test_transient_classification() {
        assert!(AvailabilityError::ProbeTimeout { target: "t".into() }.is_transient());
        assert!(!AvailabilityError::Cancelled.is_transient());
    }
}
