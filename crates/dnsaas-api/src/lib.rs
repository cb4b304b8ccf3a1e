//! DNSaaS Availability API
//!
//! REST surface over the availability core: zones, load balancers, scaling
//! groups, deployments, circuit breakers and the availability report.

#![warn(clippy::all)]

pub mod error;
pub mod models;
pub mod routes;

use axum::{routing::get, Json, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use dnsaas_availability::AvailabilityCore;

pub use error::{ApiError, ApiResult};
pub use models::*;

/// API state
pub struct ApiState {
    pub core: Arc<AvailabilityCore>,
    /// API version
    pub version: String,
}

impl ApiState {
    pub fn new(core: Arc<AvailabilityCore>) -> Self {
        Self { core, version: env!("CARGO_PKG_VERSION").to_string() }
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "DNSaaS Availability API",
        version = "1.0.0",
        description = "Zones, health-aware load balancing, auto-scaling and deployments for DNSaaS",
        license(name = "Apache-2.0")
    ),
    paths(
        routes::health::health_check,
        routes::zones::create_zone,
        routes::zones::list_zones,
        routes::zones::get_zone,
        routes::zones::mark_offline,
        routes::zones::set_maintenance,
        routes::load_balancers::create_load_balancer,
        routes::load_balancers::list_load_balancers,
        routes::load_balancers::get_load_balancer,
        routes::load_balancers::add_target,
        routes::load_balancers::drain_target,
        routes::scaling_groups::create_group,
        routes::scaling_groups::list_groups,
        routes::scaling_groups::get_group,
        routes::scaling_groups::list_decisions,
        routes::deployments::create_deployment,
        routes::deployments::list_deployments,
        routes::deployments::get_deployment,
        routes::deployments::rollback_deployment,
        routes::availability::get_availability,
        routes::breakers::list_breakers,
        routes::breakers::reset_breaker,
    ),
    components(
        schemas(
            ErrorResponse,
            routes::health::HealthResponse,
            Zone, ZoneCreate, CapacityInput, ZoneOffline, ZoneMaintenance,
            LoadBalancerView, LoadBalancerCreate, Target, TargetCreate,
            ScalingGroupView, ScalingGroupCreate, ScalingDecisionView,
            Deployment, DeploymentCreate, DeploymentStepView,
            AvailabilityReport, ZoneAvailabilityView,
            CircuitBreakerView
        )
    ),
    tags(
        (name = "health", description = "Liveness"),
        (name = "zones", description = "Availability zones"),
        (name = "load-balancers", description = "Health-aware load balancing"),
        (name = "scaling-groups", description = "Auto-scaling"),
        (name = "deployments", description = "Deployments and rollback"),
        (name = "availability", description = "System availability"),
        (name = "circuit-breakers", description = "Circuit breakers")
    )
)]
pub struct ApiDoc;

/// Build the API router
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .nest("/zones", routes::zones::router())
        .nest("/load-balancers", routes::load_balancers::router())
        .nest("/scaling-groups", routes::scaling_groups::router())
        .nest("/deployments", routes::deployments::router())
        .nest("/circuit-breakers", routes::breakers::router())
        .route("/availability", get(routes::availability::get_availability))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}
