//! API Models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use dnsaas_availability::availability::{SystemAvailabilityReport, ZoneAvailability};
use dnsaas_availability::balancer::{Algorithm, Listener, LoadBalancer, LoadBalancerTarget, TargetSpec};
use dnsaas_availability::breaker::CircuitBreakerSnapshot;
use dnsaas_availability::deploy::{DeploymentRequest, DeploymentSession, DeploymentStep, DeploymentStrategy};
use dnsaas_availability::ports::CheckType;
use dnsaas_availability::scaling::{ScalingDecision, ScalingGroup, ScalingGroupSpec, ScalingPolicySpec};
use dnsaas_availability::zone::{AvailabilityZone, CapacitySpec, ZoneSpec};

/// Standard API response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorResponse>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorResponse {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }
}

/// Error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

/// Wire name of a serde enum value
fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => String::new(),
    }
}

// ============ Zones ============

/// Zone registration request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ZoneCreate {
    pub name: String,
    pub region: String,
    pub provider: String,
    #[serde(default)]
    pub capacity: CapacityInput,
}

/// Zone capacity totals
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct CapacityInput {
    pub cpu_cores: f64,
    pub memory_gb: f64,
    pub storage_gb: f64,
    pub network_gbps: f64,
}

impl From<ZoneCreate> for ZoneSpec {
    fn from(input: ZoneCreate) -> Self {
        ZoneSpec {
            name: input.name,
            region: input.region,
            provider: input.provider,
            capacity: CapacitySpec {
                cpu_cores: input.capacity.cpu_cores,
                memory_gb: input.capacity.memory_gb,
                storage_gb: input.capacity.storage_gb,
                network_gbps: input.capacity.network_gbps,
            },
            probe: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ZoneOffline {
    #[serde(default = "default_offline_reason")]
    pub reason: String,
}

fn default_offline_reason() -> String {
    "operator request".into()
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ZoneMaintenance {
    pub enabled: bool,
}

/// Availability zone
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Zone {
    pub id: Uuid,
    pub name: String,
    pub region: String,
    pub provider: String,
    pub status: String,
    pub availability_pct: f64,
    pub instances: usize,
    pub cpu_total: f64,
    pub cpu_used: f64,
    pub memory_total: f64,
    pub memory_used: f64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<AvailabilityZone> for Zone {
    fn from(z: AvailabilityZone) -> Self {
        Self {
            id: z.id,
            status: label(&z.status),
            availability_pct: z.availability_pct,
            instances: z.instances.len(),
            cpu_total: z.capacity.cpu.total,
            cpu_used: z.capacity.cpu.used,
            memory_total: z.capacity.memory.total,
            memory_used: z.capacity.memory.used,
            last_health_check: z.last_health_check,
            created_at: z.created_at,
            name: z.name,
            region: z.region,
            provider: z.provider,
        }
    }
}

// ============ Load Balancers ============

/// Load balancer creation request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoadBalancerCreate {
    pub name: String,
    #[schema(value_type = String, example = "round_robin")]
    pub algorithm: Algorithm,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub listeners: Vec<Listener>,
}

/// Target registration request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TargetCreate {
    pub endpoint: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    pub zone: Uuid,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub instance_id: Option<Uuid>,
    /// HTTP health-check path; TCP connect when absent
    #[serde(default)]
    pub health_path: Option<String>,
}

fn default_weight() -> u32 {
    1
}

impl From<TargetCreate> for TargetSpec {
    fn from(input: TargetCreate) -> Self {
        TargetSpec {
            endpoint: input.endpoint,
            port: input.port,
            weight: input.weight,
            zone: input.zone,
            service: input.service,
            instance_id: input.instance_id,
            check: match input.health_path {
                Some(path) => CheckType::Http { path, expected_status: 200 },
                None => CheckType::Tcp,
            },
        }
    }
}

/// Load balancer target
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Target {
    pub id: Uuid,
    pub service: String,
    pub endpoint: String,
    pub port: u16,
    pub weight: u32,
    pub zone_id: Uuid,
    pub region: String,
    pub status: String,
    pub in_flight: u64,
}

impl Target {
    pub fn from_target(t: LoadBalancerTarget, in_flight: u64) -> Self {
        Self {
            id: t.id,
            status: label(&t.status),
            service: t.service,
            endpoint: t.endpoint,
            port: t.port,
            weight: t.weight,
            zone_id: t.zone_id,
            region: t.region,
            in_flight,
        }
    }
}

/// Load balancer
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LoadBalancerView {
    pub id: Uuid,
    pub name: String,
    pub algorithm: String,
    pub services: Vec<String>,
    pub targets: Vec<Target>,
    pub created_at: DateTime<Utc>,
}

impl From<&LoadBalancer> for LoadBalancerView {
    fn from(lb: &LoadBalancer) -> Self {
        let info = lb.info();
        Self {
            id: info.id,
            algorithm: label(&info.algorithm),
            services: lb.services(),
            targets: info
                .targets
                .into_iter()
                .map(|t| {
                    let in_flight = lb.in_flight(t.id);
                    Target::from_target(t, in_flight)
                })
                .collect(),
            created_at: info.created_at,
            name: info.name,
        }
    }
}

// ============ Scaling Groups ============

/// Scaling group creation request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ScalingGroupCreate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "serviceType")]
    pub service_type: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(alias = "min")]
    pub min_size: u32,
    #[serde(alias = "max")]
    pub max_size: u32,
    #[serde(alias = "desired")]
    pub desired_size: u32,
    #[serde(default)]
    pub zones: Vec<Uuid>,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub policies: Vec<ScalingPolicySpec>,
}

impl From<ScalingGroupCreate> for ScalingGroupSpec {
    fn from(input: ScalingGroupCreate) -> Self {
        ScalingGroupSpec {
            name: input.name.unwrap_or_else(|| input.service_type.clone()),
            service_type: input.service_type,
            version: input.version.unwrap_or_else(|| "latest".into()),
            min_size: input.min_size,
            max_size: input.max_size,
            desired_size: input.desired_size,
            zones: input.zones,
            policies: input.policies,
        }
    }
}

/// Scaling group
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ScalingGroupView {
    pub id: Uuid,
    pub name: String,
    pub service_type: String,
    pub version: String,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_size: u32,
    pub instances: Vec<Uuid>,
    pub policies: Vec<String>,
    pub last_scaling_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<ScalingGroup> for ScalingGroupView {
    fn from(g: ScalingGroup) -> Self {
        Self {
            id: g.id,
            policies: g.policies.iter().map(|p| p.name.clone()).collect(),
            name: g.name,
            service_type: g.service_type,
            version: g.version,
            min_size: g.min_size,
            max_size: g.max_size,
            desired_size: g.desired_size,
            instances: g.instances,
            last_scaling_at: g.last_scaling_at,
            created_at: g.created_at,
        }
    }
}

/// Capacity change
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ScalingDecisionView {
    pub id: Uuid,
    pub direction: String,
    pub previous_capacity: u32,
    pub requested_capacity: i64,
    pub new_capacity: u32,
    pub clamped: bool,
    pub at: DateTime<Utc>,
}

impl From<ScalingDecision> for ScalingDecisionView {
    fn from(d: ScalingDecision) -> Self {
        Self {
            id: d.id,
            direction: label(&d.direction),
            previous_capacity: d.previous_capacity,
            requested_capacity: d.requested_capacity,
            new_capacity: d.new_capacity,
            clamped: d.clamped,
            at: d.at,
        }
    }
}

// ============ Deployments ============

/// Deployment request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeploymentCreate {
    #[serde(alias = "serviceId")]
    pub service_id: String,
    pub version: String,
    #[schema(value_type = Object)]
    pub strategy: DeploymentStrategy,
}

impl From<DeploymentCreate> for DeploymentRequest {
    fn from(input: DeploymentCreate) -> Self {
        DeploymentRequest { service_id: input.service_id, version: input.version, strategy: input.strategy }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeploymentStepView {
    pub name: String,
    pub status: String,
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub logs: Vec<String>,
}

impl From<DeploymentStep> for DeploymentStepView {
    fn from(s: DeploymentStep) -> Self {
        Self {
            status: label(&s.status),
            name: s.name,
            progress: s.progress,
            started_at: s.started_at,
            finished_at: s.finished_at,
            logs: s.logs,
        }
    }
}

/// Deployment session
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Deployment {
    pub id: Uuid,
    pub service_id: String,
    pub version: String,
    pub strategy: String,
    pub status: String,
    pub steps: Vec<DeploymentStepView>,
    pub launched_instances: Vec<Uuid>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<DeploymentSession> for Deployment {
    fn from(s: DeploymentSession) -> Self {
        Self {
            id: s.id,
            strategy: label(&s.strategy.strategy_type),
            status: label(&s.status),
            steps: s.steps.into_iter().map(Into::into).collect(),
            service_id: s.service_id,
            version: s.version,
            launched_instances: s.launched_instances,
            error: s.error,
            created_at: s.created_at,
            updated_at: s.updated_at,
            finished_at: s.finished_at,
        }
    }
}

// ============ Availability ============

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ZoneAvailabilityView {
    pub zone_id: Uuid,
    pub name: String,
    pub region: String,
    pub status: String,
    pub availability_pct: f64,
    pub included: bool,
    pub cpu_used_pct: f64,
    pub memory_used_pct: f64,
    pub instances: usize,
}

impl From<ZoneAvailability> for ZoneAvailabilityView {
    fn from(z: ZoneAvailability) -> Self {
        Self {
            zone_id: z.zone_id,
            status: label(&z.status),
            name: z.name,
            region: z.region,
            availability_pct: z.availability_pct,
            included: z.included,
            cpu_used_pct: z.cpu_used_pct,
            memory_used_pct: z.memory_used_pct,
            instances: z.instances,
        }
    }
}

/// System availability report
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AvailabilityReport {
    pub system_availability_pct: f64,
    pub active_zones: usize,
    pub flagged_zones: Vec<Uuid>,
    pub zones: Vec<ZoneAvailabilityView>,
    pub redundancy_level: usize,
    pub single_points_of_failure: Vec<String>,
    pub unavailable_services: Vec<String>,
    pub sla_target_pct: f64,
    pub meets_sla: bool,
    pub generated_at: DateTime<Utc>,
}

impl From<SystemAvailabilityReport> for AvailabilityReport {
    fn from(r: SystemAvailabilityReport) -> Self {
        Self {
            system_availability_pct: r.system_availability_pct,
            active_zones: r.active_zones,
            flagged_zones: r.flagged_zones,
            zones: r.zones.into_iter().map(Into::into).collect(),
            redundancy_level: r.redundancy_level,
            single_points_of_failure: r.single_points_of_failure,
            unavailable_services: r.unavailable_services,
            sla_target_pct: r.sla_target_pct,
            meets_sla: r.meets_sla,
            generated_at: r.generated_at,
        }
    }
}

// ============ Circuit Breakers ============

/// Circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CircuitBreakerView {
    pub service: String,
    pub state: String,
    pub error_rate_threshold: f64,
    pub failure_threshold: u32,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub average_latency_ms: f64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
}

impl From<CircuitBreakerSnapshot> for CircuitBreakerView {
    fn from(b: CircuitBreakerSnapshot) -> Self {
        Self {
            state: label(&b.state),
            service: b.service,
            error_rate_threshold: b.error_rate_threshold,
            failure_threshold: b.failure_threshold,
            total_requests: b.metrics.total_requests,
            failed_requests: b.metrics.failed_requests,
            rejected_requests: b.metrics.rejected_requests,
            average_latency_ms: b.metrics.average_latency_ms,
            next_retry_at: b.next_retry_at,
            opened_at: b.opened_at,
        }
    }
}
