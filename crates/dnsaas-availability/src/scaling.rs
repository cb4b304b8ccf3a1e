//! Auto-Scaling Engine
//!
//! Every group is evaluated on a fixed tick. Each policy may propose a new
//! capacity; any scale-out wins with the largest proposal, otherwise the
//! scale-in closest to the current capacity wins. The result is clamped to
//! `[min, max]` and executed through the provisioning port.

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

use dnsaas_common::{
    AvailabilityError, AvailabilityResult, Clock, GroupId, InstanceId, MemoryStore, PolicyId, Store, ZoneId,
};

use crate::balancer::{LoadBalancerRegistry, TargetSpec};
use crate::config::ScalingConfig;
use crate::health::HealthMonitor;
use crate::metrics::{MetricSnapshot, MetricType};
use crate::ports::{LaunchRequest, ProvisioningProvider};
use crate::zone::{ServiceInstance, ZoneRegistry, ZoneStatus};

/// Policy type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    Step,
    TargetTracking,
    Simple,
    Predictive,
}

/// How an adjustment value is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentType {
    /// Add/remove this many instances
    ChangeInCapacity,
    /// Set capacity to this value
    ExactCapacity,
    /// Add/remove this percentage of current capacity (at least one)
    PercentChangeInCapacity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment {
    pub adjustment_type: AdjustmentType,
    pub value: i64,
}

impl Adjustment {
    pub fn change(value: i64) -> Self {
        Self { adjustment_type: AdjustmentType::ChangeInCapacity, value }
    }

    /// Capacity after applying the adjustment in a direction
    pub fn apply(&self, current: u32, direction: Direction) -> i64 {
        let current = current as i64;
        let sign = match direction {
            Direction::Out => 1,
            Direction::In => -1,
        };
        match self.adjustment_type {
            AdjustmentType::ChangeInCapacity => current + sign * self.value.abs(),
            AdjustmentType::ExactCapacity => self.value,
            AdjustmentType::PercentChangeInCapacity => {
                let delta = ((current * self.value.abs()) as f64 / 100.0).ceil() as i64;
                current + sign * delta.max(1)
            }
        }
    }
}

impl Default for Adjustment {
    fn default() -> Self {
        Self::change(1)
    }
}

/// Breach-magnitude band of a step policy
///
/// Bounds are distances past the threshold; the adjustment is a change in
/// capacity in the breach direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepInterval {
    pub lower_bound: f64,
    #[serde(default)]
    pub upper_bound: Option<f64>,
    pub adjustment: i64,
}

impl StepInterval {
    fn contains(&self, magnitude: f64) -> bool {
        magnitude >= self.lower_bound && self.upper_bound.map(|u| magnitude < u).unwrap_or(true)
    }
}

/// Scaling direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Out,
    In,
}

fn default_cooldown() -> u64 {
    300
}

fn default_periods() -> u32 {
    1
}

/// Policy as submitted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingPolicySpec {
    #[serde(default)]
    pub name: Option<String>,
    pub policy_type: PolicyType,
    pub metric: MetricType,
    #[serde(default)]
    pub target_value: Option<f64>,
    #[serde(default)]
    pub scale_out_threshold: Option<f64>,
    #[serde(default)]
    pub scale_in_threshold: Option<f64>,
    #[serde(default)]
    pub scale_out_adjustment: Adjustment,
    #[serde(default)]
    pub scale_in_adjustment: Adjustment,
    #[serde(default)]
    pub step_intervals: Vec<StepInterval>,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_periods")]
    pub evaluation_periods: u32,
}

/// Scaling policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub id: PolicyId,
    pub name: String,
    pub policy_type: PolicyType,
    pub metric: MetricType,
    pub target_value: Option<f64>,
    pub scale_out_threshold: Option<f64>,
    pub scale_in_threshold: Option<f64>,
    pub scale_out_adjustment: Adjustment,
    pub scale_in_adjustment: Adjustment,
    pub step_intervals: Vec<StepInterval>,
    pub cooldown_secs: u64,
    pub evaluation_periods: u32,
}

impl ScalingPolicy {
    pub fn from_spec(spec: ScalingPolicySpec) -> AvailabilityResult<Self> {
        let invalid = |msg: &str| Err(AvailabilityError::InvalidConfig(msg.to_string()));
        match spec.policy_type {
            PolicyType::TargetTracking if spec.target_value.map(|t| t <= 0.0).unwrap_or(true) => {
                return invalid("target-tracking policy needs a positive target_value");
            }
            PolicyType::Step | PolicyType::Simple
                if spec.scale_out_threshold.is_none() && spec.scale_in_threshold.is_none() =>
            {
                return invalid("step/simple policy needs a scale-out or scale-in threshold");
            }
            PolicyType::Predictive if spec.scale_out_threshold.is_none() => {
                return invalid("predictive policy needs a scale_out_threshold");
            }
            _ => {}
        }
        if let (Some(out), Some(inn)) = (spec.scale_out_threshold, spec.scale_in_threshold) {
            if inn >= out {
                return invalid("scale_in_threshold must be below scale_out_threshold");
            }
        }
        let id = Uuid::new_v4();
        Ok(Self {
            id,
            name: spec.name.unwrap_or_else(|| format!("{:?}-{}", spec.policy_type, &id.to_string()[..8])),
            policy_type: spec.policy_type,
            metric: spec.metric,
            target_value: spec.target_value,
            scale_out_threshold: spec.scale_out_threshold,
            scale_in_threshold: spec.scale_in_threshold,
            scale_out_adjustment: spec.scale_out_adjustment,
            scale_in_adjustment: spec.scale_in_adjustment,
            step_intervals: spec.step_intervals,
            cooldown_secs: spec.cooldown_secs,
            evaluation_periods: spec.evaluation_periods.max(1),
        })
    }

    /// Capacity this policy asks for, ignoring cooldown and debounce
    ///
    /// `history` holds recent values of the policy metric, oldest first, and
    /// `horizon` is how many ticks ahead a predictive policy projects.
    pub fn propose(&self, current: u32, observed: f64, history: &[f64], horizon: f64) -> Option<(Direction, i64)> {
        match self.policy_type {
            PolicyType::TargetTracking => {
                let target = self.target_value?;
                let desired = (current as f64 * observed / target).round() as i64;
                direction_of(current, desired)
            }
            PolicyType::Simple => {
                let direction = if self.scale_out_threshold.map(|t| observed > t).unwrap_or(false) {
                    Direction::Out
                } else if self.scale_in_threshold.map(|t| observed < t).unwrap_or(false) {
                    Direction::In
                } else {
                    return None;
                };
                let adjustment = match direction {
                    Direction::Out => self.scale_out_adjustment,
                    Direction::In => self.scale_in_adjustment,
                };
                direction_of(current, adjustment.apply(current, direction)).filter(|(d, _)| *d == direction)
            }
            PolicyType::Step => {
                let (direction, magnitude, fallback) = match (self.scale_out_threshold, self.scale_in_threshold) {
                    (Some(t), _) if observed > t => (Direction::Out, observed - t, self.scale_out_adjustment),
                    (_, Some(t)) if observed < t => (Direction::In, t - observed, self.scale_in_adjustment),
                    _ => return None,
                };
                let desired = match self.step_intervals.iter().find(|s| s.contains(magnitude)) {
                    Some(step) => Adjustment::change(step.adjustment).apply(current, direction),
                    None => fallback.apply(current, direction),
                };
                direction_of(current, desired).filter(|(d, _)| *d == direction)
            }
            PolicyType::Predictive => {
                let threshold = self.scale_out_threshold?;
                let projected = project(history, horizon)?;
                if projected <= threshold {
                    return None;
                }
                let desired = match self.target_value {
                    Some(target) if target > 0.0 => (current as f64 * projected / target).ceil() as i64,
                    _ => self.scale_out_adjustment.apply(current, Direction::Out),
                };
                direction_of(current, desired).filter(|(d, _)| *d == Direction::Out)
            }
        }
    }
}

fn direction_of(current: u32, desired: i64) -> Option<(Direction, i64)> {
    let current = current as i64;
    if desired > current {
        Some((Direction::Out, desired))
    } else if desired < current {
        Some((Direction::In, desired))
    } else {
        None
    }
}

/// Least-squares line over `(index, value)`; `None` below three samples
fn linear_regression(values: &[f64]) -> Option<(f64, f64)> {
    if values.len() < 3 {
        return None;
    }
    let n = values.len() as f64;
    let sum_x: f64 = (0..values.len()).map(|i| i as f64).sum();
    let sum_y: f64 = values.iter().sum();
    let sum_xy: f64 = values.iter().enumerate().map(|(i, v)| i as f64 * v).sum();
    let sum_xx: f64 = (0..values.len()).map(|i| (i as f64).powi(2)).sum();

    let denominator = n * sum_xx - sum_x.powi(2);
    if denominator == 0.0 {
        return None;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    let intercept = (sum_y - slope * sum_x) / n;
    Some((slope, intercept))
}

/// Trend value `horizon` ticks past the newest sample
fn project(history: &[f64], horizon: f64) -> Option<f64> {
    let (slope, intercept) = linear_regression(history)?;
    Some(slope * ((history.len() - 1) as f64 + horizon) + intercept)
}

/// Clamp a requested capacity; the flag reports whether clamping happened
pub fn clamp_capacity(requested: i64, min: u32, max: u32) -> (u32, bool) {
    let clamped = requested.clamp(min as i64, max as i64);
    (clamped as u32, clamped != requested)
}

/// Scaling group creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingGroupSpec {
    pub name: String,
    #[serde(alias = "serviceType")]
    pub service_type: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(alias = "min")]
    pub min_size: u32,
    #[serde(alias = "max")]
    pub max_size: u32,
    #[serde(alias = "desired")]
    pub desired_size: u32,
    /// Empty means every active zone
    #[serde(default)]
    pub zones: Vec<ZoneId>,
    #[serde(default)]
    pub policies: Vec<ScalingPolicySpec>,
}

fn default_version() -> String {
    "latest".into()
}

/// Consecutive ticks a policy has wanted to move one way
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreachCount {
    pub direction: Direction,
    pub ticks: u32,
}

/// Scaling group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingGroup {
    pub id: GroupId,
    pub name: String,
    pub service_type: String,
    pub version: String,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_size: u32,
    pub zones: Vec<ZoneId>,
    pub policies: Vec<ScalingPolicy>,
    pub instances: Vec<InstanceId>,
    pub metrics: MetricSnapshot,
    pub last_scaling_at: Option<DateTime<Utc>>,
    pub breach_counts: HashMap<PolicyId, BreachCount>,
    pub metric_history: HashMap<MetricType, VecDeque<f64>>,
    pub created_at: DateTime<Utc>,
}

/// Accepted capacity change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub id: Uuid,
    pub group_id: GroupId,
    pub policy_ids: Vec<PolicyId>,
    pub direction: Direction,
    pub previous_capacity: u32,
    pub requested_capacity: i64,
    pub new_capacity: u32,
    pub clamped: bool,
    pub metrics: MetricSnapshot,
    pub at: DateTime<Utc>,
}

struct Proposal {
    policy_id: PolicyId,
    direction: Direction,
    desired: i64,
}

/// Instances a launch batch brought up; `error` is why it stopped early
struct LaunchOutcome {
    launched: Vec<InstanceId>,
    error: Option<AvailabilityError>,
}

/// Auto-scaling engine
pub struct ScalingEngine {
    config: ScalingConfig,
    groups: Arc<dyn Store<ScalingGroup>>,
    locks: DashMap<GroupId, Arc<tokio::sync::Mutex<()>>>,
    decisions: RwLock<VecDeque<ScalingDecision>>,
    /// Services whose groups sit out evaluation while a deployment runs
    suspended: DashSet<String>,
    zones: Arc<ZoneRegistry>,
    monitor: Arc<HealthMonitor>,
    balancers: Arc<LoadBalancerRegistry>,
    provisioner: Arc<dyn ProvisioningProvider>,
    clock: Arc<dyn Clock>,
}

impl ScalingEngine {
    pub fn new(
        config: ScalingConfig,
        zones: Arc<ZoneRegistry>,
        monitor: Arc<HealthMonitor>,
        balancers: Arc<LoadBalancerRegistry>,
        provisioner: Arc<dyn ProvisioningProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            groups: Arc::new(MemoryStore::new()),
            locks: DashMap::new(),
            decisions: RwLock::new(VecDeque::new()),
            suspended: DashSet::new(),
            zones,
            monitor,
            balancers,
            provisioner,
            clock,
        }
    }

    /// Create a group and launch its initial desired capacity
    pub async fn create_group(&self, spec: ScalingGroupSpec) -> AvailabilityResult<ScalingGroup> {
        if spec.min_size > spec.max_size || spec.desired_size < spec.min_size || spec.desired_size > spec.max_size {
            return Err(AvailabilityError::InvalidConfig(format!(
                "need min <= desired <= max, got {} <= {} <= {}",
                spec.min_size, spec.desired_size, spec.max_size
            )));
        }
        let zones = if spec.zones.is_empty() {
            self.zones.zones_with_status(ZoneStatus::Active).into_iter().map(|z| z.id).collect()
        } else {
            for id in &spec.zones {
                self.zones.zone(*id)?;
            }
            spec.zones.clone()
        };
        if zones.is_empty() {
            return Err(AvailabilityError::InvalidConfig("scaling group has no zones".into()));
        }
        let policies = spec
            .policies
            .into_iter()
            .map(ScalingPolicy::from_spec)
            .collect::<AvailabilityResult<Vec<_>>>()?;

        let mut group = ScalingGroup {
            id: Uuid::new_v4(),
            name: spec.name,
            service_type: spec.service_type,
            version: spec.version,
            min_size: spec.min_size,
            max_size: spec.max_size,
            desired_size: spec.desired_size,
            zones,
            policies,
            instances: Vec::new(),
            metrics: MetricSnapshot::default(),
            last_scaling_at: None,
            breach_counts: HashMap::new(),
            metric_history: HashMap::new(),
            created_at: self.clock.now(),
        };
        let outcome = self.launch(&group, group.desired_size).await;
        if let Some(e) = outcome.error {
            tracing::warn!(group = %group.name, launched = outcome.launched.len(), "Initial launch failed: {}", e);
            for id in &outcome.launched {
                if let Ok(instance) = self.zones.instance(*id) {
                    self.retire(&instance).await;
                }
            }
            return Err(e);
        }
        group.instances.extend(outcome.launched);
        self.groups.insert(group.id, group.clone());
        tracing::info!(group = %group.name, service = %group.service_type, desired = group.desired_size, "Created scaling group {}", group.id);
        Ok(group)
    }

    pub fn group(&self, id: GroupId) -> AvailabilityResult<ScalingGroup> {
        self.groups.get(&id).ok_or_else(|| AvailabilityError::not_found("scaling group", id))
    }

    pub fn groups(&self) -> Vec<ScalingGroup> {
        let mut all = self.groups.values();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Recent decisions, oldest first
    pub fn decisions(&self, group: Option<GroupId>) -> Vec<ScalingDecision> {
        self.decisions
            .read()
            .iter()
            .filter(|d| group.map(|g| d.group_id == g).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Pull metrics for a group and evaluate it
    ///
    /// Returns `Ok(None)` when nothing changed, no metrics were available, the
    /// service is mid-deployment, or an evaluation of the same group was
    /// already running.
    pub async fn evaluate_group(&self, id: GroupId) -> AvailabilityResult<Option<ScalingDecision>> {
        let lock = self.locks.entry(id).or_default().clone();
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!(group = %id, "Evaluation already running, skipping tick");
                return Ok(None);
            }
        };

        let mut group = self.group(id)?;
        if self.suspended.contains(&group.service_type) {
            tracing::debug!(group = %group.name, "Deployment in progress, skipping evaluation");
            return Ok(None);
        }
        let known = group.instances.len();
        group.instances.retain(|i| self.zones.instance(*i).is_ok());
        if group.instances.len() != known {
            tracing::warn!(group = %group.name, gone = known - group.instances.len(), "Dropped instances no longer registered");
            self.groups.insert(group.id, group.clone());
        }
        match self.monitor.aggregate_metrics(&group.instances).await {
            Some(snapshot) => self.apply_metrics(group, snapshot).await,
            None => {
                tracing::debug!(group = %group.name, "No metric samples, skipping evaluation");
                Ok(None)
            }
        }
    }

    /// Evaluate a group against a supplied snapshot
    pub async fn evaluate_with_metrics(
        &self,
        id: GroupId,
        snapshot: MetricSnapshot,
    ) -> AvailabilityResult<Option<ScalingDecision>> {
        let lock = self.locks.entry(id).or_default().clone();
        let _guard = lock.lock().await;
        let group = self.group(id)?;
        self.apply_metrics(group, snapshot).await
    }

    async fn apply_metrics(
        &self,
        mut group: ScalingGroup,
        snapshot: MetricSnapshot,
    ) -> AvailabilityResult<Option<ScalingDecision>> {
        let now = self.clock.now();
        let current = group.desired_size;
        group.metrics = snapshot;

        let tracked: HashSet<MetricType> = group.policies.iter().map(|p| p.metric).collect();
        for metric in tracked {
            let history = group.metric_history.entry(metric).or_default();
            history.push_back(snapshot.value(metric));
            while history.len() > self.config.history_len.max(1) {
                history.pop_front();
            }
        }

        let tick_secs = self.config.evaluation_interval_secs.max(1) as f64;
        let mut proposals = Vec::new();
        for policy in &group.policies {
            let history: Vec<f64> = group
                .metric_history
                .get(&policy.metric)
                .map(|h| h.iter().copied().collect())
                .unwrap_or_default();
            let horizon = (policy.cooldown_secs as f64 / tick_secs).max(1.0);
            let proposal = policy.propose(current, snapshot.value(policy.metric), &history, horizon);

            let ticks = match proposal {
                Some((direction, _)) => {
                    let count = group
                        .breach_counts
                        .entry(policy.id)
                        .or_insert(BreachCount { direction, ticks: 0 });
                    if count.direction != direction {
                        *count = BreachCount { direction, ticks: 0 };
                    }
                    count.ticks = count.ticks.saturating_add(1);
                    count.ticks
                }
                None => {
                    group.breach_counts.remove(&policy.id);
                    0
                }
            };

            let (direction, desired) = match proposal {
                Some(p) => p,
                None => continue,
            };
            if ticks < policy.evaluation_periods {
                continue;
            }
            let cooling = group
                .last_scaling_at
                .map(|last| now - last < chrono::Duration::seconds(policy.cooldown_secs as i64))
                .unwrap_or(false);
            if cooling {
                tracing::debug!(group = %group.name, policy = %policy.name, "Policy in cooldown");
                continue;
            }
            proposals.push(Proposal { policy_id: policy.id, direction, desired });
        }

        let outs: Vec<&Proposal> = proposals.iter().filter(|p| p.direction == Direction::Out).collect();
        let chosen = if !outs.is_empty() {
            let best = outs.iter().map(|p| p.desired).max().unwrap_or(current as i64);
            let ids: Vec<PolicyId> = outs.iter().filter(|p| p.desired == best).map(|p| p.policy_id).collect();
            Some((Direction::Out, best, ids))
        } else if !proposals.is_empty() {
            let best = proposals.iter().map(|p| p.desired).max().unwrap_or(current as i64);
            let ids: Vec<PolicyId> = proposals.iter().filter(|p| p.desired == best).map(|p| p.policy_id).collect();
            Some((Direction::In, best, ids))
        } else {
            None
        };

        let (direction, requested, policy_ids) = match chosen {
            Some(c) => c,
            None => {
                self.groups.insert(group.id, group);
                return Ok(None);
            }
        };

        let (target, clamped) = clamp_capacity(requested, group.min_size, group.max_size);
        if clamped {
            let violation = AvailabilityError::ScalingBoundsViolation {
                proposed: requested,
                min: group.min_size,
                max: group.max_size,
            };
            tracing::warn!(group = %group.name, clamped_to = target, "{}", violation);
        }
        if target == current {
            self.groups.insert(group.id, group);
            return Ok(None);
        }

        let new_capacity = if target > current {
            let outcome = self.launch(&group, target - current).await;
            if let Some(e) = &outcome.error {
                tracing::warn!(
                    group = %group.name, launched = outcome.launched.len(), wanted = target - current,
                    "Scale-out stopped early: {}", e
                );
            }
            let added = outcome.launched.len() as u32;
            group.instances.extend(outcome.launched);
            current + added
        } else {
            self.scale_in(&mut group, current - target).await;
            target
        };

        if new_capacity == current {
            self.groups.insert(group.id, group);
            return Ok(None);
        }

        group.desired_size = new_capacity;
        group.last_scaling_at = Some(now);
        for id in &policy_ids {
            group.breach_counts.remove(id);
        }
        let decision = ScalingDecision {
            id: Uuid::new_v4(),
            group_id: group.id,
            policy_ids,
            direction,
            previous_capacity: current,
            requested_capacity: requested,
            new_capacity,
            clamped,
            metrics: snapshot,
            at: now,
        };
        tracing::info!(
            group = %group.name, from = current, to = new_capacity, direction = ?direction,
            "Scaling decision applied"
        );
        self.groups.insert(group.id, group);

        let mut decisions = self.decisions.write();
        decisions.push_back(decision.clone());
        while decisions.len() > self.config.decision_history.max(1) {
            decisions.pop_front();
        }
        Ok(Some(decision))
    }

    /// Launch instances spread over active zones, fewest group instances first
    ///
    /// Stops at the first failure; whatever came up before it is returned.
    async fn launch(&self, group: &ScalingGroup, count: u32) -> LaunchOutcome {
        let mut per_zone: HashMap<ZoneId, usize> = group.zones.iter().map(|z| (*z, 0)).collect();
        for id in &group.instances {
            if let Ok(instance) = self.zones.instance(*id) {
                *per_zone.entry(instance.zone_id).or_default() += 1;
            }
        }

        let mut outcome = LaunchOutcome { launched: Vec::new(), error: None };
        for _ in 0..count {
            let zone_id = group
                .zones
                .iter()
                .filter(|z| self.zones.zone_status(**z).map(|s| s == ZoneStatus::Active).unwrap_or(false))
                .min_by_key(|z| per_zone.get(*z).copied().unwrap_or(0))
                .copied();
            let zone_id = match zone_id {
                Some(z) => z,
                None => {
                    outcome.error = Some(AvailabilityError::InvalidState(format!(
                        "group {} has no active zone",
                        group.name
                    )));
                    break;
                }
            };
            match self.launch_one(group, zone_id).await {
                Ok(id) => {
                    *per_zone.entry(zone_id).or_default() += 1;
                    outcome.launched.push(id);
                }
                Err(e) => {
                    outcome.error = Some(e);
                    break;
                }
            }
        }
        outcome
    }

    async fn launch_one(&self, group: &ScalingGroup, zone_id: ZoneId) -> AvailabilityResult<InstanceId> {
        let request = LaunchRequest {
            zone_id,
            service_type: group.service_type.clone(),
            version: group.version.clone(),
        };
        let mut instance = self.provisioner.launch(&request).await?;
        instance.zone_id = zone_id;
        let instance = match self.zones.add_instance(instance.clone()) {
            Ok(registered) => registered,
            Err(e) => {
                if let Err(te) = self.provisioner.terminate(&instance).await {
                    tracing::warn!(instance = %instance.id, "Terminate of unplaced instance failed: {}", te);
                }
                return Err(e);
            }
        };
        self.attach_to_balancer(&instance);
        Ok(instance.id)
    }

    fn attach_to_balancer(&self, instance: &ServiceInstance) {
        if let Ok(lb) = self.balancers.find_for_service(&instance.service_type) {
            let spec = TargetSpec {
                endpoint: instance.host.clone(),
                port: instance.port,
                weight: 1,
                zone: instance.zone_id,
                service: Some(instance.service_type.clone()),
                instance_id: Some(instance.id),
                check: instance.check.clone(),
            };
            if let Err(e) = lb.add_target(spec) {
                tracing::warn!(instance = %instance.id, "Could not register target: {}", e);
            }
        }
    }

    /// Terminate the newest instances
    async fn scale_in(&self, group: &mut ScalingGroup, count: u32) {
        let mut instances: Vec<ServiceInstance> =
            group.instances.iter().filter_map(|id| self.zones.instance(*id).ok()).collect();
        instances.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        for instance in instances.into_iter().take(count as usize) {
            self.retire(&instance).await;
            group.instances.retain(|id| *id != instance.id);
        }
    }

    /// Pull an instance out of rotation, terminate it and forget it
    async fn retire(&self, instance: &ServiceInstance) {
        if let Ok(lb) = self.balancers.find_for_service(&instance.service_type) {
            let targets = lb.targets(&instance.service_type);
            if let Some(t) = targets.iter().find(|t| t.instance_id == Some(instance.id)) {
                let _ = lb.remove_target(t.id);
            }
        }
        if let Err(e) = self.provisioner.terminate(instance).await {
            tracing::warn!(instance = %instance.id, "Terminate failed: {}", e);
        }
        let _ = self.zones.remove_instance(instance.id);
    }

    /// Hold evaluation of every group running `service`
    pub fn suspend(&self, service: &str) {
        self.suspended.insert(service.to_string());
    }

    pub fn resume(&self, service: &str) {
        self.suspended.remove(service);
    }

    /// Move the groups running `service` onto a finished rollout
    ///
    /// Retired instances leave every such group; the first group by name
    /// takes the launched ones. Desired size follows the new membership.
    pub async fn adopt_rollout(&self, service: &str, version: &str, retired: &[InstanceId], launched: &[InstanceId]) {
        let owners: Vec<GroupId> =
            self.groups().into_iter().filter(|g| g.service_type == service).map(|g| g.id).collect();
        for (n, id) in owners.into_iter().enumerate() {
            let lock = self.locks.entry(id).or_default().clone();
            let _guard = lock.lock().await;
            let mut group = match self.group(id) {
                Ok(g) => g,
                Err(_) => continue,
            };
            group.instances.retain(|i| !retired.contains(i));
            if n == 0 {
                for i in launched {
                    if !group.instances.contains(i) && self.zones.instance(*i).is_ok() {
                        group.instances.push(*i);
                    }
                }
            }
            group.version = version.to_string();
            group.desired_size = clamp_capacity(group.instances.len() as i64, group.min_size, group.max_size).0;
            group.breach_counts.clear();
            tracing::info!(
                group = %group.name, version, instances = group.instances.len(),
                "Scaling group adopted rollout"
            );
            self.groups.insert(group.id, group);
        }
    }

    /// Evaluate every group concurrently
    pub async fn evaluate_all(self: &Arc<Self>) -> Vec<ScalingDecision> {
        let mut tasks = JoinSet::new();
        for group in self.groups.values() {
            let engine = self.clone();
            tasks.spawn(async move { (group.id, engine.evaluate_group(group.id).await) });
        }

        let mut decisions = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Some(decision)))) => decisions.push(decision),
                Ok((_, Ok(None))) => {}
                Ok((id, Err(e))) => tracing::warn!(group = %id, "Scaling evaluation failed: {}", e),
                Err(e) => tracing::error!("Scaling task panicked: {}", e),
            }
        }
        decisions
    }

    /// Evaluation loop until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(self.config.evaluation_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval = ?self.config.evaluation_interval(), "Scaling engine started");
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.evaluate_all().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Scaling engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn engine(h: &Harness) -> Arc<ScalingEngine> {
        Arc::new(ScalingEngine::new(
            ScalingConfig::default(),
            h.zones.clone(),
            h.monitor.clone(),
            h.balancers.clone(),
            h.provisioner.clone(),
            h.clock.clone(),
        ))
    }

    fn target_tracking(target: f64) -> ScalingPolicySpec {
        ScalingPolicySpec {
            name: Some("cpu-50".into()),
            policy_type: PolicyType::TargetTracking,
            metric: MetricType::CpuUtilization,
            target_value: Some(target),
            scale_out_threshold: None,
            scale_in_threshold: None,
            scale_out_adjustment: Adjustment::default(),
            scale_in_adjustment: Adjustment::default(),
            step_intervals: vec![],
            cooldown_secs: 300,
            evaluation_periods: 1,
        }
    }

    fn group_spec(min: u32, max: u32, desired: u32, policies: Vec<ScalingPolicySpec>) -> ScalingGroupSpec {
        ScalingGroupSpec {
            name: "resolvers".into(),
            service_type: "resolver".into(),
            version: "1.4.0".into(),
            min_size: min,
            max_size: max,
            desired_size: desired,
            zones: vec![],
            policies,
        }
    }

    fn cpu(v: f64) -> MetricSnapshot {
        MetricSnapshot { cpu_utilization: v, ..Default::default() }
    }

    #[tokio::test]
    async fn test_target_tracking_then_cooldown() {
        let h = harness();
        h.zone("use1-a", "us-east");
        let engine = engine(&h);
        let group = engine.create_group(group_spec(2, 10, 2, vec![target_tracking(50.0)])).await.unwrap();
        assert_eq!(group.instances.len(), 2);

        let decision = engine.evaluate_with_metrics(group.id, cpu(80.0)).await.unwrap().unwrap();
        assert_eq!((decision.previous_capacity, decision.new_capacity), (2, 3));
        assert_eq!(decision.policy_ids, vec![group.policies[0].id]);
        assert_eq!(engine.group(group.id).unwrap().instances.len(), 3);

        // Same load inside the cooldown window does nothing
        h.clock.advance(Duration::from_secs(60));
        assert!(engine.evaluate_with_metrics(group.id, cpu(80.0)).await.unwrap().is_none());
        assert_eq!(engine.group(group.id).unwrap().desired_size, 3);

        h.clock.advance(Duration::from_secs(241));
        let decision = engine.evaluate_with_metrics(group.id, cpu(80.0)).await.unwrap().unwrap();
        assert_eq!(decision.new_capacity, 5);
    }

    #[tokio::test]
    async fn test_largest_scale_out_wins_and_clamps() {
        let h = harness();
        h.zone("use1-a", "us-east");
        let engine = engine(&h);
        let simple = ScalingPolicySpec {
            name: Some("simple".into()),
            policy_type: PolicyType::Simple,
            scale_out_threshold: Some(70.0),
            scale_in_threshold: Some(20.0),
            scale_out_adjustment: Adjustment::change(1),
            ..target_tracking(50.0)
        };
        let group = engine
            .create_group(group_spec(2, 6, 4, vec![target_tracking(50.0), simple]))
            .await
            .unwrap();

        // Target tracking asks for 8, simple for 5
        let decision = engine.evaluate_with_metrics(group.id, cpu(100.0)).await.unwrap().unwrap();
        assert_eq!(decision.requested_capacity, 8);
        assert_eq!(decision.new_capacity, 6);
        assert!(decision.clamped);
        assert_eq!(decision.policy_ids, vec![group.policies[0].id]);
    }

    #[tokio::test]
    async fn test_smallest_scale_in_wins_newest_removed() {
        let h = harness();
        h.zone("use1-a", "us-east");
        h.zone("use1-b", "us-east");
        let engine = engine(&h);
        let simple = ScalingPolicySpec {
            name: Some("simple".into()),
            policy_type: PolicyType::Simple,
            target_value: None,
            scale_out_threshold: Some(70.0),
            scale_in_threshold: Some(20.0),
            scale_in_adjustment: Adjustment::change(1),
            ..target_tracking(50.0)
        };
        let group = engine
            .create_group(group_spec(1, 10, 4, vec![target_tracking(50.0), simple]))
            .await
            .unwrap();
        let zones: std::collections::HashSet<_> =
            group.instances.iter().map(|id| h.zones.instance(*id).unwrap().zone_id).collect();
        assert_eq!(zones.len(), 2);

        h.clock.advance(Duration::from_secs(1));
        // Target tracking asks for 1, simple for 3
        let decision = engine.evaluate_with_metrics(group.id, cpu(10.0)).await.unwrap().unwrap();
        assert_eq!(decision.direction, Direction::In);
        assert_eq!(decision.new_capacity, 3);
        assert_eq!(h.provisioner.terminated().len(), 1);
        assert!(!engine.group(group.id).unwrap().instances.contains(&h.provisioner.terminated()[0]));
    }

    #[tokio::test]
    async fn test_evaluation_periods_debounce() {
        let h = harness();
        h.zone("use1-a", "us-east");
        let engine = engine(&h);
        let mut policy = target_tracking(50.0);
        policy.evaluation_periods = 3;
        let group = engine.create_group(group_spec(2, 10, 2, vec![policy])).await.unwrap();

        assert!(engine.evaluate_with_metrics(group.id, cpu(80.0)).await.unwrap().is_none());
        assert!(engine.evaluate_with_metrics(group.id, cpu(80.0)).await.unwrap().is_none());
        assert!(engine.evaluate_with_metrics(group.id, cpu(80.0)).await.unwrap().is_some());
    }

    #[test]
    fn test_step_policy_bands() {
        let policy = ScalingPolicy::from_spec(ScalingPolicySpec {
            name: None,
            policy_type: PolicyType::Step,
            metric: MetricType::CpuUtilization,
            target_value: None,
            scale_out_threshold: Some(70.0),
            scale_in_threshold: Some(30.0),
            scale_out_adjustment: Adjustment::change(1),
            scale_in_adjustment: Adjustment::change(1),
            step_intervals: vec![
                StepInterval { lower_bound: 0.0, upper_bound: Some(10.0), adjustment: 1 },
                StepInterval { lower_bound: 10.0, upper_bound: None, adjustment: 3 },
            ],
            cooldown_secs: 60,
            evaluation_periods: 1,
        })
        .unwrap();

        assert_eq!(policy.propose(4, 75.0, &[], 1.0), Some((Direction::Out, 5)));
        assert_eq!(policy.propose(4, 95.0, &[], 1.0), Some((Direction::Out, 7)));
        assert_eq!(policy.propose(4, 10.0, &[], 1.0), Some((Direction::In, 1)));
        assert_eq!(policy.propose(4, 50.0, &[], 1.0), None);
    }

    #[test]
    fn test_predictive_projects_trend() {
        let policy = ScalingPolicy::from_spec(ScalingPolicySpec {
            name: None,
            policy_type: PolicyType::Predictive,
            metric: MetricType::RequestRate,
            target_value: None,
            scale_out_threshold: Some(1000.0),
            scale_in_threshold: None,
            scale_out_adjustment: Adjustment::change(2),
            scale_in_adjustment: Adjustment::default(),
            step_intervals: vec![],
            cooldown_secs: 300,
            evaluation_periods: 1,
        })
        .unwrap();

        let rising = [600.0, 700.0, 800.0, 900.0];
        assert_eq!(policy.propose(3, 900.0, &rising, 5.0), Some((Direction::Out, 5)));
        let flat = [900.0, 900.0, 900.0, 900.0];
        assert_eq!(policy.propose(3, 900.0, &flat, 5.0), None);
        assert_eq!(policy.propose(3, 900.0, &rising[..2], 5.0), None);
    }

    #[test]
    fn test_percent_adjustment_moves_at_least_one() {
        let pct = Adjustment { adjustment_type: AdjustmentType::PercentChangeInCapacity, value: 10 };
        assert_eq!(pct.apply(3, Direction::Out), 4);
        assert_eq!(pct.apply(30, Direction::In), 27);
        let exact = Adjustment { adjustment_type: AdjustmentType::ExactCapacity, value: 6 };
        assert_eq!(exact.apply(2, Direction::Out), 6);
    }

    #[tokio::test]
    async fn test_invalid_bounds_rejected() {
        let h = harness();
        h.zone("use1-a", "us-east");
        let engine = engine(&h);
        let err = engine.create_group(group_spec(3, 2, 2, vec![])).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");
    }

    #[test]
    fn test_exact_capacity_never_scales_against_direction() {
        let policy = ScalingPolicy::from_spec(ScalingPolicySpec {
            name: None,
            policy_type: PolicyType::Simple,
            scale_out_threshold: Some(70.0),
            scale_in_threshold: Some(20.0),
            scale_out_adjustment: Adjustment { adjustment_type: AdjustmentType::ExactCapacity, value: 2 },
            scale_in_adjustment: Adjustment { adjustment_type: AdjustmentType::ExactCapacity, value: 6 },
            ..target_tracking(50.0)
        })
        .unwrap();

        assert_eq!(policy.propose(4, 90.0, &[], 1.0), None);
        assert_eq!(policy.propose(4, 10.0, &[], 1.0), None);
        assert_eq!(policy.propose(1, 90.0, &[], 1.0), Some((Direction::Out, 2)));
    }

    #[tokio::test]
    async fn test_partial_scale_out_keeps_what_launched() {
        let h = harness();
        h.zone("use1-a", "us-east");
        let engine = engine(&h);
        let group = engine.create_group(group_spec(2, 10, 2, vec![target_tracking(50.0)])).await.unwrap();
        h.provisioner.fail_launches_after(1);

        let decision = engine.evaluate_with_metrics(group.id, cpu(100.0)).await.unwrap().unwrap();
        assert_eq!(decision.requested_capacity, 4);
        assert_eq!(decision.new_capacity, 3);

        let group = engine.group(group.id).unwrap();
        assert_eq!(group.desired_size, 3);
        assert_eq!(group.instances.len(), 3);
        assert_eq!(h.zones.instances_of("resolver").len(), 3);
        assert_eq!(h.provisioner.launched().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_creation_terminates_partial_launches() {
        let h = harness();
        h.zone("use1-a", "us-east");
        let engine = engine(&h);
        h.provisioner.fail_launches_after(1);

        assert!(engine.create_group(group_spec(2, 10, 3, vec![])).await.is_err());
        assert!(engine.groups().is_empty());
        assert!(h.zones.instances_of("resolver").is_empty());
        let launched: Vec<InstanceId> = h.provisioner.launched().iter().map(|i| i.id).collect();
        assert_eq!(h.provisioner.terminated(), launched);
    }

    #[tokio::test]
    async fn test_suspended_service_is_not_evaluated() {
        let h = harness();
        h.zone("use1-a", "us-east");
        let engine = engine(&h);
        let group = engine.create_group(group_spec(2, 10, 2, vec![target_tracking(50.0)])).await.unwrap();
        h.metrics.set_version("1.4.0", cpu(80.0));

        engine.suspend("resolver");
        assert!(engine.evaluate_group(group.id).await.unwrap().is_none());
        engine.resume("resolver");
        let decision = engine.evaluate_group(group.id).await.unwrap().unwrap();
        assert_eq!(decision.new_capacity, 3);
    }

    #[tokio::test]
    async fn test_adopted_rollout_replaces_membership() {
        let h = harness();
        let zone = h.zone("use1-a", "us-east");
        let engine = engine(&h);
        let group = engine.create_group(group_spec(1, 10, 2, vec![target_tracking(50.0)])).await.unwrap();
        let fresh = h
            .zones
            .add_instance(ServiceInstance::new(zone.id, "resolver", "1.5.0", "10.3.0.1", 53))
            .unwrap();

        engine.adopt_rollout("resolver", "1.5.0", &group.instances, &[fresh.id]).await;

        let group = engine.group(group.id).unwrap();
        assert_eq!(group.instances, vec![fresh.id]);
        assert_eq!(group.version, "1.5.0");
        assert_eq!(group.desired_size, 1);
    }

    proptest! {
        #[test]
        fn prop_clamp_stays_in_bounds(requested in -50i64..200, min in 0u32..20, span in 0u32..30) {
            let max = min + span;
            let (capacity, clamped) = clamp_capacity(requested, min, max);
            prop_assert!(capacity >= min && capacity <= max);
            prop_assert_eq!(clamped, requested < min as i64 || requested > max as i64);
        }
    }
}
