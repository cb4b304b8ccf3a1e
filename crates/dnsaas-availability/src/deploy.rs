//! Deployment Orchestrator
//!
//! Runs blue-green, rolling, canary and immutable deployments against the
//! targets of one service. The target set is snapshotted before anything
//! changes; every failure path can restore that snapshot exactly because old
//! instances are only terminated in the final decommission step.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

use dnsaas_common::{
    AvailabilityError, AvailabilityResult, Clock, DeploymentId, InstanceId, MemoryStore, Store, TargetId, ZoneId,
};

use crate::balancer::{LoadBalancer, LoadBalancerRegistry, LoadBalancerTarget, TargetSnapshot, TargetSpec};
use crate::config::DeploymentConfig;
use crate::health::{HealthMonitor, TargetStatus};
use crate::ports::{AlertSeverity, LaunchRequest, Notifier, OperatorAlert, ProvisioningProvider};
use crate::scaling::ScalingEngine;
use crate::zone::{ZoneRegistry, ZoneStatus};

/// Deployment strategy type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    Rolling,
    BlueGreen,
    Canary,
    Immutable,
}

/// Strategy parameters; each strategy reads the ones it needs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyParameters {
    pub max_unavailable: u32,
    pub max_surge: u32,
    /// Percent of traffic sent to the canary
    pub canary_percentage: u32,
    pub soak_period_ms: u64,
    /// How long a drained blue set is kept before termination
    pub drain_grace_ms: u64,
}

impl Default for StrategyParameters {
    fn default() -> Self {
        Self {
            max_unavailable: 1,
            max_surge: 1,
            canary_percentage: 10,
            soak_period_ms: 300_000,
            drain_grace_ms: 300_000,
        }
    }
}

/// Thresholds that abort a canary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackTrigger {
    /// Fraction, 0-1
    pub max_error_rate: f64,
    pub max_latency_ms: Option<f64>,
}

impl Default for RollbackTrigger {
    fn default() -> Self {
        Self { max_error_rate: 0.05, max_latency_ms: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackStrategy {
    pub automatic: bool,
    pub trigger: RollbackTrigger,
}

impl Default for RollbackStrategy {
    fn default() -> Self {
        Self { automatic: true, trigger: RollbackTrigger::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentStrategy {
    #[serde(rename = "type")]
    pub strategy_type: StrategyType,
    #[serde(default)]
    pub parameters: StrategyParameters,
    #[serde(default, alias = "rollbackStrategy")]
    pub rollback: RollbackStrategy,
}

/// Deployment request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    #[serde(alias = "serviceId")]
    pub service_id: String,
    pub version: String,
    pub strategy: DeploymentStrategy,
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Initializing,
    Running,
    Completed,
    /// Halted awaiting a manual rollback
    Failed,
    RolledBack,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub name: String,
    pub status: StepStatus,
    /// Percent
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub logs: Vec<String>,
}

/// What a rollback restores
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub snapshot: TargetSnapshot,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSession {
    pub id: DeploymentId,
    pub service_id: String,
    pub version: String,
    pub strategy: DeploymentStrategy,
    pub status: DeploymentStatus,
    pub steps: Vec<DeploymentStep>,
    pub rollback_plan: RollbackPlan,
    pub launched_instances: Vec<InstanceId>,
    pub launched_targets: Vec<TargetId>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Deployment orchestrator
pub struct DeploymentOrchestrator {
    config: DeploymentConfig,
    sessions: Arc<dyn Store<DeploymentSession>>,
    /// Service -> session holding it
    active: Mutex<HashMap<String, DeploymentId>>,
    cancels: DashMap<DeploymentId, watch::Sender<bool>>,
    zones: Arc<ZoneRegistry>,
    monitor: Arc<HealthMonitor>,
    balancers: Arc<LoadBalancerRegistry>,
    scaling: Arc<ScalingEngine>,
    provisioner: Arc<dyn ProvisioningProvider>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl DeploymentOrchestrator {
    pub fn new(
        config: DeploymentConfig,
        zones: Arc<ZoneRegistry>,
        monitor: Arc<HealthMonitor>,
        balancers: Arc<LoadBalancerRegistry>,
        scaling: Arc<ScalingEngine>,
        provisioner: Arc<dyn ProvisioningProvider>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            sessions: Arc::new(MemoryStore::new()),
            active: Mutex::new(HashMap::new()),
            cancels: DashMap::new(),
            zones,
            monitor,
            balancers,
            scaling,
            provisioner,
            notifier,
            clock,
        }
    }

    /// Run a deployment to its end
    pub async fn deploy(&self, request: DeploymentRequest) -> AvailabilityResult<DeploymentSession> {
        let (session, cancel) = self.prepare(request)?;
        Ok(self.execute(session, cancel).await)
    }

    /// Start a deployment in the background; returns the initial session
    pub fn start(self: &Arc<Self>, request: DeploymentRequest) -> AvailabilityResult<DeploymentSession> {
        let (session, cancel) = self.prepare(request)?;
        let initial = session.clone();
        let this = self.clone();
        tokio::spawn(async move {
            this.execute(session, cancel).await;
        });
        Ok(initial)
    }

    pub fn session(&self, id: DeploymentId) -> AvailabilityResult<DeploymentSession> {
        self.sessions.get(&id).ok_or_else(|| AvailabilityError::not_found("deployment", id))
    }

    pub fn sessions(&self) -> Vec<DeploymentSession> {
        let mut all = self.sessions.values();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    fn prepare(&self, request: DeploymentRequest) -> AvailabilityResult<(DeploymentSession, watch::Receiver<bool>)> {
        validate(&request)?;
        let lb = self.balancers.find_for_service(&request.service_id)?;
        let now = self.clock.now();

        let session = {
            let mut active = self.active.lock();
            if let Some(existing) = active.get(&request.service_id) {
                return Err(AvailabilityError::ConflictingDeployment {
                    service: request.service_id,
                    active: *existing,
                });
            }
            let session = DeploymentSession {
                id: Uuid::new_v4(),
                service_id: request.service_id.clone(),
                version: request.version,
                strategy: request.strategy,
                status: DeploymentStatus::Initializing,
                steps: Vec::new(),
                rollback_plan: RollbackPlan { snapshot: lb.snapshot(&request.service_id), captured_at: now },
                launched_instances: Vec::new(),
                launched_targets: Vec::new(),
                error: None,
                created_at: now,
                updated_at: now,
                finished_at: None,
            };
            self.scaling.suspend(&request.service_id);
            active.insert(request.service_id, session.id);
            session
        };

        let (tx, rx) = watch::channel(false);
        self.cancels.insert(session.id, tx);
        self.sessions.insert(session.id, session.clone());
        tracing::info!(
            service = %session.service_id, version = %session.version,
            strategy = ?session.strategy.strategy_type, "Deployment {} accepted", session.id
        );
        Ok((session, rx))
    }

    async fn execute(&self, session: DeploymentSession, cancel: watch::Receiver<bool>) -> DeploymentSession {
        let id = session.id;
        let lb = match self.balancers.get(session.rollback_plan.snapshot.load_balancer_id) {
            Ok(lb) => lb,
            Err(e) => {
                let mut session = session;
                session.status = DeploymentStatus::Failed;
                session.error = Some(e.to_string());
                self.sessions.insert(id, session.clone());
                self.release(&session);
                return session;
            }
        };

        let old: Vec<LoadBalancerTarget> = session
            .rollback_plan
            .snapshot
            .targets
            .iter()
            .filter(|t| t.weight > 0 && t.status != TargetStatus::Unused)
            .cloned()
            .collect();
        let mut run = Run { orch: self, lb, session, cancel, old, new: Vec::new() };
        run.session.status = DeploymentStatus::Running;
        run.save();

        let result = match run.session.strategy.strategy_type {
            StrategyType::BlueGreen => run.blue_green().await,
            StrategyType::Immutable => run.immutable().await,
            StrategyType::Canary => run.canary().await,
            StrategyType::Rolling => run.rolling().await,
        };

        let retired: Vec<InstanceId> = run.old.iter().filter_map(|t| t.instance_id).collect();
        let mut session = run.session;
        match result {
            Ok(()) => {
                self.scaling
                    .adopt_rollout(&session.service_id, &session.version, &retired, &session.launched_instances)
                    .await;
                session.status = DeploymentStatus::Completed;
                session.finished_at = Some(self.clock.now());
                self.sessions.insert(id, session.clone());
                self.release(&session);
                tracing::info!(service = %session.service_id, version = %session.version, "Deployment {} completed", id);
            }
            Err(AvailabilityError::Cancelled) => {
                self.roll_back(&mut session, "deployment cancelled").await;
            }
            Err(e) if session.strategy.rollback.automatic => {
                session.error = Some(e.to_string());
                self.roll_back(&mut session, &e.to_string()).await;
            }
            Err(e) => {
                session.status = DeploymentStatus::Failed;
                session.error = Some(e.to_string());
                session.finished_at = Some(self.clock.now());
                self.sessions.insert(id, session.clone());
                tracing::warn!(service = %session.service_id, "Deployment {} halted: {}", id, e);
                self.notifier
                    .notify(OperatorAlert {
                        severity: AlertSeverity::Critical,
                        source: format!("deployment/{}", session.service_id),
                        message: format!("deployment {} of {} failed and awaits rollback: {}", id, session.version, e),
                        raised_at: self.clock.now(),
                    })
                    .await;
            }
        }
        self.cancels.remove(&id);
        session
    }

    /// Operator rollback
    ///
    /// Running sessions are cancelled and roll back in their own task; failed
    /// sessions roll back here. Rolled-back sessions are returned unchanged.
    pub async fn rollback(&self, id: DeploymentId) -> AvailabilityResult<DeploymentSession> {
        let mut session = self.session(id)?;
        match session.status {
            DeploymentStatus::RolledBack => Ok(session),
            DeploymentStatus::Completed => Err(AvailabilityError::InvalidState(format!(
                "deployment {} already completed",
                id
            ))),
            DeploymentStatus::Initializing | DeploymentStatus::Running => {
                self.cancel(id)?;
                Ok(session)
            }
            DeploymentStatus::Failed => {
                self.roll_back(&mut session, "manual rollback").await;
                Ok(session)
            }
        }
    }

    /// Signal a running deployment to stop and roll back
    pub fn cancel(&self, id: DeploymentId) -> AvailabilityResult<()> {
        let sender = self
            .cancels
            .get(&id)
            .ok_or_else(|| AvailabilityError::InvalidState(format!("deployment {} is not running", id)))?;
        let _ = sender.send(true);
        tracing::warn!("Cancellation requested for deployment {}", id);
        Ok(())
    }

    async fn roll_back(&self, session: &mut DeploymentSession, reason: &str) {
        let now = self.clock.now();
        let mut step = DeploymentStep {
            name: "rollback".into(),
            status: StepStatus::Running,
            progress: 0,
            started_at: now,
            finished_at: None,
            logs: vec![format!("rolling back: {}", reason)],
        };
        tracing::warn!(service = %session.service_id, "Rolling back deployment {}: {}", session.id, reason);

        let snapshot = &session.rollback_plan.snapshot;
        let restored = match self.balancers.get(snapshot.load_balancer_id) {
            Ok(lb) => {
                let launched: Vec<(TargetId, u32)> = session
                    .launched_targets
                    .iter()
                    .filter(|id| lb.target(**id).is_some())
                    .map(|id| (*id, 0))
                    .collect();
                if !launched.is_empty() && lb.set_weights(&launched).is_ok() {
                    step.logs.push(format!("{} new target(s) set to weight 0", launched.len()));
                }
                lb.restore(snapshot).map(|removed| {
                    step.logs.push(format!(
                        "restored {} target(s), removed {}",
                        snapshot.targets.len(),
                        removed.len()
                    ));
                })
            }
            Err(e) => Err(e),
        };

        for instance_id in &session.launched_instances {
            if let Ok(instance) = self.zones.instance(*instance_id) {
                if let Err(e) = self.provisioner.terminate(&instance).await {
                    step.logs.push(format!("terminate {} failed: {}", instance_id, e));
                }
                let _ = self.zones.remove_instance(*instance_id);
            }
        }
        step.finished_at = Some(self.clock.now());

        match restored {
            Ok(()) => {
                step.status = StepStatus::Completed;
                step.progress = 100;
                session.status = DeploymentStatus::RolledBack;
            }
            Err(e) => {
                step.status = StepStatus::Failed;
                step.logs.push(e.to_string());
                session.status = DeploymentStatus::Failed;
                tracing::error!(service = %session.service_id, "Rollback of deployment {} failed: {}", session.id, e);
                self.notifier
                    .notify(OperatorAlert {
                        severity: AlertSeverity::Critical,
                        source: format!("deployment/{}", session.service_id),
                        message: format!("rollback of deployment {} failed: {}", session.id, e),
                        raised_at: self.clock.now(),
                    })
                    .await;
            }
        }
        session.steps.push(step);
        session.updated_at = self.clock.now();
        session.finished_at = Some(self.clock.now());
        self.sessions.insert(session.id, session.clone());
        if session.status == DeploymentStatus::RolledBack {
            self.release(session);
        }
    }

    fn release(&self, session: &DeploymentSession) {
        let mut active = self.active.lock();
        if active.get(&session.service_id) == Some(&session.id) {
            active.remove(&session.service_id);
            self.scaling.resume(&session.service_id);
        }
    }
}

fn validate(request: &DeploymentRequest) -> AvailabilityResult<()> {
    let params = &request.strategy.parameters;
    if request.version.trim().is_empty() {
        return Err(AvailabilityError::InvalidConfig("version must not be empty".into()));
    }
    match request.strategy.strategy_type {
        StrategyType::Canary if params.canary_percentage == 0 || params.canary_percentage > 100 => Err(
            AvailabilityError::InvalidConfig("canary_percentage must be within 1-100".into()),
        ),
        StrategyType::Rolling if params.max_surge == 0 && params.max_unavailable == 0 => Err(
            AvailabilityError::InvalidConfig("max_surge and max_unavailable cannot both be 0".into()),
        ),
        _ => Ok(()),
    }
}

/// One executing deployment
struct Run<'a> {
    orch: &'a DeploymentOrchestrator,
    lb: Arc<LoadBalancer>,
    session: DeploymentSession,
    cancel: watch::Receiver<bool>,
    /// Targets carrying traffic before the deployment
    old: Vec<LoadBalancerTarget>,
    /// Targets launched so far
    new: Vec<LoadBalancerTarget>,
}

impl<'a> Run<'a> {
    fn save(&mut self) {
        self.session.updated_at = self.orch.clock.now();
        self.orch.sessions.insert(self.session.id, self.session.clone());
    }

    fn begin(&mut self, name: &str) {
        self.session.steps.push(DeploymentStep {
            name: name.to_string(),
            status: StepStatus::Running,
            progress: 0,
            started_at: self.orch.clock.now(),
            finished_at: None,
            logs: Vec::new(),
        });
        tracing::info!(service = %self.session.service_id, step = name, "Deployment step started");
        self.save();
    }

    fn log(&mut self, message: String) {
        tracing::debug!(service = %self.session.service_id, "{}", message);
        if let Some(step) = self.session.steps.last_mut() {
            step.logs.push(message);
        }
    }

    fn progress(&mut self, pct: u8) {
        if let Some(step) = self.session.steps.last_mut() {
            step.progress = pct.min(100);
        }
        self.save();
    }

    fn finish(&mut self, result: AvailabilityResult<()>) -> AvailabilityResult<()> {
        let now = self.orch.clock.now();
        let outcome = match self.session.steps.last_mut() {
            Some(step) => {
                step.finished_at = Some(now);
                match result {
                    Ok(()) => {
                        step.status = StepStatus::Completed;
                        step.progress = 100;
                        Ok(())
                    }
                    Err(AvailabilityError::Cancelled) => {
                        step.status = StepStatus::Cancelled;
                        Err(AvailabilityError::Cancelled)
                    }
                    Err(e) => {
                        step.status = StepStatus::Failed;
                        step.logs.push(e.to_string());
                        Err(match e {
                            AvailabilityError::DeploymentStepFailure { .. } => e,
                            other => AvailabilityError::DeploymentStepFailure {
                                step: step.name.clone(),
                                reason: other.to_string(),
                            },
                        })
                    }
                }
            }
            None => result,
        };
        self.save();
        outcome
    }

    fn check_cancel(&self) -> AvailabilityResult<()> {
        if *self.cancel.borrow() {
            Err(AvailabilityError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep unless cancelled first
    async fn pause(&mut self, duration: Duration) -> AvailabilityResult<()> {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                changed = self.cancel.changed() => match changed {
                    Ok(()) if *self.cancel.borrow() => return Err(AvailabilityError::Cancelled),
                    Ok(()) => continue,
                    Err(_) => {
                        (&mut sleep).await;
                        return Ok(());
                    }
                },
            }
        }
    }

    fn service(&self) -> String {
        self.session.service_id.clone()
    }

    fn old_weight(&self, i: usize) -> u32 {
        if self.old.is_empty() {
            1
        } else {
            self.old[i % self.old.len()].weight.max(1)
        }
    }

    /// Zones new instances go to, preferring where the service already runs
    fn launch_zones(&self) -> Vec<ZoneId> {
        let mut zones: Vec<ZoneId> = Vec::new();
        for t in &self.old {
            if !zones.contains(&t.zone_id)
                && self.orch.zones.zone_status(t.zone_id).map(|s| s == ZoneStatus::Active).unwrap_or(false)
            {
                zones.push(t.zone_id);
            }
        }
        if zones.is_empty() {
            zones = self.orch.zones.zones_with_status(ZoneStatus::Active).into_iter().map(|z| z.id).collect();
        }
        zones
    }

    /// Launch instances on the new version and register them at weight 0
    async fn launch(&mut self, count: usize) -> AvailabilityResult<Vec<LoadBalancerTarget>> {
        let zones = self.launch_zones();
        if zones.is_empty() {
            return Err(AvailabilityError::InvalidState("no active zone to deploy into".into()));
        }

        let mut launched = Vec::new();
        for i in 0..count {
            self.check_cancel()?;
            let zone_id = zones[(self.new.len() + i) % zones.len()];
            let request = LaunchRequest {
                zone_id,
                service_type: self.service(),
                version: self.session.version.clone(),
            };
            let mut instance = self.orch.provisioner.launch(&request).await?;
            instance.zone_id = zone_id;
            let instance = self.orch.zones.add_instance(instance)?;
            self.session.launched_instances.push(instance.id);

            let target = self.lb.add_target(TargetSpec {
                endpoint: instance.host.clone(),
                port: instance.port,
                weight: 0,
                zone: zone_id,
                service: Some(self.service()),
                instance_id: Some(instance.id),
                check: instance.check.clone(),
            })?;
            self.session.launched_targets.push(target.id);
            self.log(format!("launched {} as target {}", instance.endpoint(), target.id));
            launched.push(target);
        }
        self.new.extend(launched.iter().cloned());
        Ok(launched)
    }

    /// Probe targets through the monitor until all are healthy
    async fn wait_healthy(&mut self, targets: &[LoadBalancerTarget]) -> AvailabilityResult<()> {
        let ids: Vec<TargetId> = targets.iter().map(|t| t.id).collect();
        let deadline = Instant::now() + self.orch.config.health_check_timeout();
        loop {
            self.check_cancel()?;
            self.orch.monitor.probe_targets(&ids).await;
            let unhealthy: Vec<TargetId> = ids
                .iter()
                .copied()
                .filter(|id| self.orch.monitor.target_status(*id) != Some(TargetStatus::Healthy))
                .collect();
            if unhealthy.is_empty() {
                self.log(format!("{} target(s) healthy", ids.len()));
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(AvailabilityError::TargetUnhealthy(unhealthy[0]));
            }
            self.pause(self.orch.config.health_poll_interval()).await?;
        }
    }

    /// Put all traffic on the new set and drain the old one
    fn cut_over(&mut self) -> AvailabilityResult<()> {
        let weights: Vec<(TargetId, u32)> =
            self.new.iter().enumerate().map(|(i, t)| (t.id, self.old_weight(i))).collect();
        self.lb.replace_targets(&self.service(), &weights)?;
        for t in self.old.clone() {
            let _ = self.lb.drain_target(t.id);
        }
        self.log(format!("traffic moved to {} new target(s)", weights.len()));
        Ok(())
    }

    /// Remove the old targets and terminate their instances
    ///
    /// Runs to the end once started. Traffic has already left the old set, so
    /// an instance that will not terminate is reported instead of rolled back.
    async fn decommission(&mut self) -> AvailabilityResult<()> {
        let mut stranded = Vec::new();
        for t in self.old.clone() {
            let _ = self.lb.remove_target(t.id);
            if let Some(instance_id) = t.instance_id {
                if let Ok(instance) = self.orch.zones.instance(instance_id) {
                    if let Err(e) = self.orch.provisioner.terminate(&instance).await {
                        self.log(format!("terminate {} failed: {}", instance_id, e));
                        stranded.push(instance_id);
                        continue;
                    }
                    let _ = self.orch.zones.remove_instance(instance_id);
                }
            }
            self.log(format!("decommissioned {}:{}", t.endpoint, t.port));
        }

        if !stranded.is_empty() {
            tracing::warn!(service = %self.session.service_id, stranded = stranded.len(), "Old instances left running");
            let alert = OperatorAlert {
                severity: AlertSeverity::Warning,
                source: format!("deployment/{}", self.session.service_id),
                message: format!(
                    "deployment {} could not terminate {} old instance(s): {:?}",
                    self.session.id,
                    stranded.len(),
                    stranded
                ),
                raised_at: self.orch.clock.now(),
            };
            self.orch.notifier.notify(alert).await;
        }
        Ok(())
    }

    fn set_size(&self) -> usize {
        self.old.len().max(1)
    }

    async fn blue_green(&mut self) -> AvailabilityResult<()> {
        self.begin("provision green set");
        let r = self.launch(self.set_size()).await.map(|_| ());
        self.finish(r)?;

        self.begin("verify green health");
        let green = self.new.clone();
        let r = self.wait_healthy(&green).await;
        self.finish(r)?;

        self.begin("switch traffic");
        let r = self.check_cancel().and_then(|_| self.cut_over());
        self.finish(r)?;

        self.begin("decommission blue set");
        let grace = Duration::from_millis(self.session.strategy.parameters.drain_grace_ms);
        let mut r = self.pause(grace).await;
        if r.is_ok() {
            r = self.decommission().await;
        }
        self.finish(r)
    }

    async fn immutable(&mut self) -> AvailabilityResult<()> {
        self.begin("launch new set");
        let r = self.launch(self.set_size()).await.map(|_| ());
        self.finish(r)?;

        self.begin("verify new set");
        let fresh = self.new.clone();
        let r = self.wait_healthy(&fresh).await;
        self.finish(r)?;

        self.begin("cut over");
        let r = self.check_cancel().and_then(|_| self.cut_over());
        self.finish(r)?;

        self.begin("terminate old set");
        let r = self.decommission().await;
        self.finish(r)
    }

    async fn canary(&mut self) -> AvailabilityResult<()> {
        let pct = self.session.strategy.parameters.canary_percentage;
        let total = self.set_size();
        let canary_count = ((total as f64 * pct as f64 / 100.0).ceil() as usize).clamp(1, total);

        self.begin("launch canary");
        let r = self.launch(canary_count).await.map(|_| ());
        self.finish(r)?;

        self.begin("verify canary health");
        let canaries = self.new.clone();
        let r = self.wait_healthy(&canaries).await;
        self.finish(r)?;

        self.begin("shift canary traffic");
        let r = self.check_cancel().and_then(|_| self.shift_canary(&canaries, pct));
        self.finish(r)?;

        self.begin("soak canary");
        let r = self.soak(&canaries).await;
        self.finish(r)?;

        self.begin("promote");
        let r = self.promote(total - canary_count).await;
        self.finish(r)?;

        self.begin("decommission old set");
        let r = self.decommission().await;
        self.finish(r)
    }

    /// Old weights scaled by (100 - pct); canaries share pct of the old total
    fn shift_canary(&mut self, canaries: &[LoadBalancerTarget], pct: u32) -> AvailabilityResult<()> {
        let old_total: u32 = self.old.iter().map(|t| t.weight).sum::<u32>().max(1);
        let per_canary = ((pct as f64 * old_total as f64) / canaries.len() as f64).round().max(1.0) as u32;
        let mut weights: Vec<(TargetId, u32)> =
            self.old.iter().map(|t| (t.id, t.weight * (100 - pct))).collect();
        weights.extend(canaries.iter().map(|t| (t.id, per_canary)));
        self.lb.set_weights(&weights)?;
        self.log(format!("canary receives {}% of traffic", pct));
        Ok(())
    }

    async fn soak(&mut self, canaries: &[LoadBalancerTarget]) -> AvailabilityResult<()> {
        let params = self.session.strategy.parameters.clone();
        let trigger = self.session.strategy.rollback.trigger.clone();
        let instances: Vec<InstanceId> = canaries.iter().filter_map(|t| t.instance_id).collect();
        let soak = Duration::from_millis(params.soak_period_ms);
        let started = Instant::now();

        loop {
            self.check_cancel()?;
            if let Some(m) = self.orch.monitor.aggregate_metrics(&instances).await {
                self.log(format!("canary error rate {:.2}%, latency {:.1}ms", m.error_rate * 100.0, m.latency_ms));
                if m.error_rate > trigger.max_error_rate {
                    return Err(AvailabilityError::DeploymentStepFailure {
                        step: "soak canary".into(),
                        reason: format!(
                            "canary error rate {:.1}% above {:.1}%",
                            m.error_rate * 100.0,
                            trigger.max_error_rate * 100.0
                        ),
                    });
                }
                if let Some(max) = trigger.max_latency_ms {
                    if m.latency_ms > max {
                        return Err(AvailabilityError::DeploymentStepFailure {
                            step: "soak canary".into(),
                            reason: format!("canary latency {:.1}ms above {:.1}ms", m.latency_ms, max),
                        });
                    }
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= soak {
                return Ok(());
            }
            let pct = (elapsed.as_millis() * 100 / soak.as_millis().max(1)) as u8;
            self.progress(pct);
            let wait = self.orch.config.metrics_sample_interval().min(soak - elapsed);
            self.pause(wait).await?;
        }
    }

    async fn promote(&mut self, remaining: usize) -> AvailabilityResult<()> {
        if remaining > 0 {
            let rest = self.launch(remaining).await?;
            self.wait_healthy(&rest).await?;
        }
        self.check_cancel()?;
        self.cut_over()
    }

    /// Replace old targets in batches bounded by surge/unavailability
    async fn rolling(&mut self) -> AvailabilityResult<()> {
        let params = self.session.strategy.parameters.clone();
        let surge_first = params.max_surge > 0;
        let batch = (if surge_first { params.max_surge } else { params.max_unavailable }) as usize;
        let old = self.old.clone();
        let total = old.len().max(1);
        let batches = (total + batch - 1) / batch;

        for (n, chunk) in (0..total).collect::<Vec<_>>().chunks(batch).enumerate() {
            self.begin(&format!("batch {}/{}", n + 1, batches));
            let r = self.rolling_batch(chunk, &old, surge_first).await;
            self.finish(r)?;
        }

        self.begin("decommission old instances");
        let r = self.decommission().await;
        self.finish(r)
    }

    async fn rolling_batch(
        &mut self,
        indices: &[usize],
        old: &[LoadBalancerTarget],
        surge_first: bool,
    ) -> AvailabilityResult<()> {
        let retiring: Vec<&LoadBalancerTarget> = indices.iter().filter_map(|i| old.get(*i)).collect();
        if !surge_first {
            let weights: Vec<(TargetId, u32)> = retiring.iter().map(|t| (t.id, 0)).collect();
            self.lb.set_weights(&weights)?;
            for t in &retiring {
                let _ = self.lb.drain_target(t.id);
            }
        }

        let fresh = self.launch(indices.len()).await?;
        self.wait_healthy(&fresh).await?;
        self.check_cancel()?;

        let mut weights: Vec<(TargetId, u32)> = fresh
            .iter()
            .zip(indices)
            .map(|(t, i)| (t.id, self.old_weight(*i)))
            .collect();
        if surge_first {
            weights.extend(retiring.iter().map(|t| (t.id, 0)));
        }
        self.lb.set_weights(&weights)?;
        if surge_first {
            for t in &retiring {
                let _ = self.lb.drain_target(t.id);
            }
        }
        self.log(format!("replaced {} target(s)", fresh.len()));
        Ok(())
    }
}
