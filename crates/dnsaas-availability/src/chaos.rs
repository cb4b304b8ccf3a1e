//! Chaos Engineering
//!
//! Experiments fail probes for chosen targets or whole zones for a while and
//! record how the system reacted. Faults live in [`FaultInjectingProber`],
//! which wraps the real prober the health monitor uses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use uuid::Uuid;

use dnsaas_common::{AvailabilityError, AvailabilityResult, Clock, TargetId, ZoneId};

use crate::availability::{AvailabilityCalculator, SystemAvailabilityReport};
use crate::balancer::LoadBalancerRegistry;
use crate::health::{HealthListener, HealthMonitor, HealthTransition};
use crate::ports::{ProbeOutcome, ProbeSpec, Prober};
use crate::zone::ZoneRegistry;

/// Prober that fails addresses under an active fault
pub struct FaultInjectingProber {
    inner: Arc<dyn Prober>,
    /// Address -> number of experiments faulting it
    faults: RwLock<HashMap<String, usize>>,
}

impl FaultInjectingProber {
    pub fn new(inner: Arc<dyn Prober>) -> Self {
        Self { inner, faults: RwLock::new(HashMap::new()) }
    }

    fn inject(&self, addresses: &[String]) {
        let mut faults = self.faults.write();
        for address in addresses {
            *faults.entry(address.clone()).or_insert(0) += 1;
        }
    }

    fn clear(&self, addresses: &[String]) {
        let mut faults = self.faults.write();
        for address in addresses {
            if let Some(count) = faults.get_mut(address) {
                *count -= 1;
                if *count == 0 {
                    faults.remove(address);
                }
            }
        }
    }

    pub fn active_faults(&self) -> Vec<String> {
        let mut active: Vec<String> = self.faults.read().keys().cloned().collect();
        active.sort();
        active
    }
}

#[async_trait]
impl Prober for FaultInjectingProber {
    async fn probe(&self, spec: &ProbeSpec) -> ProbeOutcome {
        if self.faults.read().contains_key(&spec.address()) {
            return ProbeOutcome::Failure { reason: "fault injected".into() };
        }
        self.inner.probe(spec).await
    }
}

/// Removes its faults when dropped, including when a run is abandoned
struct FaultGuard {
    prober: Arc<FaultInjectingProber>,
    addresses: Vec<String>,
}

impl Drop for FaultGuard {
    fn drop(&mut self) {
        self.prober.clear(&self.addresses);
        tracing::info!(faults = self.addresses.len(), "Chaos faults removed");
    }
}

/// Collects transitions while a run is in progress
#[derive(Default)]
struct TransitionRecorder {
    seen: Mutex<Vec<HealthTransition>>,
}

impl HealthListener for TransitionRecorder {
    fn on_transition(&self, transition: &HealthTransition) {
        self.seen.lock().push(transition.clone());
    }
}

/// Chaos action
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChaosAction {
    FailTargets { target_ids: Vec<TargetId> },
    IsolateZone { zone_id: ZoneId },
}

/// Chaos experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosExperiment {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub actions: Vec<ChaosAction>,
    pub duration_ms: u64,
    /// Run probe cycles during the experiment instead of waiting for the monitor loop
    #[serde(default)]
    pub drive_probes: bool,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

fn default_probe_interval_ms() -> u64 {
    1_000
}

/// Chaos run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosRun {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub experiment_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ChaosStatus,
    pub injections: Vec<ChaosInjection>,
    pub transitions: Vec<HealthTransition>,
    pub availability_before_pct: f64,
    pub availability_after_pct: Option<f64>,
    pub findings: Vec<ChaosFinding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChaosStatus {
    Running,
    Completed,
    /// A critical finding was recorded
    Failed,
    /// Cancelled before the duration elapsed
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosInjection {
    pub action: ChaosAction,
    pub addresses: Vec<String>,
    pub injected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosFinding {
    pub description: String,
    pub severity: ChaosSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChaosSeverity {
    Info,
    Medium,
    High,
    Critical,
}

/// Chaos engine
pub struct ChaosEngine {
    prober: Arc<FaultInjectingProber>,
    zones: Arc<ZoneRegistry>,
    monitor: Arc<HealthMonitor>,
    balancers: Arc<LoadBalancerRegistry>,
    calculator: Arc<AvailabilityCalculator>,
    clock: Arc<dyn Clock>,
    experiments: RwLock<HashMap<Uuid, ChaosExperiment>>,
    history: RwLock<Vec<ChaosRun>>,
    active: RwLock<HashMap<Uuid, ChaosRun>>,
}

impl ChaosEngine {
    pub fn new(
        prober: Arc<FaultInjectingProber>,
        zones: Arc<ZoneRegistry>,
        monitor: Arc<HealthMonitor>,
        balancers: Arc<LoadBalancerRegistry>,
        calculator: Arc<AvailabilityCalculator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            prober,
            zones,
            monitor,
            balancers,
            calculator,
            clock,
            experiments: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Register experiment
    pub fn register(&self, experiment: ChaosExperiment) -> AvailabilityResult<Uuid> {
        if experiment.actions.is_empty() {
            return Err(AvailabilityError::InvalidConfig("experiment has no actions".into()));
        }
        let id = experiment.id;
        self.experiments.write().insert(id, experiment);
        Ok(id)
    }

    pub fn experiments(&self) -> Vec<ChaosExperiment> {
        self.experiments.read().values().cloned().collect()
    }

    pub fn active_runs(&self) -> Vec<ChaosRun> {
        self.active.read().values().cloned().collect()
    }

    /// Finished runs, oldest first
    pub fn history(&self) -> Vec<ChaosRun> {
        self.history.read().clone()
    }

    /// Run experiment until its duration elapses or `cancel` flips to true
    pub async fn run(&self, experiment_id: Uuid, mut cancel: watch::Receiver<bool>) -> AvailabilityResult<ChaosRun> {
        let experiment = self
            .experiments
            .read()
            .get(&experiment_id)
            .cloned()
            .ok_or_else(|| AvailabilityError::not_found("experiment", experiment_id))?;

        // Resolve everything before injecting anything
        let mut resolved = Vec::new();
        for action in &experiment.actions {
            resolved.push((action.clone(), self.resolve(action)?));
        }

        tracing::warn!(experiment = %experiment.name, "Starting chaos experiment");
        let before = self.calculator.calculate();
        let recorder = Arc::new(TransitionRecorder::default());
        let weak: Weak<dyn HealthListener> = Arc::downgrade(&recorder) as Weak<dyn HealthListener>;
        self.monitor.subscribe(weak);

        let mut run = ChaosRun {
            id: Uuid::new_v4(),
            experiment_id,
            experiment_name: experiment.name.clone(),
            started_at: self.clock.now(),
            completed_at: None,
            status: ChaosStatus::Running,
            injections: vec![],
            transitions: vec![],
            availability_before_pct: before.system_availability_pct,
            availability_after_pct: None,
            findings: vec![],
        };

        let mut guards = Vec::new();
        for (action, addresses) in resolved {
            self.prober.inject(&addresses);
            tracing::warn!(action = ?action, faults = addresses.len(), "Chaos fault injected");
            run.injections.push(ChaosInjection {
                action,
                addresses: addresses.clone(),
                injected_at: self.clock.now(),
            });
            guards.push(FaultGuard { prober: self.prober.clone(), addresses });
        }
        self.active.write().insert(run.id, run.clone());

        let aborted = self.hold(&experiment, &mut cancel).await;
        drop(guards);

        let after = self.calculator.calculate();
        run.transitions = recorder.seen.lock().clone();
        run.availability_after_pct = Some(after.system_availability_pct);
        run.findings = analyze(&before, &after);
        run.status = if aborted {
            ChaosStatus::Aborted
        } else if run.findings.iter().any(|f| f.severity == ChaosSeverity::Critical) {
            ChaosStatus::Failed
        } else {
            ChaosStatus::Completed
        };
        run.completed_at = Some(self.clock.now());

        self.active.write().remove(&run.id);
        self.history.write().push(run.clone());
        tracing::info!(
            experiment = %experiment.name, status = ?run.status,
            transitions = run.transitions.len(), findings = run.findings.len(),
            "Chaos experiment finished"
        );
        Ok(run)
    }

    /// Wait out the experiment; true when cancelled
    async fn hold(&self, experiment: &ChaosExperiment, cancel: &mut watch::Receiver<bool>) -> bool {
        let deadline = Instant::now() + Duration::from_millis(experiment.duration_ms);
        let mut tick = interval(Duration::from_millis(experiment.probe_interval_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cancellable = true;

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return false,
                _ = tick.tick(), if experiment.drive_probes => {
                    self.monitor.run_target_cycle().await;
                    self.monitor.run_zone_cycle().await;
                }
                changed = cancel.changed(), if cancellable => match changed {
                    Ok(()) if *cancel.borrow() => return true,
                    Ok(()) => {}
                    Err(_) => cancellable = false,
                },
            }
        }
    }

    /// Probe addresses an action faults
    fn resolve(&self, action: &ChaosAction) -> AvailabilityResult<Vec<String>> {
        let mut addresses = BTreeSet::new();
        match action {
            ChaosAction::FailTargets { target_ids } => {
                for id in target_ids {
                    let target = self
                        .balancers
                        .list()
                        .iter()
                        .find_map(|lb| lb.target(*id))
                        .ok_or_else(|| AvailabilityError::not_found("target", id))?;
                    addresses.insert(target.probe_spec().address());
                }
            }
            ChaosAction::IsolateZone { zone_id } => {
                let zone = self.zones.zone(*zone_id)?;
                if let Some(probe) = &zone.probe {
                    addresses.insert(probe.address());
                }
                for instance in self.zones.instances_in_zone(zone.id) {
                    addresses.insert(instance.probe_spec().address());
                }
                for lb in self.balancers.list() {
                    for target in lb.all_targets().into_iter().filter(|t| t.zone_id == zone.id) {
                        addresses.insert(target.probe_spec().address());
                    }
                }
            }
        }
        Ok(addresses.into_iter().collect())
    }
}

fn analyze(before: &SystemAvailabilityReport, after: &SystemAvailabilityReport) -> Vec<ChaosFinding> {
    let mut findings = Vec::new();

    for service in after.unavailable_services.iter().filter(|s| !before.unavailable_services.contains(s)) {
        findings.push(ChaosFinding {
            description: format!("service {} lost all healthy targets", service),
            severity: ChaosSeverity::Critical,
        });
    }
    for service in after
        .single_points_of_failure
        .iter()
        .filter(|s| !before.single_points_of_failure.contains(s))
    {
        findings.push(ChaosFinding {
            description: format!("service {} is left in a single zone", service),
            severity: ChaosSeverity::Medium,
        });
    }
    if before.meets_sla && !after.meets_sla {
        findings.push(ChaosFinding {
            description: format!(
                "system availability fell to {:.4}% against a {:.2}% target",
                after.system_availability_pct, after.sla_target_pct
            ),
            severity: ChaosSeverity::High,
        });
    }
    if after.redundancy_level < before.redundancy_level {
        findings.push(ChaosFinding {
            description: format!(
                "redundancy dropped from {} to {}",
                before.redundancy_level, after.redundancy_level
            ),
            severity: ChaosSeverity::Info,
        });
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{Algorithm, LoadBalancer, LoadBalancerSpec, TargetSpec};
    use crate::config::AvailabilityReportConfig;
    use crate::health::TargetStatus;
    use crate::ports::CheckType;
    use crate::testing::*;
    use crate::zone::{ServiceInstance, ZoneStatus};

    struct Fixture {
        h: Harness,
        chaos: Arc<FaultInjectingProber>,
        engine: ChaosEngine,
        lb: Arc<LoadBalancer>,
    }

    fn fixture() -> Fixture {
        let mut chaos = None;
        let h = harness_with(|scripted| {
            let p = Arc::new(FaultInjectingProber::new(scripted));
            chaos = Some(p.clone());
            p as Arc<dyn Prober>
        });
        let chaos = chaos.unwrap();
        let calculator = Arc::new(AvailabilityCalculator::new(
            AvailabilityReportConfig::default(),
            h.zones.clone(),
            h.balancers.clone(),
            h.clock.clone(),
        ));
        let engine = ChaosEngine::new(
            chaos.clone(),
            h.zones.clone(),
            h.monitor.clone(),
            h.balancers.clone(),
            calculator,
            h.clock.clone(),
        );
        let lb = h
            .balancers
            .create(LoadBalancerSpec { name: "dns-api".into(), algorithm: Algorithm::RoundRobin, listeners: vec![] })
            .unwrap();
        Fixture { h, chaos, engine, lb }
    }

    fn healthy(lb: &LoadBalancer, zone: ZoneId, host: &str) -> TargetId {
        lb.register_target(
            TargetSpec {
                endpoint: host.into(),
                port: 8053,
                weight: 1,
                zone,
                service: None,
                instance_id: None,
                check: CheckType::Tcp,
            },
            TargetStatus::Healthy,
        )
        .unwrap()
        .id
    }

    fn experiment(actions: Vec<ChaosAction>, duration_ms: u64) -> ChaosExperiment {
        ChaosExperiment {
            id: Uuid::new_v4(),
            name: "fail-one".into(),
            description: String::new(),
            actions,
            duration_ms,
            drive_probes: true,
            probe_interval_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_fail_targets_observes_transitions() {
        let f = fixture();
        let a = f.h.zone("use1-a", "us-east");
        let b = f.h.zone("use1-b", "us-east");
        let t1 = healthy(&f.lb, a.id, "10.1.0.1");
        let t2 = healthy(&f.lb, b.id, "10.2.0.1");

        let id = f
            .engine
            .register(experiment(vec![ChaosAction::FailTargets { target_ids: vec![t1] }], 150))
            .unwrap();
        let (_tx, rx) = watch::channel(false);
        let run = f.engine.run(id, rx).await.unwrap();

        assert_eq!(run.status, ChaosStatus::Completed);
        assert_eq!(run.injections[0].addresses, vec!["10.1.0.1:8053".to_string()]);
        assert!(run.transitions.iter().any(|t| t.target_id == t1 && t.to == TargetStatus::Unhealthy));
        assert!(run.transitions.iter().all(|t| t.target_id != t2));
        assert!(run.findings.iter().any(|f| f.severity == ChaosSeverity::Medium));
        assert!(f.chaos.active_faults().is_empty());
        assert_eq!(f.engine.history().len(), 1);
    }

    #[tokio::test]
    async fn test_isolate_zone() {
        let f = fixture();
        let a = f.h.zone("use1-a", "us-east");
        let b = f.h.zone("use1-b", "us-east");
        f.h.zones
            .add_instance(ServiceInstance::new(a.id, "dns-api", "1.0.0", "10.1.0.1", 8053))
            .unwrap();
        let t1 = healthy(&f.lb, a.id, "10.1.0.1");
        let t2 = healthy(&f.lb, a.id, "10.1.0.2");
        let t3 = healthy(&f.lb, b.id, "10.2.0.1");

        let id = f
            .engine
            .register(experiment(vec![ChaosAction::IsolateZone { zone_id: a.id }], 150))
            .unwrap();
        let (_tx, rx) = watch::channel(false);
        let run = f.engine.run(id, rx).await.unwrap();

        assert_eq!(run.injections[0].addresses.len(), 2);
        assert_eq!(f.h.monitor.target_status(t1), Some(TargetStatus::Unhealthy));
        assert_eq!(f.h.monitor.target_status(t2), Some(TargetStatus::Unhealthy));
        assert_eq!(f.h.monitor.target_status(t3), Some(TargetStatus::Healthy));
        assert_ne!(f.h.zones.zone_status(a.id).unwrap(), ZoneStatus::Active);
    }

    #[tokio::test]
    async fn test_cancel_removes_faults() {
        let f = fixture();
        let a = f.h.zone("use1-a", "us-east");
        let t1 = healthy(&f.lb, a.id, "10.1.0.1");
        let id = f
            .engine
            .register(experiment(vec![ChaosAction::FailTargets { target_ids: vec![t1] }], 10_000))
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert_eq!(f.chaos.active_faults(), vec!["10.1.0.1:8053".to_string()]);
            assert_eq!(f.engine.active_runs().len(), 1);
            tx.send(true).unwrap();
        };
        let (run, _) = tokio::join!(f.engine.run(id, rx), canceller);

        let run = run.unwrap();
        assert_eq!(run.status, ChaosStatus::Aborted);
        assert!(f.chaos.active_faults().is_empty());
        assert!(f.engine.active_runs().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_target_injects_nothing() {
        let f = fixture();
        let id = f
            .engine
            .register(experiment(vec![ChaosAction::FailTargets { target_ids: vec![Uuid::new_v4()] }], 10))
            .unwrap();
        let (_tx, rx) = watch::channel(false);

        let err = f.engine.run(id, rx).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        assert!(f.chaos.active_faults().is_empty());
        assert!(f.engine.history().is_empty());
    }
}
