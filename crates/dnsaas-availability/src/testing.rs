//! Scripted collaborators for unit tests

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dnsaas_common::{AvailabilityError, AvailabilityResult, InstanceId, ManualClock};

use crate::balancer::LoadBalancerRegistry;
use crate::config::{BalancerConfig, HealthConfig};
use crate::health::HealthMonitor;
use crate::metrics::MetricSnapshot;
use crate::ports::{
    LaunchRequest, MetricsProvider, Notifier, OperatorAlert, ProbeOutcome, ProbeSpec, Prober,
    ProvisioningProvider,
};
use crate::zone::{AvailabilityZone, CapacitySpec, ServiceInstance, ZoneRegistry, ZoneSpec};

pub fn ok() -> ProbeOutcome {
    ProbeOutcome::Success { latency_ms: 3 }
}

pub fn fail() -> ProbeOutcome {
    ProbeOutcome::Failure { reason: "connection refused".into() }
}

#[derive(Debug, Clone, Copy)]
enum Script {
    Fail,
    Hang,
}

/// Succeeds unless told otherwise per `host:port`
#[derive(Default)]
pub struct ScriptedProber {
    scripts: Mutex<HashMap<String, Script>>,
}

impl ScriptedProber {
    pub fn fail(&self, address: &str) {
        self.scripts.lock().insert(address.to_string(), Script::Fail);
    }

    pub fn hang(&self, address: &str) {
        self.scripts.lock().insert(address.to_string(), Script::Hang);
    }

    pub fn heal(&self, address: &str) {
        self.scripts.lock().remove(address);
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, spec: &ProbeSpec) -> ProbeOutcome {
        let script = self.scripts.lock().get(&spec.address()).copied();
        match script {
            None => ok(),
            Some(Script::Fail) => fail(),
            Some(Script::Hang) => {
                tokio::time::sleep(Duration::from_secs(10)).await;
                ok()
            }
        }
    }
}

/// Metric samples by instance, then by version, else zeros
#[derive(Default)]
pub struct FakeMetrics {
    by_instance: DashMap<InstanceId, MetricSnapshot>,
    by_version: DashMap<String, MetricSnapshot>,
}

impl FakeMetrics {
    pub fn set(&self, id: InstanceId, snapshot: MetricSnapshot) {
        self.by_instance.insert(id, snapshot);
    }

    pub fn set_version(&self, version: &str, snapshot: MetricSnapshot) {
        self.by_version.insert(version.to_string(), snapshot);
    }
}

#[async_trait]
impl MetricsProvider for FakeMetrics {
    async fn sample(&self, instance: &ServiceInstance) -> AvailabilityResult<MetricSnapshot> {
        if let Some(s) = self.by_instance.get(&instance.id) {
            return Ok(*s);
        }
        Ok(self.by_version.get(&instance.version).map(|s| *s).unwrap_or_default())
    }
}

/// Calls left before a fake starts failing; `None` never fails
#[derive(Default)]
struct FailAfter(Mutex<Option<u32>>);

impl FailAfter {
    fn set(&self, calls: u32) {
        *self.0.lock() = Some(calls);
    }

    fn exhausted(&self) -> bool {
        let mut left = self.0.lock();
        match *left {
            Some(0) => true,
            Some(n) => {
                *left = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

/// Hands out instances on 10.200.x.y and remembers what it did
#[derive(Default)]
pub struct FakeProvisioner {
    next_host: AtomicU32,
    launch_budget: FailAfter,
    terminate_budget: FailAfter,
    launched: Mutex<Vec<ServiceInstance>>,
    terminated: Mutex<Vec<InstanceId>>,
}

impl FakeProvisioner {
    /// Succeed `launches` more times, then fail every launch
    pub fn fail_launches_after(&self, launches: u32) {
        self.launch_budget.set(launches);
    }

    pub fn fail_terminations_after(&self, terminations: u32) {
        self.terminate_budget.set(terminations);
    }

    pub fn launched(&self) -> Vec<ServiceInstance> {
        self.launched.lock().clone()
    }

    pub fn terminated(&self) -> Vec<InstanceId> {
        self.terminated.lock().clone()
    }
}

#[async_trait]
impl ProvisioningProvider for FakeProvisioner {
    async fn launch(&self, request: &LaunchRequest) -> AvailabilityResult<ServiceInstance> {
        if self.launch_budget.exhausted() {
            return Err(AvailabilityError::Provider("launch quota exceeded".into()));
        }
        let n = self.next_host.fetch_add(1, Ordering::SeqCst) + 1;
        let instance = ServiceInstance::new(
            request.zone_id,
            request.service_type.clone(),
            request.version.clone(),
            format!("10.200.{}.{}", n / 256, n % 256),
            8053,
        );
        self.launched.lock().push(instance.clone());
        Ok(instance)
    }

    async fn terminate(&self, instance: &ServiceInstance) -> AvailabilityResult<()> {
        if self.terminate_budget.exhausted() {
            return Err(AvailabilityError::Provider(format!("instance {} is locked", instance.id)));
        }
        self.terminated.lock().push(instance.id);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<OperatorAlert>>,
}

impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<OperatorAlert> {
        self.alerts.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, alert: OperatorAlert) {
        self.alerts.lock().push(alert);
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub zones: Arc<ZoneRegistry>,
    pub prober: Arc<ScriptedProber>,
    pub metrics: Arc<FakeMetrics>,
    pub provisioner: Arc<FakeProvisioner>,
    pub notifier: Arc<RecordingNotifier>,
    pub monitor: Arc<HealthMonitor>,
    pub balancers: Arc<LoadBalancerRegistry>,
}

impl Harness {
    /// Register an active zone with room for plenty of instances
    pub fn zone(&self, name: &str, region: &str) -> AvailabilityZone {
        self.zones
            .register_zone(ZoneSpec {
                name: name.into(),
                region: region.into(),
                provider: "test".into(),
                capacity: CapacitySpec {
                    cpu_cores: 64.0,
                    memory_gb: 256.0,
                    storage_gb: 2048.0,
                    network_gbps: 40.0,
                },
                probe: None,
            })
            .unwrap()
    }
}

pub fn health_config() -> HealthConfig {
    HealthConfig { probe_timeout_ms: 50, ..Default::default() }
}

pub fn harness() -> Harness {
    harness_with(|prober| prober as Arc<dyn Prober>)
}

/// Harness whose monitor probes through `wrap(scripted prober)`
pub fn harness_with(wrap: impl FnOnce(Arc<ScriptedProber>) -> Arc<dyn Prober>) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let zones = Arc::new(ZoneRegistry::new(clock.clone()));
    let prober = Arc::new(ScriptedProber::default());
    let metrics = Arc::new(FakeMetrics::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let monitor = Arc::new(HealthMonitor::new(
        health_config(),
        zones.clone(),
        wrap(prober.clone()),
        metrics.clone(),
        notifier.clone(),
        clock.clone(),
    ));
    let balancers = Arc::new(LoadBalancerRegistry::new(
        BalancerConfig::default(),
        zones.clone(),
        monitor.clone(),
        clock.clone(),
    ));
    Harness {
        clock,
        zones,
        prober,
        metrics,
        provisioner: Arc::new(FakeProvisioner::default()),
        notifier,
        monitor,
        balancers,
    }
}
