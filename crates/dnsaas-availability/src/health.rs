//! Health Monitor
//!
//! Probes load-balancer targets and zone instances on fixed intervals and
//! publishes target health transitions. Targets flip `unhealthy -> healthy`
//! after `healthy_threshold` consecutive successes and `healthy -> unhealthy`
//! after `unhealthy_threshold` consecutive failures.

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};

use dnsaas_common::clock::to_chrono;
use dnsaas_common::{AvailabilityError, AvailabilityResult, Clock, InstanceId, TargetId, ZoneId};

use crate::config::HealthConfig;
use crate::metrics::MetricSnapshot;
use crate::ports::{AlertSeverity, MetricsProvider, Notifier, OperatorAlert, ProbeOutcome, ProbeSpec, Prober};
use crate::zone::{InstanceStatus, ZoneRegistry, ZoneStatus};

/// Target health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Healthy,
    Unhealthy,
    Draining,
    Unused,
}

/// Per-target health record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetHealth {
    pub target_id: TargetId,
    pub probe: ProbeSpec,
    pub status: TargetStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_probe: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl TargetHealth {
    pub fn new(target_id: TargetId, probe: ProbeSpec, status: TargetStatus) -> Self {
        Self {
            target_id,
            probe,
            status,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_probe: None,
            last_latency_ms: None,
            last_error: None,
        }
    }

    /// Count one observation; returns the new status when it flips
    pub fn observe(&mut self, success: bool, healthy_threshold: u32, unhealthy_threshold: u32) -> Option<TargetStatus> {
        if success {
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.consecutive_failures = 0;
            if self.status == TargetStatus::Unhealthy && self.consecutive_successes >= healthy_threshold {
                self.status = TargetStatus::Healthy;
                return Some(TargetStatus::Healthy);
            }
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.consecutive_successes = 0;
            if self.status == TargetStatus::Healthy && self.consecutive_failures >= unhealthy_threshold {
                self.status = TargetStatus::Unhealthy;
                return Some(TargetStatus::Unhealthy);
            }
        }
        None
    }
}

/// Published target status change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthTransition {
    pub target_id: TargetId,
    pub from: TargetStatus,
    pub to: TargetStatus,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Receives target transitions synchronously
pub trait HealthListener: Send + Sync {
    fn on_transition(&self, transition: &HealthTransition);
}

/// One observation feeding a zone evaluation
#[derive(Debug, Clone)]
pub struct ZoneObservation {
    /// `None` for the zone's own reachability probe
    pub instance_id: Option<InstanceId>,
    pub weight: u32,
    pub success: bool,
}

/// Health monitor
pub struct HealthMonitor {
    config: HealthConfig,
    zones: Arc<ZoneRegistry>,
    prober: Arc<dyn Prober>,
    metrics: Arc<dyn MetricsProvider>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    targets: DashMap<TargetId, TargetHealth>,
    listeners: RwLock<Vec<Weak<dyn HealthListener>>>,
    history: RwLock<VecDeque<HealthTransition>>,
    /// Recent per-cycle zone availability samples (0.0 - 1.0)
    zone_windows: DashMap<ZoneId, VecDeque<f64>>,
    offline_since: DashMap<ZoneId, DateTime<Utc>>,
    offline_alerted: DashSet<ZoneId>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        zones: Arc<ZoneRegistry>,
        prober: Arc<dyn Prober>,
        metrics: Arc<dyn MetricsProvider>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            zones,
            prober,
            metrics,
            notifier,
            clock,
            targets: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::new()),
            zone_windows: DashMap::new(),
            offline_since: DashMap::new(),
            offline_alerted: DashSet::new(),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Register a transition listener (held weakly)
    pub fn subscribe(&self, listener: Weak<dyn HealthListener>) {
        self.listeners.write().push(listener);
    }

    /// Start watching a target
    pub fn watch_target(&self, target_id: TargetId, probe: ProbeSpec, initial: TargetStatus) -> TargetStatus {
        let entry = self
            .targets
            .entry(target_id)
            .or_insert_with(|| TargetHealth::new(target_id, probe, initial));
        entry.status
    }

    pub fn unwatch_target(&self, target_id: TargetId) {
        self.targets.remove(&target_id);
    }

    pub fn target_status(&self, target_id: TargetId) -> Option<TargetStatus> {
        self.targets.get(&target_id).map(|t| t.status)
    }

    pub fn target_health(&self, target_id: TargetId) -> Option<TargetHealth> {
        self.targets.get(&target_id).map(|t| t.clone())
    }

    /// Feed one probe outcome into the hysteresis counters
    pub fn record_probe_result(
        &self,
        target_id: TargetId,
        outcome: ProbeOutcome,
    ) -> AvailabilityResult<Option<HealthTransition>> {
        let now = self.clock.now();
        let transition = {
            let mut target = self
                .targets
                .get_mut(&target_id)
                .ok_or_else(|| AvailabilityError::not_found("target", target_id))?;
            target.last_probe = Some(now);

            let (success, reason) = match &outcome {
                ProbeOutcome::Success { latency_ms } => {
                    target.last_latency_ms = Some(*latency_ms);
                    target.last_error = None;
                    (true, "health check passed".to_string())
                }
                ProbeOutcome::Failure { reason } => {
                    target.last_error = Some(reason.clone());
                    (false, reason.clone())
                }
                ProbeOutcome::Timeout => {
                    let err = AvailabilityError::ProbeTimeout { target: target.probe.address() };
                    tracing::debug!(target_id = %target_id, "{}", err);
                    target.last_error = Some(err.to_string());
                    (false, err.to_string())
                }
            };

            let from = target.status;
            target
                .observe(success, self.config.healthy_threshold, self.config.unhealthy_threshold)
                .map(|to| HealthTransition { target_id, from, to, at: now, reason })
        };

        if let Some(t) = &transition {
            self.publish(t.clone());
        }
        Ok(transition)
    }

    /// Stop new routes to a target; existing connections continue
    pub fn begin_drain(&self, target_id: TargetId, reason: &str) -> AvailabilityResult<Option<HealthTransition>> {
        self.override_status(target_id, TargetStatus::Draining, reason)
    }

    /// Retire a drained target
    pub fn mark_unused(&self, target_id: TargetId, reason: &str) -> AvailabilityResult<Option<HealthTransition>> {
        self.override_status(target_id, TargetStatus::Unused, reason)
    }

    /// Set a target's status directly, publishing the change
    pub fn override_status(
        &self,
        target_id: TargetId,
        status: TargetStatus,
        reason: &str,
    ) -> AvailabilityResult<Option<HealthTransition>> {
        let now = self.clock.now();
        let transition = {
            let mut target = self
                .targets
                .get_mut(&target_id)
                .ok_or_else(|| AvailabilityError::not_found("target", target_id))?;
            if target.status == status {
                None
            } else {
                let from = target.status;
                target.status = status;
                Some(HealthTransition { target_id, from, to: status, at: now, reason: reason.into() })
            }
        };
        if let Some(t) = &transition {
            self.publish(t.clone());
        }
        Ok(transition)
    }

    fn publish(&self, transition: HealthTransition) {
        match transition.to {
            TargetStatus::Unhealthy => tracing::warn!(
                target_id = %transition.target_id, from = ?transition.from, "Target unhealthy: {}", transition.reason
            ),
            _ => tracing::info!(
                target_id = %transition.target_id, from = ?transition.from, to = ?transition.to, "Target transition"
            ),
        }

        let listeners: Vec<_> = {
            let mut listeners = self.listeners.write();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(|l| l.upgrade()).collect()
        };
        for listener in listeners {
            listener.on_transition(&transition);
        }

        let mut history = self.history.write();
        history.push_back(transition);
        while history.len() > self.config.transition_history {
            history.pop_front();
        }
    }

    /// Recent transitions, oldest first
    pub fn transitions(&self) -> Vec<HealthTransition> {
        self.history.read().iter().cloned().collect()
    }

    /// Probe the given targets now, one task per target
    pub async fn probe_targets(&self, ids: &[TargetId]) -> Vec<(TargetId, ProbeOutcome)> {
        let specs: Vec<_> = ids
            .iter()
            .filter_map(|id| self.targets.get(id).map(|t| (*id, t.probe.clone())))
            .collect();

        let mut tasks = JoinSet::new();
        for (id, spec) in specs {
            let prober = self.prober.clone();
            let timeout = self.config.probe_timeout();
            tasks.spawn(async move {
                let outcome = match tokio::time::timeout(timeout, prober.probe(&spec)).await {
                    Ok(outcome) => outcome,
                    Err(_) => ProbeOutcome::Timeout,
                };
                (id, outcome)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, outcome)) => {
                    // Target may have been unwatched mid-probe
                    let _ = self.record_probe_result(id, outcome.clone());
                    results.push((id, outcome));
                }
                Err(e) => tracing::error!("Probe task panicked: {}", e),
            }
        }
        results
    }

    /// One load-balancer target probe cycle
    pub async fn run_target_cycle(&self) -> usize {
        let ids: Vec<_> = self
            .targets
            .iter()
            .filter(|t| t.status != TargetStatus::Unused)
            .map(|t| t.target_id)
            .collect();
        self.probe_targets(&ids).await.len()
    }

    /// One zone probe cycle; returns each zone's resulting status
    pub async fn run_zone_cycle(&self) -> HashMap<ZoneId, ZoneStatus> {
        let mut tasks = JoinSet::new();
        let mut pending: HashMap<ZoneId, Vec<ZoneObservation>> = HashMap::new();

        for zone in self.zones.zones() {
            pending.entry(zone.id).or_default();
            if zone.status == ZoneStatus::Maintenance {
                continue;
            }

            let instances = self.zones.instances_in_zone(zone.id);
            let mut probes: Vec<(Option<InstanceId>, u32, ProbeSpec)> = instances
                .iter()
                .map(|i| (Some(i.id), i.weight(), i.probe_spec()))
                .collect();
            if probes.is_empty() {
                if let Some(spec) = zone.probe.clone() {
                    probes.push((None, 1, spec));
                }
            }

            for (instance_id, weight, spec) in probes {
                let prober = self.prober.clone();
                let timeout = self.config.probe_timeout();
                let zone_id = zone.id;
                tasks.spawn(async move {
                    let outcome = tokio::time::timeout(timeout, prober.probe(&spec))
                        .await
                        .unwrap_or(ProbeOutcome::Timeout);
                    (zone_id, ZoneObservation { instance_id, weight, success: outcome.is_success() })
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((zone_id, observation)) => pending.entry(zone_id).or_default().push(observation),
                Err(e) => tracing::error!("Zone probe task panicked: {}", e),
            }
        }

        let mut statuses = HashMap::new();
        for (zone_id, observations) in pending {
            match self.record_zone_probe(zone_id, &observations).await {
                Ok(status) => {
                    statuses.insert(zone_id, status);
                }
                Err(e) => tracing::warn!(zone = %zone_id, "Zone evaluation failed: {}", e),
            }
        }
        statuses
    }

    /// Apply one cycle of zone observations
    pub async fn record_zone_probe(
        &self,
        zone_id: ZoneId,
        observations: &[ZoneObservation],
    ) -> AvailabilityResult<ZoneStatus> {
        let zone = self.zones.zone(zone_id)?;
        if zone.status == ZoneStatus::Maintenance {
            return Ok(zone.status);
        }

        for obs in observations {
            if let Some(instance_id) = obs.instance_id {
                self.zones.update_instance(instance_id, &mut |i| {
                    if obs.success {
                        if matches!(i.status, InstanceStatus::Starting | InstanceStatus::Failed) {
                            i.status = InstanceStatus::Running;
                        }
                        i.replicas.ready = i.replicas.current;
                    } else {
                        if i.status == InstanceStatus::Running {
                            i.status = InstanceStatus::Failed;
                        }
                        i.replicas.ready = 0;
                    }
                });
            }
        }

        let total: u32 = observations.iter().map(|o| o.weight).sum();
        let failed: u32 = observations.iter().filter(|o| !o.success).map(|o| o.weight).sum();
        let ratio = if total == 0 { 0.0 } else { failed as f64 / total as f64 };
        let reachable = observations.is_empty() || observations.iter().any(|o| o.success);

        let availability_pct = {
            let mut window = self.zone_windows.entry(zone_id).or_default();
            window.push_back(if reachable { 1.0 - ratio } else { 0.0 });
            while window.len() > self.config.availability_window.max(1) {
                window.pop_front();
            }
            window.iter().sum::<f64>() / window.len() as f64 * 100.0
        };

        let zone = self.zones.record_health_check(zone_id, availability_pct, reachable)?;
        let now = self.clock.now();
        let over_threshold = ratio > self.config.zone_failure_ratio;
        let grace_elapsed = zone
            .unreachable_since
            .map(|since| now - since >= to_chrono(self.config.offline_grace()))
            .unwrap_or(false);

        let next = match zone.status {
            ZoneStatus::Active if !reachable || over_threshold => ZoneStatus::Degraded,
            ZoneStatus::Degraded if !reachable && grace_elapsed => ZoneStatus::Offline,
            ZoneStatus::Degraded | ZoneStatus::Offline if reachable && !over_threshold => ZoneStatus::Active,
            ZoneStatus::Offline if reachable => ZoneStatus::Degraded,
            status => status,
        };

        if next != zone.status {
            self.zones.set_status(zone_id, next)?;
            match next {
                ZoneStatus::Active => tracing::info!(zone = %zone.name, from = ?zone.status, "Zone recovered"),
                _ => tracing::warn!(
                    zone = %zone.name, from = ?zone.status, to = ?next,
                    failure_ratio = ratio, reachable, "Zone status changed"
                ),
            }
        }

        self.check_offline_alert(zone_id, &zone.name, next, now).await;
        Ok(next)
    }

    async fn check_offline_alert(&self, zone_id: ZoneId, name: &str, status: ZoneStatus, now: DateTime<Utc>) {
        if status != ZoneStatus::Offline {
            self.offline_since.remove(&zone_id);
            self.offline_alerted.remove(&zone_id);
            return;
        }

        let since = *self.offline_since.entry(zone_id).or_insert(now);
        if now - since >= to_chrono(self.config.offline_alert_after()) && self.offline_alerted.insert(zone_id) {
            self.notifier
                .notify(OperatorAlert {
                    severity: AlertSeverity::Critical,
                    source: format!("zone/{}", name),
                    message: format!("zone {} offline since {}", name, since.to_rfc3339()),
                    raised_at: now,
                })
                .await;
        }
    }

    /// Sample and average metrics for a set of instances
    ///
    /// Each instance's stored snapshot is refreshed. Provider failures are
    /// logged and skipped; `None` when no sample succeeded.
    pub async fn aggregate_metrics(&self, instance_ids: &[InstanceId]) -> Option<MetricSnapshot> {
        let mut tasks = JoinSet::new();
        for id in instance_ids {
            let instance = match self.zones.instance(*id) {
                Ok(i) => i,
                Err(_) => continue,
            };
            let provider = self.metrics.clone();
            tasks.spawn(async move { (instance.id, provider.sample(&instance).await) });
        }

        let mut samples = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(snapshot))) => {
                    self.zones.update_instance(id, &mut |i| i.metrics = snapshot);
                    samples.push(snapshot);
                }
                Ok((id, Err(e))) => tracing::warn!(instance = %id, "Metric sample failed: {}", e),
                Err(e) => tracing::error!("Metric task panicked: {}", e),
            }
        }
        MetricSnapshot::mean(&samples)
    }

    /// Probe loop until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut zone_tick = interval(self.config.zone_interval());
        let mut target_tick = interval(self.config.target_interval());
        zone_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        target_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            zone_interval = ?self.config.zone_interval(),
            target_interval = ?self.config.target_interval(),
            "Health monitor started"
        );

        loop {
            tokio::select! {
                _ = zone_tick.tick() => {
                    self.run_zone_cycle().await;
                }
                _ = target_tick.tick() => {
                    self.run_target_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use crate::zone::ServiceInstance;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::time::Duration;
    use uuid::Uuid;

    struct Recorder(Mutex<Vec<HealthTransition>>);

    impl HealthListener for Recorder {
        fn on_transition(&self, transition: &HealthTransition) {
            self.0.lock().push(transition.clone());
        }
    }

    #[test]
    fn test_hysteresis_exact_thresholds() {
        let h = harness();
        let id = Uuid::new_v4();
        h.monitor.watch_target(id, ProbeSpec::tcp("10.0.0.1", 53), TargetStatus::Unhealthy);

        assert!(h.monitor.record_probe_result(id, ok()).unwrap().is_none());
        let t = h.monitor.record_probe_result(id, ok()).unwrap().unwrap();
        assert_eq!((t.from, t.to), (TargetStatus::Unhealthy, TargetStatus::Healthy));

        assert!(h.monitor.record_probe_result(id, fail()).unwrap().is_none());
        assert!(h.monitor.record_probe_result(id, ProbeOutcome::Timeout).unwrap().is_none());
        let t = h.monitor.record_probe_result(id, fail()).unwrap().unwrap();
        assert_eq!(t.to, TargetStatus::Unhealthy);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let h = harness();
        let id = Uuid::new_v4();
        h.monitor.watch_target(id, ProbeSpec::tcp("10.0.0.1", 53), TargetStatus::Healthy);

        for _ in 0..2 {
            h.monitor.record_probe_result(id, fail()).unwrap();
        }
        h.monitor.record_probe_result(id, ok()).unwrap();
        for _ in 0..2 {
            h.monitor.record_probe_result(id, fail()).unwrap();
        }
        assert_eq!(h.monitor.target_status(id), Some(TargetStatus::Healthy));
    }

    #[test]
    fn test_listeners_receive_transitions() {
        let h = harness();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let weak: Weak<dyn HealthListener> = Arc::downgrade(&(recorder.clone() as Arc<dyn HealthListener>));
        h.monitor.subscribe(weak);

        let id = Uuid::new_v4();
        h.monitor.watch_target(id, ProbeSpec::tcp("10.0.0.1", 53), TargetStatus::Healthy);
        h.monitor.begin_drain(id, "deploy").unwrap();
        // Draining targets keep their status through failures
        for _ in 0..5 {
            h.monitor.record_probe_result(id, fail()).unwrap();
        }

        let seen = recorder.0.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].to, TargetStatus::Draining);
        assert_eq!(h.monitor.transitions().len(), 1);
    }

    #[tokio::test]
    async fn test_probe_cycle_applies_timeout() {
        let h = harness();
        let slow = Uuid::new_v4();
        h.prober.hang("10.0.0.9:53");
        h.monitor.watch_target(slow, ProbeSpec::tcp("10.0.0.9", 53), TargetStatus::Healthy);

        let results = h.monitor.probe_targets(&[slow]).await;
        assert_eq!(results, vec![(slow, ProbeOutcome::Timeout)]);
        let health = h.monitor.target_health(slow).unwrap();
        assert_eq!(health.consecutive_failures, 1);
        assert_eq!(health.status, TargetStatus::Healthy);
    }

    #[tokio::test]
    async fn test_zone_degrades_before_offline() {
        let h = harness();
        let zone = h.zone("use1-a", "us-east");
        let instance = ServiceInstance::new(zone.id, "resolver", "1.0.0", "10.0.1.1", 53);
        h.zones.add_instance(instance).unwrap();
        h.prober.fail("10.0.1.1:53");

        let statuses = h.monitor.run_zone_cycle().await;
        assert_eq!(statuses[&zone.id], ZoneStatus::Degraded);

        // Still inside the grace period
        h.clock.advance(Duration::from_secs(60));
        h.monitor.run_zone_cycle().await;
        assert_eq!(h.zones.zone_status(zone.id).unwrap(), ZoneStatus::Degraded);

        h.clock.advance(Duration::from_secs(300));
        h.monitor.run_zone_cycle().await;
        assert_eq!(h.zones.zone_status(zone.id).unwrap(), ZoneStatus::Offline);

        h.prober.heal("10.0.1.1:53");
        h.monitor.run_zone_cycle().await;
        assert_eq!(h.zones.zone_status(zone.id).unwrap(), ZoneStatus::Active);
    }

    #[tokio::test]
    async fn test_weighted_failure_ratio() {
        let h = harness();
        let zone = h.zone("use1-b", "us-east");
        for n in 0..5 {
            let mut instance = ServiceInstance::new(zone.id, "resolver", "1.0.0", format!("10.0.2.{}", n), 53);
            instance.replicas.desired = if n == 0 { 1 } else { 2 };
            h.zones.add_instance(instance).unwrap();
        }
        // 1 of 9 weight units failing stays under 20%
        h.prober.fail("10.0.2.0:53");
        h.monitor.run_zone_cycle().await;
        assert_eq!(h.zones.zone_status(zone.id).unwrap(), ZoneStatus::Active);

        // 3 of 9 goes over
        h.prober.fail("10.0.2.1:53");
        h.monitor.run_zone_cycle().await;
        let zone = h.zones.zone(zone.id).unwrap();
        assert_eq!(zone.status, ZoneStatus::Degraded);
        assert!(zone.availability_pct < 100.0);
    }

    #[tokio::test]
    async fn test_offline_alert_raised_once() {
        let h = harness();
        let zone = h.zone("aps1-a", "ap-southeast");
        h.zones.mark_offline(zone.id, "maintenance window overrun").unwrap();
        let obs = [ZoneObservation { instance_id: None, weight: 1, success: false }];

        h.monitor.record_zone_probe(zone.id, &obs).await.unwrap();
        h.clock.advance(Duration::from_secs(901));
        h.monitor.record_zone_probe(zone.id, &obs).await.unwrap();
        h.monitor.record_zone_probe(zone.id, &obs).await.unwrap();

        assert_eq!(h.notifier.alerts().len(), 1);
        assert_eq!(h.notifier.alerts()[0].severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn test_aggregate_metrics() {
        let h = harness();
        let zone = h.zone("use1-c", "us-east");
        let a = h.zones.add_instance(ServiceInstance::new(zone.id, "api", "1", "10.0.3.1", 80)).unwrap();
        let b = h.zones.add_instance(ServiceInstance::new(zone.id, "api", "1", "10.0.3.2", 80)).unwrap();
        h.metrics.set(a.id, MetricSnapshot { cpu_utilization: 70.0, ..Default::default() });
        h.metrics.set(b.id, MetricSnapshot { cpu_utilization: 90.0, ..Default::default() });

        let mean = h.monitor.aggregate_metrics(&[a.id, b.id]).await.unwrap();
        assert_eq!(mean.cpu_utilization, 80.0);
        assert_eq!(h.zones.instance(a.id).unwrap().metrics.cpu_utilization, 70.0);
    }

    proptest! {
        #[test]
        fn prop_flip_requires_exact_streak(
            n in 1u32..6,
            m in 1u32..6,
            outcomes in proptest::collection::vec(any::<bool>(), 0..60),
        ) {
            let mut health = TargetHealth::new(Uuid::new_v4(), ProbeSpec::tcp("h", 1), TargetStatus::Unhealthy);
            let mut streak_ok = 0u32;
            let mut streak_fail = 0u32;
            for success in outcomes {
                let before = health.status;
                if success { streak_ok += 1; streak_fail = 0; } else { streak_fail += 1; streak_ok = 0; }
                if let Some(to) = health.observe(success, n, m) {
                    match to {
                        TargetStatus::Healthy => {
                            prop_assert_eq!(before, TargetStatus::Unhealthy);
                            prop_assert_eq!(streak_ok, n);
                        }
                        TargetStatus::Unhealthy => {
                            prop_assert_eq!(before, TargetStatus::Healthy);
                            prop_assert_eq!(streak_fail, m);
                        }
                        _ => prop_assert!(false),
                    }
                }
            }
        }
    }
}
