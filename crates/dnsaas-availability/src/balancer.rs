//! Health-aware Load Balancer
//!
//! Each load balancer keeps, per service, an ordered target list inside an
//! atomically swapped snapshot. `route` only ever reads the snapshot; every
//! mutation clones the affected pool and stores a new table.
//!
//! A target receives new requests only while its status is `Healthy` and its
//! weight is non-zero. Deployments shift traffic by rewriting weights in one
//! swap, and status changes arrive from the health monitor.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use uuid::Uuid;

use dnsaas_common::clock::to_chrono;
use dnsaas_common::{
    AvailabilityError, AvailabilityResult, Clock, InstanceId, LoadBalancerId, TargetId, ZoneId,
};

use crate::config::{BalancerConfig, RegionDistance};
use crate::health::{HealthListener, HealthMonitor, HealthTransition, TargetStatus};
use crate::ports::{CheckType, ProbeSpec};
use crate::zone::ZoneRegistry;

/// Target selection algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    IpHash,
    Geographic,
}

/// Listener protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerProtocol {
    Udp,
    Tcp,
    Http,
    Https,
}

/// Front-end listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listener {
    pub protocol: ListenerProtocol,
    pub port: u16,
    /// Service the listener forwards to; defaults to the balancer name
    #[serde(default)]
    pub service: Option<String>,
}

/// Load balancer creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerSpec {
    pub name: String,
    pub algorithm: Algorithm,
    #[serde(default)]
    pub listeners: Vec<Listener>,
}

/// Target registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    pub endpoint: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    pub zone: ZoneId,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
    #[serde(default)]
    pub check: CheckType,
}

fn default_weight() -> u32 {
    1
}

/// Routable endpoint behind a load balancer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerTarget {
    pub id: TargetId,
    pub service: String,
    pub instance_id: Option<InstanceId>,
    pub endpoint: String,
    pub port: u16,
    pub weight: u32,
    /// Non-owning zone reference
    pub zone_id: ZoneId,
    /// Zone region at registration time
    pub region: String,
    pub check: CheckType,
    pub status: TargetStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl LoadBalancerTarget {
    pub fn probe_spec(&self) -> ProbeSpec {
        ProbeSpec {
            host: self.endpoint.clone(),
            port: self.port,
            check: self.check.clone(),
        }
    }

    fn routable(&self) -> bool {
        self.status == TargetStatus::Healthy && self.weight > 0
    }
}

/// Per-request routing input
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub client_ip: Option<String>,
    pub client_region: Option<String>,
}

impl RequestContext {
    pub fn from_ip(ip: impl Into<String>) -> Self {
        Self { client_ip: Some(ip.into()), client_region: None }
    }

    pub fn from_region(region: impl Into<String>) -> Self {
        Self { client_ip: None, client_region: Some(region.into()) }
    }
}

/// Exact target set of one service, captured for rollback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSnapshot {
    pub load_balancer_id: LoadBalancerId,
    pub service: String,
    pub targets: Vec<LoadBalancerTarget>,
}

/// A routed request; releases its connection slot on drop
#[derive(Debug)]
pub struct TargetLease {
    target: LoadBalancerTarget,
    in_flight: Arc<AtomicU64>,
}

impl TargetLease {
    pub fn target(&self) -> &LoadBalancerTarget {
        &self.target
    }
}

impl Drop for TargetLease {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
struct Slot {
    target: LoadBalancerTarget,
    in_flight: Arc<AtomicU64>,
}

impl Slot {
    fn with_target(&self, target: LoadBalancerTarget) -> Arc<Slot> {
        Arc::new(Slot { target, in_flight: self.in_flight.clone() })
    }
}

#[derive(Debug, Clone, Default)]
struct Pool {
    targets: Vec<Arc<Slot>>,
    cursor: Arc<AtomicUsize>,
    /// Smooth weighted round-robin running weights
    current_weights: Arc<Mutex<HashMap<TargetId, i64>>>,
}

#[derive(Debug, Clone, Default)]
struct TargetTable {
    pools: HashMap<String, Pool>,
}

impl TargetTable {
    fn find(&self, id: TargetId) -> Option<(&str, usize)> {
        self.pools.iter().find_map(|(service, pool)| {
            pool.targets
                .iter()
                .position(|s| s.target.id == id)
                .map(|idx| (service.as_str(), idx))
        })
    }
}

/// Static region-distance table
#[derive(Debug, Clone)]
pub struct RegionDistances {
    distances: HashMap<(String, String), u32>,
}

const UNKNOWN_DISTANCE: u32 = u32::MAX;

impl RegionDistances {
    pub fn builtin() -> Self {
        let table: &[(&str, &str, u32)] = &[
            ("us-east", "us-west", 60),
            ("us-east", "sa-east", 110),
            ("us-east", "eu-west", 75),
            ("us-east", "eu-central", 90),
            ("us-east", "ap-northeast", 160),
            ("us-east", "ap-southeast", 210),
            ("us-west", "sa-east", 170),
            ("us-west", "eu-west", 135),
            ("us-west", "eu-central", 150),
            ("us-west", "ap-northeast", 100),
            ("us-west", "ap-southeast", 160),
            ("eu-west", "eu-central", 20),
            ("eu-west", "sa-east", 185),
            ("eu-west", "ap-northeast", 220),
            ("eu-west", "ap-southeast", 160),
            ("eu-central", "sa-east", 200),
            ("eu-central", "ap-northeast", 230),
            ("eu-central", "ap-southeast", 150),
            ("ap-northeast", "ap-southeast", 70),
            ("ap-northeast", "sa-east", 260),
            ("ap-southeast", "sa-east", 330),
        ];
        let mut distances = HashMap::new();
        for (a, b, d) in table {
            distances.insert((a.to_string(), b.to_string()), *d);
            distances.insert((b.to_string(), a.to_string()), *d);
        }
        Self { distances }
    }

    /// Built-in table with configured entries layered on top
    pub fn with_overrides(overrides: &[RegionDistance]) -> Self {
        let mut table = Self::builtin();
        for o in overrides {
            table.distances.insert((o.from.clone(), o.to.clone()), o.distance);
            table.distances.insert((o.to.clone(), o.from.clone()), o.distance);
        }
        table
    }

    pub fn distance(&self, from: &str, to: &str) -> u32 {
        if from == to {
            return 0;
        }
        self.distances
            .get(&(from.to_string(), to.to_string()))
            .copied()
            .unwrap_or(UNKNOWN_DISTANCE)
    }
}

impl Default for RegionDistances {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Serializable view of a load balancer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerInfo {
    pub id: LoadBalancerId,
    pub name: String,
    pub algorithm: Algorithm,
    pub listeners: Vec<Listener>,
    pub targets: Vec<LoadBalancerTarget>,
    pub created_at: DateTime<Utc>,
}

/// Load balancer
pub struct LoadBalancer {
    id: LoadBalancerId,
    name: String,
    algorithm: Algorithm,
    listeners: Vec<Listener>,
    created_at: DateTime<Utc>,
    table: ArcSwap<TargetTable>,
    /// Serializes writers; readers never take it
    write_lock: Mutex<()>,
    drain_deadlines: DashMap<TargetId, DateTime<Utc>>,
    drain_timeout: Duration,
    distances: Arc<RegionDistances>,
    zones: Arc<ZoneRegistry>,
    monitor: Arc<HealthMonitor>,
    clock: Arc<dyn Clock>,
}

impl LoadBalancer {
    /// Create and subscribe to the monitor's transitions
    pub fn new(
        spec: LoadBalancerSpec,
        config: &BalancerConfig,
        distances: Arc<RegionDistances>,
        zones: Arc<ZoneRegistry>,
        monitor: Arc<HealthMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let lb = Arc::new(Self {
            id: Uuid::new_v4(),
            name: spec.name,
            algorithm: spec.algorithm,
            listeners: spec.listeners,
            created_at: clock.now(),
            table: ArcSwap::from_pointee(TargetTable::default()),
            write_lock: Mutex::new(()),
            drain_deadlines: DashMap::new(),
            drain_timeout: config.drain_timeout(),
            distances,
            zones,
            monitor: monitor.clone(),
            clock,
        });
        let weak: Weak<dyn HealthListener> = Arc::downgrade(&lb) as Weak<dyn HealthListener>;
        monitor.subscribe(weak);
        tracing::info!(lb = %lb.name, algorithm = ?lb.algorithm, "Created load balancer {}", lb.id);
        lb
    }

    pub fn id(&self) -> LoadBalancerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Services named by listeners; the balancer name when unnamed or absent
    fn listener_services(&self) -> impl Iterator<Item = &str> + '_ {
        let unnamed = self.listeners.is_empty() || self.listeners.iter().any(|l| l.service.is_none());
        self.listeners
            .iter()
            .filter_map(|l| l.service.as_deref())
            .chain(unnamed.then_some(self.name.as_str()))
    }

    /// Services this balancer routes for
    pub fn services(&self) -> Vec<String> {
        let mut services: HashSet<String> = self.table.load().pools.keys().cloned().collect();
        services.extend(self.listener_services().map(str::to_string));
        let mut services: Vec<_> = services.into_iter().collect();
        services.sort();
        services
    }

    pub fn serves(&self, service: &str) -> bool {
        self.table.load().pools.contains_key(service) || self.listener_services().any(|s| s == service)
    }

    /// Pick a target for a request
    pub fn route(&self, service: &str, ctx: &RequestContext) -> AvailabilityResult<TargetLease> {
        let no_target = || AvailabilityError::NoHealthyTarget { service: service.to_string() };
        let table = self.table.load();
        let pool = table.pools.get(service).ok_or_else(no_target)?;

        let candidates: Vec<usize> = pool
            .targets
            .iter()
            .enumerate()
            .filter(|(_, s)| s.target.routable())
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return Err(no_target());
        }

        let pick = match self.algorithm {
            Algorithm::RoundRobin => next_round_robin(pool, &candidates),
            Algorithm::LeastConnections => {
                let min = candidates
                    .iter()
                    .map(|&i| pool.targets[i].in_flight.load(Ordering::Acquire))
                    .min()
                    .unwrap_or(0);
                let tied: Vec<usize> = candidates
                    .iter()
                    .copied()
                    .filter(|&i| pool.targets[i].in_flight.load(Ordering::Acquire) == min)
                    .collect();
                next_round_robin(pool, &tied)
            }
            Algorithm::WeightedRoundRobin => smooth_weighted(pool, &candidates),
            Algorithm::IpHash => match &ctx.client_ip {
                Some(ip) => candidates[(hash_client(ip) % candidates.len() as u64) as usize],
                None => next_round_robin(pool, &candidates),
            },
            Algorithm::Geographic => {
                let nearest = match &ctx.client_region {
                    Some(region) => {
                        let best = candidates
                            .iter()
                            .map(|&i| self.distances.distance(region, &pool.targets[i].target.region))
                            .min()
                            .unwrap_or(UNKNOWN_DISTANCE);
                        candidates
                            .iter()
                            .copied()
                            .filter(|&i| self.distances.distance(region, &pool.targets[i].target.region) == best)
                            .collect()
                    }
                    None => candidates.clone(),
                };
                next_round_robin(pool, &nearest)
            }
        };

        let slot = &pool.targets[pick];
        slot.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(TargetLease { target: slot.target.clone(), in_flight: slot.in_flight.clone() })
    }

    /// Register a target; it receives traffic once the monitor reports it healthy
    pub fn add_target(&self, spec: TargetSpec) -> AvailabilityResult<LoadBalancerTarget> {
        self.register_target(spec, TargetStatus::Unhealthy)
    }

    /// Register a target with a known starting status
    pub fn register_target(&self, spec: TargetSpec, initial: TargetStatus) -> AvailabilityResult<LoadBalancerTarget> {
        let zone = self.zones.zone(spec.zone)?;
        let service = spec.service.clone().unwrap_or_else(|| self.name.clone());
        let mut target = LoadBalancerTarget {
            id: Uuid::new_v4(),
            service: service.clone(),
            instance_id: spec.instance_id,
            endpoint: spec.endpoint,
            port: spec.port,
            weight: spec.weight,
            zone_id: zone.id,
            region: zone.region,
            check: spec.check,
            status: initial,
            consecutive_successes: 0,
            consecutive_failures: 0,
        };

        let _guard = self.write_lock.lock();
        target.status = self.monitor.watch_target(target.id, target.probe_spec(), initial);
        let mut table = (**self.table.load()).clone();
        table.pools.entry(service).or_default().targets.push(Arc::new(Slot {
            target: target.clone(),
            in_flight: Arc::new(AtomicU64::new(0)),
        }));
        self.table.store(Arc::new(table));
        tracing::info!(lb = %self.name, service = %target.service, endpoint = %target.endpoint, "Added target {}", target.id);
        Ok(target)
    }

    /// Remove a target and stop watching it
    pub fn remove_target(&self, id: TargetId) -> AvailabilityResult<LoadBalancerTarget> {
        let removed = {
            let _guard = self.write_lock.lock();
            let mut table = (**self.table.load()).clone();
            let (service, idx) = table
                .find(id)
                .map(|(s, i)| (s.to_string(), i))
                .ok_or_else(|| AvailabilityError::not_found("target", id))?;
            let pool = table.pools.get_mut(&service).ok_or_else(|| AvailabilityError::not_found("target", id))?;
            let slot = pool.targets.remove(idx);
            pool.current_weights.lock().remove(&id);
            self.table.store(Arc::new(table));
            slot.target.clone()
        };
        self.drain_deadlines.remove(&id);
        self.monitor.unwatch_target(id);
        tracing::info!(lb = %self.name, "Removed target {}", id);
        Ok(removed)
    }

    pub fn set_weight(&self, id: TargetId, weight: u32) -> AvailabilityResult<()> {
        self.set_weights(&[(id, weight)])
    }

    /// Rewrite several weights in one swap
    pub fn set_weights(&self, weights: &[(TargetId, u32)]) -> AvailabilityResult<()> {
        let _guard = self.write_lock.lock();
        let mut table = (**self.table.load()).clone();
        for (id, weight) in weights {
            let (service, idx) = table
                .find(*id)
                .map(|(s, i)| (s.to_string(), i))
                .ok_or_else(|| AvailabilityError::not_found("target", id))?;
            if let Some(pool) = table.pools.get_mut(&service) {
                let slot = &pool.targets[idx];
                let mut target = slot.target.clone();
                target.weight = *weight;
                pool.targets[idx] = slot.with_target(target);
            }
        }
        self.table.store(Arc::new(table));
        Ok(())
    }

    /// Make `incoming` the only weighted targets of a service in one swap
    ///
    /// Every other target of the service drops to weight zero and stops
    /// receiving new requests; callers drain and remove them afterwards.
    pub fn replace_targets(&self, service: &str, incoming: &[(TargetId, u32)]) -> AvailabilityResult<()> {
        let weights: HashMap<TargetId, u32> = incoming.iter().copied().collect();
        let _guard = self.write_lock.lock();
        let mut table = (**self.table.load()).clone();
        let pool = table
            .pools
            .get_mut(service)
            .ok_or_else(|| AvailabilityError::not_found("service", service))?;
        for id in weights.keys() {
            if !pool.targets.iter().any(|s| s.target.id == *id) {
                return Err(AvailabilityError::not_found("target", id));
            }
        }
        pool.targets = pool
            .targets
            .iter()
            .map(|slot| {
                let mut target = slot.target.clone();
                target.weight = weights.get(&target.id).copied().unwrap_or(0);
                slot.with_target(target)
            })
            .collect();
        self.table.store(Arc::new(table));
        tracing::info!(lb = %self.name, service, incoming = incoming.len(), "Replaced service targets");
        Ok(())
    }

    /// Current targets of a service, in order
    pub fn targets(&self, service: &str) -> Vec<LoadBalancerTarget> {
        self.table
            .load()
            .pools
            .get(service)
            .map(|pool| pool.targets.iter().map(|s| self.describe(&s.target)).collect())
            .unwrap_or_default()
    }

    pub fn all_targets(&self) -> Vec<LoadBalancerTarget> {
        let table = self.table.load();
        let mut services: Vec<_> = table.pools.keys().collect();
        services.sort();
        services
            .into_iter()
            .flat_map(|s| table.pools[s].targets.iter().map(|slot| self.describe(&slot.target)))
            .collect()
    }

    pub fn target(&self, id: TargetId) -> Option<LoadBalancerTarget> {
        let table = self.table.load();
        let (service, idx) = table.find(id)?;
        Some(self.describe(&table.pools[service].targets[idx].target))
    }

    fn describe(&self, target: &LoadBalancerTarget) -> LoadBalancerTarget {
        let mut target = target.clone();
        if let Some(health) = self.monitor.target_health(target.id) {
            target.consecutive_successes = health.consecutive_successes;
            target.consecutive_failures = health.consecutive_failures;
        }
        target
    }

    pub fn in_flight(&self, id: TargetId) -> u64 {
        let table = self.table.load();
        table
            .find(id)
            .map(|(s, i)| table.pools[s].targets[i].in_flight.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Capture a service's exact target set
    pub fn snapshot(&self, service: &str) -> TargetSnapshot {
        TargetSnapshot {
            load_balancer_id: self.id,
            service: service.to_string(),
            targets: self
                .table
                .load()
                .pools
                .get(service)
                .map(|p| p.targets.iter().map(|s| s.target.clone()).collect())
                .unwrap_or_default(),
        }
    }

    /// Make a service's target set exactly the snapshot again
    ///
    /// Targets added since the snapshot are removed and unwatched; targets
    /// missing from the current set are re-added with their snapshot status.
    /// Returns the removed targets.
    pub fn restore(&self, snapshot: &TargetSnapshot) -> AvailabilityResult<Vec<LoadBalancerTarget>> {
        if snapshot.load_balancer_id != self.id {
            return Err(AvailabilityError::InvalidState(format!(
                "snapshot belongs to load balancer {}",
                snapshot.load_balancer_id
            )));
        }

        let keep: HashSet<TargetId> = snapshot.targets.iter().map(|t| t.id).collect();
        let removed = {
            let _guard = self.write_lock.lock();
            let mut table = (**self.table.load()).clone();
            let pool = table.pools.entry(snapshot.service.clone()).or_default();
            let current: HashMap<TargetId, Arc<Slot>> =
                pool.targets.iter().map(|s| (s.target.id, s.clone())).collect();

            let removed: Vec<LoadBalancerTarget> = pool
                .targets
                .iter()
                .filter(|s| !keep.contains(&s.target.id))
                .map(|s| s.target.clone())
                .collect();

            pool.targets = snapshot
                .targets
                .iter()
                .map(|t| match current.get(&t.id) {
                    Some(slot) => slot.with_target(t.clone()),
                    None => Arc::new(Slot { target: t.clone(), in_flight: Arc::new(AtomicU64::new(0)) }),
                })
                .collect();
            pool.current_weights.lock().retain(|id, _| keep.contains(id));
            self.table.store(Arc::new(table));
            removed
        };

        for target in &removed {
            self.drain_deadlines.remove(&target.id);
            self.monitor.unwatch_target(target.id);
        }
        for target in &snapshot.targets {
            self.drain_deadlines.remove(&target.id);
            self.monitor.watch_target(target.id, target.probe_spec(), target.status);
            self.monitor.override_status(target.id, target.status, "restored from snapshot")?;
        }

        tracing::warn!(
            lb = %self.name, service = %snapshot.service,
            restored = snapshot.targets.len(), removed = removed.len(),
            "Restored target snapshot"
        );
        Ok(removed)
    }

    /// Stop routing new requests to a target
    pub fn drain_target(&self, id: TargetId) -> AvailabilityResult<()> {
        if self.target(id).is_none() {
            return Err(AvailabilityError::not_found("target", id));
        }
        self.drain_deadlines.insert(id, self.clock.now() + to_chrono(self.drain_timeout));
        self.monitor.begin_drain(id, "drain requested")?;
        Ok(())
    }

    /// Retire draining targets with no connections left or past the drain timeout
    pub fn reap_drained(&self) -> Vec<TargetId> {
        let now = self.clock.now();
        let done: Vec<TargetId> = self
            .drain_deadlines
            .iter()
            .filter(|e| now >= *e.value() || self.in_flight(*e.key()) == 0)
            .map(|e| *e.key())
            .collect();

        for id in &done {
            self.drain_deadlines.remove(id);
            if self.target(*id).map(|t| t.status) == Some(TargetStatus::Draining) {
                if let Err(e) = self.monitor.mark_unused(*id, "drain complete") {
                    tracing::warn!(lb = %self.name, "Could not retire target {}: {}", id, e);
                }
            }
        }
        done
    }

    pub fn info(&self) -> LoadBalancerInfo {
        LoadBalancerInfo {
            id: self.id,
            name: self.name.clone(),
            algorithm: self.algorithm,
            listeners: self.listeners.clone(),
            targets: self.all_targets(),
            created_at: self.created_at,
        }
    }
}

impl HealthListener for LoadBalancer {
    fn on_transition(&self, transition: &HealthTransition) {
        let _guard = self.write_lock.lock();
        let mut table = (**self.table.load()).clone();
        let (service, idx) = match table.find(transition.target_id) {
            Some((s, i)) => (s.to_string(), i),
            None => return,
        };
        if let Some(pool) = table.pools.get_mut(&service) {
            let slot = &pool.targets[idx];
            let mut target = slot.target.clone();
            target.status = transition.to;
            pool.targets[idx] = slot.with_target(target);
        }
        self.table.store(Arc::new(table));
    }
}

/// Next candidate at or after the cursor, wrapping; advances the cursor past it
///
/// The cursor indexes the full ordered list so the cycle keeps its place when
/// candidates come and go.
fn next_round_robin(pool: &Pool, candidates: &[usize]) -> usize {
    let len = pool.targets.len().max(1);
    loop {
        let current = pool.cursor.load(Ordering::Acquire);
        let start = current % len;
        let pick = candidates
            .iter()
            .copied()
            .find(|&i| i >= start)
            .unwrap_or(candidates[0]);
        if pool
            .cursor
            .compare_exchange(current, (pick + 1) % len, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return pick;
        }
    }
}

/// Smooth weighted round-robin (nginx style)
fn smooth_weighted(pool: &Pool, candidates: &[usize]) -> usize {
    let mut weights = pool.current_weights.lock();
    let total: i64 = candidates.iter().map(|&i| pool.targets[i].target.weight as i64).sum();

    let mut best = candidates[0];
    let mut best_weight = i64::MIN;
    for &i in candidates {
        let target = &pool.targets[i].target;
        let current = weights.entry(target.id).or_insert(0);
        *current += target.weight as i64;
        if *current > best_weight {
            best_weight = *current;
            best = i;
        }
    }
    if let Some(w) = weights.get_mut(&pool.targets[best].target.id) {
        *w -= total;
    }
    best
}

fn hash_client(ip: &str) -> u64 {
    let mut hash = 0u64;
    for byte in ip.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(byte as u64);
    }
    hash
}

/// All load balancers of the process
pub struct LoadBalancerRegistry {
    balancers: DashMap<LoadBalancerId, Arc<LoadBalancer>>,
    config: BalancerConfig,
    distances: Arc<RegionDistances>,
    zones: Arc<ZoneRegistry>,
    monitor: Arc<HealthMonitor>,
    clock: Arc<dyn Clock>,
}

impl LoadBalancerRegistry {
    pub fn new(
        config: BalancerConfig,
        zones: Arc<ZoneRegistry>,
        monitor: Arc<HealthMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let distances = Arc::new(RegionDistances::with_overrides(&config.region_distances));
        Self {
            balancers: DashMap::new(),
            config,
            distances,
            zones,
            monitor,
            clock,
        }
    }

    pub fn create(&self, spec: LoadBalancerSpec) -> AvailabilityResult<Arc<LoadBalancer>> {
        if spec.name.trim().is_empty() {
            return Err(AvailabilityError::InvalidConfig("load balancer name must not be empty".into()));
        }
        let lb = LoadBalancer::new(
            spec,
            &self.config,
            self.distances.clone(),
            self.zones.clone(),
            self.monitor.clone(),
            self.clock.clone(),
        );
        self.balancers.insert(lb.id(), lb.clone());
        Ok(lb)
    }

    pub fn get(&self, id: LoadBalancerId) -> AvailabilityResult<Arc<LoadBalancer>> {
        self.balancers
            .get(&id)
            .map(|lb| lb.clone())
            .ok_or_else(|| AvailabilityError::not_found("load balancer", id))
    }

    pub fn list(&self) -> Vec<Arc<LoadBalancer>> {
        let mut all: Vec<_> = self.balancers.iter().map(|lb| lb.clone()).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Balancer routing a service
    pub fn find_for_service(&self, service: &str) -> AvailabilityResult<Arc<LoadBalancer>> {
        self.list()
            .into_iter()
            .find(|lb| lb.serves(service))
            .ok_or_else(|| AvailabilityError::not_found("load balancer for service", service))
    }

    /// Run drain bookkeeping on every balancer
    pub fn reap_drained(&self) -> usize {
        self.list().iter().map(|lb| lb.reap_drained().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use proptest::prelude::*;

    fn lb(h: &Harness, algorithm: Algorithm) -> Arc<LoadBalancer> {
        h.balancers
            .create(LoadBalancerSpec { name: "dns-api".into(), algorithm, listeners: vec![] })
            .unwrap()
    }

    fn healthy(lb: &LoadBalancer, zone: ZoneId, host: &str, weight: u32) -> LoadBalancerTarget {
        lb.register_target(
            TargetSpec {
                endpoint: host.into(),
                port: 443,
                weight,
                zone,
                service: None,
                instance_id: None,
                check: CheckType::Tcp,
            },
            TargetStatus::Healthy,
        )
        .unwrap()
    }

    fn pick(lb: &LoadBalancer, ctx: &RequestContext) -> String {
        lb.route("dns-api", ctx).unwrap().target().endpoint.clone()
    }

    #[test]
    fn test_round_robin_skips_failed_target() {
        let h = harness();
        let zone = h.zone("use1-a", "us-east");
        let lb = lb(&h, Algorithm::RoundRobin);
        healthy(&lb, zone.id, "A", 1);
        let b = healthy(&lb, zone.id, "B", 1);
        healthy(&lb, zone.id, "C", 1);

        let ctx = RequestContext::default();
        let seq: Vec<_> = (0..6).map(|_| pick(&lb, &ctx)).collect();
        assert_eq!(seq, ["A", "B", "C", "A", "B", "C"]);

        assert_eq!(pick(&lb, &ctx), "A");
        for _ in 0..3 {
            h.monitor.record_probe_result(b.id, fail()).unwrap();
        }
        let seq: Vec<_> = (0..4).map(|_| pick(&lb, &ctx)).collect();
        assert_eq!(seq, ["C", "A", "C", "A"]);
    }

    #[test]
    fn test_no_healthy_target() {
        let h = harness();
        let zone = h.zone("use1-a", "us-east");
        let lb = lb(&h, Algorithm::RoundRobin);
        lb.add_target(TargetSpec {
            endpoint: "10.0.0.1".into(),
            port: 53,
            weight: 1,
            zone: zone.id,
            service: None,
            instance_id: None,
            check: CheckType::Tcp,
        })
        .unwrap();

        let err = lb.route("dns-api", &RequestContext::default()).unwrap_err();
        assert_eq!(err.code(), "NO_HEALTHY_TARGET");
        assert!(lb.route("unknown", &RequestContext::default()).is_err());
    }

    #[test]
    fn test_least_connections_uses_leases() {
        let h = harness();
        let zone = h.zone("use1-a", "us-east");
        let lb = lb(&h, Algorithm::LeastConnections);
        healthy(&lb, zone.id, "A", 1);
        healthy(&lb, zone.id, "B", 1);

        let ctx = RequestContext::default();
        let first = lb.route("dns-api", &ctx).unwrap();
        let second = lb.route("dns-api", &ctx).unwrap();
        assert_eq!(first.target().endpoint, "A");
        assert_eq!(second.target().endpoint, "B");

        drop(first);
        // A is idle again, B still busy
        assert_eq!(pick(&lb, &ctx), "A");
        assert_eq!(lb.in_flight(second.target().id), 1);
    }

    #[test]
    fn test_smooth_weighted_interleaves() {
        let h = harness();
        let zone = h.zone("use1-a", "us-east");
        let lb = lb(&h, Algorithm::WeightedRoundRobin);
        healthy(&lb, zone.id, "A", 5);
        healthy(&lb, zone.id, "B", 1);
        healthy(&lb, zone.id, "C", 1);

        let ctx = RequestContext::default();
        let seq: Vec<_> = (0..7).map(|_| pick(&lb, &ctx)).collect();
        assert_eq!(seq, ["A", "A", "B", "A", "C", "A", "A"]);
    }

    #[test]
    fn test_ip_hash_redistributes_on_failover() {
        let h = harness();
        let zone = h.zone("use1-a", "us-east");
        let lb = lb(&h, Algorithm::IpHash);
        let targets: Vec<_> = ["A", "B", "C"].iter().map(|n| healthy(&lb, zone.id, n, 1)).collect();

        let ctx = RequestContext::from_ip("203.0.113.7");
        let first = pick(&lb, &ctx);
        assert_eq!(pick(&lb, &ctx), first);

        let chosen = targets.iter().find(|t| t.endpoint == first).unwrap();
        for _ in 0..3 {
            h.monitor.record_probe_result(chosen.id, fail()).unwrap();
        }
        let next = pick(&lb, &ctx);
        assert_ne!(next, first);
        assert_eq!(pick(&lb, &ctx), next);
    }

    #[test]
    fn test_geographic_prefers_nearest_zone() {
        let h = harness();
        let us = h.zone("use1-a", "us-east");
        let eu = h.zone("euw1-a", "eu-west");
        let lb = lb(&h, Algorithm::Geographic);
        healthy(&lb, us.id, "us-1", 1);
        let eu1 = healthy(&lb, eu.id, "eu-1", 1);
        healthy(&lb, eu.id, "eu-2", 1);

        let ctx = RequestContext::from_region("eu-central");
        let seq: Vec<_> = (0..4).map(|_| pick(&lb, &ctx)).collect();
        assert_eq!(seq, ["eu-1", "eu-2", "eu-1", "eu-2"]);

        lb.set_weight(eu1.id, 0).unwrap();
        assert_eq!(pick(&lb, &ctx), "eu-2");
        assert_eq!(pick(&lb, &RequestContext::from_region("us-east")), "us-1");
    }

    #[test]
    fn test_drain_then_reap() {
        let h = harness();
        let zone = h.zone("use1-a", "us-east");
        let lb = lb(&h, Algorithm::RoundRobin);
        let a = healthy(&lb, zone.id, "A", 1);
        healthy(&lb, zone.id, "B", 1);

        let lease = lb.route("dns-api", &RequestContext::default()).unwrap();
        assert_eq!(lease.target().id, a.id);
        lb.drain_target(a.id).unwrap();
        assert_eq!(lb.target(a.id).unwrap().status, TargetStatus::Draining);
        for _ in 0..3 {
            assert_eq!(pick(&lb, &RequestContext::default()), "B");
        }

        // Connection still open and timeout not reached
        assert!(lb.reap_drained().is_empty());
        drop(lease);
        assert_eq!(lb.reap_drained(), vec![a.id]);
        assert_eq!(lb.target(a.id).unwrap().status, TargetStatus::Unused);
    }

    #[test]
    fn test_drain_timeout_forces_retirement() {
        let h = harness();
        let zone = h.zone("use1-a", "us-east");
        let lb = lb(&h, Algorithm::RoundRobin);
        let a = healthy(&lb, zone.id, "A", 1);
        let _lease = lb.route("dns-api", &RequestContext::default()).unwrap();

        lb.drain_target(a.id).unwrap();
        h.clock.advance(Duration::from_secs(301));
        assert_eq!(lb.reap_drained(), vec![a.id]);
    }

    #[test]
    fn test_restore_snapshot_is_exact_and_idempotent() {
        let h = harness();
        let zone = h.zone("use1-a", "us-east");
        let lb = lb(&h, Algorithm::RoundRobin);
        let a = healthy(&lb, zone.id, "A", 3);
        let b = healthy(&lb, zone.id, "B", 1);
        let before = lb.snapshot("dns-api");

        healthy(&lb, zone.id, "C", 1);
        lb.set_weight(a.id, 0).unwrap();
        lb.drain_target(b.id).unwrap();

        let removed = lb.restore(&before).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(lb.snapshot("dns-api"), before);
        assert_eq!(h.monitor.target_status(b.id), Some(TargetStatus::Healthy));

        assert!(lb.restore(&before).unwrap().is_empty());
        assert_eq!(lb.snapshot("dns-api"), before);
    }

    #[test]
    fn test_registry_finds_balancer_by_service() {
        let h = harness();
        let zone = h.zone("use1-a", "us-east");
        let lb = lb(&h, Algorithm::RoundRobin);
        healthy(&lb, zone.id, "A", 1);

        assert_eq!(h.balancers.find_for_service("dns-api").unwrap().id(), lb.id());
        assert!(h.balancers.find_for_service("zone-transfer").is_err());
    }

    #[test]
    fn test_unnamed_listener_serves_balancer_name() {
        let h = harness();
        let listener = |service: Option<&str>| Listener {
            protocol: ListenerProtocol::Udp,
            port: 53,
            service: service.map(str::to_string),
        };
        let resolver = h
            .balancers
            .create(LoadBalancerSpec {
                name: "resolver".into(),
                algorithm: Algorithm::RoundRobin,
                listeners: vec![listener(None)],
            })
            .unwrap();
        let edge = h
            .balancers
            .create(LoadBalancerSpec {
                name: "edge".into(),
                algorithm: Algorithm::RoundRobin,
                listeners: vec![listener(Some("zone-transfer"))],
            })
            .unwrap();

        assert_eq!(h.balancers.find_for_service("resolver").unwrap().id(), resolver.id());
        assert_eq!(h.balancers.find_for_service("zone-transfer").unwrap().id(), edge.id());
        assert!(h.balancers.find_for_service("edge").is_err());
        assert_eq!(resolver.services(), vec!["resolver".to_string()]);
    }

    #[derive(Debug, Clone)]
    enum Change {
        Fail(usize),
        Pass(usize),
        Weight(usize, u32),
        Drain(usize),
    }

    fn change() -> impl Strategy<Value = Change> {
        prop_oneof![
            (0..4usize).prop_map(Change::Fail),
            (0..4usize).prop_map(Change::Pass),
            (0..4usize, 0..3u32).prop_map(|(i, w)| Change::Weight(i, w)),
            (0..4usize).prop_map(Change::Drain),
        ]
    }

    proptest! {
        #[test]
        fn prop_route_only_returns_healthy_weighted_targets(
            algorithm in prop_oneof![
                Just(Algorithm::RoundRobin),
                Just(Algorithm::LeastConnections),
                Just(Algorithm::WeightedRoundRobin),
                Just(Algorithm::IpHash),
                Just(Algorithm::Geographic),
            ],
            changes in proptest::collection::vec(change(), 1..40),
        ) {
            let h = harness();
            let zone = h.zone("use1-a", "us-east");
            let lb = lb(&h, algorithm);
            let ids: Vec<TargetId> = ["A", "B", "C", "D"].iter().map(|host| healthy(&lb, zone.id, host, 1).id).collect();
            let ctx = RequestContext { client_ip: Some("192.0.2.7".into()), client_region: Some("us-east".into()) };

            for change in changes {
                match change {
                    Change::Fail(i) => {
                        h.monitor.record_probe_result(ids[i], fail()).unwrap();
                    }
                    Change::Pass(i) => {
                        h.monitor.record_probe_result(ids[i], ok()).unwrap();
                    }
                    Change::Weight(i, w) => {
                        let _ = lb.set_weights(&[(ids[i], w)]);
                    }
                    Change::Drain(i) => {
                        let _ = lb.drain_target(ids[i]);
                    }
                }
                for _ in 0..4 {
                    if let Ok(lease) = lb.route("dns-api", &ctx) {
                        let id = lease.target().id;
                        prop_assert_eq!(h.monitor.target_status(id), Some(TargetStatus::Healthy));
                        let current = lb.target(id).unwrap();
                        prop_assert_eq!(current.status, TargetStatus::Healthy);
                        prop_assert!(current.weight > 0);
                    }
                }
            }
        }
    }
}
