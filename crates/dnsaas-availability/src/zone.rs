//! Zone Registry
//!
//! Inventory of availability zones, their capacity and the service instances
//! they host. Zones are never deleted; the worst they get is `Offline`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use dnsaas_common::{
    AvailabilityError, AvailabilityResult, Clock, InstanceId, MemoryStore, Store, ZoneId,
};
use uuid::Uuid;

use crate::metrics::MetricSnapshot;
use crate::ports::{CheckType, ProbeSpec};

/// Zone status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneStatus {
    Active,
    Maintenance,
    Degraded,
    Offline,
}

/// One capacity dimension
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub total: f64,
    pub used: f64,
}

impl Resource {
    pub fn new(total: f64) -> Self {
        Self { total, used: 0.0 }
    }

    pub fn free(&self) -> f64 {
        (self.total - self.used).max(0.0)
    }
}

/// Zone capacity
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneCapacity {
    /// vCPU cores
    pub cpu: Resource,
    /// GiB
    pub memory: Resource,
    /// GiB
    pub storage: Resource,
    /// Gbit/s
    pub network: Resource,
}

/// Totals supplied at registration
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacitySpec {
    pub cpu_cores: f64,
    pub memory_gb: f64,
    pub storage_gb: f64,
    pub network_gbps: f64,
}

/// Zone registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneSpec {
    pub name: String,
    pub region: String,
    pub provider: String,
    #[serde(default)]
    pub capacity: CapacitySpec,
    /// Reachability probe for zones without instances
    #[serde(default)]
    pub probe: Option<ProbeSpec>,
}

/// Availability zone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityZone {
    pub id: ZoneId,
    pub name: String,
    pub region: String,
    pub provider: String,
    pub status: ZoneStatus,
    pub capacity: ZoneCapacity,
    pub instances: BTreeSet<InstanceId>,
    /// Rolling availability, percent
    pub availability_pct: f64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub unreachable_since: Option<DateTime<Utc>>,
    pub probe: Option<ProbeSpec>,
    pub created_at: DateTime<Utc>,
}

/// Instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Running,
    Starting,
    Stopping,
    Failed,
    Maintenance,
}

/// Resources an instance reserves in its zone
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequest {
    pub cpu_cores: f64,
    pub memory_gb: f64,
    pub storage_gb: f64,
    pub network_gbps: f64,
}

/// Replica counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Replicas {
    pub desired: u32,
    pub current: u32,
    pub ready: u32,
}

/// Service instance hosted in a zone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: InstanceId,
    pub zone_id: ZoneId,
    pub service_type: String,
    pub version: String,
    pub status: InstanceStatus,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub check: CheckType,
    #[serde(default)]
    pub resources: ResourceRequest,
    #[serde(default)]
    pub metrics: MetricSnapshot,
    #[serde(default)]
    pub replicas: Replicas,
    pub created_at: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn new(
        zone_id: ZoneId,
        service_type: impl Into<String>,
        version: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            zone_id,
            service_type: service_type.into(),
            version: version.into(),
            status: InstanceStatus::Starting,
            host: host.into(),
            port,
            check: CheckType::Tcp,
            resources: ResourceRequest::default(),
            metrics: MetricSnapshot::default(),
            replicas: Replicas { desired: 1, current: 1, ready: 0 },
            created_at: Utc::now(),
        }
    }

    pub fn probe_spec(&self) -> ProbeSpec {
        ProbeSpec {
            host: self.host.clone(),
            port: self.port,
            check: self.check.clone(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Weight in the zone failure ratio
    pub fn weight(&self) -> u32 {
        self.replicas.desired.max(1)
    }
}

/// Zone registry
pub struct ZoneRegistry {
    zones: Arc<dyn Store<AvailabilityZone>>,
    instances: Arc<dyn Store<ServiceInstance>>,
    /// Registered names; held across the duplicate check and the insert
    names: Mutex<HashSet<String>>,
    clock: Arc<dyn Clock>,
}

impl ZoneRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_stores(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
            clock,
        )
    }

    /// Build on top of externally supplied stores
    pub fn with_stores(
        zones: Arc<dyn Store<AvailabilityZone>>,
        instances: Arc<dyn Store<ServiceInstance>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let names = zones.values().into_iter().map(|z| z.name).collect();
        Self {
            zones,
            instances,
            names: Mutex::new(names),
            clock,
        }
    }

    /// Register a zone
    pub fn register_zone(&self, spec: ZoneSpec) -> AvailabilityResult<AvailabilityZone> {
        if spec.name.trim().is_empty() {
            return Err(AvailabilityError::InvalidConfig("zone name must not be empty".into()));
        }

        let mut names = self.names.lock();
        if names.contains(&spec.name) {
            return Err(AvailabilityError::DuplicateZone(spec.name));
        }

        let zone = AvailabilityZone {
            id: Uuid::new_v4(),
            name: spec.name.clone(),
            region: spec.region,
            provider: spec.provider,
            status: ZoneStatus::Active,
            capacity: ZoneCapacity {
                cpu: Resource::new(spec.capacity.cpu_cores),
                memory: Resource::new(spec.capacity.memory_gb),
                storage: Resource::new(spec.capacity.storage_gb),
                network: Resource::new(spec.capacity.network_gbps),
            },
            instances: BTreeSet::new(),
            availability_pct: 100.0,
            last_health_check: None,
            unreachable_since: None,
            probe: spec.probe,
            created_at: self.clock.now(),
        };

        self.zones.insert(zone.id, zone.clone());
        names.insert(spec.name);
        tracing::info!(zone = %zone.name, region = %zone.region, "Registered zone {}", zone.id);
        Ok(zone)
    }

    pub fn zone(&self, id: ZoneId) -> AvailabilityResult<AvailabilityZone> {
        self.zones.get(&id).ok_or_else(|| AvailabilityError::not_found("zone", id))
    }

    pub fn zone_status(&self, id: ZoneId) -> AvailabilityResult<ZoneStatus> {
        self.zone(id).map(|z| z.status)
    }

    /// All zones, ordered by name
    pub fn zones(&self) -> Vec<AvailabilityZone> {
        let mut zones = self.zones.values();
        zones.sort_by(|a, b| a.name.cmp(&b.name));
        zones
    }

    pub fn zones_with_status(&self, status: ZoneStatus) -> Vec<AvailabilityZone> {
        self.zones().into_iter().filter(|z| z.status == status).collect()
    }

    /// Set status, returning the previous one
    pub(crate) fn set_status(&self, id: ZoneId, status: ZoneStatus) -> AvailabilityResult<ZoneStatus> {
        let mut previous = status;
        self.zones
            .update(&id, &mut |z| {
                previous = z.status;
                z.status = status;
                if status == ZoneStatus::Active {
                    z.unreachable_since = None;
                }
            })
            .ok_or_else(|| AvailabilityError::not_found("zone", id))?;
        Ok(previous)
    }

    /// Administrative offline; bypasses the degraded step
    pub fn mark_offline(&self, id: ZoneId, reason: &str) -> AvailabilityResult<AvailabilityZone> {
        let previous = self.set_status(id, ZoneStatus::Offline)?;
        tracing::warn!(zone = %id, ?previous, "Zone marked offline by operator: {}", reason);
        self.zone(id)
    }

    /// Enter or leave maintenance
    pub fn set_maintenance(&self, id: ZoneId, enabled: bool) -> AvailabilityResult<AvailabilityZone> {
        let status = if enabled { ZoneStatus::Maintenance } else { ZoneStatus::Active };
        self.set_status(id, status)?;
        tracing::info!(zone = %id, "Zone maintenance {}", if enabled { "started" } else { "ended" });
        self.zone(id)
    }

    /// Store the outcome of a zone probe cycle
    pub(crate) fn record_health_check(
        &self,
        id: ZoneId,
        availability_pct: f64,
        reachable: bool,
    ) -> AvailabilityResult<AvailabilityZone> {
        let now = self.clock.now();
        self.zones
            .update(&id, &mut |z| {
                z.availability_pct = availability_pct;
                z.last_health_check = Some(now);
                if reachable {
                    z.unreachable_since = None;
                } else if z.unreachable_since.is_none() {
                    z.unreachable_since = Some(now);
                }
            })
            .ok_or_else(|| AvailabilityError::not_found("zone", id))
    }

    /// Place an instance in its zone, reserving capacity
    pub fn add_instance(&self, instance: ServiceInstance) -> AvailabilityResult<ServiceInstance> {
        let zone = self.zone(instance.zone_id)?;
        if zone.status == ZoneStatus::Offline {
            return Err(AvailabilityError::InvalidState(format!(
                "zone {} is offline",
                zone.name
            )));
        }

        let r = instance.resources;
        let fits = r.cpu_cores <= zone.capacity.cpu.free()
            && r.memory_gb <= zone.capacity.memory.free()
            && r.storage_gb <= zone.capacity.storage.free()
            && r.network_gbps <= zone.capacity.network.free();
        if !fits {
            return Err(AvailabilityError::InvalidState(format!(
                "zone {} lacks capacity for instance {}",
                zone.name, instance.id
            )));
        }

        self.zones.update(&instance.zone_id, &mut |z| {
            z.capacity.cpu.used += r.cpu_cores;
            z.capacity.memory.used += r.memory_gb;
            z.capacity.storage.used += r.storage_gb;
            z.capacity.network.used += r.network_gbps;
            z.instances.insert(instance.id);
        });
        self.instances.insert(instance.id, instance.clone());
        tracing::debug!(zone = %zone.name, service = %instance.service_type, "Added instance {}", instance.id);
        Ok(instance)
    }

    /// Remove an instance and release its capacity
    pub fn remove_instance(&self, id: InstanceId) -> AvailabilityResult<ServiceInstance> {
        let instance = self
            .instances
            .remove(&id)
            .ok_or_else(|| AvailabilityError::not_found("instance", id))?;
        let r = instance.resources;
        self.zones.update(&instance.zone_id, &mut |z| {
            z.capacity.cpu.used = (z.capacity.cpu.used - r.cpu_cores).max(0.0);
            z.capacity.memory.used = (z.capacity.memory.used - r.memory_gb).max(0.0);
            z.capacity.storage.used = (z.capacity.storage.used - r.storage_gb).max(0.0);
            z.capacity.network.used = (z.capacity.network.used - r.network_gbps).max(0.0);
            z.instances.remove(&id);
        });
        Ok(instance)
    }

    pub fn instance(&self, id: InstanceId) -> AvailabilityResult<ServiceInstance> {
        self.instances.get(&id).ok_or_else(|| AvailabilityError::not_found("instance", id))
    }

    pub fn instances_in_zone(&self, zone: ZoneId) -> Vec<ServiceInstance> {
        let ids = match self.zones.get(&zone) {
            Some(z) => z.instances,
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.instances.get(id)).collect()
    }

    pub fn instances_of(&self, service_type: &str) -> Vec<ServiceInstance> {
        self.instances
            .values()
            .into_iter()
            .filter(|i| i.service_type == service_type)
            .collect()
    }

    pub(crate) fn update_instance(
        &self,
        id: InstanceId,
        f: &mut dyn FnMut(&mut ServiceInstance),
    ) -> Option<ServiceInstance> {
        self.instances.update(&id, f)
    }
}
