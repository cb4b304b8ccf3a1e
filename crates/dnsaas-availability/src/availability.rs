//! Availability Calculator
//!
//! System availability across zones, redundancy and single points of failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dnsaas_common::{Clock, ZoneId};

use crate::balancer::LoadBalancerRegistry;
use crate::config::AvailabilityReportConfig;
use crate::health::TargetStatus;
use crate::zone::{AvailabilityZone, ZoneCapacity, ZoneRegistry, ZoneStatus};

/// One zone's line in the report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneAvailability {
    pub zone_id: ZoneId,
    pub name: String,
    pub region: String,
    pub status: ZoneStatus,
    pub availability_pct: f64,
    /// Only active zones count toward system availability
    pub included: bool,
    pub cpu_used_pct: f64,
    pub memory_used_pct: f64,
    pub instances: usize,
}

/// System availability report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemAvailabilityReport {
    pub system_availability_pct: f64,
    pub active_zones: usize,
    /// Zones left out of the calculation because they are not active
    pub flagged_zones: Vec<ZoneId>,
    pub zones: Vec<ZoneAvailability>,
    /// Active zones that could absorb the most loaded zone
    pub redundancy_level: usize,
    /// Services whose healthy targets all sit in one zone
    pub single_points_of_failure: Vec<String>,
    /// Services with no healthy target at all
    pub unavailable_services: Vec<String>,
    pub sla_target_pct: f64,
    pub meets_sla: bool,
    pub generated_at: DateTime<Utc>,
}

/// `1 - Π(1 - a_i)` with availabilities in percent; 0 for no zones
pub fn combined_availability(zone_pcts: &[f64]) -> f64 {
    if zone_pcts.is_empty() {
        return 0.0;
    }
    let all_down: f64 = zone_pcts
        .iter()
        .map(|pct| 1.0 - (pct / 100.0).clamp(0.0, 1.0))
        .product();
    (1.0 - all_down) * 100.0
}

fn used_fraction(capacity: &ZoneCapacity) -> (f64, f64) {
    let frac = |used: f64, total: f64| if total > 0.0 { used / total } else { 0.0 };
    (
        frac(capacity.cpu.used, capacity.cpu.total),
        frac(capacity.memory.used, capacity.memory.total),
    )
}

/// Zones, other than the one with the largest used cpu and memory, with
/// enough free capacity to take its load
pub fn redundancy_level(capacities: &[ZoneCapacity]) -> usize {
    let loaded = capacities.iter().enumerate().max_by(|(_, a), (_, b)| {
        a.cpu
            .used
            .partial_cmp(&b.cpu.used)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.memory.used.partial_cmp(&b.memory.used).unwrap_or(std::cmp::Ordering::Equal))
    });
    let (loaded_idx, loaded) = match loaded {
        Some(l) => l,
        None => return 0,
    };

    capacities
        .iter()
        .enumerate()
        .filter(|(i, c)| {
            *i != loaded_idx && c.cpu.free() >= loaded.cpu.used && c.memory.free() >= loaded.memory.used
        })
        .count()
}

/// Availability calculator
pub struct AvailabilityCalculator {
    config: AvailabilityReportConfig,
    zones: Arc<ZoneRegistry>,
    balancers: Arc<LoadBalancerRegistry>,
    clock: Arc<dyn Clock>,
}

impl AvailabilityCalculator {
    pub fn new(
        config: AvailabilityReportConfig,
        zones: Arc<ZoneRegistry>,
        balancers: Arc<LoadBalancerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { config, zones, balancers, clock }
    }

    /// Build the system availability report
    pub fn calculate(&self) -> SystemAvailabilityReport {
        let zones = self.zones.zones();
        let active: Vec<&AvailabilityZone> = zones.iter().filter(|z| z.status == ZoneStatus::Active).collect();

        let pcts: Vec<f64> = active.iter().map(|z| z.availability_pct).collect();
        let system_availability_pct = combined_availability(&pcts);
        let capacities: Vec<ZoneCapacity> = active.iter().map(|z| z.capacity).collect();
        let redundancy = redundancy_level(&capacities);

        let lines: Vec<ZoneAvailability> = zones
            .iter()
            .map(|z| {
                let (cpu, memory) = used_fraction(&z.capacity);
                ZoneAvailability {
                    zone_id: z.id,
                    name: z.name.clone(),
                    region: z.region.clone(),
                    status: z.status,
                    availability_pct: z.availability_pct,
                    included: z.status == ZoneStatus::Active,
                    cpu_used_pct: cpu * 100.0,
                    memory_used_pct: memory * 100.0,
                    instances: z.instances.len(),
                }
            })
            .collect();
        let flagged_zones: Vec<ZoneId> = lines.iter().filter(|l| !l.included).map(|l| l.zone_id).collect();
        for line in lines.iter().filter(|l| !l.included) {
            tracing::debug!(zone = %line.name, status = ?line.status, "Zone excluded from availability");
        }

        let (single_points_of_failure, unavailable_services) = self.service_spread();
        let meets_sla = system_availability_pct >= self.config.sla_target_pct;
        if !meets_sla {
            tracing::warn!(
                availability = system_availability_pct,
                sla = self.config.sla_target_pct,
                "System availability below SLA target"
            );
        }

        SystemAvailabilityReport {
            system_availability_pct,
            active_zones: active.len(),
            flagged_zones,
            zones: lines,
            redundancy_level: redundancy,
            single_points_of_failure,
            unavailable_services,
            sla_target_pct: self.config.sla_target_pct,
            meets_sla,
            generated_at: self.clock.now(),
        }
    }

    /// Distinct zones holding healthy targets, per service across all balancers
    fn service_spread(&self) -> (Vec<String>, Vec<String>) {
        let mut spread: BTreeMap<String, BTreeSet<ZoneId>> = BTreeMap::new();
        for lb in self.balancers.list() {
            for target in lb.all_targets() {
                let zones = spread.entry(target.service.clone()).or_default();
                if target.status == TargetStatus::Healthy {
                    zones.insert(target.zone_id);
                }
            }
        }

        let spof = spread.iter().filter(|(_, z)| z.len() == 1).map(|(s, _)| s.clone()).collect();
        let down = spread.iter().filter(|(_, z)| z.is_empty()).map(|(s, _)| s.clone()).collect();
        (spof, down)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{Algorithm, LoadBalancerSpec, TargetSpec};
    use crate::ports::CheckType;
    use crate::testing::*;
    use crate::zone::{CapacitySpec, Resource, ResourceRequest, ServiceInstance, ZoneSpec};

    fn calculator(h: &Harness) -> AvailabilityCalculator {
        AvailabilityCalculator::new(
            AvailabilityReportConfig::default(),
            h.zones.clone(),
            h.balancers.clone(),
            h.clock.clone(),
        )
    }

    #[test]
    fn test_combined_availability() {
        let pct = combined_availability(&[99.0, 99.5, 98.0]);
        assert!((pct - (1.0 - 0.01 * 0.005 * 0.02) * 100.0).abs() < 1e-9);
        assert_eq!(combined_availability(&[]), 0.0);
        assert_eq!(combined_availability(&[100.0, 0.0]), 100.0);
    }

    #[test]
    fn test_report_only_counts_active_zones() {
        let h = harness();
        let a = h.zone("use1-a", "us-east");
        let b = h.zone("use1-b", "us-east");
        let c = h.zone("use1-c", "us-east");
        let d = h.zone("euw1-a", "eu-west");
        for (zone, pct) in [(&a, 99.0), (&b, 99.5), (&c, 98.0), (&d, 10.0)] {
            h.zones.record_health_check(zone.id, pct, true).unwrap();
        }
        h.zones.set_status(d.id, ZoneStatus::Degraded).unwrap();

        let report = calculator(&h).calculate();
        assert_eq!(report.active_zones, 3);
        assert_eq!(report.flagged_zones, vec![d.id]);
        assert!((report.system_availability_pct - 99.9999).abs() < 1e-6);
        assert!(!report.meets_sla);
        assert_eq!(report.zones.len(), 4);
    }

    #[test]
    fn test_no_active_zones() {
        let h = harness();
        let a = h.zone("use1-a", "us-east");
        h.zones.mark_offline(a.id, "decommissioned").unwrap();

        let report = calculator(&h).calculate();
        assert_eq!(report.system_availability_pct, 0.0);
        assert_eq!(report.redundancy_level, 0);
    }

    #[test]
    fn test_redundancy_level() {
        let h = harness();
        let busy = h.zone("use1-a", "us-east");
        h.zone("use1-b", "us-east");
        h.zones
            .register_zone(ZoneSpec {
                name: "use1-c".into(),
                region: "us-east".into(),
                provider: "test".into(),
                capacity: CapacitySpec { cpu_cores: 16.0, memory_gb: 64.0, storage_gb: 100.0, network_gbps: 10.0 },
                probe: None,
            })
            .unwrap();

        let mut instance = ServiceInstance::new(busy.id, "dns-resolver", "1.0.0", "10.1.0.1", 53);
        instance.resources = ResourceRequest { cpu_cores: 30.0, memory_gb: 100.0, ..Default::default() };
        h.zones.add_instance(instance).unwrap();

        // use1-b can take 30 cores / 100 GiB; use1-c cannot
        assert_eq!(calculator(&h).calculate().redundancy_level, 1);
    }

    #[test]
    fn test_redundancy_measures_absolute_load() {
        let zone = |total: f64, used: f64| ZoneCapacity {
            cpu: Resource { total, used },
            memory: Resource { total, used },
            ..Default::default()
        };
        // The small zone is fuller but the middle one carries the most work
        let capacities = [zone(10.0, 9.0), zone(100.0, 50.0), zone(60.0, 0.0)];
        assert_eq!(redundancy_level(&capacities), 1);
        assert_eq!(redundancy_level(&[zone(10.0, 1.0)]), 0);
        assert_eq!(redundancy_level(&[]), 0);
    }

    #[test]
    fn test_single_point_of_failure() {
        let h = harness();
        let a = h.zone("use1-a", "us-east");
        let b = h.zone("use1-b", "us-east");
        let lb = h
            .balancers
            .create(LoadBalancerSpec { name: "dns-api".into(), algorithm: Algorithm::RoundRobin, listeners: vec![] })
            .unwrap();
        let target = |zone: ZoneId, host: &str| TargetSpec {
            endpoint: host.into(),
            port: 8053,
            weight: 1,
            zone,
            service: None,
            instance_id: None,
            check: CheckType::Tcp,
        };
        lb.register_target(target(a.id, "10.1.0.1"), TargetStatus::Healthy).unwrap();
        lb.register_target(target(a.id, "10.1.0.2"), TargetStatus::Healthy).unwrap();
        lb.register_target(target(b.id, "10.2.0.1"), TargetStatus::Unhealthy).unwrap();

        let report = calculator(&h).calculate();
        assert_eq!(report.single_points_of_failure, vec!["dns-api".to_string()]);

        lb.register_target(target(b.id, "10.2.0.2"), TargetStatus::Healthy).unwrap();
        let report = calculator(&h).calculate();
        assert!(report.single_points_of_failure.is_empty());
        assert!(report.unavailable_services.is_empty());
    }
}
