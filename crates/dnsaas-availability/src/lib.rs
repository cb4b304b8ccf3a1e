//! DNSaaS Availability & Traffic Management Core
//!
//! Keeps DNS services reachable across availability zones.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        AVAILABILITY CORE                                │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                      HEALTH MONITOR                              │   │
//! │  │   Zone probes | Target probes (TCP/HTTP) | Hysteresis            │   │
//! │  └──────────────────────────────┬──────────────────────────────────┘   │
//! │                                 │ transitions                          │
//! │  ┌──────────────┐  ┌────────────▼─┐  ┌──────────────┐  ┌─────────────┐ │
//! │  │    Zone      │  │    Load      │  │   Scaling    │  │ Deployment  │ │
//! │  │   Registry   │  │  Balancers   │  │    Engine    │  │Orchestrator │ │
//! │  └──────────────┘  └──────────────┘  └──────────────┘  └─────────────┘ │
//! │                                                                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐                  │
//! │  │   Circuit    │  │ Availability │  │    Chaos     │                  │
//! │  │   Breakers   │  │  Calculator  │  │    Engine    │                  │
//! │  └──────────────┘  └──────────────┘  └──────────────┘                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(clippy::all)]

pub mod availability;
pub mod balancer;
pub mod breaker;
pub mod chaos;
pub mod config;
pub mod deploy;
pub mod health;
pub mod metrics;
pub mod ports;
pub mod scaling;
pub mod zone;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};

use dnsaas_common::{Clock, SystemClock};

pub use availability::{AvailabilityCalculator, SystemAvailabilityReport};
pub use balancer::{Algorithm, LoadBalancer, LoadBalancerRegistry, LoadBalancerSpec, RequestContext, TargetSpec};
pub use breaker::{CircuitBreaker, CircuitBreakerBank, CircuitState};
pub use chaos::{ChaosEngine, ChaosExperiment, FaultInjectingProber};
pub use config::{AvailabilityConfig, ConfigError};
pub use deploy::{DeploymentOrchestrator, DeploymentRequest, DeploymentSession, DeploymentStatus};
pub use health::{HealthMonitor, TargetStatus};
pub use scaling::{ScalingEngine, ScalingGroupSpec};
pub use zone::{ZoneRegistry, ZoneSpec, ZoneStatus};

use ports::{MetricsProvider, Notifier, Prober, ProvisioningProvider};

/// Infrastructure the core talks to
pub struct Ports {
    pub prober: Arc<dyn Prober>,
    pub provisioner: Arc<dyn ProvisioningProvider>,
    pub metrics: Arc<dyn MetricsProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

impl Ports {
    /// Ports on the system clock
    pub fn new(
        prober: Arc<dyn Prober>,
        provisioner: Arc<dyn ProvisioningProvider>,
        metrics: Arc<dyn MetricsProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self { prober, provisioner, metrics, notifier, clock: Arc::new(SystemClock) }
    }
}

/// All components, wired together
pub struct AvailabilityCore {
    pub config: AvailabilityConfig,
    pub zones: Arc<ZoneRegistry>,
    pub monitor: Arc<HealthMonitor>,
    pub balancers: Arc<LoadBalancerRegistry>,
    pub breakers: Arc<CircuitBreakerBank>,
    pub scaling: Arc<ScalingEngine>,
    pub deployments: Arc<DeploymentOrchestrator>,
    pub calculator: Arc<AvailabilityCalculator>,
    pub chaos: Arc<ChaosEngine>,
}

impl AvailabilityCore {
    pub fn new(config: AvailabilityConfig, ports: Ports) -> Self {
        let clock = ports.clock;
        let zones = Arc::new(ZoneRegistry::new(clock.clone()));
        let chaos_prober = Arc::new(FaultInjectingProber::new(ports.prober));
        let monitor = Arc::new(HealthMonitor::new(
            config.health.clone(),
            zones.clone(),
            chaos_prober.clone(),
            ports.metrics,
            ports.notifier.clone(),
            clock.clone(),
        ));
        let balancers = Arc::new(LoadBalancerRegistry::new(
            config.balancer.clone(),
            zones.clone(),
            monitor.clone(),
            clock.clone(),
        ));
        let breakers = Arc::new(CircuitBreakerBank::new(config.breaker.clone(), ports.notifier.clone(), clock.clone()));
        let scaling = Arc::new(ScalingEngine::new(
            config.scaling.clone(),
            zones.clone(),
            monitor.clone(),
            balancers.clone(),
            ports.provisioner.clone(),
            clock.clone(),
        ));
        let deployments = Arc::new(DeploymentOrchestrator::new(
            config.deployment.clone(),
            zones.clone(),
            monitor.clone(),
            balancers.clone(),
            scaling.clone(),
            ports.provisioner,
            ports.notifier,
            clock.clone(),
        ));
        let calculator = Arc::new(AvailabilityCalculator::new(
            config.report.clone(),
            zones.clone(),
            balancers.clone(),
            clock.clone(),
        ));
        let chaos = Arc::new(ChaosEngine::new(
            chaos_prober,
            zones.clone(),
            monitor.clone(),
            balancers.clone(),
            calculator.clone(),
            clock,
        ));

        Self { config, zones, monitor, balancers, breakers, scaling, deployments, calculator, chaos }
    }

    /// Drive the background loops until shutdown
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();
        tasks.spawn(self.monitor.clone().run(shutdown.clone()));
        tasks.spawn(self.scaling.clone().run(shutdown.clone()));

        let balancers = self.balancers.clone();
        let breakers = self.breakers.clone();
        let period = self.config.health.target_interval();
        let mut stop = shutdown;
        tasks.spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let reaped = balancers.reap_drained();
                        if reaped > 0 {
                            tracing::info!(reaped, "Retired drained targets");
                        }
                        breakers.check_stuck_open().await;
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Background task failed: {}", e);
            }
        }
        tracing::info!("Availability core stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_core_runs_until_shutdown() {
        let core = AvailabilityCore::new(
            AvailabilityConfig::default(),
            Ports::new(
                Arc::new(ScriptedProber::default()),
                Arc::new(FakeProvisioner::default()),
                Arc::new(FakeMetrics::default()),
                Arc::new(RecordingNotifier::default()),
            ),
        );
        core.zones
            .register_zone(ZoneSpec {
                name: "use1-a".into(),
                region: "us-east".into(),
                provider: "test".into(),
                capacity: Default::default(),
                probe: None,
            })
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let stopper = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
        };
        let (_, ()) = tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(core.run(rx), stopper) })
            .await
            .unwrap();

        let report = core.calculator.calculate();
        assert_eq!(report.active_zones, 1);
    }
}
