//! Availability core configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilityConfig {
    pub health: HealthConfig,
    pub balancer: BalancerConfig,
    pub breaker: BreakerConfig,
    pub scaling: ScalingConfig,
    pub deployment: DeploymentConfig,
    pub report: AvailabilityReportConfig,
}

impl AvailabilityConfig {
    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the components cannot honor
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health.healthy_threshold == 0 || self.health.unhealthy_threshold == 0 {
            return Err(ConfigError::Invalid("health thresholds must be at least 1".into()));
        }
        if self.health.probe_timeout_ms >= self.health.target_interval_secs * 1000 {
            return Err(ConfigError::Invalid(
                "probe timeout must be shorter than the target probe interval".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.health.zone_failure_ratio) {
            return Err(ConfigError::Invalid("zone_failure_ratio must be within [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.breaker.error_rate_threshold) {
            return Err(ConfigError::Invalid("error_rate_threshold must be within [0, 1]".into()));
        }
        Ok(())
    }
}

/// Health monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub zone_interval_secs: u64,
    pub target_interval_secs: u64,
    pub probe_timeout_ms: u64,
    /// Consecutive successes before unhealthy -> healthy
    pub healthy_threshold: u32,
    /// Consecutive failures before healthy -> unhealthy
    pub unhealthy_threshold: u32,
    /// Weighted instance failure ratio that degrades a zone
    pub zone_failure_ratio: f64,
    pub offline_grace_secs: u64,
    pub offline_alert_after_secs: u64,
    /// Probe cycles kept for rolling zone availability
    pub availability_window: usize,
    pub transition_history: usize,
}

impl HealthConfig {
    pub fn zone_interval(&self) -> Duration {
        Duration::from_secs(self.zone_interval_secs)
    }

    pub fn target_interval(&self) -> Duration {
        Duration::from_secs(self.target_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn offline_grace(&self) -> Duration {
        Duration::from_secs(self.offline_grace_secs)
    }

    pub fn offline_alert_after(&self) -> Duration {
        Duration::from_secs(self.offline_alert_after_secs)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            zone_interval_secs: 60,
            target_interval_secs: 30,
            probe_timeout_ms: 5_000,
            healthy_threshold: 2,
            unhealthy_threshold: 3,
            zone_failure_ratio: 0.2,
            offline_grace_secs: 300,
            offline_alert_after_secs: 900,
            availability_window: 60,
            transition_history: 1_000,
        }
    }
}

/// Load balancer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub drain_timeout_secs: u64,
    /// Extra region distances layered over the built-in table
    pub region_distances: Vec<RegionDistance>,
}

impl BalancerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 300,
            region_distances: Vec::new(),
        }
    }
}

/// Distance between two regions, in arbitrary units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionDistance {
    pub from: String,
    pub to: String,
    pub distance: u32,
}

/// Circuit breaker defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failed/total ratio that opens the circuit
    pub error_rate_threshold: f64,
    /// Consecutive failures that open the circuit regardless of volume
    pub failure_threshold: u32,
    /// Minimum requests in the window before the error rate is trusted
    pub request_volume_threshold: u64,
    pub recovery_timeout_secs: u64,
    pub rolling_window_secs: u64,
    pub stuck_open_alert_after_secs: u64,
    pub history_limit: usize,
    /// Per-service overrides
    pub services: HashMap<String, BreakerOverride>,
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn rolling_window(&self) -> Duration {
        Duration::from_secs(self.rolling_window_secs)
    }

    pub fn stuck_open_alert_after(&self) -> Duration {
        Duration::from_secs(self.stuck_open_alert_after_secs)
    }

    /// Defaults with the service override applied
    pub fn for_service(&self, service: &str) -> BreakerConfig {
        let mut config = self.clone();
        config.services.clear();
        if let Some(o) = self.services.get(service) {
            if let Some(v) = o.error_rate_threshold {
                config.error_rate_threshold = v;
            }
            if let Some(v) = o.failure_threshold {
                config.failure_threshold = v;
            }
            if let Some(v) = o.request_volume_threshold {
                config.request_volume_threshold = v;
            }
            if let Some(v) = o.recovery_timeout_secs {
                config.recovery_timeout_secs = v;
            }
        }
        config
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            error_rate_threshold: 0.5,
            failure_threshold: 20,
            request_volume_threshold: 20,
            recovery_timeout_secs: 30,
            rolling_window_secs: 60,
            stuck_open_alert_after_secs: 600,
            history_limit: 100,
            services: HashMap::new(),
        }
    }
}

/// Per-service breaker override
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerOverride {
    pub error_rate_threshold: Option<f64>,
    pub failure_threshold: Option<u32>,
    pub request_volume_threshold: Option<u64>,
    pub recovery_timeout_secs: Option<u64>,
}

/// Auto-scaling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub evaluation_interval_secs: u64,
    /// Samples kept per metric for predictive policies
    pub history_len: usize,
    pub decision_history: usize,
}

impl ScalingConfig {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_secs)
    }
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: 60,
            history_len: 30,
            decision_history: 500,
        }
    }
}

/// Deployment orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub health_check_timeout_ms: u64,
    pub health_poll_interval_ms: u64,
    pub metrics_sample_interval_ms: u64,
}

impl DeploymentConfig {
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn metrics_sample_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_sample_interval_ms)
    }
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            health_check_timeout_ms: 300_000,
            health_poll_interval_ms: 5_000,
            metrics_sample_interval_ms: 10_000,
        }
    }
}

/// SLA reporting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilityReportConfig {
    /// Target system availability, percent
    pub sla_target_pct: f64,
}

impl Default for AvailabilityReportConfig {
    fn default() -> Self {
        Self { sla_target_pct: 99.99 }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AvailabilityConfig::default();
        assert_eq!(config.health.zone_interval(), Duration::from_secs(60));
        assert_eq!(config.health.target_interval(), Duration::from_secs(30));
        assert_eq!(config.health.healthy_threshold, 2);
        assert_eq!(config.health.unhealthy_threshold, 3);
        assert_eq!(config.balancer.drain_timeout(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: AvailabilityConfig =
            serde_json::from_str(r#"{"health": {"healthy_threshold": 4}}"#).unwrap();
        assert_eq!(config.health.healthy_threshold, 4);
        assert_eq!(config.health.unhealthy_threshold, 3);
        assert_eq!(config.scaling.evaluation_interval_secs, 60);
    }

    #[test]
    fn test_breaker_override() {
        let mut config = BreakerConfig::default();
        config.services.insert(
            "resolver".into(),
            BreakerOverride { error_rate_threshold: Some(0.1), ..Default::default() },
        );
        assert_eq!(config.for_service("resolver").error_rate_threshold, 0.1);
        assert_eq!(config.for_service("other").error_rate_threshold, 0.5);
    }

    #[test]
    fn test_rejects_timeout_longer_than_interval() {
        let mut config = AvailabilityConfig::default();
        config.health.probe_timeout_ms = 60_000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
