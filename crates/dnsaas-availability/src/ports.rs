//! Collaborator ports
//!
//! The core talks to infrastructure only through these traits. Network
//! implementations live here too; tests plug in scripted doubles.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use dnsaas_common::{AvailabilityError, AvailabilityResult, ZoneId};

use crate::metrics::MetricSnapshot;
use crate::zone::ServiceInstance;

/// Health check type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckType {
    Tcp,
    Http { path: String, expected_status: u16 },
}

impl Default for CheckType {
    fn default() -> Self {
        Self::Tcp
    }
}

/// What to probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub check: CheckType,
}

impl ProbeSpec {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, check: CheckType::Tcp }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Result of one probe
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Success { latency_ms: u64 },
    Failure { reason: String },
    Timeout,
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Executes a single health probe
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, spec: &ProbeSpec) -> ProbeOutcome;
}

/// Instance launch request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub zone_id: ZoneId,
    pub service_type: String,
    pub version: String,
}

/// Creates and destroys instances
#[async_trait]
pub trait ProvisioningProvider: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> AvailabilityResult<ServiceInstance>;
    async fn terminate(&self, instance: &ServiceInstance) -> AvailabilityResult<()>;
}

/// Supplies per-instance metric samples
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn sample(&self, instance: &ServiceInstance) -> AvailabilityResult<MetricSnapshot>;
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Operator-facing alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub severity: AlertSeverity,
    pub source: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Delivers operator alerts
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: OperatorAlert);
}

/// Logs alerts through `tracing`
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: OperatorAlert) {
        match alert.severity {
            AlertSeverity::Critical => {
                tracing::error!(source = %alert.source, "{}", alert.message)
            }
            AlertSeverity::Warning => tracing::warn!(source = %alert.source, "{}", alert.message),
            AlertSeverity::Info => tracing::info!(source = %alert.source, "{}", alert.message),
        }
    }
}

/// TCP connect / HTTP GET prober
///
/// Callers bound the probe with their own timeout; the client timeout here is
/// only a backstop.
pub struct NetworkProber {
    client: reqwest::Client,
}

impl NetworkProber {
    pub fn new(timeout: Duration) -> AvailabilityResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AvailabilityError::InvalidConfig(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, spec: &ProbeSpec) -> ProbeOutcome {
        let start = Instant::now();
        match &spec.check {
            CheckType::Tcp => {
                match tokio::net::TcpStream::connect((spec.host.as_str(), spec.port)).await {
                    Ok(_) => ProbeOutcome::Success { latency_ms: start.elapsed().as_millis() as u64 },
                    Err(e) => ProbeOutcome::Failure { reason: format!("tcp connect failed: {}", e) },
                }
            }
            CheckType::Http { path, expected_status } => {
                let url = format!("http://{}:{}{}", spec.host, spec.port, path);
                match self.client.get(&url).send().await {
                    Ok(resp) if resp.status().as_u16() == *expected_status => {
                        ProbeOutcome::Success { latency_ms: start.elapsed().as_millis() as u64 }
                    }
                    Ok(resp) => ProbeOutcome::Failure {
                        reason: format!("HTTP {} (expected {})", resp.status().as_u16(), expected_status),
                    },
                    Err(e) if e.is_timeout() => ProbeOutcome::Timeout,
                    Err(e) => ProbeOutcome::Failure { reason: e.to_string() },
                }
            }
        }
    }
}

/// Provisioning service reached over HTTP
///
/// `POST {base}/instances` launches, `DELETE {base}/instances/{id}` terminates.
pub struct HttpProvisioner {
    base_url: String,
    client: reqwest::Client,
}

impl HttpProvisioner {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProvisioningProvider for HttpProvisioner {
    async fn launch(&self, request: &LaunchRequest) -> AvailabilityResult<ServiceInstance> {
        let resp = self
            .client
            .post(format!("{}/instances", self.base_url))
            .json(request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AvailabilityError::Provider(e.to_string()))?;
        resp.json::<ServiceInstance>()
            .await
            .map_err(|e| AvailabilityError::Provider(e.to_string()))
    }

    async fn terminate(&self, instance: &ServiceInstance) -> AvailabilityResult<()> {
        self.client
            .delete(format!("{}/instances/{}", self.base_url, instance.id))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AvailabilityError::Provider(e.to_string()))?;
        Ok(())
    }
}

/// Usage/metrics service reached over HTTP
///
/// `GET {base}/instances/{id}/metrics` returns a [`MetricSnapshot`].
pub struct HttpMetricsProvider {
    base_url: String,
    client: reqwest::Client,
}

impl HttpMetricsProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MetricsProvider for HttpMetricsProvider {
    async fn sample(&self, instance: &ServiceInstance) -> AvailabilityResult<MetricSnapshot> {
        self.client
            .get(format!("{}/instances/{}/metrics", self.base_url, instance.id))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AvailabilityError::Provider(e.to_string()))?
            .json::<MetricSnapshot>()
            .await
            .map_err(|e| AvailabilityError::Provider(e.to_string()))
    }
}
