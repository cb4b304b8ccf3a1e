//! Instance metric snapshots

use serde::{Deserialize, Serialize};

/// Metrics a scaling policy can track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    CpuUtilization,
    MemoryUtilization,
    NetworkUtilization,
    RequestRate,
    LatencyMs,
    ErrorRate,
}

/// Point-in-time resource/metric reading
///
/// Utilizations are percentages (0-100); `error_rate` is a fraction (0-1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricSnapshot {
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
    pub network_utilization: f64,
    pub request_rate: f64,
    pub latency_ms: f64,
    pub error_rate: f64,
}

impl MetricSnapshot {
    pub fn value(&self, metric: MetricType) -> f64 {
        match metric {
            MetricType::CpuUtilization => self.cpu_utilization,
            MetricType::MemoryUtilization => self.memory_utilization,
            MetricType::NetworkUtilization => self.network_utilization,
            MetricType::RequestRate => self.request_rate,
            MetricType::LatencyMs => self.latency_ms,
            MetricType::ErrorRate => self.error_rate,
        }
    }

    /// Mean of every field; `None` for an empty slice
    pub fn mean(samples: &[MetricSnapshot]) -> Option<MetricSnapshot> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let sum = samples.iter().fold(MetricSnapshot::default(), |acc, s| MetricSnapshot {
            cpu_utilization: acc.cpu_utilization + s.cpu_utilization,
            memory_utilization: acc.memory_utilization + s.memory_utilization,
            network_utilization: acc.network_utilization + s.network_utilization,
            request_rate: acc.request_rate + s.request_rate,
            latency_ms: acc.latency_ms + s.latency_ms,
            error_rate: acc.error_rate + s.error_rate,
        });
        Some(MetricSnapshot {
            cpu_utilization: sum.cpu_utilization / n,
            memory_utilization: sum.memory_utilization / n,
            network_utilization: sum.network_utilization / n,
            request_rate: sum.request_rate / n,
            latency_ms: sum.latency_ms / n,
            error_rate: sum.error_rate / n,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean() {
        let a = MetricSnapshot { cpu_utilization: 60.0, error_rate: 0.02, ..Default::default() };
        let b = MetricSnapshot { cpu_utilization: 100.0, error_rate: 0.04, ..Default::default() };
        let mean = MetricSnapshot::mean(&[a, b]).unwrap();
        assert_eq!(mean.value(MetricType::CpuUtilization), 80.0);
        assert!((mean.error_rate - 0.03).abs() < 1e-9);
        assert!(MetricSnapshot::mean(&[]).is_none());
    }
}
