//! Circuit Breaker Bank
//!
//! ```text
//! Closed --(error rate >= threshold, volume met)--> Open
//! Open   --(recovery timeout elapsed, next call)--> HalfOpen
//! HalfOpen --(trial succeeds)--> Closed
//! HalfOpen --(trial fails)-----> Open
//! ```
//!
//! Request counters are atomics. State transitions, the rolling error-rate
//! window and the half-open trial slot sit behind one mutex per breaker.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dnsaas_common::clock::to_chrono;
use dnsaas_common::{AvailabilityError, AvailabilityResult, Clock};

use crate::config::BreakerConfig;
use crate::ports::{AlertSeverity, Notifier, OperatorAlert};

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Immutable record of a transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStateChange {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Lifetime request counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerMetrics {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub succeeded_requests: u64,
    pub rejected_requests: u64,
    pub average_latency_ms: f64,
}

/// Point-in-time breaker view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub error_rate_threshold: f64,
    pub failure_threshold: u32,
    pub request_volume_threshold: u64,
    pub metrics: BreakerMetrics,
    pub window_requests: u64,
    pub window_failures: u64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub history: Vec<CircuitBreakerStateChange>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    window_start: DateTime<Utc>,
    window_requests: u64,
    window_failures: u64,
    consecutive_failures: u32,
    next_retry_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    stuck_alerted: bool,
    history: VecDeque<CircuitBreakerStateChange>,
}

impl BreakerState {
    fn roll_window(&mut self, now: DateTime<Utc>, window: Duration) {
        if now - self.window_start >= to_chrono(window) {
            self.reset_window(now);
        }
    }

    fn reset_window(&mut self, now: DateTime<Utc>) {
        self.window_start = now;
        self.window_requests = 0;
        self.window_failures = 0;
    }

    fn error_rate(&self) -> f64 {
        if self.window_requests == 0 {
            0.0
        } else {
            self.window_failures as f64 / self.window_requests as f64
        }
    }
}

/// Per-service circuit breaker
pub struct CircuitBreaker {
    service: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    succeeded_requests: AtomicU64,
    rejected_requests: AtomicU64,
    /// Latency EMA in microseconds
    avg_latency_us: AtomicU64,
    inner: Mutex<BreakerState>,
}

const LATENCY_EMA_ALPHA: f64 = 0.2;

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            service: service.into(),
            config,
            clock,
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            succeeded_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
            avg_latency_us: AtomicU64::new(0),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                window_start: now,
                window_requests: 0,
                window_failures: 0,
                consecutive_failures: 0,
                next_retry_at: None,
                opened_at: None,
                trial_in_flight: false,
                stuck_alerted: false,
                history: VecDeque::new(),
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Admit or reject a request
    ///
    /// An open circuit past its retry time moves to half-open and admits the
    /// caller as the single trial request.
    pub fn try_acquire(&self) -> AvailabilityResult<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let retry_at = inner.next_retry_at.unwrap_or(now);
                if now >= retry_at {
                    self.transition(&mut inner, CircuitState::HalfOpen, now, "recovery timeout elapsed");
                    inner.trial_in_flight = true;
                    Ok(())
                } else {
                    self.reject(retry_at)
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    self.reject(inner.next_retry_at.unwrap_or(now))
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn reject(&self, retry_at: DateTime<Utc>) -> AvailabilityResult<()> {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
        Err(AvailabilityError::CircuitOpen { service: self.service.clone(), retry_at })
    }

    pub fn record_success(&self, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.succeeded_requests.fetch_add(1, Ordering::Relaxed);
        self.update_latency(latency);

        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.roll_window(now, self.config.rolling_window());
        inner.window_requests += 1;
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            self.transition(&mut inner, CircuitState::Closed, now, "trial request succeeded");
        }
    }

    pub fn record_failure(&self, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.update_latency(latency);

        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.roll_window(now, self.config.rolling_window());
        inner.window_requests += 1;
        inner.window_failures += 1;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open, now, "trial request failed");
            }
            CircuitState::Closed => {
                let rate = inner.error_rate();
                if inner.window_requests >= self.config.request_volume_threshold
                    && rate >= self.config.error_rate_threshold
                {
                    let reason = format!(
                        "error rate {:.1}% over {} requests",
                        rate * 100.0,
                        inner.window_requests
                    );
                    self.transition(&mut inner, CircuitState::Open, now, &reason);
                } else if inner.consecutive_failures >= self.config.failure_threshold {
                    let reason = format!("{} consecutive failures", inner.consecutive_failures);
                    self.transition(&mut inner, CircuitState::Open, now, &reason);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Run `f` behind the breaker, recording its outcome
    pub async fn call<T, F, Fut>(&self, f: F) -> AvailabilityResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AvailabilityResult<T>>,
    {
        self.try_acquire()?;
        let call = AdmittedCall { breaker: self, start: Instant::now(), finished: false };
        let result = f().await;
        call.finish(result.is_ok());
        result
    }

    /// Force the circuit closed
    pub fn reset(&self, reason: &str) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed, now, reason);
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState, now: DateTime<Utc>, reason: &str) {
        let from = inner.state;
        inner.state = to;
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
        inner.reset_window(now);

        match to {
            CircuitState::Open => {
                inner.next_retry_at = Some(now + to_chrono(self.config.recovery_timeout()));
                if from == CircuitState::Closed {
                    inner.opened_at = Some(now);
                    inner.stuck_alerted = false;
                }
                tracing::warn!(service = %self.service, ?from, "Circuit opened: {}", reason);
            }
            CircuitState::HalfOpen => {
                tracing::info!(service = %self.service, "Circuit half-open: {}", reason);
            }
            CircuitState::Closed => {
                inner.next_retry_at = None;
                inner.opened_at = None;
                tracing::info!(service = %self.service, ?from, "Circuit closed: {}", reason);
            }
        }

        inner.history.push_back(CircuitBreakerStateChange { from, to, at: now, reason: reason.to_string() });
        while inner.history.len() > self.config.history_limit.max(1) {
            inner.history.pop_front();
        }
    }

    fn update_latency(&self, latency: Duration) {
        let sample = latency.as_micros().min(u64::MAX as u128) as u64;
        let _ = self
            .avg_latency_us
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == 0 {
                    Some(sample)
                } else {
                    Some((LATENCY_EMA_ALPHA * sample as f64 + (1.0 - LATENCY_EMA_ALPHA) * current as f64) as u64)
                }
            });
    }

    pub fn metrics(&self) -> BreakerMetrics {
        BreakerMetrics {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            succeeded_requests: self.succeeded_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            average_latency_ms: self.avg_latency_us.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }

    pub fn history(&self) -> Vec<CircuitBreakerStateChange> {
        self.inner.lock().history.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            service: self.service.clone(),
            state: inner.state,
            error_rate_threshold: self.config.error_rate_threshold,
            failure_threshold: self.config.failure_threshold,
            request_volume_threshold: self.config.request_volume_threshold,
            metrics: self.metrics(),
            window_requests: inner.window_requests,
            window_failures: inner.window_failures,
            next_retry_at: inner.next_retry_at,
            opened_at: inner.opened_at,
            history: inner.history.iter().cloned().collect(),
        }
    }

    /// Alert once per open episode that outlasts the threshold
    fn stuck_open_alert(&self, now: DateTime<Utc>) -> Option<OperatorAlert> {
        let mut inner = self.inner.lock();
        let opened_at = match inner.state {
            CircuitState::Open | CircuitState::HalfOpen => inner.opened_at?,
            CircuitState::Closed => return None,
        };
        if inner.stuck_alerted || now - opened_at < to_chrono(self.config.stuck_open_alert_after()) {
            return None;
        }
        inner.stuck_alerted = true;
        Some(OperatorAlert {
            severity: AlertSeverity::Critical,
            source: format!("circuit-breaker/{}", self.service),
            message: format!("circuit for {} open since {}", self.service, opened_at.to_rfc3339()),
            raised_at: now,
        })
    }
}

/// An admitted call; dropping it unfinished counts as a failure so a
/// cancelled half-open trial does not hold the trial slot forever
struct AdmittedCall<'a> {
    breaker: &'a CircuitBreaker,
    start: Instant,
    finished: bool,
}

impl AdmittedCall<'_> {
    fn finish(mut self, ok: bool) {
        self.finished = true;
        if ok {
            self.breaker.record_success(self.start.elapsed());
        } else {
            self.breaker.record_failure(self.start.elapsed());
        }
    }
}

impl Drop for AdmittedCall<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(service = %self.breaker.service, "Call dropped before completing");
            self.breaker.record_failure(self.start.elapsed());
        }
    }
}

/// One breaker per protected service, created on first use
pub struct CircuitBreakerBank {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerBank {
    pub fn new(config: BreakerConfig, notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>) -> Self {
        Self { config, breakers: DashMap::new(), notifier, clock }
    }

    /// Breaker for a service, created with its configured settings if missing
    pub fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(service, self.config.for_service(service), self.clock.clone()))
            })
            .clone()
    }

    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service).map(|b| b.clone())
    }

    pub async fn call<T, F, Fut>(&self, service: &str, f: F) -> AvailabilityResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AvailabilityResult<T>>,
    {
        self.breaker(service).call(f).await
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut all: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }

    /// Notify operators about breakers stuck open; returns how many alerted
    pub async fn check_stuck_open(&self) -> usize {
        let now = self.clock.now();
        let alerts: Vec<_> = self.breakers.iter().filter_map(|b| b.stuck_open_alert(now)).collect();
        let count = alerts.len();
        for alert in alerts {
            self.notifier.notify(alert).await;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingNotifier;
    use dnsaas_common::ManualClock;
    use std::sync::atomic::AtomicU32;

    fn breaker(clock: &Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new("zone-api", BreakerConfig::default(), clock.clone())
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_opens_on_error_rate_with_volume() {
        let clock = Arc::new(ManualClock::default());
        let cb = breaker(&clock);
        for _ in 0..10 {
            cb.record_success(ms(5));
        }
        for _ in 0..9 {
            cb.record_failure(ms(5));
        }
        // 9 of 19: below volume threshold
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure(ms(5));
        assert_eq!(cb.state(), CircuitState::Open);
        let err = cb.try_acquire().unwrap_err();
        assert_eq!(err.code(), "CIRCUIT_OPEN");
        assert_eq!(cb.metrics().rejected_requests, 1);
        assert_eq!(cb.history().len(), 1);
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let clock = Arc::new(ManualClock::default());
        let cb = breaker(&clock);
        for _ in 0..20 {
            cb.record_failure(ms(1));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(29));
        assert!(cb.try_acquire().is_err());

        clock.advance(Duration::from_secs(1));
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_err());

        cb.record_failure(ms(1));
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.next_retry_at, Some(clock.now() + chrono::Duration::seconds(30)));

        clock.advance(Duration::from_secs(30));
        assert!(cb.try_acquire().is_ok());
        cb.record_success(ms(1));
        assert_eq!(cb.state(), CircuitState::Closed);

        let path: Vec<_> = cb.history().iter().map(|c| c.to).collect();
        assert_eq!(
            path,
            [
                CircuitState::Open,
                CircuitState::HalfOpen,
                CircuitState::Open,
                CircuitState::HalfOpen,
                CircuitState::Closed
            ]
        );
    }

    #[test]
    fn test_rolling_window_expires_old_failures() {
        let clock = Arc::new(ManualClock::default());
        let cb = breaker(&clock);
        for _ in 0..15 {
            cb.record_failure(ms(1));
        }
        clock.advance(Duration::from_secs(61));
        for _ in 0..15 {
            cb.record_success(ms(1));
        }
        for _ in 0..4 {
            cb.record_failure(ms(1));
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().window_requests, 19);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_downstream() {
        let clock = Arc::new(ManualClock::default());
        let bank = CircuitBreakerBank::new(
            BreakerConfig::default(),
            Arc::new(RecordingNotifier::default()),
            clock.clone(),
        );
        let calls = AtomicU32::new(0);

        for _ in 0..20 {
            let result: AvailabilityResult<()> = bank
                .call("dns-api", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AvailabilityError::Provider("upstream 500".into()))
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 20);

        let result = bank
            .call("dns-api", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(AvailabilityError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_dropped_trial_reopens_circuit() {
        let clock = Arc::new(ManualClock::default());
        let cb = breaker(&clock);
        for _ in 0..20 {
            cb.record_failure(ms(1));
        }
        clock.advance(Duration::from_secs(30));

        let abandoned = tokio::time::timeout(
            ms(10),
            cb.call(|| std::future::pending::<AvailabilityResult<()>>()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(30));
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success(ms(1));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_stuck_open_alert_once() {
        let clock = Arc::new(ManualClock::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let bank = CircuitBreakerBank::new(BreakerConfig::default(), notifier.clone(), clock.clone());
        let cb = bank.breaker("billing-sync");
        for _ in 0..20 {
            cb.record_failure(ms(1));
        }

        clock.advance(Duration::from_secs(599));
        assert_eq!(bank.check_stuck_open().await, 0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(bank.check_stuck_open().await, 1);
        assert_eq!(bank.check_stuck_open().await, 0);
        assert_eq!(notifier.alerts()[0].source, "circuit-breaker/billing-sync");
    }

    #[test]
    fn test_service_override_applies() {
        let clock = Arc::new(ManualClock::default());
        let mut config = BreakerConfig::default();
        config.services.insert(
            "zone-transfer".into(),
            crate::config::BreakerOverride { failure_threshold: Some(3), ..Default::default() },
        );
        let bank = CircuitBreakerBank::new(config, Arc::new(RecordingNotifier::default()), clock);
        let cb = bank.breaker("zone-transfer");
        for _ in 0..3 {
            cb.record_failure(ms(1));
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(bank.breaker("other").snapshot().failure_threshold, 20);
    }
}
