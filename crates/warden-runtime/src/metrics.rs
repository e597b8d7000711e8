use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Trait for metrics backends. Implementations can forward to Prometheus,
/// StatsD, or simply log metrics.
pub trait MetricsBackend: Send + Sync {
    fn record_counter(&self, name: &str, value: u64);
    fn record_gauge(&self, name: &str, value: f64);
}

/// Atomic counters for lifecycle, admission and gateway events.
pub struct GovernorMetrics {
    pub wakes_started: AtomicU64,
    pub wakes_completed: AtomicU64,
    pub wakes_failed: AtomicU64,
    pub wakes_coalesced: AtomicU64,
    pub wake_timeouts: AtomicU64,
    pub sleeps_completed: AtomicU64,
    pub sleeps_abandoned: AtomicU64,
    pub evictions: AtomicU64,
    pub integrity_failures: AtomicU64,
    pub breaker_opened: AtomicU64,
    pub rate_limited: AtomicU64,
    pub invocations: AtomicU64,
    backend: Option<Arc<dyn MetricsBackend>>,
}

impl std::fmt::Debug for GovernorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernorMetrics")
            .field("snapshot", &self.snapshot())
            .field("backend", &self.backend.is_some())
            .finish()
    }
}

impl Default for GovernorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &AtomicU64, by: u64) -> u64 {
    counter.fetch_add(by, Ordering::Relaxed) + by
}

impl GovernorMetrics {
    pub fn new() -> Self {
        Self {
            wakes_started: AtomicU64::new(0),
            wakes_completed: AtomicU64::new(0),
            wakes_failed: AtomicU64::new(0),
            wakes_coalesced: AtomicU64::new(0),
            wake_timeouts: AtomicU64::new(0),
            sleeps_completed: AtomicU64::new(0),
            sleeps_abandoned: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            integrity_failures: AtomicU64::new(0),
            breaker_opened: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            invocations: AtomicU64::new(0),
            backend: None,
        }
    }

    pub fn with_backend(backend: Arc<dyn MetricsBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new()
        }
    }

    fn count(&self, counter: &AtomicU64, name: &str, by: u64) {
        let val = bump(counter, by);
        if let Some(backend) = &self.backend {
            backend.record_counter(name, val);
        }
    }

    pub fn record_wake_started(&self) {
        self.count(&self.wakes_started, "warden.lifecycle.wakes_started", 1);
    }

    pub fn record_wake_completed(&self) {
        self.count(&self.wakes_completed, "warden.lifecycle.wakes_completed", 1);
    }

    pub fn record_wake_failed(&self) {
        self.count(&self.wakes_failed, "warden.lifecycle.wakes_failed", 1);
    }

    pub fn record_wake_coalesced(&self) {
        self.count(&self.wakes_coalesced, "warden.lifecycle.wakes_coalesced", 1);
    }

    pub fn record_wake_timeout(&self) {
        self.count(&self.wake_timeouts, "warden.lifecycle.wake_timeouts", 1);
    }

    pub fn record_sleep_completed(&self) {
        self.count(&self.sleeps_completed, "warden.lifecycle.sleeps_completed", 1);
    }

    pub fn record_sleep_abandoned(&self) {
        self.count(&self.sleeps_abandoned, "warden.lifecycle.sleeps_abandoned", 1);
    }

    pub fn record_evictions(&self, victims: usize) {
        self.count(&self.evictions, "warden.admission.evictions", victims as u64);
    }

    pub fn record_integrity_failure(&self) {
        self.count(
            &self.integrity_failures,
            "warden.snapshots.integrity_failures",
            1,
        );
    }

    pub fn record_breaker_opened(&self) {
        self.count(&self.breaker_opened, "warden.gateway.breaker_opened", 1);
    }

    pub fn record_rate_limited(&self) {
        self.count(&self.rate_limited, "warden.gateway.rate_limited", 1);
    }

    pub fn record_invocation(&self) {
        self.count(&self.invocations, "warden.gateway.invocations", 1);
    }

    /// Report current budget usage as gauges.
    pub fn record_budget(&self, allocated: u64, capacity: u64) {
        if let Some(backend) = &self.backend {
            backend.record_gauge("warden.admission.allocated", allocated as f64);
            backend.record_gauge("warden.admission.capacity", capacity as f64);
        }
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            wakes_started: load(&self.wakes_started),
            wakes_completed: load(&self.wakes_completed),
            wakes_failed: load(&self.wakes_failed),
            wakes_coalesced: load(&self.wakes_coalesced),
            wake_timeouts: load(&self.wake_timeouts),
            sleeps_completed: load(&self.sleeps_completed),
            sleeps_abandoned: load(&self.sleeps_abandoned),
            evictions: load(&self.evictions),
            integrity_failures: load(&self.integrity_failures),
            breaker_opened: load(&self.breaker_opened),
            rate_limited: load(&self.rate_limited),
            invocations: load(&self.invocations),
        }
    }
}

/// A point-in-time snapshot of governor metrics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub wakes_started: u64,
    pub wakes_completed: u64,
    pub wakes_failed: u64,
    pub wakes_coalesced: u64,
    pub wake_timeouts: u64,
    pub sleeps_completed: u64,
    pub sleeps_abandoned: u64,
    pub evictions: u64,
    pub integrity_failures: u64,
    pub breaker_opened: u64,
    pub rate_limited: u64,
    pub invocations: u64,
}

/// Logging-based metrics backend. Emits metrics as structured log events.
pub struct LoggingMetricsBackend;

impl MetricsBackend for LoggingMetricsBackend {
    fn record_counter(&self, name: &str, value: u64) {
        tracing::info!(metric = name, value = value, kind = "counter", "metric");
    }

    fn record_gauge(&self, name: &str, value: f64) {
        tracing::info!(metric = name, value = value, kind = "gauge", "metric");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<(String, u64)>>);

    impl MetricsBackend for Recording {
        fn record_counter(&self, name: &str, value: u64) {
            self.0.lock().unwrap().push((name.to_string(), value));
        }

        fn record_gauge(&self, _name: &str, _value: f64) {}
    }

    #[test]
    fn default_metrics_start_at_zero() {
        let snap = GovernorMetrics::new().snapshot();
        assert_eq!(snap.wakes_started, 0);
        assert_eq!(snap.evictions, 0);
        assert_eq!(snap.invocations, 0);
    }

    #[test]
    fn counters_increment_correctly() {
        let metrics = GovernorMetrics::new();
        metrics.record_wake_started();
        metrics.record_wake_started();
        metrics.record_wake_completed();
        metrics.record_wake_coalesced();
        metrics.record_evictions(3);
        metrics.record_integrity_failure();

        let snap = metrics.snapshot();
        assert_eq!(snap.wakes_started, 2);
        assert_eq!(snap.wakes_completed, 1);
        assert_eq!(snap.wakes_coalesced, 1);
        assert_eq!(snap.evictions, 3);
        assert_eq!(snap.integrity_failures, 1);
    }

    #[test]
    fn backend_sees_running_totals() {
        let backend = Arc::new(Recording::default());
        let metrics = GovernorMetrics::with_backend(backend.clone());
        metrics.record_rate_limited();
        metrics.record_rate_limited();

        let seen = backend.0.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("warden.gateway.rate_limited".to_string(), 1),
                ("warden.gateway.rate_limited".to_string(), 2),
            ]
        );
    }

    #[test]
    fn with_logging_backend() {
        let metrics = GovernorMetrics::with_backend(Arc::new(LoggingMetricsBackend));
        metrics.record_invocation();
        metrics.record_budget(10, 100);
        assert_eq!(metrics.snapshot().invocations, 1);
    }

    #[test]
    fn concurrent_increments() {
        let metrics = Arc::new(GovernorMetrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = Arc::clone(&metrics);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    m.record_invocation();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.snapshot().invocations, 1000);
    }
}
