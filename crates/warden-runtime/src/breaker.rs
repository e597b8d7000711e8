use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use warden_core::WardenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// What a caller was let through as. A probe is the single HalfOpen trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Normal,
    Probe,
}

/// Per-component circuit breaker.
#[derive(Debug, Clone)]
pub struct BreakerRecord {
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: Option<Instant>,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    probe_in_flight: bool,
}

impl BreakerRecord {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            probe_in_flight: false,
        }
    }

    fn transition(&mut self, to: BreakerState, now: Instant) {
        self.state = to;
        self.failure_count = 0;
        self.success_count = 0;
        self.probe_in_flight = false;
        self.opened_at = (to == BreakerState::Open).then_some(now);
    }

    /// Admit a call, or `None` if it must be rejected.
    pub fn try_acquire(&mut self, now: Instant) -> Option<Permit> {
        match self.state {
            BreakerState::Closed => Some(Permit::Normal),
            BreakerState::Open => {
                let opened = self.opened_at.unwrap_or(now);
                if now.saturating_duration_since(opened) < self.reset_timeout {
                    return None;
                }
                self.transition(BreakerState::HalfOpen, now);
                self.probe_in_flight = true;
                Some(Permit::Probe)
            }
            BreakerState::HalfOpen if self.probe_in_flight => None,
            BreakerState::HalfOpen => {
                self.probe_in_flight = true;
                Some(Permit::Probe)
            }
        }
    }

    pub fn on_success(&mut self, permit: Permit, now: Instant) {
        match (permit, self.state) {
            (Permit::Probe, BreakerState::HalfOpen) => self.transition(BreakerState::Closed, now),
            (_, BreakerState::Closed) => {
                self.failure_count = 0;
                self.success_count += 1;
            }
            _ => {}
        }
    }

    /// Returns true when this failure opened the breaker.
    pub fn on_failure(&mut self, permit: Permit, now: Instant) -> bool {
        match (permit, self.state) {
            (Permit::Probe, BreakerState::HalfOpen) => {
                self.transition(BreakerState::Open, now);
                true
            }
            (_, BreakerState::Closed) => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    self.transition(BreakerState::Open, now);
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// The permitted call never reached the component; release the probe
    /// slot without counting anything.
    pub fn abandon(&mut self, permit: Permit) {
        if permit == Permit::Probe && self.state == BreakerState::HalfOpen {
            self.probe_in_flight = false;
        }
    }
}

/// Breakers for every component, created Closed on first use.
pub struct CircuitBreakers {
    failure_threshold: u32,
    reset_timeout: Duration,
    records: Mutex<HashMap<String, BreakerRecord>>,
}

impl CircuitBreakers {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, component_id: &str) -> Result<Permit, WardenError> {
        let mut records = self.records.lock().await;
        let record = records
            .entry(component_id.to_string())
            .or_insert_with(|| BreakerRecord::new(self.failure_threshold, self.reset_timeout));
        let before = record.state;
        let permit = record.try_acquire(Instant::now());
        if record.state != before {
            tracing::info!(component_id, from = %before, to = %record.state, "Circuit breaker transition");
        }
        permit.ok_or_else(|| WardenError::CircuitOpen(component_id.to_string()))
    }

    pub async fn record_success(&self, component_id: &str, permit: Permit) {
        if let Some(record) = self.records.lock().await.get_mut(component_id) {
            let before = record.state;
            record.on_success(permit, Instant::now());
            if record.state != before {
                tracing::info!(component_id, from = %before, to = %record.state, "Circuit breaker transition");
            }
        }
    }

    /// Returns true when this failure opened the breaker.
    pub async fn record_failure(&self, component_id: &str, permit: Permit) -> bool {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(component_id) else {
            return false;
        };
        let opened = record.on_failure(permit, Instant::now());
        if opened {
            tracing::warn!(
                component_id,
                threshold = record.failure_threshold,
                reset_timeout_ms = record.reset_timeout.as_millis() as u64,
                "Circuit breaker opened"
            );
        }
        opened
    }

    pub async fn abandon(&self, component_id: &str, permit: Permit) {
        if let Some(record) = self.records.lock().await.get_mut(component_id) {
            record.abandon(permit);
        }
    }

    pub async fn state(&self, component_id: &str) -> Option<BreakerState> {
        self.records.lock().await.get(component_id).map(|r| r.state)
    }

    pub async fn record(&self, component_id: &str) -> Option<BreakerRecord> {
        self.records.lock().await.get(component_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> BreakerRecord {
        BreakerRecord::new(3, Duration::from_secs(30))
    }

    #[test]
    fn opens_after_threshold_failures() {
        let mut r = record();
        let now = Instant::now();
        assert!(!r.on_failure(Permit::Normal, now));
        assert!(!r.on_failure(Permit::Normal, now));
        assert!(r.on_failure(Permit::Normal, now));
        assert_eq!(r.state, BreakerState::Open);
        assert!(r.try_acquire(now).is_none());
    }

    #[test]
    fn success_in_closed_resets_failures() {
        let mut r = record();
        let now = Instant::now();
        r.on_failure(Permit::Normal, now);
        r.on_failure(Permit::Normal, now);
        r.on_success(Permit::Normal, now);
        assert_eq!(r.failure_count, 0);
        assert!(!r.on_failure(Permit::Normal, now));
        assert_eq!(r.state, BreakerState::Closed);
    }

    #[test]
    fn half_open_admits_a_single_probe() {
        let mut r = record();
        let now = Instant::now();
        for _ in 0..3 {
            r.on_failure(Permit::Normal, now);
        }
        let later = now + Duration::from_secs(30);
        assert_eq!(r.try_acquire(later), Some(Permit::Probe));
        assert_eq!(r.state, BreakerState::HalfOpen);
        assert_eq!(r.try_acquire(later), None);

        r.on_success(Permit::Probe, later);
        assert_eq!(r.state, BreakerState::Closed);
        assert_eq!(r.failure_count, 0);
    }

    #[test]
    fn failed_probe_reopens() {
        let mut r = record();
        let now = Instant::now();
        for _ in 0..3 {
            r.on_failure(Permit::Normal, now);
        }
        let later = now + Duration::from_secs(31);
        let permit = r.try_acquire(later).unwrap();
        assert!(r.on_failure(permit, later));
        assert_eq!(r.state, BreakerState::Open);
        assert_eq!(r.opened_at, Some(later));
        assert!(r.try_acquire(later + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn abandoned_probe_frees_the_slot() {
        let mut r = record();
        let now = Instant::now();
        for _ in 0..3 {
            r.on_failure(Permit::Normal, now);
        }
        let later = now + Duration::from_secs(30);
        let permit = r.try_acquire(later).unwrap();
        r.abandon(permit);
        assert_eq!(r.state, BreakerState::HalfOpen);
        assert_eq!(r.try_acquire(later), Some(Permit::Probe));
    }

    #[tokio::test(start_paused = true)]
    async fn table_rejects_while_open() {
        let breakers = CircuitBreakers::new(2, Duration::from_secs(5));
        for _ in 0..2 {
            let p = breakers.acquire("ids").await.unwrap();
            breakers.record_failure("ids", p).await;
        }
        assert_eq!(breakers.state("ids").await, Some(BreakerState::Open));
        assert!(matches!(
            breakers.acquire("ids").await,
            Err(WardenError::CircuitOpen(_))
        ));

        tokio::time::advance(Duration::from_secs(5)).await;
        let probe = breakers.acquire("ids").await.unwrap();
        assert_eq!(probe, Permit::Probe);
        breakers.record_success("ids", probe).await;
        assert_eq!(breakers.state("ids").await, Some(BreakerState::Closed));
    }

    #[tokio::test]
    async fn unknown_component_has_no_state() {
        let breakers = CircuitBreakers::new(2, Duration::from_secs(5));
        assert!(breakers.state("ids").await.is_none());
        assert!(!breakers.record_failure("ids", Permit::Normal).await);
    }
}
