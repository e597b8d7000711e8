use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct DemandEntry {
    score: f64,
    updated: Instant,
    last_invoked: Instant,
}

/// Exponentially decayed invocation counts.
///
/// Each invocation adds 1 to a score that halves every `half_life`. Only
/// used to order eviction candidates that share a criticality.
#[derive(Debug)]
pub struct DemandTracker {
    half_life: Duration,
    entries: HashMap<String, DemandEntry>,
}

impl DemandTracker {
    pub fn new(half_life: Duration) -> Self {
        Self {
            half_life: half_life.max(Duration::from_millis(1)),
            entries: HashMap::new(),
        }
    }

    fn decay(&self, score: f64, elapsed: Duration) -> f64 {
        let halvings = elapsed.as_secs_f64() / self.half_life.as_secs_f64();
        score * 0.5_f64.powf(halvings)
    }

    pub fn record(&mut self, component_id: &str, now: Instant) {
        let decayed = self.score_at(component_id, now);
        self.entries.insert(
            component_id.to_string(),
            DemandEntry {
                score: decayed + 1.0,
                updated: now,
                last_invoked: now,
            },
        );
    }

    /// Decayed score at `now`; 0 for components never invoked.
    pub fn score_at(&self, component_id: &str, now: Instant) -> f64 {
        self.entries.get(component_id).map_or(0.0, |e| {
            self.decay(e.score, now.saturating_duration_since(e.updated))
        })
    }

    pub fn last_invoked(&self, component_id: &str) -> Option<Instant> {
        self.entries.get(component_id).map(|e| e.last_invoked)
    }

    pub fn forget(&mut self, component_id: &str) {
        self.entries.remove(component_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_component_scores_zero() {
        let tracker = DemandTracker::new(Duration::from_secs(60));
        assert_eq!(tracker.score_at("ids", Instant::now()), 0.0);
        assert!(tracker.last_invoked("ids").is_none());
    }

    #[test]
    fn score_halves_after_one_half_life() {
        let mut tracker = DemandTracker::new(Duration::from_secs(10));
        let t0 = Instant::now();
        tracker.record("ids", t0);
        tracker.record("ids", t0);

        let later = t0 + Duration::from_secs(10);
        let score = tracker.score_at("ids", later);
        assert!((score - 1.0).abs() < 1e-9, "got {score}");
    }

    #[test]
    fn recent_invocations_outweigh_old_ones() {
        let mut tracker = DemandTracker::new(Duration::from_secs(1));
        let t0 = Instant::now();
        for _ in 0..4 {
            tracker.record("old", t0);
        }
        let later = t0 + Duration::from_secs(5);
        tracker.record("fresh", later);

        assert!(tracker.score_at("fresh", later) > tracker.score_at("old", later));
        assert_eq!(tracker.last_invoked("fresh"), Some(later));
    }

    #[test]
    fn forget_drops_history() {
        let mut tracker = DemandTracker::new(Duration::from_secs(1));
        let now = Instant::now();
        tracker.record("ids", now);
        tracker.forget("ids");
        assert_eq!(tracker.score_at("ids", now), 0.0);
    }
}
