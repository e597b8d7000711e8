use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use warden_core::{Criticality, WardenError};

use crate::demand::DemandTracker;

/// Budget usage at a point in time. `allocated <= capacity` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceBudget {
    pub capacity: u64,
    pub allocated: u64,
}

impl ResourceBudget {
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.allocated)
    }
}

/// Outcome of an allocation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Cost is charged to the budget; the caller may proceed.
    Granted,
    /// Nothing was charged. Sleep these components (already marked so no
    /// other request picks them) and ask again.
    Evict(Vec<String>),
}

#[derive(Debug, Clone)]
struct Holding {
    cost: u64,
    criticality: Criticality,
    /// Mid-transition: never an eviction candidate.
    in_transition: bool,
    /// Requester this holding was promised to as an eviction victim.
    evicting_for: Option<String>,
}

impl Holding {
    fn evictable_by(&self, requester: Criticality) -> bool {
        !self.in_transition && self.evicting_for.is_none() && self.criticality < requester
    }
}

#[derive(Debug, Default)]
struct Ledger {
    allocated: u64,
    holdings: HashMap<String, Holding>,
}

/// Sole gatekeeper of the resource budget.
///
/// Every charge and release happens under one mutex, so the budget can never
/// be overdrawn regardless of how many wakes race.
pub struct AdmissionGovernor {
    capacity: u64,
    ledger: Mutex<Ledger>,
    demand: Mutex<DemandTracker>,
}

impl AdmissionGovernor {
    pub fn new(capacity: u64, demand_half_life: Duration) -> Self {
        Self {
            capacity,
            ledger: Mutex::new(Ledger::default()),
            demand: Mutex::new(DemandTracker::new(demand_half_life)),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn exhausted(&self, component_id: &str, cost: u64, allocated: u64) -> WardenError {
        WardenError::BudgetExhausted {
            id: component_id.to_string(),
            requested: cost,
            capacity: self.capacity,
            allocated,
        }
    }

    /// Charge `cost` for `component_id`, or name the components to evict
    /// first. Only strictly lower-criticality holdings are ever proposed.
    pub async fn try_allocate(
        &self,
        component_id: &str,
        cost: u64,
        criticality: Criticality,
    ) -> Result<Admission, WardenError> {
        let mut ledger = self.ledger.lock().await;
        if ledger.holdings.contains_key(component_id) {
            return Ok(Admission::Granted);
        }
        if cost > self.capacity {
            return Err(self.exhausted(component_id, cost, ledger.allocated));
        }
        if ledger.allocated + cost <= self.capacity {
            charge(&mut ledger, component_id, cost, criticality);
            tracing::debug!(
                component_id,
                cost,
                allocated = ledger.allocated,
                capacity = self.capacity,
                "Budget granted"
            );
            return Ok(Admission::Granted);
        }

        let deficit = ledger.allocated + cost - self.capacity;
        let victims = self.plan_eviction(&ledger, component_id, criticality, deficit).await;
        let Some(victims) = victims else {
            tracing::warn!(
                component_id,
                cost,
                %criticality,
                allocated = ledger.allocated,
                capacity = self.capacity,
                "Budget exhausted and nothing evictable"
            );
            return Err(self.exhausted(component_id, cost, ledger.allocated));
        };
        for victim in &victims {
            if let Some(h) = ledger.holdings.get_mut(victim) {
                h.evicting_for = Some(component_id.to_string());
            }
        }
        tracing::info!(component_id, deficit, victims = ?victims, "Eviction planned");
        Ok(Admission::Evict(victims))
    }

    /// Victims ordered by criticality, then decayed demand, then least
    /// recently invoked. `None` if even evicting every candidate falls short.
    async fn plan_eviction(
        &self,
        ledger: &Ledger,
        requester: &str,
        criticality: Criticality,
        deficit: u64,
    ) -> Option<Vec<String>> {
        let demand = self.demand.lock().await;
        let now = Instant::now();
        let mut candidates: Vec<(&String, &Holding, f64, Option<Instant>)> = ledger
            .holdings
            .iter()
            .filter(|(id, h)| id.as_str() != requester && h.evictable_by(criticality))
            .map(|(id, h)| (id, h, demand.score_at(id, now), demand.last_invoked(id)))
            .collect();
        candidates.sort_by(|a, b| {
            a.1.criticality
                .cmp(&b.1.criticality)
                .then(a.2.total_cmp(&b.2))
                .then(a.3.cmp(&b.3))
                .then(a.0.cmp(b.0))
        });

        let mut freed = 0;
        let mut victims = Vec::new();
        for (id, holding, _, _) in candidates {
            if freed >= deficit {
                break;
            }
            freed += holding.cost;
            victims.push(id.clone());
        }
        (freed >= deficit).then_some(victims)
    }

    /// Charge only if the budget has room right now.
    pub async fn try_allocate_without_eviction(
        &self,
        component_id: &str,
        cost: u64,
        criticality: Criticality,
    ) -> bool {
        let mut ledger = self.ledger.lock().await;
        if ledger.holdings.contains_key(component_id) {
            return true;
        }
        if ledger.allocated + cost > self.capacity {
            return false;
        }
        charge(&mut ledger, component_id, cost, criticality);
        true
    }

    /// The holding's transition finished; it may be evicted again.
    pub async fn settle(&self, component_id: &str) {
        if let Some(h) = self.ledger.lock().await.holdings.get_mut(component_id) {
            h.in_transition = false;
            h.evicting_for = None;
        }
    }

    /// Exclude a holding from eviction while it transitions.
    pub async fn mark_transitioning(&self, component_id: &str) {
        if let Some(h) = self.ledger.lock().await.holdings.get_mut(component_id) {
            h.in_transition = true;
        }
    }

    /// Return a holding's cost to the budget. Returns the amount released.
    pub async fn release(&self, component_id: &str) -> u64 {
        let mut ledger = self.ledger.lock().await;
        match ledger.holdings.remove(component_id) {
            Some(h) => {
                ledger.allocated -= h.cost;
                tracing::debug!(
                    component_id,
                    cost = h.cost,
                    allocated = ledger.allocated,
                    "Budget released"
                );
                h.cost
            }
            None => 0,
        }
    }

    /// Drop every eviction mark placed on behalf of `requester`.
    pub async fn abandon_plan(&self, requester: &str) {
        let mut ledger = self.ledger.lock().await;
        for h in ledger.holdings.values_mut() {
            if h.evicting_for.as_deref() == Some(requester) {
                h.evicting_for = None;
            }
        }
    }

    pub async fn budget(&self) -> ResourceBudget {
        ResourceBudget {
            capacity: self.capacity,
            allocated: self.ledger.lock().await.allocated,
        }
    }

    pub async fn holds(&self, component_id: &str) -> bool {
        self.ledger.lock().await.holdings.contains_key(component_id)
    }

    /// `(component_id, cost)` of every current holding, sorted by id.
    pub async fn holdings(&self) -> Vec<(String, u64)> {
        let ledger = self.ledger.lock().await;
        let mut out: Vec<_> = ledger
            .holdings
            .iter()
            .map(|(id, h)| (id.clone(), h.cost))
            .collect();
        out.sort();
        out
    }

    pub async fn record_demand(&self, component_id: &str) {
        self.demand.lock().await.record(component_id, Instant::now());
    }

    pub async fn demand_score(&self, component_id: &str) -> f64 {
        self.demand.lock().await.score_at(component_id, Instant::now())
    }
}

fn charge(ledger: &mut Ledger, component_id: &str, cost: u64, criticality: Criticality) {
    ledger.allocated += cost;
    ledger.holdings.insert(
        component_id.to_string(),
        Holding {
            cost,
            criticality,
            in_transition: true,
            evicting_for: None,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn governor(capacity: u64) -> AdmissionGovernor {
        AdmissionGovernor::new(capacity, Duration::from_secs(60))
    }

    async fn active(g: &AdmissionGovernor, id: &str, cost: u64, crit: Criticality) {
        assert_eq!(
            g.try_allocate(id, cost, crit).await.unwrap(),
            Admission::Granted
        );
        g.settle(id).await;
    }

    #[tokio::test]
    async fn grants_within_capacity() {
        let g = governor(100);
        active(&g, "a", 60, Criticality::Low).await;
        assert_eq!(g.budget().await.allocated, 60);
        assert_eq!(g.budget().await.available(), 40);
        assert!(g.holds("a").await);
    }

    #[tokio::test]
    async fn repeated_allocation_is_idempotent() {
        let g = governor(100);
        active(&g, "a", 60, Criticality::Low).await;
        active(&g, "a", 60, Criticality::Low).await;
        assert_eq!(g.budget().await.allocated, 60);
    }

    #[tokio::test]
    async fn proposes_lower_criticality_victims() {
        let g = governor(100);
        active(&g, "a", 60, Criticality::Low).await;
        active(&g, "b", 30, Criticality::Medium).await;

        let admission = g.try_allocate("c", 50, Criticality::High).await.unwrap();
        assert_eq!(admission, Admission::Evict(vec!["a".into()]));
        // Nothing charged until the victims are gone.
        assert_eq!(g.budget().await.allocated, 90);

        g.release("a").await;
        assert_eq!(
            g.try_allocate("c", 50, Criticality::High).await.unwrap(),
            Admission::Granted
        );
        assert_eq!(g.budget().await.allocated, 80);
    }

    #[tokio::test]
    async fn never_evicts_equal_or_higher_criticality() {
        let g = governor(100);
        active(&g, "a", 60, Criticality::High).await;
        active(&g, "b", 30, Criticality::Medium).await;

        let err = g
            .try_allocate("c", 50, Criticality::Medium)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WardenError::BudgetExhausted {
                requested: 50,
                capacity: 100,
                allocated: 90,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cost_above_capacity_is_refused_outright() {
        let g = governor(100);
        let err = g
            .try_allocate("huge", 101, Criticality::Critical)
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::BudgetExhausted { .. }));
    }

    #[tokio::test]
    async fn busy_holdings_are_not_candidates() {
        let g = governor(100);
        active(&g, "a", 50, Criticality::Low).await;
        active(&g, "b", 50, Criticality::Low).await;
        g.mark_transitioning("a").await;

        let admission = g.try_allocate("c", 40, Criticality::High).await.unwrap();
        assert_eq!(admission, Admission::Evict(vec!["b".into()]));

        // b is now promised to c; a second requester finds nothing.
        assert!(g.try_allocate("d", 40, Criticality::High).await.is_err());

        g.abandon_plan("c").await;
        assert_eq!(
            g.try_allocate("d", 40, Criticality::High).await.unwrap(),
            Admission::Evict(vec!["b".into()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ties_broken_by_demand_then_recency() {
        let g = governor(100);
        active(&g, "busy", 30, Criticality::Low).await;
        active(&g, "stale", 30, Criticality::Low).await;
        active(&g, "recent", 30, Criticality::Low).await;

        g.record_demand("busy").await;
        g.record_demand("busy").await;
        g.record_demand("busy").await;
        g.record_demand("stale").await;
        tokio::time::advance(Duration::from_millis(10)).await;
        g.record_demand("recent").await;

        let admission = g.try_allocate("c", 30, Criticality::High).await.unwrap();
        assert_eq!(admission, Admission::Evict(vec!["stale".into()]));
    }

    #[tokio::test]
    async fn without_eviction_refuses_when_full() {
        let g = governor(100);
        active(&g, "a", 90, Criticality::Low).await;
        assert!(!g.try_allocate_without_eviction("crit", 20, Criticality::Critical).await);
        assert!(g.try_allocate_without_eviction("crit", 10, Criticality::Critical).await);
        assert_eq!(g.budget().await.allocated, 100);
    }

    #[tokio::test]
    async fn release_of_unknown_component_is_noop() {
        let g = governor(100);
        assert_eq!(g.release("ghost").await, 0);
        assert_eq!(g.budget().await.allocated, 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate(u8, u64, u8),
        Release(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..8, 1u64..60, 0u8..4).prop_map(|(i, c, k)| Op::Allocate(i, c, k)),
            (0u8..8).prop_map(Op::Release),
        ]
    }

    fn criticality(k: u8) -> Criticality {
        match k {
            0 => Criticality::Low,
            1 => Criticality::Medium,
            2 => Criticality::High,
            _ => Criticality::Critical,
        }
    }

    proptest! {
        #[test]
        fn allocated_never_exceeds_capacity(ops in proptest::collection::vec(op(), 1..64)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(async {
                let g = governor(100);
                for op in ops {
                    match op {
                        Op::Allocate(i, cost, k) => {
                            let id = format!("c{i}");
                            if let Ok(Admission::Evict(victims)) =
                                g.try_allocate(&id, cost, criticality(k)).await
                            {
                                for v in victims {
                                    g.release(&v).await;
                                }
                            }
                            g.settle(&id).await;
                        }
                        Op::Release(i) => {
                            g.release(&format!("c{i}")).await;
                        }
                    }
                    let budget = g.budget().await;
                    prop_assert!(budget.allocated <= budget.capacity);
                    let held: u64 = g.holdings().await.iter().map(|(_, c)| c).sum();
                    prop_assert_eq!(held, budget.allocated);
                }
                Ok(())
            })?;
        }
    }
}
