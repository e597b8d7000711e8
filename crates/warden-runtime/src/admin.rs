use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use warden_core::registry::list;
use warden_core::{
    ComponentFilter, ComponentRecord, Criticality, LifecycleState, StateKind, WardenError,
};

use crate::breaker::{BreakerState, CircuitBreakers};
use crate::lifecycle::LifecycleController;
use crate::wake::{WakeReason, WakeRequest};

/// What `GET /components/{id}` returns.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub id: String,
    pub criticality: Criticality,
    pub resource_cost: u64,
    pub stateless: bool,
    pub capabilities: BTreeSet<String>,
    pub state: LifecycleState,
    pub snapshot_id: Option<String>,
    pub last_error: Option<String>,
    pub version: u64,
    pub last_transition_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker: Option<BreakerState>,
}

impl ComponentStatus {
    fn from_record(record: ComponentRecord, breaker: Option<BreakerState>) -> Self {
        let d = record.descriptor;
        Self {
            id: d.id,
            criticality: d.criticality,
            resource_cost: d.resource_cost,
            stateless: d.stateless,
            capabilities: d.capabilities,
            state: record.state,
            snapshot_id: record.snapshot_id,
            last_error: record.last_error,
            version: record.version,
            last_transition_at: d.last_transition_at,
            breaker,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetHolding {
    pub component_id: String,
    pub cost: u64,
}

/// What `GET /budget` returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetStatus {
    pub capacity: u64,
    pub allocated: u64,
    pub available: u64,
    pub holdings: Vec<BudgetHolding>,
}

impl BudgetStatus {
    fn new(capacity: u64, holdings: Vec<BudgetHolding>) -> Self {
        let allocated = holdings.iter().map(|h| h.cost).sum();
        Self {
            capacity,
            allocated,
            available: capacity.saturating_sub(allocated),
            holdings,
        }
    }
}

/// In-process operations behind the admin surface. Every read goes to the
/// registry; nothing is cached here.
pub struct AdminApi {
    controller: LifecycleController,
    breakers: Option<Arc<CircuitBreakers>>,
    wake_deadline: Duration,
}

impl AdminApi {
    pub fn new(controller: LifecycleController, wake_deadline: Duration) -> Self {
        Self {
            controller,
            breakers: None,
            wake_deadline,
        }
    }

    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakers>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    async fn status(&self, record: ComponentRecord) -> ComponentStatus {
        let breaker = match &self.breakers {
            Some(b) => b.state(record.id()).await,
            None => None,
        };
        ComponentStatus::from_record(record, breaker)
    }

    /// `GET /components`
    pub async fn list_components(
        &self,
        filter: ComponentFilter,
    ) -> Result<Vec<ComponentStatus>, WardenError> {
        let records = list(self.controller.registry().as_ref(), filter).await?;
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            out.push(self.status(record).await);
        }
        Ok(out)
    }

    /// `GET /components/{id}`
    pub async fn get_component(&self, id: &str) -> Result<ComponentStatus, WardenError> {
        let record = self.controller.record(id).await?;
        Ok(self.status(record).await)
    }

    /// `POST /components/{id}:enable`
    pub async fn enable(&self, id: &str) -> Result<ComponentStatus, WardenError> {
        self.controller.enable(id).await?;
        self.get_component(id).await
    }

    /// `POST /components/{id}:disable`
    pub async fn disable(&self, id: &str, reason: &str) -> Result<ComponentStatus, WardenError> {
        self.controller.disable(id, reason).await?;
        self.get_component(id).await
    }

    /// `POST /components/{id}:wake`
    pub async fn wake(&self, id: &str) -> Result<ComponentStatus, WardenError> {
        let request = WakeRequest::new(id, WakeReason::ManualCall, self.wake_deadline);
        self.controller.wake(request).await?;
        self.get_component(id).await
    }

    /// `POST /components/{id}:sleep`
    pub async fn sleep(&self, id: &str) -> Result<ComponentStatus, WardenError> {
        self.controller.sleep(id).await?;
        self.get_component(id).await
    }

    /// `GET /budget`, as the admission governor of this process sees it.
    pub async fn budget(&self) -> BudgetStatus {
        let governor = self.controller.governor();
        let holdings = governor
            .holdings()
            .await
            .into_iter()
            .map(|(component_id, cost)| BudgetHolding { component_id, cost })
            .collect();
        BudgetStatus::new(governor.capacity(), holdings)
    }

    /// Budget implied by the persisted records: the cost of every Active
    /// component. Used when no live process owns the governor.
    pub async fn committed_budget(&self) -> Result<BudgetStatus, WardenError> {
        let active = list(
            self.controller.registry().as_ref(),
            ComponentFilter::in_state(StateKind::Active),
        )
        .await?;
        let holdings = active
            .into_iter()
            .map(|r| BudgetHolding {
                component_id: r.descriptor.id,
                cost: r.descriptor.resource_cost,
            })
            .collect();
        Ok(BudgetStatus::new(self.controller.governor().capacity(), holdings))
    }

    /// Collect snapshot garbage for one component, or all of them. Snapshots
    /// referenced by a registry record are always kept.
    pub async fn gc(&self, id: Option<&str>) -> Result<usize, WardenError> {
        let snapshotter = self.controller.snapshotter();
        let records = match id {
            Some(id) => vec![self.controller.record(id).await?],
            None => list(self.controller.registry().as_ref(), ComponentFilter::all()).await?,
        };
        let _pins: Vec<_> = records
            .iter()
            .filter_map(|r| r.snapshot_id.as_deref())
            .map(|s| snapshotter.pin(s))
            .collect();
        match id {
            Some(id) => snapshotter.collect_garbage(id).await,
            None => snapshotter.collect_all_garbage().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionGovernor;
    use crate::blob::InMemoryBlobStore;
    use crate::lifecycle::LifecycleSettings;
    use crate::metrics::GovernorMetrics;
    use crate::snapshot::StateSnapshotter;
    use crate::test_support::MockPlugin;
    use warden_core::{ComponentDescriptor, InMemoryRegistry, WardenConfig};

    fn admin() -> AdminApi {
        let controller = LifecycleController::new(
            Arc::new(InMemoryRegistry::new()),
            Arc::new(StateSnapshotter::new(Arc::new(InMemoryBlobStore::new()), 1)),
            Arc::new(AdmissionGovernor::new(100, Duration::from_secs(60))),
            Arc::new(GovernorMetrics::new()),
            LifecycleSettings::from_config(&WardenConfig::default()),
        );
        AdminApi::new(controller, Duration::from_secs(5))
            .with_breakers(Arc::new(CircuitBreakers::new(5, Duration::from_secs(30))))
    }

    async fn add(api: &AdminApi, id: &str, cost: u64) -> Arc<MockPlugin> {
        let plugin = Arc::new(MockPlugin::default());
        api.controller
            .register(
                ComponentDescriptor::new(id, Criticality::Medium, cost).with_capability("pe"),
                plugin.clone(),
            )
            .await
            .unwrap();
        plugin
    }

    #[tokio::test]
    async fn wake_and_sleep_report_fresh_state() {
        let api = admin();
        add(&api, "yara", 25).await;

        let status = api.wake("yara").await.unwrap();
        assert_eq!(status.state, LifecycleState::Active);
        assert_eq!(api.budget().await.allocated, 25);
        assert_eq!(api.committed_budget().await.unwrap().allocated, 25);

        let status = api.sleep("yara").await.unwrap();
        assert_eq!(status.state, LifecycleState::Dormant);
        assert!(status.snapshot_id.is_some());
        assert_eq!(api.budget().await.available, 100);
    }

    #[tokio::test]
    async fn list_filters_by_state() {
        let api = admin();
        add(&api, "a", 10).await;
        add(&api, "b", 10).await;
        api.disable("b", "maintenance").await.unwrap();

        let disabled = api
            .list_components(ComponentFilter::in_state(StateKind::Disabled))
            .await
            .unwrap();
        assert_eq!(disabled.len(), 1);
        assert_eq!(disabled[0].id, "b");
        assert_eq!(disabled[0].last_error.as_deref(), Some("maintenance"));
        assert_eq!(api.list_components(ComponentFilter::all()).await.unwrap().len(), 2);

        let status = api.enable("b").await.unwrap();
        assert_eq!(status.state, LifecycleState::Dormant);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn status_serializes_for_the_wire() {
        let api = admin();
        add(&api, "a", 10).await;
        let json = serde_json::to_value(api.get_component("a").await.unwrap()).unwrap();
        assert_eq!(json["state"]["state"], "dormant");
        assert_eq!(json["criticality"], "medium");
        assert_eq!(json["capabilities"][0], "pe");
        assert!(json.get("breaker").is_none());
    }

    #[tokio::test]
    async fn gc_keeps_referenced_snapshots() {
        let api = admin();
        let plugin = add(&api, "a", 10).await;
        for payload in [&b"one"[..], &b"two"[..], &b"three"[..]] {
            plugin.set_state(payload);
            api.wake("a").await.unwrap();
            api.sleep("a").await.unwrap();
        }
        let record = api.get_component("a").await.unwrap();
        api.gc(Some("a")).await.unwrap();

        let kept = api.controller.snapshotter().snapshots("a").await;
        assert_eq!(kept.len(), 1);
        assert_eq!(Some(kept[0].snapshot_id.clone()), record.snapshot_id);
    }

    #[tokio::test]
    async fn unknown_component_maps_to_404() {
        let api = admin();
        let err = api.get_component("ghost").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }
}
