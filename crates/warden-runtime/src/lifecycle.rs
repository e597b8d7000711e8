use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, watch};
use warden_core::registry::list;
use warden_core::{
    ComponentDescriptor, ComponentFilter, ComponentPlugin, ComponentRecord, Criticality,
    LifecycleState, PluginError, RegistryStore, RestState, StateUpdate, WardenConfig, WardenError,
};

use crate::admission::{Admission, AdmissionGovernor};
use crate::blob::StateSnapshot;
use crate::metrics::GovernorMetrics;
use crate::snapshot::StateSnapshotter;
use crate::wake::{WakeReason, WakeRequest};

/// `None` until the wake task finishes.
type WakeOutcome = Option<Result<(), WardenError>>;

#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    pub step_timeout: Duration,
    pub transition_timeout: Duration,
    pub cas_retries: u32,
    pub eviction_rounds: u32,
}

impl LifecycleSettings {
    pub fn from_config(config: &WardenConfig) -> Self {
        Self {
            step_timeout: config.step_timeout(),
            transition_timeout: config.transition_timeout(),
            cas_retries: config.lifecycle.cas_retries,
            eviction_rounds: config.lifecycle.eviction_rounds,
        }
    }
}

/// What `recover` did to records left behind by a previous process.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Were Active; no process holds their resources any more.
    pub demoted: Vec<String>,
    /// Were mid-transition when the previous process stopped.
    pub interrupted: Vec<String>,
    /// Critical components queued for a priority wake.
    pub queued: Vec<String>,
}

struct Inner {
    registry: Arc<dyn RegistryStore>,
    snapshotter: Arc<StateSnapshotter>,
    governor: Arc<AdmissionGovernor>,
    metrics: Arc<GovernorMetrics>,
    settings: LifecycleSettings,
    /// component_id → live plugin instance
    plugins: RwLock<HashMap<String, Arc<dyn ComponentPlugin>>>,
    /// component_id → per-component lease; held for a whole transition
    leases: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// component_id → result channel of the running wake
    inflight: Mutex<HashMap<String, watch::Receiver<WakeOutcome>>>,
    /// Critical components waiting for budget
    priority: Mutex<BTreeSet<String>>,
}

/// Drives every Active/Dormant/Disabled transition.
///
/// The only writer of lifecycle state. A transition holds the component's
/// lease from its first CAS to its last, so at most one is in flight per
/// component; concurrent wake requests join the running one instead of
/// starting their own.
///
/// Cheap to clone: all clones share the same state.
#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<Inner>,
}

fn invalid(id: &str, state: LifecycleState, action: &'static str) -> WardenError {
    WardenError::InvalidTransition {
        id: id.to_string(),
        state,
        action,
    }
}

fn plugin_error(id: &str) -> impl FnOnce(PluginError) -> WardenError + '_ {
    move |e| WardenError::Plugin {
        id: id.to_string(),
        message: e.0,
    }
}

async fn wait_for_outcome(rx: &mut watch::Receiver<WakeOutcome>) -> Result<(), WardenError> {
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or(Ok(())),
        Err(_) => Err(WardenError::Storage(
            "wake task ended without reporting an outcome".into(),
        )),
    }
}

impl LifecycleController {
    pub fn new(
        registry: Arc<dyn RegistryStore>,
        snapshotter: Arc<StateSnapshotter>,
        governor: Arc<AdmissionGovernor>,
        metrics: Arc<GovernorMetrics>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                snapshotter,
                governor,
                metrics,
                settings,
                plugins: RwLock::new(HashMap::new()),
                leases: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                priority: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<dyn RegistryStore> {
        &self.inner.registry
    }

    pub fn governor(&self) -> &Arc<AdmissionGovernor> {
        &self.inner.governor
    }

    pub fn snapshotter(&self) -> &Arc<StateSnapshotter> {
        &self.inner.snapshotter
    }

    pub fn metrics(&self) -> &Arc<GovernorMetrics> {
        &self.inner.metrics
    }

    pub async fn record(&self, id: &str) -> Result<ComponentRecord, WardenError> {
        self.inner
            .registry
            .get(id)
            .await?
            .ok_or_else(|| WardenError::NotFound(id.to_string()))
    }

    pub async fn state(&self, id: &str) -> Result<LifecycleState, WardenError> {
        Ok(self.record(id).await?.state)
    }

    pub async fn plugin(&self, id: &str) -> Option<Arc<dyn ComponentPlugin>> {
        self.inner.plugins.read().await.get(id).cloned()
    }

    async fn require_plugin(&self, id: &str) -> Result<Arc<dyn ComponentPlugin>, WardenError> {
        self.plugin(id).await.ok_or_else(|| WardenError::Plugin {
            id: id.to_string(),
            message: "no plugin attached".into(),
        })
    }

    /// Register a new component, Dormant. Critical components are brought
    /// Active immediately when the budget has room, otherwise queued for a
    /// priority wake.
    pub async fn register(
        &self,
        descriptor: ComponentDescriptor,
        plugin: Arc<dyn ComponentPlugin>,
    ) -> Result<ComponentRecord, WardenError> {
        descriptor.validate()?;
        let id = descriptor.id.clone();
        let criticality = descriptor.criticality;
        let cost = descriptor.resource_cost;
        self.inner
            .registry
            .register(ComponentRecord::new(descriptor, LifecycleState::Dormant))
            .await?;
        self.inner.plugins.write().await.insert(id.clone(), plugin);
        tracing::info!(component_id = %id, %criticality, cost, "Component registered");

        if criticality == Criticality::Critical {
            self.start_critical(&id).await?;
        }
        self.record(&id).await
    }

    /// Bind a plugin to a record that already exists (e.g. after a restart).
    pub async fn attach(
        &self,
        id: &str,
        plugin: Arc<dyn ComponentPlugin>,
    ) -> Result<(), WardenError> {
        let record = self.record(id).await?;
        self.inner.plugins.write().await.insert(id.to_string(), plugin);
        if record.descriptor.criticality == Criticality::Critical
            && record.state == LifecycleState::Dormant
        {
            self.inner.priority.lock().await.insert(id.to_string());
        }
        tracing::debug!(component_id = id, state = %record.state, "Plugin attached");
        Ok(())
    }

    async fn start_critical(&self, id: &str) -> Result<(), WardenError> {
        let _lease = self.lease(id).await;
        let record = self.record(id).await?;
        if record.state != LifecycleState::Dormant {
            return Ok(());
        }
        let d = &record.descriptor;
        let admitted = self
            .inner
            .governor
            .try_allocate_without_eviction(id, d.resource_cost, d.criticality)
            .await;
        if !admitted {
            self.inner.priority.lock().await.insert(id.to_string());
            tracing::info!(
                component_id = id,
                cost = d.resource_cost,
                "Budget full; critical component queued for priority wake"
            );
            return Ok(());
        }

        let waking = LifecycleState::transitioning(RestState::Dormant, RestState::Active);
        if let Err(e) = self.cas(id, StateUpdate::to(waking), LifecycleState::Dormant).await {
            self.inner.governor.release(id).await;
            return Err(e);
        }
        if let Err(e) = self.cas(id, StateUpdate::to(RestState::Active), waking).await {
            self.roll_back_wake(&record, waking, &e).await;
            return Err(e);
        }
        self.inner.governor.settle(id).await;
        tracing::info!(component_id = id, "Critical component active at registration");
        Ok(())
    }

    /// Wake a component, waiting until `request.deadline` at most.
    ///
    /// A caller that gives up with `WakeTimeout` does not cancel the
    /// transition; it keeps running and later callers see its result.
    pub async fn wake(&self, request: WakeRequest) -> Result<(), WardenError> {
        let id = request.component_id.as_str();
        match self.state(id).await? {
            LifecycleState::Active => return Ok(()),
            LifecycleState::Disabled => {
                return Err(WardenError::ComponentDisabled(id.to_string()));
            }
            _ => {}
        }

        let deadline_ms = request.remaining().as_millis() as u64;
        let mut outcome = self.join_or_start(id, request.reason).await;
        match tokio::time::timeout_at(request.deadline, wait_for_outcome(&mut outcome)).await {
            Ok(result) => result,
            Err(_) => {
                self.inner.metrics.record_wake_timeout();
                tracing::warn!(
                    component_id = id,
                    reason = %request.reason,
                    deadline_ms,
                    "Wake deadline passed; transition continues in background"
                );
                Err(WardenError::WakeTimeout {
                    id: id.to_string(),
                    deadline_ms,
                })
            }
        }
    }

    async fn join_or_start(&self, id: &str, reason: WakeReason) -> watch::Receiver<WakeOutcome> {
        let mut inflight = self.inner.inflight.lock().await;
        if let Some(rx) = inflight.get(id) {
            self.inner.metrics.record_wake_coalesced();
            tracing::debug!(component_id = id, %reason, "Joining in-flight wake");
            return rx.clone();
        }
        let (tx, rx) = watch::channel(None);
        inflight.insert(id.to_string(), rx.clone());
        drop(inflight);

        let controller = self.clone();
        let component_id = id.to_string();
        tokio::spawn(async move {
            let outcome = controller.run_wake(&component_id, reason).await;
            let _ = tx.send(Some(outcome));
            controller.inner.inflight.lock().await.remove(&component_id);
        });
        rx
    }

    async fn run_wake(&self, id: &str, reason: WakeReason) -> Result<(), WardenError> {
        let _lease = self.lease(id).await;
        let record = self.record(id).await?;
        match record.state {
            LifecycleState::Active => return Ok(()),
            LifecycleState::Disabled => {
                return Err(WardenError::ComponentDisabled(id.to_string()));
            }
            LifecycleState::Transitioning { .. } => return Err(invalid(id, record.state, "wake")),
            LifecycleState::Dormant => {}
        }
        self.bounded(id, self.wake_locked(&record, reason)).await
    }

    async fn wake_locked(
        &self,
        record: &ComponentRecord,
        reason: WakeReason,
    ) -> Result<(), WardenError> {
        let id = record.id();
        let plugin = self.require_plugin(id).await?;
        self.inner.metrics.record_wake_started();
        tracing::info!(
            component_id = id,
            %reason,
            criticality = %record.descriptor.criticality,
            snapshot_id = ?record.snapshot_id,
            "Waking component"
        );

        let waking = LifecycleState::transitioning(RestState::Dormant, RestState::Active);
        self.cas(id, StateUpdate::to(waking), LifecycleState::Dormant)
            .await?;

        let activated = match self.activate(record, plugin.as_ref()).await {
            Ok(()) => self
                .cas(id, StateUpdate::to(RestState::Active), waking)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        match activated {
            Ok(()) => {
                self.inner.governor.settle(id).await;
                self.inner.priority.lock().await.remove(id);
                self.inner.metrics.record_wake_completed();
                let budget = self.inner.governor.budget().await;
                self.inner
                    .metrics
                    .record_budget(budget.allocated, budget.capacity);
                tracing::info!(component_id = id, allocated = budget.allocated, "Component active");
                Ok(())
            }
            Err(e) => {
                self.roll_back_wake(record, waking, &e).await;
                self.inner.metrics.record_wake_failed();
                Err(e)
            }
        }
    }

    /// Acquire budget, then restore the last snapshot into the plugin.
    async fn activate(
        &self,
        record: &ComponentRecord,
        plugin: &dyn ComponentPlugin,
    ) -> Result<(), WardenError> {
        let d = &record.descriptor;
        self.admit(d).await?;
        if d.stateless {
            return Ok(());
        }
        let Some(snapshot_id) = record.snapshot_id.as_deref() else {
            return Ok(());
        };

        let _pin = self.inner.snapshotter.pin(snapshot_id);
        let payload = self
            .step(&d.id, "restore", self.inner.snapshotter.restore(snapshot_id))
            .await?;
        self.step(&d.id, "import", async {
            plugin
                .import_state(payload)
                .await
                .map_err(plugin_error(&d.id))
        })
        .await
    }

    /// Charge the budget for `d`, evicting lower-criticality components for
    /// a bounded number of rounds.
    async fn admit(&self, d: &ComponentDescriptor) -> Result<(), WardenError> {
        let governor = &self.inner.governor;
        let mut round = 0;
        loop {
            match governor
                .try_allocate(&d.id, d.resource_cost, d.criticality)
                .await?
            {
                Admission::Granted => return Ok(()),
                Admission::Evict(victims) if round < self.inner.settings.eviction_rounds => {
                    round += 1;
                    self.inner.metrics.record_evictions(victims.len());
                    for victim in &victims {
                        if let Err(e) = self.evict(victim, &d.id).await {
                            tracing::warn!(
                                component_id = %victim,
                                requester = %d.id,
                                error = %e,
                                "Eviction failed"
                            );
                        }
                    }
                    governor.abandon_plan(&d.id).await;
                }
                Admission::Evict(_) => {
                    governor.abandon_plan(&d.id).await;
                    let budget = governor.budget().await;
                    return Err(WardenError::BudgetExhausted {
                        id: d.id.clone(),
                        requested: d.resource_cost,
                        capacity: budget.capacity,
                        allocated: budget.allocated,
                    });
                }
            }
        }
    }

    async fn evict(&self, victim: &str, requester: &str) -> Result<(), WardenError> {
        tracing::info!(component_id = victim, requester, "Evicting component");
        self.sleep_detached(victim).await
    }

    async fn roll_back_wake(
        &self,
        record: &ComponentRecord,
        waking: LifecycleState,
        err: &WardenError,
    ) {
        let id = record.id();
        self.inner.governor.release(id).await;
        self.inner.governor.abandon_plan(id).await;

        let target = if err.is_integrity_failure() {
            self.inner.metrics.record_integrity_failure();
            tracing::error!(
                component_id = id,
                error = %err,
                alert = true,
                "Snapshot integrity failure during wake; disabling component"
            );
            RestState::Disabled
        } else {
            tracing::warn!(component_id = id, error = %err, "Wake failed; rolling back to dormant");
            RestState::Dormant
        };

        let update = StateUpdate::to(target).with_error(err.to_string());
        if let Err(e) = self.cas(id, update, waking).await {
            tracing::error!(component_id = id, error = %e, "Rollback of failed wake did not commit");
        }

        let mut priority = self.inner.priority.lock().await;
        if target == RestState::Dormant
            && record.descriptor.criticality == Criticality::Critical
            && matches!(err, WardenError::BudgetExhausted { .. })
        {
            priority.insert(id.to_string());
        } else if target == RestState::Disabled {
            priority.remove(id);
        }
    }

    /// Snapshot an Active component and move it to Dormant, releasing its
    /// budget. The snapshot is durable before the state change commits; if
    /// the snapshot fails the component stays Active.
    ///
    /// Runs on a task of its own, so it reaches a rest state even when the
    /// caller stops waiting.
    pub async fn sleep(&self, id: &str) -> Result<(), WardenError> {
        self.sleep_detached(id).await
    }

    async fn sleep_detached(&self, id: &str) -> Result<(), WardenError> {
        let controller = self.clone();
        let component_id = id.to_string();
        tokio::spawn(async move {
            let _lease = controller.lease(&component_id).await;
            controller
                .bounded(&component_id, controller.sleep_locked(&component_id))
                .await
        })
        .await
        .map_err(|e| WardenError::Storage(format!("sleep task for {id} failed: {e}")))?
    }

    async fn sleep_locked(&self, id: &str) -> Result<(), WardenError> {
        let record = self.record(id).await?;
        match record.state {
            LifecycleState::Dormant => return Ok(()),
            LifecycleState::Active => {}
            other => return Err(invalid(id, other, "sleep")),
        }

        let governor = &self.inner.governor;
        let sleeping = LifecycleState::transitioning(RestState::Active, RestState::Dormant);
        governor.mark_transitioning(id).await;
        if let Err(e) = self
            .cas(id, StateUpdate::to(sleeping), LifecycleState::Active)
            .await
        {
            governor.settle(id).await;
            return Err(e);
        }

        let snapshot = if record.descriptor.stateless {
            None
        } else {
            match self.capture(id).await {
                Ok(meta) => Some(meta.snapshot_id),
                Err(e) => {
                    self.inner.metrics.record_sleep_abandoned();
                    tracing::warn!(
                        component_id = id,
                        error = %e,
                        "Snapshot failed; component stays active"
                    );
                    let update = StateUpdate::to(RestState::Active).with_error(e.to_string());
                    if let Err(cas_err) = self.cas(id, update, sleeping).await {
                        tracing::error!(component_id = id, error = %cas_err, "Rollback of failed sleep did not commit");
                    }
                    governor.settle(id).await;
                    return Err(e);
                }
            }
        };

        let mut update = StateUpdate::to(RestState::Dormant);
        if let Some(snapshot_id) = &snapshot {
            update = update.with_snapshot(snapshot_id.clone());
        }
        self.cas(id, update, sleeping).await?;
        let released = governor.release(id).await;
        self.inner.metrics.record_sleep_completed();
        tracing::info!(component_id = id, released, snapshot_id = ?snapshot, "Component dormant");

        if snapshot.is_some() {
            if let Err(e) = self.inner.snapshotter.collect_garbage(id).await {
                tracing::warn!(component_id = id, error = %e, "Snapshot garbage collection failed");
            }
        }
        Ok(())
    }

    async fn capture(&self, id: &str) -> Result<StateSnapshot, WardenError> {
        let plugin = self.require_plugin(id).await?;
        let payload = self
            .step(id, "export", async {
                plugin.export_state().await.map_err(plugin_error(id))
            })
            .await?;
        self.step(id, "save", self.inner.snapshotter.save(id, &payload))
            .await
    }

    /// Take a component out of service. Allowed from any state.
    pub async fn disable(&self, id: &str, reason: &str) -> Result<(), WardenError> {
        let _lease = self.lease(id).await;
        let record = self.record(id).await?;
        if record.state == LifecycleState::Disabled {
            return Ok(());
        }
        self.cas(
            id,
            StateUpdate::to(RestState::Disabled).with_error(reason),
            record.state,
        )
        .await?;
        self.inner.governor.release(id).await;
        self.inner.priority.lock().await.remove(id);
        tracing::info!(component_id = id, from = %record.state, reason, "Component disabled");
        Ok(())
    }

    /// Return a Disabled component to Dormant.
    pub async fn enable(&self, id: &str) -> Result<(), WardenError> {
        let _lease = self.lease(id).await;
        let record = self.record(id).await?;
        if record.state != LifecycleState::Disabled {
            return Err(invalid(id, record.state, "enable"));
        }
        self.cas(id, StateUpdate::to(RestState::Dormant), LifecycleState::Disabled)
            .await?;
        if record.descriptor.criticality == Criticality::Critical {
            self.inner.priority.lock().await.insert(id.to_string());
        }
        tracing::info!(component_id = id, "Component enabled");
        Ok(())
    }

    /// Reconcile records persisted by a previous process. Nothing is
    /// resident after a restart, so Active and interrupted components are
    /// demoted to Dormant.
    pub async fn recover(&self) -> Result<RecoveryReport, WardenError> {
        let mut report = RecoveryReport::default();
        for record in list(self.inner.registry.as_ref(), ComponentFilter::all()).await? {
            let id = record.id();
            let _lease = self.lease(id).await;
            let outcome = match record.state {
                LifecycleState::Active => {
                    report.demoted.push(id.to_string());
                    Some(StateUpdate::to(RestState::Dormant))
                }
                LifecycleState::Transitioning { .. } => {
                    tracing::warn!(component_id = id, state = %record.state, "Transition interrupted by restart");
                    report.interrupted.push(id.to_string());
                    Some(
                        StateUpdate::to(RestState::Dormant)
                            .with_error(format!("{} interrupted by restart", record.state)),
                    )
                }
                _ => None,
            };
            if let Some(update) = outcome {
                if let Err(e) = self.cas(id, update, record.state).await {
                    tracing::error!(component_id = id, error = %e, "Recovery CAS failed");
                    continue;
                }
            }
            if record.descriptor.criticality == Criticality::Critical
                && record.state != LifecycleState::Disabled
            {
                self.inner.priority.lock().await.insert(id.to_string());
                report.queued.push(id.to_string());
            }
        }
        tracing::info!(
            demoted = report.demoted.len(),
            interrupted = report.interrupted.len(),
            queued = report.queued.len(),
            "Registry recovered"
        );
        Ok(report)
    }

    /// Critical components waiting for budget, drained.
    pub async fn take_priority_wakes(&self) -> Vec<String> {
        std::mem::take(&mut *self.inner.priority.lock().await)
            .into_iter()
            .collect()
    }

    pub async fn pending_priority_wakes(&self) -> Vec<String> {
        self.inner.priority.lock().await.iter().cloned().collect()
    }

    async fn lease(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.inner.leases.lock().await.entry(id.to_string()).or_default());
        lock.lock_owned().await
    }

    /// CAS with bounded retries. A conflict is only retried while the stored
    /// state still matches `expected`.
    async fn cas(
        &self,
        id: &str,
        update: StateUpdate,
        expected: LifecycleState,
    ) -> Result<ComponentRecord, WardenError> {
        let mut attempt = 0;
        loop {
            match self
                .inner
                .registry
                .update_state(id, update.clone(), expected)
                .await
            {
                Ok(record) => {
                    tracing::debug!(
                        component_id = id,
                        from = %expected,
                        to = %record.state,
                        version = record.version,
                        "State committed"
                    );
                    return Ok(record);
                }
                Err(err @ WardenError::ConflictCas { .. })
                    if attempt < self.inner.settings.cas_retries =>
                {
                    attempt += 1;
                    if self.state(id).await? != expected {
                        return Err(err);
                    }
                    tracing::debug!(component_id = id, attempt, "CAS conflict, retrying");
                    tokio::task::yield_now().await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn step<T>(
        &self,
        id: &str,
        step: &'static str,
        fut: impl Future<Output = Result<T, WardenError>>,
    ) -> Result<T, WardenError> {
        let timeout = self.inner.settings.step_timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(component_id = id, step, "Transition step timed out");
                Err(WardenError::TransitionTimeout {
                    id: id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Run a transition under the whole-transition timeout. The caller holds
    /// the lease. On expiry the component is forced to Disabled.
    async fn bounded(
        &self,
        id: &str,
        transition: impl Future<Output = Result<(), WardenError>>,
    ) -> Result<(), WardenError> {
        let timeout = self.inner.settings.transition_timeout;
        match tokio::time::timeout(timeout, transition).await {
            Ok(result) => result,
            Err(_) => {
                let err = WardenError::TransitionTimeout {
                    id: id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                self.force_disable(id, &err).await;
                Err(err)
            }
        }
    }

    async fn force_disable(&self, id: &str, err: &WardenError) {
        let governor = &self.inner.governor;
        governor.release(id).await;
        governor.abandon_plan(id).await;
        self.inner.priority.lock().await.remove(id);
        tracing::error!(
            component_id = id,
            error = %err,
            alert = true,
            "Transition exceeded its timeout; disabling component"
        );
        match self.state(id).await {
            Ok(state) if state.is_transitioning() => {
                let update = StateUpdate::to(RestState::Disabled).with_error(err.to_string());
                if let Err(e) = self.cas(id, update, state).await {
                    tracing::error!(component_id = id, error = %e, "Forced disable did not commit");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::error!(component_id = id, error = %e, "Cannot read state for forced disable"),
        }
    }
}
