use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use warden_core::registry::list;
use warden_core::{ComponentFilter, ComponentPlugin, StateKind, WardenConfig, WardenError};

use crate::lifecycle::LifecycleController;
use crate::wake::{PendingWake, WakeQueue, WakeReason, WakeReply, WakeRequest};

/// How an invocation ended, as seen by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    Failure,
    /// Refused before reaching the component (rate limit, breaker, wake).
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeOutcome {
    Healthy,
    Failed,
    /// Still pending after the hard timeout.
    Unresponsive,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ComponentHealth {
    pub consecutive_probe_failures: u32,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
    pub last_probe_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub probed: usize,
    pub healthy: usize,
    pub slept: Vec<String>,
    pub disabled: Vec<String>,
    pub wakes_dispatched: usize,
    pub wakes_expired: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthSettings {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub hard_timeout: Duration,
    pub failure_limit: u32,
    pub wake_deadline: Duration,
}

impl HealthSettings {
    pub fn from_config(config: &WardenConfig) -> Self {
        Self {
            interval: config.health_interval(),
            probe_timeout: config.probe_timeout(),
            hard_timeout: config.hard_timeout().max(config.probe_timeout()),
            failure_limit: config.health.failure_limit.max(1),
            wake_deadline: config.wake_deadline(),
        }
    }
}

struct MonitorInner {
    controller: LifecycleController,
    settings: HealthSettings,
    health: Mutex<HashMap<String, ComponentHealth>>,
    queue: Mutex<WakeQueue>,
}

/// Probes Active components and feeds wake requests to the controller.
///
/// Wake requests are served from a priority queue: emergency signals first,
/// then Critical components waiting for budget, then warmups, then the rest.
/// Nothing here bypasses the admission governor.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

async fn probe(
    plugin: Arc<dyn ComponentPlugin>,
    probe_timeout: Duration,
    hard_timeout: Duration,
) -> ProbeOutcome {
    let mut check = plugin.health_check();
    match tokio::time::timeout(probe_timeout, &mut check).await {
        Ok(true) => ProbeOutcome::Healthy,
        Ok(false) => ProbeOutcome::Failed,
        Err(_) => match tokio::time::timeout(hard_timeout.saturating_sub(probe_timeout), check).await {
            // Answered, but too late to count as healthy.
            Ok(_) => ProbeOutcome::Failed,
            Err(_) => ProbeOutcome::Unresponsive,
        },
    }
}

impl HealthMonitor {
    pub fn new(controller: LifecycleController, settings: HealthSettings) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                controller,
                settings,
                health: Mutex::new(HashMap::new()),
                queue: Mutex::new(WakeQueue::new()),
            }),
        }
    }

    /// Record an invocation outcome. Calls that reached the component count
    /// towards its demand.
    pub async fn observe(&self, component_id: &str, outcome: CallOutcome) {
        {
            let mut health = self.inner.health.lock().await;
            let entry = health.entry(component_id.to_string()).or_default();
            match outcome {
                CallOutcome::Success => entry.successes += 1,
                CallOutcome::Failure => entry.failures += 1,
                CallOutcome::Rejected => entry.rejections += 1,
            }
        }
        if outcome != CallOutcome::Rejected {
            self.inner
                .controller
                .governor()
                .record_demand(component_id)
                .await;
        }
    }

    pub async fn health(&self, component_id: &str) -> ComponentHealth {
        self.inner
            .health
            .lock()
            .await
            .get(component_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Queue a wake request for the next drain.
    pub async fn submit(&self, request: WakeRequest) -> Result<u64, WardenError> {
        let record = self.inner.controller.record(&request.component_id).await?;
        tracing::debug!(
            component_id = %request.component_id,
            reason = %request.reason,
            "Wake request queued"
        );
        Ok(self
            .inner
            .queue
            .lock()
            .await
            .push(request, record.descriptor.criticality))
    }

    /// Wake `component_id` ahead of everything else queued. The budget check
    /// still applies.
    ///
    /// Earlier emergencies are served first. Whoever serves this request,
    /// this caller or a concurrent one, sends its outcome back here.
    pub async fn emergency(&self, component_id: &str) -> Result<(), WardenError> {
        tracing::warn!(component_id, "Emergency wake signal");
        let record = self.inner.controller.record(component_id).await?;
        let request = WakeRequest::new(
            component_id,
            WakeReason::EmergencySignal,
            self.inner.settings.wake_deadline,
        );
        let (tx, mut rx) = oneshot::channel();
        self.inner
            .queue
            .lock()
            .await
            .push_with_reply(request, record.descriptor.criticality, tx);

        loop {
            match rx.try_recv() {
                Ok(reply) => return self.emergency_outcome(component_id, reply),
                Err(TryRecvError::Closed) => return Err(self.unanswered(component_id)),
                Err(TryRecvError::Empty) => {}
            }
            let next = self.inner.queue.lock().await.pop_emergency();
            match next {
                Some(pending) => {
                    self.serve(pending).await;
                }
                // Ours was taken by a concurrent caller; wait for its answer.
                None => {
                    return match rx.await {
                        Ok(reply) => self.emergency_outcome(component_id, reply),
                        Err(_) => Err(self.unanswered(component_id)),
                    };
                }
            }
        }
    }

    fn emergency_outcome(&self, component_id: &str, reply: WakeReply) -> Result<(), WardenError> {
        reply.unwrap_or_else(|| {
            Err(WardenError::WakeTimeout {
                id: component_id.to_string(),
                deadline_ms: self.inner.settings.wake_deadline.as_millis() as u64,
            })
        })
    }

    fn unanswered(&self, component_id: &str) -> WardenError {
        WardenError::Storage(format!("emergency wake for {component_id} was dropped unserved"))
    }

    /// Dispatch on a task of its own and report back to the submitter. A
    /// server that goes away mid-dispatch still delivers the outcome.
    async fn serve(&self, pending: PendingWake) -> WakeReply {
        let monitor = self.clone();
        tokio::spawn(async move {
            let outcome = monitor.dispatch(pending.request.clone()).await;
            pending.respond(outcome.clone());
            outcome
        })
        .await
        .unwrap_or_else(|e| {
            Some(Err(WardenError::Storage(format!(
                "wake dispatch task failed: {e}"
            ))))
        })
    }

    /// `None` when the request had already expired.
    async fn dispatch(&self, request: WakeRequest) -> WakeReply {
        if request.is_expired() {
            tracing::debug!(component_id = %request.component_id, "Discarding expired wake request");
            return None;
        }
        let id = request.component_id.clone();
        let result = self.inner.controller.wake(request).await;
        if let Err(e) = &result {
            tracing::warn!(component_id = %id, error = %e, "Queued wake failed");
        }
        Some(result)
    }

    /// Serve every queued wake request, highest priority first.
    pub async fn drain_wake_queue(&self) -> (usize, usize) {
        let mut dispatched = 0;
        let mut expired = 0;
        loop {
            let next = self.inner.queue.lock().await.pop();
            let Some(pending) = next else { break };
            match self.serve(pending).await {
                Some(_) => dispatched += 1,
                None => expired += 1,
            }
        }
        (dispatched, expired)
    }

    pub async fn queued(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    /// One monitoring pass: probe every Active component, act on the
    /// results, then serve pending wakes.
    pub async fn sweep(&self) -> Result<SweepReport, WardenError> {
        let controller = &self.inner.controller;
        let settings = self.inner.settings;
        let mut report = SweepReport::default();

        let active = list(
            controller.registry().as_ref(),
            ComponentFilter::in_state(StateKind::Active),
        )
        .await?;
        let mut probes = JoinSet::new();
        for record in active {
            let Some(plugin) = controller.plugin(record.id()).await else {
                continue;
            };
            let id = record.id().to_string();
            probes.spawn(async move {
                let outcome = probe(plugin, settings.probe_timeout, settings.hard_timeout).await;
                (id, outcome)
            });
        }
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((id, outcome)) => {
                    report.probed += 1;
                    self.apply_probe(&id, outcome, &mut report).await;
                }
                Err(e) => tracing::error!(error = %e, "Health probe task panicked"),
            }
        }

        for id in controller.take_priority_wakes().await {
            let request = WakeRequest::new(id, WakeReason::ScheduledWarmup, settings.wake_deadline);
            if let Err(e) = self.submit(request).await {
                tracing::warn!(error = %e, "Dropping priority wake");
            }
        }
        let (dispatched, expired) = self.drain_wake_queue().await;
        report.wakes_dispatched = dispatched;
        report.wakes_expired = expired;

        tracing::debug!(
            probed = report.probed,
            healthy = report.healthy,
            slept = report.slept.len(),
            disabled = report.disabled.len(),
            wakes = dispatched,
            "Health sweep complete"
        );
        Ok(report)
    }

    async fn apply_probe(&self, id: &str, outcome: ProbeOutcome, report: &mut SweepReport) {
        let controller = &self.inner.controller;
        let failures = {
            let mut health = self.inner.health.lock().await;
            let entry = health.entry(id.to_string()).or_default();
            entry.last_probe_at = Some(Utc::now());
            match outcome {
                ProbeOutcome::Healthy => entry.consecutive_probe_failures = 0,
                _ => entry.consecutive_probe_failures += 1,
            }
            entry.consecutive_probe_failures
        };

        match outcome {
            ProbeOutcome::Healthy => report.healthy += 1,
            ProbeOutcome::Unresponsive => {
                let hard_ms = self.inner.settings.hard_timeout.as_millis() as u64;
                tracing::error!(
                    component_id = id,
                    hard_timeout_ms = hard_ms,
                    alert = true,
                    "Component unresponsive; disabling"
                );
                let reason = format!("health probe unresponsive after {hard_ms}ms");
                match controller.disable(id, &reason).await {
                    Ok(()) => {
                        self.reset_probe_failures(id).await;
                        report.disabled.push(id.to_string());
                    }
                    Err(e) => tracing::error!(component_id = id, error = %e, "Disable failed"),
                }
            }
            ProbeOutcome::Failed if failures >= self.inner.settings.failure_limit => {
                tracing::warn!(component_id = id, failures, "Health probes failing; putting component to sleep");
                match controller.sleep(id).await {
                    Ok(()) => {
                        self.reset_probe_failures(id).await;
                        report.slept.push(id.to_string());
                    }
                    Err(e) => {
                        tracing::warn!(component_id = id, error = %e, "Sleep after failed probes abandoned; retrying next sweep");
                    }
                }
            }
            ProbeOutcome::Failed => {
                tracing::debug!(component_id = id, failures, "Health probe failed");
            }
        }
    }

    async fn reset_probe_failures(&self, id: &str) {
        if let Some(entry) = self.inner.health.lock().await.get_mut(id) {
            entry.consecutive_probe_failures = 0;
        }
    }

    /// Run `sweep` every interval until `shutdown` flips to true or its
    /// sender is dropped.
    pub fn spawn(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.inner.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                interval_ms = monitor.inner.settings.interval.as_millis() as u64,
                "Health monitor started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.sweep().await {
                            tracing::error!(error = %e, "Health sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Health monitor stopped");
        })
    }
}
