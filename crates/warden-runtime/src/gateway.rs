use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use warden_core::{ComponentPlugin, LifecycleState, WardenError};

use crate::breaker::{CircuitBreakers, Permit};
use crate::health::{CallOutcome, HealthMonitor};
use crate::lifecycle::LifecycleController;
use crate::metrics::GovernorMetrics;
use crate::rate_limit::{RateLimit, RateLimits};
use crate::wake::{WakeReason, WakeRequest};

/// Front door for every call to a governed component.
///
/// Order per call: registry lookup, rate limit, breaker, wake if Dormant,
/// call. Rate-limited and breaker-rejected calls never trigger a wake.
/// Unknown ids are refused before any per-component state is created.
pub struct InvocationGateway {
    controller: LifecycleController,
    breakers: Arc<CircuitBreakers>,
    limits: RateLimits,
    monitor: HealthMonitor,
    metrics: Arc<GovernorMetrics>,
    wake_deadline: Duration,
}

impl InvocationGateway {
    pub fn new(
        controller: LifecycleController,
        breakers: Arc<CircuitBreakers>,
        limits: RateLimits,
        monitor: HealthMonitor,
        wake_deadline: Duration,
    ) -> Self {
        let metrics = Arc::clone(controller.metrics());
        Self {
            controller,
            breakers,
            limits,
            monitor,
            metrics,
            wake_deadline,
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    pub async fn set_rate_limit(
        &self,
        component_id: &str,
        limit: RateLimit,
    ) -> Result<(), WardenError> {
        self.controller.record(component_id).await?;
        self.limits.set_limit(component_id, limit).await
    }

    pub async fn invoke(&self, component_id: &str, request: &Value) -> Result<Value, WardenError> {
        self.metrics.record_invocation();
        self.controller.record(component_id).await?;

        if let Err(e) = self.limits.check(component_id).await {
            self.metrics.record_rate_limited();
            self.monitor.observe(component_id, CallOutcome::Rejected).await;
            return Err(e);
        }

        let permit = match self.breakers.acquire(component_id).await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::debug!(component_id, "Call rejected by open circuit");
                self.monitor.observe(component_id, CallOutcome::Rejected).await;
                return Err(e);
            }
        };

        let plugin = match self.ready(component_id).await {
            Ok(plugin) => plugin,
            Err(e) => {
                // Not the component's fault; the probe slot goes back.
                self.breakers.abandon(component_id, permit).await;
                self.monitor.observe(component_id, CallOutcome::Rejected).await;
                return Err(e);
            }
        };

        match plugin.call(request).await {
            Ok(response) => {
                self.breakers.record_success(component_id, permit).await;
                self.monitor.observe(component_id, CallOutcome::Success).await;
                Ok(response)
            }
            Err(e) => {
                if self.breakers.record_failure(component_id, permit).await {
                    self.metrics.record_breaker_opened();
                }
                self.monitor.observe(component_id, CallOutcome::Failure).await;
                tracing::warn!(
                    component_id,
                    probe = permit == Permit::Probe,
                    error = %e,
                    "Component call failed"
                );
                Err(WardenError::Plugin {
                    id: component_id.to_string(),
                    message: e.0,
                })
            }
        }
    }

    /// Make sure the component is Active, waking it within the deadline.
    async fn ready(&self, component_id: &str) -> Result<Arc<dyn ComponentPlugin>, WardenError> {
        match self.controller.state(component_id).await? {
            LifecycleState::Active => {}
            LifecycleState::Disabled => {
                return Err(WardenError::ComponentDisabled(component_id.to_string()));
            }
            LifecycleState::Dormant | LifecycleState::Transitioning { .. } => {
                let request =
                    WakeRequest::new(component_id, WakeReason::ManualCall, self.wake_deadline);
                self.controller.wake(request).await?;
            }
        }
        self.controller
            .plugin(component_id)
            .await
            .ok_or_else(|| WardenError::Plugin {
                id: component_id.to_string(),
                message: "no plugin attached".into(),
            })
    }
}
