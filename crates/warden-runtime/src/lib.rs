//! Runtime half of warden: keeps a fleet of security-analysis components
//! inside a fixed resource budget.
//!
//! [`Warden`] wires the parts together:
//!
//! - [`LifecycleController`] moves components between Active, Dormant and
//!   Disabled, one lease-held transition at a time.
//! - [`StateSnapshotter`] owns every snapshot byte; restores are checksummed.
//! - [`AdmissionGovernor`] charges the budget and plans evictions.
//! - [`InvocationGateway`] rate-limits, breaks circuits and wakes on demand.
//! - [`HealthMonitor`] probes Active components and serves wake requests.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use warden_core::{ComponentDescriptor, ComponentPlugin, Criticality, WardenConfig};
//! use warden_runtime::Warden;
//!
//! # async fn run(scanner: Arc<dyn ComponentPlugin>) -> Result<(), warden_core::WardenError> {
//! let warden = Warden::open(WardenConfig::default()).await?;
//! warden.recover().await?;
//!
//! warden
//!     .register(ComponentDescriptor::new("yara-scanner", Criticality::High, 30), scanner)
//!     .await?;
//!
//! // Wakes the scanner if it is Dormant, then calls it.
//! let verdict = warden
//!     .invoke("yara-scanner", &serde_json::json!({"path": "/tmp/sample.exe"}))
//!     .await?;
//! # let _ = verdict;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod admission;
pub mod blob;
pub mod breaker;
pub mod demand;
pub mod gateway;
pub mod health;
pub mod lifecycle;
pub mod metrics;
pub mod rate_limit;
pub mod snapshot;
pub mod wake;
pub mod warden;

#[cfg(test)]
mod test_support;

pub use admin::{AdminApi, BudgetStatus, ComponentStatus};
pub use admission::{Admission, AdmissionGovernor, ResourceBudget};
pub use blob::{BlobStore, FileBlobStore, InMemoryBlobStore, StateSnapshot};
pub use breaker::{BreakerRecord, BreakerState, CircuitBreakers};
pub use gateway::InvocationGateway;
pub use health::{CallOutcome, HealthMonitor, SweepReport};
pub use lifecycle::{LifecycleController, RecoveryReport};
pub use metrics::{GovernorMetrics, LoggingMetricsBackend, MetricsBackend, MetricsSnapshot};
pub use rate_limit::RateLimit;
pub use snapshot::StateSnapshotter;
pub use wake::{WakeReason, WakeRequest};
pub use warden::{Warden, WardenBuilder};
