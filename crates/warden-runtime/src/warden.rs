use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use warden_core::{
    ComponentDescriptor, ComponentPlugin, ComponentRecord, FileRegistry, InMemoryRegistry,
    RegistryStore, WardenConfig, WardenError,
};

use crate::admin::AdminApi;
use crate::admission::AdmissionGovernor;
use crate::blob::{BlobStore, FileBlobStore, InMemoryBlobStore};
use crate::breaker::CircuitBreakers;
use crate::gateway::InvocationGateway;
use crate::health::{HealthMonitor, HealthSettings};
use crate::lifecycle::{LifecycleController, LifecycleSettings, RecoveryReport};
use crate::metrics::{GovernorMetrics, MetricsBackend};
use crate::rate_limit::{RateLimit, RateLimits};
use crate::snapshot::StateSnapshotter;

/// A fully wired governor: one registry, one budget, one gateway.
pub struct Warden {
    config: WardenConfig,
    controller: LifecycleController,
    gateway: InvocationGateway,
    monitor: HealthMonitor,
    admin: AdminApi,
}

pub struct WardenBuilder {
    config: WardenConfig,
    registry: Option<Arc<dyn RegistryStore>>,
    blobs: Option<Arc<dyn BlobStore>>,
    metrics_backend: Option<Arc<dyn MetricsBackend>>,
}

impl WardenBuilder {
    pub fn registry(mut self, registry: Arc<dyn RegistryStore>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn metrics_backend(mut self, backend: Arc<dyn MetricsBackend>) -> Self {
        self.metrics_backend = Some(backend);
        self
    }

    /// Wire everything together. Stores not supplied are kept in memory.
    pub fn build(self) -> Result<Warden, WardenError> {
        let config = self.config;
        config.validate()?;

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(InMemoryRegistry::new()));
        let blobs = self
            .blobs
            .unwrap_or_else(|| Arc::new(InMemoryBlobStore::new()));
        let metrics = Arc::new(match self.metrics_backend {
            Some(backend) => GovernorMetrics::with_backend(backend),
            None => GovernorMetrics::new(),
        });

        let snapshotter = Arc::new(StateSnapshotter::new(
            blobs,
            config.snapshots.retention_count,
        ));
        let governor = Arc::new(AdmissionGovernor::new(
            config.budget.capacity,
            config.demand_half_life(),
        ));
        let controller = LifecycleController::new(
            registry,
            snapshotter,
            governor,
            metrics,
            LifecycleSettings::from_config(&config),
        );
        let monitor = HealthMonitor::new(controller.clone(), HealthSettings::from_config(&config));
        let breakers = Arc::new(CircuitBreakers::new(
            config.breaker.failure_threshold,
            config.reset_timeout(),
        ));
        let limits = RateLimits::new(RateLimit {
            per_second: config.rate_limit.per_second,
            burst: config.rate_limit.burst(),
        })?;
        let gateway = InvocationGateway::new(
            controller.clone(),
            Arc::clone(&breakers),
            limits,
            monitor.clone(),
            config.wake_deadline(),
        );
        let admin = AdminApi::new(controller.clone(), config.wake_deadline()).with_breakers(breakers);

        Ok(Warden {
            config,
            controller,
            gateway,
            monitor,
            admin,
        })
    }
}

impl Warden {
    pub fn builder(config: WardenConfig) -> WardenBuilder {
        WardenBuilder {
            config,
            registry: None,
            blobs: None,
            metrics_backend: None,
        }
    }

    pub fn in_memory(config: WardenConfig) -> Result<Self, WardenError> {
        Self::builder(config).build()
    }

    /// Open the file-backed stores under the configured directories and load
    /// the snapshot index. Does not touch lifecycle state; call `recover`
    /// before serving traffic.
    pub async fn open(config: WardenConfig) -> Result<Self, WardenError> {
        let registry = FileRegistry::new(config.storage.registry_dir());
        registry.init().await?;
        let blobs = FileBlobStore::new(config.storage.snapshot_dir());
        blobs.init().await?;
        tracing::info!(
            registry = %registry.base_dir().display(),
            snapshots = %blobs.base_dir().display(),
            capacity = config.budget.capacity,
            "Opening warden stores"
        );

        let warden = Self::builder(config)
            .registry(Arc::new(registry))
            .blob_store(Arc::new(blobs))
            .build()?;
        warden.controller.snapshotter().load_index().await?;
        Ok(warden)
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn controller(&self) -> &LifecycleController {
        &self.controller
    }

    pub fn gateway(&self) -> &InvocationGateway {
        &self.gateway
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    pub fn admin(&self) -> &AdminApi {
        &self.admin
    }

    pub fn metrics(&self) -> &Arc<GovernorMetrics> {
        self.controller.metrics()
    }

    pub async fn recover(&self) -> Result<RecoveryReport, WardenError> {
        self.controller.recover().await
    }

    pub async fn register(
        &self,
        descriptor: ComponentDescriptor,
        plugin: Arc<dyn ComponentPlugin>,
    ) -> Result<ComponentRecord, WardenError> {
        self.controller.register(descriptor, plugin).await
    }

    pub async fn attach(
        &self,
        id: &str,
        plugin: Arc<dyn ComponentPlugin>,
    ) -> Result<(), WardenError> {
        self.controller.attach(id, plugin).await
    }

    pub async fn invoke(&self, id: &str, request: &Value) -> Result<Value, WardenError> {
        self.gateway.invoke(id, request).await
    }

    pub async fn emergency(&self, id: &str) -> Result<(), WardenError> {
        self.monitor.emergency(id).await
    }

    /// Start the periodic health sweep. It stops when `shutdown` flips to
    /// true.
    pub fn spawn_monitor(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.monitor.spawn(shutdown)
    }
}
