use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

/// Error reported by a component's own logic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct PluginError(pub String);

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type PluginFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The fixed capability interface every governed component implements.
///
/// The governor depends on nothing else; a component's detection logic stays
/// opaque. Uses boxed futures so the trait stays dyn-compatible.
pub trait ComponentPlugin: Send + Sync {
    /// Serve a single request.
    fn call<'a>(
        &'a self,
        request: &'a serde_json::Value,
    ) -> PluginFuture<'a, Result<serde_json::Value, PluginError>>;

    /// Serialize in-memory state (model weights, caches) for dormancy.
    ///
    /// Stateless components never have this called.
    fn export_state(&self) -> PluginFuture<'_, Result<Vec<u8>, PluginError>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    /// Restore state previously produced by `export_state`.
    fn import_state(&self, state: Vec<u8>) -> PluginFuture<'_, Result<(), PluginError>> {
        let _ = state;
        Box::pin(async { Ok(()) })
    }

    /// Lightweight liveness probe.
    fn health_check(&self) -> PluginFuture<'_, bool>;
}
