use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use warden_core::{ComponentPlugin, PluginError, PluginFuture};

/// Scriptable plugin for unit tests.
#[derive(Default)]
pub struct MockPlugin {
    pub state: Mutex<Vec<u8>>,
    pub calls: AtomicU32,
    pub imports: AtomicU32,
    pub exports: AtomicU32,
    pub fail_calls: AtomicBool,
    pub fail_export: AtomicBool,
    pub unhealthy: AtomicBool,
    pub import_delay: Duration,
    pub export_delay: Duration,
    pub health_delay: Duration,
}

impl MockPlugin {
    pub fn with_state(state: &[u8]) -> Self {
        Self {
            state: Mutex::new(state.to_vec()),
            ..Self::default()
        }
    }

    pub fn state(&self) -> Vec<u8> {
        self.state.lock().unwrap().clone()
    }

    pub fn set_state(&self, state: &[u8]) {
        *self.state.lock().unwrap() = state.to_vec();
    }
}

impl ComponentPlugin for MockPlugin {
    fn call<'a>(&'a self, request: &'a Value) -> PluginFuture<'a, Result<Value, PluginError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_calls.load(Ordering::SeqCst) {
                return Err(PluginError::new("detector crashed"));
            }
            Ok(json!({ "echo": request }))
        })
    }

    fn export_state(&self) -> PluginFuture<'_, Result<Vec<u8>, PluginError>> {
        Box::pin(async move {
            if !self.export_delay.is_zero() {
                tokio::time::sleep(self.export_delay).await;
            }
            self.exports.fetch_add(1, Ordering::SeqCst);
            if self.fail_export.load(Ordering::SeqCst) {
                return Err(PluginError::new("export failed"));
            }
            Ok(self.state())
        })
    }

    fn import_state(&self, state: Vec<u8>) -> PluginFuture<'_, Result<(), PluginError>> {
        Box::pin(async move {
            if !self.import_delay.is_zero() {
                tokio::time::sleep(self.import_delay).await;
            }
            self.set_state(&state);
            self.imports.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn health_check(&self) -> PluginFuture<'_, bool> {
        Box::pin(async move {
            if !self.health_delay.is_zero() {
                tokio::time::sleep(self.health_delay).await;
            }
            !self.unhealthy.load(Ordering::SeqCst)
        })
    }
}
