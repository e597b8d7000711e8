#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use warden_core::{
    ComponentDescriptor, ComponentPlugin, Criticality, LifecycleState, PluginError, PluginFuture,
    WardenConfig,
};
use warden_runtime::Warden;

/// A detector whose state is an opaque byte blob (think: compiled rule set).
#[derive(Default)]
pub struct Detector {
    state: Mutex<Vec<u8>>,
    pub calls: AtomicU32,
    pub imports: AtomicU32,
    failing: AtomicBool,
    import_delay_ms: AtomicU64,
}

impl Detector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_rules(rules: &[u8]) -> Arc<Self> {
        let d = Self::default();
        *d.state.lock().unwrap() = rules.to_vec();
        Arc::new(d)
    }

    pub fn rules(&self) -> Vec<u8> {
        self.state.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().clear();
    }

    pub fn slow_import(&self, delay: Duration) {
        self.import_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl ComponentPlugin for Detector {
    fn call<'a>(&'a self, request: &'a Value) -> PluginFuture<'a, Result<Value, PluginError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(PluginError::new("scan engine crashed"));
            }
            Ok(json!({ "verdict": "clean", "input": request }))
        })
    }

    fn export_state(&self) -> PluginFuture<'_, Result<Vec<u8>, PluginError>> {
        Box::pin(async move { Ok(self.rules()) })
    }

    fn import_state(&self, state: Vec<u8>) -> PluginFuture<'_, Result<(), PluginError>> {
        Box::pin(async move {
            let delay = self.import_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            *self.state.lock().unwrap() = state;
            self.imports.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn health_check(&self) -> PluginFuture<'_, bool> {
        Box::pin(async { true })
    }
}

pub fn config(capacity: u64) -> WardenConfig {
    let mut config = WardenConfig::default();
    config.budget.capacity = capacity;
    config
}

pub async fn add(
    warden: &Warden,
    id: &str,
    criticality: Criticality,
    cost: u64,
) -> Arc<Detector> {
    let detector = Detector::with_rules(id.as_bytes());
    warden
        .register(ComponentDescriptor::new(id, criticality, cost), detector.clone())
        .await
        .unwrap();
    detector
}

pub async fn state(warden: &Warden, id: &str) -> LifecycleState {
    warden.controller().state(id).await.unwrap()
}
