use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use warden_core::WardenError;

use crate::blob::{BlobStore, StateSnapshot};

#[derive(Default)]
struct SnapshotIndex {
    /// component_id → snapshots, oldest first
    by_component: HashMap<String, Vec<StateSnapshot>>,
    /// component_id → last version handed out
    versions: HashMap<String, u64>,
}

/// snapshot_id → number of in-flight restores holding it
type PinTable = Arc<StdMutex<HashMap<String, usize>>>;

fn is_pinned(pins: &PinTable, snapshot_id: &str) -> bool {
    pins.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(snapshot_id)
        .is_some_and(|n| *n > 0)
}

/// Keeps a snapshot out of garbage collection until dropped.
///
/// Released on drop so a transition cancelled mid-restore cannot leak it.
pub struct SnapshotPin {
    pins: PinTable,
    snapshot_id: String,
}

impl SnapshotPin {
    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }
}

impl Drop for SnapshotPin {
    fn drop(&mut self) {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(n) = pins.get_mut(&self.snapshot_id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                pins.remove(&self.snapshot_id);
            }
        }
    }
}

impl SnapshotIndex {
    fn insert(&mut self, meta: StateSnapshot) {
        let versions = self.versions.entry(meta.component_id.clone()).or_default();
        *versions = (*versions).max(meta.version);
        let list = self.by_component.entry(meta.component_id.clone()).or_default();
        list.retain(|s| s.snapshot_id != meta.snapshot_id);
        list.push(meta);
        list.sort_by_key(|s| s.version);
    }
}

/// Sole owner of snapshot bytes.
///
/// Saves compute a checksum and read the blob back before returning, so a
/// returned snapshot is durable and verified. Restores verify the checksum
/// before a single byte reaches a component.
pub struct StateSnapshotter {
    store: Arc<dyn BlobStore>,
    retention: usize,
    index: Mutex<SnapshotIndex>,
    pins: PinTable,
}

pub fn snapshot_id_for(component_id: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(component_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

pub fn checksum(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

impl StateSnapshotter {
    pub fn new(store: Arc<dyn BlobStore>, retention: usize) -> Self {
        Self {
            store,
            retention: retention.max(1),
            index: Mutex::new(SnapshotIndex::default()),
            pins: Arc::default(),
        }
    }

    /// Rebuild the in-memory index from the blob store (e.g. after a restart).
    pub async fn load_index(&self) -> Result<usize, WardenError> {
        let metas = self.store.list().await?;
        let count = metas.len();
        let mut index = self.index.lock().await;
        for meta in metas {
            index.insert(meta);
        }
        tracing::info!(count, backend = self.store.backend_name(), "Snapshot index loaded");
        Ok(count)
    }

    /// Persist `payload` as the newest snapshot of `component_id`.
    pub async fn save(
        &self,
        component_id: &str,
        payload: &[u8],
    ) -> Result<StateSnapshot, WardenError> {
        let snapshot_id = snapshot_id_for(component_id, payload);
        let version = {
            let mut index = self.index.lock().await;
            let v = index.versions.entry(component_id.to_string()).or_default();
            *v += 1;
            *v
        };

        let meta = StateSnapshot {
            snapshot_id: snapshot_id.clone(),
            component_id: component_id.to_string(),
            version,
            checksum: checksum(payload),
            saved_at: Utc::now(),
            size: payload.len() as u64,
        };
        self.store.put(&meta, payload).await?;

        let (stored, bytes) = self
            .store
            .get(&snapshot_id)
            .await?
            .ok_or_else(|| WardenError::SnapshotNotFound(snapshot_id.clone()))?;
        if checksum(&bytes) != meta.checksum || stored.checksum != meta.checksum {
            tracing::error!(
                component_id,
                snapshot_id = %snapshot_id,
                alert = true,
                "Snapshot failed read-back verification"
            );
            return Err(WardenError::ChecksumMismatch { snapshot_id });
        }
        // Identical payloads share an id; re-saving one makes it the newest.
        if stored.version != meta.version {
            self.store.update_meta(&meta).await?;
        }

        self.index.lock().await.insert(meta.clone());
        tracing::info!(
            component_id,
            snapshot_id = %meta.snapshot_id,
            version,
            size = meta.size,
            "Snapshot saved"
        );
        Ok(meta)
    }

    /// Return the verified payload of `snapshot_id`.
    pub async fn restore(&self, snapshot_id: &str) -> Result<Vec<u8>, WardenError> {
        let (meta, payload) = self
            .store
            .get(snapshot_id)
            .await?
            .ok_or_else(|| WardenError::SnapshotNotFound(snapshot_id.to_string()))?;
        if checksum(&payload) != meta.checksum {
            tracing::error!(
                snapshot_id,
                component_id = %meta.component_id,
                alert = true,
                "Snapshot checksum mismatch on restore"
            );
            return Err(WardenError::ChecksumMismatch {
                snapshot_id: snapshot_id.to_string(),
            });
        }
        tracing::debug!(snapshot_id, component_id = %meta.component_id, "Snapshot restored");
        Ok(payload)
    }

    /// Delete a snapshot. Refused while an in-flight restore holds it.
    pub async fn delete(&self, snapshot_id: &str) -> Result<(), WardenError> {
        let mut index = self.index.lock().await;
        if is_pinned(&self.pins, snapshot_id) {
            return Err(WardenError::Storage(format!(
                "snapshot {snapshot_id} is pinned by an in-flight transition"
            )));
        }
        self.store.delete(snapshot_id).await?;
        for list in index.by_component.values_mut() {
            list.retain(|s| s.snapshot_id != snapshot_id);
        }
        Ok(())
    }

    /// Hold `snapshot_id` against deletion for the lifetime of the guard.
    pub fn pin(&self, snapshot_id: &str) -> SnapshotPin {
        *self
            .pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(snapshot_id.to_string())
            .or_default() += 1;
        SnapshotPin {
            pins: Arc::clone(&self.pins),
            snapshot_id: snapshot_id.to_string(),
        }
    }

    pub async fn latest(&self, component_id: &str) -> Option<StateSnapshot> {
        let index = self.index.lock().await;
        index
            .by_component
            .get(component_id)
            .and_then(|list| list.last().cloned())
    }

    pub async fn snapshots(&self, component_id: &str) -> Vec<StateSnapshot> {
        let index = self.index.lock().await;
        index
            .by_component
            .get(component_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Delete snapshots of `component_id` beyond the newest `retention` that
    /// no transition currently references. Returns how many were removed.
    pub async fn collect_garbage(&self, component_id: &str) -> Result<usize, WardenError> {
        let mut index = self.index.lock().await;
        let Some(list) = index.by_component.get(component_id) else {
            return Ok(0);
        };
        let cutoff = list.len().saturating_sub(self.retention);
        let doomed: Vec<String> = list[..cutoff]
            .iter()
            .map(|s| s.snapshot_id.clone())
            .filter(|id| !is_pinned(&self.pins, id))
            .collect();

        for id in &doomed {
            self.store.delete(id).await?;
        }
        if let Some(list) = index.by_component.get_mut(component_id) {
            list.retain(|s| !doomed.contains(&s.snapshot_id));
        }
        if !doomed.is_empty() {
            tracing::info!(component_id, removed = doomed.len(), "Snapshots garbage-collected");
        }
        Ok(doomed.len())
    }

    /// Run garbage collection for every indexed component.
    pub async fn collect_all_garbage(&self) -> Result<usize, WardenError> {
        let components: Vec<String> = {
            let index = self.index.lock().await;
            index.by_component.keys().cloned().collect()
        };
        let mut removed = 0;
        for component_id in components {
            removed += self.collect_garbage(&component_id).await?;
        }
        Ok(removed)
    }
}
