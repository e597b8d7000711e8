use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use warden_core::WardenError;
use warden_core::registry::StoreFuture;

const BLOB_EXT: &str = "blob";
const META_EXT: &str = "meta.json";

/// Metadata of a stored snapshot. The payload bytes live beside it in the
/// blob store and are only ever handed out by the snapshotter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Content address: SHA-256 hex of `component_id || 0x00 || payload`
    pub snapshot_id: String,
    pub component_id: String,
    pub version: u64,
    /// SHA-256 hex of the payload alone
    pub checksum: String,
    pub saved_at: DateTime<Utc>,
    pub size: u64,
}

/// Append-only namespace for snapshot blobs.
///
/// A blob is written once and never mutated in place; `put` of an id that
/// already exists is a no-op. Only its metadata may be rewritten.
pub trait BlobStore: Send + Sync {
    fn put<'a>(&'a self, meta: &'a StateSnapshot, payload: &'a [u8]) -> StoreFuture<'a, ()>;

    /// Replace the metadata of an existing snapshot. `SnapshotNotFound` if
    /// there is none.
    fn update_meta<'a>(&'a self, meta: &'a StateSnapshot) -> StoreFuture<'a, ()>;

    fn get<'a>(&'a self, snapshot_id: &'a str)
    -> StoreFuture<'a, Option<(StateSnapshot, Vec<u8>)>>;

    fn delete<'a>(&'a self, snapshot_id: &'a str) -> StoreFuture<'a, ()>;

    /// Metadata of every stored snapshot, in no particular order.
    fn list(&self) -> StoreFuture<'_, Vec<StateSnapshot>>;

    fn backend_name(&self) -> &str;
}

/// Blob store held in process memory.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, (StateSnapshot, Arc<[u8]>)>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    /// Flip a bit of a stored payload. Only for exercising corruption paths.
    #[cfg(test)]
    pub(crate) async fn flip_bit(&self, snapshot_id: &str) {
        let mut blobs = self.blobs.write().await;
        if let Some((_, bytes)) = blobs.get_mut(snapshot_id) {
            let mut flipped = bytes.to_vec();
            if let Some(b) = flipped.first_mut() {
                *b ^= 0x01;
            } else {
                flipped.push(0x01);
            }
            *bytes = flipped.into();
        }
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put<'a>(&'a self, meta: &'a StateSnapshot, payload: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut blobs = self.blobs.write().await;
            blobs
                .entry(meta.snapshot_id.clone())
                .or_insert_with(|| (meta.clone(), Arc::from(payload)));
            Ok(())
        })
    }

    fn update_meta<'a>(&'a self, meta: &'a StateSnapshot) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            match self.blobs.write().await.get_mut(&meta.snapshot_id) {
                Some((stored, _)) => {
                    *stored = meta.clone();
                    Ok(())
                }
                None => Err(WardenError::SnapshotNotFound(meta.snapshot_id.clone())),
            }
        })
    }

    fn get<'a>(
        &'a self,
        snapshot_id: &'a str,
    ) -> StoreFuture<'a, Option<(StateSnapshot, Vec<u8>)>> {
        Box::pin(async move {
            let blobs = self.blobs.read().await;
            Ok(blobs
                .get(snapshot_id)
                .map(|(meta, bytes)| (meta.clone(), bytes.to_vec())))
        })
    }

    fn delete<'a>(&'a self, snapshot_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.blobs.write().await.remove(snapshot_id);
            Ok(())
        })
    }

    fn list(&self) -> StoreFuture<'_, Vec<StateSnapshot>> {
        Box::pin(async move {
            let blobs = self.blobs.read().await;
            Ok(blobs.values().map(|(meta, _)| meta.clone()).collect())
        })
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

/// Disk-backed blob store.
///
/// Layout under `base_dir`:
/// ```text
/// {base_dir}/
///   {snapshot_id}.blob        - raw payload
///   {snapshot_id}.meta.json   - StateSnapshot metadata
/// ```
///
/// The metadata file is renamed into place last, so a snapshot only becomes
/// visible once its payload is fully on disk.
pub struct FileBlobStore {
    base_dir: PathBuf,
}

impl FileBlobStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".warden")
            .join("snapshots")
    }

    pub async fn init(&self) -> Result<(), WardenError> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn blob_path(&self, snapshot_id: &str) -> PathBuf {
        self.base_dir.join(format!("{snapshot_id}.{BLOB_EXT}"))
    }

    pub fn meta_path(&self, snapshot_id: &str) -> PathBuf {
        self.base_dir.join(format!("{snapshot_id}.{META_EXT}"))
    }

    async fn read_meta(&self, path: &Path) -> Result<StateSnapshot, WardenError> {
        let content = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&content)?)
    }

    async fn write_meta(&self, meta: &StateSnapshot) -> Result<(), WardenError> {
        let meta_path = self.meta_path(&meta.snapshot_id);
        let tmp = meta_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(meta)?).await?;
        tokio::fs::rename(&tmp, &meta_path).await?;
        Ok(())
    }
}

/// Snapshot ids are hex digests; anything else never reaches the filesystem.
fn is_snapshot_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit())
}

impl BlobStore for FileBlobStore {
    fn put<'a>(&'a self, meta: &'a StateSnapshot, payload: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if !is_snapshot_id(&meta.snapshot_id) {
                return Err(WardenError::Storage(format!(
                    "invalid snapshot id: {:?}",
                    meta.snapshot_id
                )));
            }
            let meta_path = self.meta_path(&meta.snapshot_id);
            if meta_path.exists() {
                return Ok(());
            }
            tokio::fs::write(self.blob_path(&meta.snapshot_id), payload).await?;
            self.write_meta(meta).await?;
            tracing::debug!(
                snapshot_id = %meta.snapshot_id,
                component_id = %meta.component_id,
                size = meta.size,
                "Snapshot blob written"
            );
            Ok(())
        })
    }

    fn update_meta<'a>(&'a self, meta: &'a StateSnapshot) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if !is_snapshot_id(&meta.snapshot_id) || !self.meta_path(&meta.snapshot_id).exists() {
                return Err(WardenError::SnapshotNotFound(meta.snapshot_id.clone()));
            }
            self.write_meta(meta).await
        })
    }

    fn get<'a>(
        &'a self,
        snapshot_id: &'a str,
    ) -> StoreFuture<'a, Option<(StateSnapshot, Vec<u8>)>> {
        Box::pin(async move {
            if !is_snapshot_id(snapshot_id) {
                return Ok(None);
            }
            let meta_path = self.meta_path(snapshot_id);
            if !meta_path.exists() {
                return Ok(None);
            }
            let meta = self.read_meta(&meta_path).await?;
            let payload = match tokio::fs::read(self.blob_path(snapshot_id)).await {
                Ok(p) => p,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            Ok(Some((meta, payload)))
        })
    }

    fn delete<'a>(&'a self, snapshot_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if !is_snapshot_id(snapshot_id) {
                return Ok(());
            }
            for path in [self.meta_path(snapshot_id), self.blob_path(snapshot_id)] {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        })
    }

    fn list(&self) -> StoreFuture<'_, Vec<StateSnapshot>> {
        Box::pin(async move {
            let mut metas = Vec::new();
            if !self.base_dir.exists() {
                return Ok(metas);
            }
            let suffix = format!(".{META_EXT}");
            let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let is_meta = path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().ends_with(&suffix));
                if !is_meta {
                    continue;
                }
                match self.read_meta(&path).await {
                    Ok(meta) => metas.push(meta),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Unreadable snapshot metadata, skipping");
                    }
                }
            }
            Ok(metas)
        })
    }

    fn backend_name(&self) -> &str {
        "file"
    }
}
