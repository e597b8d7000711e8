use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::component::validate_id;
use crate::error::WardenError;
use crate::registry::{
    ComponentFilter, ComponentRecord, ListPage, RegistryStore, StateUpdate, StoreFuture,
};
use crate::state::LifecycleState;

const RECORD_EXT: &str = "record.json";

/// On-disk form of a record: the record plus the checksum it was written with.
#[derive(Debug, Serialize, Deserialize)]
struct RecordEnvelope {
    record: ComponentRecord,
    checksum: String,
}

/// Disk-backed registry.
///
/// Layout under `base_dir`:
/// ```text
/// {base_dir}/
///   {component_id}.record.json   - record + SHA-256 checksum
/// ```
///
/// Writes land in a temp file and are renamed into place, so readers never
/// observe a half-written record. Writers of the same record serialize on a
/// process-local per-id mutex; writers of different records never wait on
/// each other. This store assumes a single process owns the directory.
pub struct FileRegistry {
    base_dir: PathBuf,
    /// component_id → write lock for that record
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileRegistry {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".warden")
            .join("registry")
    }

    pub async fn init(&self) -> Result<(), WardenError> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn record_path(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{id}.{RECORD_EXT}"))
    }

    async fn lock_record(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.lock().await.entry(id.to_string()).or_default());
        lock.lock_owned().await
    }

    async fn read_record(&self, id: &str) -> Result<Option<ComponentRecord>, WardenError> {
        validate_id(id).map_err(|_| WardenError::NotFound(id.to_string()))?;
        let path = self.record_path(id);
        let content = match tokio::fs::read(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let envelope: RecordEnvelope = serde_json::from_slice(&content)
            .map_err(|e| WardenError::Corrupt(format!("{id}: unreadable record: {e}")))?;
        let actual = envelope.record.checksum()?;
        if actual != envelope.checksum || envelope.record.id() != id {
            tracing::error!(
                component_id = id,
                path = %path.display(),
                alert = true,
                "Registry record failed checksum"
            );
            return Err(WardenError::Corrupt(id.to_string()));
        }
        Ok(Some(envelope.record))
    }

    async fn write_record(&self, record: &ComponentRecord) -> Result<(), WardenError> {
        let envelope = RecordEnvelope {
            checksum: record.checksum()?,
            record: record.clone(),
        };
        let json = serde_json::to_vec_pretty(&envelope)?;
        let path = self.record_path(record.id());
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>, WardenError> {
        let mut ids = Vec::new();
        if !self.base_dir.exists() {
            return Ok(ids);
        }
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
        let suffix = format!(".{RECORD_EXT}");
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(id) = name.to_string_lossy().strip_suffix(&suffix) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl RegistryStore for FileRegistry {
    fn register(&self, record: ComponentRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            record.descriptor.validate()?;
            let _guard = self.lock_record(record.id()).await;
            if self.record_path(record.id()).exists() {
                return Err(WardenError::AlreadyExists(record.id().to_string()));
            }
            self.write_record(&record).await?;
            tracing::debug!(component_id = record.id(), "Record persisted");
            Ok(())
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<ComponentRecord>> {
        Box::pin(async move { self.read_record(id).await })
    }

    fn list_page<'a>(
        &'a self,
        filter: &'a ComponentFilter,
        after: Option<&'a str>,
        limit: usize,
    ) -> StoreFuture<'a, ListPage> {
        Box::pin(async move {
            let limit = limit.max(1);
            let ids = self.list_ids().await?;
            let mut page = ListPage::default();

            for id in ids.iter().filter(|id| after.is_none_or(|a| id.as_str() > a)) {
                let record = match self.read_record(id).await {
                    Ok(Some(r)) => r,
                    Ok(None) => continue,
                    // Surfaced by `get`; a listing keeps going past it.
                    Err(WardenError::Corrupt(_)) => continue,
                    Err(e) => return Err(e),
                };
                if !filter.matches(&record) {
                    continue;
                }
                if page.records.len() == limit {
                    page.next = page.records.last().map(|r| r.id().to_string());
                    break;
                }
                page.records.push(record);
            }
            Ok(page)
        })
    }

    fn update_state<'a>(
        &'a self,
        id: &'a str,
        update: StateUpdate,
        expected_prev: LifecycleState,
    ) -> StoreFuture<'a, ComponentRecord> {
        Box::pin(async move {
            validate_id(id).map_err(|_| WardenError::NotFound(id.to_string()))?;
            let _guard = self.lock_record(id).await;
            let mut record = self
                .read_record(id)
                .await?
                .ok_or_else(|| WardenError::NotFound(id.to_string()))?;
            if record.state != expected_prev {
                return Err(WardenError::ConflictCas {
                    id: id.to_string(),
                    expected: expected_prev,
                    actual: record.state,
                });
            }
            record.apply(update);
            self.write_record(&record).await?;
            Ok(record)
        })
    }

    fn backend_name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentDescriptor, Criticality};
    use crate::registry::list;
    use crate::state::{RestState, StateKind};
    use tempfile::TempDir;

    async fn registry() -> (TempDir, FileRegistry) {
        let tmp = TempDir::new().unwrap();
        let registry = FileRegistry::new(tmp.path().to_path_buf());
        registry.init().await.unwrap();
        (tmp, registry)
    }

    fn record(id: &str) -> ComponentRecord {
        ComponentRecord::new(
            ComponentDescriptor::new(id, Criticality::Medium, 25),
            LifecycleState::Dormant,
        )
    }

    #[tokio::test]
    async fn register_and_get_round_trip() {
        let (_tmp, registry) = registry().await;
        registry.register(record("sigma-matcher")).await.unwrap();

        let loaded = registry.get("sigma-matcher").await.unwrap().unwrap();
        assert_eq!(loaded.descriptor.resource_cost, 25);
        assert!(registry.record_path("sigma-matcher").exists());
    }

    #[tokio::test]
    async fn duplicate_register_fails() {
        let (_tmp, registry) = registry().await;
        registry.register(record("a")).await.unwrap();
        assert!(matches!(
            registry.register(record("a")).await,
            Err(WardenError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn cas_survives_reopen() {
        let (tmp, registry) = registry().await;
        registry.register(record("a")).await.unwrap();
        registry
            .update_state("a", StateUpdate::to(RestState::Active), LifecycleState::Dormant)
            .await
            .unwrap();

        let reopened = FileRegistry::new(tmp.path().to_path_buf());
        let r = reopened.get("a").await.unwrap().unwrap();
        assert_eq!(r.state, LifecycleState::Active);
        assert_eq!(r.version, 1);

        let err = reopened
            .update_state("a", StateUpdate::to(RestState::Disabled), LifecycleState::Dormant)
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::ConflictCas { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cas_on_one_record_has_one_winner() {
        let (_tmp, registry) = registry().await;
        let registry = Arc::new(registry);
        registry.register(record("a")).await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            tasks.spawn(async move {
                registry
                    .update_state("a", StateUpdate::to(RestState::Active), LifecycleState::Dormant)
                    .await
            });
        }
        let mut won = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined.unwrap() {
                Ok(_) => won += 1,
                Err(e) => assert!(matches!(e, WardenError::ConflictCas { .. }), "got {e:?}"),
            }
        }
        assert_eq!(won, 1);
        assert_eq!(registry.get("a").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn writers_of_other_records_do_not_wait() {
        let (_tmp, registry) = registry().await;
        registry.register(record("a")).await.unwrap();
        registry.register(record("b")).await.unwrap();

        let _held = registry.lock_record("a").await;
        let updated = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            registry.update_state("b", StateUpdate::to(RestState::Active), LifecycleState::Dormant),
        )
        .await
        .expect("update of b waited on a's lock")
        .unwrap();
        assert_eq!(updated.state, LifecycleState::Active);
    }

    #[tokio::test]
    async fn tampered_record_is_corrupt() {
        let (_tmp, registry) = registry().await;
        registry.register(record("a")).await.unwrap();

        let path = registry.record_path("a");
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("\"resource_cost\": 25", "\"resource_cost\": 1"))
            .unwrap();

        assert_eq!(
            registry.get("a").await.unwrap_err(),
            WardenError::Corrupt("a".into())
        );
    }

    #[tokio::test]
    async fn listing_skips_corrupt_records() {
        let (_tmp, registry) = registry().await;
        registry.register(record("a")).await.unwrap();
        registry.register(record("b")).await.unwrap();
        std::fs::write(registry.record_path("a"), b"not json").unwrap();

        let all = list(&registry, ComponentFilter::all()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id(), "b");
    }

    #[tokio::test]
    async fn list_pages_in_id_order() {
        let (_tmp, registry) = registry().await;
        for id in ["c", "a", "b"] {
            registry.register(record(id)).await.unwrap();
        }
        registry
            .update_state("b", StateUpdate::to(RestState::Active), LifecycleState::Dormant)
            .await
            .unwrap();

        let page = registry
            .list_page(&ComponentFilter::all(), None, 2)
            .await
            .unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.next.as_deref(), Some("b"));

        let rest = registry
            .list_page(&ComponentFilter::all(), page.next.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(rest.records[0].id(), "c");
        assert!(rest.next.is_none());

        let dormant = list(&registry, ComponentFilter::in_state(StateKind::Dormant))
            .await
            .unwrap();
        assert_eq!(dormant.len(), 2);
    }

    #[tokio::test]
    async fn path_like_ids_are_never_read() {
        let (_tmp, registry) = registry().await;
        assert!(matches!(
            registry.get("../secrets").await,
            Err(WardenError::NotFound(_))
        ));
    }
}
