use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::component::{ComponentDescriptor, Criticality};
use crate::error::WardenError;
use crate::state::{LifecycleState, StateKind};

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, WardenError>> + Send + 'a>>;

/// Page size used by [`Listing`] when none is given.
pub const DEFAULT_PAGE_SIZE: usize = 64;

/// A registry row: descriptor plus authoritative lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub descriptor: ComponentDescriptor,
    pub state: LifecycleState,
    /// Reference to the latest verified snapshot. Never the bytes.
    pub snapshot_id: Option<String>,
    pub last_error: Option<String>,
    /// Bumped on every successful CAS.
    pub version: u64,
}

impl ComponentRecord {
    pub fn new(descriptor: ComponentDescriptor, state: LifecycleState) -> Self {
        Self {
            descriptor,
            state,
            snapshot_id: None,
            last_error: None,
            version: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// SHA-256 hex over the canonical JSON encoding of the record.
    pub fn checksum(&self) -> Result<String, WardenError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    pub(crate) fn apply(&mut self, update: StateUpdate) {
        if self.state != update.state {
            self.descriptor.last_transition_at = Utc::now();
        }
        self.state = update.state;
        if let Some(snapshot_id) = update.snapshot_id {
            self.snapshot_id = Some(snapshot_id);
        }
        self.last_error = update.error;
        self.version += 1;
    }
}

/// The write half of a compare-and-swap on a record's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub state: LifecycleState,
    /// Replaces the snapshot reference when set.
    pub snapshot_id: Option<String>,
    /// Replaces `last_error`; `None` clears it.
    pub error: Option<String>,
}

impl StateUpdate {
    pub fn to(state: impl Into<LifecycleState>) -> Self {
        Self {
            state: state.into(),
            snapshot_id: None,
            error: None,
        }
    }

    pub fn with_snapshot(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentFilter {
    pub state: Option<StateKind>,
    pub criticality: Option<Criticality>,
    pub capability: Option<String>,
}

impl ComponentFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_state(state: StateKind) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &ComponentRecord) -> bool {
        self.state.is_none_or(|s| record.state.kind() == s)
            && self
                .criticality
                .is_none_or(|c| record.descriptor.criticality == c)
            && self
                .capability
                .as_ref()
                .is_none_or(|cap| record.descriptor.capabilities.contains(cap))
    }
}

/// One page of a listing, ordered by component id.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub records: Vec<ComponentRecord>,
    /// Cursor to pass back for the next page; `None` when exhausted.
    pub next: Option<String>,
}

/// Durable store of component records.
///
/// Every state write is a compare-and-swap on `(id, expected_prev)`, so two
/// concurrent transition attempts can never both commit.
pub trait RegistryStore: Send + Sync {
    /// Insert a new record. Fails with `AlreadyExists` on a duplicate id.
    fn register(&self, record: ComponentRecord) -> StoreFuture<'_, ()>;

    /// Fetch a record. `Ok(None)` when absent; `Corrupt` if it fails its checksum.
    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<ComponentRecord>>;

    /// Records with id strictly greater than `after` that match `filter`.
    fn list_page<'a>(
        &'a self,
        filter: &'a ComponentFilter,
        after: Option<&'a str>,
        limit: usize,
    ) -> StoreFuture<'a, ListPage>;

    /// Commit `update` only if the current state equals `expected_prev`.
    fn update_state<'a>(
        &'a self,
        id: &'a str,
        update: StateUpdate,
        expected_prev: LifecycleState,
    ) -> StoreFuture<'a, ComponentRecord>;

    /// Backend name for logging.
    fn backend_name(&self) -> &str;
}

/// Lazy, finite, restartable walk over a registry.
///
/// Pages are fetched on demand; `restart` rewinds to the first page.
pub struct Listing<'a> {
    store: &'a dyn RegistryStore,
    filter: ComponentFilter,
    page_size: usize,
    cursor: Option<String>,
    exhausted: bool,
}

impl<'a> Listing<'a> {
    pub fn new(store: &'a dyn RegistryStore, filter: ComponentFilter) -> Self {
        Self {
            store,
            filter,
            page_size: DEFAULT_PAGE_SIZE,
            cursor: None,
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// The next page, or `None` once the listing is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<ComponentRecord>>, WardenError> {
        if self.exhausted {
            return Ok(None);
        }
        let page = self
            .store
            .list_page(&self.filter, self.cursor.as_deref(), self.page_size)
            .await?;
        self.exhausted = page.next.is_none();
        self.cursor = page.next;
        if page.records.is_empty() && self.exhausted {
            return Ok(None);
        }
        Ok(Some(page.records))
    }

    pub fn restart(&mut self) {
        self.cursor = None;
        self.exhausted = false;
    }

    pub async fn collect_all(mut self) -> Result<Vec<ComponentRecord>, WardenError> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}

/// Convenience: every record matching `filter`.
pub async fn list(
    store: &dyn RegistryStore,
    filter: ComponentFilter,
) -> Result<Vec<ComponentRecord>, WardenError> {
    Listing::new(store, filter).collect_all().await
}

/// Page over an already-ordered sequence of records.
pub(crate) fn paginate<'r>(
    records: impl Iterator<Item = &'r ComponentRecord>,
    filter: &ComponentFilter,
    after: Option<&str>,
    limit: usize,
) -> ListPage {
    let limit = limit.max(1);
    let mut matching = records
        .filter(|r| after.is_none_or(|a| r.id() > a))
        .filter(|r| filter.matches(r));

    let records: Vec<ComponentRecord> = matching.by_ref().take(limit).cloned().collect();
    let next = if records.len() == limit && matching.next().is_some() {
        records.last().map(|r| r.id().to_string())
    } else {
        None
    };
    ListPage { records, next }
}

/// In-process registry. Suitable for tests and single-run deployments.
pub struct InMemoryRegistry {
    records: RwLock<BTreeMap<String, ComponentRecord>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryStore for InMemoryRegistry {
    fn register(&self, record: ComponentRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            record.descriptor.validate()?;
            let mut records = self.records.write().await;
            if records.contains_key(record.id()) {
                return Err(WardenError::AlreadyExists(record.id().to_string()));
            }
            tracing::debug!(component_id = record.id(), "Record registered");
            records.insert(record.id().to_string(), record);
            Ok(())
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<ComponentRecord>> {
        Box::pin(async move { Ok(self.records.read().await.get(id).cloned()) })
    }

    fn list_page<'a>(
        &'a self,
        filter: &'a ComponentFilter,
        after: Option<&'a str>,
        limit: usize,
    ) -> StoreFuture<'a, ListPage> {
        Box::pin(async move {
            let records = self.records.read().await;
            Ok(paginate(records.values(), filter, after, limit))
        })
    }

    fn update_state<'a>(
        &'a self,
        id: &'a str,
        update: StateUpdate,
        expected_prev: LifecycleState,
    ) -> StoreFuture<'a, ComponentRecord> {
        Box::pin(async move {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(id)
                .ok_or_else(|| WardenError::NotFound(id.to_string()))?;
            if record.state != expected_prev {
                return Err(WardenError::ConflictCas {
                    id: id.to_string(),
                    expected: expected_prev,
                    actual: record.state,
                });
            }
            record.apply(update);
            Ok(record.clone())
        })
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}
