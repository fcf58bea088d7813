pub mod types;

pub use types::*;

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug)]
pub struct StoreError(pub String);

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store error: {}", self.0)
    }
}

impl std::error::Error for StoreError {}

/// The configuration store ("DAO"). Entities are owned elsewhere; this
/// core only reads them, always through the cache layer.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn list_upstreams(&self) -> Result<Vec<Upstream>, StoreError>;

    /// Zero-or-one semantics: an unknown id is `Ok(None)`, not an error.
    async fn find_upstream(&self, id: Uuid) -> Result<Option<Upstream>, StoreError>;

    /// Raw (unnormalised, unordered) target log for one upstream.
    async fn list_targets(&self, upstream_id: Uuid) -> Result<Vec<Target>, StoreError>;
}

/// In-process store. Backs tests and embedders that manage entities
/// without an external control plane.
#[derive(Default)]
pub struct MemoryStore {
    upstreams: DashMap<Uuid, Upstream>,
    targets: DashMap<Uuid, Vec<Target>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn upsert_upstream(&self, upstream: Upstream) {
        self.upstreams.insert(upstream.id, upstream);
    }

    pub fn remove_upstream(&self, id: Uuid) {
        self.upstreams.remove(&id);
        self.targets.remove(&id);
    }

    /// Appends to the target log. Existing records are immutable; edits
    /// are modeled as new records (weight 0 for removal).
    pub fn append_target(&self, target: Target) {
        self.targets
            .entry(target.upstream_id)
            .or_default()
            .push(target);
    }

    /// Replaces the whole log. Test scaffolding for divergence scenarios.
    pub fn set_targets(&self, upstream_id: Uuid, targets: Vec<Target>) {
        self.targets.insert(upstream_id, targets);
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn list_upstreams(&self) -> Result<Vec<Upstream>, StoreError> {
        Ok(self.upstreams.iter().map(|e| e.value().clone()).collect())
    }

    async fn find_upstream(&self, id: Uuid) -> Result<Option<Upstream>, StoreError> {
        Ok(self.upstreams.get(&id).map(|e| e.value().clone()))
    }

    async fn list_targets(&self, upstream_id: Uuid) -> Result<Vec<Target>, StoreError> {
        Ok(self
            .targets
            .get(&upstream_id)
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }
}
