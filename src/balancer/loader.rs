use super::BalancerCore;
use crate::cache::{self, CacheError, CacheLoader};
use crate::error::BalancerError;
use crate::store::{ConfigStore, TargetHistory, Upstream};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

impl From<CacheError> for BalancerError {
    fn from(e: CacheError) -> Self {
        BalancerError::Load(e.to_string())
    }
}

impl BalancerCore {
    /// Map of upstream name → id, loaded through the cache under
    /// `balancer:upstreams`.
    pub async fn get_all_upstreams(&self) -> Result<HashMap<String, Uuid>, BalancerError> {
        let store = self.store.clone();
        let loader: CacheLoader = Box::new(move || {
            Box::pin(async move {
                let upstreams = store
                    .list_upstreams()
                    .await
                    .map_err(|e| CacheError(e.to_string()))?;
                let map: HashMap<String, Uuid> =
                    upstreams.into_iter().map(|u| (u.name, u.id)).collect();
                serde_json::to_value(map).map_err(|e| CacheError(e.to_string()))
            })
        });

        let value = self
            .cache
            .get(&cache::upstreams_key(), self.config.cache.ttl(), loader)
            .await?;
        serde_json::from_value(value).map_err(|e| BalancerError::Load(e.to_string()))
    }

    /// One upstream record by id, cached under `balancer:upstreams:<id>`.
    /// An unknown id is cached too (`Ok(None)`), not an error.
    pub async fn get_upstream_by_id(&self, id: Uuid) -> Result<Option<Upstream>, BalancerError> {
        let store = self.store.clone();
        let loader: CacheLoader = Box::new(move || {
            Box::pin(async move {
                let found = store
                    .find_upstream(id)
                    .await
                    .map_err(|e| CacheError(e.to_string()))?;
                serde_json::to_value(found).map_err(|e| CacheError(e.to_string()))
            })
        });

        let value = self
            .cache
            .get(&cache::upstream_key(id), self.config.cache.ttl(), loader)
            .await?;
        serde_json::from_value(value).map_err(|e| BalancerError::Load(e.to_string()))
    }

    /// Resolves a name through the cached name→id map. `Ok(None)` is the
    /// distinguished "no such upstream" result that sends callers down
    /// the plain-DNS path; errors stay errors.
    pub async fn get_upstream_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Upstream>, BalancerError> {
        let upstreams = self.get_all_upstreams().await?;
        match upstreams.get(name) {
            Some(id) => self.get_upstream_by_id(*id).await,
            None => Ok(None),
        }
    }

    /// The upstream's normalised target history, cached under
    /// `balancer:targets:<id>`: each record split into host and port,
    /// stamped with its `order` key, sorted ascending. Records whose raw
    /// target cannot be parsed are skipped (identically on every worker).
    pub async fn fetch_target_history(
        &self,
        upstream: &Upstream,
    ) -> Result<TargetHistory, BalancerError> {
        let store = self.store.clone();
        let id = upstream.id;
        let loader: CacheLoader = Box::new(move || {
            Box::pin(async move { load_history(store, id).await })
        });

        let value = self
            .cache
            .get(&cache::targets_key(id), self.config.cache.ttl(), loader)
            .await?;
        serde_json::from_value(value).map_err(|e| BalancerError::Load(e.to_string()))
    }
}

async fn load_history(
    store: Arc<dyn ConfigStore>,
    upstream_id: Uuid,
) -> Result<serde_json::Value, CacheError> {
    let targets = store
        .list_targets(upstream_id)
        .await
        .map_err(|e| CacheError(e.to_string()))?;

    let mut history: TargetHistory = targets
        .iter()
        .filter_map(|t| match t.normalize() {
            Ok(normalized) => Some(normalized),
            Err(e) => {
                warn!(
                    "balancer: skipping malformed target, upstream={}, target={}, error={}",
                    upstream_id, t.target, e
                );
                None
            }
        })
        .collect();
    history.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

    serde_json::to_value(history).map_err(|e| CacheError(e.to_string()))
}
