use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Cache key for the name → id map of all upstreams. Invalidated on any
/// upstream create/update/delete.
pub fn upstreams_key() -> String {
    "balancer:upstreams".to_string()
}

/// Cache key for one upstream record. Invalidated per-id on update/delete.
pub fn upstream_key(id: Uuid) -> String {
    format!("balancer:upstreams:{}", id)
}

/// Cache key for one upstream's target history. Invalidated per-id on any
/// target change and on upstream update/delete.
pub fn targets_key(id: Uuid) -> String {
    format!("balancer:targets:{}", id)
}

#[derive(Debug)]
pub struct CacheError(pub String);

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache error: {}", self.0)
    }
}

impl std::error::Error for CacheError {}

/// Loader invoked on a cache miss. Values cross the cache boundary
/// serialized, as they do between the original's cache levels.
pub type CacheLoader =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<serde_json::Value, CacheError>> + Send>;

/// The shared cache layer. Cross-worker invalidation is handled upstream
/// of this core; only the local entry is dropped here.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(
        &self,
        key: &str,
        ttl: Option<Duration>,
        loader: CacheLoader,
    ) -> Result<serde_json::Value, CacheError>;

    fn invalidate_local(&self, key: &str);
}

struct Entry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

/// In-process cache with per-key single-flight loading: concurrent misses
/// on one key run the loader once.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    inflight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl MemoryCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lookup(&self, key: &str) -> Option<serde_json::Value> {
        let entry = self.entries.get(key)?;
        if let Some(deadline) = entry.expires_at {
            if Instant::now() >= deadline {
                drop(entry);
                self.entries.remove(key);
                return None;
            }
        }
        Some(entry.value.clone())
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn get(
        &self,
        key: &str,
        ttl: Option<Duration>,
        loader: CacheLoader,
    ) -> Result<serde_json::Value, CacheError> {
        if let Some(value) = self.lookup(key) {
            return Ok(value);
        }

        let gate = self
            .inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // Another waiter may have loaded while we queued on the gate.
        if let Some(value) = self.lookup(key) {
            return Ok(value);
        }

        let value = loader().await?;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        self.inflight.remove(key);
        Ok(value)
    }

    fn invalidate_local(&self, key: &str) {
        self.entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_loader(counter: Arc<AtomicU32>) -> CacheLoader {
        Box::new(move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!("loaded"))
            })
        })
    }

    #[tokio::test]
    async fn test_get_loads_once() {
        let cache = MemoryCache::new();
        let loads = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let v = cache
                .get("k", None, counting_loader(loads.clone()))
                .await
                .unwrap();
            assert_eq!(v, serde_json::json!("loaded"));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_local_forces_reload() {
        let cache = MemoryCache::new();
        let loads = Arc::new(AtomicU32::new(0));

        cache
            .get("k", None, counting_loader(loads.clone()))
            .await
            .unwrap();
        cache.invalidate_local("k");
        cache
            .get("k", None, counting_loader(loads.clone()))
            .await
            .unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_loader_error_is_not_cached() {
        let cache = MemoryCache::new();

        let err = cache
            .get(
                "k",
                None,
                Box::new(|| Box::pin(async { Err(CacheError("dao down".into())) })),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dao down"));

        let loads = Arc::new(AtomicU32::new(0));
        cache
            .get("k", None, counting_loader(loads.clone()))
            .await
            .unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = MemoryCache::new();
        let loads = Arc::new(AtomicU32::new(0));

        cache
            .get(
                "k",
                Some(Duration::from_millis(10)),
                counting_loader(loads.clone()),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache
            .get("k", None, counting_loader(loads.clone()))
            .await
            .unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_key_builders() {
        let id = Uuid::from_u128(7);
        assert_eq!(upstreams_key(), "balancer:upstreams");
        assert_eq!(upstream_key(id), format!("balancer:upstreams:{}", id));
        assert_eq!(targets_key(id), format!("balancer:targets:{}", id));
    }
}
