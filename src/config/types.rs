use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Infrastructure configuration of the balancing core. Business entities
/// (upstreams, targets) never come from here — they are owned by the
/// configuration store and arrive through events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub execute: ExecuteConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteConfig {
    /// Port assumed for literal-IP targets that carry none.
    #[serde(default = "default_port")]
    pub default_port: u16,
}

impl Default for ExecuteConfig {
    fn default() -> Self {
        Self {
            default_port: default_port(),
        }
    }
}

fn default_port() -> u16 {
    80
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL applied to cached entities. `None` caches until invalidated,
    /// which is the correct mode when every change arrives as an event.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl CacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.execute.default_port, 80);
        assert!(cfg.cache.ttl_secs.is_none());
        assert!(cfg.cache.ttl().is_none());
    }

    #[test]
    fn test_partial_json() {
        let cfg: CoreConfig = serde_json::from_str(r#"{"execute": {"default_port": 8080}}"#).unwrap();
        assert_eq!(cfg.execute.default_port, 8080);
        assert!(cfg.cache.ttl_secs.is_none());
    }

    #[test]
    fn test_cache_ttl() {
        let cfg: CoreConfig = serde_json::from_str(r#"{"cache": {"ttl_secs": 30}}"#).unwrap();
        assert_eq!(cfg.cache.ttl(), Some(Duration::from_secs(30)));
    }
}
