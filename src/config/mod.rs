pub mod types;


pub use types::*;

use anyhow::Result;
use std::path::Path;

impl CoreConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — the core runs with zero configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: CoreConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            CoreConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("COMPASS_DEFAULT_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.execute.default_port = n;
            }
        }
        if let Ok(v) = std::env::var("COMPASS_CACHE_TTL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.cache.ttl_secs = Some(n);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.execute.default_port == 0 {
            anyhow::bail!("execute.default_port cannot be 0");
        }
        Ok(())
    }
}
