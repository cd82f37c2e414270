use serde::Deserialize;
use std::{fs, path::PathBuf, time::Duration};

const fn default_tick_interval_ms() -> u64 {
    60_000
}

const fn default_rpc_timeout_ms() -> u64 {
    5_000
}

const fn default_cache_ttl_secs() -> u64 {
    1_800
}

/// Engine tunables, loaded from a toml file by the binary.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Scheduler tick interval. Dispatch latency for a due message is at
    /// most one tick.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Bounded timeout on every bus RPC.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// TTL of verification cache entries.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    #[must_use]
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load engine configuration from a toml file. Missing keys fall back to
/// defaults; a missing file is an error (callers that want optional config
/// check existence first).
pub fn load_config(path: impl Into<PathBuf>) -> Result<EngineConfig, ConfigError> {
    let path = path.into();
    let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })
}
